// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackTrace {
    pub frames: Vec<StackFrame>,
    /// The walk hit the frame cap before reaching the bottom of the stack.
    #[serde(default)]
    pub truncated: bool,
}

/// A frame as emitted by the crash handler. Addresses are hex strings; `function` and
/// `module` are only present when the frame was resolved against the preloaded symbol tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
}

impl StackTrace {
    /// Names of every resolved function, innermost first.
    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.frames.iter().filter_map(|f| f.function.as_deref())
    }
}
