// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use super::{Metadata, SigInfo, StackTrace};
use crate::shared::constants::*;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcInfo {
    pub pid: libc::pid_t,
    pub tid: i64,
    pub timestamp_secs: i64,
    pub timestamp_nanos: i64,
}

impl ProcInfo {
    /// Wall-clock time at which the signal handler started.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.timestamp_secs, u32::try_from(self.timestamp_nanos).ok()?)
    }
}

/// A crash report as reassembled by the receiver from the multipart body.
///
/// Every section is optional: a crashing process can die half way through sending, in which
/// case whatever arrived is kept and `incomplete` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashReport {
    pub uuid: Uuid,
    pub received_at: DateTime<Utc>,
    pub incomplete: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log_messages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig_info: Option<SigInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proc_info: Option<ProcInfo>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: BTreeMap<String, i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<StackTrace>,
}

impl Default for CrashReport {
    fn default() -> Self {
        Self::new()
    }
}

impl CrashReport {
    pub fn new() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            received_at: Utc::now(),
            incomplete: false,
            log_messages: vec![],
            metadata: None,
            sig_info: None,
            proc_info: None,
            counters: BTreeMap::new(),
            stacktrace: None,
        }
    }

    /// Decodes one multipart field into the matching section. A field that doesn't decode
    /// is recorded in `log_messages` and marks the report incomplete; it never fails the
    /// whole report.
    pub fn add_part(&mut self, name: &str, content: &[u8]) {
        let res = match name {
            DD_CRASHTRACK_PART_METADATA => {
                serde_json::from_slice(content).map(|v| self.metadata = Some(v))
            }
            DD_CRASHTRACK_PART_SIGINFO => {
                serde_json::from_slice(content).map(|v| self.sig_info = Some(v))
            }
            DD_CRASHTRACK_PART_PROCINFO => {
                serde_json::from_slice(content).map(|v| self.proc_info = Some(v))
            }
            DD_CRASHTRACK_PART_COUNTERS => {
                serde_json::from_slice(content).map(|v| self.counters = v)
            }
            DD_CRASHTRACK_PART_STACKTRACE => {
                serde_json::from_slice(content).map(|v| self.stacktrace = Some(v))
            }
            other => {
                self.log_messages.push(format!("Unexpected part {other:?}"));
                return;
            }
        };
        if let Err(e) = res {
            self.incomplete = true;
            self.log_messages
                .push(format!("Unable to decode part {name:?}: {e}"));
        }
    }

    pub fn mark_incomplete(&mut self, reason: impl Into<String>) {
        self.incomplete = true;
        self.log_messages.push(reason.into());
    }

    /// Every section the crash handler always sends is present.
    pub fn has_all_sections(&self) -> bool {
        self.metadata.is_some()
            && self.sig_info.is_some()
            && self.proc_info.is_some()
            && self.stacktrace.is_some()
    }

    /// Emit the report as structured json in file `path`.
    ///
    /// Existing files are never appended to: if `path` is taken, `path.1`, `path.2`, ... are
    /// tried in turn, so each file holds exactly one report. Returns the path written.
    pub fn to_file(&self, path: &Path) -> anyhow::Result<PathBuf> {
        let mut candidate = path.to_path_buf();
        let mut suffix = 0u32;
        let file = loop {
            match File::options().write(true).create_new(true).open(&candidate) {
                Ok(file) => break file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    suffix += 1;
                    let mut name = path.as_os_str().to_owned();
                    name.push(format!(".{suffix}"));
                    candidate = name.into();
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to create {}", candidate.display()))
                }
            }
        };
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)
            .with_context(|| format!("Failed to write json to {}", candidate.display()))?;
        writer.flush()?;
        Ok(candidate)
    }
}
