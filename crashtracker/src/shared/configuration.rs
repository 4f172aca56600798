// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use super::constants::*;
use super::endpoint::Endpoint;
use crate::crash_info::Metadata;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How much work the crash handler does to describe each stack frame.
/// Symbol lookup happens against tables loaded at startup, so even `Full` does not
/// allocate or open files inside the signal handler.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveFrames {
    /// Raw instruction/stack addresses only.
    #[default]
    Fast,
    /// Best-effort function and module names from preloaded symbol tables.
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
    #[error("{field} is {len} bytes long, the maximum is {max}")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
    #[error("{field} contains an interior NUL byte")]
    InteriorNul { field: &'static str },
    #[error("{field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },
    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("unsupported url scheme {0:?}, expected one of http, unix, file")]
    UnsupportedScheme(String),
    #[error("stdout and stderr can't both be redirected to {0:?}, they will conflict with each other")]
    SameOutputFile(String),
    #[error("file:// urls are written by the receiver, a receiver binary must be configured")]
    FileUrlWithoutReceiver,
    #[error("{0} is written by the receiver, a receiver binary must be configured")]
    OutputFileWithoutReceiver(&'static str),
    #[error("the crashtracker has already been started, its configuration is frozen")]
    AlreadyStarted,
}

/// Validates a byte-string setter argument and turns it into an owned `String`.
///
/// A single trailing NUL is accepted (and dropped) so that C strings can be passed through
/// with their terminator; any other NUL is rejected.
pub fn validate_field(
    field: &'static str,
    value: &[u8],
    max: usize,
) -> Result<String, ConfigurationError> {
    let value = value.strip_suffix(&[0]).unwrap_or(value);
    if value.is_empty() {
        return Err(ConfigurationError::Empty { field });
    }
    if value.len() > max {
        return Err(ConfigurationError::TooLong {
            field,
            len: value.len(),
            max,
        });
    }
    if value.contains(&0) {
        return Err(ConfigurationError::InteriorNul { field });
    }
    std::str::from_utf8(value)
        .map(str::to_owned)
        .map_err(|_| ConfigurationError::InvalidUtf8 { field })
}

/// The frozen configuration used by the crash handler and the receiver bootstrap.
/// Built once by `start()`; never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashtrackerConfiguration {
    pub endpoint: Endpoint,
    pub metadata: Metadata,
    /// When set, `start()` spawns this binary as the receiver process and the crash handler
    /// reports to it rather than to `endpoint` directly.
    pub receiver_binary: Option<String>,
    pub stdout_filename: Option<String>,
    pub stderr_filename: Option<String>,
    pub use_alt_stack: bool,
    pub resolve_frames: ResolveFrames,
    pub timeout: Duration,
}

impl CrashtrackerConfiguration {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        endpoint: Endpoint,
        metadata: Metadata,
        receiver_binary: Option<String>,
        stdout_filename: Option<String>,
        stderr_filename: Option<String>,
        use_alt_stack: bool,
        resolve_frames: ResolveFrames,
        timeout: Option<Duration>,
    ) -> Result<Self, ConfigurationError> {
        if let (Some(stdout), Some(stderr)) = (&stdout_filename, &stderr_filename) {
            if stdout == stderr {
                return Err(ConfigurationError::SameOutputFile(stdout.clone()));
            }
        }
        if endpoint.is_file() && receiver_binary.is_none() {
            return Err(ConfigurationError::FileUrlWithoutReceiver);
        }
        if receiver_binary.is_none() {
            if stdout_filename.is_some() {
                return Err(ConfigurationError::OutputFileWithoutReceiver("stdout_filename"));
            }
            if stderr_filename.is_some() {
                return Err(ConfigurationError::OutputFileWithoutReceiver("stderr_filename"));
            }
        }
        let timeout = match timeout {
            Some(t) if !t.is_zero() => t,
            _ => DD_CRASHTRACK_DEFAULT_TIMEOUT,
        };
        Ok(Self {
            endpoint,
            metadata,
            receiver_binary,
            stdout_filename,
            stderr_filename,
            use_alt_stack,
            resolve_frames,
            timeout,
        })
    }
}
