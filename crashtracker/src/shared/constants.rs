// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Constants shared by the collector (signal handler side) and the receiver.
//!
//! The names of the multipart form fields are the contract between the two
//! sides: the collector emits them in the order listed here, the receiver
//! looks them up by name.

use std::time::Duration;

/// Form field holding service/version/runtime identifiers, serialized at `start()`.
pub const DD_CRASHTRACK_PART_METADATA: &str = "metadata";
/// Form field holding signal number, code, and faulting address.
pub const DD_CRASHTRACK_PART_SIGINFO: &str = "siginfo";
/// Form field holding pid, tid and the crash timestamp.
pub const DD_CRASHTRACK_PART_PROCINFO: &str = "procinfo";
/// Form field holding the operation counters at crash time.
pub const DD_CRASHTRACK_PART_COUNTERS: &str = "counters";
/// Form field holding the (bounded) stack walk.
pub const DD_CRASHTRACK_PART_STACKTRACE: &str = "stacktrace";

/// Every boundary starts with this, followed by random alphanumerics picked at startup.
pub const DD_CRASHTRACK_BOUNDARY_PREFIX: &str = "------CrashtrackerBoundary";
pub const DD_CRASHTRACK_BOUNDARY_RANDOM_LEN: usize = 24;

/// Upper bound on frames walked inside the signal handler.
pub const DD_CRASHTRACK_MAX_FRAMES: usize = 128;

/// Size of the stack buffer backing each HTTP chunk.
pub const DD_CRASHTRACK_CHUNK_SIZE: usize = 4096;

/// Default time budget for sending a report, and for the receiver to drain one.
/// Can be overridden by `set_timeout` on the collector side and by the
/// `DD_CRASHTRACKER_RECEIVER_TIMEOUT_MS` environment variable on the receiver side.
pub const DD_CRASHTRACK_DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Extra time granted to the watchdog on top of the send timeout before it
/// kills the process.
pub const DD_CRASHTRACK_WATCHDOG_GRACE: Duration = Duration::from_secs(1);

/// Time allowed to reap a receiver after it has been asked to terminate.
pub const DD_CRASHTRACK_MINIMUM_REAP_TIME: Duration = Duration::from_millis(160);

pub const DD_CRASHTRACK_MAX_FIELD_LEN: usize = 1024;
pub const DD_CRASHTRACK_MAX_PATH_LEN: usize = 4096;

pub const DD_CRASHTRACKER_RECEIVER_TIMEOUT_MS: &str = "DD_CRASHTRACKER_RECEIVER_TIMEOUT_MS";
pub const DD_CRASHTRACKER_UPSTREAM_URL: &str = "DD_CRASHTRACKER_UPSTREAM_URL";
pub const DD_CRASHTRACKER_PARENT_PID: &str = "DD_CRASHTRACKER_PARENT_PID";
pub const DD_LOG_LEVEL: &str = "DD_LOG_LEVEL";

/// Set by the receiver on relayed requests whose body was cut short.
pub const DD_CRASHTRACK_INCOMPLETE_HEADER: &str = "x-crashtracker-incomplete";
