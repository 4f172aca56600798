// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! This crate implements a crashtracker based on catching UNIX signals and
//! posting the result over HTTP.
//!
//! Architecturally, it consists of two parts:
//! 1. A signal handler, which catches a UNIX signal (SIGSEGV, SIGBUS)
//!    associated with a crash, and collects information about the state of
//!    the program at crash time.  The signal handler runs under a constrained
//!    environment where many standard operations are illegal.
//!    https://man7.org/linux/man-pages/man7/signal-safety.7.html
//!    In particular, memory allocation, and synchronization such as mutexes are
//!    potentially UB.  Everything the handler needs (the destination address,
//!    the request head, the serialized metadata, symbol tables) is therefore
//!    prepared by `start()`, and the handler itself only fills a fixed-size
//!    record on the stack and writes it to a socket as a chunked
//!    `multipart/form-data` request.
//!    A watchdog alarm bounds the time spent doing so.  Once the report is sent
//!    (or given up on), the previous handler is chained to, or the signal is
//!    re-raised with its default action, so that the process still dies the way
//!    it would have without the crashtracker.
//! 2. An optional receiver process, spawned at `start()`, which listens on a
//!    unix socket inherited as its `stdin`.  It decodes each report, tolerating
//!    reports that were cut short, and relays it to the configured destination:
//!    a json file, or an HTTP endpoint.  It exits when asked to, or when the
//!    process it watches is gone.
//!
//! Data collected by the crash handler:
//! 1. The signal number and code, the faulting address, and the sending pid for
//!    signals sent by another process.
//! 2. The pid, tid and wall-clock time of the crash.
//! 3. The stacktrace of the crashing thread.  Depending on a flag, this is
//!    either raw addresses, or addresses along with names looked up in symbol
//!    tables loaded at startup.
//! 4. The operation counters, describing what the library was busy with.
//!
//! Handling of forks:
//! Signal handlers, the alternate stack and the receiver's address are all
//! inherited by a forked child, so a child reports its own crashes without
//! further setup.  `on_fork()` resets the operation counters.

#[cfg(all(unix, feature = "collector"))]
mod collector;
pub mod crash_info;
#[cfg(all(unix, feature = "receiver"))]
mod receiver;
pub mod shared;

#[cfg(all(unix, feature = "collector"))]
pub use collector::*;
#[cfg(all(unix, feature = "receiver"))]
pub use receiver::*;
pub use shared::configuration::{ConfigurationError, CrashtrackerConfiguration, ResolveFrames};
pub use shared::endpoint::Endpoint;
