// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg(unix)]

mod entry_points;
pub use entry_points::{
    async_receiver_entry_point_unix_listener, receiver_entry_point_stdin, ReceiverConfig,
};
mod receive_report;
pub use receive_report::parse_report;
mod upload;
