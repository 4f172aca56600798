// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg(unix)]
mod api;
mod counters;
mod crash_handler;
mod crash_record;
mod emitters;
mod frame_resolver;
mod receiver_manager;
mod signal_handler_manager;
mod transport;

pub use api::*;
pub use counters::{
    begin_op, end_op, reset_counters, snapshot_counters, CounterError, OpTypes, NUM_OP_TYPES,
};
pub use crash_handler::reports_in_flight;
pub use crash_record::CrashRecord;
pub use emitters::{emit_crashreport, generate_boundary, write_json_str, EmitterError};
pub use frame_resolver::{resolve, Frame, RawFrame, Symbol, SymbolRef, SymbolTable};
pub use receiver_manager::ReceiverError;
pub use signal_handler_manager::{SignalHandlerError, DEFAULT_SIGNALS};
pub use transport::{PreparedTransport, SocketAddress, TransportError};
