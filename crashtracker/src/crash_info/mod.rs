// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod metadata;
mod report;
mod sig_info;
mod stacktrace;

pub use metadata::*;
pub use report::*;
pub use sig_info::*;
pub use stacktrace::*;
