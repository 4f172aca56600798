// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#[cfg(not(unix))]
fn main() {}

#[cfg(unix)]
fn main() -> anyhow::Result<()> {
    use crashtracker::shared::constants::DD_LOG_LEVEL;
    use tracing_subscriber::EnvFilter;

    let filter = std::env::var(DD_LOG_LEVEL)
        .ok()
        .and_then(|level| EnvFilter::try_new(format!("hyper=off,{level}")).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let result = crashtracker::receiver_entry_point_stdin();
    if let Err(e) = &result {
        tracing::error!("Crashtracker receiver failed: {e:#}");
    }
    result
}
