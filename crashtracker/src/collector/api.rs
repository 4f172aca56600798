// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The process-wide configuration store and the crashtracker lifecycle.
//!
//! Setters accumulate configuration; [`start`] freezes it into a [`CrashtrackerConfiguration`],
//! prepares everything the signal handler needs and installs it. The store is guarded by a
//! mutex, which the signal handler never touches: it only reads the state published by
//! `start()` through an atomic pointer.

use super::counters::reset_counters;
use super::crash_handler::{clear_state, reset_after_fork, update_state, HandlerState};
use super::frame_resolver::SymbolTable;
use super::receiver_manager::{ReceiverError, ReceiverProcess};
use super::signal_handler_manager::{
    create_alt_stack, register_crash_handlers, restore_old_handlers, SignalHandlerError,
    DEFAULT_SIGNALS,
};
use super::transport::PreparedTransport;
use crate::crash_info::{Metadata, OsInfo, DEFAULT_LIBRARY_NAME};
use crate::shared::configuration::{
    validate_field, ConfigurationError, CrashtrackerConfiguration, ResolveFrames,
};
use crate::shared::constants::{DD_CRASHTRACK_MAX_FIELD_LEN, DD_CRASHTRACK_MAX_PATH_LEN};
use crate::shared::endpoint::Endpoint;
use std::sync::{LazyLock, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("No url configured, call set_url first")]
    MissingUrl,
    #[error("Invalid configuration: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("Unable to serialize metadata: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("Unable to resolve {endpoint}: {source}")]
    EndpointResolution {
        endpoint: String,
        source: std::io::Error,
    },
    #[error("Unable to start the receiver: {0}")]
    Receiver(#[from] ReceiverError),
    #[error("Unable to load symbols: {0:#}")]
    SymbolTable(anyhow::Error),
    #[error("Unable to install crash handlers: {0}")]
    SignalHandler(#[from] SignalHandlerError),
}

#[derive(Debug)]
struct Started {
    config: CrashtrackerConfiguration,
    receiver: Option<ReceiverProcess>,
}

#[derive(Debug)]
struct ConfigStore {
    url: Option<Endpoint>,
    service: Option<String>,
    version: Option<String>,
    runtime: Option<String>,
    runtime_version: Option<String>,
    library_version: Option<String>,
    stdout_filename: Option<String>,
    stderr_filename: Option<String>,
    receiver_binary: Option<String>,
    use_alt_stack: bool,
    resolve_frames: ResolveFrames,
    timeout: Option<Duration>,
    started: Option<Started>,
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self {
            url: None,
            service: None,
            version: None,
            runtime: None,
            runtime_version: None,
            library_version: None,
            stdout_filename: None,
            stderr_filename: None,
            receiver_binary: None,
            use_alt_stack: true,
            resolve_frames: ResolveFrames::default(),
            timeout: None,
            started: None,
        }
    }
}

static STORE: LazyLock<Mutex<ConfigStore>> = LazyLock::new(|| Mutex::new(ConfigStore::default()));

/// Built on the first `start()` in `Full` mode and never freed, so the signal handler can
/// borrow from it for the lifetime of the process.
static SYMBOLS: OnceLock<SymbolTable> = OnceLock::new();

fn lock_store() -> MutexGuard<'static, ConfigStore> {
    // Every mutation is a single assignment, so a poisoned store is still consistent.
    STORE.lock().unwrap_or_else(PoisonError::into_inner)
}

fn update_store(
    apply: impl FnOnce(&mut ConfigStore) -> Result<(), ConfigurationError>,
) -> Result<(), ConfigurationError> {
    let mut store = lock_store();
    if store.started.is_some() {
        return Err(ConfigurationError::AlreadyStarted);
    }
    apply(&mut store)
}

fn set_string(
    field: &'static str,
    value: &[u8],
    max: usize,
    slot: impl FnOnce(&mut ConfigStore) -> &mut Option<String>,
) -> Result<(), ConfigurationError> {
    let value = validate_field(field, value, max).inspect_err(|e| {
        tracing::debug!(field, error = %e, "Rejected crashtracker setting");
    })?;
    update_store(|store| {
        *slot(store) = Some(value);
        Ok(())
    })
}

/// Sets where crash reports go: `http://host[:port][/path]`, `unix:///path` (or an abstract
/// `unix://name` on Linux), or `file:///path` when a receiver binary is configured.
pub fn set_url(url: &[u8]) -> Result<(), ConfigurationError> {
    let url = validate_field("url", url, DD_CRASHTRACK_MAX_FIELD_LEN)?;
    let endpoint = Endpoint::from_slice(&url).inspect_err(|e| {
        tracing::debug!(error = %e, "Rejected crashtracker url");
    })?;
    update_store(|store| {
        store.url = Some(endpoint);
        Ok(())
    })
}

pub fn set_service(service: &[u8]) -> Result<(), ConfigurationError> {
    set_string("service", service, DD_CRASHTRACK_MAX_FIELD_LEN, |s| {
        &mut s.service
    })
}

pub fn set_version(version: &[u8]) -> Result<(), ConfigurationError> {
    set_string("version", version, DD_CRASHTRACK_MAX_FIELD_LEN, |s| {
        &mut s.version
    })
}

pub fn set_runtime(runtime: &[u8]) -> Result<(), ConfigurationError> {
    set_string("runtime", runtime, DD_CRASHTRACK_MAX_FIELD_LEN, |s| {
        &mut s.runtime
    })
}

pub fn set_runtime_version(runtime_version: &[u8]) -> Result<(), ConfigurationError> {
    set_string(
        "runtime_version",
        runtime_version,
        DD_CRASHTRACK_MAX_FIELD_LEN,
        |s| &mut s.runtime_version,
    )
}

pub fn set_library_version(library_version: &[u8]) -> Result<(), ConfigurationError> {
    set_string(
        "library_version",
        library_version,
        DD_CRASHTRACK_MAX_FIELD_LEN,
        |s| &mut s.library_version,
    )
}

/// Where the receiver process's stdout goes. Unset means `/dev/null`. Setting it without a
/// receiver binary makes `start()` fail.
pub fn set_stdout_filename(filename: &[u8]) -> Result<(), ConfigurationError> {
    set_string(
        "stdout_filename",
        filename,
        DD_CRASHTRACK_MAX_PATH_LEN,
        |s| &mut s.stdout_filename,
    )
}

/// Where the receiver process's stderr goes. Unset means `/dev/null`. Setting it without a
/// receiver binary makes `start()` fail.
pub fn set_stderr_filename(filename: &[u8]) -> Result<(), ConfigurationError> {
    set_string(
        "stderr_filename",
        filename,
        DD_CRASHTRACK_MAX_PATH_LEN,
        |s| &mut s.stderr_filename,
    )
}

/// Path of the receiver binary to spawn at `start()`. Without one, the crash handler posts
/// straight to the configured url.
pub fn set_receiver_binary(path: &[u8]) -> Result<(), ConfigurationError> {
    set_string(
        "receiver_binary",
        path,
        DD_CRASHTRACK_MAX_PATH_LEN,
        |s| &mut s.receiver_binary,
    )
}

/// Whether the handler runs on an alternate signal stack, which lets stack overflows be
/// reported. On by default.
pub fn set_alt_stack(use_alt_stack: bool) -> Result<(), ConfigurationError> {
    update_store(|store| {
        store.use_alt_stack = use_alt_stack;
        Ok(())
    })
}

pub fn set_resolve_frames(resolve_frames: ResolveFrames) -> Result<(), ConfigurationError> {
    update_store(|store| {
        store.resolve_frames = resolve_frames;
        Ok(())
    })
}

/// Bounds the time spent delivering a report. Zero restores the default.
pub fn set_timeout(timeout: Duration) -> Result<(), ConfigurationError> {
    update_store(|store| {
        store.timeout = Some(timeout);
        Ok(())
    })
}

/// Initialize the crash-tracking infrastructure.
///
/// Calling this again once it succeeded is a no-op returning `Ok`: handlers are never
/// installed twice.
///
/// PRECONDITIONS:
///     `set_url` has been called.
/// SAFETY:
///     Crash-tracking functions are not reentrant.
///     No other crash-handler functions should be called concurrently.
/// ATOMICITY:
///     This function is not atomic. A crash during its execution may lead to
///     unexpected crash-handling behaviour.
pub fn start() -> Result<(), StartupError> {
    let mut store = lock_store();
    if store.started.is_some() {
        tracing::debug!("Crashtracker already started");
        return Ok(());
    }

    let endpoint = store.url.clone().ok_or(StartupError::MissingUrl)?;
    let metadata = Metadata {
        service: store.service.clone(),
        version: store.version.clone(),
        runtime: store.runtime.clone(),
        runtime_version: store.runtime_version.clone(),
        library_name: DEFAULT_LIBRARY_NAME.to_owned(),
        library_version: store.library_version.clone(),
        os: Some(OsInfo::current()),
    };
    let config = CrashtrackerConfiguration::new(
        endpoint,
        metadata,
        store.receiver_binary.clone(),
        store.stdout_filename.clone(),
        store.stderr_filename.clone(),
        store.use_alt_stack,
        store.resolve_frames,
        store.timeout,
    )?;

    let (state, receiver) = prepare(&config)?;
    if let Err(e) = install(&config, state) {
        if let Some(receiver) = receiver {
            receiver.shutdown(config.timeout);
        }
        return Err(e);
    }

    tracing::info!(
        endpoint = %config.endpoint,
        receiver = receiver.as_ref().map(|r| r.pid()),
        resolve_frames = ?config.resolve_frames,
        "Crashtracker started"
    );
    store.started = Some(Started { config, receiver });
    Ok(())
}

/// `set_url` followed by `start`.
pub fn start_with_url(url: &[u8]) -> Result<(), StartupError> {
    if !is_started() {
        set_url(url)?;
    }
    start()
}

/// Everything that allocates or blocks, done before any handler is installed.
fn prepare(
    config: &CrashtrackerConfiguration,
) -> Result<(HandlerState, Option<ReceiverProcess>), StartupError> {
    let metadata_json = serde_json::to_string(&config.metadata)?;

    let symbols = match config.resolve_frames {
        ResolveFrames::Fast => None,
        ResolveFrames::Full => Some(symbol_table()?),
    };

    let (transport, receiver) = match &config.receiver_binary {
        Some(binary) => {
            let receiver = ReceiverProcess::spawn(config, binary)?;
            match receiver.address() {
                Ok(address) => (
                    PreparedTransport::new(address, "localhost", "/", metadata_json),
                    Some(receiver),
                ),
                Err(source) => {
                    let endpoint = format!("unix://{}", receiver.socket_name());
                    receiver.shutdown(config.timeout);
                    return Err(StartupError::EndpointResolution { endpoint, source });
                }
            }
        }
        None => {
            let transport = PreparedTransport::for_endpoint(&config.endpoint, metadata_json)
                .map_err(|source| StartupError::EndpointResolution {
                    endpoint: config.endpoint.to_string(),
                    source,
                })?;
            (transport, None)
        }
    };

    let state = HandlerState {
        transport,
        resolve_frames: config.resolve_frames,
        symbols,
        timeout: config.timeout,
    };
    Ok((state, receiver))
}

fn install(config: &CrashtrackerConfiguration, state: HandlerState) -> Result<(), StartupError> {
    if config.use_alt_stack {
        create_alt_stack()?;
    }
    // Publish the state first, so a crash right after registration has somewhere to go.
    update_state(state);
    if let Err(e) = register_crash_handlers(&DEFAULT_SIGNALS, config.use_alt_stack) {
        clear_state();
        return Err(e.into());
    }
    Ok(())
}

fn symbol_table() -> Result<&'static SymbolTable, StartupError> {
    if let Some(table) = SYMBOLS.get() {
        return Ok(table);
    }
    let table = SymbolTable::load_current_process().map_err(StartupError::SymbolTable)?;
    tracing::debug!(
        symbols = table.len(),
        modules = table.modules().len(),
        "Loaded symbol tables"
    );
    Ok(SYMBOLS.get_or_init(|| table))
}

pub fn is_started() -> bool {
    lock_store().started.is_some()
}

/// Cleans up after the crash-tracker:
/// Unregister the crash handler, restore the previous handler (if any), and
/// shut down the receiver. The configuration becomes mutable again.
/// Calling this when not started does nothing.
///
/// SAFETY:
///     Crash-tracking functions are not reentrant.
///     No other crash-handler functions should be called concurrently.
/// ATOMICITY:
///     This function is not atomic. A crash during its execution may lead to
///     unexpected crash-handling behaviour.
pub fn shutdown() -> Result<(), SignalHandlerError> {
    let mut store = lock_store();
    let Some(started) = store.started.take() else {
        return Ok(());
    };
    if let Err(e) = restore_old_handlers() {
        store.started = Some(started);
        return Err(e);
    }
    clear_state();
    if let Some(receiver) = started.receiver {
        receiver.shutdown(started.config.timeout);
    }
    tracing::info!("Crashtracker shut down");
    Ok(())
}

/// Reinitialize the crash-tracking infrastructure after a fork.
/// This should be one of the first things done after a fork, to minimize the
/// chance that a crash occurs between the fork, and this call.
///
/// Signal handlers and the altstack survive fork unchanged, and the handler opens a new
/// connection per report. What is reset is per-process bookkeeping: the operation counters,
/// and the handler's in-flight count and guard, which a parent whose chained handler
/// recovered from a signal would otherwise pass on already taken.
/// https://man7.org/linux/man-pages/man2/sigaction.2.html
/// https://man7.org/linux/man-pages/man2/sigaltstack.2.html
pub fn on_fork() {
    reset_counters();
    reset_after_fork();
}

#[cfg(test)]
pub(crate) static API_TEST_LOCK: Mutex<()> = Mutex::new(());
