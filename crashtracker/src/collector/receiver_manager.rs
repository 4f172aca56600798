// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::transport::SocketAddress;
use crate::shared::configuration::CrashtrackerConfiguration;
use crate::shared::constants::*;
use crate::shared::timeout::TimeoutManager;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use rand::distributions::{Alphanumeric, DistString};
use std::fs::OpenOptions;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("Unable to bind the receiver socket {name}: {source}")]
    Bind { name: String, source: io::Error },
    #[error("Unable to open receiver output file {filename}: {source}")]
    OutputFile { filename: String, source: io::Error },
    #[error("Unable to spawn receiver {binary}: {source}")]
    Spawn { binary: String, source: io::Error },
}

/// A receiver process spawned at startup. It inherits a listening unix socket as its stdin;
/// crash handlers (in this process and in any forked children) connect to that socket.
#[derive(Debug)]
pub struct ReceiverProcess {
    child: Child,
    socket_name: String,
    /// Filesystem socket to unlink on shutdown. Abstract sockets have none.
    socket_path: Option<PathBuf>,
}

impl ReceiverProcess {
    pub fn spawn(
        config: &CrashtrackerConfiguration,
        binary: &str,
    ) -> Result<Self, ReceiverError> {
        let stdout = open_file_or_quiet(config.stdout_filename.as_deref())?;
        let stderr = open_file_or_quiet(config.stderr_filename.as_deref())?;
        let (listener, socket_name, socket_path) = bind_listener()?;

        let child = Command::new(binary)
            .stdin(Stdio::from(OwnedFd::from(listener)))
            .stdout(stdout)
            .stderr(stderr)
            .env(DD_CRASHTRACKER_UPSTREAM_URL, config.endpoint.to_string())
            .env(
                DD_CRASHTRACKER_RECEIVER_TIMEOUT_MS,
                config.timeout.as_millis().to_string(),
            )
            .env(DD_CRASHTRACKER_PARENT_PID, std::process::id().to_string())
            .spawn()
            .map_err(|source| {
                if let Some(path) = &socket_path {
                    let _ = std::fs::remove_file(path);
                }
                ReceiverError::Spawn {
                    binary: binary.to_owned(),
                    source,
                }
            })?;
        tracing::debug!(pid = child.id(), socket = %socket_name, "Spawned crashtracker receiver");
        Ok(Self {
            child,
            socket_name,
            socket_path,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// The address crash handlers connect to.
    pub fn address(&self) -> io::Result<SocketAddress> {
        SocketAddress::unix(&self.socket_name)
    }

    pub fn socket_name(&self) -> &str {
        &self.socket_name
    }

    /// Asks the receiver to exit with SIGTERM and reaps it. If it is still running once
    /// `timeout` has passed, it is killed.
    pub fn shutdown(mut self, timeout: Duration) {
        let pid = Pid::from_raw(self.child.id() as libc::pid_t);
        let _ = signal::kill(pid, Signal::SIGTERM);

        let timeout_manager = TimeoutManager::new(timeout.max(DD_CRASHTRACK_MINIMUM_REAP_TIME));
        let reaped = loop {
            match self.child.try_wait() {
                Ok(Some(_)) => break true,
                Ok(None) if !timeout_manager.expired() => {
                    std::thread::sleep(Duration::from_millis(10))
                }
                Ok(None) | Err(_) => break false,
            }
        };
        if !reaped {
            tracing::warn!(pid = pid.as_raw(), "Receiver did not exit on SIGTERM, killing it");
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
        if let Some(path) = &self.socket_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// An append-mode handle on `filename`, or `/dev/null` when there is none.
fn open_file_or_quiet(filename: Option<&str>) -> Result<Stdio, ReceiverError> {
    let Some(filename) = filename else {
        return Ok(Stdio::null());
    };
    OpenOptions::new()
        .append(true)
        .create(true)
        .open(filename)
        .map(Stdio::from)
        .map_err(|source| ReceiverError::OutputFile {
            filename: filename.to_owned(),
            source,
        })
}

fn socket_name() -> String {
    format!(
        "crashtracker-{}-{}",
        std::process::id(),
        Alphanumeric.sample_string(&mut rand::thread_rng(), 12)
    )
}

#[cfg(target_os = "linux")]
fn bind_listener() -> Result<(UnixListener, String, Option<PathBuf>), ReceiverError> {
    use std::os::linux::net::SocketAddrExt;

    let name = socket_name();
    std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())
        .and_then(|addr| UnixListener::bind_addr(&addr))
        .map(|listener| (listener, name.clone(), None))
        .map_err(|source| ReceiverError::Bind { name, source })
}

#[cfg(not(target_os = "linux"))]
fn bind_listener() -> Result<(UnixListener, String, Option<PathBuf>), ReceiverError> {
    let path = std::env::temp_dir().join(format!("{}.sock", socket_name()));
    let name = path.to_string_lossy().into_owned();
    UnixListener::bind(&path)
        .map(|listener| (listener, name.clone(), Some(path)))
        .map_err(|source| ReceiverError::Bind { name, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crash_info::Metadata;
    use crate::shared::configuration::ResolveFrames;
    use crate::shared::endpoint::Endpoint;

    fn config(stdout: Option<String>, stderr: Option<String>) -> CrashtrackerConfiguration {
        CrashtrackerConfiguration::new(
            Endpoint::from_slice("http://localhost:8126").unwrap(),
            Metadata::default(),
            Some("/bin/cat".to_string()),
            stdout,
            stderr,
            false,
            ResolveFrames::Fast,
            None,
        )
        .unwrap()
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_spawn_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let stdout = dir.path().join("out.txt");
        let stderr = dir.path().join("err.txt");
        let config = config(
            Some(stdout.to_string_lossy().into_owned()),
            Some(stderr.to_string_lossy().into_owned()),
        );
        // A stand-in receiver that ignores its stdin and waits to be told to exit.
        let script = dir.path().join("receiver.sh");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::os::unix::fs::PermissionsExt::from_mode(0o755))
            .unwrap();

        let receiver = ReceiverProcess::spawn(&config, script.to_str().unwrap()).unwrap();
        assert!(receiver.socket_name().contains(&std::process::id().to_string()));
        receiver.address().unwrap();
        let pid = receiver.pid();
        receiver.shutdown(Duration::from_secs(2));
        assert!(signal::kill(Pid::from_raw(pid as libc::pid_t), None).is_err());
        assert!(stdout.exists());
        assert!(stderr.exists());
    }

    #[test]
    fn test_missing_binary() {
        let err = ReceiverProcess::spawn(&config(None, None), "/nonexistent/receiver").unwrap_err();
        assert!(matches!(err, ReceiverError::Spawn { .. }), "{err}");
    }
}
