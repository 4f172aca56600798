// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::receive_report::{drain_body, parse_report};
use super::upload::{relay, ReceivedReport};
use crate::shared::constants::*;
use crate::shared::endpoint::Endpoint;
use anyhow::Context;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};

const PARENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What the receiver needs to know, taken from the environment set up by the process that
/// spawned it.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub upstream: Endpoint,
    /// Time allowed to drain one report, and to relay it.
    pub timeout: Duration,
    /// Exit once this process is gone.
    pub parent_pid: Option<libc::pid_t>,
}

impl ReceiverConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let upstream = std::env::var(DD_CRASHTRACKER_UPSTREAM_URL)
            .with_context(|| format!("{DD_CRASHTRACKER_UPSTREAM_URL} is not set"))?;
        let upstream = Endpoint::from_slice(&upstream)?;
        Ok(Self {
            upstream,
            timeout: receiver_timeout(),
            parent_pid: std::env::var(DD_CRASHTRACKER_PARENT_PID)
                .ok()
                .and_then(|s| s.parse().ok()),
        })
    }
}

/*-----------------------------------------
|                Public API               |
------------------------------------------*/

/// Runs the receiver on the listening socket inherited as stdin, until SIGTERM or until the
/// parent process goes away.
pub fn receiver_entry_point_stdin() -> anyhow::Result<()> {
    let config = ReceiverConfig::from_env()?;
    // SAFETY: fd 0 is owned by this process and nothing else in the receiver uses stdin.
    let fd = unsafe { OwnedFd::from_raw_fd(libc::STDIN_FILENO) };
    let listener = std::os::unix::net::UnixListener::from(fd);
    listener
        .set_nonblocking(true)
        .context("stdin is not the receiver socket")?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(async {
        let listener = UnixListener::from_std(listener)?;
        let shutdown = wait_for_termination(config.parent_pid)?;
        async_receiver_entry_point_unix_listener(listener, Arc::new(config), shutdown).await
    })
}

/// Serves crash reports posted to `listener`, one task per connection, until `shutdown`
/// completes. Connections still in flight at that point get up to the configured timeout to
/// finish.
pub async fn async_receiver_entry_point_unix_listener(
    listener: UnixListener,
    config: Arc<ReceiverConfig>,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    tracing::debug!(upstream = %config.upstream, "Crashtracker receiver ready");
    let mut server = hyper::server::conn::http1::Builder::new();
    // The crash handler shuts its write side down as soon as the request is sent.
    server.half_close(true);
    let mut joinset = tokio::task::JoinSet::new();
    tokio::pin!(shutdown);

    let result = loop {
        let conn = tokio::select! {
            biased;
            con_res = listener.accept() => match con_res {
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                            | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    tracing::error!("Receiver listener error: {e}");
                    break Err(e.into());
                }
                Ok((conn, _)) => conn,
            },
            finished = async {
                match joinset.join_next().await {
                    Some(finished) => finished,
                    None => std::future::pending().await,
                }
            } => match finished {
                Err(e) if e.is_panic() => {
                    std::panic::resume_unwind(e.into_panic());
                },
                Ok(()) | Err(_) => continue,
            },
            () = &mut shutdown => break Ok(()),
        };
        let conn = hyper_util::rt::TokioIo::new(conn);
        let server = server.clone();
        let config = config.clone();
        joinset.spawn(async move {
            let service = service_fn(move |req| handle_request(req, config.clone()));
            if let Err(e) = server.serve_connection(conn, service).await {
                // The crashing process died mid-request; nothing else to do for it.
                tracing::debug!("Connection error: {e}");
            }
        });
    };

    if !joinset.is_empty() {
        let drain = async { while joinset.join_next().await.is_some() {} };
        if tokio::time::timeout(config.timeout, drain).await.is_err() {
            tracing::warn!(
                remaining = joinset.len(),
                "Abandoning crash reports still in flight"
            );
        }
    }
    result
}

async fn handle_request(
    req: Request<Incoming>,
    config: Arc<ReceiverConfig>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.method() != Method::POST {
        return Ok(response(StatusCode::METHOD_NOT_ALLOWED));
    }
    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let (body, truncation) = drain_body(req.into_body(), config.timeout).await;
    let report = parse_report(content_type.as_deref(), &body, truncation);
    tracing::info!(
        uuid = %report.uuid,
        incomplete = report.incomplete,
        bytes = body.len(),
        "Received crash report"
    );

    let received = ReceivedReport {
        report,
        body: Bytes::from(body),
        content_type: content_type.unwrap_or_else(|| "multipart/form-data".to_owned()),
    };
    match relay(&config.upstream, received, config.timeout).await {
        Ok(()) => Ok(response(StatusCode::OK)),
        Err(e) => {
            tracing::error!("Unable to relay crash report to {}: {e:#}", config.upstream);
            Ok(response(StatusCode::BAD_GATEWAY))
        }
    }
}

fn response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

/// Completes on SIGTERM, or once `parent_pid` is gone.
fn wait_for_termination(
    parent_pid: Option<libc::pid_t>,
) -> anyhow::Result<impl Future<Output = ()>> {
    let mut sigterm = signal(SignalKind::terminate()).context("Unable to watch SIGTERM")?;
    // Spawned directly by the monitored process: its death reparents us. Otherwise all we
    // can do is check whether the pid still exists.
    // SAFETY: getppid has no preconditions.
    let direct_parent = parent_pid.filter(|pid| *pid == unsafe { libc::getppid() });
    Ok(async move {
        let mut interval = tokio::time::interval(PARENT_POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::debug!("Received SIGTERM, exiting");
                    return;
                }
                _ = interval.tick() => {
                    if let Some(pid) = parent_pid {
                        if !parent_alive(pid, direct_parent.is_some()) {
                            tracing::debug!(pid, "Parent process exited, exiting");
                            return;
                        }
                    }
                }
            }
        }
    })
}

fn parent_alive(pid: libc::pid_t, direct_parent: bool) -> bool {
    if direct_parent {
        // SAFETY: getppid has no preconditions.
        return unsafe { libc::getppid() } == pid;
    }
    !matches!(
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None),
        Err(nix::errno::Errno::ESRCH)
    )
}

fn receiver_timeout() -> Duration {
    // Set by the spawning process from its configured timeout.
    if let Ok(s) = std::env::var(DD_CRASHTRACKER_RECEIVER_TIMEOUT_MS) {
        if let Ok(v) = s.parse() {
            return Duration::from_millis(v);
        }
    }
    DD_CRASHTRACK_DEFAULT_TIMEOUT
}
