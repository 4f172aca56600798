// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::crash_info::CrashReport;
use crate::shared::constants::DD_CRASHTRACK_INCOMPLETE_HEADER;
use crate::shared::endpoint::Endpoint;
use anyhow::Context;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST};
use http::{Method, Request};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::time::Duration;

/// A report as received, ready to be forwarded.
#[derive(Debug)]
pub(crate) struct ReceivedReport {
    pub report: CrashReport,
    /// The multipart body, exactly as the crash handler sent it.
    pub body: Bytes,
    pub content_type: String,
}

/// Forwards a report to `upstream`.
///
/// `file://` upstreams get the decoded report as json; `http://` and `unix://` upstreams get
/// the original multipart body, flagged with a header when it was cut short.
pub(crate) async fn relay(
    upstream: &Endpoint,
    received: ReceivedReport,
    timeout: Duration,
) -> anyhow::Result<()> {
    match upstream {
        Endpoint::File { path } => {
            let path = path.clone();
            let written = tokio::task::spawn_blocking(move || received.report.to_file(&path))
                .await
                .context("File writer panicked")??;
            tracing::info!(path = %written.display(), "Wrote crash report");
            Ok(())
        }
        Endpoint::Http { .. } | Endpoint::Unix { .. } => {
            let request = build_request(upstream, &received)?;
            tokio::time::timeout(timeout, post(upstream, request))
                .await
                .with_context(|| format!("Timed out after {timeout:?} posting to {upstream}"))?
        }
    }
}

fn build_request(
    upstream: &Endpoint,
    received: &ReceivedReport,
) -> anyhow::Result<Request<Full<Bytes>>> {
    let uri = match upstream {
        Endpoint::Http { .. } => upstream.to_string(),
        // The connection is made by hand, only the path matters.
        _ => upstream.request_path().to_owned(),
    };
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(HOST, upstream.host_header())
        .header(CONTENT_TYPE, received.content_type.as_str());
    if received.report.incomplete {
        builder = builder.header(DD_CRASHTRACK_INCOMPLETE_HEADER, "true");
    }
    Ok(builder.body(Full::new(received.body.clone()))?)
}

async fn post(upstream: &Endpoint, request: Request<Full<Bytes>>) -> anyhow::Result<()> {
    let status = match upstream {
        Endpoint::Unix { path } => {
            let stream = TokioIo::new(connect_unix(path)?);
            let (mut sender, connection) = hyper::client::conn::http1::handshake(stream).await?;
            let connection = tokio::spawn(connection);
            let response = sender.send_request(request).await?;
            let status = response.status();
            // Read the whole response so the connection winds down cleanly.
            let _ = response.into_body().collect().await;
            drop(sender);
            let _ = connection.await;
            status
        }
        _ => {
            let client = hyper_util::client::legacy::Client::builder(TokioExecutor::new())
                .pool_max_idle_per_host(0)
                .build_http();
            let response = client.request(request).await?;
            let status = response.status();
            let _ = response.into_body().collect().await;
            status
        }
    };
    anyhow::ensure!(status.is_success(), "{upstream} answered {status}");
    tracing::info!(%upstream, %status, "Relayed crash report");
    Ok(())
}

fn connect_unix(path: &str) -> anyhow::Result<tokio::net::UnixStream> {
    #[cfg(target_os = "linux")]
    if !path.starts_with('/') {
        use std::os::linux::net::SocketAddrExt;
        let addr = std::os::unix::net::SocketAddr::from_abstract_name(path.as_bytes())?;
        let stream = std::os::unix::net::UnixStream::connect_addr(&addr)
            .with_context(|| format!("Unable to connect to unix://{path}"))?;
        stream.set_nonblocking(true)?;
        return Ok(tokio::net::UnixStream::from_std(stream)?);
    }
    let stream = std::os::unix::net::UnixStream::connect(path)
        .with_context(|| format!("Unable to connect to unix://{path}"))?;
    stream.set_nonblocking(true)?;
    Ok(tokio::net::UnixStream::from_std(stream)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    fn received(incomplete: bool) -> ReceivedReport {
        let mut report = CrashReport::new();
        if incomplete {
            report.mark_incomplete("Missing closing boundary");
        }
        ReceivedReport {
            report,
            body: Bytes::from_static(b"--b\r\n\r\n{}\r\n--b--\r\n"),
            content_type: "multipart/form-data; boundary=b".to_owned(),
        }
    }

    #[tokio::test]
    #[cfg_attr(miri, ignore)]
    async fn test_relay_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let upstream = Endpoint::from_slice(&format!("file://{}", path.display())).unwrap();

        relay(&upstream, received(false), Duration::from_secs(1))
            .await
            .unwrap();
        relay(&upstream, received(true), Duration::from_secs(1))
            .await
            .unwrap();

        let first: CrashReport = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert!(!first.incomplete);
        let second: CrashReport =
            serde_json::from_slice(&std::fs::read(dir.path().join("report.json.1")).unwrap())
                .unwrap();
        assert!(second.incomplete);
    }

    /// Accepts one connection, answers `status`, and hands back what was sent.
    fn one_shot_server(
        listener: std::net::TcpListener,
        status: &'static str,
    ) -> std::thread::JoinHandle<String> {
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream
                .set_read_timeout(Some(Duration::from_millis(500)))
                .unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            // Read until the body's closing boundary shows up.
            while !String::from_utf8_lossy(&request).contains("--b--") {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }
            write!(
                stream,
                "HTTP/1.1 {status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            )
            .unwrap();
            String::from_utf8_lossy(&request).into_owned()
        })
    }

    #[tokio::test]
    #[cfg_attr(miri, ignore)]
    async fn test_relay_to_http() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = one_shot_server(listener, "202 Accepted");
        let upstream =
            Endpoint::from_slice(&format!("http://127.0.0.1:{port}/crashes")).unwrap();

        relay(&upstream, received(true), Duration::from_secs(2))
            .await
            .unwrap();

        let request = server.join().unwrap().to_lowercase();
        assert!(request.starts_with("post /crashes http/1.1\r\n"), "{request}");
        assert!(request.contains("content-type: multipart/form-data; boundary=b"));
        assert!(request.contains("x-crashtracker-incomplete: true"));
        assert!(request.ends_with("--b--\r\n"));
    }

    #[tokio::test]
    #[cfg_attr(miri, ignore)]
    async fn test_relay_reports_upstream_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = one_shot_server(listener, "500 Internal Server Error");
        let upstream = Endpoint::from_slice(&format!("http://127.0.0.1:{port}")).unwrap();

        let err = relay(&upstream, received(false), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("500"), "{err:#}");
        let request = server.join().unwrap().to_lowercase();
        assert!(!request.contains("x-crashtracker-incomplete"));
    }
}
