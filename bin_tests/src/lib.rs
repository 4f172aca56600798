// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helpers for black-box crash tests.
//!
//! The tests run `crashing_test_app` in one of its modes and play the part of the report
//! destination themselves: a plain `TcpListener` that reads one request until the crashing
//! process shuts its write side down, answers, and hands the request back for inspection.
#![cfg(unix)]

use anyhow::Context;
use crashtracker::crash_info::CrashReport;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::process::{Child, ExitStatus};
use std::time::{Duration, Instant};

/// Crash-handler timeout used by the test app; tests allow this plus some slack.
pub const APP_TIMEOUT: Duration = Duration::from_secs(3);

#[macro_export]
macro_rules! timeit {
    ($op_name:literal, $op:block) => {{
        let start = std::time::Instant::now();
        let res = $op;
        let delta = start.elapsed();
        eprintln!(
            concat!($op_name, " took {} ms"),
            delta.as_secs_f64() * 1000.0
        );
        res
    }};
}

/// One HTTP request, as the test listener received it.
#[derive(Debug)]
pub struct ReceivedRequest {
    pub head: String,
    /// Body with the chunked transfer encoding already removed.
    pub body: Vec<u8>,
    /// Raw bytes after the head, before de-chunking.
    pub raw_body: Vec<u8>,
}

impl ReceivedRequest {
    pub fn request_line(&self) -> &str {
        self.head.lines().next().unwrap_or_default()
    }

    /// Value of the first header named `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim())
        })
    }

    pub fn report(&self) -> CrashReport {
        crashtracker::parse_report(self.header("content-type"), &self.body, None)
    }
}

/// A listener on an ephemeral loopback port, and the url the test app should report to.
pub fn report_listener() -> anyhow::Result<(TcpListener, String)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let url = format!("http://{}/crash", listener.local_addr()?);
    Ok((listener, url))
}

/// Waits up to `timeout` for a connection on `listener` and reads one request from it.
/// Returns `None` when nobody connected in time.
pub fn accept_report(
    listener: &TcpListener,
    timeout: Duration,
) -> anyhow::Result<Option<ReceivedRequest>> {
    listener.set_nonblocking(true)?;
    let deadline = Instant::now() + timeout;
    let mut stream = loop {
        match listener.accept() {
            Ok((stream, _)) => break stream,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => return Err(e.into()),
        }
    };
    read_request(&mut stream, timeout).map(Some)
}

/// Reads until the peer shuts down its write side, then answers `200 OK` and closes.
pub fn read_request(stream: &mut TcpStream, timeout: Duration) -> anyhow::Result<ReceivedRequest> {
    // Accepted sockets inherit O_NONBLOCK on some platforms.
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(timeout))?;
    let mut data = Vec::new();
    stream
        .read_to_end(&mut data)
        .context("reading the crash report")?;
    let _ = stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");

    let head_end = data
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .context("no end of headers")?;
    let head = String::from_utf8(data[..head_end].to_vec())?;
    let raw_body = data[head_end + 4..].to_vec();
    let body = dechunk(&raw_body)?;
    Ok(ReceivedRequest {
        head,
        body,
        raw_body,
    })
}

/// Removes chunked transfer encoding, checking the framing as it goes.
pub fn dechunk(mut data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let line_end = data
            .windows(2)
            .position(|w| w == b"\r\n")
            .context("unterminated chunk size")?;
        let size = usize::from_str_radix(std::str::from_utf8(&data[..line_end])?.trim(), 16)?;
        data = &data[line_end + 2..];
        anyhow::ensure!(data.len() >= size + 2, "chunk of {size} bytes is cut short");
        anyhow::ensure!(&data[size..size + 2] == b"\r\n", "chunk not followed by CRLF");
        body.extend_from_slice(&data[..size]);
        data = &data[size + 2..];
        if size == 0 {
            anyhow::ensure!(data.is_empty(), "{} bytes after the last chunk", data.len());
            return Ok(body);
        }
    }
}

/// Waits for `child` to exit, killing it if it is still around after `timeout`.
pub fn wait_with_timeout(child: &mut Child, timeout: Duration) -> anyhow::Result<ExitStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            anyhow::bail!("process {} still running after {timeout:?}", child.id());
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dechunk() {
        let body = dechunk(b"5\r\nhello\r\n1\r\n \r\n5\r\nworld\r\n0\r\n\r\n").unwrap();
        assert_eq!(body, b"hello world");
        assert!(dechunk(b"5\r\nhel").is_err());
        assert!(dechunk(b"5\r\nhello\r\n0\r\n\r\nextra").is_err());
    }

    #[test]
    fn test_header_lookup() {
        let request = ReceivedRequest {
            head: "POST /crash HTTP/1.1\r\nHost: 127.0.0.1:1\r\nContent-Type: multipart/form-data; boundary=x".to_owned(),
            body: vec![],
            raw_body: vec![],
        };
        assert_eq!(request.request_line(), "POST /crash HTTP/1.1");
        assert_eq!(
            request.header("content-type"),
            Some("multipart/form-data; boundary=x")
        );
        assert_eq!(request.header("transfer-encoding"), None);
    }
}
