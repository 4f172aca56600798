// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::crash_info::CrashReport;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Body;
use std::fmt::Display;
use std::io::{Cursor, Read};
use std::time::Duration;

/// Reads `body` until it ends, fails, or `timeout` passes, whichever comes first.
///
/// Returns whatever arrived, along with the reason the body was cut short, if it was. A crashing
/// process can die half way through a report; partial data is still worth relaying.
pub(crate) async fn drain_body<B>(mut body: B, timeout: Duration) -> (Vec<u8>, Option<String>)
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Display,
{
    let deadline = tokio::time::Instant::now() + timeout;
    let mut data = Vec::new();
    loop {
        match tokio::time::timeout_at(deadline, body.frame()).await {
            Err(_) => {
                let reason = format!("Timed out after {timeout:?} reading the crash report");
                return (data, Some(reason));
            }
            Ok(None) => return (data, None),
            Ok(Some(Err(e))) => {
                return (data, Some(format!("Error reading the crash report: {e}")));
            }
            Ok(Some(Ok(frame))) => {
                if let Ok(chunk) = frame.into_data() {
                    data.extend_from_slice(&chunk);
                }
            }
        }
    }
}

/// Decodes a `multipart/form-data` body into a [`CrashReport`].
///
/// This never fails: every problem (a bad content type, a part that doesn't decode, a missing
/// closing boundary) is recorded in the report, which is then marked incomplete.
pub fn parse_report(
    content_type: Option<&str>,
    body: &[u8],
    truncation: Option<String>,
) -> CrashReport {
    let mut report = CrashReport::new();
    if let Some(reason) = truncation {
        report.mark_incomplete(reason);
    }

    let boundary = match content_type.map(extract_boundary) {
        Some(Ok(boundary)) => boundary,
        Some(Err(e)) => {
            report.mark_incomplete(e.to_string());
            return report;
        }
        None => {
            report.mark_incomplete("Missing Content-Type header");
            return report;
        }
    };

    let mut multipart = multipart::server::Multipart::with_body(Cursor::new(body), &boundary);
    loop {
        match multipart.read_entry() {
            Ok(Some(mut field)) => {
                let name = field.headers.name.to_string();
                let mut content = Vec::new();
                if let Err(e) = field.data.read_to_end(&mut content) {
                    report.mark_incomplete(format!("Error reading part {name:?}: {e}"));
                }
                report.add_part(&name, &content);
            }
            Ok(None) => break,
            Err(e) => {
                report.mark_incomplete(format!("Error reading multipart body: {e}"));
                break;
            }
        }
    }

    let closing = format!("--{boundary}--");
    if !body.trim_ascii_end().ends_with(closing.as_bytes()) {
        report.mark_incomplete("Missing closing boundary");
    }
    report
}

fn extract_boundary(content_type: &str) -> anyhow::Result<String> {
    let mime: mime::Mime = content_type.parse()?;
    anyhow::ensure!(
        mime.type_() == mime::MULTIPART && mime.subtype() == mime::FORM_DATA,
        "Unexpected content type {content_type:?}"
    );
    let boundary = mime
        .get_param(mime::BOUNDARY)
        .ok_or_else(|| anyhow::anyhow!("No boundary in content type {content_type:?}"))?;
    Ok(boundary.as_str().to_owned())
}
