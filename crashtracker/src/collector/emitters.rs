// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::counters::OpTypes;
use super::crash_record::CrashRecord;
use super::frame_resolver::Frame;
use crate::crash_info::{translate_si_code, SignalNames};
use crate::shared::constants::*;
use rand::distributions::{Alphanumeric, DistString};
use std::io::Write;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmitterError {
    #[error("Failed to write to output: {0}")]
    WriteError(#[from] std::io::Error),
}

/// A fresh multipart boundary. Chosen once at startup and reused for every report.
pub fn generate_boundary() -> String {
    let mut boundary = String::from(DD_CRASHTRACK_BOUNDARY_PREFIX);
    Alphanumeric.append_string(
        &mut rand::thread_rng(),
        &mut boundary,
        DD_CRASHTRACK_BOUNDARY_RANDOM_LEN,
    );
    boundary
}

/// Emits the body of a crash report as `multipart/form-data`, one JSON part per section.
///
/// The writer is flushed after each part so that a report cut short by a second fault, or by
/// the watchdog, still carries every section completed before it.
///
/// SAFETY:
///     Crash-tracking functions are not reentrant.
///     No other crash-handler functions should be called concurrently.
/// ATOMICITY:
///     This function is not atomic. A crash during its execution may lead to
///     unexpected crash-handling behaviour.
/// SIGNAL SAFETY:
///     This function is careful to only write to the handle, without doing any
///     unnecessary mutexes or memory allocation.
pub fn emit_crashreport(
    w: &mut impl Write,
    boundary: &str,
    metadata_json: &str,
    record: &CrashRecord,
) -> Result<(), EmitterError> {
    emit_part(w, boundary, DD_CRASHTRACK_PART_METADATA, |w| {
        w.write_all(metadata_json.as_bytes())
    })?;
    emit_part(w, boundary, DD_CRASHTRACK_PART_SIGINFO, |w| {
        emit_siginfo(w, record)
    })?;
    emit_part(w, boundary, DD_CRASHTRACK_PART_PROCINFO, |w| {
        emit_procinfo(w, record)
    })?;
    emit_part(w, boundary, DD_CRASHTRACK_PART_COUNTERS, |w| {
        emit_counters(w, record)
    })?;
    emit_part(w, boundary, DD_CRASHTRACK_PART_STACKTRACE, |w| {
        emit_stacktrace(w, record)
    })?;
    write!(w, "--{boundary}--\r\n")?;
    w.flush()?;
    Ok(())
}

fn emit_part<W: Write>(
    w: &mut W,
    boundary: &str,
    name: &str,
    body: impl FnOnce(&mut W) -> std::io::Result<()>,
) -> Result<(), EmitterError> {
    write!(
        w,
        "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\nContent-Type: application/json\r\n\r\n"
    )?;
    body(w)?;
    w.write_all(b"\r\n")?;
    w.flush()?;
    Ok(())
}

fn emit_siginfo(w: &mut impl Write, record: &CrashRecord) -> std::io::Result<()> {
    let si_signo = record.signum;
    let si_signo_human_readable: SignalNames = si_signo.into();
    let si_code = record.si_code;
    let si_code_human_readable = translate_si_code(si_signo, si_code);

    write!(w, "{{\"si_signo\":{si_signo}")?;
    write!(
        w,
        ",\"si_signo_human_readable\":\"{}\"",
        si_signo_human_readable.as_str()
    )?;
    write!(w, ",\"si_code\":{si_code}")?;
    write!(
        w,
        ",\"si_code_human_readable\":\"{}\"",
        si_code_human_readable.as_str()
    )?;
    match record.si_addr {
        Some(si_addr) => write!(w, ",\"si_addr\":\"{si_addr:#018x}\"")?,
        None => write!(w, ",\"si_addr\":null")?,
    }
    if let Some(si_pid) = record.si_pid {
        write!(w, ",\"si_pid\":{si_pid}")?;
    }
    write!(w, "}}")
}

fn emit_procinfo(w: &mut impl Write, record: &CrashRecord) -> std::io::Result<()> {
    write!(
        w,
        "{{\"pid\":{},\"tid\":{},\"timestamp_secs\":{},\"timestamp_nanos\":{}}}",
        record.pid, record.tid, record.timestamp_secs, record.timestamp_nanos
    )
}

fn emit_counters(w: &mut impl Write, record: &CrashRecord) -> std::io::Result<()> {
    write!(w, "{{")?;
    for (i, value) in record.counters.iter().enumerate() {
        // The array is sized by the enum, so every index maps to an op.
        let name = OpTypes::from_index(i).map(|op| op.name()).unwrap_or("unknown");
        write!(w, "\"{name}\":{value},")?;
    }
    write!(w, "\"reports_in_flight\":{}}}", record.reports_in_flight)
}

fn emit_stacktrace(w: &mut impl Write, record: &CrashRecord) -> std::io::Result<()> {
    write!(w, "{{\"frames\":[")?;
    for (i, frame) in record.frames().iter().enumerate() {
        if i > 0 {
            write!(w, ",")?;
        }
        emit_frame(w, frame)?;
    }
    write!(w, "],\"truncated\":{}}}", record.frames_truncated)
}

fn emit_frame(w: &mut impl Write, frame: &Frame) -> std::io::Result<()> {
    write!(w, "{{\"ip\":\"{:#x}\"", frame.raw.ip)?;
    write!(w, ",\"sp\":\"{:#x}\"", frame.raw.sp)?;
    write!(w, ",\"symbol_address\":\"{:#x}\"", frame.raw.symbol_address)?;
    if let Some(symbol) = &frame.symbol {
        write!(w, ",\"function\":")?;
        write_json_str(w, symbol.name)?;
        write!(w, ",\"module\":")?;
        write_json_str(w, symbol.module)?;
    }
    write!(w, "}}")
}

/// Writes `s` as a quoted JSON string. Runs of characters that need no escaping are written
/// as a single slice, everything else is escaped in place, so nothing is allocated.
pub fn write_json_str(w: &mut impl Write, s: &str) -> std::io::Result<()> {
    w.write_all(b"\"")?;
    let bytes = s.as_bytes();
    let mut start = 0;
    for (i, &b) in bytes.iter().enumerate() {
        let escaped: &[u8] = match b {
            b'"' => b"\\\"",
            b'\\' => b"\\\\",
            b'\n' => b"\\n",
            b'\r' => b"\\r",
            b'\t' => b"\\t",
            0x00..=0x1f => {
                w.write_all(&bytes[start..i])?;
                write!(w, "\\u{b:04x}")?;
                start = i + 1;
                continue;
            }
            _ => continue,
        };
        w.write_all(&bytes[start..i])?;
        w.write_all(escaped)?;
        start = i + 1;
    }
    w.write_all(&bytes[start..])?;
    w.write_all(b"\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::frame_resolver::{RawFrame, SymbolRef};
    use crate::crash_info::{CrashReport, SiCodes};

    fn json_str(s: &str) -> String {
        let mut buf = Vec::new();
        write_json_str(&mut buf, s).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_write_json_str() {
        assert_eq!(json_str("plain"), "\"plain\"");
        assert_eq!(json_str("a\"b\\c"), r#""a\"b\\c""#);
        assert_eq!(json_str("line\nnext\ttab"), r#""line\nnext\ttab""#);
        assert_eq!(json_str("\u{1}"), r#""\u0001""#);
        assert_eq!(json_str("<impl Foo for &'a [u8]>::bar"), "\"<impl Foo for &'a [u8]>::bar\"");
        for s in ["", "ünïcödé", "ctrl\u{7}bell", "q\"\"q"] {
            let decoded: String = serde_json::from_str(&json_str(s)).unwrap();
            assert_eq!(decoded, s);
        }
    }

    #[test]
    fn test_boundary() {
        let boundary = generate_boundary();
        assert!(boundary.starts_with(DD_CRASHTRACK_BOUNDARY_PREFIX));
        assert_eq!(
            boundary.len(),
            DD_CRASHTRACK_BOUNDARY_PREFIX.len() + DD_CRASHTRACK_BOUNDARY_RANDOM_LEN
        );
        assert_ne!(boundary, generate_boundary());
    }

    fn sample_record() -> CrashRecord<'static> {
        let mut record = CrashRecord::new(libc::SIGSEGV, 1);
        record.si_addr = Some(0);
        record.pid = 1234;
        record.tid = 1235;
        record.timestamp_secs = 1_700_000_000;
        record.timestamp_nanos = 42;
        record.counters[OpTypes::ProfilerUnwinding as usize] = 2;
        record.reports_in_flight = 1;
        record.frames[0] = Frame {
            raw: RawFrame {
                ip: 0x1004,
                sp: 0x7ff0,
                symbol_address: 0x1000,
            },
            symbol: Some(SymbolRef {
                address: 0x1000,
                name: "crash_here",
                module: "/bin/\"app\"",
            }),
        };
        record.frames[1] = Frame {
            raw: RawFrame {
                ip: 0x2004,
                sp: 0x7ff8,
                symbol_address: 0x2000,
            },
            symbol: None,
        };
        record.num_frames = 2;
        record
    }

    #[test]
    fn test_emit_crashreport_parts() {
        let boundary = "------CrashtrackerBoundaryTEST";
        let mut buf = Vec::new();
        emit_crashreport(
            &mut buf,
            boundary,
            r#"{"library_name":"crashtracker"}"#,
            &sample_record(),
        )
        .unwrap();
        let body = String::from_utf8(buf).unwrap();

        assert!(body.starts_with(&format!("--{boundary}\r\n")));
        assert!(body.ends_with(&format!("\r\n--{boundary}--\r\n")));

        let mut report = CrashReport::new();
        let mut names = vec![];
        let closing = format!("--{boundary}--\r\n");
        for part in body
            .trim_end_matches(closing.as_str())
            .split(&format!("--{boundary}\r\n"))
            .skip(1)
        {
            let (headers, content) = part.split_once("\r\n\r\n").unwrap();
            let name = headers
                .split("name=\"")
                .nth(1)
                .and_then(|s| s.split('"').next())
                .unwrap();
            assert!(headers.contains("Content-Type: application/json"));
            let content = content.strip_suffix("\r\n").unwrap();
            report.add_part(name, content.as_bytes());
            names.push(name.to_string());
        }
        assert_eq!(
            names,
            ["metadata", "siginfo", "procinfo", "counters", "stacktrace"]
        );
        assert!(!report.incomplete, "{:?}", report.log_messages);
        assert!(report.has_all_sections());

        let sig_info = report.sig_info.unwrap();
        assert_eq!(sig_info.si_signo, libc::SIGSEGV);
        assert_eq!(sig_info.si_code_human_readable, SiCodes::SEGV_MAPERR);
        assert_eq!(sig_info.si_addr.as_deref(), Some("0x0000000000000000"));
        assert_eq!(report.proc_info.unwrap().tid, 1235);
        assert_eq!(report.counters["profiler_unwinding"], 2);
        assert_eq!(report.counters["reports_in_flight"], 1);

        let stacktrace = report.stacktrace.unwrap();
        assert_eq!(stacktrace.frames.len(), 2);
        assert_eq!(stacktrace.frames[0].ip, "0x1004");
        assert_eq!(stacktrace.frames[0].module.as_deref(), Some("/bin/\"app\""));
        assert_eq!(stacktrace.frames[1].function, None);
        assert!(!stacktrace.truncated);
    }

    #[test]
    fn test_user_sent_siginfo() {
        let mut record = CrashRecord::new(libc::SIGBUS, 0);
        record.si_pid = Some(77);
        let mut buf = Vec::new();
        emit_siginfo(&mut buf, &record).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(value["si_signo_human_readable"], "SIGBUS");
        assert_eq!(value["si_addr"], serde_json::Value::Null);
        assert_eq!(value["si_pid"], 77);
    }
}
