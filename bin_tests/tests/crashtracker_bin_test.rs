// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(unix)]

use bin_tests::{accept_report, report_listener, wait_with_timeout, ReceivedRequest, APP_TIMEOUT};
use crashtracker::crash_info::{CrashReport, SiCodes, SignalNames};
use std::os::unix::process::ExitStatusExt;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

const TEST_APP: &str = env!("CARGO_BIN_EXE_crashing_test_app");
const TEST_RECEIVER: &str = env!("CARGO_BIN_EXE_crashtracker_receiver");

/// Time allowed for a crash to be reported and the process to die: the send timeout, the
/// watchdog grace period and some slack.
fn crash_bound() -> Duration {
    APP_TIMEOUT + Duration::from_secs(3)
}

fn spawn_app(mode: &str, url: &str) -> Child {
    Command::new(TEST_APP).arg(mode).arg(url).spawn().unwrap()
}

/// Runs `mode` against a fresh listener, and returns the single report it sent along with
/// the app's pid and how it exited.
fn crash_and_receive(mode: &str) -> (ReceivedRequest, u32, std::process::ExitStatus) {
    let (listener, url) = report_listener().unwrap();
    let mut app = spawn_app(mode, &url);
    let request = bin_tests::timeit!("receive report", {
        accept_report(&listener, crash_bound())
    })
    .unwrap()
    .expect("no crash report received");
    let status = wait_with_timeout(&mut app, crash_bound()).unwrap();
    // Exactly one report.
    assert!(accept_report(&listener, Duration::from_millis(500))
        .unwrap()
        .is_none());
    (request, app.id(), status)
}

fn assert_common_sections(report: &CrashReport, pid: u32) {
    assert!(!report.incomplete, "{:?}", report.log_messages);
    assert!(report.has_all_sections());
    let metadata = report.metadata.as_ref().unwrap();
    assert_eq!(metadata.service.as_deref(), Some("crashing_test_app"));
    assert_eq!(metadata.version.as_deref(), Some("1.0.0"));
    assert_eq!(metadata.runtime.as_deref(), Some("native"));
    assert!(metadata.os.is_some());
    assert_eq!(report.proc_info.as_ref().unwrap().pid, pid as libc::pid_t);
    assert!(report.proc_info.as_ref().unwrap().timestamp().is_some());
    assert_eq!(report.counters["profiler_collecting_sample"], 1);
    assert_eq!(report.counters["profiler_unwinding"], 0);
    assert_eq!(report.counters["reports_in_flight"], 1);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_crash_tracking_segv() {
    let (request, pid, status) = crash_and_receive("segv");
    assert_eq!(status.signal(), Some(libc::SIGSEGV));

    assert_eq!(request.request_line(), "POST /crash HTTP/1.1");
    assert_eq!(request.header("transfer-encoding"), Some("chunked"));
    assert!(request
        .header("user-agent")
        .unwrap()
        .starts_with("crashtracker/"));
    assert!(request.raw_body.ends_with(b"0\r\n\r\n"));

    let report = request.report();
    assert_common_sections(&report, pid);
    let sig_info = report.sig_info.as_ref().unwrap();
    assert_eq!(sig_info.si_signo, libc::SIGSEGV);
    assert_eq!(sig_info.si_signo_human_readable, SignalNames::SIGSEGV);
    assert_eq!(sig_info.si_code_human_readable, SiCodes::SEGV_MAPERR);
    assert_eq!(sig_info.si_addr.as_deref(), Some("0x0000000000000000"));
    assert_eq!(sig_info.si_pid, None);

    let stacktrace = report.stacktrace.as_ref().unwrap();
    assert!(!stacktrace.frames.is_empty());
    let names: Vec<_> = stacktrace.function_names().collect();
    assert!(
        names.iter().any(|n| n.contains("fn2") || n.contains("fn3")),
        "fault marker not found in {names:?}"
    );
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_crash_tracking_spawned_thread() {
    let (request, pid, status) = crash_and_receive("thread");
    assert_eq!(status.signal(), Some(libc::SIGSEGV));
    let report = request.report();
    assert_common_sections(&report, pid);
    let sig_info = report.sig_info.as_ref().unwrap();
    assert_eq!(sig_info.si_signo_human_readable, SignalNames::SIGSEGV);
    assert_eq!(sig_info.si_code_human_readable, SiCodes::SEGV_MAPERR);
    let names: Vec<_> = report.stacktrace.as_ref().unwrap().function_names().collect();
    assert!(
        names.iter().any(|n| n.contains("fn2") || n.contains("fn3")),
        "fault marker not found in {names:?}"
    );
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_crash_tracking_sigbus() {
    let (request, pid, status) = crash_and_receive("sigbus");
    assert_eq!(status.signal(), Some(libc::SIGBUS));
    let report = request.report();
    assert_common_sections(&report, pid);
    let sig_info = report.sig_info.as_ref().unwrap();
    assert_eq!(sig_info.si_signo_human_readable, SignalNames::SIGBUS);
    assert_eq!(sig_info.si_code_human_readable, SiCodes::BUS_ADRERR);
    assert!(sig_info.si_addr.is_some());
}

fn test_kill(mode: &str, signum: libc::c_int, name: SignalNames) {
    let (request, pid, status) = crash_and_receive(mode);
    assert_eq!(status.signal(), Some(signum));
    let report = request.report();
    assert_common_sections(&report, pid);
    let sig_info = report.sig_info.as_ref().unwrap();
    assert_eq!(sig_info.si_signo_human_readable, name);
    assert!(
        matches!(
            sig_info.si_code_human_readable,
            SiCodes::SI_USER | SiCodes::SI_TKILL
        ),
        "{sig_info:?}"
    );
    assert_eq!(sig_info.si_pid, Some(pid as libc::pid_t));
    assert_eq!(sig_info.si_addr, None);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_crash_tracking_kill_segv() {
    test_kill("kill_segv", libc::SIGSEGV, SignalNames::SIGSEGV);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_crash_tracking_kill_sigbus() {
    test_kill("kill_sigbus", libc::SIGBUS, SignalNames::SIGBUS);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_crash_tracking_double_start() {
    let (request, pid, status) = crash_and_receive("double_start");
    assert_eq!(status.signal(), Some(libc::SIGSEGV));
    assert_common_sections(&request.report(), pid);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_crash_tracking_fork() {
    let (request, parent_pid, status) = crash_and_receive("fork");
    // The parent saw its child die by SIGSEGV and exited normally.
    assert_eq!(status.code(), Some(0));

    let report = request.report();
    assert!(!report.incomplete, "{:?}", report.log_messages);
    let proc_info = report.proc_info.as_ref().unwrap();
    assert_ne!(proc_info.pid, parent_pid as libc::pid_t);
    assert_eq!(report.counters["profiler_collecting_sample"], 0);
    assert_eq!(report.counters["profiler_unwinding"], 1);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_crash_tracking_after_shutdown() {
    let (listener, url) = report_listener().unwrap();
    let mut app = spawn_app("shutdown", &url);
    let status = wait_with_timeout(&mut app, crash_bound()).unwrap();
    assert_eq!(status.signal(), Some(libc::SIGSEGV));
    assert!(accept_report(&listener, Duration::from_millis(500))
        .unwrap()
        .is_none());
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_crash_tracking_dead_endpoint() {
    let (listener, url) = report_listener().unwrap();
    drop(listener);

    let start = Instant::now();
    let mut app = spawn_app("dead_endpoint", &url);
    let status = wait_with_timeout(&mut app, crash_bound()).unwrap();
    assert_eq!(status.signal(), Some(libc::SIGSEGV));
    assert!(start.elapsed() < crash_bound());
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_crash_tracking_spawned_receiver() {
    let dir = tempfile::tempdir().unwrap();
    let report_path = dir.path().join("crash.json");
    let mut app = Command::new(TEST_APP)
        .arg("receiver")
        .arg(format!("file://{}", report_path.display()))
        .arg(dir.path())
        .arg(TEST_RECEIVER)
        .spawn()
        .unwrap();
    let status = wait_with_timeout(&mut app, crash_bound()).unwrap();
    assert_eq!(status.signal(), Some(libc::SIGSEGV), "{status:?}");

    // The receiver writes the report before it answers, and the app waits for that answer.
    let deadline = Instant::now() + crash_bound();
    let report: CrashReport = loop {
        if let Ok(data) = std::fs::read(&report_path) {
            if let Ok(report) = serde_json::from_slice(&data) {
                break report;
            }
        }
        assert!(Instant::now() < deadline, "no report written");
        std::thread::sleep(Duration::from_millis(50));
    };
    assert_common_sections(&report, app.id());
    assert_eq!(
        report.sig_info.as_ref().unwrap().si_signo_human_readable,
        SignalNames::SIGSEGV
    );
    let stdout = std::fs::read(dir.path().join("out.stdout")).unwrap();
    assert_eq!(String::from_utf8_lossy(&stdout), "");
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_chain_to_recovering_handler() {
    let (listener, url) = report_listener().unwrap();
    let mut app = spawn_app("chain_recover", &url);
    let request = accept_report(&listener, crash_bound())
        .unwrap()
        .expect("no crash report received");
    // The app outlives the report timeout and the watchdog before exiting on its own.
    let status = wait_with_timeout(&mut app, crash_bound() * 2).unwrap();
    assert_eq!(status.code(), Some(0), "{status:?}");
    assert!(accept_report(&listener, Duration::from_millis(500))
        .unwrap()
        .is_none());

    let report = request.report();
    assert_common_sections(&report, app.id());
    let sig_info = report.sig_info.as_ref().unwrap();
    assert_eq!(sig_info.si_signo_human_readable, SignalNames::SIGSEGV);
    assert_eq!(sig_info.si_code_human_readable, SiCodes::SEGV_ACCERR);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_chain_to_ignored() {
    // An ignored crash signal still ends the process once the report is out.
    let (request, pid, status) = crash_and_receive("chain_ignore");
    assert_eq!(status.signal(), Some(libc::SIGSEGV));
    assert_common_sections(&request.report(), pid);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_chain_reraises_sent_signal() {
    let (listener, url) = report_listener().unwrap();
    let mut app = Command::new(TEST_APP)
        .arg("chain_kill")
        .arg(&url)
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    let request = accept_report(&listener, crash_bound())
        .unwrap()
        .expect("no crash report received");
    let status = wait_with_timeout(&mut app, crash_bound()).unwrap();
    // The previous handler returned, so the sent signal is raised again with its default action.
    assert_eq!(status.signal(), Some(libc::SIGSEGV), "{status:?}");

    let mut stdout = String::new();
    app.stdout.take().unwrap().read_to_string(&mut stdout).unwrap();
    assert_eq!(stdout, "previous handler ran\n");

    let report = request.report();
    assert_common_sections(&report, app.id());
    let sig_info = report.sig_info.as_ref().unwrap();
    assert_eq!(sig_info.si_pid, Some(app.id() as libc::pid_t));
}
