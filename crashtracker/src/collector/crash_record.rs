// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::counters::{snapshot_counters, NUM_OP_TYPES};
use super::frame_resolver::{resolve, walk_stack, Frame, RawFrame, SymbolTable};
use crate::crash_info::translate_si_code;
use crate::shared::configuration::ResolveFrames;
use crate::shared::constants::DD_CRASHTRACK_MAX_FRAMES;
use libc::{c_int, pid_t, siginfo_t};

/// Everything the crash handler knows about a crash, in a fixed-size layout so that it can
/// live on the (alternate) signal stack. Strings are only ever borrowed from the preloaded
/// [`SymbolTable`].
#[derive(Debug, Clone)]
pub struct CrashRecord<'a> {
    pub signum: c_int,
    pub si_code: c_int,
    /// Faulting address; only filled for kernel generated faults.
    pub si_addr: Option<usize>,
    /// Sender of a `kill`/`tgkill`/`sigqueue` signal.
    pub si_pid: Option<pid_t>,
    pub pid: pid_t,
    pub tid: i64,
    pub timestamp_secs: i64,
    pub timestamp_nanos: i64,
    pub frames: [Frame<'a>; DD_CRASHTRACK_MAX_FRAMES],
    pub num_frames: usize,
    pub frames_truncated: bool,
    pub counters: [i64; NUM_OP_TYPES],
    pub reports_in_flight: u64,
}

impl<'a> CrashRecord<'a> {
    /// A record for `signum` with no process, timing or frame information yet.
    pub const fn new(signum: c_int, si_code: c_int) -> Self {
        Self {
            signum,
            si_code,
            si_addr: None,
            si_pid: None,
            pid: 0,
            tid: 0,
            timestamp_secs: 0,
            timestamp_nanos: 0,
            frames: [Frame::EMPTY; DD_CRASHTRACK_MAX_FRAMES],
            num_frames: 0,
            frames_truncated: false,
            counters: [0; NUM_OP_TYPES],
            reports_in_flight: 0,
        }
    }

    pub fn frames(&self) -> &[Frame<'a>] {
        &self.frames[..self.num_frames.min(DD_CRASHTRACK_MAX_FRAMES)]
    }

    /// Fills this record from inside the signal handler, in place, using `raw` as scratch
    /// space for the stack walk. Frames beyond `num_frames` are left as they were.
    ///
    /// SAFETY:
    ///     `sig_info` must be null or point to the `siginfo_t` the kernel handed the handler.
    ///     Must not run concurrently with another capture; see [`walk_stack`].
    /// SIGNAL SAFETY:
    ///     Only raw syscalls, atomic loads, an unsynchronized stack walk and a binary search
    ///     over `table`. Nothing allocates, and no frame-sized value is built on the stack.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn capture(
        &mut self,
        signum: c_int,
        sig_info: *const siginfo_t,
        fault_ip: usize,
        resolve_frames: ResolveFrames,
        table: Option<&'a SymbolTable>,
        reports_in_flight: u64,
        raw: &mut [RawFrame],
    ) {
        self.signum = signum;
        self.si_code = if sig_info.is_null() {
            0
        } else {
            unsafe { (*sig_info).si_code }
        };
        self.si_addr = None;
        self.si_pid = None;
        if !sig_info.is_null() {
            if translate_si_code(signum, self.si_code).is_user_sent() {
                self.si_pid = Some(unsafe { sender_pid(sig_info) });
            } else {
                // https://man7.org/linux/man-pages/man2/sigaction.2.html
                // SIGILL, SIGFPE, SIGSEGV, SIGBUS, and SIGTRAP fill in si_addr with the address
                // of the fault.
                self.si_addr = match signum {
                    libc::SIGILL | libc::SIGFPE | libc::SIGSEGV | libc::SIGBUS | libc::SIGTRAP => {
                        Some(unsafe { (*sig_info).si_addr() as usize })
                    }
                    _ => None,
                };
            }
        }

        self.pid = unsafe { libc::getpid() };
        self.tid = current_tid();
        (self.timestamp_secs, self.timestamp_nanos) = realtime_now();
        self.counters = snapshot_counters();
        self.reports_in_flight = reports_in_flight;

        let (walked, truncated) = unsafe { walk_stack(fault_ip, raw) };
        self.num_frames = resolve(&raw[..walked], resolve_frames, table, &mut self.frames);
        self.frames_truncated = truncated;
    }
}

#[cfg(target_os = "linux")]
unsafe fn sender_pid(sig_info: *const siginfo_t) -> pid_t {
    unsafe { (*sig_info).si_pid() }
}

#[cfg(not(target_os = "linux"))]
unsafe fn sender_pid(sig_info: *const siginfo_t) -> pid_t {
    unsafe { (*sig_info).si_pid }
}

/// Kernel thread id of the calling thread.
#[cfg(target_os = "linux")]
pub fn current_tid() -> i64 {
    // SAFETY: gettid has no preconditions and cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) }
}

#[cfg(target_os = "macos")]
pub fn current_tid() -> i64 {
    let mut tid: u64 = 0;
    // SAFETY: a null thread means the calling thread.
    let rval = unsafe { libc::pthread_threadid_np(0, &mut tid) };
    if rval == 0 {
        tid as i64
    } else {
        -1
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn current_tid() -> i64 {
    -1
}

fn realtime_now() -> (i64, i64) {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // clock_gettime is async-signal-safe.
    // https://man7.org/linux/man-pages/man7/signal-safety.7.html
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) } != 0 {
        return (0, 0);
    }
    (ts.tv_sec as i64, ts.tv_nsec as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_capture_without_siginfo() {
        let mut record = CrashRecord::new(0, 0);
        let mut raw = [RawFrame::EMPTY; DD_CRASHTRACK_MAX_FRAMES];
        unsafe {
            record.capture(
                libc::SIGSEGV,
                std::ptr::null(),
                0,
                ResolveFrames::Fast,
                None,
                1,
                &mut raw,
            )
        };
        assert_eq!(record.signum, libc::SIGSEGV);
        assert_eq!(record.si_addr, None);
        assert_eq!(record.si_pid, None);
        assert_eq!(record.pid, std::process::id() as pid_t);
        assert!(record.tid > 0);
        assert!(record.timestamp_secs > 1_600_000_000);
        assert_eq!(record.reports_in_flight, 1);
        assert!(record.num_frames > 0);
        assert!(record.frames().iter().all(|f| f.symbol.is_none()));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_capture_user_sent_signal() {
        let mut info: siginfo_t = unsafe { std::mem::zeroed() };
        info.si_signo = libc::SIGBUS;
        #[cfg(target_os = "linux")]
        let user_code = 0;
        #[cfg(not(target_os = "linux"))]
        let user_code = 0x10001;
        info.si_code = user_code;
        let mut record = CrashRecord::new(0, 0);
        let mut raw = [RawFrame::EMPTY; DD_CRASHTRACK_MAX_FRAMES];
        unsafe { record.capture(libc::SIGBUS, &info, 0, ResolveFrames::Fast, None, 1, &mut raw) };
        assert_eq!(record.si_code, user_code);
        assert_eq!(record.si_addr, None);
        assert!(record.si_pid.is_some());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_capture_reuses_record() {
        let mut record = CrashRecord::new(0, 0);
        let mut raw = [RawFrame::EMPTY; DD_CRASHTRACK_MAX_FRAMES];
        let mut info: siginfo_t = unsafe { std::mem::zeroed() };
        info.si_signo = libc::SIGBUS;
        #[cfg(not(target_os = "linux"))]
        {
            info.si_code = 0x10001;
        }
        unsafe { record.capture(libc::SIGBUS, &info, 0, ResolveFrames::Fast, None, 1, &mut raw) };
        assert!(record.si_pid.is_some());

        // A second capture into the same storage must not keep fields from the first.
        unsafe {
            record.capture(
                libc::SIGSEGV,
                std::ptr::null(),
                0,
                ResolveFrames::Fast,
                None,
                2,
                &mut raw,
            )
        };
        assert_eq!(record.signum, libc::SIGSEGV);
        assert_eq!(record.si_code, 0);
        assert_eq!(record.si_pid, None);
        assert_eq!(record.reports_in_flight, 2);
        assert!(record.num_frames > 0);
    }

    #[test]
    fn test_new_is_empty() {
        let record = CrashRecord::new(libc::SIGSEGV, 1);
        assert!(record.frames().is_empty());
        assert_eq!(record.counters, [0; NUM_OP_TYPES]);
    }
}
