// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::crash_record::CrashRecord;
use super::frame_resolver::{RawFrame, SymbolTable};
use super::signal_handler_manager::{chain_signal_handler, terminate_with_default};
use super::transport::{ChunkBuffer, PreparedTransport, TransportError};
use crate::shared::configuration::ResolveFrames;
use crate::shared::constants::{DD_CRASHTRACK_MAX_FRAMES, DD_CRASHTRACK_WATCHDOG_GRACE};
use crate::shared::timeout::TimeoutManager;
use libc::{c_void, siginfo_t, ucontext_t};
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64};
use std::time::Duration;

// Note that this file makes use the following async-signal safe functions in a signal handler.
// <https://man7.org/linux/man-pages/man7/signal-safety.7.html>
// - alarm
// - clock_gettime
// - close
// - connect
// - getpid
// - poll
// - raise
// - send
// - shutdown
// - sigaction
// - socket

/// Everything the handler needs, prepared by `start()`.
#[derive(Debug)]
pub struct HandlerState {
    pub transport: PreparedTransport,
    pub resolve_frames: ResolveFrames,
    pub symbols: Option<&'static SymbolTable>,
    pub timeout: Duration,
}

// Using mutexes inside a signal handler is not allowed, so use `AtomicPtr`
// instead to get atomicity.
// This should always be either: null_mut, or `Box::into_raw()`
static HANDLER_STATE: AtomicPtr<HandlerState> = AtomicPtr::new(ptr::null_mut());

/// Set by the first handler invocation. Only cleared by [`reset_after_fork`]: at most one report
/// per process.
static HANDLING: AtomicBool = AtomicBool::new(false);
/// Every entry into the handler, including ones that lost the race for `HANDLING`.
static REPORTS_IN_FLIGHT: AtomicU64 = AtomicU64::new(0);

/// Storage for the one capture that wins `HANDLING`. It must not live on the handler's stack:
/// threads spawned by std run signal handlers on an altstack of a couple of pages, far smaller
/// than a full record.
struct Scratch {
    record: CrashRecord<'static>,
    raw_frames: [RawFrame; DD_CRASHTRACK_MAX_FRAMES],
    chunk: ChunkBuffer,
}

static mut SCRATCH: Scratch = Scratch {
    record: CrashRecord::new(0, 0),
    raw_frames: [RawFrame::EMPTY; DD_CRASHTRACK_MAX_FRAMES],
    chunk: ChunkBuffer::new(),
};

#[derive(Debug, thiserror::Error)]
pub enum CrashHandlerError {
    #[error("No crash handler state available")]
    NoState,
    #[error("Failed to send crash report: {0}")]
    Transport(#[from] TransportError),
}

/// Replaces the state used by the crash handler.
///
/// ATOMICITY:
///     This function uses a swap on an atomic pointer.
pub fn update_state(state: HandlerState) {
    let old = HANDLER_STATE.swap(Box::into_raw(Box::new(state)), SeqCst);
    if !old.is_null() {
        // Safety: This can only come from a box above.
        unsafe { drop(Box::from_raw(old)) };
    }
}

/// Drops the state; a handler that fires afterwards sends nothing.
pub fn clear_state() {
    let old = HANDLER_STATE.swap(ptr::null_mut(), SeqCst);
    if !old.is_null() {
        // Safety: This can only come from a box above.
        unsafe { drop(Box::from_raw(old)) };
    }
}

pub fn reports_in_flight() -> u64 {
    REPORTS_IN_FLIGHT.load(SeqCst)
}

/// Lets a freshly forked child report its own crash, even if its parent had already handled a
/// signal (a chained handler may have recovered from it).
///
/// ATOMICITY:
///     Two independent stores. Only call this in the child, before it can crash.
pub fn reset_after_fork() {
    REPORTS_IN_FLIGHT.store(0, SeqCst);
    HANDLING.store(false, SeqCst);
}

pub(crate) extern "C" fn handle_posix_sigaction(
    signum: i32,
    sig_info: *mut siginfo_t,
    ucontext: *mut c_void,
) {
    let in_flight = REPORTS_IN_FLIGHT.fetch_add(1, SeqCst) + 1;

    if HANDLING
        .compare_exchange(false, true, SeqCst, SeqCst)
        .is_err()
    {
        // A fault inside the handler itself, or a second thread crashing while a report is
        // underway: no queuing, no recursion, just the default action.
        terminate_with_default(signum);
        return;
    }

    // Failures are swallowed: whatever happens, the process goes on to die by this signal.
    let _ = handle_posix_signal_impl(signum, sig_info, ucontext as *const ucontext_t, in_flight);
    // SAFETY: these are the kernel's arguments to this handler.
    unsafe { chain_signal_handler(signum, sig_info, ucontext) };
}

fn handle_posix_signal_impl(
    signum: libc::c_int,
    sig_info: *const siginfo_t,
    ucontext: *const ucontext_t,
    in_flight: u64,
) -> Result<(), CrashHandlerError> {
    let state_ptr = HANDLER_STATE.load(SeqCst);
    if state_ptr.is_null() {
        return Err(CrashHandlerError::NoState);
    }
    // SAFETY: set from `Box::into_raw` and only freed by `update_state`/`clear_state`, which
    // aren't called while a crash is being handled.
    let state = unsafe { &*state_ptr };
    // SAFETY: `HANDLING` guarantees this is the only capture in progress, so nothing else
    // holds a reference into `SCRATCH`.
    let scratch = unsafe { &mut *ptr::addr_of_mut!(SCRATCH) };

    let watchdog = Watchdog::arm(state.timeout);
    let timeout_manager = TimeoutManager::new(state.timeout);

    // SAFETY: `sig_info` comes from the kernel, and `HANDLING` serializes captures.
    unsafe {
        scratch.record.capture(
            signum,
            sig_info,
            extract_ip(ucontext),
            state.resolve_frames,
            state.symbols,
            in_flight,
            &mut scratch.raw_frames,
        )
    };
    let sent = state
        .transport
        .send(&scratch.record, &mut scratch.chunk, &timeout_manager);
    watchdog.disarm();
    sent?;
    Ok(())
}

/// Guarantees termination if sending hangs somewhere `poll` timeouts don't cover: SIGALRM
/// with its default action kills the process.
///
/// The alarm and the SIGALRM disposition in place before [`Watchdog::arm`] are put back by
/// [`Watchdog::disarm`], so a chained handler that recovers from the fault leaves the process
/// as it found it.
struct Watchdog {
    old_action: libc::sigaction,
    old_alarm: libc::c_uint,
}

impl Watchdog {
    fn arm(timeout: Duration) -> Self {
        let total = timeout + DD_CRASHTRACK_WATCHDOG_GRACE;
        let secs = total.as_secs() + u64::from(total.subsec_nanos() > 0);
        // SAFETY: zeroed sigactions are valid arguments; alarm has no preconditions.
        unsafe {
            let mut old_action: libc::sigaction = std::mem::zeroed();
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = libc::SIG_DFL;
            libc::sigaction(libc::SIGALRM, &action, &mut old_action);
            let old_alarm = libc::alarm(secs.min(libc::c_uint::MAX as u64) as libc::c_uint);
            Self {
                old_action,
                old_alarm,
            }
        }
    }

    /// Cancels the alarm, then restores the previous SIGALRM action and any alarm that was
    /// pending before ours.
    fn disarm(self) {
        // SAFETY: `old_action` was filled in by the kernel in `arm`.
        unsafe {
            libc::alarm(0);
            libc::sigaction(libc::SIGALRM, &self.old_action, ptr::null_mut());
            if self.old_alarm > 0 {
                libc::alarm(self.old_alarm);
            }
        }
    }
}

/// The instruction pointer at the time of the fault.
fn extract_ip(ucontext: *const ucontext_t) -> usize {
    if ucontext.is_null() {
        return 0;
    }
    // SAFETY: non-null, and handed to us by the kernel.
    unsafe { ip_from_context(ucontext) }
}

#[cfg(all(target_os = "macos", target_arch = "x86_64"))]
unsafe fn ip_from_context(ucontext: *const ucontext_t) -> usize {
    unsafe { (*(*ucontext).uc_mcontext).__ss.__rip as usize }
}

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
unsafe fn ip_from_context(ucontext: *const ucontext_t) -> usize {
    unsafe { (*(*ucontext).uc_mcontext).__ss.__pc as usize }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn ip_from_context(ucontext: *const ucontext_t) -> usize {
    unsafe { (*ucontext).uc_mcontext.gregs[libc::REG_RIP as usize] as usize }
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
unsafe fn ip_from_context(ucontext: *const ucontext_t) -> usize {
    unsafe { (*ucontext).uc_mcontext.pc as usize }
}

// Unknown layout: walk the whole stack instead of skipping to the faulting frame.
#[cfg(not(any(
    all(target_os = "macos", any(target_arch = "x86_64", target_arch = "aarch64")),
    all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64"))
)))]
unsafe fn ip_from_context(_ucontext: *const ucontext_t) -> usize {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_ip_null() {
        assert_eq!(extract_ip(ptr::null()), 0);
    }

    extern "C" fn noop_sigalrm(_: libc::c_int) {}

    fn current_sigalrm_handler() -> libc::sighandler_t {
        let mut current: libc::sigaction = unsafe { std::mem::zeroed() };
        assert_eq!(
            unsafe { libc::sigaction(libc::SIGALRM, ptr::null(), &mut current) },
            0
        );
        current.sa_sigaction
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_watchdog_restores_sigalrm() {
        let noop = noop_sigalrm as extern "C" fn(libc::c_int) as libc::sighandler_t;
        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        action.sa_sigaction = noop;
        let mut original: libc::sigaction = unsafe { std::mem::zeroed() };
        unsafe { libc::sigaction(libc::SIGALRM, &action, &mut original) };
        // An alarm the application had pending before the crash.
        unsafe { libc::alarm(100) };

        let watchdog = Watchdog::arm(Duration::from_secs(3));
        assert_eq!(current_sigalrm_handler(), libc::SIG_DFL);
        watchdog.disarm();

        assert_eq!(current_sigalrm_handler(), noop);
        // Cancelling returns what was left: the application's alarm, not the watchdog's.
        let remaining = unsafe { libc::alarm(0) };
        assert!(remaining > 90 && remaining <= 100, "{remaining}");
        unsafe { libc::sigaction(libc::SIGALRM, &original, ptr::null_mut()) };
    }

    #[test]
    fn test_reset_after_fork() {
        HANDLING.store(true, SeqCst);
        REPORTS_IN_FLIGHT.store(3, SeqCst);
        reset_after_fork();
        assert!(!HANDLING.load(SeqCst));
        assert_eq!(reports_in_flight(), 0);
    }
}
