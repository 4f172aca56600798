// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use super::crash_handler::handle_posix_sigaction;
use crate::crash_info::{signal_from_signum, translate_si_code};
use libc::{
    c_void, mmap, sigaltstack, siginfo_t, MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_NONE, PROT_READ,
    PROT_WRITE, SIGSTKSZ,
};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet};
use std::ptr;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering::SeqCst;
use thiserror::Error;

/// The signals handled when nothing else is asked for.
pub const DEFAULT_SIGNALS: [libc::c_int; 2] = [libc::SIGSEGV, libc::SIGBUS];

// Linux seems to have the most, supporting up to 64 inclusive
// https://man7.org/linux/man-pages/man7/signal.7.html
const MAX_SIGNALS: usize = 65;
static mut HANDLERS: [Option<(signal::Signal, SigAction)>; MAX_SIGNALS] = [None; MAX_SIGNALS];

const UNREGISTERED: u8 = 0;
const REGISTERING: u8 = 1;
const REGISTERED: u8 = 2;
const RESTORING: u8 = 3;
/// Guards `HANDLERS`: it is only written while this is `REGISTERING` or `RESTORING`, and only
/// read by the signal handler while it is `REGISTERED`.
static STATE: AtomicU8 = AtomicU8::new(UNREGISTERED);

#[derive(Debug, Error)]
pub enum SignalHandlerError {
    #[error("Crash handlers are already registered")]
    AlreadyRegistered,
    #[error("Crash handlers are not registered")]
    NotRegistered,
    #[error("Unexpected signal number {0}")]
    InvalidSignal(libc::c_int),
    #[error("Unable to register handler for signal {signum}: {source}")]
    Register {
        signum: libc::c_int,
        source: nix::Error,
    },
    #[error("Unable to restore handler for signal {signum}: {source}")]
    Restore {
        signum: libc::c_int,
        source: nix::Error,
    },
    #[error("Failed to set up an alternative signal stack: {0}")]
    AltStack(nix::Error),
}

/// Registers UNIX signal handlers to detect program crashes, saving the previous handlers so
/// that they can be chained to and restored.
///
/// SAFETY:
///     Crash-tracking functions are not guaranteed to be reentrant.
///     No other crash-handler functions should be called concurrently.
/// ATOMICITY:
///     Setting the crash handler itself is not an atomic operation and hence it is possible that a
///     concurrent operation could see partial execution of this function.
///     A crash during this window finds `STATE` still `REGISTERING`, and takes the default
///     action instead of chaining.
pub fn register_crash_handlers(
    signals: &[libc::c_int],
    use_alt_stack: bool,
) -> Result<(), SignalHandlerError> {
    for signum in signals {
        if *signum <= 0 || *signum >= MAX_SIGNALS as libc::c_int {
            return Err(SignalHandlerError::InvalidSignal(*signum));
        }
    }
    STATE
        .compare_exchange(UNREGISTERED, REGISTERING, SeqCst, SeqCst)
        .map_err(|_| SignalHandlerError::AlreadyRegistered)?;

    for signum in signals {
        // Safety: `STATE` is `REGISTERING`, so nothing else touches `HANDLERS`.
        match unsafe { register_signal_handler(*signum, use_alt_stack) } {
            Ok(handler) => unsafe { HANDLERS[*signum as usize] = Some(handler) },
            Err(e) => {
                // Leave the process the way we found it.
                let _ = unsafe { restore_registered() };
                STATE.store(UNREGISTERED, SeqCst);
                return Err(e);
            }
        }
    }
    STATE.store(REGISTERED, SeqCst);
    Ok(())
}

/// Puts back the handlers that were in place before [`register_crash_handlers`].
pub fn restore_old_handlers() -> Result<(), SignalHandlerError> {
    STATE
        .compare_exchange(REGISTERED, RESTORING, SeqCst, SeqCst)
        .map_err(|_| SignalHandlerError::NotRegistered)?;
    // Safety: `STATE` is `RESTORING`, so nothing else touches `HANDLERS`.
    let rval = unsafe { restore_registered() };
    STATE.store(UNREGISTERED, SeqCst);
    rval
}

pub fn handlers_registered() -> bool {
    STATE.load(SeqCst) == REGISTERED
}

/// SAFETY: the caller must have exclusive access to `HANDLERS`.
unsafe fn restore_registered() -> Result<(), SignalHandlerError> {
    let mut first_error = None;
    for index in 0..MAX_SIGNALS {
        let Some((signal, old_action)) = (unsafe { HANDLERS[index] }) else {
            continue;
        };
        unsafe { HANDLERS[index] = None };
        if let Err(source) = unsafe { signal::sigaction(signal, &old_action) } {
            first_error.get_or_insert(SignalHandlerError::Restore {
                signum: signal as libc::c_int,
                source,
            });
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// Resets `signum` to its default action and raises it again, so that the process terminates
/// exactly as it would have without a crash handler (including a core dump, where enabled).
///
/// SIGNAL SAFETY:
///     Only `sigaction` and `raise`.
pub(crate) fn terminate_with_default(signum: libc::c_int) {
    // SAFETY: a zeroed sigaction with SIG_DFL is a valid argument.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = libc::SIG_DFL;
        libc::sigaction(signum, &action, ptr::null_mut());
        libc::raise(signum);
    }
}

/// Once we've handled the signal, chain to any previous handlers.
///
/// A default or ignoring previous disposition both end in the default action: a crash signal
/// must terminate the process. A signal sent by another process doesn't come back when a
/// handler returns, so if the chained handler returned without exiting, it is re-raised with
/// the default action as well.
///
/// SAFETY:
///     `sig_info` and `ucontext` must be the arguments the kernel passed to the handler.
pub(crate) unsafe fn chain_signal_handler(
    signum: libc::c_int,
    sig_info: *mut siginfo_t,
    ucontext: *mut c_void,
) {
    if STATE.load(SeqCst) != REGISTERED || signum <= 0 || signum >= MAX_SIGNALS as libc::c_int {
        terminate_with_default(signum);
        return;
    }
    // SAFETY: `STATE` is `REGISTERED`, so no code is mutating `HANDLERS`.
    let Some((_, old_action)) = (unsafe { HANDLERS[signum as usize] }) else {
        terminate_with_default(signum);
        return;
    };
    // How we chain depends on what kind of handler we're chaining to.
    // https://www.gnu.org/software/libc/manual/html_node/Signal-Handling.html
    // https://man7.org/linux/man-pages/man2/sigaction.2.html
    match old_action.handler() {
        SigHandler::SigDfl | SigHandler::SigIgn => {
            terminate_with_default(signum);
            return;
        }
        SigHandler::Handler(f) => f(signum),
        SigHandler::SigAction(f) => f(signum, sig_info, ucontext),
    }
    let si_code = if sig_info.is_null() {
        0
    } else {
        unsafe { (*sig_info).si_code }
    };
    if translate_si_code(signum, si_code).is_user_sent() {
        terminate_with_default(signum);
    }
    // Otherwise returning re-executes the faulting instruction under whatever disposition the
    // chained handler left behind.
}

/// Size of the alternate stack mapping, excluding its guard page.
fn alt_stack_size() -> usize {
    // At least 16 pages: the default SIGSTKSZ of 8KB is not enough for a stack walk plus the
    // on-stack crash record.
    std::cmp::max(SIGSTKSZ, 16 * page_size::get())
}

/// Allocates a signal altstack for the calling thread, and puts a guard page at the end.
/// Keeps an existing altstack if it is already large enough.
/// Inspired by https://github.com/rust-lang/rust/pull/69969/files
pub fn create_alt_stack() -> Result<(), SignalHandlerError> {
    let size = alt_stack_size();

    let mut current: libc::stack_t = unsafe { std::mem::zeroed() };
    // SAFETY: a null new stack only queries the current one.
    if unsafe { sigaltstack(ptr::null(), &mut current) } == 0
        && current.ss_flags & libc::SS_DISABLE == 0
        && current.ss_size >= size
    {
        return Ok(());
    }

    let page_size = page_size::get();
    // SAFETY: anonymous private mapping, no preconditions.
    let stackp = unsafe {
        mmap(
            ptr::null_mut(),
            size + page_size,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANON,
            -1,
            0,
        )
    };
    if stackp == MAP_FAILED {
        return Err(SignalHandlerError::AltStack(nix::Error::last()));
    }
    // SAFETY: the first page belongs to the mapping made above.
    if unsafe { libc::mprotect(stackp, page_size, PROT_NONE) } != 0 {
        return Err(SignalHandlerError::AltStack(nix::Error::last()));
    }
    let stack = libc::stack_t {
        // SAFETY: still inside the mapping.
        ss_sp: unsafe { stackp.add(page_size) },
        ss_flags: 0,
        ss_size: size,
    };
    // SAFETY: `stack` describes a live mapping that is never unmapped.
    if unsafe { sigaltstack(&stack, ptr::null_mut()) } != 0 {
        return Err(SignalHandlerError::AltStack(nix::Error::last()));
    }
    Ok(())
}

unsafe fn register_signal_handler(
    signum: libc::c_int,
    use_alt_stack: bool,
) -> Result<(signal::Signal, SigAction), SignalHandlerError> {
    let signal_type =
        signal_from_signum(signum).map_err(|_| SignalHandlerError::InvalidSignal(signum))?;

    // Running on the altstack is what lets a stack overflow be reported at all. Some runtimes
    // install an altstack of their own and expect it to be used, so using it is decided
    // separately from creating it.
    let extra_saflags = if use_alt_stack {
        SaFlags::SA_ONSTACK
    } else {
        SaFlags::empty()
    };

    let sig_action = SigAction::new(
        SigHandler::SigAction(handle_posix_sigaction),
        SaFlags::SA_NODEFER | extra_saflags,
        SigSet::empty(),
    );

    let old_handler = unsafe { signal::sigaction(signal_type, &sig_action) }
        .map_err(|source| SignalHandlerError::Register { signum, source })?;
    Ok((signal_type, old_handler))
}
