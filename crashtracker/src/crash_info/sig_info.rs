// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// The `siginfo` part of a report, as decoded by the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigInfo {
    pub si_signo: libc::c_int,
    pub si_signo_human_readable: SignalNames,
    pub si_code: libc::c_int,
    pub si_code_human_readable: SiCodes,
    /// Faulting address, as a hex string. Absent for signals sent by a process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub si_addr: Option<String>,
    /// Sender of a signal delivered by `kill`/`tgkill`/`sigqueue`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub si_pid: Option<libc::pid_t>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms, non_camel_case_types)]
#[repr(C)]
/// See <https://man7.org/linux/man-pages/man7/signal.7.html>
pub enum SignalNames {
    SIGHUP,
    SIGINT,
    SIGQUIT,
    SIGILL,
    SIGTRAP,
    SIGABRT,
    SIGBUS,
    SIGFPE,
    SIGKILL,
    SIGUSR1,
    SIGSEGV,
    SIGUSR2,
    SIGPIPE,
    SIGALRM,
    SIGTERM,
    SIGSYS,
    UNKNOWN,
}

impl SignalNames {
    /// Static name, usable from a signal handler.
    pub const fn as_str(&self) -> &'static str {
        match self {
            SignalNames::SIGHUP => "SIGHUP",
            SignalNames::SIGINT => "SIGINT",
            SignalNames::SIGQUIT => "SIGQUIT",
            SignalNames::SIGILL => "SIGILL",
            SignalNames::SIGTRAP => "SIGTRAP",
            SignalNames::SIGABRT => "SIGABRT",
            SignalNames::SIGBUS => "SIGBUS",
            SignalNames::SIGFPE => "SIGFPE",
            SignalNames::SIGKILL => "SIGKILL",
            SignalNames::SIGUSR1 => "SIGUSR1",
            SignalNames::SIGSEGV => "SIGSEGV",
            SignalNames::SIGUSR2 => "SIGUSR2",
            SignalNames::SIGPIPE => "SIGPIPE",
            SignalNames::SIGALRM => "SIGALRM",
            SignalNames::SIGTERM => "SIGTERM",
            SignalNames::SIGSYS => "SIGSYS",
            SignalNames::UNKNOWN => "UNKNOWN",
        }
    }
}

impl From<libc::c_int> for SignalNames {
    fn from(value: libc::c_int) -> Self {
        match value {
            libc::SIGHUP => SignalNames::SIGHUP,
            libc::SIGINT => SignalNames::SIGINT,
            libc::SIGQUIT => SignalNames::SIGQUIT,
            libc::SIGILL => SignalNames::SIGILL,
            libc::SIGTRAP => SignalNames::SIGTRAP,
            libc::SIGABRT => SignalNames::SIGABRT,
            libc::SIGBUS => SignalNames::SIGBUS,
            libc::SIGFPE => SignalNames::SIGFPE,
            libc::SIGKILL => SignalNames::SIGKILL,
            libc::SIGUSR1 => SignalNames::SIGUSR1,
            libc::SIGSEGV => SignalNames::SIGSEGV,
            libc::SIGUSR2 => SignalNames::SIGUSR2,
            libc::SIGPIPE => SignalNames::SIGPIPE,
            libc::SIGALRM => SignalNames::SIGALRM,
            libc::SIGTERM => SignalNames::SIGTERM,
            libc::SIGSYS => SignalNames::SIGSYS,
            _ => SignalNames::UNKNOWN,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms, non_camel_case_types)]
#[repr(C)]
/// See <https://man7.org/linux/man-pages/man2/sigaction.2.html>
pub enum SiCodes {
    BUS_ADRALN,
    BUS_ADRERR,
    BUS_MCEERR_AO,
    BUS_MCEERR_AR,
    BUS_OBJERR,
    SEGV_ACCERR,
    SEGV_BNDERR,
    SEGV_MAPERR,
    SEGV_PKUERR,
    SI_ASYNCIO,
    SI_KERNEL,
    SI_MESGQ,
    SI_QUEUE,
    SI_SIGIO,
    SI_TIMER,
    SI_TKILL,
    SI_USER,
    UNKNOWN,
}

impl SiCodes {
    /// Static name, usable from a signal handler.
    pub const fn as_str(&self) -> &'static str {
        match self {
            SiCodes::BUS_ADRALN => "BUS_ADRALN",
            SiCodes::BUS_ADRERR => "BUS_ADRERR",
            SiCodes::BUS_MCEERR_AO => "BUS_MCEERR_AO",
            SiCodes::BUS_MCEERR_AR => "BUS_MCEERR_AR",
            SiCodes::BUS_OBJERR => "BUS_OBJERR",
            SiCodes::SEGV_ACCERR => "SEGV_ACCERR",
            SiCodes::SEGV_BNDERR => "SEGV_BNDERR",
            SiCodes::SEGV_MAPERR => "SEGV_MAPERR",
            SiCodes::SEGV_PKUERR => "SEGV_PKUERR",
            SiCodes::SI_ASYNCIO => "SI_ASYNCIO",
            SiCodes::SI_KERNEL => "SI_KERNEL",
            SiCodes::SI_MESGQ => "SI_MESGQ",
            SiCodes::SI_QUEUE => "SI_QUEUE",
            SiCodes::SI_SIGIO => "SI_SIGIO",
            SiCodes::SI_TIMER => "SI_TIMER",
            SiCodes::SI_TKILL => "SI_TKILL",
            SiCodes::SI_USER => "SI_USER",
            SiCodes::UNKNOWN => "UNKNOWN",
        }
    }

    /// True when the signal was sent by a process rather than raised by a fault.
    /// For these, `si_pid` is meaningful and `si_addr` is not.
    pub const fn is_user_sent(&self) -> bool {
        matches!(
            self,
            SiCodes::SI_USER | SiCodes::SI_QUEUE | SiCodes::SI_TKILL
        )
    }
}

// These are defined in siginfo.h. libc doesn't expose all of them on every target, so the
// common, actionable values are listed here.
#[cfg(target_os = "linux")]
mod codes {
    pub const SI_USER: i32 = 0;
    pub const SI_KERNEL: i32 = 0x80;
    pub const SI_QUEUE: i32 = -1;
    pub const SI_TIMER: i32 = -2;
    pub const SI_MESGQ: i32 = -3;
    pub const SI_ASYNCIO: i32 = -4;
    pub const SI_SIGIO: i32 = -5;
    pub const SI_TKILL: i32 = -6;

    pub const SEGV_MAPERR: i32 = 1;
    pub const SEGV_ACCERR: i32 = 2;
    pub const SEGV_BNDERR: i32 = 3;
    pub const SEGV_PKUERR: i32 = 4;

    pub const BUS_ADRALN: i32 = 1;
    pub const BUS_ADRERR: i32 = 2;
    pub const BUS_OBJERR: i32 = 3;
    pub const BUS_MCEERR_AR: i32 = 4;
    pub const BUS_MCEERR_AO: i32 = 5;
}

#[cfg(not(target_os = "linux"))]
mod codes {
    pub const SI_USER: i32 = 0x10001;
    pub const SI_QUEUE: i32 = 0x10002;
    pub const SI_TIMER: i32 = 0x10003;
    pub const SI_ASYNCIO: i32 = 0x10004;
    pub const SI_MESGQ: i32 = 0x10005;

    pub const SEGV_MAPERR: i32 = 1;
    pub const SEGV_ACCERR: i32 = 2;

    pub const BUS_ADRALN: i32 = 1;
    pub const BUS_ADRERR: i32 = 2;
    pub const BUS_OBJERR: i32 = 3;
}

/// Maps a raw `si_code` to its symbolic name. Fault-specific codes are only meaningful for
/// the signal they belong to, so the signal number is part of the lookup.
pub fn translate_si_code(signum: libc::c_int, si_code: libc::c_int) -> SiCodes {
    use codes::*;
    match si_code {
        SI_USER => return SiCodes::SI_USER,
        SI_QUEUE => return SiCodes::SI_QUEUE,
        SI_TIMER => return SiCodes::SI_TIMER,
        SI_MESGQ => return SiCodes::SI_MESGQ,
        SI_ASYNCIO => return SiCodes::SI_ASYNCIO,
        #[cfg(target_os = "linux")]
        SI_KERNEL => return SiCodes::SI_KERNEL,
        #[cfg(target_os = "linux")]
        SI_SIGIO => return SiCodes::SI_SIGIO,
        #[cfg(target_os = "linux")]
        SI_TKILL => return SiCodes::SI_TKILL,
        _ => {}
    }
    match signum {
        libc::SIGSEGV => match si_code {
            SEGV_MAPERR => SiCodes::SEGV_MAPERR,
            SEGV_ACCERR => SiCodes::SEGV_ACCERR,
            #[cfg(target_os = "linux")]
            SEGV_BNDERR => SiCodes::SEGV_BNDERR,
            #[cfg(target_os = "linux")]
            SEGV_PKUERR => SiCodes::SEGV_PKUERR,
            _ => SiCodes::UNKNOWN,
        },
        libc::SIGBUS => match si_code {
            BUS_ADRALN => SiCodes::BUS_ADRALN,
            BUS_ADRERR => SiCodes::BUS_ADRERR,
            BUS_OBJERR => SiCodes::BUS_OBJERR,
            #[cfg(target_os = "linux")]
            BUS_MCEERR_AR => SiCodes::BUS_MCEERR_AR,
            #[cfg(target_os = "linux")]
            BUS_MCEERR_AO => SiCodes::BUS_MCEERR_AO,
            _ => SiCodes::UNKNOWN,
        },
        _ => SiCodes::UNKNOWN,
    }
}

/// Converts a signum into a Signal.  Can't use the from trait because we don't own either type.
pub fn signal_from_signum(value: libc::c_int) -> anyhow::Result<nix::sys::signal::Signal> {
    nix::sys::signal::Signal::try_from(value)
        .map_err(|_| anyhow::anyhow!("Unexpected signal number {value}"))
}
