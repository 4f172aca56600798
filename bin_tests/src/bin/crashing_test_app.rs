// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `crashing_test_app <mode> <url> [output_dir] [receiver_binary]`
//!
//! Starts the crashtracker against `url`, then crashes in the way `mode` asks for.

#[cfg(not(unix))]
fn main() {}

#[cfg(unix)]
fn main() -> anyhow::Result<()> {
    unix::main()
}

#[cfg(unix)]
mod unix {
    use anyhow::Context;
    use bin_tests::APP_TIMEOUT;
    use crashtracker::{self as ct, OpTypes, ResolveFrames};
    use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
    use std::env;
    use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering::SeqCst};
    use std::time::Duration;

    /// Exit code when the app survived something it should have died from.
    const SURVIVED: i32 = 2;
    /// Exit code when the receiver wrote to its output files during a clean start.
    const NOISY_RECEIVER: i32 = 3;

    #[inline(never)]
    unsafe fn fn3() {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        {
            std::arch::asm!("mov eax, [0]", options(nostack));
        }

        #[cfg(target_arch = "aarch64")]
        {
            std::arch::asm!("mov x0, #0", "ldr x1, [x0]", options(nostack));
        }
    }

    #[inline(never)]
    fn fn2() {
        unsafe { fn3() }
    }

    #[inline(never)]
    fn fn1() {
        fn2()
    }

    /// Writes to a shared mapping of an empty file: the page has no backing, which is SIGBUS.
    #[inline(never)]
    fn sigbus() -> anyhow::Result<()> {
        let file = tempfile::tempfile()?;
        let len = page_size();
        // SAFETY: a fresh shared mapping of a file we own.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                std::os::fd::AsRawFd::as_raw_fd(&file),
                0,
            )
        };
        anyhow::ensure!(ptr != libc::MAP_FAILED, "mmap failed");
        // SAFETY: inside the mapping; faulting is the point.
        unsafe { std::ptr::write_volatile(ptr as *mut u8, 42) };
        Ok(())
    }

    fn page_size() -> usize {
        // SAFETY: no preconditions.
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    fn kill_self(signal: Signal) -> anyhow::Result<()> {
        signal::kill(nix::unistd::getpid(), signal)?;
        // Delivery to another thread may take a moment.
        std::thread::sleep(APP_TIMEOUT);
        Ok(())
    }

    /// Page the `chain_recover` handler makes writable.
    static GUARDED_PAGE: AtomicPtr<libc::c_void> = AtomicPtr::new(std::ptr::null_mut());
    static GUARDED_LEN: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn unprotect_guarded_page(
        _signum: libc::c_int,
        _info: *mut libc::siginfo_t,
        _ucontext: *mut libc::c_void,
    ) {
        // SAFETY: the mapping outlives the process; mprotect is async-signal-safe.
        unsafe {
            libc::mprotect(
                GUARDED_PAGE.load(SeqCst),
                GUARDED_LEN.load(SeqCst),
                libc::PROT_READ | libc::PROT_WRITE,
            );
        }
    }

    /// Writes a marker to stdout and returns.
    extern "C" fn mark_and_return(
        _signum: libc::c_int,
        _info: *mut libc::siginfo_t,
        _ucontext: *mut libc::c_void,
    ) {
        const MARKER: &[u8] = b"previous handler ran\n";
        // SAFETY: write is async-signal-safe.
        unsafe { libc::write(1, MARKER.as_ptr().cast(), MARKER.len()) };
    }

    /// Installs `handler` for SIGSEGV. Must run before `ct::start()` so that it gets chained.
    fn install_previous(handler: SigHandler) -> anyhow::Result<()> {
        let flags = match handler {
            SigHandler::SigAction(_) => SaFlags::SA_SIGINFO,
            _ => SaFlags::empty(),
        };
        let action = SigAction::new(handler, flags, SigSet::empty());
        // SAFETY: the handlers above only make async-signal-safe calls.
        unsafe { signal::sigaction(Signal::SIGSEGV, &action) }?;
        Ok(())
    }

    /// Maps a page without any access rights for the `chain_recover` handler to fix up.
    fn guarded_page() -> anyhow::Result<*mut u8> {
        let len = page_size();
        // SAFETY: fresh anonymous mapping, no preconditions.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        anyhow::ensure!(ptr != libc::MAP_FAILED, "mmap failed");
        GUARDED_LEN.store(len, SeqCst);
        GUARDED_PAGE.store(ptr, SeqCst);
        Ok(ptr.cast())
    }

    fn configure(url: &str) -> anyhow::Result<()> {
        ct::set_url(url.as_bytes())?;
        ct::set_service(b"crashing_test_app")?;
        ct::set_version(b"1.0.0")?;
        ct::set_runtime(b"native")?;
        ct::set_library_version(env!("CARGO_PKG_VERSION").as_bytes())?;
        ct::set_resolve_frames(ResolveFrames::Full)?;
        ct::set_timeout(APP_TIMEOUT)?;
        Ok(())
    }

    #[inline(never)]
    pub fn main() -> anyhow::Result<()> {
        let mut args = env::args().skip(1);
        let mode = args.next().context("Unexpected number of arguments 1")?;
        let url = args.next().context("Unexpected number of arguments 2")?;

        match mode.as_str() {
            "receiver" => {
                let output_dir = args.next().context("Unexpected number of arguments 3")?;
                let receiver = args.next().context("Unexpected number of arguments 4")?;
                let stdout = format!("{output_dir}/out.stdout");
                let stderr = format!("{output_dir}/out.stderr");
                configure(&url)?;
                ct::set_receiver_binary(receiver.as_bytes())?;
                ct::set_stdout_filename(stdout.as_bytes())?;
                ct::set_stderr_filename(stderr.as_bytes())?;
                ct::start()?;
                std::thread::sleep(Duration::from_millis(200));
                let quiet = |path: &str| std::fs::metadata(path).map_or(false, |m| m.len() == 0);
                if !quiet(&stdout) || !quiet(&stderr) {
                    std::process::exit(NOISY_RECEIVER);
                }
            }
            "chain_recover" => {
                install_previous(SigHandler::SigAction(unprotect_guarded_page))?;
                configure(&url)?;
                ct::start()?;
            }
            "chain_ignore" => {
                install_previous(SigHandler::SigIgn)?;
                configure(&url)?;
                ct::start()?;
            }
            "chain_kill" => {
                install_previous(SigHandler::SigAction(mark_and_return))?;
                configure(&url)?;
                ct::start()?;
            }
            _ => {
                configure(&url)?;
                ct::start()?;
            }
        }
        ct::begin_op(OpTypes::ProfilerCollectingSample)?;

        match mode.as_str() {
            "segv" | "receiver" | "dead_endpoint" | "chain_ignore" => fn1(),
            "thread" => {
                // Spawned threads run signal handlers on their own, much smaller, altstack.
                let _ = std::thread::spawn(fn1).join();
            }
            "chain_recover" => {
                let page = guarded_page()?;
                // SAFETY: faults, then succeeds once the previous handler unprotects the page.
                unsafe { std::ptr::write_volatile(page, 42) };
                // Outlive the report timeout and the watchdog: neither may kill us now.
                std::thread::sleep(APP_TIMEOUT + Duration::from_secs(2));
                ct::end_op(OpTypes::ProfilerCollectingSample)?;
                std::process::exit(0);
            }
            "chain_kill" => kill_self(Signal::SIGSEGV)?,
            "double_start" => {
                ct::start()?;
                ct::start_with_url(url.as_bytes())?;
                fn1()
            }
            "sigbus" => sigbus()?,
            "kill_segv" => kill_self(Signal::SIGSEGV)?,
            "kill_sigbus" => kill_self(Signal::SIGBUS)?,
            "fork" => {
                // SAFETY: the child only crashes.
                match unsafe { nix::unistd::fork() }? {
                    nix::unistd::ForkResult::Child => {
                        ct::on_fork();
                        ct::begin_op(OpTypes::ProfilerUnwinding)?;
                        fn1();
                    }
                    nix::unistd::ForkResult::Parent { child } => {
                        let status = nix::sys::wait::waitpid(child, None)?;
                        let died_by_segv = matches!(
                            status,
                            nix::sys::wait::WaitStatus::Signaled(_, Signal::SIGSEGV, _)
                        );
                        ct::shutdown()?;
                        std::process::exit(if died_by_segv { 0 } else { 1 });
                    }
                }
            }
            "shutdown" => {
                // Crash handling is off again: the default action kills us, nothing is sent.
                ct::shutdown()?;
                fn1()
            }
            other => anyhow::bail!("Unknown mode {other}"),
        }
        std::process::exit(SURVIVED);
    }
}
