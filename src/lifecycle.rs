//! Lifecycle supervisor (C9).
//!
//! Owns the process-wide quit flag and the crash-signal handlers.
//! Interrupt/terminate just flip an atomic the render loop already polls
//! between frames; segmentation/bus/abort run a minimal handler that
//! restores the terminal and the display, then re-raises the signal's
//! default disposition so the process still terminates (and cores) the
//! way the kernel expects.

use std::io;
use std::mem::MaybeUninit;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::info;
use signal_hook::consts::{SIGABRT, SIGBUS, SIGINT, SIGSEGV, SIGTERM};
use signal_hook::SigId;

use crate::display::DisplaySurface;

const CRASH_SIGNALS: [i32; 3] = [SIGSEGV, SIGBUS, SIGABRT];

/// Captured terminal attributes, restored to cooked mode on crash.
struct TerminalGuard {
    fd: i32,
    original: libc::termios,
}

impl TerminalGuard {
    /// `None` when stdin isn't a terminal (headless/CI run) — nothing to
    /// restore in that case.
    fn capture() -> Option<Self> {
        let fd = io::stdin().as_raw_fd();
        let mut termios = MaybeUninit::<libc::termios>::uninit();
        // SAFETY: fd is a valid descriptor; tcgetattr only writes to
        // `termios` on success.
        let ok = unsafe { libc::tcgetattr(fd, termios.as_mut_ptr()) == 0 };
        if !ok {
            return None;
        }
        // SAFETY: tcgetattr succeeded, termios is fully initialized.
        Some(Self {
            fd,
            original: unsafe { termios.assume_init() },
        })
    }

    /// Force cooked mode (canonical input, echo on) regardless of
    /// whatever raw-mode flags the launcher may have set since capture.
    fn restore_cooked(&self) {
        let mut cooked = self.original;
        cooked.c_lflag |= libc::ICANON | libc::ECHO;
        // SAFETY: fd and the termios layout are the ones captured above;
        // tcsetattr on a closing/invalid fd just reports an error.
        unsafe {
            libc::tcsetattr(self.fd, libc::TCSANOW, &cooked);
        }
    }
}

/// Installed signal handlers plus the quit flag the render loop polls.
/// Unregisters every handler on drop.
pub struct Lifecycle {
    quit: Arc<AtomicBool>,
    signal_ids: Vec<SigId>,
}

impl Lifecycle {
    /// `display` is shared with the render loop; the crash handler
    /// locks it with `try_lock` so a signal delivered while the render
    /// thread already holds it can't deadlock against itself.
    pub fn install(display: Arc<Mutex<DisplaySurface>>) -> io::Result<Self> {
        let quit = Arc::new(AtomicBool::new(false));
        let terminal = TerminalGuard::capture();
        let mut signal_ids = Vec::new();

        for &sig in &[SIGINT, SIGTERM] {
            signal_ids.push(signal_hook::flag::register(sig, Arc::clone(&quit))?);
        }

        for &sig in &CRASH_SIGNALS {
            let display = Arc::clone(&display);
            // SAFETY: the registered closure restores process state and
            // re-raises the signal's default handler; it is a
            // best-effort handler, not a strictly POSIX async-signal-safe
            // one (it may lock a mutex and call into libdrm) — an
            // accepted tradeoff documented in the design notes.
            let id = unsafe {
                signal_hook::low_level::register(sig, move || {
                    if let Some(terminal) = terminal.as_ref() {
                        terminal.restore_cooked();
                    }
                    if let Ok(mut display) = display.try_lock() {
                        display.restore();
                    }
                    let _ = signal_hook::low_level::emulate_default_handler(sig);
                })?
            };
            signal_ids.push(id);
        }

        info!(
            "lifecycle supervisor installed: SIGINT/SIGTERM set the quit flag, \
             SIGSEGV/SIGBUS/SIGABRT restore and re-raise"
        );

        Ok(Self { quit, signal_ids })
    }

    /// Shared with the render loop; set by SIGINT/SIGTERM, polled
    /// between frames.
    pub fn quit_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.quit)
    }

    pub fn request_quit(&self) {
        self.quit.store(true, Ordering::Relaxed);
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        for id in self.signal_ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}

/// Module teardown in the documented order: stop workers, close
/// decoders (owned by the workers, dropped with them), free pools,
/// destroy the GPU context, release the display, then flush logs. Each
/// stage is logged at INFO so a crash mid-teardown is attributable.
///
/// `workers` are consumed with [`crate::decode::worker::Worker::shut_down`]
/// before the pools, GPU context, and display are dropped in the order
/// their fields appear in this function — Rust's own closure over owned
/// values makes that ordering explicit rather than relying on struct
/// field declaration order.
pub fn ordered_teardown(
    workers: Vec<crate::decode::worker::Worker>,
    pools: Vec<Arc<crate::pool::Pool>>,
    gpu: crate::gpu::GpuContext,
    display: Arc<Mutex<DisplaySurface>>,
) {
    info!("teardown: stopping {} decode worker(s)", workers.len());
    for worker in workers {
        worker.shut_down();
    }

    info!("teardown: releasing {} pool(s)", pools.len());
    drop(pools);

    info!("teardown: destroying GPU context");
    drop(gpu);

    info!("teardown: releasing display");
    match Arc::try_unwrap(display) {
        Ok(mutex) => drop(mutex.into_inner().unwrap_or_else(|e| e.into_inner())),
        Err(shared) => drop(shared),
    }

    info!("teardown complete");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_quit_is_observed_through_the_shared_flag() {
        let quit = Arc::new(AtomicBool::new(false));
        let lifecycle = Lifecycle {
            quit: Arc::clone(&quit),
            signal_ids: Vec::new(),
        };
        assert!(!quit.load(Ordering::Relaxed));
        lifecycle.request_quit();
        assert!(quit.load(Ordering::Relaxed));
    }
}
