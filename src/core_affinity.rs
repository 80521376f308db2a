//! Process-wide CPU core allocator (§5).
//!
//! Guarantees unique logical-core assignment across decode workers. The
//! mutex is held only around the increment/assign step, never across the
//! pinning syscall itself, let alone I/O.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use log::warn;

static NEXT_CORE: AtomicUsize = AtomicUsize::new(0);
static ASSIGN_LOCK: Mutex<()> = Mutex::new(());

/// Reserve the next unique logical core index for a new decode worker.
/// Does not touch affinity itself; call [`pin_current_thread`] with the
/// result.
pub fn reserve_core() -> usize {
    let _guard = ASSIGN_LOCK.lock().unwrap();
    NEXT_CORE.fetch_add(1, Ordering::SeqCst)
}

/// Pin the calling thread to `core`. Logs a warning and continues
/// unpinned if the core index is out of range or the OS call fails —
/// pinning failure is never fatal (§4.3).
pub fn pin_current_thread(core: usize) {
    let available = available_cores();
    if available == 0 || core >= available {
        warn!(
            "core pinning skipped: core {} requested but only {} available",
            core, available
        );
        return;
    }

    #[cfg(target_os = "linux")]
    {
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut set);
            libc::CPU_SET(core, &mut set);
            let rc = libc::sched_setaffinity(
                0,
                std::mem::size_of::<libc::cpu_set_t>(),
                &set as *const _,
            );
            if rc != 0 {
                warn!(
                    "sched_setaffinity failed for core {}: {}",
                    core,
                    std::io::Error::last_os_error()
                );
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        warn!("core pinning is not implemented on this platform");
    }
}

/// Number of logical cores visible to this process.
pub fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Reset the allocator. Test-only: production code never needs to reuse
/// core indices within a process lifetime.
#[cfg(test)]
pub fn reset_for_test() {
    let _guard = ASSIGN_LOCK.lock().unwrap();
    NEXT_CORE.store(0, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    // Serializes tests touching the process-wide allocator.
    static TEST_LOCK: StdMutex<()> = StdMutex::new(());

    #[test]
    fn reserved_cores_are_unique_across_calls() {
        let _guard = TEST_LOCK.lock().unwrap();
        reset_for_test();
        let a = reserve_core();
        let b = reserve_core();
        let c = reserve_core();
        assert_eq!([a, b, c], [0, 1, 2]);
    }
}
