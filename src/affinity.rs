//! Advisory CPU pinning for bound event loops.
//!
//! Pinning is best-effort: failures are ignored and the loop runs unpinned.

use std::sync::atomic::{AtomicUsize, Ordering};

static NEXT_CPU: AtomicUsize = AtomicUsize::new(0);

/// Pin the calling thread to the next CPU in round-robin order.
///
/// Returns `true` when the pin was applied.
pub fn bind_current_thread() -> bool {
    let cpus = num_cpus::get();
    if cpus == 0 {
        return false;
    }
    let cpu = NEXT_CPU.fetch_add(1, Ordering::Relaxed) % cpus;
    pin_to(cpu)
}

#[cfg(target_os = "linux")]
fn pin_to(cpu: usize) -> bool {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(cpu, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) == 0
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to(_cpu: usize) -> bool {
    false
}
