//! Adaptive back-off between empty polls.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Back-off used by an idle worker between empty polls.
///
/// `pause` is called from the owning loop thread only; `unpause` may be
/// called from any thread and is idempotent.
pub trait Pauser: Send + Sync {
    /// Back off once; may spin, yield or park depending on how long the
    /// caller has been idle.
    fn pause(&self);

    /// Rewind the back-off ladder after useful work.
    fn reset(&self);

    /// Wake a parked caller.
    fn unpause(&self);

    /// Number of times `pause` actually parked the calling thread.
    fn count_paused(&self) -> u64;

    /// Total time spent parked.
    fn time_paused(&self) -> Duration;
}

/// Pauser that busy-spins, then yields, then parks with a back-off that
/// doubles from `min_pause` up to `max_pause`.
pub struct LongPauser {
    busy_spins: u32,
    yield_spins: u32,
    min_pause: Duration,
    max_pause: Duration,
    spins: AtomicU32,
    next_pause_ns: AtomicU64,
    wake: AtomicBool,
    lock: Mutex<()>,
    wake_cond: Condvar,
    count_paused: AtomicU64,
    time_paused_ns: AtomicU64,
}

impl LongPauser {
    /// Create a pauser that spins `busy_spins` times, yields `yield_spins`
    /// times, then parks from `min_pause` doubling up to `max_pause`.
    pub fn new(busy_spins: u32, yield_spins: u32, min_pause: Duration, max_pause: Duration) -> Self {
        Self {
            busy_spins,
            yield_spins,
            min_pause,
            max_pause,
            spins: AtomicU32::new(0),
            next_pause_ns: AtomicU64::new(min_pause.as_nanos() as u64),
            wake: AtomicBool::new(false),
            lock: Mutex::new(()),
            wake_cond: Condvar::new(),
            count_paused: AtomicU64::new(0),
            time_paused_ns: AtomicU64::new(0),
        }
    }
}

impl Pauser for LongPauser {
    fn pause(&self) {
        let spins = self.spins.fetch_add(1, Ordering::Relaxed);
        if spins < self.busy_spins {
            std::hint::spin_loop();
            return;
        }
        if spins < self.busy_spins + self.yield_spins {
            std::thread::yield_now();
            return;
        }

        let pause = Duration::from_nanos(self.next_pause_ns.load(Ordering::Relaxed));
        let started = Instant::now();
        {
            let mut guard = self.lock.lock();
            // unpause() stores the flag while holding the lock, so a wake
            // issued between the caller going idle and this wait is not lost.
            if !self.wake.swap(false, Ordering::AcqRel) {
                self.wake_cond.wait_for(&mut guard, pause);
            }
        }
        self.count_paused.fetch_add(1, Ordering::Relaxed);
        self.time_paused_ns
            .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);

        let next = (pause * 2).clamp(self.min_pause, self.max_pause);
        self.next_pause_ns
            .store(next.as_nanos() as u64, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.spins.store(0, Ordering::Relaxed);
        self.next_pause_ns
            .store(self.min_pause.as_nanos() as u64, Ordering::Relaxed);
    }

    fn unpause(&self) {
        let _guard = self.lock.lock();
        self.wake.store(true, Ordering::Release);
        self.wake_cond.notify_one();
    }

    fn count_paused(&self) -> u64 {
        self.count_paused.load(Ordering::Relaxed)
    }

    fn time_paused(&self) -> Duration {
        Duration::from_nanos(self.time_paused_ns.load(Ordering::Relaxed))
    }
}
