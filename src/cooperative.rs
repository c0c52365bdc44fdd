//! Cooperative single-threaded event loop.
//!
//! The loop runs registered handlers round-robin on one owned thread and
//! publishes the start timestamp of the current handler invocation, which
//! the monitor loop reads for stall detection.

use crate::affinity;
use crate::clock::wall_clock_millis;
use crate::handler::{EventHandler, HandlerError, HandlerPriority};
use crate::pauser::Pauser;
use crate::{SchedulerError, SchedulerResult};
use crossbeam_deque::{Injector, Steal};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::warn;

/// `loop_start_ms` value while the loop is parked with no runnable work.
pub const LOOP_IDLE: u64 = u64::MAX;

/// `loop_start_ms` value once the loop thread has exited.
pub const LOOP_TERMINATED: u64 = u64::MAX - 1;

/// Grace period when joining a loop thread during close.
pub(crate) const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Join a loop thread, giving it `grace` to finish its current step.
pub(crate) fn join_with_grace(handle: JoinHandle<()>, grace: Duration, name: &str) {
    let start = Instant::now();
    loop {
        if handle.is_finished() {
            if handle.join().is_err() {
                warn!(loop_name = %name, "event loop thread panicked");
            }
            return;
        }
        if start.elapsed() > grace {
            warn!(loop_name = %name, "event loop thread did not exit within the grace period");
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// Drain a submission queue into the thread-owned handler list.
pub(crate) fn drain_inbox(
    inbox: &Injector<Box<dyn EventHandler>>,
    handlers: &mut Vec<Box<dyn EventHandler>>,
) {
    loop {
        match inbox.steal() {
            Steal::Success(handler) => handlers.push(handler),
            Steal::Empty => break,
            Steal::Retry => continue,
        }
    }
}

/// Single-threaded worker that drives handlers cooperatively.
///
/// Handlers are invoked round-robin, one `action` call at a time. `Timer`
/// priority handlers are gated to at most one invocation per timer tick.
/// Between bursts with no progress the loop parks on its pauser.
pub struct CooperativeLoop {
    name: String,
    pauser: Arc<dyn Pauser>,
    timer_interval_ms: u64,
    daemon: bool,
    binding: bool,
    inbox: Injector<Box<dyn EventHandler>>,
    loop_start_ms: AtomicU64,
    shutdown: AtomicBool,
    started: AtomicBool,
    closed: AtomicBool,
    dumps_requested: AtomicU64,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CooperativeLoop {
    /// Create a loop. The thread is not spawned until [`start`](Self::start).
    pub fn new(
        name: String,
        pauser: Arc<dyn Pauser>,
        timer_interval_ms: u64,
        daemon: bool,
        binding: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            pauser,
            timer_interval_ms,
            daemon,
            binding,
            inbox: Injector::new(),
            loop_start_ms: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            dumps_requested: AtomicU64::new(0),
            handle: Mutex::new(None),
        })
    }

    /// The loop name, also used as its thread name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start the loop thread. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let this = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || this.run_loop())
            .expect("failed to spawn event loop thread");
        *self.handle.lock() = Some(handle);
    }

    /// Submit a handler; it joins the round-robin set on the loop thread.
    pub fn add_handler(&self, handler: Box<dyn EventHandler>) -> SchedulerResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SchedulerError::Closed(self.name.clone()));
        }
        self.inbox.push(handler);
        self.pauser.unpause();
        Ok(())
    }

    /// Ask the loop to exit after the in-flight handler step returns.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.pauser.unpause();
    }

    /// Stop the loop and reclaim its thread. Idempotent.
    ///
    /// Non-daemon loops are joined with a bounded grace period; daemon loops
    /// are signalled and left to exit on their own.
    pub fn close(&self) {
        self.stop();
        if let Some(handle) = self.handle.lock().take() {
            if !self.daemon {
                join_with_grace(handle, CLOSE_GRACE, &self.name);
            }
        }
        self.closed.store(true, Ordering::Release);
    }

    /// Whether the loop thread has been started and has not terminated.
    pub fn is_alive(&self) -> bool {
        self.started.load(Ordering::Acquire)
            && self.loop_start_ms.load(Ordering::Relaxed) != LOOP_TERMINATED
    }

    /// Whether [`close`](Self::close) has completed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Start timestamp of the current handler invocation.
    ///
    /// `0` means quiet (not yet started), [`LOOP_IDLE`] parked, and
    /// [`LOOP_TERMINATED`] that the thread has exited; any other value is the
    /// wall-clock millisecond at which the in-flight invocation began.
    pub fn loop_start_ms(&self) -> u64 {
        self.loop_start_ms.load(Ordering::Relaxed)
    }

    /// Number of diagnostic dumps emitted for this loop.
    pub fn dumps_requested(&self) -> u64 {
        self.dumps_requested.load(Ordering::Relaxed)
    }

    /// Emit a diagnostic dump of the loop state.
    ///
    /// The dump is suppressed when `still_in_same_invocation` reports that
    /// the loop has already moved past the invocation that triggered it.
    pub fn dump_running_state(&self, reason: &str, still_in_same_invocation: impl Fn() -> bool) {
        if !still_in_same_invocation() {
            return;
        }
        self.dumps_requested.fetch_add(1, Ordering::Relaxed);
        warn!(loop_name = %self.name, "{}", reason);
    }

    fn run_loop(&self) {
        if self.binding {
            affinity::bind_current_thread();
        }
        let mut handlers: Vec<Box<dyn EventHandler>> = Vec::new();
        let mut next_timer_ms = 0u64;

        'outer: while !self.shutdown.load(Ordering::Acquire) {
            drain_inbox(&self.inbox, &mut handlers);

            if handlers.is_empty() {
                self.loop_start_ms.store(LOOP_IDLE, Ordering::Relaxed);
                self.pauser.pause();
                continue;
            }

            let run_timers = wall_clock_millis() >= next_timer_ms;
            let mut busy = false;
            let mut i = 0;
            while i < handlers.len() {
                if self.shutdown.load(Ordering::Acquire) {
                    break 'outer;
                }
                if handlers[i].priority() == HandlerPriority::Timer && !run_timers {
                    i += 1;
                    continue;
                }
                self.loop_start_ms
                    .store(wall_clock_millis(), Ordering::Relaxed);
                match handlers[i].action() {
                    Ok(progress) => {
                        busy |= progress;
                        i += 1;
                    }
                    Err(HandlerError::Invalid) => {
                        handlers.remove(i);
                    }
                    Err(e) => {
                        warn!(loop_name = %self.name, error = %e, "handler failed");
                        i += 1;
                    }
                }
            }
            if run_timers {
                next_timer_ms = wall_clock_millis() + self.timer_interval_ms;
            }

            self.loop_start_ms.store(LOOP_IDLE, Ordering::Relaxed);
            if busy {
                self.pauser.reset();
            } else {
                self.pauser.pause();
            }
        }

        self.loop_start_ms.store(LOOP_TERMINATED, Ordering::Relaxed);
    }
}
