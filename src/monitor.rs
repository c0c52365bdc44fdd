//! Monitor loop and the probes it hosts.
//!
//! The monitor is itself a cooperative worker: probes implement the same
//! handler contract as any other work unit and signal self-removal by
//! failing with [`HandlerError::Invalid`].

use crate::clock::wall_clock_millis;
use crate::cooperative::{drain_inbox, join_with_grace, CLOSE_GRACE};
use crate::handler::{EventHandler, HandlerError, HandlerPriority};
use crate::pauser::Pauser;
use crate::{SchedulerError, SchedulerResult};
use crossbeam_deque::Injector;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Dedicated worker that hosts monitoring probes.
///
/// Every round it drains its inbox and invokes each registered probe once,
/// then parks on its pauser. It must outlive every worker it probes, up to
/// [`stop`](Self::stop).
pub struct MonitorLoop {
    name: String,
    pauser: Arc<dyn Pauser>,
    inbox: Injector<Box<dyn EventHandler>>,
    shutdown: AtomicBool,
    started: AtomicBool,
    closed: AtomicBool,
    terminated: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorLoop {
    /// Create a monitor loop. The thread is not spawned until
    /// [`start`](Self::start).
    pub fn new(name: String, pauser: Arc<dyn Pauser>) -> Arc<Self> {
        Arc::new(Self {
            name,
            pauser,
            inbox: Injector::new(),
            shutdown: AtomicBool::new(false),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            handle: Mutex::new(None),
        })
    }

    /// The loop name, also used as its thread name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start the monitor thread. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let this = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || this.run_loop())
            .expect("failed to spawn monitor loop thread");
        *self.handle.lock() = Some(handle);
    }

    /// Register a probe with the monitor.
    pub fn add_handler(&self, handler: Box<dyn EventHandler>) -> SchedulerResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SchedulerError::Closed(self.name.clone()));
        }
        self.inbox.push(handler);
        self.pauser.unpause();
        Ok(())
    }

    /// Ask the monitor to exit after the current round of probes.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.pauser.unpause();
    }

    /// Stop the monitor and reclaim its thread. Idempotent.
    pub fn close(&self) {
        self.stop();
        if let Some(handle) = self.handle.lock().take() {
            join_with_grace(handle, CLOSE_GRACE, &self.name);
        }
        self.closed.store(true, Ordering::Release);
    }

    /// Whether the monitor thread has been started and has not terminated.
    pub fn is_alive(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.terminated.load(Ordering::Acquire)
    }

    /// Whether [`close`](Self::close) has completed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn run_loop(&self) {
        let mut probes: Vec<Box<dyn EventHandler>> = Vec::new();

        while !self.shutdown.load(Ordering::Acquire) {
            drain_inbox(&self.inbox, &mut probes);

            let mut busy = false;
            let mut i = 0;
            while i < probes.len() {
                match probes[i].action() {
                    Ok(progress) => {
                        busy |= progress;
                        i += 1;
                    }
                    Err(HandlerError::Invalid) => {
                        probes.remove(i);
                    }
                    Err(e) => {
                        warn!(loop_name = %self.name, error = %e, "monitor probe failed");
                        i += 1;
                    }
                }
            }

            if busy {
                self.pauser.reset();
            } else {
                self.pauser.pause();
            }
        }

        self.terminated.store(true, Ordering::Release);
    }
}

/// Periodic statistics probe for a pauser.
///
/// Reads the pauser's rolling counters and logs the delta once per period.
/// It performs no blocking work, so it never delays the monitor loop.
pub struct PauserMonitor {
    pauser: Arc<dyn Pauser>,
    description: String,
    period_ms: u64,
    next_report_ms: u64,
    last_count: u64,
    last_time: Duration,
}

impl PauserMonitor {
    /// Create a probe that reports `pauser` statistics every `period_secs`.
    pub fn new(pauser: Arc<dyn Pauser>, description: impl Into<String>, period_secs: u64) -> Self {
        let period_ms = period_secs * 1000;
        Self {
            pauser,
            description: description.into(),
            period_ms,
            next_report_ms: wall_clock_millis() + period_ms,
            last_count: 0,
            last_time: Duration::ZERO,
        }
    }
}

impl EventHandler for PauserMonitor {
    fn priority(&self) -> HandlerPriority {
        HandlerPriority::Monitor
    }

    fn action(&mut self) -> Result<bool, HandlerError> {
        let now = wall_clock_millis();
        if now < self.next_report_ms {
            return Ok(false);
        }

        let count = self.pauser.count_paused();
        let time = self.pauser.time_paused();
        let parks = count.saturating_sub(self.last_count);
        if parks > 0 {
            let avg = time.saturating_sub(self.last_time) / parks as u32;
            debug!(pauser = %self.description, parks, avg_park = ?avg, "pauser statistics");
        }
        self.last_count = count;
        self.last_time = time;
        self.next_report_ms = now + self.period_ms;
        Ok(false)
    }
}
