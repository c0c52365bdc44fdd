//! Priority-routed dispatcher over a fixed set of event loops.
//!
//! An [`EventGroup`] owns one core cooperative loop, one blocking loop and
//! one monitor loop eagerly, plus a replication loop and a fixed-size pool
//! of concurrent loops that are created lazily on first routing. Routing is
//! a pure function of the handler's priority and, for the concurrent pool,
//! of its identity.

use crate::blocking::BlockingLoop;
use crate::clock::wall_clock_millis;
use crate::config;
use crate::cooperative::{CooperativeLoop, LOOP_IDLE, LOOP_TERMINATED};
use crate::handler::{EventHandler, HandlerError, HandlerPriority};
use crate::monitor::{MonitorLoop, PauserMonitor};
use crate::pauser::{LongPauser, Pauser};
use crate::SchedulerResult;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Factory for pausers handed to lazily created concurrent loops.
pub type PauserSupplier = Box<dyn Fn() -> Arc<dyn Pauser> + Send>;

fn max_pause(normal: Duration) -> Duration {
    if config::is_debug() {
        Duration::from_millis(200)
    } else {
        normal
    }
}

fn default_core_pauser() -> Arc<dyn Pauser> {
    Arc::new(LongPauser::new(
        1000,
        200,
        Duration::from_micros(250),
        max_pause(Duration::from_millis(20)),
    ))
}

fn lazy_loop_pauser() -> Arc<dyn Pauser> {
    Arc::new(LongPauser::new(
        500,
        100,
        Duration::from_micros(250),
        max_pause(Duration::from_millis(
            config::replication_event_pause_time_ms(),
        )),
    ))
}

/// Concurrent-pool slot for identity `n`.
///
/// Mixes the identity's high and mid bits into the low bits before the
/// reduction, so identities differing only in high bits still spread across
/// slots. The exact function is part of the routing contract.
pub(crate) fn conc_hash(n: u32, slots: usize) -> usize {
    let mixed = (n >> 23) ^ (n >> 9) ^ n;
    ((mixed & 0x7fff_ffff) as usize) % slots
}

struct LazySlots {
    replication: Option<Arc<CooperativeLoop>>,
    concurrent: Vec<Option<Arc<CooperativeLoop>>>,
    conc_pauser_supplier: PauserSupplier,
}

/// Priority-routed dispatcher and lifecycle owner for a set of event loops.
pub struct EventGroup {
    name: String,
    daemon: bool,
    binding: bool,
    pauser: Arc<dyn Pauser>,
    core: Arc<CooperativeLoop>,
    monitor: Arc<MonitorLoop>,
    blocking: Arc<BlockingLoop>,
    conc_threads: usize,
    lazy: Mutex<LazySlots>,
}

impl EventGroup {
    /// Create a group with the default core pauser and no CPU binding.
    pub fn new(daemon: bool) -> Self {
        Self::with_binding(daemon, false)
    }

    /// Create a group with the default core pauser.
    pub fn with_binding(daemon: bool, binding: bool) -> Self {
        Self::with_pauser(daemon, default_core_pauser(), binding, "")
    }

    /// Create a group with an explicit core pauser and a name prefix for
    /// every loop it owns.
    pub fn with_pauser(daemon: bool, pauser: Arc<dyn Pauser>, binding: bool, name: &str) -> Self {
        let conc_threads = config::conc_threads();
        let core = CooperativeLoop::new(
            format!("{name}core-event-loop"),
            Arc::clone(&pauser),
            1,
            daemon,
            binding,
        );
        let monitor = MonitorLoop::new(
            format!("{name}event-loop-monitor"),
            Arc::new(LongPauser::new(
                0,
                0,
                Duration::from_millis(100),
                Duration::from_millis(100),
            )),
        );
        monitor
            .add_handler(Box::new(PauserMonitor::new(
                Arc::clone(&pauser),
                format!("{name}core pauser"),
                30,
            )))
            .expect("freshly constructed monitor loop is open");
        let blocking = BlockingLoop::new(format!("{name}blocking-event-loop"));

        Self {
            name: name.to_string(),
            daemon,
            binding,
            pauser,
            core,
            monitor,
            blocking,
            conc_threads,
            lazy: Mutex::new(LazySlots {
                replication: None,
                concurrent: vec![None; conc_threads],
                conc_pauser_supplier: Box::new(lazy_loop_pauser),
            }),
        }
    }

    /// Route a handler to exactly one loop, chosen by its priority.
    ///
    /// Replication and concurrent loops are created on first routing.
    pub fn add_handler(&self, handler: Box<dyn EventHandler>) -> SchedulerResult<()> {
        match handler.priority() {
            HandlerPriority::High
            | HandlerPriority::Medium
            | HandlerPriority::Timer
            | HandlerPriority::Daemon => self.core.add_handler(handler),

            HandlerPriority::Monitor => self.monitor.add_handler(handler),

            HandlerPriority::Blocking => self.blocking.add_handler(handler),

            HandlerPriority::Replication => self.replication_loop()?.add_handler(handler),

            HandlerPriority::Concurrent => {
                let slot = conc_hash(handler.identity(), self.conc_threads);
                self.concurrent_loop(slot)?.add_handler(handler)
            }
        }
    }

    /// Same as [`add_handler`](Self::add_handler); the inline-execution hint
    /// is ignored because every loop runs on a thread of its own.
    pub fn add_handler_no_inline(
        &self,
        _dont_run_inline: bool,
        handler: Box<dyn EventHandler>,
    ) -> SchedulerResult<()> {
        self.add_handler(handler)
    }

    /// Start the eager loops. Idempotent.
    ///
    /// The core stall probe is registered after both the core and the
    /// monitor are running; a pre-start observation reads the quiet sentinel
    /// and is harmless.
    pub fn start(&self) {
        if self.is_closed() || self.core.is_alive() {
            return;
        }
        self.core.start();
        self.blocking.start();
        self.monitor.start();
        if let Err(e) = self.monitor.add_handler(Box::new(LoopBlockMonitor::new(
            config::monitor_interval_ms(),
            Arc::clone(&self.core),
        ))) {
            // a racing close() has already shut the monitor down
            warn!(error = %e, "group closed while starting; core stall probe not registered");
        }
    }

    /// Stop every loop: monitor first, then replication, the concurrent
    /// pool, the core and finally the blocking loop.
    ///
    /// Best-effort: each loop is signalled and exits after its in-flight
    /// handler step.
    pub fn stop(&self) {
        self.monitor.stop();
        {
            let lazy = self.lazy.lock();
            if let Some(replication) = &lazy.replication {
                replication.stop();
            }
            for slot in lazy.concurrent.iter().flatten() {
                slot.stop();
            }
        }
        self.core.stop();
        self.blocking.stop();
    }

    /// Stop and close every owned loop. Idempotent; a failure to reclaim
    /// one loop does not prevent closing the others.
    pub fn close(&self) {
        self.stop();
        self.monitor.close();
        self.blocking.close();
        self.core.close();
        let lazy = self.lazy.lock();
        if let Some(replication) = &lazy.replication {
            replication.close();
        }
        for slot in lazy.concurrent.iter().flatten() {
            slot.close();
        }
    }

    /// Wake the core loop through its pauser.
    pub fn unpause(&self) {
        self.pauser.unpause();
    }

    /// Whether the core loop is alive.
    pub fn is_alive(&self) -> bool {
        self.core.is_alive()
    }

    /// Whether the group has been closed.
    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Replace the factory used to build pausers for concurrent loops.
    ///
    /// Affects only slots that have not been materialized yet.
    pub fn set_conc_thread_pauser_supplier(&self, supplier: PauserSupplier) {
        self.lazy.lock().conc_pauser_supplier = supplier;
    }

    fn replication_loop(&self) -> SchedulerResult<Arc<CooperativeLoop>> {
        let mut lazy = self.lazy.lock();
        if let Some(replication) = &lazy.replication {
            return Ok(Arc::clone(replication));
        }

        let pauser = lazy_loop_pauser();
        let replication = CooperativeLoop::new(
            format!("{}replication-event-loop", self.name),
            Arc::clone(&pauser),
            config::replication_event_pause_time_ms(),
            // replication runs as a daemon regardless of the group flag
            true,
            self.binding,
        );
        self.watch_and_start(
            &replication,
            pauser,
            format!("{}replication pauser", self.name),
        )?;

        lazy.replication = Some(Arc::clone(&replication));
        Ok(replication)
    }

    fn concurrent_loop(&self, n: usize) -> SchedulerResult<Arc<CooperativeLoop>> {
        let mut lazy = self.lazy.lock();
        if let Some(slot) = &lazy.concurrent[n] {
            return Ok(Arc::clone(slot));
        }

        let pauser = (lazy.conc_pauser_supplier)();
        let name = format!("{}conc-event-loop-{}", self.name, n);
        let slot = CooperativeLoop::new(
            name.clone(),
            Arc::clone(&pauser),
            config::replication_event_pause_time_ms(),
            self.daemon,
            self.binding,
        );
        self.watch_and_start(&slot, pauser, format!("{name} pauser"))?;

        lazy.concurrent[n] = Some(Arc::clone(&slot));
        Ok(slot)
    }

    /// Register stall and pauser probes for a lazily created loop, starting
    /// it in between, so a published slot is always monitored.
    ///
    /// The registrations fail only when a racing `close()` has shut the
    /// monitor down; the loop is closed before the error is returned, so an
    /// unpublished loop never keeps its thread.
    fn watch_and_start(
        &self,
        ev: &Arc<CooperativeLoop>,
        pauser: Arc<dyn Pauser>,
        pauser_description: String,
    ) -> SchedulerResult<()> {
        let result = self
            .monitor
            .add_handler(Box::new(LoopBlockMonitor::new(
                config::replication_monitor_interval_ms(),
                Arc::clone(ev),
            )))
            .and_then(|()| {
                ev.start();
                self.monitor.add_handler(Box::new(PauserMonitor::new(
                    pauser,
                    pauser_description,
                    60,
                )))
            });
        if let Err(e) = result {
            ev.close();
            return Err(e);
        }
        Ok(())
    }
}

/// Probe that watches one cooperative loop for excessive blocking.
///
/// Hosted by the monitor loop. When the observed loop stays inside a single
/// handler invocation for longer than the observation window, the probe asks
/// the loop for a diagnostic dump; the recorded interval count rises with
/// the stall so repeated dumps are only emitted as the stall keeps growing.
pub struct LoopBlockMonitor {
    window_ms: u64,
    observed: Arc<CooperativeLoop>,
    last_interval: u64,
}

impl LoopBlockMonitor {
    /// Create a probe with observation window `window_ms` for `observed`.
    pub fn new(window_ms: u64, observed: Arc<CooperativeLoop>) -> Self {
        Self {
            window_ms,
            observed,
            last_interval: 1,
        }
    }
}

impl EventHandler for LoopBlockMonitor {
    fn priority(&self) -> HandlerPriority {
        HandlerPriority::Monitor
    }

    fn action(&mut self) -> Result<bool, HandlerError> {
        let loop_start_ms = self.observed.loop_start_ms();
        if loop_start_ms == 0 || loop_start_ms == LOOP_IDLE {
            return Ok(false);
        }
        if loop_start_ms == LOOP_TERMINATED {
            warn!(loop_name = %self.observed.name(), "monitoring a loop which has terminated");
            return Err(HandlerError::Invalid);
        }

        let now = wall_clock_millis();
        let blocked_ms = now.saturating_sub(loop_start_ms);
        let intervals = blocked_ms / ((self.window_ms + 1) / 2);

        if intervals > self.last_interval && !config::is_debug() && self.observed.is_alive() {
            let observed = Arc::clone(&self.observed);
            self.observed.dump_running_state(
                &format!(
                    "{} thread has blocked for {} ms.",
                    self.observed.name(),
                    blocked_ms
                ),
                // only dump while the loop is still inside that same invocation
                move || observed.loop_start_ms() == loop_start_ms,
            );
        } else {
            self.last_interval = intervals.max(1);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::thread;

    struct Sleeper {
        sleep: Duration,
        rounds: u64,
        done: u64,
    }

    impl EventHandler for Sleeper {
        fn action(&mut self) -> Result<bool, HandlerError> {
            if self.done >= self.rounds {
                return Err(HandlerError::Invalid);
            }
            self.done += 1;
            thread::sleep(self.sleep);
            Ok(true)
        }
    }

    #[test]
    fn test_conc_hash_is_deterministic() {
        for n in [0u32, 1, 42, 0xDEAD_BEEF, u32::MAX] {
            assert_eq!(conc_hash(n, 4), conc_hash(n, 4));
        }
    }

    #[test]
    fn test_conc_hash_small_identities_mod_two() {
        assert_eq!(conc_hash(0, 2), 0);
        assert_eq!(conc_hash(1, 2), 1);
        assert_eq!(conc_hash(2, 2), 0);
        assert_eq!(conc_hash(3, 2), 1);
    }

    #[test]
    fn test_conc_hash_mixes_high_bits() {
        // Identities differing only above bit 23 land in different slots.
        let a = conc_hash(0x0080_0000, 8);
        let b = conc_hash(0x0100_0000, 8);
        let c = conc_hash(0x0200_0000, 8);
        assert!(!(a == b && b == c));
    }

    #[test]
    fn test_conc_hash_spread_is_near_uniform() {
        let mut rng = rand::thread_rng();
        const SAMPLES: usize = 10_000;
        for slots in [2usize, 4, 8] {
            let mut counts = vec![0usize; slots];
            for _ in 0..SAMPLES {
                counts[conc_hash(rng.gen::<u32>(), slots)] += 1;
            }
            let expected = SAMPLES / slots;
            for (slot, &count) in counts.iter().enumerate() {
                let deviation = count.abs_diff(expected) as f64 / expected as f64;
                assert!(
                    deviation < 0.10,
                    "slot {slot}/{slots} saw {count}, expected ~{expected}"
                );
            }
        }
    }

    #[test]
    fn test_lazy_loops_are_created_once() {
        let group = EventGroup::new(true);
        group.start();

        let first = group.replication_loop().expect("replication loop");
        let second = group.replication_loop().expect("replication loop");
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.is_alive());

        let slot_a = group.concurrent_loop(0).expect("concurrent loop");
        let slot_b = group.concurrent_loop(0).expect("concurrent loop");
        assert!(Arc::ptr_eq(&slot_a, &slot_b));
        assert!(slot_a.is_alive());

        group.close();
    }

    #[test]
    fn test_replication_loop_name_and_daemon_flag() {
        let group = EventGroup::with_pauser(false, default_core_pauser(), false, "grp-");
        group.start();

        let replication = group.replication_loop().expect("replication loop");
        assert_eq!(replication.name(), "grp-replication-event-loop");

        group.close();
        // A daemon loop is signalled rather than joined; it still winds down.
        thread::sleep(Duration::from_millis(100));
        assert!(!replication.is_alive());
    }

    #[test]
    fn test_supplier_applies_to_slots_created_later() {
        let group = EventGroup::new(true);
        group.start();

        let used = Arc::new(AtomicU64::new(0));
        let counted = Arc::clone(&used);
        group.set_conc_thread_pauser_supplier(Box::new(move || {
            counted.fetch_add(1, Ordering::Relaxed);
            lazy_loop_pauser()
        }));

        group.concurrent_loop(0).expect("concurrent loop");
        group.concurrent_loop(0).expect("concurrent loop");
        assert_eq!(used.load(Ordering::Relaxed), 1);

        group.close();
    }

    #[test]
    fn test_stall_detection_dumps_blocked_core_loop() {
        let group = EventGroup::new(true);
        group.start();

        // One long invocation; the default 200ms window halves to 100ms, so
        // the 100ms monitor tick crosses the threshold well within the sleep.
        group
            .add_handler(Box::new(Sleeper {
                sleep: Duration::from_millis(1200),
                rounds: 1,
                done: 0,
            }))
            .expect("group is open");

        thread::sleep(Duration::from_millis(800));
        assert!(group.core.dumps_requested() >= 1);

        group.close();
    }

    #[test]
    fn test_quiet_loop_is_never_dumped() {
        let group = EventGroup::new(true);
        group.start();

        thread::sleep(Duration::from_millis(400));
        assert_eq!(group.core.dumps_requested(), 0);

        group.close();
    }

    #[test]
    fn test_probe_removes_itself_when_loop_terminates() {
        let observed = CooperativeLoop::new(
            "observed-loop".to_string(),
            lazy_loop_pauser(),
            1,
            false,
            false,
        );
        observed.start();
        let mut probe = LoopBlockMonitor::new(40, Arc::clone(&observed));

        assert_eq!(probe.action(), Ok(false));

        observed.close();
        assert_eq!(probe.action(), Err(HandlerError::Invalid));
    }

    #[test]
    fn test_probe_stays_quiet_below_one_interval() {
        let observed = CooperativeLoop::new(
            "observed-loop".to_string(),
            lazy_loop_pauser(),
            1,
            false,
            false,
        );
        observed
            .add_handler(Box::new(Sleeper {
                sleep: Duration::from_millis(60),
                rounds: 1,
                done: 0,
            }))
            .expect("loop is open");
        observed.start();
        let mut probe = LoopBlockMonitor::new(200, Arc::clone(&observed));

        thread::sleep(Duration::from_millis(30));
        probe.action().expect("probe is healthy");
        assert_eq!(observed.dumps_requested(), 0);

        observed.close();
    }

    #[test]
    fn test_probe_escalates_during_long_stall() {
        let observed = CooperativeLoop::new(
            "observed-loop".to_string(),
            lazy_loop_pauser(),
            1,
            false,
            false,
        );
        observed
            .add_handler(Box::new(Sleeper {
                sleep: Duration::from_millis(500),
                rounds: 1,
                done: 0,
            }))
            .expect("loop is open");
        observed.start();

        // Window 100ms halves to 50ms per interval; tick at that cadence.
        let mut probe = LoopBlockMonitor::new(100, Arc::clone(&observed));
        for _ in 0..9 {
            thread::sleep(Duration::from_millis(50));
            probe.action().expect("probe is healthy");
        }

        let dumps = observed.dumps_requested();
        assert!(dumps >= 2, "expected escalating dumps, saw {dumps}");

        observed.close();
    }
}
