//! Event loop for handlers that are allowed to block.
//!
//! Each accepted handler gets a thread of its own, so a blocked `action`
//! call never delays other handlers. An acceptor thread owns the inbox and
//! spawns the per-handler runners.

use crate::cooperative::{join_with_grace, CLOSE_GRACE};
use crate::handler::{EventHandler, HandlerError};
use crate::{SchedulerError, SchedulerResult};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::warn;

/// Worker for [`crate::HandlerPriority::Blocking`] handlers.
pub struct BlockingLoop {
    name: String,
    inbox: Mutex<VecDeque<Box<dyn EventHandler>>>,
    available: Condvar,
    shutdown: Arc<AtomicBool>,
    started: AtomicBool,
    closed: AtomicBool,
    runner_seq: AtomicU64,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    runners: Mutex<Vec<JoinHandle<()>>>,
}

impl BlockingLoop {
    /// Create a blocking loop. The acceptor thread is not spawned until
    /// [`start`](Self::start).
    pub fn new(name: String) -> Arc<Self> {
        Arc::new(Self {
            name,
            inbox: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            runner_seq: AtomicU64::new(0),
            acceptor: Mutex::new(None),
            runners: Mutex::new(Vec::new()),
        })
    }

    /// The loop name, also used as its acceptor thread name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start the acceptor thread. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let this = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || this.accept_loop())
            .expect("failed to spawn blocking loop acceptor thread");
        *self.acceptor.lock() = Some(handle);
    }

    /// Submit a handler; a dedicated runner thread will drive it.
    pub fn add_handler(&self, handler: Box<dyn EventHandler>) -> SchedulerResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SchedulerError::Closed(self.name.clone()));
        }
        let mut inbox = self.inbox.lock();
        inbox.push_back(handler);
        self.available.notify_one();
        Ok(())
    }

    /// Ask the acceptor and every runner to exit after their current step.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _inbox = self.inbox.lock();
        self.available.notify_all();
    }

    /// Stop the loop and reclaim its threads. Idempotent.
    pub fn close(&self) {
        self.stop();
        if let Some(handle) = self.acceptor.lock().take() {
            join_with_grace(handle, CLOSE_GRACE, &self.name);
        }
        for handle in self.runners.lock().drain(..) {
            join_with_grace(handle, CLOSE_GRACE, &self.name);
        }
        self.closed.store(true, Ordering::Release);
    }

    /// Whether the acceptor is running.
    pub fn is_alive(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.shutdown.load(Ordering::Acquire)
    }

    /// Whether [`close`](Self::close) has completed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn accept_loop(&self) {
        loop {
            let handler = {
                let mut inbox = self.inbox.lock();
                loop {
                    if self.shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    if let Some(handler) = inbox.pop_front() {
                        break handler;
                    }
                    self.available.wait(&mut inbox);
                }
            };

            let n = self.runner_seq.fetch_add(1, Ordering::Relaxed);
            let shutdown = Arc::clone(&self.shutdown);
            let loop_name = self.name.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", self.name, n))
                .spawn(move || run_blocking_handler(handler, shutdown, loop_name))
                .expect("failed to spawn blocking handler thread");
            self.runners.lock().push(handle);
        }
    }
}

fn run_blocking_handler(
    mut handler: Box<dyn EventHandler>,
    shutdown: Arc<AtomicBool>,
    loop_name: String,
) {
    while !shutdown.load(Ordering::Acquire) {
        match handler.action() {
            Ok(_) => {}
            Err(HandlerError::Invalid) => break,
            Err(e) => warn!(loop_name = %loop_name, error = %e, "blocking handler failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64 as TestCounter;
    use std::time::Duration;

    struct SleepyCounter {
        count: Arc<TestCounter>,
    }

    impl EventHandler for SleepyCounter {
        fn action(&mut self) -> Result<bool, HandlerError> {
            self.count.fetch_add(1, Ordering::Relaxed);
            thread::sleep(Duration::from_millis(10));
            Ok(true)
        }
    }

    #[test]
    fn test_blocking_handler_runs_on_own_thread() {
        let ev = BlockingLoop::new("test-blocking".to_string());
        ev.start();
        assert!(ev.is_alive());

        let count = Arc::new(TestCounter::new(0));
        ev.add_handler(Box::new(SleepyCounter {
            count: Arc::clone(&count),
        }))
        .expect("loop is open");

        thread::sleep(Duration::from_millis(100));
        assert!(count.load(Ordering::Relaxed) > 1);

        ev.close();
        assert!(ev.is_closed());
        assert!(!ev.is_alive());
    }

    #[test]
    fn test_handlers_do_not_delay_each_other() {
        struct Blocked;

        impl EventHandler for Blocked {
            fn action(&mut self) -> Result<bool, HandlerError> {
                thread::sleep(Duration::from_millis(500));
                Ok(false)
            }
        }

        let ev = BlockingLoop::new("test-blocking".to_string());
        ev.start();

        ev.add_handler(Box::new(Blocked)).expect("loop is open");
        let count = Arc::new(TestCounter::new(0));
        ev.add_handler(Box::new(SleepyCounter {
            count: Arc::clone(&count),
        }))
        .expect("loop is open");

        thread::sleep(Duration::from_millis(150));
        assert!(count.load(Ordering::Relaxed) > 0);

        ev.close();
    }

    #[test]
    fn test_add_handler_after_close_is_rejected() {
        let ev = BlockingLoop::new("test-blocking".to_string());
        ev.start();
        ev.close();

        let count = Arc::new(TestCounter::new(0));
        let err = ev.add_handler(Box::new(SleepyCounter { count })).unwrap_err();
        assert_eq!(err, SchedulerError::Closed("test-blocking".to_string()));
    }
}
