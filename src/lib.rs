//! Multi-loop cooperative event scheduler for latency-sensitive workloads.
//!
//! This crate provides:
//! - A priority-routed dispatcher ([`EventGroup`]) that fans handlers out
//!   across a small fixed set of worker threads
//! - Cooperative single-threaded workers ([`CooperativeLoop`])
//! - A worker for handlers that are allowed to block ([`BlockingLoop`])
//! - A monitor worker that watches the cooperative loops for stalls
//!   ([`MonitorLoop`], [`LoopBlockMonitor`])
//! - Adaptive back-off between empty polls ([`Pauser`], [`LongPauser`])

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod affinity;
pub mod blocking;
pub mod clock;
pub mod config;
pub mod cooperative;
pub mod group;
pub mod handler;
pub mod monitor;
pub mod pauser;

pub use blocking::BlockingLoop;
pub use cooperative::{CooperativeLoop, LOOP_IDLE, LOOP_TERMINATED};
pub use group::{EventGroup, LoopBlockMonitor, PauserSupplier};
pub use handler::{EventHandler, HandlerError, HandlerPriority};
pub use monitor::{MonitorLoop, PauserMonitor};
pub use pauser::{LongPauser, Pauser};

/// Scheduler errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// Handler was submitted to a loop that has already been closed
    #[error("event loop {0} is closed")]
    Closed(String),
}

/// Scheduler result
pub type SchedulerResult<T> = Result<T, SchedulerError>;
