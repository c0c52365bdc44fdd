//! Event handler contract shared by every loop.

/// Priority declared by a handler; selects the loop it will run on.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum HandlerPriority {
    /// Latency-critical work on the core loop
    High,
    /// Regular work on the core loop
    Medium,
    /// Periodic work on the core loop, run once per timer tick
    Timer,
    /// Background work on the core loop
    Daemon,
    /// Probes hosted by the monitor loop
    Monitor,
    /// Work that may block, run on a thread of its own
    Blocking,
    /// Replication work, run on the lazily created replication loop
    Replication,
    /// Hash-distributed work across the concurrent-loop pool
    Concurrent,
}

/// Errors a handler may raise from [`EventHandler::action`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// The handler is done and must be removed from its loop
    #[error("handler is no longer valid")]
    Invalid,

    /// The handler failed but stays registered; the failure is logged
    #[error("handler failed: {0}")]
    Failed(String),
}

/// One unit of cooperative work.
///
/// `action` performs one short, non-blocking step per invocation and reports
/// whether it made progress. Handlers registered on the same loop are
/// strictly serialized; handlers on different loops run in parallel and must
/// assume no mutual exclusion. A handler signals its own removal by failing
/// with [`HandlerError::Invalid`].
pub trait EventHandler: Send {
    /// The loop class this handler wants; stable for the handler's lifetime.
    fn priority(&self) -> HandlerPriority {
        HandlerPriority::Medium
    }

    /// Perform one step. `Ok(true)` means progress was made.
    fn action(&mut self) -> Result<bool, HandlerError>;

    /// Identity used to pick a concurrent-pool slot; stable, collisions allowed.
    ///
    /// Only consulted for [`HandlerPriority::Concurrent`] handlers.
    fn identity(&self) -> u32 {
        0
    }
}
