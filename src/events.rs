//! Bridge lifecycle and runtime events.
//!
//! Events are produced by the worker channel, by proxied calls and by the
//! bridge itself. They are delivered synchronously to every registered
//! listener, in registration order, before the bridge reacts to them.

use std::fmt;
use std::sync::Arc;

use crate::proxy::MethodKey;

/// Callback receiving every event raised while the bridge serves.
pub type EventListener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Sink a producer pushes events into.
pub type EventSink = Arc<dyn Fn(Event) + Send + Sync>;

/// Discriminant of an [`Event`], for listeners that only filter on kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Serving,
    Stopping,
    Stopped,
    PoolStarted,
    PoolStopped,
    PoolFailed,
    WorkerSpawned,
    WorkerCrashed,
    CallFailed,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Serving => "serving",
            EventKind::Stopping => "stopping",
            EventKind::Stopped => "stopped",
            EventKind::PoolStarted => "pool_started",
            EventKind::PoolStopped => "pool_stopped",
            EventKind::PoolFailed => "pool_failed",
            EventKind::WorkerSpawned => "worker_spawned",
            EventKind::WorkerCrashed => "worker_crashed",
            EventKind::CallFailed => "call_failed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event and its context.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The accept loop is running on `addr`.
    Serving { addr: String },
    /// A graceful drain has been requested.
    Stopping,
    /// The accept loop returned and the worker channel is stopped.
    Stopped,
    PoolStarted { workers: usize },
    PoolStopped,
    /// The worker pool can no longer serve requests. Fatal for the bridge.
    PoolFailed { reason: String },
    WorkerSpawned { worker: usize, pid: Option<u32> },
    WorkerCrashed {
        worker: usize,
        pid: Option<u32>,
        reason: String,
    },
    /// A proxied call failed; only that caller is affected.
    CallFailed { method: MethodKey, error: String },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Serving { .. } => EventKind::Serving,
            Event::Stopping => EventKind::Stopping,
            Event::Stopped => EventKind::Stopped,
            Event::PoolStarted { .. } => EventKind::PoolStarted,
            Event::PoolStopped => EventKind::PoolStopped,
            Event::PoolFailed { .. } => EventKind::PoolFailed,
            Event::WorkerSpawned { .. } => EventKind::WorkerSpawned,
            Event::WorkerCrashed { .. } => EventKind::WorkerCrashed,
            Event::CallFailed { .. } => EventKind::CallFailed,
        }
    }

    /// Whether the bridge must shut down after delivering this event.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Event::PoolFailed { .. })
    }
}

/// Log an event at a level matching its severity.
pub fn log_event(event: &Event) {
    match event {
        Event::PoolFailed { reason } => tracing::error!(%reason, "worker pool failed"),
        Event::WorkerCrashed {
            worker,
            pid,
            reason,
        } => tracing::warn!(worker, ?pid, %reason, "worker crashed"),
        Event::CallFailed { method, error } => {
            tracing::warn!(%method, %error, "proxied call failed")
        }
        other => tracing::info!(event = %other.kind(), "bridge event"),
    }
}
