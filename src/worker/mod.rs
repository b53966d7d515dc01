//! Worker channel: the hand-off between proxied calls and worker processes.
//!
//! The bridge never executes method bodies itself. Every proxied call
//! becomes one [`WorkerChannel::dispatch`] with the [`MethodKey`] as routing
//! key and the still-encoded request message as payload; the worker's
//! reply payload comes back untouched.
//!
//! [`ProcessPool`] is the default channel, talking to a pool of local
//! processes over stdin/stdout (see [`frame`] for the wire format).

pub mod frame;
mod pool;
mod process;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::Result;
use crate::events::EventSink;
use crate::proxy::MethodKey;
use crate::server::config::WorkerConfig;

pub use pool::ProcessPool;

/// One request as handed to a worker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerRequest {
    /// ASCII request metadata forwarded from the gRPC call.
    pub metadata: BTreeMap<String, String>,
    /// Encoded request message, exactly as received from the client.
    pub payload: Bytes,
}

impl WorkerRequest {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            metadata: BTreeMap::new(),
            payload: payload.into(),
        }
    }
}

/// Multiplexes calls over a pool of workers.
///
/// Implementations must accept concurrent `dispatch` calls and correlate
/// each reply with its request.
#[async_trait]
pub trait WorkerChannel: Send + Sync {
    /// Register the sink receiving pool lifecycle events. Called once,
    /// before [`start`](Self::start).
    fn listen(&self, sink: EventSink);

    /// Launch the workers. Must not block.
    fn start(&self) -> Result<()>;

    /// Run one call on some worker and return its reply payload.
    async fn dispatch(&self, method: &MethodKey, request: WorkerRequest) -> Result<Bytes>;

    /// Stop all workers. Pending and later dispatches fail.
    async fn stop(&self);
}

/// Creates the worker channel for one serving session.
pub trait ChannelFactory: Send + Sync {
    fn create(&self, config: &WorkerConfig) -> Result<Arc<dyn WorkerChannel>>;
}

impl<F> ChannelFactory for F
where
    F: Fn(&WorkerConfig) -> Result<Arc<dyn WorkerChannel>> + Send + Sync,
{
    fn create(&self, config: &WorkerConfig) -> Result<Arc<dyn WorkerChannel>> {
        self(config)
    }
}

/// Builds a [`ProcessPool`] from the worker configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessPoolFactory;

impl ChannelFactory for ProcessPoolFactory {
    fn create(&self, config: &WorkerConfig) -> Result<Arc<dyn WorkerChannel>> {
        Ok(Arc::new(ProcessPool::new(config.clone())?))
    }
}
