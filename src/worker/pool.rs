//! Pool of stdio worker processes.
//!
//! Each worker slot is a task owning one child process. Slots pull jobs
//! from a shared bounded queue, so a busy worker never receives a second
//! request; reply correlation is simply "the next frame on this worker's
//! stdout".
//!
//! # Failure handling
//!
//! - A worker that dies (mid-call or idle) is replaced in its slot; the
//!   call it was running, if any, fails with `WorkerCrashed`.
//! - A slot that cannot spawn a replacement, or whose worker crashes
//!   `max_consecutive_crashes` times without a successful reply, fails
//!   the whole pool: every pending and future dispatch errors and
//!   [`Event::PoolFailed`] is raised.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::process::WorkerProcess;
use super::{WorkerChannel, WorkerRequest};
use crate::events::{Event, EventSink};
use crate::proxy::MethodKey;
use crate::server::config::WorkerConfig;
use crate::telemetry;
use crate::{BifrostError, Result};

struct Job {
    method: MethodKey,
    request: WorkerRequest,
    reply: oneshot::Sender<Result<Bytes>>,
}

/// [`WorkerChannel`] backed by local worker processes.
pub struct ProcessPool {
    shared: Arc<PoolShared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct PoolShared {
    config: WorkerConfig,
    jobs_tx: mpsc::Sender<Job>,
    jobs_rx: tokio::sync::Mutex<mpsc::Receiver<Job>>,
    sink: OnceLock<EventSink>,
    failure: Mutex<Option<String>>,
    failed: CancellationToken,
    shutdown: CancellationToken,
    started: AtomicBool,
}

impl ProcessPool {
    pub fn new(config: WorkerConfig) -> Result<Self> {
        if config.command.is_empty() {
            return Err(BifrostError::Configuration(
                "workers.command must not be empty".to_string(),
            ));
        }
        if config.num_workers == 0 {
            return Err(BifrostError::Configuration(
                "workers.num_workers must be at least 1".to_string(),
            ));
        }

        let (jobs_tx, jobs_rx) = mpsc::channel(config.num_workers);
        Ok(Self {
            shared: Arc::new(PoolShared {
                config,
                jobs_tx,
                jobs_rx: tokio::sync::Mutex::new(jobs_rx),
                sink: OnceLock::new(),
                failure: Mutex::new(None),
                failed: CancellationToken::new(),
                shutdown: CancellationToken::new(),
                started: AtomicBool::new(false),
            }),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn num_workers(&self) -> usize {
        self.shared.config.num_workers
    }
}

impl std::fmt::Debug for ProcessPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessPool")
            .field("command", &self.shared.config.command)
            .field("num_workers", &self.shared.config.num_workers)
            .field("failed", &self.shared.failed.is_cancelled())
            .field("stopped", &self.shared.shutdown.is_cancelled())
            .finish()
    }
}

#[async_trait]
impl WorkerChannel for ProcessPool {
    fn listen(&self, sink: EventSink) {
        if self.shared.sink.set(sink).is_err() {
            warn!("worker pool already has an event sink");
        }
    }

    fn start(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.shutdown.is_cancelled() {
            return Err(BifrostError::PoolStopped);
        }
        if shared.started.swap(true, Ordering::SeqCst) {
            return Err(BifrostError::InvalidState(
                "worker pool already started".to_string(),
            ));
        }

        // spawn everything first so a bad command fails start() cleanly;
        // already spawned children are killed on drop
        let mut processes = Vec::with_capacity(shared.config.num_workers);
        for slot in 0..shared.config.num_workers {
            match WorkerProcess::spawn(&shared.config, slot) {
                Ok(process) => processes.push(process),
                Err(e) => {
                    shared.started.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for (slot, process) in processes.into_iter().enumerate() {
            shared.emit(Event::WorkerSpawned {
                worker: slot,
                pid: process.pid(),
            });
            tasks.push(tokio::spawn(run_slot(Arc::clone(shared), slot, process)));
        }

        info!(
            workers = shared.config.num_workers,
            command = ?shared.config.command,
            "worker pool started"
        );
        shared.emit(Event::PoolStarted {
            workers: shared.config.num_workers,
        });
        Ok(())
    }

    #[instrument(skip_all, fields(method = %method, bytes = request.payload.len()))]
    async fn dispatch(&self, method: &MethodKey, request: WorkerRequest) -> Result<Bytes> {
        let shared = &self.shared;
        shared.check_open()?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Job {
            method: method.clone(),
            request,
            reply: reply_tx,
        };

        let timeout = shared.config.allocate_timeout();
        let queued = tokio::select! {
            sent = tokio::time::timeout(timeout, shared.jobs_tx.send(job)) => sent,
            _ = shared.failed.cancelled() => return Err(shared.failure()),
            _ = shared.shutdown.cancelled() => return Err(BifrostError::PoolStopped),
        };
        match queued {
            Err(_) => return Err(BifrostError::NoWorker(timeout)),
            Ok(Err(_)) => return Err(BifrostError::PoolStopped),
            Ok(Ok(())) => {}
        }

        tokio::select! {
            reply = reply_rx => reply.unwrap_or_else(|_| {
                Err(BifrostError::WorkerCrashed("worker dropped the request".to_string()))
            }),
            _ = shared.failed.cancelled() => Err(shared.failure()),
            _ = shared.shutdown.cancelled() => Err(BifrostError::PoolStopped),
        }
    }

    async fn stop(&self) {
        let shared = &self.shared;
        if shared.shutdown.is_cancelled() {
            return;
        }
        shared.shutdown.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "worker task panicked");
            }
        }

        if shared.started.load(Ordering::SeqCst) {
            info!("worker pool stopped");
            shared.emit(Event::PoolStopped);
        }
    }
}

impl PoolShared {
    fn emit(&self, event: Event) {
        if let Some(sink) = self.sink.get() {
            sink(event);
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.failed.is_cancelled() {
            return Err(self.failure());
        }
        if self.shutdown.is_cancelled() || !self.started.load(Ordering::SeqCst) {
            return Err(BifrostError::PoolStopped);
        }
        Ok(())
    }

    fn failure(&self) -> BifrostError {
        let reason = self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| "unknown failure".to_string());
        BifrostError::PoolFailed(reason)
    }

    /// Mark the pool dead. Pending dispatches are released before the
    /// event goes out.
    fn fail(&self, reason: String) {
        {
            let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
            if failure.is_some() {
                return;
            }
            *failure = Some(reason.clone());
        }
        self.failed.cancel();
        self.emit(Event::PoolFailed { reason });
    }

    async fn next_job(&self) -> Option<Job> {
        self.jobs_rx.lock().await.recv().await
    }

    /// Replace a dead worker, or fail the pool when that is not possible.
    async fn replace(
        &self,
        slot: usize,
        dead: WorkerProcess,
        reason: String,
        crashes: &mut u32,
    ) -> Option<WorkerProcess> {
        let pid = dead.pid();
        dead.kill().await;
        self.emit(Event::WorkerCrashed {
            worker: slot,
            pid,
            reason,
        });

        if self.shutdown.is_cancelled() {
            return None;
        }

        *crashes += 1;
        if *crashes > self.config.max_consecutive_crashes {
            self.fail(format!(
                "worker {slot} crashed {crashes} times in a row",
                crashes = *crashes
            ));
            return None;
        }

        metrics::counter!(telemetry::WORKER_RESTARTS_TOTAL).increment(1);
        match WorkerProcess::spawn(&self.config, slot) {
            Ok(process) => {
                self.emit(Event::WorkerSpawned {
                    worker: slot,
                    pid: process.pid(),
                });
                Some(process)
            }
            Err(e) => {
                self.fail(format!("failed to respawn worker {slot}: {e}"));
                None
            }
        }
    }
}

enum Next {
    Job(Job),
    Exited(String),
    Stop,
}

async fn run_slot(shared: Arc<PoolShared>, slot: usize, mut process: WorkerProcess) {
    let mut crashes = 0u32;

    loop {
        let next = tokio::select! {
            _ = shared.shutdown.cancelled() => Next::Stop,
            _ = shared.failed.cancelled() => Next::Stop,
            status = process.exited() => Next::Exited(status),
            job = shared.next_job() => job.map_or(Next::Stop, Next::Job),
        };

        let job = match next {
            Next::Stop => break,
            Next::Exited(status) => {
                let reason = format!("exited while idle: {status}");
                match shared.replace(slot, process, reason, &mut crashes).await {
                    Some(fresh) => {
                        process = fresh;
                        continue;
                    }
                    None => return,
                }
            }
            Next::Job(job) => job,
        };

        let outcome = tokio::select! {
            result = process.exchange(&job.method, &job.request, shared.config.max_frame_bytes) => Some(result),
            _ = shared.shutdown.cancelled() => None,
        };

        match outcome {
            None => {
                let _ = job.reply.send(Err(BifrostError::PoolStopped));
                break;
            }
            Some(Ok(answer)) => {
                crashes = 0;
                // the caller may have given up; its outcome is ours to drop
                let _ = job.reply.send(answer);
            }
            Some(Err(e)) => {
                let reason = e.to_string();
                let _ = job.reply.send(Err(e));
                match shared.replace(slot, process, reason, &mut crashes).await {
                    Some(fresh) => process = fresh,
                    None => return,
                }
            }
        }
    }

    process.kill().await;
}
