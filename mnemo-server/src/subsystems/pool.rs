//! Pool of isolated execution units for CPU- and IO-heavy tasks.
//!
//! Each unit is a dedicated OS thread driving its own single-threaded tokio
//! runtime, so tasks run in true parallel and never share the caller's
//! executor. Units are started on demand up to `max_units` and exit after
//! `idle_timeout` without work. A task that panics is contained inside its
//! unit and reported as an error; the unit keeps serving.

use async_trait::async_trait;
use futures::FutureExt;
use mnemo_core::config::PoolConfig;
use mnemo_core::models::{DistillationPayload, DistillationResult, WorkerTask};
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use super::queue::panic_message;
use super::worker::DISTILL_TASK;

/// Routes a task envelope to the body that implements it.
#[async_trait]
pub trait TaskDispatcher: Send + Sync + 'static {
    async fn dispatch(&self, task: WorkerTask) -> Result<Value, TaskError>;
}

/// Failures that happen inside a unit. These travel back to the caller as
/// values; the unit itself stays up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("Unknown task '{0}'")]
    UnknownTask(String),

    #[error("Invalid task payload: {0}")]
    InvalidPayload(String),

    #[error("Task failed: {0}")]
    Failed(String),

    #[error("Task panicked: {0}")]
    Panicked(String),
}

#[derive(Error, Debug)]
pub enum PoolError {
    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("Worker pool is shut down")]
    Closed,

    #[error("Worker unit dropped the task without replying")]
    UnitLost,

    #[error("Failed to start worker unit: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Task result could not be decoded: {0}")]
    Codec(#[from] serde_json::Error),
}

struct Job {
    task: WorkerTask,
    reply: oneshot::Sender<Result<Value, TaskError>>,
}

#[derive(Debug, Default)]
struct PoolState {
    /// Units started and not yet exited.
    live: usize,
    /// Live units waiting for work.
    idle: usize,
    /// Jobs sent but not yet picked up.
    pending: usize,
}

/// What every unit shares. Holds no sender, so dropping the pool closes the
/// channel and lets units wind down.
#[derive(Clone)]
struct UnitShared {
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>>,
    state: Arc<Mutex<PoolState>>,
    dispatcher: Arc<dyn TaskDispatcher>,
    idle_timeout: Duration,
}

impl UnitShared {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        lock(&self.state)
    }
}

fn lock(state: &Mutex<PoolState>) -> MutexGuard<'_, PoolState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct WorkerPool {
    tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    shared: UnitShared,
    max_units: usize,
    next_unit: AtomicUsize,
}

impl WorkerPool {
    pub fn new(config: &PoolConfig, dispatcher: Arc<dyn TaskDispatcher>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Mutex::new(Some(tx)),
            shared: UnitShared {
                rx: Arc::new(tokio::sync::Mutex::new(rx)),
                state: Arc::new(Mutex::new(PoolState::default())),
                dispatcher,
                idle_timeout: Duration::from_secs(config.idle_timeout_seconds),
            },
            max_units: config.max_units.max(1),
            next_unit: AtomicUsize::new(1),
        }
    }

    /// Run `task_name` with `data` on a unit and wait for its result.
    pub async fn run(&self, task_name: &str, data: Value) -> Result<Value, PoolError> {
        let (reply, result) = oneshot::channel();
        self.submit(Job {
            task: WorkerTask {
                task_name: task_name.to_string(),
                data,
            },
            reply,
        })?;

        let value = result.await.map_err(|_| PoolError::UnitLost)??;
        Ok(value)
    }

    pub async fn run_distillation(&self, payload: DistillationPayload) -> Result<DistillationResult, PoolError> {
        let value = self.run(DISTILL_TASK, serde_json::to_value(payload)?).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn live_units(&self) -> usize {
        self.shared.state().live
    }

    /// Refuse further tasks. Queued tasks still run; units exit once the
    /// queue is empty.
    pub fn shutdown(&self) {
        let sender = match self.tx.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if sender.is_some() {
            tracing::info!(live = self.live_units(), "Worker pool shutting down");
        }
    }

    fn submit(&self, job: Job) -> Result<(), PoolError> {
        let sender = match self.tx.lock() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
        .ok_or(PoolError::Closed)?;

        let spawn = {
            let mut state = self.shared.state();
            state.pending += 1;
            if state.idle < state.pending && state.live < self.max_units {
                state.live += 1;
                state.idle += 1;
                true
            } else {
                false
            }
        };

        if sender.send(job).is_err() {
            let mut state = self.shared.state();
            state.pending -= 1;
            if spawn {
                state.live -= 1;
                state.idle -= 1;
            }
            return Err(PoolError::Closed);
        }

        if spawn {
            if let Err(e) = self.spawn_unit() {
                let mut state = self.shared.state();
                state.live -= 1;
                state.idle -= 1;
                // The job stays queued for whichever unit is alive, if any.
                tracing::error!(error = %e, "Failed to spawn worker unit");
                if state.live == 0 {
                    return Err(PoolError::Spawn(e));
                }
            }
        }

        Ok(())
    }

    fn spawn_unit(&self) -> std::io::Result<()> {
        let id = self.next_unit.fetch_add(1, Ordering::Relaxed);
        let shared = self.shared.clone();

        std::thread::Builder::new()
            .name(format!("distill-worker-{}", id))
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build();
                match runtime {
                    Ok(rt) => rt.block_on(unit_loop(id, shared)),
                    Err(e) => {
                        tracing::error!(unit = id, error = %e, "Worker unit could not start a runtime");
                        let mut state = shared.state();
                        state.live -= 1;
                        state.idle -= 1;
                    }
                }
            })?;

        tracing::debug!(unit = id, "Worker unit started");
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn unit_loop(id: usize, shared: UnitShared) {
    loop {
        let next = tokio::time::timeout(shared.idle_timeout, async {
            shared.rx.lock().await.recv().await
        })
        .await;

        let job = match next {
            Ok(Some(job)) => job,
            Ok(None) => {
                let mut state = shared.state();
                state.live -= 1;
                state.idle -= 1;
                tracing::debug!(unit = id, "Worker unit exiting, pool closed");
                return;
            }
            Err(_) => {
                let mut state = shared.state();
                if state.pending == 0 {
                    state.live -= 1;
                    state.idle -= 1;
                    tracing::debug!(unit = id, "Worker unit exiting after idle timeout");
                    return;
                }
                continue;
            }
        };

        {
            let mut state = shared.state();
            state.pending -= 1;
            state.idle -= 1;
        }

        let task_name = job.task.task_name.clone();
        let result = AssertUnwindSafe(shared.dispatcher.dispatch(job.task))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(TaskError::Panicked(panic_message(panic.as_ref()))));

        if let Err(e) = &result {
            tracing::warn!(unit = id, task = %task_name, error = %e, "Task returned an error");
        }
        if job.reply.send(result).is_err() {
            tracing::debug!(unit = id, task = %task_name, "Caller went away before the task finished");
        }

        shared.state().idle += 1;
    }
}

// ============================================================================
// TESTS
// ============================================================================
