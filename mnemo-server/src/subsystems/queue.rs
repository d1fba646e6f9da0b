//! In-process FIFO job queue with a single consumer.
//!
//! `add` never waits on processing. Once a handler is registered, one
//! dedicated task pulls jobs in submission order and runs the handler on
//! each to completion before taking the next, so at most one invocation is
//! ever in flight. Handler errors and panics are logged and counted; the
//! loop keeps going.

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait JobHandler<T>: Send + Sync {
    async fn handle(&self, job: T) -> anyhow::Result<()>;
}

#[async_trait]
impl<T, F, Fut> JobHandler<T> for F
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, job: T) -> anyhow::Result<()> {
        (self)(job).await
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    #[error("A handler is already registered for this queue")]
    HandlerAlreadyRegistered,

    #[error("Queue is shut down")]
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub active: usize,
    pub processed: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct Counters {
    pending: AtomicUsize,
    active: AtomicUsize,
    processed: AtomicUsize,
    failed: AtomicUsize,
    settled: Notify,
}

impl Counters {
    fn snapshot(&self) -> QueueStats {
        QueueStats {
            pending: self.pending.load(Ordering::SeqCst),
            active: self.active.load(Ordering::SeqCst),
            processed: self.processed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }
}

pub struct JobQueue<T> {
    name: &'static str,
    tx: mpsc::UnboundedSender<T>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<T>>>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
}

impl<T: Send + 'static> JobQueue<T> {
    pub fn new(name: &'static str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name,
            tx,
            rx: Mutex::new(Some(rx)),
            counters: Arc::new(Counters::default()),
            cancel: CancellationToken::new(),
        }
    }

    /// Append a job and return immediately.
    pub fn add(&self, job: T) -> Result<(), QueueError> {
        if self.cancel.is_cancelled() {
            return Err(QueueError::Closed);
        }

        self.counters.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(job).is_err() {
            self.counters.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(QueueError::Closed);
        }
        Ok(())
    }

    /// Register the handler and start draining. Jobs added earlier are
    /// handled first, in the order they were added.
    pub fn process<H>(&self, handler: H) -> Result<(), QueueError>
    where
        H: JobHandler<T> + 'static,
    {
        let rx = match self.rx.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
        .ok_or(QueueError::HandlerAlreadyRegistered)?;

        tokio::spawn(drain(
            self.name,
            rx,
            handler,
            self.counters.clone(),
            self.cancel.clone(),
        ));
        tracing::debug!(queue = self.name, "Queue handler registered");
        Ok(())
    }

    pub fn stats(&self) -> QueueStats {
        self.counters.snapshot()
    }

    /// Wait until nothing is pending or running.
    pub async fn wait_idle(&self) {
        loop {
            let settled = self.counters.settled.notified();
            let stats = self.stats();
            if stats.pending == 0 && stats.active == 0 {
                return;
            }
            settled.await;
        }
    }

    /// Stop the consumer after the job it is running, if any. Queued jobs
    /// are left undelivered and further `add` calls fail.
    pub fn shutdown(&self) -> QueueStats {
        let stats = self.stats();
        self.cancel.cancel();
        tracing::info!(
            queue = self.name,
            pending = stats.pending,
            active = stats.active,
            "Job queue shutting down"
        );
        stats
    }
}

async fn drain<T, H>(
    name: &'static str,
    mut rx: mpsc::UnboundedReceiver<T>,
    handler: H,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) where
    T: Send + 'static,
    H: JobHandler<T>,
{
    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(job) => job,
                None => break,
            },
        };

        // Mark active before leaving pending so stats never show a gap
        counters.active.fetch_add(1, Ordering::SeqCst);
        counters.pending.fetch_sub(1, Ordering::SeqCst);

        let outcome = AssertUnwindSafe(handler.handle(job)).catch_unwind().await;

        match outcome {
            Ok(Ok(())) => {
                counters.processed.fetch_add(1, Ordering::SeqCst);
            }
            Ok(Err(e)) => {
                counters.failed.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(queue = name, error = %e, "Job handler failed, continuing");
            }
            Err(panic) => {
                counters.failed.fetch_add(1, Ordering::SeqCst);
                tracing::error!(
                    queue = name,
                    panic = %panic_message(panic.as_ref()),
                    "Job handler panicked, continuing"
                );
            }
        }

        counters.active.fetch_sub(1, Ordering::SeqCst);
        counters.settled.notify_waiters();
    }

    tracing::debug!(queue = name, "Queue consumer stopped");
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ============================================================================
// TESTS
// ============================================================================
