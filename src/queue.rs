//! Deployment queue and worker pool
//!
//! A bounded FIFO of deployment ids drained by a fixed number of workers.
//! Enqueueing never waits: a full buffer is reported to the caller. Each
//! in-flight deployment runs under a child of the queue's root token so that
//! it can be cancelled on its own or together with everything else at
//! shutdown.

use crate::engine::Engine;
use crate::error::DeployError;
use dashmap::{DashMap, DashSet};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnqueueError {
    #[error("deployment queue is full")]
    Full,

    #[error("deployment queue is closed")]
    Closed,
}

/// What [`Queue::cancel`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// A worker was running the deployment and has been told to stop
    Running,
    /// The deployment will be failed as cancelled when a worker takes it
    Pending,
}

pub struct Queue {
    tx: parking_lot::Mutex<Option<mpsc::Sender<i64>>>,
    root: CancellationToken,
    running: Arc<DashMap<i64, CancellationToken>>,
    cancelled: Arc<DashSet<i64>>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    capacity: usize,
}

impl Queue {
    /// Create the queue and spawn `workers` workers
    pub fn start(engine: Arc<Engine>, capacity: usize, workers: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let root = CancellationToken::new();
        let running = Arc::new(DashMap::new());
        let cancelled = Arc::new(DashSet::new());

        let handles = (0..workers.max(1))
            .map(|worker| {
                tokio::spawn(worker_loop(
                    worker,
                    Arc::clone(&engine),
                    Arc::clone(&rx),
                    root.clone(),
                    Arc::clone(&running),
                    Arc::clone(&cancelled),
                ))
            })
            .collect();

        info!(capacity, workers, "Deployment queue started");

        Arc::new(Self {
            tx: parking_lot::Mutex::new(Some(tx)),
            root,
            running,
            cancelled,
            workers: parking_lot::Mutex::new(handles),
            capacity,
        })
    }

    /// Push a deployment id without waiting for room
    pub fn enqueue(&self, deployment_id: i64) -> Result<(), EnqueueError> {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(EnqueueError::Closed)?;
        match tx.try_send(deployment_id) {
            Ok(()) => {
                debug!(deployment_id, "Deployment enqueued");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(deployment_id, capacity = self.capacity, "Deployment queue is full");
                Err(EnqueueError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EnqueueError::Closed),
        }
    }

    /// Cancel a queued or running deployment
    pub fn cancel(&self, deployment_id: i64) -> CancelOutcome {
        if let Some(token) = self.running.get(&deployment_id) {
            info!(deployment_id, "Cancelling running deployment");
            token.cancel();
            return CancelOutcome::Running;
        }
        info!(deployment_id, "Deployment will be cancelled when dequeued");
        self.cancelled.insert(deployment_id);
        CancelOutcome::Pending
    }

    pub fn is_running(&self, deployment_id: i64) -> bool {
        self.running.contains_key(&deployment_id)
    }

    pub fn in_flight(&self) -> usize {
        self.running.len()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Refuse new work, cancel in-flight deployments and wait for workers
    ///
    /// Deployments still buffered are left `pending` for the next start.
    pub async fn close(&self, grace: Duration) {
        if self.tx.lock().take().is_none() {
            return;
        }
        info!(in_flight = self.in_flight(), "Closing deployment queue");
        self.root.cancel();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let joined = tokio::time::timeout(grace, futures::future::join_all(handles)).await;
        if joined.is_err() {
            warn!(grace_secs = grace.as_secs(), "Workers did not stop in time, aborting");
            for abort in aborts {
                abort.abort();
            }
        }
        info!("Deployment queue closed");
    }
}

async fn worker_loop(
    worker: usize,
    engine: Arc<Engine>,
    rx: Arc<Mutex<mpsc::Receiver<i64>>>,
    root: CancellationToken,
    running: Arc<DashMap<i64, CancellationToken>>,
    cancelled: Arc<DashSet<i64>>,
) {
    debug!(worker, "Deployment worker started");
    loop {
        let next = {
            let mut rx = rx.lock().await;
            tokio::select! {
                biased;
                _ = root.cancelled() => None,
                id = rx.recv() => id,
            }
        };
        let Some(deployment_id) = next else {
            break;
        };

        let token = root.child_token();
        if cancelled.remove(&deployment_id).is_some() {
            token.cancel();
        }
        running.insert(deployment_id, token.clone());

        let result = AssertUnwindSafe(engine.execute(deployment_id, &token))
            .catch_unwind()
            .await;

        running.remove(&deployment_id);

        match result {
            Ok(Ok(())) => debug!(worker, deployment_id, "Deployment finished"),
            Ok(Err(e)) => debug!(worker, deployment_id, error = %e, "Deployment ended with error"),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(worker, deployment_id, panic = %message, "Deployment worker panicked");
                engine.record_failure(deployment_id, &DeployError::Panic(message)).await;
            }
        }
    }
    debug!(worker, "Deployment worker stopped");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn std::any::Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }

    #[test]
    fn test_enqueue_error_messages() {
        assert_eq!(EnqueueError::Full.to_string(), "deployment queue is full");
        assert_eq!(EnqueueError::Closed.to_string(), "deployment queue is closed");
    }
}
