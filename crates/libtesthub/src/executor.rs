use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use serde_json::{Value, json};
use testhub_protocol::{PeerId, Response, Tid, command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::HubError;
use crate::outbound::{Outbound, enqueue_response};
use crate::services::MonitorSink;

/// One pending interactive exchange.
#[derive(Debug)]
pub struct InteractJob {
    pub peer_id: PeerId,
    pub tid: Tid,
    pub body: Value,
    pub timeout: Duration,
    pub outbound: Outbound,
}

/// Runs interactive exchanges one at a time, in submission order, on a
/// single background task.
pub struct InteractExecutor {
    tx: Mutex<Option<mpsc::UnboundedSender<InteractJob>>>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
    submitted: AtomicU64,
}

impl InteractExecutor {
    /// Spawn the worker. Must be called from within a tokio runtime.
    pub fn start(monitor: Arc<dyn MonitorSink>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let worker = tokio::spawn(run_worker(rx, monitor, Arc::clone(&pending)));
        info!("interactive executor started");
        Self {
            tx: Mutex::new(Some(tx)),
            worker: tokio::sync::Mutex::new(Some(worker)),
            pending,
            submitted: AtomicU64::new(0),
        }
    }

    /// Queue a job without waiting for it to run.
    pub fn submit(&self, job: InteractJob) -> Result<(), HubError> {
        let guard = self.tx.lock().unwrap_or_else(|p| p.into_inner());
        let tx = guard.as_ref().ok_or(HubError::ExecutorStopped)?;
        self.pending.fetch_add(1, Ordering::SeqCst);
        if tx.send(job).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(HubError::ExecutorStopped);
        }
        self.submitted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Stop accepting jobs, then wait for every queued job to finish.
    pub async fn shutdown(&self) {
        let tx = self.tx.lock().unwrap_or_else(|p| p.into_inner()).take();
        drop(tx);
        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(err) = worker.await {
                error!("interactive worker ended abnormally: {err}");
            }
            info!("interactive executor stopped");
        }
    }

    /// Jobs queued or in flight.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Jobs accepted since start.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::SeqCst)
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<InteractJob>,
    monitor: Arc<dyn MonitorSink>,
    pending: Arc<AtomicUsize>,
) {
    while let Some(job) = rx.recv().await {
        let peer_id = job.peer_id.clone();
        let tid = job.tid;
        if AssertUnwindSafe(run_job(monitor.as_ref(), job))
            .catch_unwind()
            .await
            .is_err()
        {
            error!(peer_id = %peer_id, tid, "interactive job panicked");
        }
        pending.fetch_sub(1, Ordering::SeqCst);
    }
    debug!("interactive queue drained");
}

async fn run_job(monitor: &dyn MonitorSink, job: InteractJob) {
    debug!(peer_id = %job.peer_id, tid = job.tid, timeout = ?job.timeout, "interact called");
    let rsp = match monitor.interact(&job.body, job.timeout).await {
        Ok(rsp) => rsp,
        Err(err) => {
            warn!(peer_id = %job.peer_id, tid = job.tid, "interact failed: {err:#}");
            None
        }
    };
    let body = json!({ "cmd": command::INTERACT, "rsp": rsp });
    if let Err(err) = enqueue_response(&job.outbound, Response::ok(job.tid, body)) {
        warn!(peer_id = %job.peer_id, tid = job.tid, "interact reply not delivered: {err}");
    }
}
