//! Bounded worker pool for scoring calls.

use crate::error::{PipelineError, Result};
use crate::model::{score_rows, Baseline, ScoredBatch, ScoringModel};
use crate::table::Table;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

struct Job<M> {
    model: Option<Arc<M>>,
    baseline: Option<Baseline>,
    rows: Table,
    reply: oneshot::Sender<Result<ScoredBatch>>,
}

/// Pending result of a submitted scoring call.
pub type ScoreHandle = oneshot::Receiver<Result<ScoredBatch>>;

pub struct InferencePool<M> {
    tx: mpsc::Sender<Job<M>>,
    workers: Vec<JoinHandle<()>>,
}

impl<M: ScoringModel> InferencePool<M> {
    /// Spawn `workers` tasks on the current tokio runtime. At most
    /// `queue_depth` jobs wait for a worker; further submits wait.
    pub fn new(workers: usize, queue_depth: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job<M>>(queue_depth.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..workers.max(1))
            .map(|id| {
                let rx = rx.clone();
                tokio::spawn(async move {
                    loop {
                        let job = rx.lock().await.recv().await;
                        let Some(Job {
                            model,
                            baseline,
                            rows,
                            reply,
                        }) = job
                        else {
                            break;
                        };
                        let res = tokio::task::spawn_blocking(move || {
                            score_rows(model.as_deref(), baseline, &rows)
                        })
                        .await
                        .unwrap_or_else(|e| Err(PipelineError::Model(format!("scoring task failed: {}", e))));
                        // Caller may have gone away; nothing to cancel.
                        let _ = reply.send(res);
                    }
                    debug!(worker = id, "inference worker stopped");
                })
            })
            .collect();
        Self { tx, workers }
    }

    /// Queue one scoring call, waiting while the queue is full.
    pub async fn submit(
        &self,
        model: Option<Arc<M>>,
        baseline: Option<Baseline>,
        rows: Table,
    ) -> Result<ScoreHandle> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Job {
                model,
                baseline,
                rows,
                reply,
            })
            .await
            .map_err(|_| PipelineError::WorkerPoolClosed)?;
        Ok(rx)
    }

    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Stop accepting work and wait for queued jobs to finish.
    pub async fn shutdown(self) {
        drop(self.tx);
        for w in self.workers {
            let _ = w.await;
        }
    }
}
