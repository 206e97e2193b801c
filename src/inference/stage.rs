//! Inference stage: score every batch of a window and reconcile the results
//! into one response message.

use super::pool::InferencePool;
use super::reconcile::reconcile;
use crate::config::{FeaturesConfig, PipelineConfig};
use crate::error::{PipelineError, Result};
use crate::features::model_columns;
use crate::messages::{inference_batches, AeMessage, ResponseMemory, ResponseMessage};
use crate::model::{ScoredBatch, ScoringModel};
use std::sync::Arc;
use tracing::debug;

pub struct InferenceStage<M> {
    pool: InferencePool<M>,
    max_batch_size: usize,
    features: FeaturesConfig,
}

impl<M: ScoringModel> InferenceStage<M> {
    /// Must be called inside a tokio runtime; spawns the worker pool.
    pub fn new(pipeline: &PipelineConfig, features: &FeaturesConfig) -> Self {
        Self {
            pool: InferencePool::new(pipeline.workers, pipeline.queue_depth),
            max_batch_size: pipeline.model_max_batch_size,
            features: features.clone(),
        }
    }

    pub async fn process(&self, msg: AeMessage<M>) -> Result<ResponseMessage> {
        let mess_count = msg.message.mess_count;
        let mut memory = ResponseMemory::new(mess_count);
        let columns = {
            let table = msg.message.meta.table.read();
            model_columns(&table, &self.features)
        };

        let mut batches = inference_batches(&msg, self.max_batch_size);
        let mut pending = Vec::with_capacity(batches.len());
        for batch in &batches {
            // Untrained entities never reach the pool.
            let handle = match &batch.message.model {
                Some(model) => {
                    let rows = batch.message.message.get_meta(Some(&columns));
                    Some(
                        self.pool
                            .submit(Some(model.clone()), batch.message.baseline, rows)
                            .await?,
                    )
                }
                None => None,
            };
            pending.push(handle);
        }

        for (batch, handle) in batches.iter_mut().zip(pending) {
            let scored = match handle {
                Some(rx) => rx.await.map_err(|_| PipelineError::WorkerPoolClosed)??,
                None => ScoredBatch::untrained(batch.mess_count()),
            };
            reconcile(&mut memory, batch, &scored)?;
        }
        debug!(
            entity = %msg.message.entity_id(),
            mess_offset = msg.message.mess_offset,
            mess_count,
            "window scored"
        );

        Ok(ResponseMessage {
            message: msg.message,
            memory: Arc::new(memory),
            offset: 0,
            count: mess_count,
        })
    }

    pub async fn shutdown(self) {
        self.pool.shutdown().await;
    }
}
