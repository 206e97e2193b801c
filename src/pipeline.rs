//! Stage wiring: deserialize → train → inference → filter.
//!
//! Entity messages are enforced and trained one at a time in arrival order,
//! which keeps each entity's history and model updates serialized. Windows
//! are then scored concurrently on the worker pool and handed downstream in
//! their original order.

use crate::config::AgentConfig;
use crate::error::{PipelineError, Result};
use crate::inference::InferenceStage;
use crate::messages::{AeMessage, MessageMeta, ResponseMessage};
use crate::model::AnomalyDetector;
use crate::postprocess::{FilterDetections, RiskEngine, RiskResult};
use crate::table::{ensure_sliceable, IndexStatus};
use crate::training::{ModelRegistry, TrainStage};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// A filtered row with its risk classification.
#[derive(Debug, Clone)]
pub struct Detection {
    pub risk: RiskResult,
    pub record: Map<String, Value>,
}

pub struct Pipeline<D: AnomalyDetector> {
    ensure_sliceable_index: bool,
    queue_depth: usize,
    train: Arc<TrainStage<D>>,
    inference: Arc<InferenceStage<D::Model>>,
    filter: FilterDetections,
    risk: RiskEngine,
}

impl<D: AnomalyDetector> Pipeline<D> {
    /// Build every stage. Registry restore or bulk training happens here,
    /// before any message is processed. Must run inside a tokio runtime.
    pub fn new(config: &AgentConfig, detector: D) -> Result<Self> {
        let train = TrainStage::new(config, detector)?;
        info!(source = ?train.model_source(), "training stage ready");
        Ok(Self {
            ensure_sliceable_index: config.pipeline.ensure_sliceable_index,
            queue_depth: config.pipeline.queue_depth,
            train: Arc::new(train),
            inference: Arc::new(InferenceStage::new(&config.pipeline, &config.features)),
            filter: FilterDetections::new(&config.filter),
            risk: RiskEngine::new(config.risk.clone()),
        })
    }

    pub fn registry(&self) -> &Arc<ModelRegistry<D::Model>> {
        self.train.registry()
    }

    /// Sliceability check on an incoming entity table.
    pub fn deserialize(&self, meta: &MessageMeta) -> Result<IndexStatus> {
        let status = ensure_sliceable(&mut meta.table.write(), self.ensure_sliceable_index)?;
        debug!(entity = %meta.entity_id, ?status, "index checked");
        Ok(status)
    }

    async fn train_one(&self, meta: MessageMeta) -> Result<Vec<AeMessage<D::Model>>> {
        self.deserialize(&meta)?;
        let train = self.train.clone();
        tokio::task::spawn_blocking(move || train.process(meta))
            .await
            .map_err(|e| PipelineError::Model(format!("training task failed: {}", e)))?
    }

    /// Run one entity message through every stage and return its response
    /// windows in row order.
    pub async fn process(&self, meta: MessageMeta) -> Result<Vec<ResponseMessage>> {
        let mut out = Vec::new();
        for window in self.train_one(meta).await? {
            out.push(self.inference.process(window).await?);
        }
        Ok(out)
    }

    /// Consume entity messages until `input` closes, sending reconciled
    /// windows to `output` in arrival order. Queues are bounded, so a slow
    /// consumer stalls the producer.
    pub async fn run(
        &self,
        mut input: mpsc::Receiver<MessageMeta>,
        output: mpsc::Sender<ResponseMessage>,
    ) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<JoinHandle<Result<ResponseMessage>>>(self.queue_depth.max(1));

        let producer = async {
            let tx = tx;
            while let Some(meta) = input.recv().await {
                for window in self.train_one(meta).await? {
                    let inference = self.inference.clone();
                    let handle = tokio::spawn(async move { inference.process(window).await });
                    if tx.send(handle).await.is_err() {
                        return Ok(());
                    }
                }
            }
            Ok::<(), PipelineError>(())
        };

        let consumer = async {
            while let Some(handle) = rx.recv().await {
                let resp = handle
                    .await
                    .map_err(|e| PipelineError::Model(format!("inference task failed: {}", e)))??;
                if output.send(resp).await.is_err() {
                    break;
                }
            }
            drop(rx);
            Ok::<(), PipelineError>(())
        };

        let (produced, consumed) = tokio::join!(producer, consumer);
        produced?;
        consumed
    }

    /// Filtered detections of a response window with their risk levels.
    pub fn detections(&self, resp: &ResponseMessage) -> Vec<Detection> {
        self.filter
            .process(resp)
            .iter()
            .flat_map(|m| self.risk.score(m).into_iter().zip(m.to_records()))
            .map(|(risk, record)| Detection { risk, record })
            .collect()
    }

    /// Wait for in-flight scoring calls and stop the worker pool.
    pub async fn shutdown(self) {
        drop(self.train);
        if let Ok(inference) = Arc::try_unwrap(self.inference) {
            inference.shutdown().await;
        }
    }
}
