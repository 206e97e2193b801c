//! Agent configuration. Consumed by the stages; loading is best-effort JSON.

use crate::error::{PipelineError, Result};
use crate::features::SourceKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Data directory (encrypted detection store, registry checkpoints)
    pub data_dir: PathBuf,
    /// Batching, queueing and worker settings
    pub pipeline: PipelineConfig,
    /// Entity and feature column layout
    pub features: FeaturesConfig,
    /// Per-entity model training
    pub training: TrainingConfig,
    /// Detection filtering
    pub filter: FilterConfig,
    /// Risk level thresholds on z-score
    pub risk: RiskConfig,
    /// Logging
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum rows per message window handed from the training stage
    pub pipeline_batch_size: usize,
    /// Maximum rows per scoring call
    pub model_max_batch_size: usize,
    /// Repair non-sliceable indexes instead of only warning
    pub ensure_sliceable_index: bool,
    /// Bounded depth of every inter-stage queue and the worker pool input
    pub queue_depth: usize,
    /// Scoring workers
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeaturesConfig {
    /// Column holding the entity key (user / account id)
    pub userid_column: String,
    /// Only keep this entity when set
    pub userid_filter: Option<String>,
    /// Columns handed to the model; empty means every column
    pub feature_columns: Vec<String>,
    /// Minimum usable feature columns before an entity is trained
    pub min_train_features: usize,
    /// Rows sharing a value in this column are scored as one group
    pub group_column: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    /// Rolling history bound per entity
    pub max_history: usize,
    /// Seed every training call for reproducible models
    pub seed: Option<u64>,
    /// Registry snapshot from a prior run
    pub pretrained_path: Option<PathBuf>,
    /// Single model (with its baseline) shared by every entity
    pub shared_model_path: Option<PathBuf>,
    /// Bulk-train files before streaming begins
    pub train_data_glob: Option<String>,
    /// Process glob matches in sorted order
    pub sort_glob: bool,
    /// Reader for bulk-train files
    pub source: Option<SourceKind>,
    /// Times each bulk-train file's rows are repeated
    pub repeat_count: usize,
    /// Where the bulk-trained registry snapshot is written
    pub models_output_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Rows with any metric above this are detections
    pub threshold: f32,
    /// Copy detection rows into a new table instead of emitting sliced windows
    pub copy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Z-score at or above this is high risk
    pub high_threshold: f32,
    /// Z-score at or above this is medium risk
    pub medium_threshold: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".ueba"),
            pipeline: PipelineConfig::default(),
            features: FeaturesConfig::default(),
            training: TrainingConfig::default(),
            filter: FilterConfig::default(),
            risk: RiskConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pipeline_batch_size: 256,
            model_max_batch_size: 1024,
            ensure_sliceable_index: true,
            queue_depth: 64,
            workers: 4,
        }
    }
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            userid_column: "userid".to_string(),
            userid_filter: None,
            feature_columns: Vec::new(),
            min_train_features: 1,
            group_column: None,
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 25,
            max_history: 1000,
            seed: None,
            pretrained_path: None,
            shared_model_path: None,
            train_data_glob: None,
            sort_glob: false,
            source: None,
            repeat_count: 1,
            models_output_path: None,
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            threshold: 3.0,
            copy: true,
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            high_threshold: 6.0,
            medium_threshold: 3.0,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

impl AgentConfig {
    /// Load from JSON file if present; otherwise return default
    pub fn load(path: &std::path::Path) -> Self {
        if path.exists() {
            if let Ok(data) = std::fs::read_to_string(path) {
                match serde_json::from_str::<AgentConfig>(&data) {
                    Ok(c) => return c,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "invalid config; using defaults")
                    }
                }
            }
        }
        Self::default()
    }

    /// Reject settings no stage can run with.
    pub fn validate(&self) -> Result<()> {
        let p = &self.pipeline;
        if p.pipeline_batch_size == 0 || p.model_max_batch_size == 0 {
            return Err(PipelineError::BadConfiguration(
                "batch sizes must be non-zero".into(),
            ));
        }
        if p.workers == 0 || p.queue_depth == 0 {
            return Err(PipelineError::BadConfiguration(
                "workers and queue_depth must be non-zero".into(),
            ));
        }
        if self.training.max_history == 0 {
            return Err(PipelineError::BadConfiguration(
                "max_history must be non-zero".into(),
            ));
        }
        if self.risk.medium_threshold > self.risk.high_threshold {
            return Err(PipelineError::BadConfiguration(
                "risk.medium_threshold exceeds risk.high_threshold".into(),
            ));
        }
        Ok(())
    }
}
