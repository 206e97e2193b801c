//! Per-entity rolling history and model lifecycle.

use crate::error::{PipelineError, Result};
use crate::model::{AnomalyDetector, Baseline, Fitted};
use crate::table::Table;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Training settings shared by every manager of a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerSettings {
    pub epochs: usize,
    pub max_history: usize,
    pub seed: Option<u64>,
    /// Columns with at least two values needed before training.
    pub min_train_features: usize,
}

/// Result of one `train` call.
#[derive(Debug)]
pub struct TrainOutcome<M> {
    pub model: Arc<M>,
    pub train_loss: Vec<f32>,
    pub baseline: Option<Baseline>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(bound(serialize = "M: Serialize", deserialize = "M: serde::de::DeserializeOwned"))]
pub struct EntityModelManager<M> {
    entity_id: String,
    settings: ManagerSettings,
    /// Keep the fitted model and baseline after training.
    retain: bool,
    history: Option<Table>,
    model: Option<Arc<M>>,
    train_loss: Option<Vec<f32>>,
    baseline: Option<Baseline>,
}

impl<M> EntityModelManager<M> {
    pub fn new(entity_id: impl Into<String>, settings: ManagerSettings, retain: bool) -> Self {
        Self {
            entity_id: entity_id.into(),
            settings,
            retain,
            history: None,
            model: None,
            train_loss: None,
            baseline: None,
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Null until a retaining `train` call has succeeded.
    pub fn model(&self) -> Option<Arc<M>> {
        self.model.clone()
    }

    pub fn train_loss_scores(&self) -> Option<&[f32]> {
        self.train_loss.as_deref()
    }

    pub fn baseline(&self) -> Option<Baseline> {
        self.baseline
    }

    pub fn history(&self) -> Option<&Table> {
        self.history.as_ref()
    }

    pub fn history_len(&self) -> usize {
        self.history.as_ref().map_or(0, Table::len)
    }

    pub fn set_retain(&mut self, retain: bool) {
        self.retain = retain;
    }

    /// Install an externally fitted model (shared pretrained mode).
    pub fn install(&mut self, model: Arc<M>, baseline: Baseline) {
        self.model = Some(model);
        self.baseline = Some(baseline);
    }

    /// Rolling history (trimmed to make room) followed by `new_rows`, then
    /// capped to the most recent `max_history` rows.
    fn effective_training_set(&self, new_rows: &Table) -> Table {
        let max = self.settings.max_history;
        let combined = match &self.history {
            Some(history) => {
                let to_drop = (history.len() + new_rows.len()).saturating_sub(max);
                let kept = history.slice(to_drop.min(history.len())..history.len());
                kept.concat(new_rows)
            }
            None => new_rows.clone(),
        };
        combined.tail(max)
    }

    fn usable_features(&self, rows: &Table) -> Result<()> {
        let usable = rows.drop_sparse_columns(2).columns().len();
        if usable < self.settings.min_train_features {
            return Err(PipelineError::InsufficientFeatures {
                entity: self.entity_id.clone(),
                usable,
                required: self.settings.min_train_features,
            });
        }
        Ok(())
    }

    /// Train on history ++ `new_rows`.
    ///
    /// History is always advanced. The model and baseline are stored only when
    /// `retain` is set. Returns `Ok(None)` when the entity has too few usable
    /// feature columns; the model is left untouched in that case.
    pub fn train<D>(&mut self, detector: &D, new_rows: &Table) -> Result<Option<TrainOutcome<M>>>
    where
        D: AnomalyDetector<Model = M>,
    {
        let train_set = self.effective_training_set(new_rows);
        self.history = Some(train_set.clone());

        if train_set.is_empty() {
            return Ok(None);
        }
        if let Err(e) = self.usable_features(&train_set) {
            if e.is_recoverable() {
                warn!(entity = %self.entity_id, error = %e, "skipping training");
                return Ok(None);
            }
            return Err(e);
        }

        let mut rng = match self.settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        debug!(entity = %self.entity_id, rows = train_set.len(), "training model");
        let Fitted { model, train_loss } =
            detector.fit(&train_set, self.settings.epochs, &mut rng)?;
        debug!(entity = %self.entity_id, "training model complete");

        let model = Arc::new(model);
        let baseline = Baseline::from_losses(&train_loss);
        if self.retain {
            self.model = Some(model.clone());
            self.train_loss = Some(train_loss.clone());
            self.baseline = baseline;
        }
        Ok(Some(TrainOutcome {
            model,
            train_loss,
            baseline,
        }))
    }
}
