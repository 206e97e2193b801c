//! Anomaly scoring capability boundary.
//!
//! The pipeline only sees two traits: an [`AnomalyDetector`] that fits a model
//! on an entity's rows and a [`ScoringModel`] that scores rows. Model handles
//! must be serializable so registries can be persisted between runs.

mod reconstruction;

pub use reconstruction::{ReconstructionDetector, ReconstructionModel};

use crate::error::{PipelineError, Result};
use crate::table::Table;
use ndarray::Array2;
use rand::rngs::StdRng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

/// Explanation columns every scoring call reports (null when untrained).
pub const EXPLAIN_COLUMNS: [&str; 3] = ["num_col_max_loss", "bin_col_max_loss", "cat_col_max_loss"];

/// Metric columns in a response buffer.
pub const METRIC_DIMS: usize = 2;
pub const LOSS_COL: usize = 0;
pub const ZSCORE_COL: usize = 1;

pub trait ScoringModel: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Score rows. `loss` has one entry per computed row; when the model
    /// groups rows, `row_keys` maps each input row to its computed row.
    fn score(&self, rows: &Table) -> Result<ModelScores>;
}

pub trait AnomalyDetector: Send + Sync + 'static {
    type Model: ScoringModel;

    /// Fit a model; returns it with per-row training loss over `rows`.
    /// All randomness must come from `rng`.
    fn fit(&self, rows: &Table, epochs: usize, rng: &mut StdRng) -> Result<Fitted<Self::Model>>;
}

#[derive(Debug, Clone)]
pub struct Fitted<M> {
    pub model: M,
    pub train_loss: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplainColumn {
    pub name: String,
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct ModelScores {
    pub loss: Vec<f32>,
    pub row_keys: Option<Vec<usize>>,
    pub explain: Vec<ExplainColumn>,
}

/// Training-loss statistics a retained model is judged against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub mean: f32,
    pub std: f32,
}

impl Baseline {
    /// Population mean/std over finite losses. None if there are none.
    pub fn from_losses(losses: &[f32]) -> Option<Self> {
        let finite: Vec<f64> = losses
            .iter()
            .filter(|l| l.is_finite())
            .map(|&l| l as f64)
            .collect();
        if finite.is_empty() {
            return None;
        }
        let n = finite.len() as f64;
        let mean = finite.iter().sum::<f64>() / n;
        let var = finite.iter().map(|l| (l - mean).powi(2)).sum::<f64>() / n;
        Some(Self {
            mean: mean as f32,
            std: var.sqrt() as f32,
        })
    }

    pub fn zscore(&self, loss: f32) -> f32 {
        ((loss - self.mean) / self.std.max(f32::EPSILON)).abs()
    }
}

/// Output of one scoring call, ready for reconciliation.
#[derive(Debug, Clone)]
pub struct ScoredBatch {
    /// `[count, METRIC_DIMS]`: reconstruction loss, absolute z-score.
    pub probs: Array2<f32>,
    pub row_keys: Option<Vec<usize>>,
    /// One value per computed row.
    pub explain: Vec<ExplainColumn>,
}

impl ScoredBatch {
    pub fn count(&self) -> usize {
        self.probs.nrows()
    }

    /// Sentinel output for rows that have no trained model.
    pub fn untrained(rows: usize) -> Self {
        Self {
            probs: Array2::from_elem((rows, METRIC_DIMS), f32::NAN),
            row_keys: None,
            explain: EXPLAIN_COLUMNS
                .iter()
                .map(|name| ExplainColumn {
                    name: name.to_string(),
                    values: vec![Value::Null; rows],
                })
                .collect(),
        }
    }
}

/// Score `rows` with an optional model. A missing model or baseline never
/// reaches the capability: the result is NaN-filled with the input row count.
pub fn score_rows<M: ScoringModel>(
    model: Option<&M>,
    baseline: Option<Baseline>,
    rows: &Table,
) -> Result<ScoredBatch> {
    let (Some(model), Some(baseline)) = (model, baseline) else {
        return Ok(ScoredBatch::untrained(rows.len()));
    };
    let scores = model.score(rows)?;
    if let Some(keys) = &scores.row_keys {
        if keys.len() != rows.len() || keys.iter().any(|&k| k >= scores.loss.len()) {
            return Err(PipelineError::Model(format!(
                "row keys do not address {} computed rows for {} input rows",
                scores.loss.len(),
                rows.len()
            )));
        }
    }
    let count = scores.loss.len();
    let mut probs = Array2::from_elem((count, METRIC_DIMS), f32::NAN);
    for (i, &loss) in scores.loss.iter().enumerate() {
        probs[[i, LOSS_COL]] = loss;
        probs[[i, ZSCORE_COL]] = baseline.zscore(loss);
    }
    Ok(ScoredBatch {
        probs,
        row_keys: scores.row_keys,
        explain: scores.explain,
    })
}

/// One model plus its baseline, used by every entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedModel<M> {
    pub model: M,
    pub baseline: Baseline,
}

impl<M: ScoringModel> SharedModel<M> {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_vec(self)?)?;
        Ok(())
    }
}
