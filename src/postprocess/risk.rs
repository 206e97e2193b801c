//! Maps reconciled z-scores to risk levels with configurable thresholds.

use crate::config::RiskConfig;
use crate::messages::ResponseMessage;
use crate::model::{LOSS_COL, ZSCORE_COL};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// NaN (untrained entity) is always low.
    pub fn from_zscore(zscore: f32, config: &RiskConfig) -> Self {
        if zscore >= config.high_threshold {
            RiskLevel::High
        } else if zscore >= config.medium_threshold {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

/// Risk result for a single row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskResult {
    pub entity_id: String,
    /// Row label in the entity table
    pub row: usize,
    pub loss: f32,
    pub zscore: f32,
    pub level: RiskLevel,
}

pub struct RiskEngine {
    config: RiskConfig,
}

impl RiskEngine {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// One result per row. `row` is the row label of the source table, so
    /// copied detections still point at their original row.
    pub fn score(&self, msg: &ResponseMessage) -> Vec<RiskResult> {
        let probs = msg.probs();
        let table = msg.message.meta.table.read();
        let rows = msg.message.rows();
        let labels = &table.index()[rows.start.min(table.len())..rows.end.min(table.len())];
        probs
            .rows()
            .into_iter()
            .enumerate()
            .map(|(i, r)| RiskResult {
                entity_id: msg.message.entity_id().to_string(),
                row: labels
                    .get(i)
                    .map_or(msg.message.mess_offset + i, |&l| l as usize),
                loss: r[LOSS_COL],
                zscore: r[ZSCORE_COL],
                level: RiskLevel::from_zscore(r[ZSCORE_COL], &self.config),
            })
            .collect()
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }
}
