//! Built-in statistical reconstruction scorer.
//!
//! Numeric columns are reconstructed by their (bootstrapped) mean, so a row's
//! numeric error is its squared standardized deviation. Categorical columns
//! contribute `1 - frequency` of the observed category. Row loss is the mean
//! contribution over the columns present in the row.

use super::{AnomalyDetector, ExplainColumn, Fitted, ModelScores, ScoringModel, EXPLAIN_COLUMNS};
use crate::error::{PipelineError, Result};
use crate::table::{Table, RESERVED_INDEX_COLUMN};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconstructionDetector {
    /// Rows sharing a value here collapse into one scored group.
    pub group_column: Option<String>,
}

impl ReconstructionDetector {
    pub fn new(group_column: Option<String>) -> Self {
        Self { group_column }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ColumnModel {
    Numeric {
        name: String,
        mean: f64,
        std: f64,
        binary: bool,
    },
    Categorical {
        name: String,
        freq: BTreeMap<String, f32>,
    },
}

impl ColumnModel {
    fn name(&self) -> &str {
        match self {
            ColumnModel::Numeric { name, .. } | ColumnModel::Categorical { name, .. } => name,
        }
    }

    /// Index into [`EXPLAIN_COLUMNS`].
    fn explain_slot(&self) -> usize {
        match self {
            ColumnModel::Numeric { binary: false, .. } => 0,
            ColumnModel::Numeric { binary: true, .. } => 1,
            ColumnModel::Categorical { .. } => 2,
        }
    }

    fn contribution(&self, v: &Value) -> Option<f32> {
        if v.is_null() {
            return None;
        }
        match self {
            ColumnModel::Numeric { mean, std, .. } => {
                let x = numeric(v)?;
                let z = x / std.max(f64::EPSILON) - mean / std.max(f64::EPSILON);
                Some(finite_f32(z * z))
            }
            ColumnModel::Categorical { freq, .. } => {
                Some(1.0 - freq.get(&category(v)).copied().unwrap_or(0.0))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconstructionModel {
    columns: Vec<ColumnModel>,
    group_column: Option<String>,
}

/// Finite numeric reading of a cell. "NaN"/"inf" strings are not numbers.
fn numeric(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|x| x.is_finite())
}

/// Saturate into the finite f32 range.
fn finite_f32(v: f64) -> f32 {
    if v.is_nan() {
        return f32::MAX;
    }
    v.clamp(f32::MIN as f64, f32::MAX as f64) as f32
}

fn category(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Population mean/std, computed on values scaled by the largest magnitude
/// so neither the sum nor the squared deviations overflow.
fn mean_std(xs: &[f64]) -> (f64, f64) {
    let scale = xs.iter().fold(0.0f64, |m, x| m.max(x.abs()));
    if xs.is_empty() || scale == 0.0 {
        return (0.0, 0.0);
    }
    let n = xs.len() as f64;
    let mean = xs.iter().map(|x| x / scale).sum::<f64>() / n;
    let var = xs.iter().map(|x| (x / scale - mean).powi(2)).sum::<f64>() / n;
    (mean * scale, var.sqrt() * scale)
}

impl AnomalyDetector for ReconstructionDetector {
    type Model = ReconstructionModel;

    fn fit(&self, rows: &Table, epochs: usize, rng: &mut StdRng) -> Result<Fitted<ReconstructionModel>> {
        if rows.is_empty() {
            return Err(PipelineError::Model("cannot fit on an empty table".into()));
        }
        let n = rows.len();
        let epochs = epochs.max(1);
        // Same bootstrap draw for every column within an epoch.
        let samples: Vec<Vec<usize>> = (0..epochs)
            .map(|_| (0..n).map(|_| rng.gen_range(0..n)).collect())
            .collect();

        let mut columns = Vec::new();
        for col in rows.columns() {
            if col.name == RESERVED_INDEX_COLUMN || Some(&col.name) == self.group_column.as_ref() {
                continue;
            }
            let present: Vec<&Value> = col.values.iter().filter(|v| !v.is_null()).collect();
            if present.is_empty() {
                continue;
            }
            let is_numeric = present.iter().all(|v| numeric(v).is_some());
            if is_numeric {
                let binary = present
                    .iter()
                    .all(|v| matches!(numeric(v), Some(x) if x == 0.0 || x == 1.0));
                let (mut mean, mut std) = (0.0, 0.0);
                for sample in &samples {
                    let xs: Vec<f64> = sample.iter().filter_map(|&i| numeric(&col.values[i])).collect();
                    // Bootstrap may miss every present value; fall back to the full column.
                    let (m, s) = if xs.is_empty() {
                        mean_std(&present.iter().filter_map(|v| numeric(v)).collect::<Vec<_>>())
                    } else {
                        mean_std(&xs)
                    };
                    mean += m;
                    std += s;
                }
                columns.push(ColumnModel::Numeric {
                    name: col.name.clone(),
                    mean: mean / epochs as f64,
                    std: std / epochs as f64,
                    binary,
                });
            } else {
                let mut counts: BTreeMap<String, usize> = BTreeMap::new();
                for v in &present {
                    *counts.entry(category(v)).or_default() += 1;
                }
                let total = present.len() as f32;
                columns.push(ColumnModel::Categorical {
                    name: col.name.clone(),
                    freq: counts.into_iter().map(|(k, c)| (k, c as f32 / total)).collect(),
                });
            }
        }
        if columns.is_empty() {
            return Err(PipelineError::Model("no usable feature columns".into()));
        }

        let model = ReconstructionModel {
            columns,
            group_column: self.group_column.clone(),
        };
        let train_loss = model.score(rows)?.loss;
        Ok(Fitted { model, train_loss })
    }
}

impl ReconstructionModel {
    pub fn feature_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name()).collect()
    }

    /// `[row][column]` contributions; None where the cell is missing.
    fn contributions(&self, rows: &Table) -> Vec<Vec<Option<f32>>> {
        let cols: Vec<Option<&crate::table::Column>> =
            self.columns.iter().map(|c| rows.column(c.name())).collect();
        (0..rows.len())
            .map(|r| {
                self.columns
                    .iter()
                    .zip(&cols)
                    .map(|(m, c)| c.and_then(|c| m.contribution(&c.values[r])))
                    .collect()
            })
            .collect()
    }

    /// Group key per row, in first-appearance order. None when ungrouped.
    fn group_keys(&self, rows: &Table) -> Option<(Vec<usize>, usize)> {
        let col = rows.column(self.group_column.as_deref()?)?;
        let mut ids: HashMap<String, usize> = HashMap::new();
        let keys = col
            .values
            .iter()
            .map(|v| {
                let next = ids.len();
                *ids.entry(category(v)).or_insert(next)
            })
            .collect();
        Some((keys, ids.len()))
    }
}

impl ScoringModel for ReconstructionModel {
    fn score(&self, rows: &Table) -> Result<ModelScores> {
        let per_row = self.contributions(rows);
        let ncols = self.columns.len();

        let (row_keys, computed) = match self.group_keys(rows) {
            Some((keys, groups)) => {
                let mut sums = vec![vec![(0.0f64, 0usize); ncols]; groups];
                for (r, &g) in keys.iter().enumerate() {
                    for (c, v) in per_row[r].iter().enumerate() {
                        if let Some(v) = v {
                            sums[g][c].0 += *v as f64;
                            sums[g][c].1 += 1;
                        }
                    }
                }
                let grouped = sums
                    .into_iter()
                    .map(|g| {
                        g.into_iter()
                            .map(|(s, n)| if n == 0 { None } else { Some(finite_f32(s / n as f64)) })
                            .collect()
                    })
                    .collect::<Vec<Vec<Option<f32>>>>();
                (Some(keys), grouped)
            }
            None => (None, per_row),
        };

        let mut loss = Vec::with_capacity(computed.len());
        let mut explain: Vec<Vec<Value>> = vec![Vec::with_capacity(computed.len()); EXPLAIN_COLUMNS.len()];
        for row in &computed {
            let present: Vec<f64> = row.iter().flatten().map(|&v| v as f64).collect();
            loss.push(if present.is_empty() {
                0.0
            } else {
                finite_f32(present.iter().sum::<f64>() / present.len() as f64)
            });

            let mut best: [Option<(f32, &str)>; 3] = [None; 3];
            for (m, v) in self.columns.iter().zip(row) {
                let Some(v) = *v else { continue };
                let slot = &mut best[m.explain_slot()];
                if slot.map_or(true, |(b, _)| v > b) {
                    *slot = Some((v, m.name()));
                }
            }
            for (i, b) in best.iter().enumerate() {
                explain[i].push(b.map_or(Value::Null, |(_, name)| Value::from(name)));
            }
        }

        Ok(ModelScores {
            loss,
            row_keys,
            explain: EXPLAIN_COLUMNS
                .iter()
                .zip(explain)
                .map(|(name, values)| ExplainColumn {
                    name: name.to_string(),
                    values,
                })
                .collect(),
        })
    }
}
