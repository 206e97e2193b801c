//! Entity sources: turn raw record files into one table per entity and
//! derive the model's feature columns.

mod ndjson;

pub use ndjson::NdjsonSource;

use crate::config::FeaturesConfig;
use crate::error::Result;
use crate::table::Table;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Source formats selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Ndjson,
}

impl SourceKind {
    pub fn build(self) -> Box<dyn EntitySource> {
        match self {
            SourceKind::Ndjson => Box::new(NdjsonSource),
        }
    }
}

pub trait EntitySource: Send + Sync {
    /// Read every file and split the rows per entity, in file then row order.
    fn files_to_entity_tables(
        &self,
        files: &[PathBuf],
        features: &FeaturesConfig,
        repeat_count: usize,
    ) -> Result<BTreeMap<String, Table>>;

    /// Reduce a raw entity table to the entity column plus the configured
    /// feature columns.
    fn derive_features(&self, table: Table, features: &FeaturesConfig) -> Table {
        if features.feature_columns.is_empty() {
            return table;
        }
        let mut keep = vec![features.userid_column.clone()];
        keep.extend(
            features
                .feature_columns
                .iter()
                .filter(|c| **c != features.userid_column)
                .cloned(),
        );
        if let Some(g) = &features.group_column {
            if !keep.contains(g) {
                keep.push(g.clone());
            }
        }
        table.select(&keep)
    }
}

/// Split `(natural index, record)` rows per entity. Rows without an entity
/// key, or filtered out by `userid_filter`, are dropped.
pub fn split_per_entity(
    rows: Vec<(i64, Map<String, Value>)>,
    features: &FeaturesConfig,
) -> BTreeMap<String, Table> {
    let mut per_entity: BTreeMap<String, Vec<(i64, Map<String, Value>)>> = BTreeMap::new();
    for (idx, rec) in rows {
        let key = match rec.get(&features.userid_column) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => continue,
            Some(other) => other.to_string(),
        };
        if let Some(filter) = &features.userid_filter {
            if &key != filter {
                continue;
            }
        }
        per_entity.entry(key).or_default().push((idx, rec));
    }

    per_entity
        .into_iter()
        .filter_map(|(key, rows)| {
            let (index, records): (Vec<i64>, Vec<Map<String, Value>>) = rows.into_iter().unzip();
            let table = Table::from_records(&records);
            Table::with_index(index, table.columns().to_vec()).map(|t| (key, t))
        })
        .collect()
}

/// Columns handed to the model for an entity table: the configured feature
/// columns (plus the group column), or every column except the entity key
/// and the reserved index and explanation columns when none are configured.
pub fn model_columns(table: &Table, features: &FeaturesConfig) -> Vec<String> {
    if features.feature_columns.is_empty() {
        return table
            .column_names()
            .into_iter()
            .filter(|n| {
                *n != features.userid_column
                    && *n != crate::table::RESERVED_INDEX_COLUMN
                    && !crate::model::EXPLAIN_COLUMNS.contains(n)
            })
            .map(str::to_string)
            .collect();
    }
    let mut cols: Vec<String> = features
        .feature_columns
        .iter()
        .filter(|c| table.has_column(c))
        .cloned()
        .collect();
    if let Some(g) = &features.group_column {
        if table.has_column(g) && !cols.contains(g) {
            cols.push(g.clone());
        }
    }
    cols
}
