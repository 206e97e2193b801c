//! Newline-delimited JSON record files.

use super::{split_per_entity, EntitySource};
use crate::config::FeaturesConfig;
use crate::error::Result;
use crate::table::Table;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct NdjsonSource;

impl NdjsonSource {
    /// Parse JSON objects, one per line. Each row's natural index is its
    /// position among the objects read; blank and non-object lines are skipped.
    pub fn read_records(reader: impl BufRead) -> Result<Vec<(i64, Map<String, Value>)>> {
        let mut out = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(line)? {
                Value::Object(obj) => out.push((out.len() as i64, obj)),
                _ => warn!(line = lineno + 1, "skipping non-object record"),
            }
        }
        Ok(out)
    }

    pub fn read_entity_tables(
        reader: impl BufRead,
        features: &FeaturesConfig,
    ) -> Result<BTreeMap<String, Table>> {
        Ok(split_per_entity(Self::read_records(reader)?, features))
    }
}

impl EntitySource for NdjsonSource {
    fn files_to_entity_tables(
        &self,
        files: &[PathBuf],
        features: &FeaturesConfig,
        repeat_count: usize,
    ) -> Result<BTreeMap<String, Table>> {
        let mut rows = Vec::new();
        for path in files {
            let file = std::fs::File::open(path)?;
            let records = Self::read_records(std::io::BufReader::new(file))?;
            debug!(path = %path.display(), rows = records.len(), "read training file");
            for _ in 0..repeat_count.max(1) {
                rows.extend(records.iter().cloned());
            }
        }
        Ok(split_per_entity(rows, features))
    }
}
