//! Positional-slice safety for shared tables.

use super::{Column, Table};
use crate::error::{PipelineError, Result};
use serde_json::Value;
use std::collections::HashSet;
use tracing::warn;

/// Column that keeps the natural index after a repair.
pub const RESERVED_INDEX_COLUMN: &str = "_index_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStatus {
    /// Index already 0..N-1; nothing touched.
    Sliceable,
    /// Index replaced by 0..N-1, natural index moved to [`RESERVED_INDEX_COLUMN`].
    Repaired { duplicates: usize },
    /// Left as-is; positional slicing still works but natural ids repeat or are out of order.
    NonUnique { duplicates: usize },
}

/// True iff row identities are exactly 0, 1, .., N-1.
pub fn has_sliceable_index(table: &Table) -> bool {
    table
        .index()
        .iter()
        .enumerate()
        .all(|(pos, &id)| id == pos as i64)
}

fn duplicate_count(index: &[i64]) -> usize {
    let mut seen = HashSet::with_capacity(index.len());
    index.iter().filter(|id| !seen.insert(**id)).count()
}

/// Check the table index and, when `required`, repair it in place.
///
/// Emits exactly one warning whenever the index was not already sliceable.
/// Repair fails only if the reserved column is already taken, since the
/// natural index would otherwise be lost.
pub fn ensure_sliceable(table: &mut Table, required: bool) -> Result<IndexStatus> {
    if has_sliceable_index(table) {
        return Ok(IndexStatus::Sliceable);
    }
    let duplicates = duplicate_count(table.index());

    if !required {
        warn!(
            rows = table.len(),
            duplicates,
            "non-sliceable index on incoming table; slices may be slower, consider ensure_sliceable_index"
        );
        return Ok(IndexStatus::NonUnique { duplicates });
    }

    if table.has_column(RESERVED_INDEX_COLUMN) {
        return Err(PipelineError::NonSliceableIndex(format!(
            "cannot retain existing index, column '{}' already present",
            RESERVED_INDEX_COLUMN
        )));
    }

    let natural: Vec<Value> = table.index().iter().map(|&id| Value::from(id)).collect();
    table.insert_column_front(Column::new(RESERVED_INDEX_COLUMN, natural));
    let len = table.len() as i64;
    *table.index_mut() = (0..len).collect();

    warn!(
        rows = len,
        duplicates,
        column = RESERVED_INDEX_COLUMN,
        "table index was not unique and monotonic; replaced, original retained in column"
    );
    Ok(IndexStatus::Repaired { duplicates })
}
