//! Row-labeled tables of event records shared between message windows.
//!
//! A [`Table`] is column-major: every column holds one `serde_json::Value` per
//! row, and `index` holds each row's natural identity. Positions (0..len) are
//! what windows address; the natural index only matters for sliceability.

mod index;

pub use index::{ensure_sliceable, has_sliceable_index, IndexStatus, RESERVED_INDEX_COLUMN};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::ops::Range;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub values: Vec<Value>,
}

impl Column {
    pub fn new(name: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    pub fn non_null_count(&self) -> usize {
        self.values.iter().filter(|v| !v.is_null()).count()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    index: Vec<i64>,
    columns: Vec<Column>,
}

impl Table {
    /// Build from JSON objects; columns appear in first-seen order and missing
    /// cells are null. The index is 0..N-1.
    pub fn from_records(records: &[Map<String, Value>]) -> Self {
        let mut names: Vec<String> = Vec::new();
        for rec in records {
            for k in rec.keys() {
                if !names.iter().any(|n| n == k) {
                    names.push(k.clone());
                }
            }
        }
        let columns = names
            .into_iter()
            .map(|name| {
                let values = records
                    .iter()
                    .map(|r| r.get(&name).cloned().unwrap_or(Value::Null))
                    .collect();
                Column { name, values }
            })
            .collect();
        Self {
            index: (0..records.len() as i64).collect(),
            columns,
        }
    }

    /// Build from explicit index and columns. Every column must match the index length.
    pub fn with_index(index: Vec<i64>, columns: Vec<Column>) -> Option<Self> {
        if columns.iter().any(|c| c.values.len() != index.len()) {
            return None;
        }
        Some(Self { index, columns })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn index(&self) -> &[i64] {
        &self.index
    }

    pub(crate) fn index_mut(&mut self) -> &mut Vec<i64> {
        &mut self.index
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn value(&self, row: usize, name: &str) -> Option<&Value> {
        self.column(name).and_then(|c| c.values.get(row))
    }

    /// Add or replace a whole column. Returns false when the length does not match.
    pub fn set_column(&mut self, name: &str, values: Vec<Value>) -> bool {
        if values.len() != self.len() {
            return false;
        }
        match self.columns.iter_mut().find(|c| c.name == name) {
            Some(c) => c.values = values,
            None => self.columns.push(Column::new(name, values)),
        }
        true
    }

    /// Assign `values` into rows `offset..offset + values.len()` of a column,
    /// creating it (null-filled) when missing. Rows past the end are dropped.
    pub fn set_column_range(&mut self, name: &str, offset: usize, values: &[Value]) {
        let len = self.len();
        if !self.has_column(name) {
            self.columns.push(Column::new(name, vec![Value::Null; len]));
        }
        if let Some(col) = self.columns.iter_mut().find(|c| c.name == name) {
            for (i, v) in values.iter().enumerate() {
                match col.values.get_mut(offset + i) {
                    Some(slot) => *slot = v.clone(),
                    None => break,
                }
            }
        }
    }

    /// Insert a column at the front (used for the reserved index column).
    pub(crate) fn insert_column_front(&mut self, column: Column) {
        self.columns.insert(0, column);
    }

    /// Copy of the rows in `range`, clamped to the table.
    pub fn slice(&self, range: Range<usize>) -> Table {
        let end = range.end.min(self.len());
        let start = range.start.min(end);
        Table {
            index: self.index[start..end].to_vec(),
            columns: self
                .columns
                .iter()
                .map(|c| Column::new(c.name.clone(), c.values[start..end].to_vec()))
                .collect(),
        }
    }

    /// Rows at the given positions, in that order.
    pub fn take(&self, positions: &[usize]) -> Table {
        let positions: Vec<usize> = positions.iter().copied().filter(|&p| p < self.len()).collect();
        Table {
            index: positions.iter().map(|&p| self.index[p]).collect(),
            columns: self
                .columns
                .iter()
                .map(|c| {
                    Column::new(
                        c.name.clone(),
                        positions.iter().map(|&p| c.values[p].clone()).collect(),
                    )
                })
                .collect(),
        }
    }

    /// Keep only the named columns that exist, in the order given.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Table {
        Table {
            index: self.index.clone(),
            columns: names
                .iter()
                .filter_map(|n| self.column(n.as_ref()).cloned())
                .collect(),
        }
    }

    /// The last `n` rows.
    pub fn tail(&self, n: usize) -> Table {
        let start = self.len().saturating_sub(n);
        self.slice(start..self.len())
    }

    /// Append `other` below `self`. Columns missing on either side are null-filled.
    pub fn concat(&self, other: &Table) -> Table {
        let mut out = self.clone();
        let top = self.len();
        for col in &other.columns {
            if !out.has_column(&col.name) {
                out.columns.push(Column::new(col.name.clone(), vec![Value::Null; top]));
            }
        }
        for col in out.columns.iter_mut() {
            match other.column(&col.name) {
                Some(src) => col.values.extend(src.values.iter().cloned()),
                None => col.values.extend(std::iter::repeat(Value::Null).take(other.len())),
            }
        }
        out.index.extend_from_slice(&other.index);
        out
    }

    /// Drop columns with fewer than `min_non_null` non-null cells.
    pub fn drop_sparse_columns(&self, min_non_null: usize) -> Table {
        Table {
            index: self.index.clone(),
            columns: self
                .columns
                .iter()
                .filter(|c| c.non_null_count() >= min_non_null)
                .cloned()
                .collect(),
        }
    }

    /// Rows back as JSON objects (index not included).
    pub fn to_records(&self) -> Vec<Map<String, Value>> {
        (0..self.len())
            .map(|row| {
                self.columns
                    .iter()
                    .map(|c| (c.name.clone(), c.values[row].clone()))
                    .collect()
            })
            .collect()
    }
}

/// One table aliased by every window cut from it.
#[derive(Debug, Clone, Default)]
pub struct SharedTable(Arc<RwLock<Table>>);

impl SharedTable {
    pub fn new(table: Table) -> Self {
        Self(Arc::new(RwLock::new(table)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Table> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Table> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ptr_eq(&self, other: &SharedTable) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
