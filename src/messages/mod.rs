//! Messages passed between stages.
//!
//! Every message is a window over one [`SharedTable`]. Two coordinate pairs
//! are tracked: `(mess_offset, mess_count)` addresses logical rows of the
//! shared table, `(offset, count)` addresses rows of a compute or response
//! buffer. They coincide until a scoring call groups rows.

mod slicer;

pub use slicer::{batch_ranges, inference_batches, split_ae_message, split_message};

use crate::model::{Baseline, METRIC_DIMS};
use crate::table::{SharedTable, Table};
use ndarray::{s, Array2, ArrayView2};
use serde_json::Value;
use std::sync::Arc;

/// A whole entity table as it enters the pipeline.
#[derive(Debug, Clone)]
pub struct MessageMeta {
    pub table: SharedTable,
    pub entity_id: String,
}

impl MessageMeta {
    pub fn new(entity_id: impl Into<String>, table: Table) -> Self {
        Self {
            table: SharedTable::new(table),
            entity_id: entity_id.into(),
        }
    }

    pub fn count(&self) -> usize {
        self.table.len()
    }
}

/// A bounded window over a meta's table.
#[derive(Debug, Clone)]
pub struct MultiMessage {
    pub meta: MessageMeta,
    pub mess_offset: usize,
    pub mess_count: usize,
}

impl MultiMessage {
    pub fn new(meta: MessageMeta) -> Self {
        let mess_count = meta.count();
        Self {
            meta,
            mess_offset: 0,
            mess_count,
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.meta.entity_id
    }

    pub fn rows(&self) -> std::ops::Range<usize> {
        self.mess_offset..self.mess_offset + self.mess_count
    }

    /// Copy of this window's rows, optionally restricted to `columns`.
    pub fn get_meta(&self, columns: Option<&[String]>) -> Table {
        let table = self.meta.table.read();
        let rows = table.slice(self.rows());
        match columns {
            Some(cols) => rows.select(cols),
            None => rows,
        }
    }

    /// Write `values` into this window's rows of `column`; extra values are ignored.
    pub fn set_meta(&self, column: &str, values: &[Value]) {
        let n = values.len().min(self.mess_count);
        self.meta
            .table
            .write()
            .set_column_range(column, self.mess_offset, &values[..n]);
    }

    /// Sub-window `[start, stop)` relative to this window.
    pub fn get_slice(&self, start: usize, stop: usize) -> MultiMessage {
        let stop = stop.min(self.mess_count);
        let start = start.min(stop);
        MultiMessage {
            meta: self.meta.clone(),
            mess_offset: self.mess_offset + start,
            mess_count: stop - start,
        }
    }
}

/// Window plus the entity's model handle at the time it was cut.
#[derive(Debug)]
pub struct AeMessage<M> {
    pub message: MultiMessage,
    pub model: Option<Arc<M>>,
    pub baseline: Option<Baseline>,
}

impl<M> Clone for AeMessage<M> {
    fn clone(&self) -> Self {
        Self {
            message: self.message.clone(),
            model: self.model.clone(),
            baseline: self.baseline,
        }
    }
}

impl<M> AeMessage<M> {
    pub fn new(message: MultiMessage, model: Option<Arc<M>>, baseline: Option<Baseline>) -> Self {
        Self {
            message,
            model,
            baseline,
        }
    }

    pub fn get_slice(&self, start: usize, stop: usize) -> AeMessage<M> {
        AeMessage {
            message: self.message.get_slice(start, stop),
            model: self.model.clone(),
            baseline: self.baseline,
        }
    }
}

/// One scoring call's worth of rows. `offset` is where the batch's logical
/// rows start in the parent response buffer; `count` is the computed row
/// count, equal to `mess_count` until scoring reports otherwise.
#[derive(Debug)]
pub struct InferenceBatch<M> {
    pub message: AeMessage<M>,
    pub offset: usize,
    pub count: usize,
}

impl<M> Clone for InferenceBatch<M> {
    fn clone(&self) -> Self {
        Self {
            message: self.message.clone(),
            offset: self.offset,
            count: self.count,
        }
    }
}

impl<M> InferenceBatch<M> {
    pub fn mess_offset(&self) -> usize {
        self.message.message.mess_offset
    }

    pub fn mess_count(&self) -> usize {
        self.message.message.mess_count
    }
}

/// Dense per-row metrics for a whole message, NaN until reconciled.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseMemory {
    pub probs: Array2<f32>,
}

impl ResponseMemory {
    pub fn new(rows: usize) -> Self {
        Self {
            probs: Array2::from_elem((rows, METRIC_DIMS), f32::NAN),
        }
    }

    pub fn count(&self) -> usize {
        self.probs.nrows()
    }
}

/// Reconciled output: a window over the source table plus rows
/// `offset..offset + count` of a (possibly shared) response buffer.
#[derive(Debug, Clone)]
pub struct ResponseMessage {
    pub message: MultiMessage,
    pub memory: Arc<ResponseMemory>,
    pub offset: usize,
    pub count: usize,
}

impl ResponseMessage {
    pub fn probs(&self) -> ArrayView2<'_, f32> {
        self.memory
            .probs
            .slice(s![self.offset..self.offset + self.count, ..])
    }

    /// Rows as JSON objects with the metric columns appended.
    pub fn to_records(&self) -> Vec<serde_json::Map<String, Value>> {
        let probs = self.probs();
        let mut records = self.message.get_meta(None).to_records();
        for (i, rec) in records.iter_mut().enumerate() {
            rec.insert("entity_id".into(), Value::from(self.message.entity_id()));
            rec.insert("ae_anomaly_score".into(), json_f32(probs[[i, 0]]));
            rec.insert("ae_zscore".into(), json_f32(probs[[i, 1]]));
        }
        records
    }
}

fn json_f32(v: f32) -> Value {
    serde_json::Number::from_f64(v as f64).map_or(Value::Null, Value::Number)
}
