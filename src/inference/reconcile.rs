//! Folding one scoring call's output into a message's response buffer.

use crate::error::{PipelineError, Result};
use crate::messages::{InferenceBatch, ResponseMemory};
use crate::model::ScoredBatch;
use ndarray::{s, ArrayView2, ArrayViewMut2};
use serde_json::Value;

/// Element-wise maximum of `outputs[keys[j]]` into `target[j]` for every
/// logical row `j`. NaN never wins over a number, so applying the same
/// outputs twice is a no-op.
pub fn blend_max(mut target: ArrayViewMut2<'_, f32>, outputs: ArrayView2<'_, f32>, keys: &[usize]) {
    for (j, &k) in keys.iter().enumerate() {
        let mut row = target.row_mut(j);
        for (slot, &v) in row.iter_mut().zip(outputs.row(k).iter()) {
            *slot = slot.max(v);
        }
    }
}

/// Merge `scored` into `memory` at the batch's offset.
///
/// When scoring kept row cardinality the outputs are copied verbatim.
/// Otherwise each logical row takes the maximum of its current value and the
/// computed row its key points at. Explanation columns are assigned (never
/// blended) into the batch's rows of the shared table, after the outputs
/// are known to fit, so a rejected batch leaves the table untouched.
pub fn reconcile<M>(
    memory: &mut ResponseMemory,
    batch: &mut InferenceBatch<M>,
    scored: &ScoredBatch,
) -> Result<()> {
    batch.count = scored.count();
    let mess_count = batch.mess_count();
    let offset = batch.offset;
    if offset + mess_count > memory.count() {
        return Err(PipelineError::Model(format!(
            "batch rows {}..{} exceed response buffer of {}",
            offset,
            offset + mess_count,
            memory.count()
        )));
    }

    let exact = batch.count == mess_count;
    let keys = scored.row_keys.as_deref();
    if !exact {
        let valid = keys
            .is_some_and(|k| k.len() == mess_count && k.iter().all(|&i| i < batch.count));
        if !valid {
            return Err(PipelineError::RowCountMismatchWithoutKey {
                offset,
                count: batch.count,
                mess_count,
            });
        }
    }

    let window = &batch.message.message;
    for col in &scored.explain {
        match keys {
            Some(keys) => {
                let values: Vec<Value> = keys
                    .iter()
                    .map(|&k| col.values.get(k).cloned().unwrap_or(Value::Null))
                    .collect();
                window.set_meta(&col.name, &values);
            }
            None => window.set_meta(&col.name, &col.values),
        }
    }

    let mut target = memory.probs.slice_mut(s![offset..offset + mess_count, ..]);
    match keys {
        Some(keys) if !exact => blend_max(target, scored.probs.view(), keys),
        _ => target.assign(&scored.probs),
    }
    Ok(())
}
