//! Cuts windows into bounded batches without copying the table.

use super::{AeMessage, InferenceBatch, MessageMeta, MultiMessage};
use std::ops::Range;

/// `ceil(total / batch)` contiguous, non-overlapping ranges covering `0..total`,
/// in increasing order. A zero batch size is treated as 1.
pub fn batch_ranges(total: usize, batch: usize) -> impl Iterator<Item = Range<usize>> {
    let batch = batch.max(1);
    (0..total)
        .step_by(batch)
        .map(move |start| start..(start + batch).min(total))
}

/// Windows of at most `batch` rows over the whole meta.
pub fn split_message(meta: &MessageMeta, batch: usize) -> Vec<MultiMessage> {
    let full = MultiMessage::new(meta.clone());
    batch_ranges(full.mess_count, batch)
        .map(|r| full.get_slice(r.start, r.end))
        .collect()
}

/// Split an entity message into windows carrying the same model handle.
pub fn split_ae_message<M>(msg: &AeMessage<M>, batch: usize) -> Vec<AeMessage<M>> {
    batch_ranges(msg.message.mess_count, batch)
        .map(|r| msg.get_slice(r.start, r.end))
        .collect()
}

/// Scoring batches for one window. `offset` is relative to the window, so it
/// addresses the window's own response buffer.
pub fn inference_batches<M>(msg: &AeMessage<M>, max_batch: usize) -> Vec<InferenceBatch<M>> {
    batch_ranges(msg.message.mess_count, max_batch)
        .map(|r| InferenceBatch {
            message: msg.get_slice(r.start, r.end),
            offset: r.start,
            count: r.end - r.start,
        })
        .collect()
}
