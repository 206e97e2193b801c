//! Keeps only rows whose metrics exceed a threshold.
//!
//! In copy mode the detection rows are copied into one new message with its
//! own table and buffer. In slice mode every contiguous run of detections
//! becomes a window over the original table and buffer, so nothing is copied
//! but one input may yield many outputs.

use crate::config::FilterConfig;
use crate::messages::{MessageMeta, MultiMessage, ResponseMemory, ResponseMessage};
use ndarray::{ArrayView2, Axis};
use std::sync::Arc;

pub struct FilterDetections {
    threshold: f32,
    copy: bool,
}

impl FilterDetections {
    pub fn new(config: &FilterConfig) -> Self {
        Self {
            threshold: config.threshold,
            copy: config.copy,
        }
    }

    /// `[start, stop)` runs of rows where any metric is above the threshold.
    /// NaN is never a detection.
    pub fn find_detections(&self, probs: ArrayView2<'_, f32>) -> Vec<(usize, usize)> {
        let mut runs = Vec::new();
        let mut start = None;
        for (i, row) in probs.rows().into_iter().enumerate() {
            let hit = row.iter().any(|&v| v > self.threshold);
            match (hit, start) {
                (true, None) => start = Some(i),
                (false, Some(s)) => {
                    runs.push((s, i));
                    start = None;
                }
                _ => {}
            }
        }
        if let Some(s) = start {
            runs.push((s, probs.nrows()));
        }
        runs
    }

    pub fn filter_copy(&self, msg: &ResponseMessage) -> Option<ResponseMessage> {
        let runs = self.find_detections(msg.probs());
        let rel: Vec<usize> = runs.iter().flat_map(|&(a, b)| a..b).collect();
        if rel.is_empty() {
            return None;
        }
        let abs: Vec<usize> = rel.iter().map(|i| msg.message.mess_offset + i).collect();
        let table = msg.message.meta.table.read().take(&abs);
        let probs = msg.probs().select(Axis(0), &rel);
        let count = rel.len();
        Some(ResponseMessage {
            message: MultiMessage::new(MessageMeta::new(msg.message.entity_id(), table)),
            memory: Arc::new(ResponseMemory { probs }),
            offset: 0,
            count,
        })
    }

    pub fn filter_slice(&self, msg: &ResponseMessage) -> Vec<ResponseMessage> {
        self.find_detections(msg.probs())
            .into_iter()
            .filter(|(a, b)| b > a)
            .map(|(a, b)| ResponseMessage {
                message: msg.message.get_slice(a, b),
                memory: msg.memory.clone(),
                offset: msg.offset + a,
                count: b - a,
            })
            .collect()
    }

    pub fn process(&self, msg: &ResponseMessage) -> Vec<ResponseMessage> {
        if self.copy {
            self.filter_copy(msg).into_iter().collect()
        } else {
            self.filter_slice(msg)
        }
    }
}
