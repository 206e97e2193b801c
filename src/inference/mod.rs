//! Scoring: worker pool, inference stage and result reconciliation.

mod pool;
mod reconcile;
mod stage;

pub use pool::{InferencePool, ScoreHandle};
pub use reconcile::{blend_max, reconcile};
pub use stage::InferenceStage;
