//! Per-entity model lifecycle: rolling history, training, registry.

mod manager;
mod registry;
mod stage;

pub use manager::{EntityModelManager, ManagerSettings, TrainOutcome};
pub use registry::{lock_manager, ManagerHandle, ModelRegistry};
pub use stage::{expand_glob, ModelSource, TrainStage};
