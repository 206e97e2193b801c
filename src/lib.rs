//! UEBA Agent: per-entity behavioral anomaly scoring pipeline.
//!
//! Modular structure:
//! - [`table`]: Shared row-labeled tables and sliceability enforcement
//! - [`messages`]: Message windows, batch slicing, response buffers
//! - [`features`]: Entity sources and feature column selection
//! - [`model`]: Scoring capability traits and the built-in detector
//! - [`training`]: Per-entity model managers and the model registry
//! - [`inference`]: Worker pool, inference stage, result reconciliation
//! - [`postprocess`]: Detection filtering and risk levels
//! - [`storage`]: Encrypted local storage
//! - [`logging`]: Structured JSON logging

pub mod config;
pub mod error;
pub mod table;
pub mod messages;
pub mod features;
pub mod model;
pub mod training;
pub mod inference;
pub mod postprocess;
pub mod pipeline;
pub mod storage;
pub mod logging;

pub use config::AgentConfig;
pub use error::{PipelineError, Result};
pub use table::{SharedTable, Table};
pub use messages::{AeMessage, MessageMeta, MultiMessage, ResponseMemory, ResponseMessage};
pub use model::{AnomalyDetector, ReconstructionDetector, ScoringModel};
pub use training::{EntityModelManager, ModelRegistry, TrainStage};
pub use inference::InferenceStage;
pub use pipeline::{Detection, Pipeline};
pub use storage::SecureStore;
pub use logging::StructuredLogger;
