//! Pipeline error kinds. Recoverable kinds are absorbed by the component that
//! raises them; the rest stop processing for the pipeline instance.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("table index is not sliceable: {0}")]
    NonSliceableIndex(String),

    #[error("entity '{entity}' has {usable} usable feature columns, need {required}")]
    InsufficientFeatures {
        entity: String,
        usable: usize,
        required: usize,
    },

    #[error("source kind must be configured together with train_data_glob")]
    MissingSourceClass,

    #[error("bad configuration: {0}")]
    BadConfiguration(String),

    #[error("model registry load failed: {0}")]
    RegistryLoadFailure(String),

    #[error("batch at offset {offset} computed {count} rows for {mess_count} logical rows without row keys")]
    RowCountMismatchWithoutKey {
        offset: usize,
        count: usize,
        mess_count: usize,
    },

    #[error("model error: {0}")]
    Model(String),

    #[error("inference worker pool closed")]
    WorkerPoolClosed,

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Whether the error is absorbed locally rather than stopping the pipeline.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, PipelineError::InsufficientFeatures { .. })
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(e: rusqlite::Error) -> Self {
        PipelineError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
