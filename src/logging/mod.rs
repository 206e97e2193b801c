//! Structured logging setup and JSON line output.

mod format;

pub use format::{DetectionLine, StructuredLogger};
