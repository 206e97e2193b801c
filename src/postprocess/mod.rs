//! Downstream of inference: detection filtering and risk levels.

mod filter;
mod risk;

pub use filter::FilterDetections;
pub use risk::{RiskEngine, RiskLevel, RiskResult};
