//! Encrypted local storage for detections and registry snapshots.

mod encrypted;

pub use encrypted::{SecureStore, StoredDetection};
