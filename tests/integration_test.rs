//! Integration test: config load, risk levels, untrained scoring, storage.

use ueba_agent::{
    config::{AgentConfig, RiskConfig},
    messages::{MessageMeta, MultiMessage, ResponseMemory, ResponseMessage},
    model::{score_rows, ReconstructionModel, ScoredBatch},
    postprocess::{RiskEngine, RiskLevel},
    storage::SecureStore,
    PipelineError,
};
use ndarray::array;
use std::path::Path;
use std::sync::Arc;

mod common;

#[test]
fn config_load_default() {
    let c = AgentConfig::load(Path::new("nonexistent.json"));
    assert_eq!(c.training.max_history, 1000);
    assert_eq!(c.training.epochs, 25);
    assert!(c.pipeline.ensure_sliceable_index);
    assert!(c.validate().is_ok());
}

#[test]
fn config_partial_json_keeps_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, r#"{"training": {"max_history": 50, "seed": 7}}"#).unwrap();
    let c = AgentConfig::load(&path);
    assert_eq!(c.training.max_history, 50);
    assert_eq!(c.training.seed, Some(7));
    assert_eq!(c.pipeline.pipeline_batch_size, 256);
}

#[test]
fn config_rejects_zero_batch_size() {
    // Source kind is checked when the model source is resolved, not here.
    let mut c = AgentConfig::default();
    c.training.train_data_glob = Some("data/*.jsonl".into());
    assert!(c.validate().is_ok());

    let mut c = AgentConfig::default();
    c.pipeline.model_max_batch_size = 0;
    assert!(matches!(c.validate(), Err(PipelineError::BadConfiguration(_))));
}

#[test]
fn untrained_scoring_is_nan_shaped() {
    let table = common::login_table("alice", 3);
    let out = score_rows::<ReconstructionModel>(None, None, &table).unwrap();
    assert_eq!(out.count(), 3);
    assert!(out.probs.iter().all(|v| v.is_nan()));
    assert!(out.row_keys.is_none());
    assert_eq!(out.explain.len(), 3);
    assert!(out.explain.iter().all(|c| c.values.len() == 3 && c.values.iter().all(|v| v.is_null())));
}

#[test]
fn untrained_batch_constructor_matches() {
    let out = ScoredBatch::untrained(0);
    assert_eq!(out.count(), 0);
}

#[test]
fn risk_engine_thresholds() {
    let engine = RiskEngine::new(RiskConfig::default());
    let meta = MessageMeta::new("alice", common::login_table("alice", 4));
    let memory = ResponseMemory {
        probs: array![[0.1, 1.0], [0.2, 4.0], [0.3, 9.0], [f32::NAN, f32::NAN]],
    };
    let resp = ResponseMessage {
        message: MultiMessage::new(meta),
        memory: Arc::new(memory),
        offset: 0,
        count: 4,
    };
    let levels: Vec<RiskLevel> = engine.score(&resp).iter().map(|r| r.level).collect();
    assert_eq!(
        levels,
        vec![RiskLevel::Low, RiskLevel::Medium, RiskLevel::High, RiskLevel::Low]
    );
    assert_eq!(engine.score(&resp)[2].row, 2);
}

#[test]
fn storage_detection_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");
    let store = SecureStore::open(&path, b"test-secret").unwrap();
    let risk = ueba_agent::postprocess::RiskResult {
        entity_id: "alice".into(),
        row: 3,
        loss: 0.5,
        zscore: f32::NAN,
        level: RiskLevel::Medium,
    };
    store
        .insert_detection("id1", 123, &risk, r#"{"x":1}"#)
        .unwrap();
    let out = store.get_detection("id1").unwrap().expect("stored");
    assert_eq!(out.ts, 123);
    assert_eq!(out.row, 3);
    assert_eq!(out.payload, r#"{"x":1}"#);
    assert_eq!(out.loss, Some(0.5));
    assert_eq!(out.zscore, None);
    assert_eq!(out.level, "medium");
    assert_eq!(store.detection_count("alice").unwrap(), 1);

    assert_eq!(store.prune_before(200).unwrap(), 1);
    assert!(store.get_detection("id1").unwrap().is_none());
}

#[test]
fn storage_snapshot_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let store = SecureStore::open(&dir.path().join("store.db"), b"test-secret").unwrap();
    assert!(store.get_snapshot("model_registry").unwrap().is_none());
    store.put_snapshot("model_registry", 1, b"registry-bytes").unwrap();
    assert_eq!(
        store.get_snapshot("model_registry").unwrap().as_deref(),
        Some(&b"registry-bytes"[..])
    );
}
