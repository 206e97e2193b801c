//! Entity model managers and the model registry.

use serde_json::json;
use std::sync::Arc;
use ueba_agent::{
    model::{ReconstructionDetector, ReconstructionModel, ScoringModel},
    table::Table,
    training::{lock_manager, EntityModelManager, ManagerSettings, ModelRegistry},
    PipelineError,
};

mod common;

fn settings(max_history: usize, seed: Option<u64>) -> ManagerSettings {
    ManagerSettings {
        epochs: 3,
        max_history,
        seed,
        min_train_features: 1,
    }
}

fn features(table: &Table) -> Table {
    table.select(&["bytes", "mfa", "city"])
}

#[test]
fn history_is_bounded_by_max_history() {
    let detector = ReconstructionDetector::default();
    let mut manager = EntityModelManager::<ReconstructionModel>::new("alice", settings(25, Some(1)), true);
    let mut seen = 0;
    for _ in 0..6 {
        let rows = features(&common::login_table("alice", 7));
        manager.train(&detector, &rows).unwrap();
        seen += 7;
        assert_eq!(manager.history_len(), seen.min(25));
    }
}

#[test]
fn history_keeps_most_recent_rows() {
    let detector = ReconstructionDetector::default();
    let mut manager = EntityModelManager::<ReconstructionModel>::new("alice", settings(3, Some(1)), false);
    let batch = |start: i64| {
        Table::from_records(
            &(start..start + 2)
                .map(|i| common::record(json!({"n": i, "m": i * 2})))
                .collect::<Vec<_>>(),
        )
    };
    manager.train(&detector, &batch(0)).unwrap();
    manager.train(&detector, &batch(2)).unwrap();
    let history = manager.history().unwrap();
    assert_eq!(common::column_values(history, "n"), vec![json!(1), json!(2), json!(3)]);
}

#[test]
fn non_retaining_manager_keeps_only_history() {
    let detector = ReconstructionDetector::default();
    let mut manager = EntityModelManager::<ReconstructionModel>::new("alice", settings(100, None), false);
    let outcome = manager
        .train(&detector, &features(&common::login_table("alice", 10)))
        .unwrap()
        .expect("trained");
    assert_eq!(outcome.train_loss.len(), 10);
    assert!(outcome.baseline.is_some());
    assert!(manager.model().is_none());
    assert!(manager.train_loss_scores().is_none());
    assert_eq!(manager.history_len(), 10);
}

#[test]
fn retaining_manager_stores_model_and_baseline() {
    let detector = ReconstructionDetector::default();
    let mut manager = EntityModelManager::<ReconstructionModel>::new("alice", settings(100, Some(3)), true);
    assert!(manager.model().is_none());
    manager
        .train(&detector, &features(&common::login_table("alice", 10)))
        .unwrap();
    let model = manager.model().expect("retained");
    let baseline = manager.baseline().expect("baseline");
    assert!(baseline.std >= 0.0);
    assert_eq!(manager.train_loss_scores().unwrap().len(), 10);
    assert_eq!(model.feature_names(), vec!["bytes", "mfa", "city"]);
}

#[test]
fn seeded_training_is_reproducible() {
    let detector = ReconstructionDetector::default();
    let rows = features(&common::login_table("alice", 40));
    let train = || {
        let mut m = EntityModelManager::<ReconstructionModel>::new("alice", settings(100, Some(42)), true);
        m.train(&detector, &rows).unwrap();
        serde_json::to_string(&*m.model().unwrap()).unwrap()
    };
    assert_eq!(train(), train());
}

#[test]
fn degenerate_features_skip_training() {
    let detector = ReconstructionDetector::default();
    let mut s = settings(100, None);
    s.min_train_features = 2;
    let mut manager = EntityModelManager::<ReconstructionModel>::new("bob", s, true);
    // Only one column has two or more values.
    let rows = Table::from_records(&[
        common::record(json!({"a": 1, "b": null})),
        common::record(json!({"a": 2, "b": "x"})),
    ]);
    let outcome = manager.train(&detector, &rows).unwrap();
    assert!(outcome.is_none());
    assert!(manager.model().is_none());
    assert_eq!(manager.history_len(), 2);
}

#[test]
fn get_or_create_is_single_flight_per_key() {
    let registry = Arc::new(ModelRegistry::<ReconstructionModel>::new(settings(10, None)));
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let registry = registry.clone();
            std::thread::spawn(move || {
                let key = if i % 2 == 0 { "alice" } else { "bob" };
                registry.get_or_create(key, false)
            })
        })
        .collect();
    let managers: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(registry.len(), 2);
    for (i, m) in managers.iter().enumerate() {
        let expected = registry.get(if i % 2 == 0 { "alice" } else { "bob" }).unwrap();
        assert!(Arc::ptr_eq(m, &expected));
    }
    assert!(registry.evict("bob"));
    assert!(!registry.evict("bob"));
    assert_eq!(registry.keys(), vec!["alice".to_string()]);
}

#[test]
fn registry_persist_restore_replaces_wholesale() {
    let detector = ReconstructionDetector::default();
    let source = ModelRegistry::<ReconstructionModel>::new(settings(50, Some(9)));
    for user in ["alice", "carol"] {
        let handle = source.get_or_create(user, true);
        lock_manager(&handle)
            .train(&detector, &features(&common::login_table(user, 12)))
            .unwrap();
    }
    let bytes = source.persist().unwrap();

    let target = ModelRegistry::<ReconstructionModel>::new(settings(50, None));
    target.get_or_create("stale", false);
    target.restore(&bytes).unwrap();
    assert_eq!(target.keys(), vec!["alice".to_string(), "carol".to_string()]);

    let restored = target.get("alice").unwrap();
    let restored = lock_manager(&restored);
    let original = source.get("alice").unwrap();
    let original = lock_manager(&original);
    assert_eq!(restored.history_len(), 12);
    let (a, b) = (restored.baseline().unwrap(), original.baseline().unwrap());
    assert!((a.mean - b.mean).abs() < 1e-5 && (a.std - b.std).abs() < 1e-5);
    let rows = features(&common::login_table("alice", 4));
    let after = restored.model().unwrap().score(&rows).unwrap().loss;
    let before = original.model().unwrap().score(&rows).unwrap().loss;
    assert_eq!(after.len(), before.len());
    for (x, y) in after.iter().zip(&before) {
        assert!((x - y).abs() < 1e-4, "{} vs {}", x, y);
    }
}

#[test]
fn failed_restore_leaves_registry_untouched() {
    let registry = ModelRegistry::<ReconstructionModel>::new(settings(10, None));
    registry.get_or_create("alice", false);
    let mut bytes = registry.persist().unwrap();

    assert!(matches!(
        registry.restore(b"not a snapshot"),
        Err(PipelineError::RegistryLoadFailure(_))
    ));

    // Flip a payload byte so the digest no longer matches.
    let pos = bytes.windows(5).position(|w| w == b"alice").unwrap();
    bytes[pos] = b'A';
    assert!(matches!(
        registry.restore(&bytes),
        Err(PipelineError::RegistryLoadFailure(_))
    ));
    assert_eq!(registry.keys(), vec!["alice".to_string()]);
}

#[test]
fn registry_file_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("models.json");
    let registry = ModelRegistry::<ReconstructionModel>::new(settings(10, None));
    registry.get_or_create("alice", true);
    registry.save(&path).unwrap();

    let other = ModelRegistry::<ReconstructionModel>::new(settings(10, None));
    other.load(&path).unwrap();
    assert_eq!(other.len(), 1);
    assert!(matches!(
        other.load(&dir.path().join("missing.json")),
        Err(PipelineError::RegistryLoadFailure(_))
    ));
}

#[test]
fn registry_trained_on_extreme_values_restores() {
    let detector = ReconstructionDetector::default();
    let registry = ModelRegistry::<ReconstructionModel>::new(settings(10, Some(4)));
    let cases = [
        ("nan_text", vec![json!({"bytes": "NaN"}), json!({"bytes": 5}), json!({"bytes": 7})]),
        ("huge", vec![json!({"bytes": 1e308}), json!({"bytes": 1e308}), json!({"bytes": 1.0})]),
        ("inf_text", vec![json!({"bytes": "inf"}), json!({"bytes": "-inf"}), json!({"bytes": 2})]),
    ];
    for (user, rows) in &cases {
        let rows = Table::from_records(&rows.iter().cloned().map(common::record).collect::<Vec<_>>());
        let handle = registry.get_or_create(user, true);
        let mut manager = lock_manager(&handle);
        manager.train(&detector, &rows).unwrap();
        assert!(manager.train_loss_scores().unwrap().iter().all(|l| l.is_finite()));
        let baseline = manager.baseline().unwrap();
        assert!(baseline.mean.is_finite() && baseline.std.is_finite());
    }

    let bytes = registry.persist().unwrap();
    let restored = ModelRegistry::<ReconstructionModel>::new(settings(10, None));
    restored.restore(&bytes).unwrap();
    assert_eq!(restored.keys(), vec!["huge", "inf_text", "nan_text"]);

    let huge = restored.get("huge").unwrap();
    let model = lock_manager(&huge).model().unwrap();
    let far_rows = Table::from_records(&[common::record(json!({"bytes": -1e308}))]);
    assert!(model.score(&far_rows).unwrap().loss.iter().all(|l| l.is_finite()));
}

mod sources {
    use super::*;
    use std::io::Write;
    use std::path::Path;
    use ueba_agent::{
        config::{AgentConfig, TrainingConfig},
        features::SourceKind,
        messages::MessageMeta,
        model::SharedModel,
        training::{ModelSource, TrainStage},
    };

    fn write_ndjson(path: &Path, users: &[(&str, usize)]) {
        let mut file = std::fs::File::create(path).unwrap();
        for (user, n) in users {
            for rec in common::login_rows(user, *n) {
                writeln!(file, "{}", serde_json::Value::Object(rec)).unwrap();
            }
        }
    }

    #[test]
    fn glob_without_source_fails_only_when_selected() {
        let mut config = AgentConfig::default();
        config.training.train_data_glob = Some("/nonexistent/*.ndjson".into());
        assert!(config.validate().is_ok());
        assert!(matches!(
            TrainStage::new(&config, ReconstructionDetector::default()),
            Err(PipelineError::MissingSourceClass)
        ));

        // A registry snapshot outranks the glob, which is then ignored.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        ModelRegistry::<ReconstructionModel>::new(settings(10, None))
            .save(&path)
            .unwrap();
        config.training.pretrained_path = Some(path.clone());
        let stage = TrainStage::new(&config, ReconstructionDetector::default()).unwrap();
        assert_eq!(stage.model_source(), &ModelSource::Registry(path));
    }

    #[test]
    fn derived_features_keep_entity_and_group_columns() {
        let mut features = ueba_agent::config::FeaturesConfig::default();
        features.feature_columns = vec!["bytes".into(), "city".into()];
        features.group_column = Some("session".into());
        let source = ueba_agent::features::NdjsonSource;
        let derived = ueba_agent::features::EntitySource::derive_features(
            &source,
            common::login_table("alice", 3),
            &features,
        );
        assert_eq!(derived.column_names(), vec!["userid", "bytes", "city", "session"]);
        assert_eq!(
            ueba_agent::features::model_columns(&derived, &features),
            vec!["bytes".to_string(), "city".to_string(), "session".to_string()]
        );
    }

    #[test]
    fn resolve_prefers_registry_then_shared_then_bulk() {
        let mut t = TrainingConfig::default();
        assert_eq!(ModelSource::resolve(&t).unwrap(), ModelSource::Online);

        t.train_data_glob = Some("data/*.ndjson".into());
        assert!(matches!(
            ModelSource::resolve(&t),
            Err(PipelineError::MissingSourceClass)
        ));
        t.source = Some(SourceKind::Ndjson);
        assert!(matches!(ModelSource::resolve(&t).unwrap(), ModelSource::BulkTrain { .. }));

        t.shared_model_path = Some("shared.json".into());
        assert_eq!(
            ModelSource::resolve(&t).unwrap(),
            ModelSource::SharedModel("shared.json".into())
        );

        t.pretrained_path = Some("registry.json".into());
        assert_eq!(
            ModelSource::resolve(&t).unwrap(),
            ModelSource::Registry("registry.json".into())
        );
    }

    #[test]
    fn bulk_training_builds_registry_from_glob() {
        let dir = tempfile::tempdir().unwrap();
        write_ndjson(&dir.path().join("day1.ndjson"), &[("alice", 10), ("bob", 6)]);
        write_ndjson(&dir.path().join("day2.ndjson"), &[("alice", 4)]);
        let out = dir.path().join("models.json");

        let mut config = AgentConfig::default();
        config.training.seed = Some(5);
        config.training.train_data_glob = Some(format!("{}/*.ndjson", dir.path().display()));
        config.training.source = Some(SourceKind::Ndjson);
        config.training.models_output_path = Some(out.clone());

        let stage = TrainStage::new(&config, ReconstructionDetector::default()).unwrap();
        assert_eq!(stage.registry().keys(), vec!["alice".to_string(), "bob".to_string()]);
        let alice = stage.registry().get("alice").unwrap();
        assert_eq!(lock_manager(&alice).history_len(), 14);
        assert!(lock_manager(&alice).model().is_some());
        assert!(out.exists());

        // Known entities get their stored model, unknown ones none.
        let windows = stage
            .process(MessageMeta::new("alice", common::login_table("alice", 3)))
            .unwrap();
        assert!(windows[0].model.is_some());
        let windows = stage
            .process(MessageMeta::new("mallory", common::login_table("mallory", 3)))
            .unwrap();
        assert!(windows[0].model.is_none());
        assert_eq!(stage.registry().len(), 2);
    }

    #[test]
    fn repeat_count_multiplies_training_rows() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("train.ndjson");
        write_ndjson(&file, &[("alice", 5)]);
        let mut config = AgentConfig::default();
        config.training.max_history = 100;
        let stage = TrainStage::new(&config, ReconstructionDetector::default()).unwrap();
        let trained = stage.bulk_train(&ueba_agent::features::NdjsonSource, &[file], 3).unwrap();
        assert_eq!(trained, 1);
        let alice = stage.registry().get("alice").unwrap();
        assert_eq!(lock_manager(&alice).history_len(), 15);
    }

    #[test]
    fn registry_mode_restores_saved_models() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let registry = ModelRegistry::<ReconstructionModel>::new(settings(100, Some(1)));
        let handle = registry.get_or_create("alice", true);
        lock_manager(&handle)
            .train(&ReconstructionDetector::default(), &features(&common::login_table("alice", 8)))
            .unwrap();
        registry.save(&path).unwrap();

        let mut config = AgentConfig::default();
        config.training.pretrained_path = Some(path);
        let stage = TrainStage::new(&config, ReconstructionDetector::default()).unwrap();
        assert_eq!(stage.model_source(), &ModelSource::Registry(dir.path().join("registry.json")));
        let windows = stage
            .process(MessageMeta::new("alice", common::login_table("alice", 2)))
            .unwrap();
        assert!(windows[0].model.is_some());
        // No online training in registry mode.
        assert_eq!(lock_manager(&stage.registry().get("alice").unwrap()).history_len(), 8);
    }

    #[test]
    fn missing_registry_file_fails_construction() {
        let mut config = AgentConfig::default();
        config.training.pretrained_path = Some("/nonexistent/registry.json".into());
        assert!(matches!(
            TrainStage::new(&config, ReconstructionDetector::default()),
            Err(PipelineError::RegistryLoadFailure(_))
        ));
    }

    #[test]
    fn shared_model_serves_every_entity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.json");
        let mut manager =
            EntityModelManager::<ReconstructionModel>::new("fleet", settings(100, Some(2)), true);
        manager
            .train(&ReconstructionDetector::default(), &features(&common::login_table("fleet", 20)))
            .unwrap();
        SharedModel {
            model: (*manager.model().unwrap()).clone(),
            baseline: manager.baseline().unwrap(),
        }
        .save(&path)
        .unwrap();

        let mut config = AgentConfig::default();
        config.training.shared_model_path = Some(path);
        let stage = TrainStage::new(&config, ReconstructionDetector::default()).unwrap();
        for user in ["alice", "bob"] {
            let windows = stage
                .process(MessageMeta::new(user, common::login_table(user, 3)))
                .unwrap();
            assert!(windows[0].model.is_some());
            assert!(windows[0].baseline.is_some());
        }
        assert!(stage.registry().is_empty());
    }
}
