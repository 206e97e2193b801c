//! Training stage: attaches each entity's model to its message and cuts the
//! message into batches.

use super::manager::ManagerSettings;
use super::registry::{lock_manager, ModelRegistry};
use crate::config::{AgentConfig, FeaturesConfig, TrainingConfig};
use crate::error::{PipelineError, Result};
use crate::features::{model_columns, EntitySource, SourceKind};
use crate::messages::{split_ae_message, AeMessage, MessageMeta, MultiMessage};
use crate::model::{AnomalyDetector, Baseline, SharedModel};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Where entity models come from, resolved once at construction.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelSource {
    /// Restore a registry snapshot from a prior run.
    Registry(PathBuf),
    /// One pretrained model for every entity.
    SharedModel(PathBuf),
    /// Train every entity from files before streaming starts.
    BulkTrain { glob: String, source: SourceKind },
    /// Fit on each incoming message.
    Online,
}

impl ModelSource {
    /// Pick the highest-priority configured source and warn about the rest.
    pub fn resolve(training: &TrainingConfig) -> Result<Self> {
        if let Some(path) = &training.pretrained_path {
            if training.shared_model_path.is_some() {
                warn!("both 'pretrained_path' and 'shared_model_path' set; 'shared_model_path' ignored");
            }
            if training.train_data_glob.is_some() {
                warn!("both 'pretrained_path' and 'train_data_glob' set; 'train_data_glob' ignored");
            }
            return Ok(ModelSource::Registry(path.clone()));
        }
        if let Some(path) = &training.shared_model_path {
            if training.train_data_glob.is_some() {
                warn!("both 'shared_model_path' and 'train_data_glob' set; 'train_data_glob' ignored");
            }
            return Ok(ModelSource::SharedModel(path.clone()));
        }
        if let Some(glob) = &training.train_data_glob {
            let source = training.source.ok_or(PipelineError::MissingSourceClass)?;
            return Ok(ModelSource::BulkTrain {
                glob: glob.clone(),
                source,
            });
        }
        Ok(ModelSource::Online)
    }
}

/// Files matching `pattern`, optionally sorted.
pub fn expand_glob(pattern: &str, sort: bool) -> Result<Vec<PathBuf>> {
    let paths = glob::glob(pattern)
        .map_err(|e| PipelineError::BadConfiguration(format!("train_data_glob: {}", e)))?;
    let mut files: Vec<PathBuf> = paths
        .filter_map(|p| match p {
            Ok(p) => Some(p),
            Err(e) => {
                warn!(error = %e, "unreadable glob match");
                None
            }
        })
        .collect();
    if sort {
        files.sort();
    }
    Ok(files)
}

pub struct TrainStage<D: AnomalyDetector> {
    detector: D,
    registry: Arc<ModelRegistry<D::Model>>,
    shared: Option<(Arc<D::Model>, Baseline)>,
    source: ModelSource,
    batch_size: usize,
    features: FeaturesConfig,
}

impl<D: AnomalyDetector> TrainStage<D> {
    pub fn new(config: &AgentConfig, detector: D) -> Result<Self> {
        config.validate()?;
        let t = &config.training;
        let settings = ManagerSettings {
            epochs: t.epochs,
            max_history: t.max_history,
            seed: t.seed,
            min_train_features: config.features.min_train_features,
        };
        let source = ModelSource::resolve(t)?;
        let mut stage = Self {
            detector,
            registry: Arc::new(ModelRegistry::new(settings)),
            shared: None,
            source: source.clone(),
            batch_size: config.pipeline.pipeline_batch_size,
            features: config.features.clone(),
        };

        match source {
            ModelSource::Registry(path) => {
                stage.registry.load(&path)?;
            }
            ModelSource::SharedModel(path) => {
                let shared = SharedModel::<D::Model>::load(&path).map_err(|e| {
                    PipelineError::RegistryLoadFailure(format!("{}: {}", path.display(), e))
                })?;
                info!(path = %path.display(), "loaded shared pretrained model");
                stage.shared = Some((Arc::new(shared.model), shared.baseline));
            }
            ModelSource::BulkTrain { glob, source } => {
                let files = expand_glob(&glob, t.sort_glob)?;
                let entity_source = source.build();
                stage.bulk_train(entity_source.as_ref(), &files, t.repeat_count)?;
                if let Some(out) = &t.models_output_path {
                    stage.registry.save(out)?;
                }
            }
            ModelSource::Online => {}
        }
        Ok(stage)
    }

    pub fn registry(&self) -> &Arc<ModelRegistry<D::Model>> {
        &self.registry
    }

    pub fn model_source(&self) -> &ModelSource {
        &self.source
    }

    /// Train one retained model per entity found in `files`. Returns the
    /// number of entities that ended up with a model.
    pub fn bulk_train(
        &self,
        source: &dyn EntitySource,
        files: &[PathBuf],
        repeat_count: usize,
    ) -> Result<usize> {
        info!(files = files.len(), "bulk training entity models");
        let per_entity = source.files_to_entity_tables(files, &self.features, repeat_count)?;
        let mut trained = 0;
        for (entity, table) in per_entity {
            let handle = self.registry.get_or_create(&entity, true);
            let mut manager = lock_manager(&handle);
            manager.set_retain(true);

            let table = source.derive_features(table, &self.features);
            let rows = table
                .select(&model_columns(&table, &self.features))
                .drop_sparse_columns(2);
            if manager.train(&self.detector, &rows)?.is_some() && manager.model().is_some() {
                trained += 1;
            }
        }
        info!(entities = self.registry.len(), trained, "bulk training complete");
        Ok(trained)
    }

    fn model_for(&self, meta: &MessageMeta) -> Result<(Option<Arc<D::Model>>, Option<Baseline>)> {
        if let Some((model, baseline)) = &self.shared {
            return Ok((Some(model.clone()), Some(*baseline)));
        }
        match &self.source {
            ModelSource::Online => {
                let rows = {
                    let table = meta.table.read();
                    table.select(&model_columns(&table, &self.features))
                };
                let handle = self.registry.get_or_create(&meta.entity_id, false);
                let outcome = lock_manager(&handle).train(&self.detector, &rows)?;
                Ok(match outcome {
                    Some(o) => (Some(o.model), o.baseline),
                    None => (None, None),
                })
            }
            _ => Ok(match self.registry.get(&meta.entity_id) {
                Some(handle) => {
                    let manager = lock_manager(&handle);
                    (manager.model(), manager.baseline())
                }
                None => (None, None),
            }),
        }
    }

    /// Attach the entity's model and split into windows of at most
    /// `pipeline_batch_size` rows, in row order.
    pub fn process(&self, meta: MessageMeta) -> Result<Vec<AeMessage<D::Model>>> {
        let (model, baseline) = self.model_for(&meta)?;
        if model.is_none() {
            warn!(entity = %meta.entity_id, "no model for entity; scores will be NaN");
        }
        let full = AeMessage::new(MultiMessage::new(meta), model, baseline);
        Ok(split_ae_message(&full, self.batch_size))
    }
}
