//! Entity key → model manager mapping with whole-registry snapshots.

use super::manager::{EntityModelManager, ManagerSettings};
use crate::error::{PipelineError, Result};
use crate::model::ScoringModel;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::info;

const SNAPSHOT_FORMAT_VERSION: u32 = 1;

pub type ManagerHandle<M> = Arc<Mutex<EntityModelManager<M>>>;

/// Lock one entity's manager. Only the holder may train or read its history.
pub fn lock_manager<M>(handle: &ManagerHandle<M>) -> MutexGuard<'_, EntityModelManager<M>> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    format_version: u32,
    /// sha256 of `payload`, lowercase hex
    digest: String,
    payload: String,
}

fn digest_hex(data: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(data);
    format!("{:x}", h.finalize())
}

pub struct ModelRegistry<M> {
    settings: ManagerSettings,
    entries: RwLock<HashMap<String, ManagerHandle<M>>>,
}

impl<M: ScoringModel> ModelRegistry<M> {
    pub fn new(settings: ManagerSettings) -> Self {
        Self {
            settings,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// Existing manager for `key`, or a new one created exactly once even when
    /// several callers race on first sight of the key.
    pub fn get_or_create(&self, key: &str, retain: bool) -> ManagerHandle<M> {
        if let Some(h) = self.get(key) {
            return h;
        }
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(EntityModelManager::new(
                    key,
                    self.settings.clone(),
                    retain,
                )))
            })
            .clone()
    }

    pub fn get(&self, key: &str) -> Option<ManagerHandle<M>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Drop an entity's state. Returns false if it was unknown.
    pub fn evict(&self, key: &str) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Serialize the whole mapping as one snapshot. Fails rather than emit a
    /// snapshot that `restore` would reject.
    pub fn persist(&self) -> Result<Vec<u8>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut managers: BTreeMap<&str, serde_json::Value> = BTreeMap::new();
        for (key, handle) in entries.iter() {
            let manager = lock_manager(handle);
            managers.insert(key.as_str(), serde_json::to_value(&*manager)?);
        }
        let payload = serde_json::to_string(&managers)?;
        // Non-finite floats serialize as null and would not read back.
        if let Err(e) = serde_json::from_str::<BTreeMap<String, EntityModelManager<M>>>(&payload) {
            return Err(PipelineError::Model(format!(
                "registry state would not restore: {}",
                e
            )));
        }
        let snapshot = Snapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            digest: digest_hex(payload.as_bytes()),
            payload,
        };
        Ok(serde_json::to_vec(&snapshot)?)
    }

    /// Replace the whole mapping from a snapshot. On any failure the registry
    /// is left exactly as it was.
    pub fn restore(&self, bytes: &[u8]) -> Result<()> {
        let fail = |msg: String| PipelineError::RegistryLoadFailure(msg);
        let snapshot: Snapshot =
            serde_json::from_slice(bytes).map_err(|e| fail(format!("malformed snapshot: {}", e)))?;
        if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(fail(format!(
                "unsupported snapshot version {}",
                snapshot.format_version
            )));
        }
        if digest_hex(snapshot.payload.as_bytes()) != snapshot.digest {
            return Err(fail("snapshot digest mismatch".into()));
        }
        let managers: BTreeMap<String, EntityModelManager<M>> =
            serde_json::from_str(&snapshot.payload)
                .map_err(|e| fail(format!("malformed payload: {}", e)))?;
        if let Some((key, _)) = managers.iter().find(|(k, m)| k.as_str() != m.entity_id()) {
            return Err(fail(format!("entry '{}' holds another entity's state", key)));
        }

        let restored: HashMap<String, ManagerHandle<M>> = managers
            .into_iter()
            .map(|(k, m)| (k, Arc::new(Mutex::new(m))))
            .collect();
        let count = restored.len();
        *self.entries.write().unwrap_or_else(PoisonError::into_inner) = restored;
        info!(entities = count, "model registry restored");
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.persist()?)?;
        info!(path = %path.display(), entities = self.len(), "model registry saved");
        Ok(())
    }

    pub fn load(&self, path: &Path) -> Result<()> {
        let bytes = std::fs::read(path).map_err(|e| {
            PipelineError::RegistryLoadFailure(format!("{}: {}", path.display(), e))
        })?;
        self.restore(&bytes)
    }
}
