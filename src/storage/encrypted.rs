//! SQLite-backed store with AES-GCM encryption of detection payloads and
//! registry snapshots. Key derived from a device-bound secret.

use crate::error::{PipelineError, Result};
use crate::postprocess::RiskResult;
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

fn derive_key(seed: &[u8]) -> [u8; KEY_LEN] {
    use ring::digest;
    let mut out = [0u8; KEY_LEN];
    let h = digest::digest(&digest::SHA256, seed);
    out[..h.as_ref().len().min(KEY_LEN)].copy_from_slice(h.as_ref());
    out
}

fn crypto_err(e: impl std::fmt::Debug) -> PipelineError {
    PipelineError::Storage(format!("cipher: {:?}", e))
}

fn encrypt(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<String> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(crypto_err)?;
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = cipher.encrypt((&nonce).into(), plaintext).map_err(crypto_err)?;
    let mut out = nonce.to_vec();
    out.extend(ciphertext);
    Ok(BASE64.encode(&out))
}

fn decrypt(key: &[u8; KEY_LEN], encoded: &str) -> Result<Vec<u8>> {
    let raw = BASE64.decode(encoded).map_err(crypto_err)?;
    if raw.len() < NONCE_LEN {
        return Err(PipelineError::Storage("payload too short".into()));
    }
    let (nonce, ct) = raw.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(crypto_err)?;
    cipher.decrypt(nonce.into(), ct).map_err(crypto_err)
}

/// A stored detection row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDetection {
    pub entity_id: String,
    pub row: i64,
    pub ts: i64,
    pub payload: String,
    pub loss: Option<f32>,
    pub zscore: Option<f32>,
    pub level: String,
}

pub struct SecureStore {
    conn: Mutex<Connection>,
    key: [u8; KEY_LEN],
}

impl SecureStore {
    /// Open or create DB at path. Key is derived from `secret` (in production: device-bound).
    pub fn open(path: &Path, secret: &[u8]) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS detections (
                id TEXT PRIMARY KEY,
                entity_id TEXT NOT NULL,
                row INTEGER NOT NULL,
                ts INTEGER NOT NULL,
                payload_enc TEXT NOT NULL,
                loss REAL,
                zscore REAL,
                level TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_detections_ts ON detections(ts);
            CREATE INDEX IF NOT EXISTS idx_detections_entity ON detections(entity_id);
            CREATE TABLE IF NOT EXISTS snapshots (
                name TEXT PRIMARY KEY,
                ts INTEGER NOT NULL,
                digest TEXT NOT NULL,
                payload_enc TEXT NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            key: derive_key(secret),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a detection (row payload stored encrypted). NaN metrics are stored as NULL.
    pub fn insert_detection(&self, id: &str, ts: i64, risk: &RiskResult, payload_json: &str) -> Result<()> {
        let enc = encrypt(&self.key, payload_json.as_bytes())?;
        let finite = |v: f32| if v.is_finite() { Some(v) } else { None };
        let level = serde_json::to_value(risk.level)?
            .as_str()
            .unwrap_or_default()
            .to_string();
        self.conn().execute(
            "INSERT OR REPLACE INTO detections (id, entity_id, row, ts, payload_enc, loss, zscore, level) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                risk.entity_id,
                risk.row as i64,
                ts,
                enc,
                finite(risk.loss),
                finite(risk.zscore),
                level
            ],
        )?;
        Ok(())
    }

    /// Read detection by id (decrypt payload)
    pub fn get_detection(&self, id: &str) -> Result<Option<StoredDetection>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT entity_id, row, ts, payload_enc, loss, zscore, level FROM detections WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![id])?;
        if let Some(row) = rows.next()? {
            let enc: String = row.get(3)?;
            let plain = decrypt(&self.key, &enc)?;
            return Ok(Some(StoredDetection {
                entity_id: row.get(0)?,
                row: row.get(1)?,
                ts: row.get(2)?,
                payload: String::from_utf8(plain).unwrap_or_default(),
                loss: row.get(4)?,
                zscore: row.get(5)?,
                level: row.get(6)?,
            }));
        }
        Ok(None)
    }

    pub fn detection_count(&self, entity_id: &str) -> Result<u64> {
        let n: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM detections WHERE entity_id = ?1",
            params![entity_id],
            |r| r.get(0),
        )?;
        Ok(n as u64)
    }

    /// Retention: delete detections older than given timestamp
    pub fn prune_before(&self, ts: i64) -> Result<u64> {
        let n = self
            .conn()
            .execute("DELETE FROM detections WHERE ts < ?1", params![ts])?;
        Ok(n as u64)
    }

    /// Store an encrypted snapshot blob (e.g. a persisted model registry) under `name`.
    pub fn put_snapshot(&self, name: &str, ts: i64, bytes: &[u8]) -> Result<()> {
        let digest = format!("{:x}", Sha256::digest(bytes));
        let enc = encrypt(&self.key, bytes)?;
        self.conn().execute(
            "INSERT OR REPLACE INTO snapshots (name, ts, digest, payload_enc) VALUES (?1, ?2, ?3, ?4)",
            params![name, ts, digest, enc],
        )?;
        Ok(())
    }

    /// Decrypt a snapshot and check it against its stored digest.
    pub fn get_snapshot(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let row: Option<(String, String)> = self
            .conn()
            .query_row(
                "SELECT digest, payload_enc FROM snapshots WHERE name = ?1",
                params![name],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let Some((digest, enc)) = row else {
            return Ok(None);
        };
        let bytes = decrypt(&self.key, &enc)?;
        if format!("{:x}", Sha256::digest(&bytes)) != digest {
            return Err(PipelineError::Storage(format!("snapshot '{}' digest mismatch", name)));
        }
        Ok(Some(bytes))
    }
}
