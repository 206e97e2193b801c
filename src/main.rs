//! UEBA agent entrypoint: reads newline-delimited JSON records (file argument
//! or stdin), scores every entity against its own model and writes detections
//! as JSON lines to stdout and into the encrypted store.

use chrono::Utc;
use std::io::Write;
use tokio::sync::mpsc;
use tracing::{info, warn};
use ueba_agent::{
    config::AgentConfig,
    features::NdjsonSource,
    logging::{DetectionLine, StructuredLogger},
    messages::MessageMeta,
    model::ReconstructionDetector,
    pipeline::Pipeline,
    postprocess::RiskLevel,
    storage::SecureStore,
};
use uuid::Uuid;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const REGISTRY_SNAPSHOT: &str = "model_registry";

async fn run(config: AgentConfig, store: SecureStore) -> Result<(), BoxError> {
    let detector = ReconstructionDetector::new(config.features.group_column.clone());
    let pipeline = Pipeline::new(&config, detector)?;

    let tables = match std::env::args().nth(1) {
        Some(path) => {
            let file = std::fs::File::open(&path)?;
            NdjsonSource::read_entity_tables(std::io::BufReader::new(file), &config.features)?
        }
        None => NdjsonSource::read_entity_tables(std::io::stdin().lock(), &config.features)?,
    };
    info!(entities = tables.len(), "input loaded");

    let depth = config.pipeline.queue_depth;
    let (in_tx, in_rx) = mpsc::channel(depth);
    let (out_tx, out_rx) = mpsc::channel(depth);

    let feeder = async move {
        for (entity, table) in tables {
            if in_tx.send(MessageMeta::new(entity, table)).await.is_err() {
                break;
            }
        }
    };

    let sink = async {
        // Owned here so a failed write closes the channel and stops the pipeline.
        let mut out_rx: mpsc::Receiver<ueba_agent::ResponseMessage> = out_rx;
        let mut stdout = std::io::stdout().lock();
        let mut written = 0usize;
        while let Some(resp) = out_rx.recv().await {
            for det in pipeline.detections(&resp) {
                let id = Uuid::new_v4().to_string();
                let now = Utc::now();
                let level = match det.risk.level {
                    RiskLevel::Low => "low",
                    RiskLevel::Medium => "medium",
                    RiskLevel::High => "high",
                };
                let line = DetectionLine {
                    id: &id,
                    ts: now.to_rfc3339(),
                    entity_id: &det.risk.entity_id,
                    row: det.risk.row,
                    risk_level: level,
                    loss: Some(det.risk.loss).filter(|v| v.is_finite()),
                    zscore: Some(det.risk.zscore).filter(|v| v.is_finite()),
                    record: &det.record,
                };
                StructuredLogger::emit_json(&line, &mut stdout)?;
                let payload = serde_json::to_string(&det.record)?;
                store.insert_detection(&id, now.timestamp_millis(), &det.risk, &payload)?;
                written += 1;
            }
        }
        stdout.flush()?;
        Ok::<usize, BoxError>(written)
    };

    let (_, ran, written) = tokio::join!(feeder, pipeline.run(in_rx, out_tx), sink);
    ran?;
    info!(detections = written?, "scoring complete");

    let snapshot = pipeline.registry().persist()?;
    store.put_snapshot(REGISTRY_SNAPSHOT, Utc::now().timestamp_millis(), &snapshot)?;
    if let Some(path) = &config.training.models_output_path {
        if let Err(e) = pipeline.registry().save(path) {
            warn!(path = %path.display(), error = %e, "failed to write registry snapshot");
        }
    }

    pipeline.shutdown().await;
    Ok(())
}

fn main() -> Result<(), BoxError> {
    let config_path = std::env::var("UEBA_CONFIG_PATH")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::path::PathBuf::from("config.json"));
    let config = AgentConfig::load(&config_path);

    StructuredLogger::init(config.log.json, &config.log.level);
    config.validate()?;

    info!(data_dir = ?config.data_dir, "UEBA agent starting");

    std::fs::create_dir_all(&config.data_dir)?;
    let store_path = config.data_dir.join("store.db");
    let secret = std::env::var("UEBA_STORE_SECRET")
        .unwrap_or_else(|_| "device-secret-placeholder".to_string()); // In production: from Secure Enclave / Keystore
    let store = SecureStore::open(&store_path, secret.as_bytes())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config, store))?;
    info!("UEBA agent stopped");
    Ok(())
}
