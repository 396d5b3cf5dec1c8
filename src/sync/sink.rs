// ABOUTME: Record sink for consumed feedback nodes - audit log plus relational upsert
// ABOUTME: Reports malformed nodes separately from storage failures so the fetch loop can branch

use anyhow::Context;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

use super::store::RecordStore;
use super::watermark::{RecordId, Watermark};
use crate::remote::models::Node;

/// Alias the survey id is requested under.
pub const SURVEY_ID_ALIAS: &str = "surveyId";
/// Alias the finish date (epoch seconds) is requested under.
pub const FINISH_DATE_ALIAS: &str = "finishDate";

/// Tracing target carrying one JSON line per consumed record.
pub const RECORD_STREAM_TARGET: &str = "record_stream";

#[derive(Debug, Error)]
pub enum PersistError {
    /// The node lacks a usable survey id or finish date. Retrying won't help.
    #[error("malformed record: {0}")]
    Malformed(String),
    #[error("failed to append record to log: {0:#}")]
    Log(anyhow::Error),
    #[error("failed to store record: {0:#}")]
    Store(anyhow::Error),
}

impl PersistError {
    pub fn is_malformed(&self) -> bool {
        matches!(self, PersistError::Malformed(_))
    }
}

/// Durable target for individual consumed records.
pub trait RecordSink: Send + Sync {
    /// Persist one node, returning its watermark on success.
    fn persist(&self, node: &Node) -> Result<Watermark, PersistError>;
}

/// Extract the (survey id, finish date) pair a node is ordered by.
pub fn node_watermark(node: &Node) -> anyhow::Result<Watermark> {
    let survey_id = node
        .first_value(SURVEY_ID_ALIAS)
        .with_context(|| format!("missing {}", SURVEY_ID_ALIAS))?;
    let survey_id = RecordId::parse(&survey_id)?;

    let finish_date = node
        .first_value(FINISH_DATE_ALIAS)
        .with_context(|| format!("survey {} is missing {}", survey_id, FINISH_DATE_ALIAS))?;
    let finish_date: i64 = finish_date.trim().parse().with_context(|| {
        format!(
            "survey {} has non-numeric {} {:?}",
            survey_id, FINISH_DATE_ALIAS, finish_date
        )
    })?;

    Watermark::from_epoch(survey_id, finish_date)
}

/// Append-only JSON-lines file holding every consumed node.
pub struct RecordLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl RecordLog {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create record log directory {}", parent.display())
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open record log {}", path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    /// Append one line and sync it to disk before returning.
    pub fn append(&self, line: &str) -> anyhow::Result<()> {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');
        file.write_all(buf.as_bytes())
            .and_then(|_| file.sync_data())
            .with_context(|| format!("Failed to write record log {}", self.path.display()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// The production sink: audit log first, then the record store.
pub struct DurableRecordSink {
    log: RecordLog,
    store: Arc<RecordStore>,
}

impl DurableRecordSink {
    pub fn new(log: RecordLog, store: Arc<RecordStore>) -> Self {
        Self { log, store }
    }
}

impl RecordSink for DurableRecordSink {
    fn persist(&self, node: &Node) -> Result<Watermark, PersistError> {
        let watermark =
            node_watermark(node).map_err(|e| PersistError::Malformed(format!("{:#}", e)))?;

        tracing::info!("Processing {}", watermark);

        let line = serde_json::to_string(node)
            .map_err(|e| PersistError::Malformed(format!("unserializable node: {}", e)))?;
        tracing::info!(target: RECORD_STREAM_TARGET, "{}", line);

        self.log.append(&line).map_err(PersistError::Log)?;
        self.store
            .upsert_record(&watermark)
            .map_err(PersistError::Store)?;

        Ok(watermark)
    }
}
