// ABOUTME: SyncDaemon - wires config, store, record sink and Query API client together
// ABOUTME: Entry point for continuous runs, single cycles, status and request previews

use anyhow::{bail, Result};
use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

use super::fetcher::{CycleStats, FetchConfig, FetchLoop};
use super::query::QueryBuilder;
use super::scheduler::{CycleScheduler, TickOutcome};
use super::sink::{DurableRecordSink, RecordLog};
use super::store::RecordStore;
use super::watermark::{Watermark, WatermarkCache};
use crate::config::SyncConfig;
use crate::remote::{GraphQlRequest, QueryApiClient, QueryTransport};
use crate::utils::sanitize_url;

/// Snapshot of local sync progress.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub watermark: Option<Watermark>,
    pub records: u64,
    pub database: PathBuf,
    pub record_log: PathBuf,
}

/// Read sync progress from local storage only.
///
/// Needs nothing but the `storage` section. A database that does not exist
/// yet reports no watermark and is not created.
pub fn read_status(config: &SyncConfig) -> Result<SyncStatus> {
    let database = config.storage.database_path.clone();
    let (watermark, records) = match open_existing_store(config)? {
        Some(store) => (store.highest_watermark()?, store.record_count()?),
        None => (None, 0),
    };

    Ok(SyncStatus {
        watermark,
        records,
        database,
        record_log: config.storage.record_log_path.clone(),
    })
}

/// Render the first request the next cycle would send, cut off at now.
///
/// Only the query fields are validated; no endpoint or credentials needed.
pub fn preview_request(config: &SyncConfig) -> Result<GraphQlRequest> {
    config.validate_query()?;
    let now = Utc::now();
    let watermark = match open_existing_store(config)? {
        Some(store) => store.highest_watermark()?,
        None => None,
    };

    Ok(QueryBuilder::new(&config.query_fields()).build(
        watermark.as_ref(),
        &config.default_start(now)?,
        now,
        config.page_size(),
    ))
}

fn open_existing_store(config: &SyncConfig) -> Result<Option<RecordStore>> {
    let path = &config.storage.database_path;
    if !path.exists() {
        tracing::debug!("No record store at {} yet", path.display());
        return Ok(None);
    }
    RecordStore::open(path).map(Some)
}

/// SyncDaemon owns one replication pipeline.
///
/// Each cycle:
/// 1. Captures a snapshot cutoff
/// 2. Pages through records after the watermark and before the cutoff
/// 3. Appends each record to the log and upserts it into the store
/// 4. Advances the in-memory watermark
pub struct SyncDaemon {
    config: SyncConfig,
    store: Arc<RecordStore>,
    scheduler: Arc<CycleScheduler>,
}

impl SyncDaemon {
    /// Build the pipeline against the configured Query API endpoint.
    pub fn from_config(config: SyncConfig) -> Result<Self> {
        config.validate()?;
        let client = QueryApiClient::new(
            config.query_api.url.clone(),
            config.credentials()?,
            config.request_timeout(),
        )?;
        tracing::info!("Query API endpoint: {}", sanitize_url(client.url()));
        Self::with_transport(config, Arc::new(client))
    }

    /// Build the pipeline against any transport.
    pub fn with_transport(config: SyncConfig, transport: Arc<dyn QueryTransport>) -> Result<Self> {
        let store = Arc::new(RecordStore::open(&config.storage.database_path)?);
        let log = RecordLog::open(&config.storage.record_log_path)?;
        tracing::info!(
            "Record store: {}, record log: {}",
            store.path().display(),
            log.path().display()
        );

        let sink = Arc::new(DurableRecordSink::new(log, Arc::clone(&store)));
        let cache = Arc::new(WatermarkCache::new(store.clone()));
        let builder = QueryBuilder::new(&config.query_fields());

        let fetch_config = FetchConfig {
            page_size: config.page_size(),
            default_start: config.default_start(Utc::now())?,
            retry_max_attempts: config.query_api.retry_max_attempts,
            retry_delay: config.retry_delay(),
        };
        let fetch_loop = Arc::new(FetchLoop::new(transport, sink, cache, builder, fetch_config));
        let scheduler = Arc::new(CycleScheduler::new(
            fetch_loop,
            config.initial_delay(),
            config.interval(),
        ));

        Ok(Self {
            config,
            store,
            scheduler,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<CycleScheduler> {
        &self.scheduler
    }

    /// Run cycles on the configured interval until `shutdown` fires.
    pub async fn run(&self, shutdown: broadcast::Receiver<()>) -> Result<()> {
        Arc::clone(&self.scheduler).run(shutdown).await
    }

    /// Run exactly one gated cycle.
    pub async fn run_once(&self) -> Result<CycleStats> {
        match self.scheduler.tick().await {
            TickOutcome::Completed(stats) => Ok(stats),
            TickOutcome::Failed(e) => Err(e),
            TickOutcome::Skipped => bail!("A sync cycle is already running"),
        }
    }

    pub fn status(&self) -> Result<SyncStatus> {
        Ok(SyncStatus {
            watermark: self.scheduler.fetch_loop().cache().current()?,
            records: self.store.record_count()?,
            database: self.store.path().to_path_buf(),
            record_log: self.config.storage.record_log_path.clone(),
        })
    }

    /// The request the next cycle would send first, with the cutoff at `now`.
    pub fn next_request(&self) -> Result<GraphQlRequest> {
        let fetch_loop = self.scheduler.fetch_loop();
        let watermark = fetch_loop.cache().current()?;
        Ok(fetch_loop.builder().build(
            watermark.as_ref(),
            fetch_loop.default_start(),
            Utc::now(),
            fetch_loop.page_size(),
        ))
    }
}
