// ABOUTME: Fetch loop for incremental sync - pages through the Query API after the watermark
// ABOUTME: Persists each record in order and advances the watermark until a short page

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::query::{clamp_page_size, QueryBuilder, StartPoint};
use super::sink::{PersistError, RecordSink};
use super::watermark::{Watermark, WatermarkCache};
use crate::remote::QueryTransport;
use crate::utils::retry_with_fixed_delay;

/// Tunables for one fetch loop.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Requested records per page; clamped to the hard ceiling.
    pub page_size: usize,
    /// Lower bound used until the first record has been consumed.
    pub default_start: StartPoint,
    /// Attempts per page request (at least one).
    pub retry_max_attempts: u32,
    /// Pause between attempts.
    pub retry_delay: Duration,
}

/// Fixed for the whole pagination loop of one cycle.
#[derive(Debug, Clone)]
pub struct CycleState {
    pub snapshot_cutoff: DateTime<Utc>,
    pub start_watermark: Option<Watermark>,
}

/// Statistics from a sync cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleStats {
    pub pages: u64,
    pub records_persisted: u64,
    pub records_skipped: u64,
    pub final_watermark: Option<Watermark>,
    pub duration_ms: u64,
    /// A full page held only malformed records, so the cycle stopped without
    /// advancing. Later cycles will hit the same page until the source is fixed.
    pub stalled: bool,
}

/// Drives one cycle of paging: build the request from the current watermark,
/// fetch it (with retries), drain the nodes, and decide whether to page again.
pub struct FetchLoop {
    transport: Arc<dyn QueryTransport>,
    sink: Arc<dyn RecordSink>,
    cache: Arc<WatermarkCache>,
    builder: QueryBuilder,
    config: FetchConfig,
}

impl FetchLoop {
    pub fn new(
        transport: Arc<dyn QueryTransport>,
        sink: Arc<dyn RecordSink>,
        cache: Arc<WatermarkCache>,
        builder: QueryBuilder,
        config: FetchConfig,
    ) -> Self {
        let config = FetchConfig {
            page_size: clamp_page_size(config.page_size),
            ..config
        };
        tracing::info!("Maximum records per request: {}", config.page_size);

        Self {
            transport,
            sink,
            cache,
            builder,
            config,
        }
    }

    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    pub fn cache(&self) -> &Arc<WatermarkCache> {
        &self.cache
    }

    pub fn builder(&self) -> &QueryBuilder {
        &self.builder
    }

    pub fn default_start(&self) -> &StartPoint {
        &self.config.default_start
    }

    /// Run every page below `snapshot_cutoff`, starting after the current watermark.
    ///
    /// Returns an error when a page request exhausts its retries, when a
    /// record cannot be stored, or when a full page fails to move the
    /// watermark. Records consumed before the error stay consumed.
    /// A full page made up only of malformed records ends the cycle with
    /// `stalled` set instead.
    pub async fn run_cycle(&self, snapshot_cutoff: DateTime<Utc>) -> Result<CycleStats> {
        let start = Instant::now();
        let mut stats = CycleStats::default();

        let cycle = CycleState {
            snapshot_cutoff,
            start_watermark: self.cache.current()?,
        };
        match &cycle.start_watermark {
            Some(watermark) => tracing::info!(
                "Querying new records after {} up to {}",
                watermark,
                cycle.snapshot_cutoff.to_rfc3339()
            ),
            None => tracing::info!(
                "Querying new records from default start up to {}",
                cycle.snapshot_cutoff.to_rfc3339()
            ),
        }

        loop {
            let watermark = self.cache.current()?;
            let request = self.builder.build(
                watermark.as_ref(),
                &self.config.default_start,
                cycle.snapshot_cutoff,
                self.config.page_size,
            );

            let transport = &self.transport;
            let request = &request;
            let page = retry_with_fixed_delay(
                move || transport.fetch_page(request),
                self.config.retry_max_attempts,
                self.config.retry_delay,
            )
            .await
            .with_context(|| format!("Query API request for page {} failed", stats.pages + 1))?;

            stats.pages += 1;
            tracing::debug!(
                "Page {}: {} node(s), totalCount={}",
                stats.pages,
                page.nodes.len(),
                page.total_count
            );

            // Nodes arrive in ascending (finishDate, surveyId) order; draining
            // them in order keeps the watermark moving forward only.
            let mut skipped_on_page = 0usize;
            for node in &page.nodes {
                match self.sink.persist(node) {
                    Ok(consumed) => {
                        self.cache.advance_if_greater(consumed)?;
                        stats.records_persisted += 1;
                    }
                    Err(PersistError::Malformed(reason)) => {
                        tracing::warn!("Skipping record: {}", reason);
                        stats.records_skipped += 1;
                        skipped_on_page += 1;
                    }
                    Err(e) => {
                        return Err(anyhow::Error::new(e).context(format!(
                            "Aborting cycle after {} record(s); will resume from the last stored record",
                            stats.records_persisted
                        )));
                    }
                }
            }

            if page.total_count < self.config.page_size as u64 {
                tracing::info!("No more records to pull for this job");
                break;
            }

            if self.cache.current()? == watermark {
                if !page.nodes.is_empty() && skipped_on_page == page.nodes.len() {
                    tracing::error!(
                        "Full page of {} record(s) after {} was entirely malformed; sync is stalled at this position",
                        skipped_on_page,
                        watermark
                            .as_ref()
                            .map(|w| w.to_string())
                            .unwrap_or_else(|| "the default start".to_string())
                    );
                    stats.stalled = true;
                    break;
                }
                bail!(
                    "Full page (totalCount={}) did not advance the watermark; refusing to request the same page again",
                    page.total_count
                );
            }

            tracing::info!("Hit page max, pulling another page");
        }

        stats.final_watermark = self.cache.current()?;
        stats.duration_ms = start.elapsed().as_millis() as u64;
        Ok(stats)
    }
}
