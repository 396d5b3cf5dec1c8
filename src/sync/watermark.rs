// ABOUTME: Watermark types and the in-memory watermark cache for incremental sync
// ABOUTME: Orders records by (finish timestamp, survey id) and memoizes the resume point

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

/// Arbitrary-precision, non-negative record identifier.
///
/// Stored as canonical decimal digits (no sign, no leading zeros), which makes
/// numeric ordering a matter of comparing length first and digits second.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Parse a decimal string into a canonical identifier.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            bail!("record identifier is empty");
        }
        if !raw.bytes().all(|b| b.is_ascii_digit()) {
            bail!("record identifier {:?} is not a non-negative integer", raw);
        }

        let canonical = raw.trim_start_matches('0');
        if canonical.is_empty() {
            Ok(Self("0".to_string()))
        } else {
            Ok(Self(canonical.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for RecordId {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        Self::parse(value)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Ord for RecordId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for RecordId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The highest record consumed so far: the point a sync resumes after.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Watermark {
    pub survey_id: RecordId,
    pub finish_date: DateTime<Utc>,
}

impl Watermark {
    pub fn new(survey_id: RecordId, finish_date: DateTime<Utc>) -> Self {
        Self {
            survey_id,
            finish_date,
        }
    }

    /// Build a watermark from an epoch-seconds timestamp.
    pub fn from_epoch(survey_id: RecordId, epoch_secs: i64) -> Result<Self> {
        Ok(Self::new(survey_id, utc_from_epoch(epoch_secs)?))
    }

    pub fn epoch_secs(&self) -> i64 {
        self.finish_date.timestamp()
    }
}

/// Finish timestamp first, survey id second. The Query API `orderBy` and the
/// lower-bound filter use the same order; they must stay in lock-step.
impl Ord for Watermark {
    fn cmp(&self, other: &Self) -> Ordering {
        self.finish_date
            .cmp(&other.finish_date)
            .then_with(|| self.survey_id.cmp(&other.survey_id))
    }
}

impl PartialOrd for Watermark {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "survey {} (finishDate={}/{})",
            self.survey_id,
            self.finish_date.to_rfc3339(),
            self.epoch_secs()
        )
    }
}

/// Convert epoch seconds into a UTC instant.
pub fn utc_from_epoch(epoch_secs: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(epoch_secs, 0)
        .with_context(|| format!("epoch timestamp {} is out of range", epoch_secs))
}

/// Durable source of the highest persisted watermark.
pub trait WatermarkSource: Send + Sync {
    fn load_highest(&self) -> Result<Option<Watermark>>;
}

enum Slot {
    Unloaded,
    Loaded(Option<Watermark>),
}

/// In-memory mirror of the durable watermark.
///
/// The first read loads the highest persisted record and memoizes the result,
/// including "nothing persisted yet". Afterwards only `advance_if_greater`
/// changes the value.
pub struct WatermarkCache {
    source: Arc<dyn WatermarkSource>,
    slot: RwLock<Slot>,
}

impl WatermarkCache {
    pub fn new(source: Arc<dyn WatermarkSource>) -> Self {
        Self {
            source,
            slot: RwLock::new(Slot::Unloaded),
        }
    }

    /// Return the current watermark, loading it from storage on first use.
    pub fn current(&self) -> Result<Option<Watermark>> {
        {
            let slot = self.slot.read().unwrap_or_else(PoisonError::into_inner);
            if let Slot::Loaded(watermark) = &*slot {
                return Ok(watermark.clone());
            }
        }

        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        Ok(self.ensure_loaded(&mut slot)?.clone())
    }

    /// Replace the watermark if `candidate` is strictly greater.
    ///
    /// Returns whether the in-memory value changed.
    pub fn advance_if_greater(&self, candidate: Watermark) -> Result<bool> {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        let current = self.ensure_loaded(&mut slot)?;

        let has_update = match current.as_ref() {
            None => true,
            Some(existing) => candidate > *existing,
        };
        if has_update {
            tracing::debug!("Advancing watermark to {}", candidate);
            *current = Some(candidate);
        }
        Ok(has_update)
    }

    /// Whether the one-time storage load has happened.
    pub fn is_loaded(&self) -> bool {
        matches!(
            *self.slot.read().unwrap_or_else(PoisonError::into_inner),
            Slot::Loaded(_)
        )
    }

    fn ensure_loaded<'a>(&self, slot: &'a mut Slot) -> Result<&'a mut Option<Watermark>> {
        if matches!(*slot, Slot::Unloaded) {
            tracing::info!("Initializing watermark from persistent storage");
            let loaded = self
                .source
                .load_highest()
                .context("Failed to load watermark from persistent storage")?;
            match &loaded {
                Some(watermark) => tracing::info!("Starting pull process at {}", watermark),
                None => {
                    tracing::info!("No record in persistent storage found as initial starting point")
                }
            }
            *slot = Slot::Loaded(loaded);
        }

        match slot {
            Slot::Loaded(watermark) => Ok(watermark),
            Slot::Unloaded => unreachable!("slot was loaded above"),
        }
    }
}
