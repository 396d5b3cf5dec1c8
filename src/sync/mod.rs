// ABOUTME: Watermark-based incremental sync from the Query API into a local record store
// ABOUTME: Resumes after the highest persisted (finishDate, surveyId) pair on every cycle

pub mod daemon;
pub mod fetcher;
pub mod query;
pub mod scheduler;
pub mod sink;
pub mod store;
pub mod watermark;

pub use daemon::{preview_request, read_status, SyncDaemon, SyncStatus};
pub use fetcher::{CycleState, CycleStats, FetchConfig, FetchLoop};
pub use query::{clamp_page_size, QueryBuilder, QueryFields, StartPoint, MAX_RECORDS_PER_REQUEST};
pub use scheduler::{CycleScheduler, TickOutcome};
pub use sink::{
    node_watermark, DurableRecordSink, PersistError, RecordLog, RecordSink, FINISH_DATE_ALIAS,
    RECORD_STREAM_TARGET, SURVEY_ID_ALIAS,
};
pub use store::RecordStore;
pub use watermark::{utc_from_epoch, RecordId, Watermark, WatermarkCache, WatermarkSource};
