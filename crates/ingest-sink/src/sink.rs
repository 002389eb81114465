//! The storage seam the Sink Writer submits batches to.

use async_trait::async_trait;
use ingest_data::Record;

/// Outcome of one failed submission.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// Timeouts, throttling, 5xx, lock contention. The whole batch may be retried.
    #[error("transient sink error: {0}")]
    Transient(String),
    /// The sink refused the payload. `index` points into the submitted slice
    /// when the sink names the offending record.
    #[error("sink rejected batch (record {index:?}): {reason}")]
    Rejected {
        index: Option<usize>,
        reason: String,
    },
    /// Authentication, missing bucket, misconfiguration.
    #[error("fatal sink error: {0}")]
    Fatal(String),
}

/// A time-series backend. Writes must be upserts by measurement + natural key.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Human-readable backend name for logs.
    fn name(&self) -> &str;

    /// Writes every record or none of them.
    async fn submit(&self, records: &[Record]) -> Result<(), SubmitError>;
}
