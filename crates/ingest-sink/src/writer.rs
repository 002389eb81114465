//! Sink Writer: batching, transient retry and malformed-record isolation.
//!
//! Records are grouped by measurement and submitted in chunks of at most
//! `max_batch`. A transient failure retries the chunk with backoff. A
//! rejection drops the record the sink names, or bisects the chunk until the
//! offending record is alone, so one bad record never blocks the rest.

use ingest_data::stats::bump;
use ingest_data::{IngestStats, Record, RetryPolicy};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use crate::sink::{RecordSink, SubmitError};

/// A record the sink will never accept.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedRecord {
    pub record: Record,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Success { written: usize },
    PartialFailure {
        written: usize,
        failed: Vec<FailedRecord>,
    },
}

impl WriteOutcome {
    pub fn written(&self) -> usize {
        match self {
            WriteOutcome::Success { written } | WriteOutcome::PartialFailure { written, .. } => {
                *written
            }
        }
    }

    pub fn failed(&self) -> &[FailedRecord] {
        match self {
            WriteOutcome::Success { .. } => &[],
            WriteOutcome::PartialFailure { failed, .. } => failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    /// Records already submitted stay written; the caller must replay the batch.
    #[error("write retries exhausted after {attempts} attempts ({written} records written): {last}")]
    RetriesExhausted {
        attempts: u32,
        written: usize,
        last: String,
    },
    #[error("fatal sink error: {0}")]
    Fatal(String),
}

pub struct SinkWriter {
    sink: Arc<dyn RecordSink>,
    max_batch: usize,
    retry: RetryPolicy,
    stats: Arc<IngestStats>,
}

impl SinkWriter {
    pub fn new(
        sink: Arc<dyn RecordSink>,
        max_batch: usize,
        retry: RetryPolicy,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            sink,
            max_batch: max_batch.max(1),
            retry,
            stats,
        }
    }

    pub fn sink_name(&self) -> &str {
        self.sink.name()
    }

    /// Writes `records`, isolating any the sink refuses.
    ///
    /// # Errors
    /// [`WriteError::RetriesExhausted`] when a chunk keeps failing
    /// transiently, [`WriteError::Fatal`] when the sink is unusable.
    #[tracing::instrument(skip(self, records), fields(sink = self.sink.name(), records = records.len()))]
    pub async fn write(&self, records: Vec<Record>) -> Result<WriteOutcome, WriteError> {
        let mut failed = Vec::new();
        let mut groups: BTreeMap<String, Vec<Record>> = BTreeMap::new();
        for record in records {
            match record.validate() {
                Ok(()) => groups
                    .entry(record.measurement.clone())
                    .or_default()
                    .push(record),
                Err(e) => {
                    tracing::warn!(
                        measurement = %record.measurement,
                        block = record.key.block_number,
                        error = %e,
                        "dropping invalid record"
                    );
                    failed.push(FailedRecord {
                        record,
                        reason: e.to_string(),
                    });
                }
            }
        }

        let mut queue: VecDeque<Vec<Record>> = VecDeque::new();
        for (_, group) in groups {
            let mut group = group;
            while group.len() > self.max_batch {
                let rest = group.split_off(self.max_batch);
                queue.push_back(group);
                group = rest;
            }
            queue.push_back(group);
        }

        let mut written = 0usize;
        while let Some(mut chunk) = queue.pop_front() {
            match self.submit_with_retry(&chunk, written).await? {
                None => {
                    written += chunk.len();
                    bump(&self.stats.records_written, chunk.len() as u64);
                }
                Some((Some(index), reason)) if index < chunk.len() => {
                    let record = chunk.remove(index);
                    tracing::warn!(
                        measurement = %record.measurement,
                        block = record.key.block_number,
                        %reason,
                        "sink rejected record; isolating it"
                    );
                    failed.push(FailedRecord { record, reason });
                    if !chunk.is_empty() {
                        queue.push_front(chunk);
                    }
                }
                Some((_, reason)) if chunk.len() == 1 => {
                    let record = chunk.remove(0);
                    tracing::warn!(
                        measurement = %record.measurement,
                        block = record.key.block_number,
                        %reason,
                        "sink rejected record; isolating it"
                    );
                    failed.push(FailedRecord { record, reason });
                }
                Some((_, reason)) => {
                    tracing::debug!(size = chunk.len(), %reason, "bisecting rejected chunk");
                    let second = chunk.split_off(chunk.len() / 2);
                    queue.push_front(second);
                    queue.push_front(chunk);
                }
            }
        }

        if failed.is_empty() {
            Ok(WriteOutcome::Success { written })
        } else {
            bump(&self.stats.records_failed, failed.len() as u64);
            Ok(WriteOutcome::PartialFailure { written, failed })
        }
    }

    /// Submits one chunk, retrying transient failures. A rejection is
    /// returned as `Ok(Some((index, reason)))`.
    async fn submit_with_retry(
        &self,
        chunk: &[Record],
        written: usize,
    ) -> Result<Option<(Option<usize>, String)>, WriteError> {
        let mut attempt = 0u32;
        loop {
            match self.sink.submit(chunk).await {
                Ok(()) => return Ok(None),
                Err(SubmitError::Rejected { index, reason }) => return Ok(Some((index, reason))),
                Err(SubmitError::Fatal(reason)) => {
                    tracing::error!(sink = self.sink.name(), %reason, "fatal sink error");
                    return Err(WriteError::Fatal(reason));
                }
                Err(SubmitError::Transient(reason)) => {
                    if !self.retry.should_retry(attempt) {
                        return Err(WriteError::RetriesExhausted {
                            attempts: attempt + 1,
                            written,
                            last: reason,
                        });
                    }
                    let delay = self.retry.backoff(attempt);
                    tracing::warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        %reason,
                        "transient sink error, retrying"
                    );
                    bump(&self.stats.write_retries, 1);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
