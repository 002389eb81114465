//! In-memory sink keyed like the real backends. Used by tests and dry runs.

use async_trait::async_trait;
use dashmap::DashMap;
use ingest_data::{NaturalKey, Record};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::sink::{RecordSink, SubmitError};

#[derive(Debug, Default)]
pub struct MemorySink {
    records: DashMap<(String, NaturalKey), Record>,
    submissions: AtomicU64,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of successful `submit` calls.
    pub fn submissions(&self) -> u64 {
        self.submissions.load(Ordering::Relaxed)
    }

    pub fn get(&self, measurement: &str, key: &NaturalKey) -> Option<Record> {
        self.records
            .get(&(measurement.to_string(), *key))
            .map(|r| r.value().clone())
    }

    /// All stored records of one measurement, ordered by key.
    pub fn measurement(&self, measurement: &str) -> Vec<Record> {
        let mut out: Vec<Record> = self
            .records
            .iter()
            .filter(|e| e.key().0 == measurement)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|r| r.key);
        out
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn submit(&self, records: &[Record]) -> Result<(), SubmitError> {
        for record in records {
            self.records
                .insert((record.measurement.clone(), record.key), record.clone());
        }
        self.submissions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
