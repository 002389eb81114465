//! The local SQLite store as a record sink.

use async_trait::async_trait;
use ingest_data::{Record, Store, StoreError};
use rusqlite::ErrorCode;

use crate::sink::{RecordSink, SubmitError};

fn classify(err: StoreError) -> SubmitError {
    match &err {
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            SubmitError::Transient(err.to_string())
        }
        StoreError::Encoding(_) => SubmitError::Rejected {
            index: None,
            reason: err.to_string(),
        },
        _ => SubmitError::Fatal(err.to_string()),
    }
}

#[async_trait]
impl RecordSink for Store {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn submit(&self, records: &[Record]) -> Result<(), SubmitError> {
        self.upsert_records(records).map(|_| ()).map_err(classify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::U256;
    use ingest_data::NaturalKey;

    #[tokio::test]
    async fn submit_upserts_into_store() {
        let store = Store::new(":memory:").expect("in-memory store should open");
        let record = Record::new("token_transfers", NaturalKey::block(1, 5), 100)
            .tag("chain_id", "1")
            .field("amount", U256::from(9u64));

        store.submit(&[record.clone()]).await.expect("first submit should succeed");
        store.submit(&[record]).await.expect("replay should succeed");

        let counts = store.record_counts(1).expect("counts should load");
        assert_eq!(counts, vec![("token_transfers".to_string(), 1)]);
    }

    #[test]
    fn busy_database_is_transient() {
        let err = StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(matches!(classify(err), SubmitError::Transient(_)));
        assert!(matches!(
            classify(StoreError::Poisoned),
            SubmitError::Fatal(_)
        ));
    }
}
