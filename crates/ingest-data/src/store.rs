//! SQLite storage for checkpoints and, when configured as the sink, records.
//!
//! Uses WAL mode and prepared statements inside one transaction per write.
//! Records are keyed by measurement plus [`NaturalKey`]; `INSERT OR REPLACE`
//! makes replays overwrite instead of append.

use alloy::primitives::B256;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::record::{FieldValue, NaturalKey, Record};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("column encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("invalid stored value: {0}")]
    Corrupt(String),
    #[error("store lock poisoned")]
    Poisoned,
}

impl From<StoreError> for CheckpointError {
    fn from(err: StoreError) -> Self {
        CheckpointError::Backend(err.to_string())
    }
}

/// A stored checkpoint row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRow {
    pub chain_id: u64,
    pub block_number: u64,
    pub updated_at: String,
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Creates or opens a SQLite database with WAL mode enabled.
    ///
    /// # Errors
    /// Returns error if the database cannot be opened or migrations fail.
    pub fn new(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn run_migrations(&self) -> Result<(), StoreError> {
        self.conn()?.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS checkpoints (
                chain_id INTEGER PRIMARY KEY,
                block_number INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS records (
                measurement TEXT NOT NULL,
                chain_id INTEGER NOT NULL,
                block_number INTEGER NOT NULL,
                tx_hash TEXT NOT NULL DEFAULT '',
                log_index INTEGER NOT NULL DEFAULT -1,
                sub_index INTEGER NOT NULL DEFAULT 0,
                timestamp INTEGER NOT NULL,
                tags TEXT NOT NULL,
                fields TEXT NOT NULL,
                PRIMARY KEY (measurement, chain_id, block_number, tx_hash, log_index, sub_index)
            );

            CREATE INDEX IF NOT EXISTS records_by_chain
                ON records (chain_id, measurement, block_number);
            ",
        )?;
        Ok(())
    }

    /// Upserts records by natural key in a single transaction.
    ///
    /// # Errors
    /// Returns error if encoding or any insert fails; nothing is committed then.
    pub fn upsert_records(&self, records: &[Record]) -> Result<usize, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "
                INSERT OR REPLACE INTO records (
                    measurement, chain_id, block_number, tx_hash, log_index, sub_index,
                    timestamp, tags, fields
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ",
            )?;

            for record in records {
                let key = &record.key;
                stmt.execute(params![
                    record.measurement,
                    key.chain_id as i64,
                    key.block_number as i64,
                    key.tx_hash.map(|h| format!("{h:#x}")).unwrap_or_default(),
                    key.log_index.map(|i| i as i64).unwrap_or(-1),
                    key.sub_index,
                    record.timestamp as i64,
                    serde_json::to_string(&record.tags)?,
                    serde_json::to_string(&record.fields)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(records.len())
    }

    /// Reads back all records of a measurement for a chain, ordered by key.
    ///
    /// # Errors
    /// Returns error if the query fails or a stored row cannot be decoded.
    pub fn query_records(&self, measurement: &str, chain_id: u64) -> Result<Vec<Record>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "
            SELECT block_number, tx_hash, log_index, sub_index, timestamp, tags, fields
            FROM records
            WHERE measurement = ? AND chain_id = ?
            ORDER BY block_number, tx_hash, log_index, sub_index
            ",
        )?;

        let rows = stmt.query_map(params![measurement, chain_id as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, u32>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (block_number, tx_hash, log_index, sub_index, timestamp, tags, fields) = row?;
            let tx_hash = if tx_hash.is_empty() {
                None
            } else {
                Some(
                    tx_hash
                        .parse::<B256>()
                        .map_err(|e| StoreError::Corrupt(format!("tx_hash {tx_hash}: {e}")))?,
                )
            };
            let tags: BTreeMap<String, String> = serde_json::from_str(&tags)?;
            let fields: BTreeMap<String, FieldValue> = serde_json::from_str(&fields)?;
            records.push(Record {
                measurement: measurement.to_string(),
                key: NaturalKey {
                    chain_id,
                    block_number: block_number as u64,
                    tx_hash,
                    log_index: u64::try_from(log_index).ok(),
                    sub_index,
                },
                tags,
                fields,
                timestamp: timestamp as u64,
            });
        }
        Ok(records)
    }

    /// Number of stored records per measurement for a chain.
    ///
    /// # Errors
    /// Returns error if the query fails.
    pub fn record_counts(&self, chain_id: u64) -> Result<Vec<(String, u64)>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT measurement, COUNT(*) FROM records WHERE chain_id = ? GROUP BY measurement ORDER BY measurement",
        )?;
        let rows = stmt.query_map(params![chain_id as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// All stored checkpoints, ordered by chain id.
    ///
    /// # Errors
    /// Returns error if the query fails.
    pub fn checkpoints(&self) -> Result<Vec<CheckpointRow>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT chain_id, block_number, updated_at FROM checkpoints ORDER BY chain_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(CheckpointRow {
                chain_id: row.get::<_, i64>(0)? as u64,
                block_number: row.get::<_, i64>(1)? as u64,
                updated_at: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Deletes a chain's checkpoint so the next backfill starts over.
    ///
    /// This is an operator action, not part of the ingestion path.
    ///
    /// # Errors
    /// Returns error if the delete fails.
    pub fn reset_checkpoint(&self, chain_id: u64) -> Result<bool, StoreError> {
        let removed = self
            .conn()?
            .execute("DELETE FROM checkpoints WHERE chain_id = ?", params![chain_id as i64])?;
        Ok(removed > 0)
    }

    fn read_checkpoint(&self, chain_id: u64) -> Result<Option<u64>, StoreError> {
        let value = self
            .conn()?
            .query_row(
                "SELECT block_number FROM checkpoints WHERE chain_id = ?",
                params![chain_id as i64],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(value.map(|v| v as u64))
    }

    fn compare_and_advance(&self, chain_id: u64, block: u64) -> Result<(), CheckpointError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(StoreError::from)?;
        let current = tx
            .query_row(
                "SELECT block_number FROM checkpoints WHERE chain_id = ?",
                params![chain_id as i64],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map_err(StoreError::from)?
            .map(|v| v as u64);

        if let Some(current) = current {
            if block < current {
                return Err(CheckpointError::Regression {
                    chain_id,
                    current,
                    attempted: block,
                });
            }
        }

        tx.execute(
            "
            INSERT INTO checkpoints (chain_id, block_number, updated_at)
            VALUES (?1, ?2, datetime('now'))
            ON CONFLICT(chain_id) DO UPDATE SET
                block_number = excluded.block_number,
                updated_at = excluded.updated_at
            ",
            params![chain_id as i64, block as i64],
        )
        .map_err(StoreError::from)?;
        tx.commit().map_err(StoreError::from)?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for Store {
    async fn get(&self, chain_id: u64) -> Result<Option<u64>, CheckpointError> {
        Ok(self.read_checkpoint(chain_id)?)
    }

    async fn advance(&self, chain_id: u64, block: u64) -> Result<(), CheckpointError> {
        self.compare_and_advance(chain_id, block)
    }
}
