//! Per-chain ingestion progress.
//!
//! A checkpoint is the highest block whose records are durably written.
//! It only moves forward: [`CheckpointStore::advance`] refuses to lower it.

use async_trait::async_trait;
use dashmap::DashMap;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// An attempt to move the checkpoint backwards.
    #[error("checkpoint regression on chain {chain_id}: stored {current}, attempted {attempted}")]
    Regression {
        chain_id: u64,
        current: u64,
        attempted: u64,
    },
    /// The backing store failed.
    #[error("checkpoint backend error: {0}")]
    Backend(String),
}

/// Durable "last block fully ingested" per chain.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Last confirmed block for the chain, or `None` before the first batch.
    async fn get(&self, chain_id: u64) -> Result<Option<u64>, CheckpointError>;

    /// Compare-and-advance. Equal values are accepted so a replayed batch
    /// can re-confirm its own checkpoint.
    ///
    /// # Errors
    /// [`CheckpointError::Regression`] if `block` is below the stored value;
    /// the stored value is left untouched.
    async fn advance(&self, chain_id: u64, block: u64) -> Result<(), CheckpointError>;
}

/// In-process checkpoint store.
#[derive(Debug, Default)]
pub struct MemoryCheckpoints {
    inner: DashMap<u64, u64>,
}

impl MemoryCheckpoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a chain with an existing checkpoint.
    pub fn with_checkpoint(self, chain_id: u64, block: u64) -> Self {
        self.inner.insert(chain_id, block);
        self
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpoints {
    async fn get(&self, chain_id: u64) -> Result<Option<u64>, CheckpointError> {
        Ok(self.inner.get(&chain_id).map(|v| *v))
    }

    async fn advance(&self, chain_id: u64, block: u64) -> Result<(), CheckpointError> {
        // The entry guard holds the shard lock, making check-and-set atomic.
        let mut entry = self.inner.entry(chain_id).or_insert(block);
        if block < *entry {
            return Err(CheckpointError::Regression {
                chain_id,
                current: *entry,
                attempted: block,
            });
        }
        *entry = block;
        Ok(())
    }
}
