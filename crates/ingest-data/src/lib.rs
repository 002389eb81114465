//! ingest-data crate
//!
//! Chain data model, node access, checkpoints and the local SQLite store.

pub mod checkpoint;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod reader;
pub mod record;
pub mod retry;
pub mod rpc;
pub mod stats;
pub mod store;
pub mod types;

pub use checkpoint::{CheckpointError, CheckpointStore, MemoryCheckpoints};
pub use reader::{ChainReader, FetchError};
pub use record::{FieldValue, NaturalKey, Record, RecordError};
pub use retry::RetryPolicy;
pub use rpc::{AlloyRpc, ChainRpc, RpcError};
pub use stats::{EventCounter, IngestStats, StatsSnapshot};
pub use store::{Store, StoreError};
pub use types::{
    Block, BlockBundle, ChainHandle, LogEntry, RateLimit, Receipt, ReceiptMode, Transaction,
    TxStatus,
};
