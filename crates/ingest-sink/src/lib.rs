//! ingest-sink crate
//!
//! Record mapping, line-protocol encoding, sink backends and the Sink Writer.

pub mod influx;
pub mod line_protocol;
pub mod mapper;
pub mod memory;
pub mod sink;
pub mod sqlite;
pub mod writer;

pub use influx::{InfluxSettings, InfluxSink};
pub use mapper::{block_record, to_records, transaction_record, ChainTags};
pub use memory::MemorySink;
pub use sink::{RecordSink, SubmitError};
pub use writer::{FailedRecord, SinkWriter, WriteError, WriteOutcome};
