//! Per-chain failure taxonomy.

use ingest_data::{CheckpointError, FetchError, RpcError};
use ingest_sink::WriteError;
use serde::Serialize;
use std::fmt;

/// How a failure should be treated by an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Retrying later is expected to succeed
    Transient,
    /// Bad input that was isolated
    Malformed,
    /// A concurrency or ordering bug
    Regression,
    /// Configuration or provider problem needing intervention
    Fatal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Malformed => "malformed",
            ErrorCategory::Regression => "regression",
            ErrorCategory::Fatal => "fatal",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("blocks {start}..={end} still failing after {shrinks} batch shrinks: {source}")]
    ShrinkExhausted {
        start: u64,
        end: u64,
        shrinks: u32,
        #[source]
        source: FetchError,
    },
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    /// Another backfill or poller holds this chain.
    #[error("chain {chain} is already being ingested")]
    ChainBusy { chain: String },
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl PipelineError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            PipelineError::Fetch(FetchError::Fatal { .. }) => ErrorCategory::Fatal,
            PipelineError::Fetch(_) => ErrorCategory::Transient,
            PipelineError::ShrinkExhausted { .. } => ErrorCategory::Fatal,
            PipelineError::Write(WriteError::RetriesExhausted { .. }) => ErrorCategory::Transient,
            PipelineError::Write(WriteError::Fatal(_)) => ErrorCategory::Fatal,
            PipelineError::Checkpoint(CheckpointError::Regression { .. }) => {
                ErrorCategory::Regression
            }
            PipelineError::Checkpoint(CheckpointError::Backend(_)) => ErrorCategory::Fatal,
            PipelineError::ChainBusy { .. } => ErrorCategory::Regression,
            PipelineError::Rpc(e) if e.is_transient() => ErrorCategory::Transient,
            PipelineError::Rpc(_) => ErrorCategory::Fatal,
        }
    }

    /// Whether the failed batch may be retried with a smaller width.
    pub fn is_shrinkable(&self) -> bool {
        matches!(self, PipelineError::Fetch(e) if e.is_retryable())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Fetch(FetchError::Cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_follow_taxonomy() {
        let regression = PipelineError::Checkpoint(CheckpointError::Regression {
            chain_id: 1,
            current: 500,
            attempted: 480,
        });
        assert_eq!(regression.category(), ErrorCategory::Regression);

        let mismatch = PipelineError::Fetch(FetchError::Fatal {
            block: None,
            source: RpcError::ChainIdMismatch {
                expected: 1,
                actual: 5,
            },
        });
        assert_eq!(mismatch.category(), ErrorCategory::Fatal);
        assert!(!mismatch.is_shrinkable());

        let exhausted = PipelineError::Fetch(FetchError::RetriesExhausted {
            block: 205,
            attempts: 3,
            source: RpcError::Timeout(std::time::Duration::from_secs(1)),
        });
        assert_eq!(exhausted.category(), ErrorCategory::Transient);
        assert!(exhausted.is_shrinkable());

        assert_eq!(
            PipelineError::ChainBusy {
                chain: "ethereum".to_string()
            }
            .category(),
            ErrorCategory::Regression
        );
        assert!(PipelineError::Fetch(FetchError::Cancelled).is_cancelled());
    }
}
