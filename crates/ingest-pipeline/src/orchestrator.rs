//! Multi-chain orchestration.
//!
//! Every chain runs in its own task on a `JoinSet`. Chains share nothing but
//! the sink, the checkpoint store and one cancellation token, so a failing
//! chain never stalls the others.

use ingest_data::{AlloyRpc, ChainRpc, CheckpointStore, Store};
use ingest_decode::SignatureRegistry;
use ingest_sink::{InfluxSettings, InfluxSink, RecordSink, SubmitError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{ChainConfig, IngestConfig, SinkConfig};
use crate::error::PipelineError;
use crate::pipeline::{ChainPhase, ChainPipeline, ChainProgress, ChainReport, PipelineSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Catch up to the confirmed head, then stop
    Backfill,
    /// Real-time polling only
    Follow,
    /// Backfill, then keep polling
    BackfillThenFollow,
}

/// Builds the configured sink. The SQLite sink shares `store` with checkpoints.
///
/// # Errors
/// [`SubmitError::Fatal`] if the HTTP client cannot be built.
pub fn open_sink(config: &IngestConfig, store: Arc<Store>) -> Result<Arc<dyn RecordSink>, SubmitError> {
    match &config.sink {
        SinkConfig::Influx(influx) => {
            let sink = InfluxSink::new(&InfluxSettings {
                url: influx.url.clone(),
                org: influx.org.clone(),
                bucket: influx.bucket.clone(),
                token: influx.token.clone(),
                timeout: Duration::from_millis(influx.timeout_ms),
            })?;
            Ok(Arc::new(sink))
        }
        SinkConfig::Sqlite => Ok(store),
    }
}

/// One pipeline per chain, each talking to its node over HTTP.
///
/// # Errors
/// [`PipelineError::Rpc`] for an RPC URL the provider rejects.
pub fn build_pipelines(
    config: &IngestConfig,
    chains: &[&ChainConfig],
    sink: Arc<dyn RecordSink>,
    checkpoints: Arc<dyn CheckpointStore>,
    registry: Arc<SignatureRegistry>,
) -> Result<Vec<Arc<ChainPipeline>>, PipelineError> {
    chains
        .iter()
        .map(|chain| -> Result<Arc<ChainPipeline>, PipelineError> {
            let rpc: Arc<dyn ChainRpc> = Arc::new(AlloyRpc::new(&chain.rpc_url)?);
            Ok(Arc::new(ChainPipeline::new(
                chain.handle(),
                rpc,
                sink.clone(),
                checkpoints.clone(),
                registry.clone(),
                PipelineSettings::from_config(chain, config),
            )))
        })
        .collect()
}

pub struct Orchestrator {
    pipelines: Vec<Arc<ChainPipeline>>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(pipelines: Vec<Arc<ChainPipeline>>) -> Self {
        Self {
            pipelines,
            cancel: CancellationToken::new(),
        }
    }

    pub fn pipelines(&self) -> &[Arc<ChainPipeline>] {
        &self.pipelines
    }

    /// Cancelling this token stops every chain at its next batch boundary.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn subscribe(&self) -> Vec<watch::Receiver<ChainProgress>> {
        self.pipelines.iter().map(|p| p.subscribe()).collect()
    }

    /// Runs every chain to a terminal state. Reports are ordered by chain name.
    pub async fn run(&self, mode: RunMode) -> Vec<ChainReport> {
        let mut set = JoinSet::new();
        for pipeline in &self.pipelines {
            let pipeline = pipeline.clone();
            let cancel = self.cancel.clone();
            set.spawn(async move {
                match mode {
                    RunMode::Backfill => pipeline.backfill(&cancel).await,
                    RunMode::Follow => pipeline.follow(&cancel).await,
                    RunMode::BackfillThenFollow => {
                        let report = pipeline.backfill(&cancel).await;
                        if report.phase != ChainPhase::Done || cancel.is_cancelled() {
                            return report;
                        }
                        pipeline.follow(&cancel).await
                    }
                }
            });
        }

        tracing::info!(chains = self.pipelines.len(), ?mode, "ingestion started");
        let mut reports = Vec::with_capacity(self.pipelines.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => tracing::error!(error = %e, "chain task aborted"),
            }
        }
        reports.sort_by(|a, b| a.chain.cmp(&b.chain));

        let failed = reports.iter().filter(|r| r.phase == ChainPhase::Failed).count();
        tracing::info!(chains = reports.len(), failed, "ingestion finished");
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_data::mock::{sample_handle, Script, ScriptedRpc};
    use ingest_data::{MemoryCheckpoints, RetryPolicy};
    use ingest_sink::MemorySink;

    fn pipeline(
        chain_id: u64,
        rpc: Arc<ScriptedRpc>,
        sink: Arc<MemorySink>,
        checkpoints: Arc<MemoryCheckpoints>,
    ) -> Arc<ChainPipeline> {
        let fast = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2));
        Arc::new(ChainPipeline::new(
            sample_handle(chain_id),
            rpc,
            sink,
            checkpoints,
            Arc::new(SignatureRegistry::builtin()),
            PipelineSettings {
                batch_width: 8,
                max_shrink_retries: 2,
                start_block: None,
                end_block: None,
                poll_interval: Duration::from_millis(10),
                read_retry: fast,
                write_retry: fast,
                max_batch: 100,
            },
        ))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failing_chain_does_not_stop_others() {
        let sink = Arc::new(MemorySink::new());
        let checkpoints = Arc::new(MemoryCheckpoints::new());

        let healthy = Arc::new(ScriptedRpc::with_blocks(1, 0..=40));
        let broken = Arc::new(ScriptedRpc::with_blocks(10, 0..=40));
        broken.script(3, Script::FailFatal);

        let orchestrator = Orchestrator::new(vec![
            pipeline(1, healthy, sink.clone(), checkpoints.clone()),
            pipeline(10, broken, sink.clone(), checkpoints.clone()),
        ]);
        let reports = orchestrator.run(RunMode::Backfill).await;

        assert_eq!(reports.len(), 2);
        let by_id = |id: u64| reports.iter().find(|r| r.chain_id == id).expect("report per chain");
        assert_eq!(by_id(1).phase, ChainPhase::Done);
        assert_eq!(by_id(10).phase, ChainPhase::Failed);
        assert_eq!(checkpoints.get(1).await.expect("get"), Some(40));
        assert_eq!(checkpoints.get(10).await.expect("get"), None);

        // Records of both chains share the sink without colliding
        let blocks = sink.measurement("blocks");
        assert_eq!(blocks.iter().filter(|r| r.key.chain_id == 1).count(), 41);
    }

    #[tokio::test]
    async fn cancellation_stops_followers() {
        let rpc = Arc::new(ScriptedRpc::with_blocks(1, 0..=5));
        let orchestrator = Orchestrator::new(vec![pipeline(
            1,
            rpc,
            Arc::new(MemorySink::new()),
            Arc::new(MemoryCheckpoints::new()),
        )]);
        let cancel = orchestrator.cancel_token();
        let mut progress = orchestrator.subscribe().remove(0);

        let run = orchestrator.run(RunMode::BackfillThenFollow);
        let stop = async {
            progress
                .wait_for(|p| p.phase == ChainPhase::Following)
                .await
                .expect("pipeline should reach following");
            cancel.cancel();
        };
        let (reports, ()) = tokio::join!(run, stop);
        assert_eq!(reports[0].phase, ChainPhase::Cancelled);
        assert_eq!(reports[0].checkpoint, Some(5));
    }
}
