//! Per-chain ingestion: the backfill state machine and the real-time poller.
//!
//! A batch moves through Planning, Fetching, Writing and Advancing. The
//! checkpoint only advances after every record of the batch was handed to
//! the sink, and the next batch is not planned before that. Cancellation is
//! observed between batches and while fetching; a batch that reached
//! Writing always runs to its checkpoint.

use ingest_data::stats::bump;
use ingest_data::{
    BlockBundle, ChainHandle, ChainReader, ChainRpc, CheckpointStore, FetchError, IngestStats,
    Record, RetryPolicy, StatsSnapshot,
};
use ingest_decode::{Classifier, DomainEvent, SignatureRegistry};
use ingest_sink::{
    block_record, to_records, transaction_record, ChainTags, RecordSink, SinkWriter,
    WriteOutcome,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::{ChainConfig, IngestConfig};
use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainPhase {
    Idle,
    Planning,
    Fetching,
    Writing,
    Advancing,
    /// Real-time poller waiting for the next tick
    Following,
    Done,
    Failed,
    Cancelled,
}

impl ChainPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChainPhase::Done | ChainPhase::Failed | ChainPhase::Cancelled)
    }
}

/// Latest state of one chain, published over a `watch` channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainProgress {
    pub chain: String,
    pub chain_id: u64,
    pub phase: ChainPhase,
    /// Last committed block
    pub checkpoint: Option<u64>,
    /// Block the current run is heading for
    pub target: Option<u64>,
    pub batch: Option<(u64, u64)>,
    pub width: u64,
    pub error: Option<String>,
}

/// Terminal result of a backfill or follow run.
#[derive(Debug)]
pub struct ChainReport {
    pub chain: String,
    pub chain_id: u64,
    pub phase: ChainPhase,
    pub checkpoint: Option<u64>,
    pub target: Option<u64>,
    pub error: Option<PipelineError>,
    pub stats: StatsSnapshot,
}

/// Knobs of one chain's pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub batch_width: u64,
    pub max_shrink_retries: u32,
    pub start_block: Option<u64>,
    pub end_block: Option<u64>,
    pub poll_interval: Duration,
    pub read_retry: RetryPolicy,
    pub write_retry: RetryPolicy,
    pub max_batch: usize,
}

impl PipelineSettings {
    pub fn from_config(chain: &ChainConfig, config: &IngestConfig) -> Self {
        Self {
            batch_width: chain.batch_width,
            max_shrink_retries: chain.max_shrink_retries,
            start_block: chain.start_block,
            end_block: chain.end_block,
            poll_interval: chain.poll_interval(),
            read_retry: chain.read_retry(),
            write_retry: config.write_retry.policy(),
            max_batch: config.sink.max_batch(),
        }
    }
}

/// What a committed batch produced.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult {
    pub start: u64,
    pub end: u64,
    pub outcome: WriteOutcome,
}

pub struct ChainPipeline {
    handle: Arc<ChainHandle>,
    reader: ChainReader,
    registry: Arc<SignatureRegistry>,
    classifier: Classifier,
    writer: SinkWriter,
    checkpoints: Arc<dyn CheckpointStore>,
    tags: ChainTags,
    settings: PipelineSettings,
    stats: Arc<IngestStats>,
    lease: Mutex<()>,
    progress: watch::Sender<ChainProgress>,
}

impl ChainPipeline {
    pub fn new(
        handle: ChainHandle,
        rpc: Arc<dyn ChainRpc>,
        sink: Arc<dyn RecordSink>,
        checkpoints: Arc<dyn CheckpointStore>,
        registry: Arc<SignatureRegistry>,
        settings: PipelineSettings,
    ) -> Self {
        let handle = Arc::new(handle);
        let stats = Arc::new(IngestStats::new());
        let reader = ChainReader::new(rpc, handle.clone(), settings.read_retry, stats.clone());
        let classifier = Classifier::new(registry.clone()).with_stats(stats.clone());
        let writer = SinkWriter::new(sink, settings.max_batch, settings.write_retry, stats.clone());
        let (progress, _) = watch::channel(ChainProgress {
            chain: handle.name.clone(),
            chain_id: handle.chain_id,
            phase: ChainPhase::Idle,
            checkpoint: None,
            target: None,
            batch: None,
            width: settings.batch_width,
            error: None,
        });

        Self {
            tags: ChainTags::from(handle.as_ref()),
            handle,
            reader,
            registry,
            classifier,
            writer,
            checkpoints,
            settings,
            stats,
            lease: Mutex::new(()),
            progress,
        }
    }

    pub fn handle(&self) -> &ChainHandle {
        &self.handle
    }

    pub fn registry(&self) -> &SignatureRegistry {
        &self.registry
    }

    pub fn stats(&self) -> &Arc<IngestStats> {
        &self.stats
    }

    pub fn subscribe(&self) -> watch::Receiver<ChainProgress> {
        self.progress.subscribe()
    }

    pub fn progress(&self) -> ChainProgress {
        self.progress.borrow().clone()
    }

    fn set_phase(&self, phase: ChainPhase) {
        self.progress.send_modify(|p| p.phase = phase);
        tracing::debug!(chain = %self.handle.name, ?phase, "phase");
    }

    fn report(&self, phase: ChainPhase, error: Option<PipelineError>) -> ChainReport {
        let message = error.as_ref().map(|e| e.to_string());
        self.progress.send_modify(|p| {
            p.phase = phase;
            p.batch = None;
            p.error = message;
        });
        let progress = self.progress();
        match &error {
            Some(err) => tracing::error!(
                chain = %self.handle.name,
                checkpoint = ?progress.checkpoint,
                category = %err.category(),
                error = %err,
                "chain ingestion failed"
            ),
            None => tracing::info!(
                chain = %self.handle.name,
                ?phase,
                checkpoint = ?progress.checkpoint,
                "chain ingestion stopped"
            ),
        }
        ChainReport {
            chain: self.handle.name.clone(),
            chain_id: self.handle.chain_id,
            phase,
            checkpoint: progress.checkpoint,
            target: progress.target,
            error,
            stats: self.stats.snapshot(),
        }
    }

    /// Ingests from the checkpoint (or `start_block`) up to
    /// `head - confirmation_depth`, capped by `end_block`.
    ///
    /// Never returns an error: failures end in [`ChainPhase::Failed`] with
    /// the checkpoint left at the last committed batch.
    #[tracing::instrument(skip(self, cancel), fields(chain = %self.handle.name))]
    pub async fn backfill(&self, cancel: &CancellationToken) -> ChainReport {
        let Ok(_lease) = self.lease.try_lock() else {
            return self.busy_report();
        };
        match self.backfill_inner(cancel).await {
            Ok(phase) => self.report(phase, None),
            Err(err) if err.is_cancelled() => self.report(ChainPhase::Cancelled, None),
            Err(err) => self.report(ChainPhase::Failed, Some(err)),
        }
    }

    fn busy_report(&self) -> ChainReport {
        let err = PipelineError::ChainBusy {
            chain: self.handle.name.clone(),
        };
        tracing::error!(chain = %self.handle.name, error = %err, "refusing concurrent run");
        // The holder of the lease owns the published progress; leave it alone.
        ChainReport {
            chain: self.handle.name.clone(),
            chain_id: self.handle.chain_id,
            phase: ChainPhase::Failed,
            checkpoint: self.progress().checkpoint,
            target: None,
            error: Some(err),
            stats: self.stats.snapshot(),
        }
    }

    async fn backfill_inner(&self, cancel: &CancellationToken) -> Result<ChainPhase, PipelineError> {
        self.set_phase(ChainPhase::Planning);
        self.reader.verify_chain_id().await?;

        let checkpoint = self.checkpoints.get(self.handle.chain_id).await?;
        let head = self.reader.head().await?;
        let Some(confirmed) = self.handle.confirmed_head(head) else {
            tracing::info!(head, depth = self.handle.confirmation_depth, "chain shorter than confirmation depth");
            return Ok(ChainPhase::Done);
        };
        let target = self.settings.end_block.map_or(confirmed, |end| end.min(confirmed));
        let mut next = self.first_block(checkpoint);
        self.progress.send_modify(|p| {
            p.checkpoint = checkpoint;
            p.target = Some(target);
        });

        tracing::info!(
            chain = %self.handle.name,
            ?checkpoint,
            from = next,
            target,
            head,
            "backfill planned"
        );

        let mut width = self.settings.batch_width.max(1);
        let mut shrinks = 0u32;
        while next <= target {
            if cancel.is_cancelled() {
                return Ok(ChainPhase::Cancelled);
            }
            self.set_phase(ChainPhase::Planning);
            let end = next.saturating_add(width - 1).min(target);

            match self.run_batch(next, end, cancel).await {
                Ok(_) => {
                    next = end + 1;
                    width = self.settings.batch_width.max(1);
                    shrinks = 0;
                }
                Err(err) if err.is_shrinkable() => {
                    shrinks += 1;
                    if shrinks > self.settings.max_shrink_retries {
                        let PipelineError::Fetch(source) = err else {
                            return Err(err);
                        };
                        return Err(PipelineError::ShrinkExhausted {
                            start: next,
                            end,
                            shrinks: shrinks - 1,
                            source,
                        });
                    }
                    width = (width / 2).max(1);
                    bump(&self.stats.batch_shrinks, 1);
                    tracing::warn!(
                        chain = %self.handle.name,
                        start = next,
                        end,
                        new_width = width,
                        shrink = shrinks,
                        error = %err,
                        "batch failed, retrying with smaller width"
                    );
                    self.progress.send_modify(|p| p.width = width);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(ChainPhase::Done)
    }

    /// First block to ingest given the stored checkpoint.
    fn first_block(&self, checkpoint: Option<u64>) -> u64 {
        let start = self.settings.start_block.unwrap_or(0);
        match checkpoint {
            Some(cp) => (cp + 1).max(start),
            None => start,
        }
    }

    /// Fetches, writes and commits `[start, end]`.
    ///
    /// # Errors
    /// Any failure leaves the checkpoint where it was.
    #[tracing::instrument(skip(self, cancel), fields(chain = %self.handle.name))]
    pub async fn run_batch(
        &self,
        start: u64,
        end: u64,
        cancel: &CancellationToken,
    ) -> Result<BatchResult, PipelineError> {
        self.progress.send_modify(|p| {
            p.phase = ChainPhase::Fetching;
            p.batch = Some((start, end));
        });
        let bundles = self.reader.fetch_block_range(start, end, cancel).await?;

        self.set_phase(ChainPhase::Writing);
        let records = self.build_records(&bundles);
        let outcome = self.writer.write(records).await?;
        if let WriteOutcome::PartialFailure { failed, .. } = &outcome {
            tracing::warn!(
                chain = %self.handle.name,
                start,
                end,
                failed = failed.len(),
                "batch committed with isolated record failures"
            );
        }

        self.set_phase(ChainPhase::Advancing);
        self.checkpoints.advance(self.handle.chain_id, end).await?;
        bump(&self.stats.batches_committed, 1);
        self.progress.send_modify(|p| {
            p.checkpoint = Some(end);
            p.batch = None;
        });

        tracing::info!(
            chain = %self.handle.name,
            start,
            end,
            blocks = bundles.len(),
            written = outcome.written(),
            "batch committed"
        );
        Ok(BatchResult {
            start,
            end,
            outcome,
        })
    }

    /// Block, transaction and event records for a fetched range.
    pub fn build_records(&self, bundles: &[BlockBundle]) -> Vec<Record> {
        let mut records = Vec::new();
        for bundle in bundles {
            records.push(block_record(&bundle.block, &self.tags));
            records.extend(
                bundle
                    .transactions
                    .iter()
                    .filter_map(|tx| transaction_record(tx, bundle.block.timestamp, &self.tags)),
            );
            for event in self.classifier.classify_bundle(bundle, self.handle.chain_id) {
                records.extend(to_records(&event, &self.tags));
            }
        }
        records
    }

    /// Polls for new confirmed blocks and ingests them one block per batch
    /// until cancelled.
    #[tracing::instrument(skip(self, cancel), fields(chain = %self.handle.name))]
    pub async fn follow(&self, cancel: &CancellationToken) -> ChainReport {
        let Ok(_lease) = self.lease.try_lock() else {
            return self.busy_report();
        };
        match self.follow_inner(cancel).await {
            Ok(()) => self.report(ChainPhase::Cancelled, None),
            Err(err) if err.is_cancelled() => self.report(ChainPhase::Cancelled, None),
            Err(err) => self.report(ChainPhase::Failed, Some(err)),
        }
    }

    async fn follow_inner(&self, cancel: &CancellationToken) -> Result<(), PipelineError> {
        self.set_phase(ChainPhase::Planning);
        self.reader.verify_chain_id().await?;

        let checkpoint = self.checkpoints.get(self.handle.chain_id).await?;
        let mut next = match (checkpoint, self.settings.start_block) {
            (Some(_), _) | (None, Some(_)) => self.first_block(checkpoint),
            (None, None) => {
                let head = self.reader.head().await?;
                self.handle.confirmed_head(head).unwrap_or(0)
            }
        };
        self.progress.send_modify(|p| p.checkpoint = checkpoint);
        tracing::info!(chain = %self.handle.name, from = next, "real-time polling started");

        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            self.set_phase(ChainPhase::Following);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            let head = match self.reader.head().await {
                Ok(head) => head,
                Err(err) if err.is_retryable() => {
                    tracing::warn!(chain = %self.handle.name, error = %err, "head poll failed");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            let Some(confirmed) = self.handle.confirmed_head(head) else {
                continue;
            };
            self.progress.send_modify(|p| p.target = Some(confirmed));

            while next <= confirmed {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                match self.run_batch(next, next, cancel).await {
                    Ok(_) => next += 1,
                    Err(err) if err.is_shrinkable() => {
                        tracing::warn!(
                            chain = %self.handle.name,
                            block = next,
                            error = %err,
                            "block fetch failed, retrying on next poll"
                        );
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
    }

    /// Fetches and classifies one block without writing anything.
    ///
    /// # Errors
    /// Fetch failures.
    pub async fn inspect_block(
        &self,
        number: u64,
    ) -> Result<(BlockBundle, Vec<DomainEvent>), PipelineError> {
        let bundle = self.reader.fetch_block(number).await?;
        let events = Classifier::new(self.registry.clone())
            .classify_bundle(&bundle, self.handle.chain_id);
        Ok((bundle, events))
    }

    /// Latest block number, for status displays.
    ///
    /// # Errors
    /// Fetch failures.
    pub async fn head(&self) -> Result<u64, FetchError> {
        self.reader.head().await
    }
}
