use clap::{ArgAction, Args, Parser, Subcommand};
use color_eyre::eyre::{eyre, Context, Result};
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use indicatif::{ProgressBar, ProgressStyle};
use ingest_data::{AlloyRpc, ChainRpc, CheckpointStore, RpcError, Store};
use ingest_decode::DomainEvent;
use ingest_pipeline::{
    build_pipelines, load_config, open_sink, ChainPhase, ChainProgress, ChainReport,
    IngestConfig, Orchestrator, RunMode,
};
use ingest_sink::{to_records, ChainTags};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "evm-ingest")]
#[command(about = "Multi-chain EVM block and event ingestion")]
#[command(version)]
struct Cli {
    #[arg(long, short = 'v', action = ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(long, short = 'q', global = true)]
    quiet: bool,

    /// YAML or JSON configuration file.
    #[arg(long, short = 'c', global = true, env = "EVM_INGEST_CONFIG", default_value = "ingest.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Catch every selected chain up to its confirmed head, then exit.
    Backfill(ChainArgs),
    /// Backfill, then keep following new blocks until Ctrl-C.
    Run(ChainArgs),
    /// Follow new blocks only.
    Follow(ChainArgs),
    /// Show checkpoints, head lag and stored record counts.
    Status(StatusArgs),
    /// Delete a chain's checkpoint so the next backfill starts over.
    Reset(ResetArgs),
    /// Fetch and classify a single block without writing anything.
    Inspect(InspectArgs),
    /// List the event signatures the classifier recognizes.
    Signatures,
}

#[derive(Args, Debug)]
struct ChainArgs {
    /// Chain name from the config; repeatable. Defaults to every enabled chain.
    #[arg(long)]
    chain: Vec<String>,
}

#[derive(Args, Debug)]
struct StatusArgs {
    /// Skip querying each node for its head and lag.
    #[arg(long)]
    offline: bool,
}

#[derive(Args, Debug)]
struct ResetArgs {
    #[arg(long)]
    chain: String,
}

#[derive(Args, Debug)]
struct InspectArgs {
    #[arg(long)]
    chain: String,

    #[arg(long)]
    block: u64,

    /// Output format: table (default) or json.
    #[arg(long, default_value = "table")]
    output: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet)?;

    let config = read_config(&cli.config)?;

    match cli.command {
        Commands::Backfill(args) => handle_ingest(&config, args, RunMode::Backfill).await,
        Commands::Run(args) => handle_ingest(&config, args, RunMode::BackfillThenFollow).await,
        Commands::Follow(args) => handle_ingest(&config, args, RunMode::Follow).await,
        Commands::Status(args) => handle_status(&config, args).await,
        Commands::Reset(args) => handle_reset(&config, args),
        Commands::Inspect(args) => handle_inspect(&config, args).await,
        Commands::Signatures => handle_signatures(&config),
    }
}

fn init_tracing(verbose: u8, quiet: bool) -> Result<()> {
    let level = if quiet {
        Level::WARN
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.as_str()))
        .wrap_err("failed to initialize tracing filter")?;

    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

fn read_config(path: &Path) -> Result<IngestConfig> {
    load_config(path).wrap_err_with(|| format!("failed to load config {}", path.display()))
}

fn open_store(config: &IngestConfig) -> Result<Arc<Store>> {
    let path = Path::new(&config.store.path);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .wrap_err_with(|| format!("failed to create directory {}", parent.display()))?;
    }
    let store = Store::new(&config.store.path).wrap_err("failed to open SQLite store")?;
    Ok(Arc::new(store))
}

async fn handle_ingest(config: &IngestConfig, args: ChainArgs, mode: RunMode) -> Result<()> {
    let chains = config.select_chains(&args.chain)?;
    let store = open_store(config)?;
    let sink = open_sink(config, store.clone()).wrap_err("failed to open sink")?;
    let registry = Arc::new(config.registry()?);
    let checkpoints: Arc<dyn CheckpointStore> = store;

    let pipelines = build_pipelines(config, &chains, sink, checkpoints, registry)
        .wrap_err("failed to connect to chains")?;
    let orchestrator = Orchestrator::new(pipelines);

    let cancel = orchestrator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping at the next batch boundary");
            cancel.cancel();
        }
    });

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} {msg}")
            .wrap_err("failed to create progress style")?,
    );
    pb.set_message("starting ingestion");
    pb.enable_steady_tick(Duration::from_millis(100));

    let receivers = orchestrator.subscribe();
    let run = orchestrator.run(mode);
    tokio::pin!(run);
    let mut tick = tokio::time::interval(Duration::from_millis(250));
    let reports = loop {
        tokio::select! {
            reports = &mut run => break reports,
            _ = tick.tick() => pb.set_message(progress_line(&receivers)),
        }
    };
    pb.finish_and_clear();

    print_reports(&reports);

    let failed: Vec<&ChainReport> = reports
        .iter()
        .filter(|r| r.phase == ChainPhase::Failed)
        .collect();
    if !failed.is_empty() {
        for report in &failed {
            if let Some(err) = &report.error {
                warn!(chain = %report.chain, category = %err.category(), error = %err, "chain failed");
            }
        }
        return Err(eyre!("{} of {} chains failed", failed.len(), reports.len()));
    }
    Ok(())
}

fn progress_line(receivers: &[watch::Receiver<ChainProgress>]) -> String {
    receivers
        .iter()
        .map(|rx| {
            let p = rx.borrow();
            let at = p
                .checkpoint
                .map_or_else(|| "-".to_string(), |c| c.to_string());
            match p.target {
                Some(target) => format!("{} {:?} {}/{}", p.chain, p.phase, at, target),
                None => format!("{} {:?} {}", p.chain, p.phase, at),
            }
        })
        .collect::<Vec<_>>()
        .join(" | ")
}

fn print_reports(reports: &[ChainReport]) {
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec![
        "Chain",
        "Phase",
        "Checkpoint",
        "Blocks",
        "Events",
        "Dropped",
        "Written",
        "Failed",
        "Retries",
        "Blocks/s",
    ]);

    for report in reports {
        let s = &report.stats;
        table.add_row(vec![
            format!("{} ({})", report.chain, report.chain_id),
            format!("{:?}", report.phase),
            report
                .checkpoint
                .map_or_else(|| "-".to_string(), |c| c.to_string()),
            s.blocks.to_string(),
            s.recognized_events().to_string(),
            s.unrecognized_dropped.to_string(),
            s.records_written.to_string(),
            s.records_failed.to_string(),
            format!("{}/{}", s.rpc_retries, s.write_retries),
            format!("{:.1}", s.blocks_per_second),
        ]);
    }

    println!("{table}");
}

async fn handle_status(config: &IngestConfig, args: StatusArgs) -> Result<()> {
    let store = open_store(config)?;
    let rows = store.checkpoints().wrap_err("failed to read checkpoints")?;

    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    let mut header = vec!["Chain", "Chain ID", "Enabled", "Checkpoint", "Updated (UTC)", "Records"];
    if !args.offline {
        header.extend(["Head", "Lag"]);
    }
    table.set_header(header);

    for chain in &config.chains {
        let row = rows.iter().find(|r| r.chain_id == chain.chain_id);
        let records: u64 = store
            .record_counts(chain.chain_id)
            .wrap_err("failed to count records")?
            .iter()
            .map(|(_, count)| count)
            .sum();

        let mut cells = vec![
            chain.name.clone(),
            chain.chain_id.to_string(),
            chain.enabled.to_string(),
            row.map_or_else(|| "-".to_string(), |r| r.block_number.to_string()),
            row.map_or_else(|| "-".to_string(), |r| r.updated_at.clone()),
            records.to_string(),
        ];

        if !args.offline {
            let timeout = Duration::from_millis(chain.request_timeout_ms);
            let head = match AlloyRpc::new(&chain.rpc_url) {
                Ok(rpc) => query_head(&rpc, timeout).await.map_err(|e| {
                    warn!(chain = %chain.name, error = %e, "head query failed");
                }),
                Err(e) => {
                    warn!(chain = %chain.name, error = %e, "invalid rpc url");
                    Err(())
                }
            };
            match head {
                Ok(head) => {
                    let lag = row.map_or(head, |r| head.saturating_sub(r.block_number));
                    cells.push(head.to_string());
                    cells.push(lag.to_string());
                }
                Err(()) => {
                    cells.push("N/A".to_string());
                    cells.push("N/A".to_string());
                }
            }
        }
        table.add_row(cells);
    }

    println!("{table}");
    Ok(())
}

/// Node head for `status`, bounded by the chain's request timeout.
async fn query_head(rpc: &dyn ChainRpc, timeout: Duration) -> Result<u64, RpcError> {
    match tokio::time::timeout(timeout, rpc.head()).await {
        Ok(result) => result,
        Err(_) => Err(RpcError::Timeout(timeout)),
    }
}

fn handle_reset(config: &IngestConfig, args: ResetArgs) -> Result<()> {
    let chain = config
        .chain(&args.chain)
        .ok_or_else(|| eyre!("unknown chain {}", args.chain))?;
    let store = open_store(config)?;

    let removed = store
        .reset_checkpoint(chain.chain_id)
        .wrap_err("failed to reset checkpoint")?;
    if removed {
        info!(chain = %chain.name, chain_id = chain.chain_id, "checkpoint removed");
    } else {
        info!(chain = %chain.name, chain_id = chain.chain_id, "no checkpoint stored");
    }
    Ok(())
}

async fn handle_inspect(config: &IngestConfig, args: InspectArgs) -> Result<()> {
    let chain = config
        .chain(&args.chain)
        .ok_or_else(|| eyre!("unknown chain {}", args.chain))?;
    let store = open_store(config)?;
    let registry = Arc::new(config.registry()?);
    let pipeline = build_pipelines(config, &[chain], store.clone(), store, registry)
        .wrap_err("failed to connect to chain")?
        .pop()
        .ok_or_else(|| eyre!("no pipeline built for {}", chain.name))?;

    let (bundle, events) = pipeline
        .inspect_block(args.block)
        .await
        .wrap_err_with(|| format!("failed to fetch block {}", args.block))?;

    match args.output.as_str() {
        "json" => {
            let tags = ChainTags::from(pipeline.handle());
            let records: Vec<_> = events
                .iter()
                .flat_map(|event| to_records(event, &tags))
                .collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&records).wrap_err("failed to serialize records")?
            );
        }
        "table" => {
            let time = chrono::DateTime::from_timestamp(bundle.block.timestamp as i64, 0)
                .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "N/A".to_string());
            println!(
                "block {} ({}) {} txs, {} logs, {}",
                bundle.block.number,
                bundle.block.hash,
                bundle.transactions.len(),
                bundle.logs.len(),
                time
            );
            println!("{}", events_table(&events));
        }
        other => return Err(eyre!("unknown output format '{}'; use 'table' or 'json'", other)),
    }
    Ok(())
}

fn events_table(events: &[DomainEvent]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Log", "Tx", "Contract", "Protocol", "Event", "Kind"]);
    for event in events {
        let p = &event.provenance;
        table.add_row(vec![
            p.log_index.to_string(),
            format!("{:#x}", p.tx_hash),
            format!("{:#x}", p.contract),
            event.protocol().unwrap_or("-").to_string(),
            event.name().unwrap_or("-").to_string(),
            event.kind().to_string(),
        ]);
    }
    table
}

fn handle_signatures(config: &IngestConfig) -> Result<()> {
    let registry = config.registry()?;

    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Protocol", "Event", "Topic0", "Topics", "Data", "Decoder"]);
    for sig in registry.iter() {
        table.add_row(vec![
            sig.label.protocol.clone(),
            sig.label.name.clone(),
            format!("{:#x}", sig.topic0),
            sig.shape.topics.to_string(),
            format!("{:?}", sig.shape.data),
            format!("{:?}", sig.decoder),
        ]);
    }

    println!("{table}");
    info!(signatures = registry.len(), "registry loaded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_data::mock::ScriptedRpc;

    #[tokio::test]
    async fn head_query_answers_within_timeout() {
        let rpc = ScriptedRpc::with_blocks(1, 0..=42);
        let head = query_head(&rpc, Duration::from_secs(1))
            .await
            .expect("head should be reported");
        assert_eq!(head, 42);
    }

    #[tokio::test]
    async fn unresponsive_node_times_out() {
        let rpc = ScriptedRpc::with_blocks(1, 0..=42);
        rpc.set_latency(Duration::from_secs(3600));

        let err = query_head(&rpc, Duration::from_millis(50))
            .await
            .expect_err("slow head query should time out");
        assert!(matches!(err, RpcError::Timeout(t) if t == Duration::from_millis(50)));
    }
}
