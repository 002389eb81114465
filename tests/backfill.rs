//! End-to-end backfill against a scripted node and a SQLite store.

mod common;

use alloy::primitives::U256;
use common::{
    erc20_transfer, reopen, settings, sqlite_pipeline, temp_store, unknown_event, v2_swap,
};
use ingest_data::mock::{Script, ScriptedRpc};
use ingest_data::{CheckpointStore, FieldValue, Store};
use ingest_pipeline::{build_pipelines, parse_config, ChainPhase, ConfigFormat};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn count(store: &Store, measurement: &str) -> usize {
    store
        .query_records(measurement, 1)
        .expect("query should succeed")
        .len()
}

#[tokio::test]
async fn token_amount_keeps_full_precision_through_sqlite() {
    let (_dir, store) = temp_store();
    let rpc = Arc::new(ScriptedRpc::with_blocks(1, 0..=20));
    let amount = U256::from_str_radix("28019014209000000000000", 10).expect("decimal literal");
    rpc.push_log(erc20_transfer(7, 0, amount));

    let pipeline = sqlite_pipeline(1, rpc, store.clone(), settings(8));
    let report = pipeline.backfill(&CancellationToken::new()).await;
    assert_eq!(report.phase, ChainPhase::Done, "error: {:?}", report.error);

    let transfers = store
        .query_records("token_transfers", 1)
        .expect("query should succeed");
    assert_eq!(transfers.len(), 1);
    let transfer = &transfers[0];
    assert_eq!(transfer.key.block_number, 7);
    assert_eq!(transfer.key.log_index, Some(0));
    assert_eq!(transfer.tags["protocol"], "erc20");
    assert_eq!(transfer.fields["amount"], FieldValue::Unsigned(amount));
    assert_eq!(transfer.fields["amount"].to_string(), "28019014209000000000000");
}

#[tokio::test]
async fn every_block_and_transaction_is_stored_once() {
    let (_dir, store) = temp_store();
    let rpc = Arc::new(ScriptedRpc::with_blocks(1, 0..=30));

    let pipeline = sqlite_pipeline(1, rpc, store.clone(), settings(7));
    let report = pipeline.backfill(&CancellationToken::new()).await;

    assert_eq!(report.phase, ChainPhase::Done);
    assert_eq!(report.checkpoint, Some(30));
    assert_eq!(count(&store, "blocks"), 31);
    assert_eq!(count(&store, "transactions"), 31);

    let rows = store.checkpoints().expect("checkpoints should be readable");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].chain_id, 1);
    assert_eq!(rows[0].block_number, 30);
}

#[tokio::test]
async fn replaying_a_range_is_idempotent() {
    let (_dir, store) = temp_store();
    let rpc = Arc::new(ScriptedRpc::with_blocks(1, 0..=12));
    rpc.push_log(erc20_transfer(4, 0, U256::from(10)));
    rpc.push_log(v2_swap(9, 2, 5_000, 1_234));

    let first = sqlite_pipeline(1, rpc.clone(), store.clone(), settings(5));
    assert_eq!(first.backfill(&CancellationToken::new()).await.phase, ChainPhase::Done);
    let before = store.record_counts(1).expect("counts should be readable");

    // Operator reset: the same range is written again
    assert!(store.reset_checkpoint(1).expect("reset should succeed"));
    let second = sqlite_pipeline(1, rpc, store.clone(), settings(5));
    let report = second.backfill(&CancellationToken::new()).await;
    assert_eq!(report.phase, ChainPhase::Done);
    assert!(report.stats.records_written > 0);

    let after = store.record_counts(1).expect("counts should be readable");
    assert_eq!(before, after);
}

#[tokio::test]
async fn failed_run_resumes_after_restart_without_gaps() {
    let (dir, store) = temp_store();
    let rpc = Arc::new(ScriptedRpc::with_blocks(1, 0..=40));
    rpc.script(25, Script::FailTransient(100));

    let pipeline = sqlite_pipeline(1, rpc.clone(), store.clone(), settings(10));
    let report = pipeline.backfill(&CancellationToken::new()).await;
    assert_eq!(report.phase, ChainPhase::Failed);
    assert!(report.error.is_some());
    assert_eq!(store.get(1).await.expect("get"), Some(24));
    drop(pipeline);
    drop(store);

    // Node recovers, process restarts on the same database
    rpc.clear_script(25);
    let store = reopen(&dir);
    let pipeline = sqlite_pipeline(1, rpc, store.clone(), settings(10));
    let report = pipeline.backfill(&CancellationToken::new()).await;

    assert_eq!(report.phase, ChainPhase::Done);
    assert_eq!(store.get(1).await.expect("get"), Some(40));
    let blocks = store.query_records("blocks", 1).expect("query should succeed");
    let numbers: Vec<u64> = blocks.iter().map(|r| r.key.block_number).collect();
    assert_eq!(numbers, (0..=40).collect::<Vec<_>>());
}

#[tokio::test]
async fn unrecognized_events_are_dropped_and_counted() {
    let (_dir, store) = temp_store();
    let rpc = Arc::new(ScriptedRpc::with_blocks(1, 0..=5));
    rpc.push_log(unknown_event(3, 0));
    rpc.push_log(erc20_transfer(3, 1, U256::from(77)));
    rpc.push_log(v2_swap(4, 0, 5_000, 1_234));

    let pipeline = sqlite_pipeline(1, rpc, store.clone(), settings(10));
    let report = pipeline.backfill(&CancellationToken::new()).await;

    assert_eq!(report.phase, ChainPhase::Done);
    assert_eq!(report.stats.logs, 3);
    assert_eq!(report.stats.unrecognized_dropped, 1);
    assert_eq!(report.stats.token_transfers, 1);
    assert_eq!(report.stats.dex_swaps, 1);

    let swaps = store.query_records("dex_swaps", 1).expect("query should succeed");
    assert_eq!(swaps.len(), 1);
    assert_eq!(swaps[0].fields["amount_in"], FieldValue::Unsigned(U256::from(5_000)));
    assert_eq!(swaps[0].fields["amount_out"], FieldValue::Unsigned(U256::from(1_234)));

    // 6 blocks, 6 transactions, 1 transfer, 1 swap and nothing for the unknown log
    let total: u64 = store
        .record_counts(1)
        .expect("counts should be readable")
        .iter()
        .map(|(_, n)| n)
        .sum();
    assert_eq!(total, 14);
}

#[tokio::test]
async fn config_selects_enabled_chains() {
    let yaml = r#"
chains:
  - name: ethereum
    chain_id: 1
    rpc_url: "http://127.0.0.1:8545"
  - name: polygon
    chain_id: 137
    rpc_url: "http://127.0.0.1:8546"
    batch_width: 100
  - name: goerli
    chain_id: 5
    rpc_url: "http://127.0.0.1:8547"
    enabled: false
"#;
    let config = parse_config(yaml, ConfigFormat::Yaml, "inline").expect("config should parse");
    config.validate().expect("config should be valid");

    let chains = config.select_chains(&[]).expect("selection should succeed");
    let names: Vec<&str> = chains.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, ["ethereum", "polygon"]);

    let (_dir, store) = temp_store();
    let registry = Arc::new(config.registry().expect("registry should build"));
    let pipelines = build_pipelines(&config, &chains, store.clone(), store, registry)
        .expect("pipelines should build");
    assert_eq!(pipelines.len(), 2);
    assert_eq!(pipelines[1].handle().chain_id, 137);

    assert!(config.select_chains(&["arbitrum".to_string()]).is_err());
}
