//! Record Mapper: domain events, blocks and transactions to flat records.
//!
//! Mapping is pure. Unrecognized events map to nothing; the classifier has
//! already counted them.

use alloy::primitives::{Address, U256};
use ingest_data::{Block, ChainHandle, NaturalKey, Record, Transaction, TxStatus};
use ingest_decode::{
    DexSwap, DomainEvent, EventData, LendingEvent, LiquidityChange, StakingEvent,
    TokenTransfer, YieldEvent,
};

pub const BLOCKS: &str = "blocks";
pub const TRANSACTIONS: &str = "transactions";
pub const TOKEN_TRANSFERS: &str = "token_transfers";
pub const DEX_SWAPS: &str = "dex_swaps";
pub const DEX_LIQUIDITY: &str = "dex_liquidity";
pub const POOL_LIQUIDITY: &str = "pool_liquidity";
pub const LENDING_EVENTS: &str = "lending_events";
pub const STAKING_EVENTS: &str = "staking_events";
pub const YIELD_EVENTS: &str = "yield_events";

/// Tags stamped on every record of one chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTags {
    pub chain_id: u64,
    pub chain_name: String,
    pub network: String,
}

impl From<&ChainHandle> for ChainTags {
    fn from(handle: &ChainHandle) -> Self {
        Self {
            chain_id: handle.chain_id,
            chain_name: handle.name.clone(),
            network: handle.network.clone(),
        }
    }
}

impl ChainTags {
    fn apply(&self, record: Record) -> Record {
        record
            .tag("chain_id", self.chain_id.to_string())
            .tag("chain_name", self.chain_name.as_str())
            .tag("network", self.network.as_str())
    }
}

fn hex(addr: Address) -> String {
    format!("{addr:#x}")
}

pub fn block_record(block: &Block, chain: &ChainTags) -> Record {
    let utilization = if block.gas_limit > 0 {
        block.gas_used as f64 / block.gas_limit as f64
    } else {
        0.0
    };
    chain
        .apply(Record::new(
            BLOCKS,
            NaturalKey::block(chain.chain_id, block.number),
            block.timestamp,
        ))
        .tag("block_number", block.number.to_string())
        .tag("miner", hex(block.miner))
        .field("block_hash", format!("{:#x}", block.hash))
        .field("gas_used", block.gas_used)
        .field("gas_limit", block.gas_limit)
        .field("gas_utilization", utilization)
        .field("transaction_count", block.transaction_count)
        .field_opt("base_fee_per_gas", block.base_fee_per_gas)
}

/// Pending transactions have no receipt data and are skipped.
pub fn transaction_record(tx: &Transaction, timestamp: u64, chain: &ChainTags) -> Option<Record> {
    if tx.status == TxStatus::Pending {
        return None;
    }
    let tx_type = match tx.to {
        None => "contract_creation",
        Some(_) if tx.input_size == 0 => "transfer",
        Some(_) => "contract_call",
    };
    let record = chain
        .apply(Record::new(
            TRANSACTIONS,
            NaturalKey::transaction(chain.chain_id, tx.block_number, tx.hash),
            timestamp,
        ))
        .tag("tx_type", tx_type)
        .tag("status", tx.status.as_str())
        .tag("from_address", hex(tx.from))
        .tag("to_address", tx.to.map(hex).unwrap_or_default())
        .tag("tx_hash", format!("{:#x}", tx.hash))
        .field("block_number", tx.block_number)
        .field("tx_index", tx.index)
        .field("value", tx.value)
        .field("gas_limit", tx.gas_limit)
        .field_opt("gas_used", tx.gas_used)
        .field_opt("gas_price", tx.gas_price)
        .field_opt("effective_gas_price", tx.effective_gas_price)
        .field_opt("fee", tx.fee())
        .field("input_size", tx.input_size as u64);
    Some(record)
}

/// Maps one event to zero or more records.
pub fn to_records(event: &DomainEvent, chain: &ChainTags) -> Vec<Record> {
    let base = |measurement: &str| -> Record {
        let p = &event.provenance;
        let record = chain
            .apply(Record::new(
                measurement,
                NaturalKey::log(chain.chain_id, p.block_number, p.tx_hash, p.log_index),
                p.timestamp,
            ))
            .tag("event", event.name().unwrap_or_default())
            .tag("protocol", event.protocol().unwrap_or_default())
            .tag("tx_hash", format!("{:#x}", p.tx_hash))
            .tag("log_index", p.log_index.to_string())
            .field("block_number", p.block_number);
        match p.tx_from {
            Some(from) => record.field("tx_from", hex(from)),
            None => record,
        }
    };

    match &event.data {
        EventData::TokenTransfer(t) => transfer_records(t, base(TOKEN_TRANSFERS)),
        EventData::DexSwap(s) => vec![swap_record(s, base(DEX_SWAPS))],
        EventData::LiquidityChange(l) => liquidity_records(l, base),
        EventData::Lending(l) => vec![lending_record(l, base(LENDING_EVENTS))],
        EventData::Staking(s) => vec![staking_record(s, base(STAKING_EVENTS))],
        EventData::Yield(y) => vec![yield_record(y, base(YIELD_EVENTS))],
        EventData::Unrecognized { .. } => Vec::new(),
    }
}

fn transfer_records(t: &TokenTransfer, base: Record) -> Vec<Record> {
    let base = base
        .tag("token_standard", t.standard.as_str())
        .tag("token_address", hex(t.token))
        .tag("from_address", hex(t.from))
        .tag("to_address", hex(t.to));
    let base = match t.operator {
        Some(op) => base.field("operator", hex(op)),
        None => base,
    };

    if t.batch.is_empty() {
        return vec![base
            .field("amount", t.amount)
            .field_opt("token_id", t.token_id)];
    }

    t.batch
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let mut record = base
                .clone()
                .tag("batch_index", i.to_string())
                .field("amount", item.amount)
                .field("token_id", item.id);
            record.key = record.key.with_sub_index(i as u32);
            record
        })
        .collect()
}

fn swap_record(s: &DexSwap, base: Record) -> Record {
    base.tag("pool_address", hex(s.pool))
        .tag("direction", if s.zero_for_one { "token0_to_token1" } else { "token1_to_token0" })
        .field("sender", hex(s.sender))
        .field("recipient", hex(s.recipient))
        .field("amount_in", s.amount_in)
        .field("amount_out", s.amount_out)
        .field_opt("sqrt_price_x96", s.sqrt_price_x96)
        .field_opt("liquidity", s.liquidity)
        .field_opt("tick", s.tick.map(i64::from))
}

/// Provider activity plus the matching pool-state delta.
fn liquidity_records(l: &LiquidityChange, base: impl Fn(&str) -> Record) -> Vec<Record> {
    let ticks = |record: Record| {
        record
            .field_opt("tick_lower", l.tick_lower.map(i64::from))
            .field_opt("tick_upper", l.tick_upper.map(i64::from))
    };

    let activity = base(DEX_LIQUIDITY)
        .tag("pool_address", hex(l.pool))
        .tag("action", l.action.as_str())
        .tag("provider", hex(l.provider))
        .field("amount0", l.amount0)
        .field("amount1", l.amount1)
        .field_opt("liquidity", l.liquidity);
    let activity = match l.recipient {
        Some(r) => activity.field("recipient", hex(r)),
        None => activity,
    };

    let pool = base(POOL_LIQUIDITY)
        .tag("pool_address", hex(l.pool))
        .tag("action", l.action.as_str())
        .field("amount0_delta", l.amount0)
        .field("amount1_delta", l.amount1)
        .field_opt("liquidity_delta", l.liquidity);

    vec![ticks(activity), ticks(pool)]
}

fn lending_record(l: &LendingEvent, base: Record) -> Record {
    let record = base
        .tag("market_address", hex(l.market))
        .tag("action", l.action.as_str())
        .tag("user_address", hex(l.user))
        .tag("asset_address", l.asset.map(hex).unwrap_or_default())
        .field("amount", l.amount);
    record.field_opt::<U256>("borrow_rate", l.borrow_rate)
}

fn staking_record(s: &StakingEvent, base: Record) -> Record {
    base.tag("contract_address", hex(s.contract))
        .tag("action", s.action.as_str())
        .tag("staker", hex(s.staker))
        .field("amount", s.amount)
}

fn yield_record(y: &YieldEvent, base: Record) -> Record {
    base.tag("farm_address", hex(y.farm))
        .tag("action", y.action.as_str())
        .tag("farmer", hex(y.farmer))
        .tag("pool_id", y.pool_id.map(|id| id.to_string()).unwrap_or_default())
        .field("amount", y.amount)
}
