//! Typed domain events produced by the classifier.

use alloy::primitives::{Address, B256, U256};
use ingest_data::EventCounter;
use std::fmt;
use std::sync::Arc;

/// Why a decoder rejected a log. Never escapes [`crate::Classifier::classify`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("missing topic {0}")]
    MissingTopic(usize),
    #[error("data too short: need {need} bytes, have {have}")]
    ShortData { need: usize, have: usize },
    #[error("non-canonical {0} encoding")]
    DirtyPadding(&'static str),
    #[error("abi decode failed: {0}")]
    Abi(String),
    #[error("inconsistent payload: {0}")]
    Inconsistent(String),
}

/// Where an event came from. Unique per (chain, block, tx, log index).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    pub chain_id: u64,
    pub block_number: u64,
    pub tx_hash: B256,
    pub tx_index: u64,
    pub log_index: u64,
    /// Block timestamp, unix seconds
    pub timestamp: u64,
    /// Emitting contract
    pub contract: Address,
    /// Sender of the enclosing transaction
    pub tx_from: Option<Address>,
}

/// Name and protocol of the signature that matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureLabel {
    pub name: String,
    pub protocol: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TokenTransfer,
    DexSwap,
    LiquidityChange,
    Lending,
    Staking,
    Yield,
    Unrecognized,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TokenTransfer => "token_transfer",
            EventKind::DexSwap => "dex_swap",
            EventKind::LiquidityChange => "liquidity_change",
            EventKind::Lending => "lending",
            EventKind::Staking => "staking",
            EventKind::Yield => "yield",
            EventKind::Unrecognized => "unrecognized",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<EventKind> for EventCounter {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::TokenTransfer => EventCounter::TokenTransfer,
            EventKind::DexSwap => EventCounter::DexSwap,
            EventKind::LiquidityChange => EventCounter::LiquidityChange,
            EventKind::Lending => EventCounter::Lending,
            EventKind::Staking => EventCounter::Staking,
            EventKind::Yield => EventCounter::Yield,
            EventKind::Unrecognized => EventCounter::Unrecognized,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStandard {
    Erc20,
    Erc721,
    Erc1155,
}

impl TokenStandard {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenStandard::Erc20 => "erc20",
            TokenStandard::Erc721 => "erc721",
            TokenStandard::Erc1155 => "erc1155",
        }
    }
}

/// One (id, amount) pair of an ERC-1155 batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenAmount {
    pub id: U256,
    pub amount: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenTransfer {
    pub standard: TokenStandard,
    pub token: Address,
    pub operator: Option<Address>,
    pub from: Address,
    pub to: Address,
    /// Fungible amount; 1 for ERC-721; the sum for ERC-1155 batches
    pub amount: U256,
    pub token_id: Option<U256>,
    /// Non-empty only for ERC-1155 batch transfers
    pub batch: Vec<TokenAmount>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DexSwap {
    pub pool: Address,
    pub sender: Address,
    pub recipient: Address,
    /// Token0 was sold for token1
    pub zero_for_one: bool,
    pub amount_in: U256,
    pub amount_out: U256,
    pub sqrt_price_x96: Option<U256>,
    pub liquidity: Option<U256>,
    pub tick: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiquidityAction {
    Add,
    Remove,
}

impl LiquidityAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LiquidityAction::Add => "mint",
            LiquidityAction::Remove => "burn",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiquidityChange {
    pub pool: Address,
    pub action: LiquidityAction,
    pub provider: Address,
    /// Receiver of withdrawn tokens on burns
    pub recipient: Option<Address>,
    pub amount0: U256,
    pub amount1: U256,
    pub liquidity: Option<U256>,
    pub tick_lower: Option<i32>,
    pub tick_upper: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LendingAction {
    Deposit,
    Withdraw,
    Borrow,
    Repay,
}

impl LendingAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LendingAction::Deposit => "deposit",
            LendingAction::Withdraw => "withdraw",
            LendingAction::Borrow => "borrow",
            LendingAction::Repay => "repay",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LendingEvent {
    pub market: Address,
    pub action: LendingAction,
    /// Account whose position changed
    pub user: Address,
    /// Underlying reserve, when the event names it
    pub asset: Option<Address>,
    pub amount: U256,
    pub borrow_rate: Option<U256>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StakingAction {
    Stake,
    Unstake,
    Reward,
}

impl StakingAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            StakingAction::Stake => "stake",
            StakingAction::Unstake => "unstake",
            StakingAction::Reward => "reward",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StakingEvent {
    pub contract: Address,
    pub action: StakingAction,
    pub staker: Address,
    pub amount: U256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YieldAction {
    Deposit,
    Withdraw,
    Harvest,
}

impl YieldAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            YieldAction::Deposit => "deposit",
            YieldAction::Withdraw => "withdraw",
            YieldAction::Harvest => "harvest",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YieldEvent {
    pub farm: Address,
    pub action: YieldAction,
    pub farmer: Address,
    pub pool_id: Option<U256>,
    pub amount: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnrecognizedReason {
    NoTopics,
    UnknownSignature,
    ShapeMismatch { topics: usize, data_len: usize },
    DecodeFailed(DecodeError),
}

impl fmt::Display for UnrecognizedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnrecognizedReason::NoTopics => f.write_str("log has no topics"),
            UnrecognizedReason::UnknownSignature => f.write_str("unknown topic0"),
            UnrecognizedReason::ShapeMismatch { topics, data_len } => {
                write!(f, "no candidate matches {topics} topics / {data_len} data bytes")
            }
            UnrecognizedReason::DecodeFailed(err) => write!(f, "decode failed: {err}"),
        }
    }
}

/// Kind-specific payload of a [`DomainEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventData {
    TokenTransfer(TokenTransfer),
    DexSwap(DexSwap),
    LiquidityChange(LiquidityChange),
    Lending(LendingEvent),
    Staking(StakingEvent),
    Yield(YieldEvent),
    Unrecognized {
        topic0: Option<B256>,
        reason: UnrecognizedReason,
    },
}

impl EventData {
    pub fn kind(&self) -> EventKind {
        match self {
            EventData::TokenTransfer(_) => EventKind::TokenTransfer,
            EventData::DexSwap(_) => EventKind::DexSwap,
            EventData::LiquidityChange(_) => EventKind::LiquidityChange,
            EventData::Lending(_) => EventKind::Lending,
            EventData::Staking(_) => EventKind::Staking,
            EventData::Yield(_) => EventKind::Yield,
            EventData::Unrecognized { .. } => EventKind::Unrecognized,
        }
    }
}

/// A classified log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainEvent {
    pub provenance: Provenance,
    /// The matched signature; `None` for unrecognized logs
    pub signature: Option<Arc<SignatureLabel>>,
    pub data: EventData,
}

impl DomainEvent {
    pub fn kind(&self) -> EventKind {
        self.data.kind()
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self.data, EventData::Unrecognized { .. })
    }

    pub fn protocol(&self) -> Option<&str> {
        self.signature.as_deref().map(|s| s.protocol.as_str())
    }

    pub fn name(&self) -> Option<&str> {
        self.signature.as_deref().map(|s| s.name.as_str())
    }
}
