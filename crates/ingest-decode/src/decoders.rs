//! Builtin decoders and their default signatures.
//!
//! A [`DecoderKind`] names a decoding routine. Builtin registrations pair each
//! kind with its canonical topic0 and shape; configuration can reuse a kind
//! under a different topic0 or shape.

use alloy::primitives::{Address, B256, U256};
use alloy::sol_types::SolEvent;
use ingest_data::LogEntry;
use serde::{Deserialize, Serialize};

use crate::abi::{
    topic_address, topic_int24, topic_u256, word_address, word_i256, word_int24, word_u256,
};
use crate::event::{
    DecodeError, DexSwap, EventData, LendingAction, LendingEvent, LiquidityAction,
    LiquidityChange, StakingAction, StakingEvent, TokenAmount, TokenStandard, TokenTransfer,
    YieldAction, YieldEvent,
};
use crate::registry::{DataShape, LogShape};
use crate::signatures::{
    aave_v2::ILendingPool, compound::ICToken, erc1155::IERC1155, erc20::IERC20, erc721::IERC721,
    masterchef::IMasterChef, staking::IStakingRewards, uniswap_v2::IUniswapV2Pair,
    uniswap_v3::IUniswapV3Pool,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecoderKind {
    Erc20Transfer,
    Erc721Transfer,
    Erc1155TransferSingle,
    Erc1155TransferBatch,
    UniswapV2Swap,
    UniswapV2Mint,
    UniswapV2Burn,
    UniswapV3Swap,
    UniswapV3Mint,
    UniswapV3Burn,
    AaveDeposit,
    AaveWithdraw,
    AaveBorrow,
    AaveRepay,
    CompoundMint,
    CompoundRedeem,
    CompoundBorrow,
    CompoundRepayBorrow,
    StakingStaked,
    StakingWithdrawn,
    StakingRewardPaid,
    FarmDeposit,
    FarmWithdraw,
    FarmHarvest,
}

/// Canonical registration data for a builtin decoder.
pub struct BuiltinSignature {
    pub name: &'static str,
    pub protocol: &'static str,
    pub topic0: B256,
    pub shape: LogShape,
}

const fn exact(topics: usize, data_len: usize) -> LogShape {
    LogShape {
        topics,
        data: DataShape::Exact(data_len),
    }
}

impl DecoderKind {
    /// Registration order of the builtin set.
    pub const ALL: [DecoderKind; 24] = [
        DecoderKind::Erc20Transfer,
        DecoderKind::Erc721Transfer,
        DecoderKind::Erc1155TransferSingle,
        DecoderKind::Erc1155TransferBatch,
        DecoderKind::UniswapV2Swap,
        DecoderKind::UniswapV2Mint,
        DecoderKind::UniswapV2Burn,
        DecoderKind::UniswapV3Swap,
        DecoderKind::UniswapV3Mint,
        DecoderKind::UniswapV3Burn,
        DecoderKind::AaveDeposit,
        DecoderKind::AaveWithdraw,
        DecoderKind::AaveBorrow,
        DecoderKind::AaveRepay,
        DecoderKind::CompoundMint,
        DecoderKind::CompoundRedeem,
        DecoderKind::CompoundBorrow,
        DecoderKind::CompoundRepayBorrow,
        DecoderKind::StakingStaked,
        DecoderKind::StakingWithdrawn,
        DecoderKind::StakingRewardPaid,
        DecoderKind::FarmDeposit,
        DecoderKind::FarmWithdraw,
        DecoderKind::FarmHarvest,
    ];

    pub fn builtin(self) -> BuiltinSignature {
        let (name, protocol, topic0, shape) = match self {
            DecoderKind::Erc20Transfer => {
                ("Transfer", "erc20", IERC20::Transfer::SIGNATURE_HASH, exact(3, 32))
            }
            DecoderKind::Erc721Transfer => {
                ("Transfer", "erc721", IERC721::Transfer::SIGNATURE_HASH, exact(4, 0))
            }
            DecoderKind::Erc1155TransferSingle => (
                "TransferSingle",
                "erc1155",
                IERC1155::TransferSingle::SIGNATURE_HASH,
                exact(4, 64),
            ),
            DecoderKind::Erc1155TransferBatch => (
                "TransferBatch",
                "erc1155",
                IERC1155::TransferBatch::SIGNATURE_HASH,
                LogShape {
                    topics: 4,
                    data: DataShape::AtLeast(128),
                },
            ),
            DecoderKind::UniswapV2Swap => (
                "Swap",
                "uniswap_v2",
                IUniswapV2Pair::Swap::SIGNATURE_HASH,
                exact(3, 128),
            ),
            DecoderKind::UniswapV2Mint => (
                "Mint",
                "uniswap_v2",
                IUniswapV2Pair::Mint::SIGNATURE_HASH,
                exact(2, 64),
            ),
            DecoderKind::UniswapV2Burn => (
                "Burn",
                "uniswap_v2",
                IUniswapV2Pair::Burn::SIGNATURE_HASH,
                exact(3, 64),
            ),
            DecoderKind::UniswapV3Swap => (
                "Swap",
                "uniswap_v3",
                IUniswapV3Pool::Swap::SIGNATURE_HASH,
                exact(3, 160),
            ),
            DecoderKind::UniswapV3Mint => (
                "Mint",
                "uniswap_v3",
                IUniswapV3Pool::Mint::SIGNATURE_HASH,
                exact(4, 128),
            ),
            DecoderKind::UniswapV3Burn => (
                "Burn",
                "uniswap_v3",
                IUniswapV3Pool::Burn::SIGNATURE_HASH,
                exact(4, 96),
            ),
            DecoderKind::AaveDeposit => (
                "Deposit",
                "aave_v2",
                ILendingPool::Deposit::SIGNATURE_HASH,
                exact(4, 64),
            ),
            DecoderKind::AaveWithdraw => (
                "Withdraw",
                "aave_v2",
                ILendingPool::Withdraw::SIGNATURE_HASH,
                exact(4, 32),
            ),
            DecoderKind::AaveBorrow => (
                "Borrow",
                "aave_v2",
                ILendingPool::Borrow::SIGNATURE_HASH,
                exact(4, 128),
            ),
            DecoderKind::AaveRepay => (
                "Repay",
                "aave_v2",
                ILendingPool::Repay::SIGNATURE_HASH,
                exact(4, 32),
            ),
            DecoderKind::CompoundMint => {
                ("Mint", "compound", ICToken::Mint::SIGNATURE_HASH, exact(1, 96))
            }
            DecoderKind::CompoundRedeem => (
                "Redeem",
                "compound",
                ICToken::Redeem::SIGNATURE_HASH,
                exact(1, 96),
            ),
            DecoderKind::CompoundBorrow => (
                "Borrow",
                "compound",
                ICToken::Borrow::SIGNATURE_HASH,
                exact(1, 128),
            ),
            DecoderKind::CompoundRepayBorrow => (
                "RepayBorrow",
                "compound",
                ICToken::RepayBorrow::SIGNATURE_HASH,
                exact(1, 160),
            ),
            DecoderKind::StakingStaked => (
                "Staked",
                "staking_rewards",
                IStakingRewards::Staked::SIGNATURE_HASH,
                exact(2, 32),
            ),
            DecoderKind::StakingWithdrawn => (
                "Withdrawn",
                "staking_rewards",
                IStakingRewards::Withdrawn::SIGNATURE_HASH,
                exact(2, 32),
            ),
            DecoderKind::StakingRewardPaid => (
                "RewardPaid",
                "staking_rewards",
                IStakingRewards::RewardPaid::SIGNATURE_HASH,
                exact(2, 32),
            ),
            DecoderKind::FarmDeposit => (
                "Deposit",
                "masterchef",
                IMasterChef::Deposit::SIGNATURE_HASH,
                exact(3, 32),
            ),
            DecoderKind::FarmWithdraw => (
                "Withdraw",
                "masterchef",
                IMasterChef::Withdraw::SIGNATURE_HASH,
                exact(3, 32),
            ),
            DecoderKind::FarmHarvest => (
                "Harvest",
                "masterchef",
                IMasterChef::Harvest::SIGNATURE_HASH,
                exact(3, 32),
            ),
        };
        BuiltinSignature {
            name,
            protocol,
            topic0,
            shape,
        }
    }

    /// Decodes a log whose shape already matched.
    ///
    /// # Errors
    /// Any [`DecodeError`] from malformed payloads; the classifier turns these
    /// into `Unrecognized`.
    pub fn decode(self, log: &LogEntry) -> Result<EventData, DecodeError> {
        let data = log.data.as_ref();
        match self {
            DecoderKind::Erc20Transfer => Ok(EventData::TokenTransfer(TokenTransfer {
                standard: TokenStandard::Erc20,
                token: log.address,
                operator: None,
                from: topic_address(log, 1)?,
                to: topic_address(log, 2)?,
                amount: word_u256(data, 0)?,
                token_id: None,
                batch: Vec::new(),
            })),
            DecoderKind::Erc721Transfer => Ok(EventData::TokenTransfer(TokenTransfer {
                standard: TokenStandard::Erc721,
                token: log.address,
                operator: None,
                from: topic_address(log, 1)?,
                to: topic_address(log, 2)?,
                amount: U256::from(1),
                token_id: Some(topic_u256(log, 3)?),
                batch: Vec::new(),
            })),
            DecoderKind::Erc1155TransferSingle => Ok(EventData::TokenTransfer(TokenTransfer {
                standard: TokenStandard::Erc1155,
                token: log.address,
                operator: Some(topic_address(log, 1)?),
                from: topic_address(log, 2)?,
                to: topic_address(log, 3)?,
                amount: word_u256(data, 1)?,
                token_id: Some(word_u256(data, 0)?),
                batch: Vec::new(),
            })),
            DecoderKind::Erc1155TransferBatch => decode_erc1155_batch(log),
            DecoderKind::UniswapV2Swap => {
                let amount0_in = word_u256(data, 0)?;
                let amount1_in = word_u256(data, 1)?;
                let amount0_out = word_u256(data, 2)?;
                let amount1_out = word_u256(data, 3)?;
                let zero_for_one = !amount0_in.is_zero();
                Ok(EventData::DexSwap(DexSwap {
                    pool: log.address,
                    sender: topic_address(log, 1)?,
                    recipient: topic_address(log, 2)?,
                    zero_for_one,
                    amount_in: if zero_for_one { amount0_in } else { amount1_in },
                    amount_out: if zero_for_one { amount1_out } else { amount0_out },
                    sqrt_price_x96: None,
                    liquidity: None,
                    tick: None,
                }))
            }
            DecoderKind::UniswapV3Swap => decode_v3_swap(log),
            DecoderKind::UniswapV2Mint => Ok(EventData::LiquidityChange(LiquidityChange {
                pool: log.address,
                action: LiquidityAction::Add,
                provider: topic_address(log, 1)?,
                recipient: None,
                amount0: word_u256(data, 0)?,
                amount1: word_u256(data, 1)?,
                liquidity: None,
                tick_lower: None,
                tick_upper: None,
            })),
            DecoderKind::UniswapV2Burn => Ok(EventData::LiquidityChange(LiquidityChange {
                pool: log.address,
                action: LiquidityAction::Remove,
                provider: topic_address(log, 1)?,
                recipient: Some(topic_address(log, 2)?),
                amount0: word_u256(data, 0)?,
                amount1: word_u256(data, 1)?,
                liquidity: None,
                tick_lower: None,
                tick_upper: None,
            })),
            DecoderKind::UniswapV3Mint => {
                // Data: sender, amount (liquidity), amount0, amount1
                word_address(data, 0)?;
                Ok(EventData::LiquidityChange(LiquidityChange {
                    pool: log.address,
                    action: LiquidityAction::Add,
                    provider: topic_address(log, 1)?,
                    recipient: None,
                    amount0: word_u256(data, 2)?,
                    amount1: word_u256(data, 3)?,
                    liquidity: Some(word_u256(data, 1)?),
                    tick_lower: Some(topic_int24(log, 2)?),
                    tick_upper: Some(topic_int24(log, 3)?),
                }))
            }
            DecoderKind::UniswapV3Burn => Ok(EventData::LiquidityChange(LiquidityChange {
                pool: log.address,
                action: LiquidityAction::Remove,
                provider: topic_address(log, 1)?,
                recipient: None,
                amount0: word_u256(data, 1)?,
                amount1: word_u256(data, 2)?,
                liquidity: Some(word_u256(data, 0)?),
                tick_lower: Some(topic_int24(log, 2)?),
                tick_upper: Some(topic_int24(log, 3)?),
            })),
            DecoderKind::AaveDeposit => lending(
                log,
                LendingAction::Deposit,
                topic_address(log, 2)?,
                Some(topic_address(log, 1)?),
                word_u256(data, 1)?,
                None,
            ),
            DecoderKind::AaveWithdraw => lending(
                log,
                LendingAction::Withdraw,
                topic_address(log, 2)?,
                Some(topic_address(log, 1)?),
                word_u256(data, 0)?,
                None,
            ),
            DecoderKind::AaveBorrow => lending(
                log,
                LendingAction::Borrow,
                topic_address(log, 2)?,
                Some(topic_address(log, 1)?),
                word_u256(data, 1)?,
                Some(word_u256(data, 3)?),
            ),
            DecoderKind::AaveRepay => lending(
                log,
                LendingAction::Repay,
                topic_address(log, 2)?,
                Some(topic_address(log, 1)?),
                word_u256(data, 0)?,
                None,
            ),
            DecoderKind::CompoundMint => lending(
                log,
                LendingAction::Deposit,
                word_address(data, 0)?,
                None,
                word_u256(data, 1)?,
                None,
            ),
            DecoderKind::CompoundRedeem => lending(
                log,
                LendingAction::Withdraw,
                word_address(data, 0)?,
                None,
                word_u256(data, 1)?,
                None,
            ),
            DecoderKind::CompoundBorrow => lending(
                log,
                LendingAction::Borrow,
                word_address(data, 0)?,
                None,
                word_u256(data, 1)?,
                None,
            ),
            DecoderKind::CompoundRepayBorrow => lending(
                log,
                LendingAction::Repay,
                word_address(data, 1)?,
                None,
                word_u256(data, 2)?,
                None,
            ),
            DecoderKind::StakingStaked => staking(log, StakingAction::Stake),
            DecoderKind::StakingWithdrawn => staking(log, StakingAction::Unstake),
            DecoderKind::StakingRewardPaid => staking(log, StakingAction::Reward),
            DecoderKind::FarmDeposit => farm(log, YieldAction::Deposit),
            DecoderKind::FarmWithdraw => farm(log, YieldAction::Withdraw),
            DecoderKind::FarmHarvest => farm(log, YieldAction::Harvest),
        }
    }
}

fn lending(
    log: &LogEntry,
    action: LendingAction,
    user: Address,
    asset: Option<Address>,
    amount: U256,
    borrow_rate: Option<U256>,
) -> Result<EventData, DecodeError> {
    Ok(EventData::Lending(LendingEvent {
        market: log.address,
        action,
        user,
        asset,
        amount,
        borrow_rate,
    }))
}

fn staking(log: &LogEntry, action: StakingAction) -> Result<EventData, DecodeError> {
    Ok(EventData::Staking(StakingEvent {
        contract: log.address,
        action,
        staker: topic_address(log, 1)?,
        amount: word_u256(log.data.as_ref(), 0)?,
    }))
}

fn farm(log: &LogEntry, action: YieldAction) -> Result<EventData, DecodeError> {
    Ok(EventData::Yield(YieldEvent {
        farm: log.address,
        action,
        farmer: topic_address(log, 1)?,
        pool_id: Some(topic_u256(log, 2)?),
        amount: word_u256(log.data.as_ref(), 0)?,
    }))
}

/// Uniswap V3 reports signed pool deltas: positive flows into the pool.
fn decode_v3_swap(log: &LogEntry) -> Result<EventData, DecodeError> {
    let data = log.data.as_ref();
    let amount0 = word_i256(data, 0)?;
    let amount1 = word_i256(data, 1)?;

    let zero_for_one = match (amount0.is_negative(), amount1.is_negative()) {
        (false, true) => true,
        (true, false) => false,
        // A zero leg can only be the output side of an exact-input swap.
        (false, false) if amount1.is_zero() => true,
        (false, false) if amount0.is_zero() => false,
        _ => {
            return Err(DecodeError::Inconsistent(format!(
                "swap deltas {amount0} and {amount1} have the same sign"
            )))
        }
    };
    let (amount_in, amount_out) = if zero_for_one {
        (amount0.unsigned_abs(), amount1.unsigned_abs())
    } else {
        (amount1.unsigned_abs(), amount0.unsigned_abs())
    };

    Ok(EventData::DexSwap(DexSwap {
        pool: log.address,
        sender: topic_address(log, 1)?,
        recipient: topic_address(log, 2)?,
        zero_for_one,
        amount_in,
        amount_out,
        sqrt_price_x96: Some(word_u256(data, 2)?),
        liquidity: Some(word_u256(data, 3)?),
        tick: Some(word_int24(data, 4)?),
    }))
}

fn decode_erc1155_batch(log: &LogEntry) -> Result<EventData, DecodeError> {
    let (ids, values) = IERC1155::TransferBatch::abi_decode_data(log.data.as_ref(), true)
        .map_err(|e| DecodeError::Abi(e.to_string()))?;
    if ids.len() != values.len() {
        return Err(DecodeError::Inconsistent(format!(
            "{} ids but {} values",
            ids.len(),
            values.len()
        )));
    }

    let mut total = U256::ZERO;
    for value in &values {
        total = total
            .checked_add(*value)
            .ok_or_else(|| DecodeError::Inconsistent("batch total overflows".to_string()))?;
    }

    Ok(EventData::TokenTransfer(TokenTransfer {
        standard: TokenStandard::Erc1155,
        token: log.address,
        operator: Some(topic_address(log, 1)?),
        from: topic_address(log, 2)?,
        to: topic_address(log, 3)?,
        amount: total,
        token_id: None,
        batch: ids
            .into_iter()
            .zip(values)
            .map(|(id, amount)| TokenAmount { id, amount })
            .collect(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_table_is_consistent() {
        for kind in DecoderKind::ALL {
            let sig = kind.builtin();
            assert!(!sig.name.is_empty());
            assert!(sig.shape.topics >= 1 && sig.shape.topics <= 4, "{kind:?}");
        }
    }

    #[test]
    fn decoder_kinds_deserialize_from_snake_case() {
        let kind: DecoderKind =
            serde_json::from_str("\"uniswap_v3_swap\"").expect("known decoder name");
        assert_eq!(kind, DecoderKind::UniswapV3Swap);
        assert!(serde_json::from_str::<DecoderKind>("\"curve_exchange\"").is_err());
    }
}
