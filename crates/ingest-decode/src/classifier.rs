//! Log classification.
//!
//! [`Classifier::classify`] is total: every log becomes a [`DomainEvent`],
//! with anything the registry cannot decode reported as
//! [`EventData::Unrecognized`] carrying the reason.

use alloy::primitives::Address;
use ingest_data::{BlockBundle, IngestStats, LogEntry};
use std::sync::Arc;

use crate::event::{DomainEvent, EventData, Provenance, SignatureLabel, UnrecognizedReason};
use crate::registry::SignatureRegistry;

/// Block and transaction facts a log does not carry itself.
#[derive(Debug, Clone, Copy)]
pub struct LogContext {
    pub chain_id: u64,
    pub timestamp: u64,
    pub tx_from: Option<Address>,
}

#[derive(Debug, Clone)]
pub struct Classifier {
    registry: Arc<SignatureRegistry>,
    stats: Option<Arc<IngestStats>>,
}

impl Classifier {
    pub fn new(registry: Arc<SignatureRegistry>) -> Self {
        Self {
            registry,
            stats: None,
        }
    }

    /// Counts every classified event into `stats`.
    pub fn with_stats(mut self, stats: Arc<IngestStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn registry(&self) -> &SignatureRegistry {
        &self.registry
    }

    pub fn classify(&self, log: &LogEntry, ctx: &LogContext) -> DomainEvent {
        let provenance = Provenance {
            chain_id: ctx.chain_id,
            block_number: log.block_number,
            tx_hash: log.tx_hash,
            tx_index: log.tx_index,
            log_index: log.log_index,
            timestamp: ctx.timestamp,
            contract: log.address,
            tx_from: ctx.tx_from,
        };

        let event = match self.decode(log) {
            Ok((label, data)) => DomainEvent {
                provenance,
                signature: Some(label),
                data,
            },
            Err(reason) => {
                tracing::debug!(
                    block = log.block_number,
                    log_index = log.log_index,
                    contract = %log.address,
                    %reason,
                    "unrecognized log"
                );
                DomainEvent {
                    provenance,
                    signature: None,
                    data: EventData::Unrecognized {
                        topic0: log.topic0().copied(),
                        reason,
                    },
                }
            }
        };

        if let Some(stats) = &self.stats {
            stats.record_event(event.kind().into());
        }
        event
    }

    /// Classifies every log of a block in log order.
    pub fn classify_bundle(&self, bundle: &BlockBundle, chain_id: u64) -> Vec<DomainEvent> {
        bundle
            .logs
            .iter()
            .map(|log| {
                let ctx = LogContext {
                    chain_id,
                    timestamp: bundle.block.timestamp,
                    tx_from: bundle.sender_of(log),
                };
                self.classify(log, &ctx)
            })
            .collect()
    }

    fn decode(
        &self,
        log: &LogEntry,
    ) -> Result<(Arc<SignatureLabel>, EventData), UnrecognizedReason> {
        let topic0 = log.topic0().ok_or(UnrecognizedReason::NoTopics)?;
        if !self.registry.contains(topic0) {
            return Err(UnrecognizedReason::UnknownSignature);
        }

        let topics = log.topics.len();
        let data_len = log.data.len();
        let signature = self
            .registry
            .resolve(topic0, topics, data_len)
            .ok_or(UnrecognizedReason::ShapeMismatch { topics, data_len })?;

        let data = signature
            .decoder
            .decode(log)
            .map_err(UnrecognizedReason::DecodeFailed)?;
        Ok((signature.label.clone(), data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoders::DecoderKind;
    use crate::event::{EventKind, LiquidityAction, TokenStandard};
    use crate::registry::{DataShape, EventSignature, LogShape};
    use crate::signatures::{
        compound::ICToken, erc1155::IERC1155, erc20::IERC20, uniswap_v2::IUniswapV2Pair,
        uniswap_v3::IUniswapV3Pool,
    };
    use alloy::primitives::{Bytes, B256, I256, U256};
    use alloy::sol_types::SolEvent;
    use std::sync::atomic::Ordering;

    fn addr_topic(addr: Address) -> B256 {
        addr.into_word()
    }

    fn u256_word(v: U256) -> [u8; 32] {
        v.to_be_bytes()
    }

    fn log(topics: Vec<B256>, data: Vec<u8>) -> LogEntry {
        LogEntry {
            block_number: 18_000_000,
            tx_hash: B256::repeat_byte(0x77),
            tx_index: 3,
            log_index: 9,
            address: Address::repeat_byte(0xaa),
            topics,
            data: Bytes::from(data),
        }
    }

    fn ctx() -> LogContext {
        LogContext {
            chain_id: 1,
            timestamp: 1_693_000_000,
            tx_from: Some(Address::repeat_byte(0x01)),
        }
    }

    fn classifier() -> Classifier {
        Classifier::new(Arc::new(SignatureRegistry::builtin()))
    }

    #[test]
    fn erc20_transfer_keeps_full_precision() {
        let amount = U256::from_str_radix("28019014209000000000000", 10).expect("decimal literal");
        let from = Address::repeat_byte(0x0f);
        let to = Address::repeat_byte(0x0e);
        let log = log(
            vec![IERC20::Transfer::SIGNATURE_HASH, addr_topic(from), addr_topic(to)],
            u256_word(amount).to_vec(),
        );

        let event = classifier().classify(&log, &ctx());
        assert_eq!(event.kind(), EventKind::TokenTransfer);
        assert_eq!(event.protocol(), Some("erc20"));
        assert_eq!(event.provenance.log_index, 9);
        assert_eq!(event.provenance.tx_from, Some(Address::repeat_byte(0x01)));
        match event.data {
            EventData::TokenTransfer(t) => {
                assert_eq!(t.standard, TokenStandard::Erc20);
                assert_eq!(t.from, from);
                assert_eq!(t.to, to);
                assert_eq!(t.amount, amount);
                assert_eq!(t.amount.to_string(), "28019014209000000000000");
            }
            other => panic!("expected transfer, got {other:?}"),
        }
    }

    #[test]
    fn four_topic_transfer_is_an_nft() {
        let log = log(
            vec![
                IERC20::Transfer::SIGNATURE_HASH,
                addr_topic(Address::ZERO),
                addr_topic(Address::repeat_byte(0x0e)),
                B256::from(U256::from(4242)),
            ],
            Vec::new(),
        );
        let event = classifier().classify(&log, &ctx());
        match event.data {
            EventData::TokenTransfer(t) => {
                assert_eq!(t.standard, TokenStandard::Erc721);
                assert_eq!(t.token_id, Some(U256::from(4242)));
                assert_eq!(t.amount, U256::from(1));
            }
            other => panic!("expected nft transfer, got {other:?}"),
        }
    }

    #[test]
    fn unknown_topic_is_unrecognized_with_reason() {
        let log = log(vec![B256::repeat_byte(0x42)], vec![0u8; 32]);
        let event = classifier().classify(&log, &ctx());
        assert!(!event.is_recognized());
        assert!(event.signature.is_none());
        assert_eq!(
            event.data,
            EventData::Unrecognized {
                topic0: Some(B256::repeat_byte(0x42)),
                reason: UnrecognizedReason::UnknownSignature,
            }
        );
    }

    #[test]
    fn anonymous_log_is_unrecognized() {
        let event = classifier().classify(&log(Vec::new(), vec![1, 2, 3]), &ctx());
        assert_eq!(
            event.data,
            EventData::Unrecognized {
                topic0: None,
                reason: UnrecognizedReason::NoTopics,
            }
        );
    }

    #[test]
    fn wrong_shape_is_unrecognized_not_a_panic() {
        // Transfer topic0 with 2 topics and 7 bytes of data
        let log = log(
            vec![IERC20::Transfer::SIGNATURE_HASH, B256::ZERO],
            vec![0u8; 7],
        );
        let event = classifier().classify(&log, &ctx());
        assert!(matches!(
            event.data,
            EventData::Unrecognized {
                reason: UnrecognizedReason::ShapeMismatch {
                    topics: 2,
                    data_len: 7
                },
                ..
            }
        ));
    }

    #[test]
    fn dirty_address_padding_fails_decode() {
        let mut bad = [0u8; 32];
        bad[0] = 0xff;
        let log = log(
            vec![
                IERC20::Transfer::SIGNATURE_HASH,
                B256::from(bad),
                addr_topic(Address::repeat_byte(1)),
            ],
            vec![0u8; 32],
        );
        let event = classifier().classify(&log, &ctx());
        assert!(matches!(
            event.data,
            EventData::Unrecognized {
                reason: UnrecognizedReason::DecodeFailed(_),
                ..
            }
        ));
    }

    #[test]
    fn v2_swap_direction_from_input_leg() {
        let mut data = Vec::new();
        for v in [0u64, 5_000, 1_234, 0] {
            data.extend_from_slice(&u256_word(U256::from(v)));
        }
        let log = log(
            vec![
                IUniswapV2Pair::Swap::SIGNATURE_HASH,
                addr_topic(Address::repeat_byte(2)),
                addr_topic(Address::repeat_byte(3)),
            ],
            data,
        );
        match classifier().classify(&log, &ctx()).data {
            EventData::DexSwap(s) => {
                assert!(!s.zero_for_one);
                assert_eq!(s.amount_in, U256::from(5_000));
                assert_eq!(s.amount_out, U256::from(1_234));
                assert_eq!(s.tick, None);
            }
            other => panic!("expected swap, got {other:?}"),
        }
    }

    #[test]
    fn v3_swap_uses_signed_deltas() {
        let mut data = Vec::new();
        data.extend_from_slice(&I256::try_from(1_000_000i64).expect("fits").into_raw().to_be_bytes::<32>());
        data.extend_from_slice(&I256::try_from(-998_000i64).expect("fits").into_raw().to_be_bytes::<32>());
        data.extend_from_slice(&u256_word(U256::from(1u128 << 96)));
        data.extend_from_slice(&u256_word(U256::from(5_000_000u64)));
        data.extend_from_slice(&I256::try_from(-200i64).expect("fits").into_raw().to_be_bytes::<32>());
        let log = log(
            vec![
                IUniswapV3Pool::Swap::SIGNATURE_HASH,
                addr_topic(Address::repeat_byte(2)),
                addr_topic(Address::repeat_byte(3)),
            ],
            data,
        );
        let event = classifier().classify(&log, &ctx());
        assert_eq!(event.protocol(), Some("uniswap_v3"));
        match event.data {
            EventData::DexSwap(s) => {
                assert!(s.zero_for_one);
                assert_eq!(s.amount_in, U256::from(1_000_000));
                assert_eq!(s.amount_out, U256::from(998_000));
                assert_eq!(s.tick, Some(-200));
                assert_eq!(s.liquidity, Some(U256::from(5_000_000u64)));
            }
            other => panic!("expected swap, got {other:?}"),
        }
    }

    #[test]
    fn mint_collision_resolved_by_arity() {
        let classifier = classifier();
        assert_eq!(
            ICToken::Mint::SIGNATURE_HASH,
            IUniswapV2Pair::Mint::SIGNATURE_HASH
        );

        let v2 = log(
            vec![
                IUniswapV2Pair::Mint::SIGNATURE_HASH,
                addr_topic(Address::repeat_byte(4)),
            ],
            [u256_word(U256::from(10)), u256_word(U256::from(20))].concat(),
        );
        let event = classifier.classify(&v2, &ctx());
        match event.data {
            EventData::LiquidityChange(l) => {
                assert_eq!(l.action, LiquidityAction::Add);
                assert_eq!(l.amount1, U256::from(20));
            }
            other => panic!("expected liquidity change, got {other:?}"),
        }

        let mut minter = [0u8; 32];
        minter[12..].copy_from_slice(Address::repeat_byte(5).as_slice());
        let compound = log(
            vec![ICToken::Mint::SIGNATURE_HASH],
            [minter, u256_word(U256::from(100)), u256_word(U256::from(4_999))].concat(),
        );
        let event = classifier.classify(&compound, &ctx());
        assert_eq!(event.protocol(), Some("compound"));
        assert_eq!(event.kind(), EventKind::Lending);
    }

    #[test]
    fn erc1155_batch_sums_amounts() {
        let ids = vec![U256::from(1), U256::from(2)];
        let values = vec![U256::from(10), U256::from(32)];
        let data = IERC1155::TransferBatch {
            operator: Address::repeat_byte(1),
            from: Address::repeat_byte(2),
            to: Address::repeat_byte(3),
            ids: ids.clone(),
            values: values.clone(),
        }
        .encode_data();
        let log = log(
            vec![
                IERC1155::TransferBatch::SIGNATURE_HASH,
                addr_topic(Address::repeat_byte(1)),
                addr_topic(Address::repeat_byte(2)),
                addr_topic(Address::repeat_byte(3)),
            ],
            data,
        );
        match classifier().classify(&log, &ctx()).data {
            EventData::TokenTransfer(t) => {
                assert_eq!(t.amount, U256::from(42));
                assert_eq!(t.batch.len(), 2);
                assert_eq!(t.batch[1].id, U256::from(2));
            }
            other => panic!("expected batch transfer, got {other:?}"),
        }
    }

    #[test]
    fn first_registered_decoder_wins() {
        let topic0 = IERC20::Transfer::SIGNATURE_HASH;
        let shape = LogShape {
            topics: 3,
            data: DataShape::Exact(32),
        };
        let mut registry = SignatureRegistry::empty();
        registry.register(EventSignature::new(
            "Staked",
            "custom",
            topic0,
            shape,
            DecoderKind::StakingStaked,
        ));
        registry.register(EventSignature::builtin(DecoderKind::Erc20Transfer));

        // StakingStaked reads topic1 and word 0, both present
        let log = log(
            vec![topic0, addr_topic(Address::repeat_byte(1)), addr_topic(Address::repeat_byte(2))],
            u256_word(U256::from(7)).to_vec(),
        );
        let event = Classifier::new(Arc::new(registry)).classify(&log, &ctx());
        assert_eq!(event.protocol(), Some("custom"));
        assert_eq!(event.kind(), EventKind::Staking);
    }

    #[test]
    fn stats_count_every_kind() {
        let stats = Arc::new(IngestStats::new());
        let classifier = classifier().with_stats(stats.clone());
        classifier.classify(&log(vec![B256::repeat_byte(9)], Vec::new()), &ctx());
        classifier.classify(
            &log(
                vec![
                    IERC20::Transfer::SIGNATURE_HASH,
                    addr_topic(Address::repeat_byte(1)),
                    addr_topic(Address::repeat_byte(2)),
                ],
                u256_word(U256::from(1)).to_vec(),
            ),
            &ctx(),
        );
        assert_eq!(stats.unrecognized_dropped.load(Ordering::Relaxed), 1);
        assert_eq!(stats.token_transfers.load(Ordering::Relaxed), 1);
    }
}
