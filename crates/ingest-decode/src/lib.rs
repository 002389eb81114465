//! ingest-decode crate
//!
//! Turns raw logs into typed domain events via a topic0 signature registry.

pub mod abi;
pub mod classifier;
pub mod decoders;
pub mod event;
pub mod registry;
pub mod signatures;

pub use classifier::{Classifier, LogContext};
pub use decoders::DecoderKind;
pub use event::{
    DecodeError, DexSwap, DomainEvent, EventData, EventKind, LendingAction, LendingEvent,
    LiquidityAction, LiquidityChange, Provenance, SignatureLabel, StakingAction, StakingEvent,
    TokenAmount, TokenStandard, TokenTransfer, UnrecognizedReason, YieldAction, YieldEvent,
};
pub use registry::{DataShape, EventSignature, LogShape, SignatureRegistry};
