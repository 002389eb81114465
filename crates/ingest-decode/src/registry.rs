//! Signature registry keyed by topic0.
//!
//! Several signatures may share a topic0 (ERC-20 and ERC-721 `Transfer`,
//! Uniswap V2 and Compound `Mint`). Candidates under one topic0 are kept in
//! registration order and told apart by [`LogShape`].

use alloy::primitives::B256;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::decoders::DecoderKind;
use crate::event::SignatureLabel;

/// Constraint on the length of a log's data section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataShape {
    Exact(usize),
    /// Dynamic payloads, e.g. arrays
    AtLeast(usize),
}

/// Topic count (topic0 included) and data length a signature accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogShape {
    pub topics: usize,
    pub data: DataShape,
}

impl LogShape {
    pub fn matches(&self, topics: usize, data_len: usize) -> bool {
        if topics != self.topics {
            return false;
        }
        match self.data {
            DataShape::Exact(n) => data_len == n,
            DataShape::AtLeast(n) => data_len >= n,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventSignature {
    pub label: Arc<SignatureLabel>,
    pub topic0: B256,
    pub shape: LogShape,
    pub decoder: DecoderKind,
}

impl EventSignature {
    pub fn new(
        name: impl Into<String>,
        protocol: impl Into<String>,
        topic0: B256,
        shape: LogShape,
        decoder: DecoderKind,
    ) -> Self {
        Self {
            label: Arc::new(SignatureLabel {
                name: name.into(),
                protocol: protocol.into(),
            }),
            topic0,
            shape,
            decoder,
        }
    }

    /// The canonical registration of a builtin decoder.
    pub fn builtin(decoder: DecoderKind) -> Self {
        let sig = decoder.builtin();
        Self::new(sig.name, sig.protocol, sig.topic0, sig.shape, decoder)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SignatureRegistry {
    entries: Vec<EventSignature>,
    by_topic0: HashMap<B256, Vec<usize>>,
}

impl SignatureRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry holding every builtin decoder.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for kind in DecoderKind::ALL {
            registry.register(EventSignature::builtin(kind));
        }
        registry
    }

    /// Appends a signature. Earlier registrations win when shapes overlap.
    pub fn register(&mut self, signature: EventSignature) {
        let candidates = self.by_topic0.entry(signature.topic0).or_default();
        if let Some(existing) = candidates
            .iter()
            .map(|&i| &self.entries[i])
            .find(|e| e.shape == signature.shape)
        {
            tracing::warn!(
                topic0 = %signature.topic0,
                shadowed = %format!("{}/{}", signature.label.protocol, signature.label.name),
                by = %format!("{}/{}", existing.label.protocol, existing.label.name),
                "signature shape already registered; new entry will never match"
            );
        }
        candidates.push(self.entries.len());
        self.entries.push(signature);
    }

    /// Signatures registered under `topic0`, in registration order.
    pub fn candidates(&self, topic0: &B256) -> impl Iterator<Item = &EventSignature> {
        self.by_topic0
            .get(topic0)
            .into_iter()
            .flatten()
            .map(|&i| &self.entries[i])
    }

    /// First candidate whose shape accepts the log.
    pub fn resolve(&self, topic0: &B256, topics: usize, data_len: usize) -> Option<&EventSignature> {
        self.candidates(topic0)
            .find(|sig| sig.shape.matches(topics, data_len))
    }

    pub fn contains(&self, topic0: &B256) -> bool {
        self.by_topic0.contains_key(topic0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EventSignature> {
        self.entries.iter()
    }
}
