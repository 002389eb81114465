//! Checked access to ABI words in log topics and data.
//!
//! Every accessor returns a [`DecodeError`] instead of panicking, so decoders
//! can be written with `?` against untrusted payloads.

use alloy::primitives::{Address, B256, I256, U256};

use crate::event::DecodeError;
use ingest_data::LogEntry;

const WORD: usize = 32;

/// Topic `index` of the log.
pub fn topic(log: &LogEntry, index: usize) -> Result<&B256, DecodeError> {
    log.topics.get(index).ok_or(DecodeError::MissingTopic(index))
}

/// An address right-aligned in a topic. Non-zero padding is rejected.
pub fn topic_address(log: &LogEntry, index: usize) -> Result<Address, DecodeError> {
    address_from_word(topic(log, index)?.as_slice())
}

pub fn topic_u256(log: &LogEntry, index: usize) -> Result<U256, DecodeError> {
    Ok(U256::from_be_bytes(topic(log, index)?.0))
}

/// A sign-extended `int24` held in a topic.
pub fn topic_int24(log: &LogEntry, index: usize) -> Result<i32, DecodeError> {
    int24_from_word(topic(log, index)?.as_slice())
}

/// Data word `index` as raw bytes.
pub fn word(data: &[u8], index: usize) -> Result<&[u8], DecodeError> {
    let start = index * WORD;
    data.get(start..start + WORD).ok_or(DecodeError::ShortData {
        need: start + WORD,
        have: data.len(),
    })
}

pub fn word_u256(data: &[u8], index: usize) -> Result<U256, DecodeError> {
    Ok(U256::from_be_slice(word(data, index)?))
}

/// Two's-complement `int256` data word.
pub fn word_i256(data: &[u8], index: usize) -> Result<I256, DecodeError> {
    Ok(I256::from_raw(word_u256(data, index)?))
}

pub fn word_address(data: &[u8], index: usize) -> Result<Address, DecodeError> {
    address_from_word(word(data, index)?)
}

pub fn word_int24(data: &[u8], index: usize) -> Result<i32, DecodeError> {
    int24_from_word(word(data, index)?)
}

fn address_from_word(word: &[u8]) -> Result<Address, DecodeError> {
    if word.len() != WORD || word[..12].iter().any(|b| *b != 0) {
        return Err(DecodeError::DirtyPadding("address"));
    }
    Ok(Address::from_slice(&word[12..]))
}

fn int24_from_word(word: &[u8]) -> Result<i32, DecodeError> {
    if word.len() != WORD {
        return Err(DecodeError::DirtyPadding("int24"));
    }
    let negative = word[29] & 0x80 != 0;
    let pad = if negative { 0xff } else { 0x00 };
    if word[..29].iter().any(|b| *b != pad) {
        return Err(DecodeError::DirtyPadding("int24"));
    }
    let value = i32::from_be_bytes([pad, word[29], word[30], word[31]]);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int24_word(value: i32) -> [u8; 32] {
        let mut out = if value < 0 { [0xff; 32] } else { [0u8; 32] };
        out[28..].copy_from_slice(&value.to_be_bytes());
        out
    }

    #[test]
    fn int24_round_trips_sign() {
        assert_eq!(int24_from_word(&int24_word(-887_272)).expect("valid tick"), -887_272);
        assert_eq!(int24_from_word(&int24_word(887_272)).expect("valid tick"), 887_272);
        assert_eq!(int24_from_word(&int24_word(0)).expect("valid tick"), 0);
    }

    #[test]
    fn int24_rejects_wide_values() {
        let mut word = [0u8; 32];
        word[28] = 0x01;
        assert!(int24_from_word(&word).is_err());
    }

    #[test]
    fn address_requires_zero_padding() {
        let mut word = [0u8; 32];
        word[31] = 0xff;
        assert_eq!(
            address_from_word(&word).expect("clean address"),
            Address::with_last_byte(0xff)
        );
        word[0] = 1;
        assert!(matches!(
            address_from_word(&word),
            Err(DecodeError::DirtyPadding("address"))
        ));
    }

    #[test]
    fn short_data_is_an_error_not_a_panic() {
        let data = [0u8; 40];
        assert!(word_u256(&data, 0).is_ok());
        assert_eq!(
            word_u256(&data, 1),
            Err(DecodeError::ShortData { need: 64, have: 40 })
        );
    }
}
