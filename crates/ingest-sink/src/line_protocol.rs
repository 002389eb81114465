//! InfluxDB line protocol encoding.
//!
//! `U256` fields are written as quoted decimal strings so values above
//! `i64::MAX` survive unchanged and one field never flips type between
//! points. Timestamps use second precision.

use ingest_data::{FieldValue, Record};
use std::fmt::Write;

fn escape_measurement(out: &mut String, s: &str) {
    for c in s.chars() {
        if matches!(c, ',' | ' ' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
}

/// Tag keys, tag values and field keys.
fn escape_key(out: &mut String, s: &str) {
    for c in s.chars() {
        if matches!(c, ',' | '=' | ' ' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
}

fn escape_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        if matches!(c, '"' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
}

fn write_field(out: &mut String, value: &FieldValue) {
    match value {
        FieldValue::Integer(v) => {
            let _ = write!(out, "{v}i");
        }
        FieldValue::Unsigned(v) => escape_string(out, &v.to_string()),
        FieldValue::Float(v) => {
            // Keep a decimal point so integral floats are not read as integers
            if v.fract() == 0.0 && v.abs() < 1e15 {
                let _ = write!(out, "{v:.1}");
            } else {
                let _ = write!(out, "{v}");
            }
        }
        FieldValue::Text(v) => escape_string(out, v),
        FieldValue::Bool(v) => out.push_str(if *v { "true" } else { "false" }),
    }
}

/// Encodes one record as a single line without the trailing newline.
pub fn encode_record(record: &Record) -> String {
    let mut out = String::with_capacity(256);
    escape_measurement(&mut out, &record.measurement);
    for (key, value) in &record.tags {
        out.push(',');
        escape_key(&mut out, key);
        out.push('=');
        escape_key(&mut out, value);
    }
    out.push(' ');
    for (i, (key, value)) in record.fields.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        escape_key(&mut out, key);
        out.push('=');
        write_field(&mut out, value);
    }
    let _ = write!(out, " {}", record.timestamp);
    out
}

/// Newline-separated body for a write request.
pub fn encode_batch(records: &[Record]) -> String {
    let mut body = String::with_capacity(records.len() * 256);
    for record in records {
        body.push_str(&encode_record(record));
        body.push('\n');
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::U256;
    use ingest_data::NaturalKey;

    #[test]
    fn encodes_tags_fields_and_timestamp() {
        let record = Record::new("token_transfers", NaturalKey::block(1, 101), 1_700_000_000)
            .tag("chain_id", "1")
            .tag("chain_name", "bnb chain")
            .field("amount", U256::from_str_radix("28019014209000000000000", 10).expect("decimal"))
            .field("block_number", 101u64)
            .field("gas_utilization", 0.5)
            .field("tx_hash", "0xab");

        assert_eq!(
            encode_record(&record),
            "token_transfers,chain_id=1,chain_name=bnb\\ chain \
             amount=\"28019014209000000000000\",block_number=101i,gas_utilization=0.5,tx_hash=\"0xab\" \
             1700000000"
        );
    }

    #[test]
    fn integral_floats_keep_a_decimal_point() {
        let record = Record::new("blocks", NaturalKey::block(1, 1), 0).field("gas_utilization", 1.0);
        assert!(encode_record(&record).contains("gas_utilization=1.0 "));
    }

    #[test]
    fn escapes_special_characters() {
        let record = Record::new("m,x", NaturalKey::block(1, 1), 0)
            .tag("k=1", "a,b")
            .field("note", "say \"hi\"");
        assert_eq!(
            encode_record(&record),
            "m\\,x,k\\=1=a\\,b note=\"say \\\"hi\\\"\" 0"
        );
    }

    #[test]
    fn batch_is_newline_terminated() {
        let r = Record::new("blocks", NaturalKey::block(1, 1), 0).field("gas_used", 1u64);
        let body = encode_batch(&[r.clone(), r]);
        assert_eq!(body.lines().count(), 2);
        assert!(body.ends_with('\n'));
    }
}
