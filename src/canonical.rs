//! Deterministic serialization and double hashing.
//!
//! Hash chaining and signatures are only meaningful over a byte representation
//! that does not depend on how a record was built.  [`canonicalize`] renders any
//! `Serialize` value as compact JSON whose object keys are sorted at every
//! level and whose numbers are plain decimal integers; [`double_hash`] applies
//! SHA-256 twice.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest as _, Sha256};

/// A 32-byte double SHA-256 digest.
pub type Digest = [u8; 32];

/// Length of a hex-encoded [`Digest`].
pub const DIGEST_HEX_LEN: usize = 64;

/// Computes `SHA-256(SHA-256(bytes))`.
pub fn double_hash(bytes: &[u8]) -> Digest {
    let first = Sha256::digest(bytes);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// Renders `value` as canonical JSON bytes.
pub fn canonicalize<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, String> {
    let value = serde_json::to_value(value).map_err(|err| format!("serialize: {err}"))?;
    canonicalize_value(&value)
}

/// Renders an already-built JSON value as canonical bytes.
pub fn canonicalize_value(value: &Value) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(128);
    write_value(value, &mut out)?;
    Ok(out)
}

/// Double hash of the canonical encoding of `value`.
pub fn canonical_hash<T: Serialize + ?Sized>(value: &T) -> Result<Digest, String> {
    Ok(double_hash(&canonicalize(value)?))
}

fn write_value(value: &Value, out: &mut Vec<u8>) -> Result<(), String> {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(number) => {
            if let Some(n) = number.as_u64() {
                out.extend_from_slice(n.to_string().as_bytes());
            } else if let Some(n) = number.as_i64() {
                out.extend_from_slice(n.to_string().as_bytes());
            } else {
                return Err(format!("non-integer number {number} is not canonical"));
            }
        }
        Value::String(s) => write_string(s, out)?,
        Value::Array(items) => {
            out.push(b'[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(b',');
                }
                write_value(item, out)?;
            }
            out.push(b']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push(b'{');
            for (idx, key) in keys.into_iter().enumerate() {
                if idx > 0 {
                    out.push(b',');
                }
                write_string(key, out)?;
                out.push(b':');
                write_value(&map[key], out)?;
            }
            out.push(b'}');
        }
    }
    Ok(())
}

fn write_string(s: &str, out: &mut Vec<u8>) -> Result<(), String> {
    let encoded = serde_json::to_string(s).map_err(|err| format!("serialize string: {err}"))?;
    out.extend_from_slice(encoded.as_bytes());
    Ok(())
}

/// Canonical bytes of an object with one numeric field left open.
///
/// Mining re-hashes the same object with a different nonce on every attempt.
/// The template renders every other field once and splices the nonce between a
/// fixed prefix and suffix, producing exactly the bytes [`canonicalize_value`]
/// would produce for the full object.
#[derive(Debug, Clone)]
pub struct NonceTemplate {
    prefix: Vec<u8>,
    suffix: Vec<u8>,
}

impl NonceTemplate {
    /// Builds a template from `fields` (an object without `nonce_key`).
    pub fn new(fields: &serde_json::Map<String, Value>, nonce_key: &str) -> Result<Self, String> {
        if fields.contains_key(nonce_key) {
            return Err(format!("template fields already contain `{nonce_key}`"));
        }
        let mut keys: Vec<&String> = fields.keys().collect();
        keys.sort();
        let (before, after): (Vec<&String>, Vec<&String>) =
            keys.into_iter().partition(|key| key.as_str() < nonce_key);

        let mut prefix = vec![b'{'];
        for key in &before {
            write_string(key, &mut prefix)?;
            prefix.push(b':');
            write_value(&fields[key.as_str()], &mut prefix)?;
            prefix.push(b',');
        }
        write_string(nonce_key, &mut prefix)?;
        prefix.push(b':');

        let mut suffix = Vec::new();
        for key in &after {
            suffix.push(b',');
            write_string(key, &mut suffix)?;
            suffix.push(b':');
            write_value(&fields[key.as_str()], &mut suffix)?;
        }
        suffix.push(b'}');
        Ok(Self { prefix, suffix })
    }

    /// Canonical bytes with `nonce` spliced in.
    pub fn render(&self, nonce: u64, buf: &mut Vec<u8>) {
        buf.clear();
        buf.extend_from_slice(&self.prefix);
        buf.extend_from_slice(nonce.to_string().as_bytes());
        buf.extend_from_slice(&self.suffix);
    }

    /// Double hash of the rendered bytes for `nonce`.
    pub fn hash(&self, nonce: u64, buf: &mut Vec<u8>) -> Digest {
        self.render(nonce, buf);
        double_hash(buf)
    }
}

/// Encodes a digest as 64 lowercase hex characters.
pub fn digest_to_hex(digest: &Digest) -> String {
    hex::encode(digest)
}

/// Parses a 64 character hex digest.
pub fn digest_from_hex(input: &str) -> Result<Digest, String> {
    if input.len() != DIGEST_HEX_LEN {
        return Err(format!(
            "digest must be {DIGEST_HEX_LEN} hex characters, got {}",
            input.len()
        ));
    }
    let bytes = hex::decode(input).map_err(|err| format!("invalid hex digest: {err}"))?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Number of leading `'0'` characters in the hex rendering of `digest`.
pub fn leading_zero_hex(digest: &Digest) -> usize {
    let mut count = 0;
    for byte in digest {
        if *byte == 0 {
            count += 2;
            continue;
        }
        if byte >> 4 == 0 {
            count += 1;
        }
        break;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted_at_every_level() {
        let bytes = canonicalize_value(&json!({
            "b": 1,
            "a": {"z": true, "y": [3, {"d": null, "c": "x"}]},
        }))
        .unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"a":{"y":[3,{"c":"x","d":null}],"z":true},"b":1}"#
        );
    }

    #[test]
    fn floats_are_rejected() {
        assert!(canonicalize_value(&json!({"x": 1.5})).is_err());
    }

    #[test]
    fn double_hash_differs_from_single() {
        let single = Sha256::digest(b"ballot");
        assert_ne!(&double_hash(b"ballot")[..], &single[..]);
        assert_eq!(double_hash(b"ballot"), double_hash(b"ballot"));
    }

    #[test]
    fn nonce_template_matches_full_encoding() {
        let mut fields = serde_json::Map::new();
        fields.insert("electionId".into(), json!("e-1"));
        fields.insert("index".into(), json!(3));
        fields.insert("previousHash".into(), json!("ab"));
        fields.insert("votes".into(), json!([{"k": 1}]));
        let template = NonceTemplate::new(&fields, "nonce").unwrap();

        let mut full = fields.clone();
        full.insert("nonce".into(), json!(917u64));
        let mut buf = Vec::new();
        template.render(917, &mut buf);
        assert_eq!(buf, canonicalize_value(&Value::Object(full)).unwrap());
    }

    #[test]
    fn leading_zero_counts_nibbles() {
        let mut digest = [0xffu8; 32];
        assert_eq!(leading_zero_hex(&digest), 0);
        digest[0] = 0x0f;
        assert_eq!(leading_zero_hex(&digest), 1);
        digest[0] = 0x00;
        digest[1] = 0x01;
        assert_eq!(leading_zero_hex(&digest), 3);
        assert_eq!(leading_zero_hex(&[0u8; 32]), 64);
    }

    #[test]
    fn hex_roundtrip_rejects_short_input() {
        let digest = double_hash(b"x");
        assert_eq!(digest_from_hex(&digest_to_hex(&digest)).unwrap(), digest);
        assert!(digest_from_hex("abcd").is_err());
    }
}
