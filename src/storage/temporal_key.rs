//! Order-preserving temporal key codec
//!
//! Maps `(keyspace, key, timestamp)` onto a single byte string such that
//! lexicographic comparison of the encoded form equals the tuple order.
//!
//! Layout:
//! ```text
//! keyspace bytes | 0x00 | key bytes | 0x00 | timestamp (8 bytes, big-endian)
//! ```
//!
//! Because the timestamp is fixed-width big-endian, an ordered scan over
//! `[encode(ks, k, 0), encode(ks, k, t)]` yields exactly the versions of
//! `k` up to `t` in ascending order, and an ordered-predecessor lookup on
//! `encode(ks, k, t)` finds the as-of version without deserializing values.
//!
//! Keyspace and key must not contain NUL bytes; that is enforced at the
//! store boundary before encoding.

use crate::storage::error::{ChronoError, ChronoResult};
use crate::storage::types::Timestamp;

const SEPARATOR: u8 = 0x00;
const TIMESTAMP_WIDTH: usize = 8;

/// A decoded temporal key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemporalKey {
    pub keyspace: String,
    pub key: String,
    pub timestamp: Timestamp,
}

/// Encode `(keyspace, key, timestamp)` into its ordered byte form
pub fn encode(keyspace: &str, key: &str, timestamp: Timestamp) -> Vec<u8> {
    let mut buf = Vec::with_capacity(keyspace.len() + key.len() + 2 + TIMESTAMP_WIDTH);
    buf.extend_from_slice(keyspace.as_bytes());
    buf.push(SEPARATOR);
    buf.extend_from_slice(key.as_bytes());
    buf.push(SEPARATOR);
    buf.extend_from_slice(&timestamp.to_be_bytes());
    buf
}

/// Decode an encoded temporal key back into its parts
///
/// Fails with `InvalidEncoding` when the separator count is wrong, the
/// timestamp field is truncated, or a component is not valid UTF-8.
pub fn decode(bytes: &[u8]) -> ChronoResult<TemporalKey> {
    if bytes.len() < TIMESTAMP_WIDTH + 2 {
        return Err(ChronoError::InvalidEncoding(format!(
            "temporal key too short: {} bytes",
            bytes.len()
        )));
    }
    let (prefix, ts_bytes) = bytes.split_at(bytes.len() - TIMESTAMP_WIDTH);

    // prefix must be: keyspace | 0x00 | key | 0x00
    let last = prefix.len() - 1;
    if prefix[last] != SEPARATOR {
        return Err(ChronoError::InvalidEncoding(
            "missing separator before timestamp".to_string(),
        ));
    }
    let body = &prefix[..last];
    let sep_pos = body
        .iter()
        .position(|&b| b == SEPARATOR)
        .ok_or_else(|| ChronoError::InvalidEncoding("missing keyspace separator".to_string()))?;
    let (keyspace_bytes, rest) = body.split_at(sep_pos);
    let key_bytes = &rest[1..];
    if key_bytes.contains(&SEPARATOR) {
        return Err(ChronoError::InvalidEncoding(
            "too many separators in temporal key".to_string(),
        ));
    }

    let keyspace = std::str::from_utf8(keyspace_bytes)
        .map_err(|e| ChronoError::InvalidEncoding(format!("keyspace is not UTF-8: {}", e)))?
        .to_string();
    let key = std::str::from_utf8(key_bytes)
        .map_err(|e| ChronoError::InvalidEncoding(format!("key is not UTF-8: {}", e)))?
        .to_string();

    let mut ts_buf = [0u8; TIMESTAMP_WIDTH];
    ts_buf.copy_from_slice(ts_bytes);
    let timestamp = u64::from_be_bytes(ts_buf);

    Ok(TemporalKey {
        keyspace,
        key,
        timestamp,
    })
}

/// Check whether an encoded key belongs to the given `(keyspace, key)` pair
/// without allocating.
pub fn matches_key(bytes: &[u8], keyspace: &str, key: &str) -> bool {
    let expected = keyspace.len() + key.len() + 2 + TIMESTAMP_WIDTH;
    if bytes.len() != expected {
        return false;
    }
    let (ks_part, rest) = bytes.split_at(keyspace.len());
    if ks_part != keyspace.as_bytes() || rest[0] != SEPARATOR {
        return false;
    }
    let rest = &rest[1..];
    let (key_part, tail) = rest.split_at(key.len());
    key_part == key.as_bytes() && tail[0] == SEPARATOR
}

/// Extract only the timestamp from an encoded key
pub fn decode_timestamp(bytes: &[u8]) -> ChronoResult<Timestamp> {
    if bytes.len() < TIMESTAMP_WIDTH {
        return Err(ChronoError::InvalidEncoding(
            "temporal key too short for a timestamp".to_string(),
        ));
    }
    let mut ts_buf = [0u8; TIMESTAMP_WIDTH];
    ts_buf.copy_from_slice(&bytes[bytes.len() - TIMESTAMP_WIDTH..]);
    Ok(u64::from_be_bytes(ts_buf))
}
