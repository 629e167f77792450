//! Time-sorted message identifiers.
//!
//! Generates 64-bit ids rendered as 13-character Crockford Base32 strings.
//! Lexicographic order follows creation time, so ids double as a stable
//! tiebreaker in scans.

use rand::Rng;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Crockford Base32 alphabet (excludes I, L, O, U)
const ALPHABET: &[u8] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

static COUNTER: AtomicU16 = AtomicU16::new(0);

/// Generate a new message id.
///
/// Layout (64 bits): 42-bit millisecond timestamp, 10-bit random component,
/// 12-bit per-millisecond counter.
pub fn generate() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;

    let counter = COUNTER.fetch_add(1, Ordering::Relaxed) as u64;
    let random = rand::thread_rng().gen_range(0..1024u64);

    let id = ((millis & 0x3FF_FFFF_FFFF) << 22) | (random << 12) | (counter & 0xFFF);
    encode(id)
}

fn encode(mut value: u64) -> String {
    let mut out = [b'0'; 13];
    for slot in out.iter_mut().rev() {
        *slot = ALPHABET[(value & 0x1F) as usize];
        value >>= 5;
    }
    String::from_utf8(out.to_vec()).expect("alphabet is ASCII")
}

/// Decode an id back to its numeric form. Returns None for malformed input.
pub fn decode(s: &str) -> Option<u64> {
    if s.len() != 13 {
        return None;
    }
    let mut value: u64 = 0;
    for c in s.bytes() {
        let digit = ALPHABET.iter().position(|&a| a == c.to_ascii_uppercase())?;
        value = (value << 5) | digit as u64;
    }
    Some(value)
}

/// Millisecond timestamp embedded in an id.
pub fn timestamp_millis(s: &str) -> Option<u64> {
    decode(s).map(|v| v >> 22)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_shape() {
        let id = generate();
        assert_eq!(id.len(), 13);
        assert!(id.bytes().all(|b| ALPHABET.contains(&b)));
    }

    #[test]
    fn test_ids_sort_by_time() {
        let first = generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = generate();
        assert!(first < second);
    }

    #[test]
    fn test_decode_round_trip() {
        let id = generate();
        let value = decode(&id).unwrap();
        assert_eq!(encode(value), id);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert_eq!(decode(""), None);
        assert_eq!(decode("short"), None);
        assert_eq!(decode("!!!!!!!!!!!!!"), None);
    }

    #[test]
    fn test_embedded_timestamp_is_recent() {
        let before = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;
        let id = generate();
        let embedded = timestamp_millis(&id).unwrap();
        assert!(embedded >= before.saturating_sub(1000));
        assert!(embedded <= before + 1000);
    }

    #[test]
    fn test_no_duplicates_in_burst() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..2000 {
            assert!(seen.insert(generate()));
        }
    }
}
