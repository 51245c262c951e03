//! Key encoding: from [`Mixed`] values to bitwise chunks.
//!
//! Values are first encoded into an order-preserving byte string, then cut
//! into [`CHUNK_WIDTH`]-bit chunks read left to right. Integers are
//! sign-flipped and big-endian so ascending numeric order equals ascending
//! chunk order. Strings are raw UTF-8 bytes with embedded zeros escaped as
//! `00 FF` and a `00 00` terminator, which keeps byte order and makes every
//! encoding prefix-free: no key's chunk sequence is a prefix of another's.
//!
//! Null encodes to no chunks at all and lives in the root node's nulls
//! slot.

use smallvec::SmallVec;
use tarn_types::Mixed;

/// Bits consumed per tree level.
pub const CHUNK_WIDTH: u32 = 6;

/// Number of distinct chunk values.
pub const CHUNK_VALUES: usize = 1 << CHUNK_WIDTH;

// Two 63-bit population bitmaps cover at most 126 chunk values; a wider
// chunk would need a third population slot and a new file format.
const _: () = assert!(CHUNK_VALUES <= 126);

/// A fully-encoded index key: the chunk sequence of one value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct IndexKey {
    chunks: SmallVec<[u8; 24]>,
}

impl IndexKey {
    /// Encode a value, or `None` for null (null has no chunks).
    #[must_use]
    pub fn from_mixed(value: &Mixed) -> Option<Self> {
        let mut bytes: SmallVec<[u8; 18]> = SmallVec::new();
        match value {
            Mixed::Null => return None,
            Mixed::Int(v) => bytes.extend_from_slice(&sign_flip(*v).to_be_bytes()),
            Mixed::Bool(v) => bytes.push(u8::from(*v)),
            Mixed::String(s) => {
                for &b in s.as_bytes() {
                    bytes.push(b);
                    if b == 0 {
                        bytes.push(0xFF);
                    }
                }
                bytes.push(0);
                bytes.push(0);
            }
            Mixed::Timestamp(ts) => {
                bytes.extend_from_slice(&sign_flip(ts.seconds).to_be_bytes());
                bytes.extend_from_slice(&(ts.nanoseconds as u32 ^ 0x8000_0000).to_be_bytes());
            }
            Mixed::ObjectId(oid) => bytes.extend_from_slice(&oid.0),
            Mixed::Uuid(uuid) => bytes.extend_from_slice(&uuid.0),
            // Remaining types are not indexable; the schema layer rejects
            // them before an index is ever built.
            _ => return None,
        }
        Some(Self::from_bytes(&bytes))
    }

    /// Cut an encoded byte string into chunks, padding the final partial
    /// chunk with zero bits on the right.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let total_bits = bytes.len() * 8;
        let n_chunks = total_bits.div_ceil(CHUNK_WIDTH as usize);
        let mut chunks = SmallVec::with_capacity(n_chunks);
        for j in 0..n_chunks {
            let bit = j * CHUNK_WIDTH as usize;
            let mut acc = 0_u16;
            for b in 0..CHUNK_WIDTH as usize {
                let pos = bit + b;
                let set = pos < total_bits && bytes[pos / 8] & (0x80 >> (pos % 8)) != 0;
                acc = (acc << 1) | u16::from(set);
            }
            chunks.push(acc as u8);
        }
        Self { chunks }
    }

    /// The chunk sequence.
    #[must_use]
    pub fn chunks(&self) -> &[u8] {
        &self.chunks
    }
}

/// Map a signed value onto `u64` so unsigned order equals signed order.
#[inline]
#[must_use]
pub const fn sign_flip(v: i64) -> u64 {
    (v as u64) ^ (1 << 63)
}

/// Inverse of [`sign_flip`].
#[inline]
#[must_use]
pub const fn sign_unflip(v: u64) -> i64 {
    (v ^ (1 << 63)) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_keys_have_fixed_chunk_count() {
        for v in [i64::MIN, -1, 0, 1, i64::MAX] {
            let key = IndexKey::from_mixed(&Mixed::Int(v)).unwrap();
            assert_eq!(key.chunks().len(), 11, "64 bits cut into 6-bit chunks");
            assert!(key.chunks().iter().all(|&c| (c as usize) < CHUNK_VALUES));
        }
    }

    #[test]
    fn int_order_matches_chunk_order() {
        let values = [i64::MIN, -100, -1, 0, 1, 5, 1000, i64::MAX];
        let keys: Vec<IndexKey> = values
            .iter()
            .map(|v| IndexKey::from_mixed(&Mixed::Int(*v)).unwrap())
            .collect();
        for pair in keys.windows(2) {
            assert!(pair[0] < pair[1], "chunk order must follow numeric order");
        }
    }

    #[test]
    fn null_has_no_key() {
        assert!(IndexKey::from_mixed(&Mixed::Null).is_none());
    }

    #[test]
    fn string_encoding_is_prefix_free() {
        let a = IndexKey::from_mixed(&Mixed::from("ab")).unwrap();
        let b = IndexKey::from_mixed(&Mixed::from("abc")).unwrap();
        assert!(!b.chunks().starts_with(a.chunks()));
        assert!(a < b);

        // Embedded NUL: escaping keeps the encodings distinct.
        let nul = IndexKey::from_mixed(&Mixed::from("ab\0")).unwrap();
        assert!(!nul.chunks().starts_with(a.chunks()));
        assert_ne!(nul.chunks(), a.chunks());
    }

    #[test]
    fn empty_string_is_a_real_key() {
        let key = IndexKey::from_mixed(&Mixed::from("")).unwrap();
        assert!(!key.chunks().is_empty(), "empty string is not null");
    }

    #[test]
    fn bool_keys() {
        let f = IndexKey::from_mixed(&Mixed::Bool(false)).unwrap();
        let t = IndexKey::from_mixed(&Mixed::Bool(true)).unwrap();
        assert_ne!(f, t);
        assert!(f < t);
    }

    #[test]
    fn sign_flip_round_trip() {
        for v in [i64::MIN, -1, 0, 1, i64::MAX] {
            assert_eq!(sign_unflip(sign_flip(v)), v);
        }
        assert!(sign_flip(-1) < sign_flip(0));
        assert!(sign_flip(0) < sign_flip(1));
    }
}
