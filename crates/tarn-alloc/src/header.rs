//! The fixed 24-byte file header.
//!
//! ```text
//! offset  size  field
//!      0     8  candidate top-ref, slot 0
//!      8     8  candidate top-ref, slot 1
//!     16     4  magic "T-DB"
//!     20     1  file-format version for slot 0
//!     21     1  file-format version for slot 1
//!     22     1  mnemonic flags
//!     23     1  selector (low bit picks the canonical slot)
//! ```
//!
//! The two candidate slots enable torn-write recovery: a commit writes the
//! inactive slot, syncs, then flips the selector byte. A crash between the
//! two steps leaves the previously-selected slot intact, so opening the file
//! always yields the state at commit V or V−1, never a mixture.

use tarn_error::{Result, TarnError};
use tarn_types::Ref;

/// Size of the file header in bytes.
pub const HEADER_SIZE: usize = 24;

/// The magic bytes at offset 16.
pub const MAGIC: [u8; 4] = *b"T-DB";

/// Current file-format version. Advances only when an incompatible layout
/// lands.
pub const CURRENT_FILE_FORMAT: u8 = 2;

/// Oldest file-format version this build can upgrade in place.
pub const MIN_UPGRADABLE_FILE_FORMAT: u8 = 1;

/// Decoded view of the file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub top_refs: [u64; 2],
    pub format_versions: [u8; 2],
    pub flags: u8,
    pub selector: u8,
}

impl FileHeader {
    /// Header of a freshly-created file: no top array yet, both slots at
    /// the current format.
    #[must_use]
    pub const fn new_file() -> Self {
        Self {
            top_refs: [0, 0],
            format_versions: [CURRENT_FILE_FORMAT, CURRENT_FILE_FORMAT],
            flags: 0,
            selector: 0,
        }
    }

    /// Decode a header, validating the magic.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(TarnError::invalid_database(format!(
                "file too small for header: {} bytes",
                bytes.len()
            )));
        }
        if bytes[16..20] != MAGIC {
            return Err(TarnError::invalid_database("bad magic (not a Tarn file)"));
        }
        Ok(Self {
            top_refs: [
                u64::from_le_bytes(bytes[0..8].try_into().expect("8 bytes")),
                u64::from_le_bytes(bytes[8..16].try_into().expect("8 bytes")),
            ],
            format_versions: [bytes[20], bytes[21]],
            flags: bytes[22],
            selector: bytes[23],
        })
    }

    /// Encode into the on-disk byte layout.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0_u8; HEADER_SIZE];
        out[0..8].copy_from_slice(&self.top_refs[0].to_le_bytes());
        out[8..16].copy_from_slice(&self.top_refs[1].to_le_bytes());
        out[16..20].copy_from_slice(&MAGIC);
        out[20] = self.format_versions[0];
        out[21] = self.format_versions[1];
        out[22] = self.flags;
        out[23] = self.selector;
        out
    }

    /// Index of the canonical slot.
    #[inline]
    #[must_use]
    pub const fn selected(&self) -> usize {
        (self.selector & 1) as usize
    }

    /// Whether the candidate top-ref in `slot` passes structural
    /// validation against a file of `file_size` bytes.
    #[must_use]
    pub fn slot_valid(&self, slot: usize, file_size: u64) -> bool {
        let top = self.top_refs[slot];
        // A zero top ref is valid: it is an empty database.
        top % 8 == 0 && top < file_size.max(HEADER_SIZE as u64)
    }

    /// Pick the top ref to use on open: the selected slot, falling back to
    /// the other slot if the selected one fails validation.
    ///
    /// Returns `(slot_index, top_ref, format_version)`.
    pub fn pick_slot(&self, file_size: u64) -> Result<(usize, Ref, u8)> {
        let first = self.selected();
        for slot in [first, 1 - first] {
            if self.slot_valid(slot, file_size) {
                let top = Ref::new(self.top_refs[slot]).expect("slot_valid checked alignment");
                return Ok((slot, top, self.format_versions[slot]));
            }
        }
        Err(TarnError::invalid_database(format!(
            "both top-ref slots invalid ({:#x}, {:#x}) for file size {file_size}",
            self.top_refs[0], self.top_refs[1]
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let hdr = FileHeader {
            top_refs: [24, 4096],
            format_versions: [2, 2],
            flags: 0,
            selector: 1,
        };
        let decoded = FileHeader::decode(&hdr.encode()).unwrap();
        assert_eq!(decoded, hdr);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut bytes = FileHeader::new_file().encode();
        bytes[17] = b'X';
        let err = FileHeader::decode(&bytes).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn truncated_rejected() {
        let err = FileHeader::decode(&[0_u8; 10]).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn torn_write_falls_back_to_other_slot() {
        // Selector points at slot 1, but slot 1 holds an unaligned ref
        // (a torn write). pick_slot must fall back to slot 0.
        let hdr = FileHeader {
            top_refs: [64, 61],
            format_versions: [2, 2],
            flags: 0,
            selector: 1,
        };
        let (slot, top, _) = hdr.pick_slot(4096).unwrap();
        assert_eq!(slot, 0);
        assert_eq!(top.get(), 64);
    }

    #[test]
    fn both_slots_bad_is_invalid_database() {
        let hdr = FileHeader {
            top_refs: [61, 1 << 40],
            format_versions: [2, 2],
            flags: 0,
            selector: 0,
        };
        assert!(hdr.pick_slot(4096).is_err());
    }

    #[test]
    fn empty_database_top_ref_is_valid() {
        let hdr = FileHeader::new_file();
        let (_, top, version) = hdr.pick_slot(HEADER_SIZE as u64).unwrap();
        assert!(top.is_none());
        assert_eq!(version, CURRENT_FILE_FORMAT);
    }
}
