//! Byte blobs: string and binary payloads referenced from column leaves.
//!
//! A blob is a plain node of width 8 whose size field is the byte length.
//! Blobs are immutable once written: replacing a string allocates a new
//! blob and frees the old one, which keeps copy-on-write trivially correct.

use tarn_alloc::SlabAlloc;
use tarn_error::{Result, TarnError};
use tarn_types::Ref;

use crate::header::{NODE_HEADER_SIZE, NodeFlags, NodeHeader};

/// Largest blob payload a single node can carry.
pub const MAX_BLOB_SIZE: usize = (u16::MAX as usize) * 8;

/// Write `bytes` as a fresh blob node and return its ref.
pub fn create(alloc: &mut SlabAlloc, bytes: &[u8]) -> Result<Ref> {
    if bytes.len() > MAX_BLOB_SIZE {
        return Err(TarnError::logic(format!(
            "blob of {} bytes exceeds the {MAX_BLOB_SIZE}-byte node limit",
            bytes.len()
        )));
    }
    let hdr = NodeHeader {
        flags: NodeFlags::NONE,
        width: 8,
        cap_words: u16::try_from(bytes.len().div_ceil(8).max(1)).expect("checked above"),
        size: u32::try_from(bytes.len()).expect("checked above"),
    };
    let ref_ = alloc.alloc(hdr.byte_size())?;
    hdr.write(alloc, ref_)?;
    alloc.translate_mut(ref_)?[NODE_HEADER_SIZE..NODE_HEADER_SIZE + bytes.len()]
        .copy_from_slice(bytes);
    Ok(ref_)
}

/// Read a blob's payload.
pub fn read(alloc: &SlabAlloc, ref_: Ref) -> Result<&[u8]> {
    let hdr = NodeHeader::read(alloc, ref_)?;
    let bytes = alloc.translate(ref_)?;
    Ok(&bytes[NODE_HEADER_SIZE..NODE_HEADER_SIZE + hdr.size as usize])
}

/// Free a blob node.
pub fn free(alloc: &mut SlabAlloc, ref_: Ref) -> Result<()> {
    let hdr = NodeHeader::read(alloc, ref_)?;
    alloc.free(ref_, hdr.byte_size());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut alloc = SlabAlloc::new_scratch();
        let r = create(&mut alloc, b"hello radix").unwrap();
        assert_eq!(read(&alloc, r).unwrap(), b"hello radix");
    }

    #[test]
    fn empty_blob_is_distinct_from_missing() {
        let mut alloc = SlabAlloc::new_scratch();
        let r = create(&mut alloc, b"").unwrap();
        assert!(r.is_some());
        assert_eq!(read(&alloc, r).unwrap(), b"");
    }

    #[test]
    fn free_returns_space() {
        let mut alloc = SlabAlloc::new_scratch();
        let r = create(&mut alloc, &[7_u8; 100]).unwrap();
        free(&mut alloc, r).unwrap();
        assert!(alloc.free_space_snapshot().iter().any(|e| e.pos == r.get()));
    }
}
