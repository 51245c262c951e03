//! The packed array: the universal node of the forest.
//!
//! Every on-disk structure above the allocator is built from these nodes.
//! An array holds `size` unsigned integers of a uniform bit width; `set`
//! transparently widens the whole node when a value no longer fits. Arrays
//! carrying the has-refs flag store ref-or-tagged elements at a fixed
//! width of 64 bits, so a child ref can always be patched into its parent
//! slot without re-widening the parent.
//!
//! Mutations are copy-on-write: a node reachable from a prior snapshot is
//! never written in place. The accessor copies it, frees the old ref
//! against the current version, and patches its recorded parent slot.

use tarn_alloc::SlabAlloc;
use tarn_error::{Result, TarnError};
use tarn_types::{Ref, RefOrTagged};
use tracing::trace;

use crate::header::{NODE_HEADER_SIZE, NodeFlags, NodeHeader, bits_needed};

/// The `(parent node, child index)` slot that owns an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentSlot {
    pub node: Ref,
    pub index: usize,
}

/// What kind of node to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayKind {
    /// Width-packed integer payload.
    Plain,
    /// Ref-or-tagged elements (interior nodes of general structures).
    WithRefs,
    /// Ref-or-tagged elements of a search-index node (context flag set).
    IndexNode,
    /// Ref-or-tagged elements of a B+tree interior node.
    BpTreeInner,
}

impl ArrayKind {
    const fn flags(self) -> NodeFlags {
        match self {
            Self::Plain => NodeFlags::new(0),
            Self::WithRefs => NodeFlags::new(NodeFlags::HAS_REFS),
            Self::IndexNode => NodeFlags::new(NodeFlags::HAS_REFS | NodeFlags::CONTEXT),
            Self::BpTreeInner => NodeFlags::new(NodeFlags::HAS_REFS | NodeFlags::INNER_BPTREE),
        }
    }
}

const fn words_for(count: usize, width: u8) -> u16 {
    let bits = count * width as usize;
    let words = bits.div_ceil(64);
    // Capacity is at least one word so an empty node can grow in place.
    if words == 0 { 1 } else if words > u16::MAX as usize { u16::MAX } else { words as u16 }
}

fn get_bits(payload: &[u8], i: usize, width: u8) -> u64 {
    match width {
        0 => 0,
        8 => u64::from(payload[i]),
        16 => u64::from(u16::from_le_bytes([payload[i * 2], payload[i * 2 + 1]])),
        32 => u64::from(u32::from_le_bytes(
            payload[i * 4..i * 4 + 4].try_into().expect("4 bytes"),
        )),
        64 => u64::from_le_bytes(payload[i * 8..i * 8 + 8].try_into().expect("8 bytes")),
        w => {
            // Sub-byte widths divide 8, so an element never crosses a byte.
            let bit = i * w as usize;
            let shift = (bit % 8) as u32;
            let mask = (1_u8 << w) - 1;
            u64::from((payload[bit / 8] >> shift) & mask)
        }
    }
}

fn set_bits(payload: &mut [u8], i: usize, width: u8, value: u64) {
    match width {
        0 => debug_assert_eq!(value, 0),
        8 => payload[i] = value as u8,
        16 => payload[i * 2..i * 2 + 2].copy_from_slice(&(value as u16).to_le_bytes()),
        32 => payload[i * 4..i * 4 + 4].copy_from_slice(&(value as u32).to_le_bytes()),
        64 => payload[i * 8..i * 8 + 8].copy_from_slice(&value.to_le_bytes()),
        w => {
            let bit = i * w as usize;
            let shift = (bit % 8) as u32;
            let mask = ((1_u8 << w) - 1) << shift;
            let byte = &mut payload[bit / 8];
            *byte = (*byte & !mask) | (((value as u8) << shift) & mask);
        }
    }
}

/// Accessor over one node of the forest.
#[derive(Debug, Clone)]
pub struct Array {
    ref_: Ref,
    hdr: NodeHeader,
    parent: Option<ParentSlot>,
}

impl Array {
    /// Create a new node of `count` elements, all set to `initial`.
    pub fn create(
        alloc: &mut SlabAlloc,
        kind: ArrayKind,
        count: usize,
        initial: u64,
    ) -> Result<Self> {
        let flags = kind.flags();
        let width = if flags.has_refs() {
            64
        } else {
            bits_needed(initial)
        };
        let hdr = NodeHeader {
            flags,
            width,
            cap_words: words_for(count, width),
            size: u32::try_from(count).map_err(|_| TarnError::logic("array too large"))?,
        };
        let ref_ = alloc.alloc(hdr.byte_size())?;
        hdr.write(alloc, ref_)?;
        let mut array = Self {
            ref_,
            hdr,
            parent: None,
        };
        if initial != 0 {
            let payload = array.payload_mut(alloc)?;
            for i in 0..count {
                set_bits(payload, i, width, initial);
            }
        }
        Ok(array)
    }

    /// Bind an accessor to an existing node.
    pub fn init_from_ref(alloc: &SlabAlloc, ref_: Ref) -> Result<Self> {
        let hdr = NodeHeader::read(alloc, ref_)?;
        Ok(Self {
            ref_,
            hdr,
            parent: None,
        })
    }

    /// Record the parent slot that owns this node.
    pub fn set_parent(&mut self, parent: ParentSlot) {
        self.parent = Some(parent);
    }

    /// The node's current ref. Changes when copy-on-write relocates it.
    #[inline]
    #[must_use]
    pub fn ref_(&self) -> Ref {
        self.ref_
    }

    /// Number of elements.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.hdr.size as usize
    }

    /// Whether the node has no elements.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hdr.size == 0
    }

    /// The node's flags.
    #[inline]
    #[must_use]
    pub fn flags(&self) -> NodeFlags {
        self.hdr.flags
    }

    /// Current element width in bits.
    #[inline]
    #[must_use]
    pub fn width(&self) -> u8 {
        self.hdr.width
    }

    /// Total node size in bytes.
    #[inline]
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.hdr.byte_size()
    }

    fn payload<'a>(&self, alloc: &'a SlabAlloc) -> Result<&'a [u8]> {
        let bytes = alloc.translate(self.ref_)?;
        Ok(&bytes[NODE_HEADER_SIZE..self.hdr.byte_size()])
    }

    fn payload_mut<'a>(&self, alloc: &'a mut SlabAlloc) -> Result<&'a mut [u8]> {
        let byte_size = self.hdr.byte_size();
        let bytes = alloc.translate_mut(self.ref_)?;
        Ok(&mut bytes[NODE_HEADER_SIZE..byte_size])
    }

    fn check_bounds(&self, i: usize) -> Result<()> {
        if i >= self.size() {
            return Err(TarnError::OutOfBounds {
                what: "array index",
                index: i,
                size: self.size(),
            });
        }
        Ok(())
    }

    /// Read element `i`.
    pub fn get(&self, alloc: &SlabAlloc, i: usize) -> Result<u64> {
        self.check_bounds(i)?;
        Ok(get_bits(self.payload(alloc)?, i, self.hdr.width))
    }

    /// Read element `i` as a ref-or-tagged value.
    pub fn get_rot(&self, alloc: &SlabAlloc, i: usize) -> Result<RefOrTagged> {
        Ok(RefOrTagged::unpack(self.get(alloc, i)?))
    }

    /// Write the header (size field) back after a mutation.
    fn write_header(&self, alloc: &mut SlabAlloc) -> Result<()> {
        self.hdr.write(alloc, self.ref_)
    }

    /// Patch this node's new ref into its recorded parent slot.
    ///
    /// The parent must already be shadowed by the transaction: mutation
    /// proceeds top-down, so by the time a child relocates, its parent is
    /// writable and stores refs at width 64.
    fn update_parent(&self, alloc: &mut SlabAlloc) -> Result<()> {
        let Some(slot) = self.parent else {
            return Ok(());
        };
        if !alloc.is_writable(slot.node) {
            return Err(TarnError::logic(format!(
                "child at {} relocated under an unshadowed parent {}",
                self.ref_, slot.node
            )));
        }
        let parent_hdr = NodeHeader::read(alloc, slot.node)?;
        debug_assert!(parent_hdr.flags.has_refs());
        debug_assert_eq!(parent_hdr.width, 64);
        let bytes = alloc.translate_mut(slot.node)?;
        let at = NODE_HEADER_SIZE + slot.index * 8;
        bytes[at..at + 8].copy_from_slice(&self.ref_.get().to_le_bytes());
        Ok(())
    }

    /// Shadow the node if it is still part of a committed snapshot.
    fn ensure_writable(&mut self, alloc: &mut SlabAlloc) -> Result<()> {
        if alloc.is_writable(self.ref_) {
            return Ok(());
        }
        let byte_size = self.hdr.byte_size();
        let new_ref = alloc.alloc(byte_size)?;
        let src: Vec<u8> = alloc.translate(self.ref_)?[..byte_size].to_vec();
        alloc.translate_mut(new_ref)?[..byte_size].copy_from_slice(&src);
        alloc.free(self.ref_, byte_size);
        trace!(old = %self.ref_, new = %new_ref, "copy-on-write");
        self.ref_ = new_ref;
        self.update_parent(alloc)
    }

    /// Relocate into a node of `new_width` with room for `new_count`
    /// elements, re-encoding the payload.
    fn realloc(&mut self, alloc: &mut SlabAlloc, new_count: usize, new_width: u8) -> Result<()> {
        let old_values: Vec<u64> = {
            let payload = self.payload(alloc)?;
            (0..self.size())
                .map(|i| get_bits(payload, i, self.hdr.width))
                .collect()
        };
        // Grow capacity geometrically so repeated pushes stay cheap.
        let wanted = words_for(new_count, new_width);
        let doubled = self.hdr.cap_words.saturating_mul(2);
        let new_hdr = NodeHeader {
            flags: self.hdr.flags,
            width: new_width,
            cap_words: wanted.max(doubled),
            size: self.hdr.size,
        };
        let new_ref = alloc.alloc(new_hdr.byte_size())?;
        new_hdr.write(alloc, new_ref)?;
        {
            let bytes = alloc.translate_mut(new_ref)?;
            let payload = &mut bytes[NODE_HEADER_SIZE..new_hdr.byte_size()];
            for (i, v) in old_values.iter().enumerate() {
                set_bits(payload, i, new_width, *v);
            }
        }
        alloc.free(self.ref_, self.hdr.byte_size());
        self.ref_ = new_ref;
        self.hdr = new_hdr;
        self.update_parent(alloc)
    }

    /// Make sure `count` elements of values up to `value` fit, shadowing,
    /// widening, and growing as needed.
    fn reserve(&mut self, alloc: &mut SlabAlloc, count: usize, value: u64) -> Result<()> {
        self.ensure_writable(alloc)?;
        let needed_width = if self.hdr.flags.has_refs() {
            64
        } else {
            bits_needed(value).max(self.hdr.width)
        };
        let fits_width = needed_width <= self.hdr.width;
        let fits_cap = words_for(count, needed_width) <= self.hdr.cap_words;
        if !fits_width || !fits_cap {
            self.realloc(alloc, count, needed_width)?;
        }
        Ok(())
    }

    /// Write element `i`, widening the node transparently if needed.
    pub fn set(&mut self, alloc: &mut SlabAlloc, i: usize, value: u64) -> Result<()> {
        self.check_bounds(i)?;
        self.reserve(alloc, self.size(), value)?;
        let width = self.hdr.width;
        set_bits(self.payload_mut(alloc)?, i, width, value);
        Ok(())
    }

    /// Write element `i` as a ref-or-tagged value.
    pub fn set_rot(&mut self, alloc: &mut SlabAlloc, i: usize, value: RefOrTagged) -> Result<()> {
        self.set(alloc, i, value.pack())
    }

    /// Insert `value` before position `i` (or at the end when `i == size`).
    pub fn insert(&mut self, alloc: &mut SlabAlloc, i: usize, value: u64) -> Result<()> {
        let size = self.size();
        if i > size {
            return Err(TarnError::OutOfBounds {
                what: "array insert position",
                index: i,
                size,
            });
        }
        self.reserve(alloc, size + 1, value)?;
        let width = self.hdr.width;
        let payload = self.payload_mut(alloc)?;
        for j in (i..size).rev() {
            let v = get_bits(payload, j, width);
            set_bits(payload, j + 1, width, v);
        }
        set_bits(payload, i, width, value);
        self.hdr.size += 1;
        self.write_header(alloc)
    }

    /// Append `value`.
    pub fn push(&mut self, alloc: &mut SlabAlloc, value: u64) -> Result<()> {
        self.insert(alloc, self.size(), value)
    }

    /// Append a ref-or-tagged value.
    pub fn push_rot(&mut self, alloc: &mut SlabAlloc, value: RefOrTagged) -> Result<()> {
        self.push(alloc, value.pack())
    }

    /// Remove element `i`, shifting the tail left.
    pub fn erase(&mut self, alloc: &mut SlabAlloc, i: usize) -> Result<()> {
        self.check_bounds(i)?;
        self.ensure_writable(alloc)?;
        let size = self.size();
        let width = self.hdr.width;
        let payload = self.payload_mut(alloc)?;
        for j in i..size - 1 {
            let v = get_bits(payload, j + 1, width);
            set_bits(payload, j, width, v);
        }
        self.hdr.size -= 1;
        self.write_header(alloc)
    }

    /// Drop all elements past `n`.
    pub fn truncate(&mut self, alloc: &mut SlabAlloc, n: usize) -> Result<()> {
        if n >= self.size() {
            return Ok(());
        }
        self.ensure_writable(alloc)?;
        self.hdr.size = u32::try_from(n).expect("shrinking");
        self.write_header(alloc)
    }

    /// Free this node and, on ref-carrying nodes, every node reachable
    /// through its untagged child slots.
    ///
    /// Plain nodes never recurse: a column leaf's blob children are owned
    /// and freed by the cluster layer, not by the forest.
    pub fn destroy_deep(self, alloc: &mut SlabAlloc) -> Result<()> {
        if self.hdr.flags.has_refs() {
            for i in 0..self.size() {
                if let RefOrTagged::Ref(child) = self.get_rot(alloc, i)? {
                    if child.is_some() {
                        Array::init_from_ref(alloc, child)?.destroy_deep(alloc)?;
                    }
                }
            }
        }
        alloc.free(self.ref_, self.hdr.byte_size());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn scratch() -> SlabAlloc {
        SlabAlloc::new_scratch()
    }

    #[test]
    fn create_get_set() {
        let mut alloc = scratch();
        let mut a = Array::create(&mut alloc, ArrayKind::Plain, 4, 0).unwrap();
        assert_eq!(a.size(), 4);
        assert_eq!(a.width(), 0);
        for i in 0..4 {
            assert_eq!(a.get(&alloc, i).unwrap(), 0);
        }
        a.set(&mut alloc, 2, 9).unwrap();
        assert_eq!(a.get(&alloc, 2).unwrap(), 9);
        assert_eq!(a.get(&alloc, 1).unwrap(), 0);
    }

    #[test]
    fn widening_preserves_values() {
        let mut alloc = scratch();
        let mut a = Array::create(&mut alloc, ArrayKind::Plain, 0, 0).unwrap();
        a.push(&mut alloc, 1).unwrap();
        assert_eq!(a.width(), 1);
        a.push(&mut alloc, 3).unwrap();
        assert_eq!(a.width(), 2);
        a.push(&mut alloc, 200).unwrap();
        assert_eq!(a.width(), 8);
        a.push(&mut alloc, 70_000).unwrap();
        assert_eq!(a.width(), 32);
        a.push(&mut alloc, u64::MAX).unwrap();
        assert_eq!(a.width(), 64);
        let expected = [1, 3, 200, 70_000, u64::MAX];
        for (i, want) in expected.iter().enumerate() {
            assert_eq!(a.get(&alloc, i).unwrap(), *want);
        }
    }

    #[test]
    fn insert_erase_shift() {
        let mut alloc = scratch();
        let mut a = Array::create(&mut alloc, ArrayKind::Plain, 0, 0).unwrap();
        for v in [10_u64, 20, 30] {
            a.push(&mut alloc, v).unwrap();
        }
        a.insert(&mut alloc, 1, 15).unwrap();
        let got: Vec<u64> = (0..a.size()).map(|i| a.get(&alloc, i).unwrap()).collect();
        assert_eq!(got, vec![10, 15, 20, 30]);
        a.erase(&mut alloc, 2).unwrap();
        let got: Vec<u64> = (0..a.size()).map(|i| a.get(&alloc, i).unwrap()).collect();
        assert_eq!(got, vec![10, 15, 30]);
    }

    #[test]
    fn out_of_bounds_reported() {
        let mut alloc = scratch();
        let a = Array::create(&mut alloc, ArrayKind::Plain, 2, 0).unwrap();
        let err = a.get(&alloc, 2).unwrap_err();
        assert!(matches!(err, TarnError::OutOfBounds { index: 2, size: 2, .. }));
    }

    #[test]
    fn ref_arrays_are_width_64() {
        let mut alloc = scratch();
        let a = Array::create(&mut alloc, ArrayKind::WithRefs, 3, 0).unwrap();
        assert_eq!(a.width(), 64);
        assert!(a.flags().has_refs());
    }

    #[test]
    fn copy_on_write_relocates_and_patches_parent() {
        let mut alloc = scratch();
        let mut parent = Array::create(&mut alloc, ArrayKind::WithRefs, 1, 0).unwrap();
        let mut child = Array::create(&mut alloc, ArrayKind::Plain, 1, 0).unwrap();
        child.set(&mut alloc, 0, 7).unwrap();
        parent
            .set_rot(&mut alloc, 0, RefOrTagged::Ref(child.ref_()))
            .unwrap();
        alloc.commit(parent.ref_()).unwrap();
        alloc.begin_write(tarn_types::VersionId(1)).unwrap();

        // Shadow the parent first (top-down), then mutate the child.
        parent.ensure_writable(&mut alloc).unwrap();
        let mut child = Array::init_from_ref(&alloc, match parent.get_rot(&alloc, 0).unwrap() {
            RefOrTagged::Ref(r) => r,
            RefOrTagged::Tagged(_) => unreachable!(),
        })
        .unwrap();
        child.set_parent(ParentSlot {
            node: parent.ref_(),
            index: 0,
        });
        let old_child_ref = child.ref_();
        child.set(&mut alloc, 0, 8).unwrap();
        assert_ne!(child.ref_(), old_child_ref, "committed node must relocate");
        assert_eq!(
            parent.get_rot(&alloc, 0).unwrap(),
            RefOrTagged::Ref(child.ref_()),
            "parent slot must follow the relocated child"
        );
        // The committed image still holds the old value.
        let old_child = Array::init_from_ref(&alloc, old_child_ref).unwrap();
        assert_eq!(old_child.get(&alloc, 0).unwrap(), 7);
    }

    #[test]
    fn destroy_deep_frees_subtree() {
        let mut alloc = scratch();
        let mut parent = Array::create(&mut alloc, ArrayKind::WithRefs, 0, 0).unwrap();
        let child = Array::create(&mut alloc, ArrayKind::Plain, 10, 1).unwrap();
        parent
            .push_rot(&mut alloc, RefOrTagged::Ref(child.ref_()))
            .unwrap();
        parent.push_rot(&mut alloc, RefOrTagged::Tagged(42)).unwrap();
        let child_pos = child.ref_().get();
        parent.destroy_deep(&mut alloc).unwrap();
        let free = alloc.free_space_snapshot();
        assert!(free.iter().any(|e| e.pos == child_pos));
    }

    proptest! {
        #[test]
        fn matches_vec_oracle(ops in prop::collection::vec(
            (0_u8..4, 0_usize..64, prop::num::u64::ANY), 0..200,
        )) {
            let mut alloc = scratch();
            let mut a = Array::create(&mut alloc, ArrayKind::Plain, 0, 0).unwrap();
            let mut oracle: Vec<u64> = Vec::new();
            for (op, pos, value) in ops {
                match op {
                    0 => {
                        let i = pos % (oracle.len() + 1);
                        a.insert(&mut alloc, i, value).unwrap();
                        oracle.insert(i, value);
                    }
                    1 if !oracle.is_empty() => {
                        let i = pos % oracle.len();
                        a.set(&mut alloc, i, value).unwrap();
                        oracle[i] = value;
                    }
                    2 if !oracle.is_empty() => {
                        let i = pos % oracle.len();
                        a.erase(&mut alloc, i).unwrap();
                        oracle.remove(i);
                    }
                    _ => {
                        a.push(&mut alloc, value).unwrap();
                        oracle.push(value);
                    }
                }
                prop_assert_eq!(a.size(), oracle.len());
            }
            let got: Vec<u64> = (0..a.size()).map(|i| a.get(&alloc, i).unwrap()).collect();
            prop_assert_eq!(got, oracle);
        }
    }
}
