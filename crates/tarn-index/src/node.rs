//! The packed layout of one index node, and the sorted ObjKey lists hung
//! off duplicate slots.
//!
//! Node layout (slot order is part of the file format):
//!
//! ```text
//! 0  population bitmap for chunks 0..=62   (tagged)
//! 1  population bitmap for chunks 63..    (tagged)
//! 2  prefix size in chunks                (tagged)
//! 3  prefix payload: inline chunks or ref (tagged or ref)
//! 4  nulls slot: 0, tagged ObjKey, or ref (root only)
//! 5.. one ref-or-tagged child per populated chunk, ascending
//! ```
//!
//! A child entry is a tagged ObjKey (one row, full key consumed), a ref to
//! a sorted list (duplicates or a tombstone key), or a ref to another
//! index node. The context flag on the referenced header discriminates the
//! two ref cases.

use tarn_alloc::SlabAlloc;
use tarn_error::{Result, TarnError};
use tarn_node::{Array, ArrayKind};
use tarn_types::{ObjKey, Ref, RefOrTagged};

use crate::key::{sign_flip, sign_unflip};

/// Slot of the first population bitmap.
pub const NDX_POP0: usize = 0;
/// Slot of the second population bitmap.
pub const NDX_POP1: usize = 1;
/// Slot of the prefix size.
pub const NDX_PREFIX_SIZE: usize = 2;
/// Slot of the prefix payload.
pub const NDX_PREFIX_PAYLOAD: usize = 3;
/// Slot of the nulls entry.
pub const NDX_NULLS: usize = 4;
/// Number of metadata slots before the children area.
pub const METADATA_SLOTS: usize = 5;

/// Longest prefix (in chunks) that still packs into the inline payload.
pub const MAX_INLINE_PREFIX: usize = 10;

/// A decoded child entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    /// Exactly one row whose full key ends at this slot.
    Single(ObjKey),
    /// Sorted list of rows sharing the full key (or one tombstone).
    DupList(Ref),
    /// The key continues in a deeper node.
    Subnode(Ref),
}

impl Entry {
    /// Decode a raw slot value, consulting the referenced header's context
    /// flag to tell lists from subnodes.
    pub fn decode(alloc: &SlabAlloc, raw: RefOrTagged) -> Result<Self> {
        match raw {
            RefOrTagged::Tagged(v) => Ok(Self::Single(ObjKey(v))),
            RefOrTagged::Ref(r) => {
                let child = Array::init_from_ref(alloc, r)?;
                if child.flags().is_context() {
                    Ok(Self::Subnode(r))
                } else {
                    Ok(Self::DupList(r))
                }
            }
        }
    }

    /// Encode into a raw slot value.
    #[must_use]
    pub fn encode(self) -> RefOrTagged {
        match self {
            Self::Single(k) => RefOrTagged::Tagged(k.0),
            Self::DupList(r) | Self::Subnode(r) => RefOrTagged::Ref(r),
        }
    }
}

/// Whether an ObjKey may be stored inline as a tagged entry.
///
/// Tombstones (negative keys) never fit: their 64-bit form has the high
/// bit set, so they always go through a list node.
#[must_use]
pub fn fits_inline(key: ObjKey) -> bool {
    key.0 >= 0 && RefOrTagged::fits(key.0)
}

/// View over one index node.
#[derive(Debug)]
pub struct IndexNode {
    pub array: Array,
}

impl IndexNode {
    /// Create an empty node (metadata slots only).
    pub fn create(alloc: &mut SlabAlloc) -> Result<Self> {
        let mut array = Array::create(alloc, ArrayKind::IndexNode, 0, 0)?;
        array.push_rot(alloc, RefOrTagged::Tagged(0))?; // pop 0
        array.push_rot(alloc, RefOrTagged::Tagged(0))?; // pop 1
        array.push_rot(alloc, RefOrTagged::Tagged(0))?; // prefix size
        array.push_rot(alloc, RefOrTagged::Tagged(0))?; // prefix payload
        array.push(alloc, 0)?; // nulls
        Ok(Self { array })
    }

    /// Bind to an existing node.
    pub fn bind(alloc: &SlabAlloc, ref_: Ref) -> Result<Self> {
        let array = Array::init_from_ref(alloc, ref_)?;
        if !array.flags().is_context() {
            return Err(TarnError::invalid_database(format!(
                "node at {ref_} is not an index node"
            )));
        }
        Ok(Self { array })
    }

    /// The node's current ref.
    #[must_use]
    pub fn ref_(&self) -> Ref {
        self.array.ref_()
    }

    fn tagged_at(&self, alloc: &SlabAlloc, slot: usize) -> Result<i64> {
        match self.array.get_rot(alloc, slot)? {
            RefOrTagged::Tagged(v) => Ok(v),
            RefOrTagged::Ref(_) => Err(TarnError::invalid_database(
                "index metadata slot holds a ref where a tagged value is required",
            )),
        }
    }

    /// One population bitmap (0 or 1).
    pub fn population(&self, alloc: &SlabAlloc, which: usize) -> Result<u64> {
        Ok(self.tagged_at(alloc, NDX_POP0 + which)? as u64)
    }

    fn set_population(&mut self, alloc: &mut SlabAlloc, which: usize, bits: u64) -> Result<()> {
        self.array
            .set_rot(alloc, NDX_POP0 + which, RefOrTagged::Tagged(bits as i64))
    }

    /// Whether `chunk` has a child slot.
    pub fn has_chunk(&self, alloc: &SlabAlloc, chunk: u8) -> Result<bool> {
        let (which, bit) = split_chunk(chunk);
        Ok(self.population(alloc, which)? & (1 << bit) != 0)
    }

    /// Number of populated child slots.
    pub fn child_count(&self, alloc: &SlabAlloc) -> Result<usize> {
        Ok((self.population(alloc, 0)?.count_ones() + self.population(alloc, 1)?.count_ones())
            as usize)
    }

    /// Absolute array slot of `chunk`'s child entry (valid only when the
    /// chunk's population bit is set).
    pub fn slot_of(&self, alloc: &SlabAlloc, chunk: u8) -> Result<usize> {
        let (which, bit) = split_chunk(chunk);
        let mut rank = if which == 1 {
            self.population(alloc, 0)?.count_ones() as usize
        } else {
            0
        };
        let pop = self.population(alloc, which)?;
        rank += (pop & ((1_u64 << bit) - 1)).count_ones() as usize;
        Ok(METADATA_SLOTS + rank)
    }

    /// Read the child entry for `chunk`.
    pub fn child(&self, alloc: &SlabAlloc, chunk: u8) -> Result<Entry> {
        let slot = self.slot_of(alloc, chunk)?;
        Entry::decode(alloc, self.array.get_rot(alloc, slot)?)
    }

    /// Overwrite the child entry for `chunk`.
    pub fn set_child(&mut self, alloc: &mut SlabAlloc, chunk: u8, entry: Entry) -> Result<()> {
        let slot = self.slot_of(alloc, chunk)?;
        self.array.set_rot(alloc, slot, entry.encode())
    }

    /// Insert a child entry for `chunk`, setting its population bit.
    pub fn insert_child(&mut self, alloc: &mut SlabAlloc, chunk: u8, entry: Entry) -> Result<()> {
        debug_assert!(!self.has_chunk(alloc, chunk)?);
        let slot = self.slot_of(alloc, chunk)?;
        self.array.insert(alloc, slot, entry.encode().pack())?;
        let (which, bit) = split_chunk(chunk);
        let pop = self.population(alloc, which)?;
        self.set_population(alloc, which, pop | (1 << bit))
    }

    /// Remove the child entry for `chunk`, clearing its population bit.
    pub fn remove_child(&mut self, alloc: &mut SlabAlloc, chunk: u8) -> Result<()> {
        let slot = self.slot_of(alloc, chunk)?;
        self.array.erase(alloc, slot)?;
        let (which, bit) = split_chunk(chunk);
        let pop = self.population(alloc, which)?;
        self.set_population(alloc, which, pop & !(1 << bit))
    }

    /// The node's compressed prefix, decoded to chunk values.
    pub fn prefix(&self, alloc: &SlabAlloc) -> Result<Vec<u8>> {
        let len = usize::try_from(self.tagged_at(alloc, NDX_PREFIX_SIZE)?)
            .map_err(|_| TarnError::invalid_database("negative index prefix size"))?;
        if len == 0 {
            return Ok(Vec::new());
        }
        match self.array.get_rot(alloc, NDX_PREFIX_PAYLOAD)? {
            RefOrTagged::Tagged(packed) => {
                let packed = packed as u64;
                let mut out = Vec::with_capacity(len);
                for i in 0..len {
                    out.push(((packed >> ((len - 1 - i) * 6)) & 0x3F) as u8);
                }
                Ok(out)
            }
            RefOrTagged::Ref(r) => {
                let list = Array::init_from_ref(alloc, r)?;
                let mut out = Vec::with_capacity(len);
                for i in 0..len {
                    out.push(list.get(alloc, i)? as u8);
                }
                Ok(out)
            }
        }
    }

    /// Replace the node's prefix, freeing a spilled payload list if any.
    pub fn set_prefix(&mut self, alloc: &mut SlabAlloc, chunks: &[u8]) -> Result<()> {
        if let RefOrTagged::Ref(old) = self.array.get_rot(alloc, NDX_PREFIX_PAYLOAD)? {
            if old.is_some() {
                Array::init_from_ref(alloc, old)?.destroy_deep(alloc)?;
            }
        }
        let payload = if chunks.len() <= MAX_INLINE_PREFIX {
            let mut packed = 0_u64;
            for &c in chunks {
                packed = (packed << 6) | u64::from(c);
            }
            RefOrTagged::Tagged(packed as i64)
        } else {
            let mut list = Array::create(alloc, ArrayKind::Plain, 0, 0)?;
            for &c in chunks {
                list.push(alloc, u64::from(c))?;
            }
            RefOrTagged::Ref(list.ref_())
        };
        self.array.set_rot(
            alloc,
            NDX_PREFIX_SIZE,
            RefOrTagged::Tagged(i64::try_from(chunks.len()).expect("prefix fits")),
        )?;
        self.array.set_rot(alloc, NDX_PREFIX_PAYLOAD, payload)
    }

    /// Raw nulls slot.
    pub fn nulls_raw(&self, alloc: &SlabAlloc) -> Result<RefOrTagged> {
        self.array.get_rot(alloc, NDX_NULLS)
    }

    /// Overwrite the nulls slot.
    pub fn set_nulls(&mut self, alloc: &mut SlabAlloc, value: RefOrTagged) -> Result<()> {
        self.array.set_rot(alloc, NDX_NULLS, value)
    }

    /// Whether the node holds nothing: both populations zero, nulls zero.
    pub fn is_empty(&self, alloc: &SlabAlloc) -> Result<bool> {
        Ok(self.population(alloc, 0)? == 0
            && self.population(alloc, 1)? == 0
            && self.nulls_raw(alloc)? == RefOrTagged::Ref(Ref::NONE))
    }

    /// Populated chunk values in ascending order.
    pub fn chunks(&self, alloc: &SlabAlloc) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for which in 0..2_usize {
            let mut pop = self.population(alloc, which)?;
            while pop != 0 {
                let bit = pop.trailing_zeros() as u8;
                out.push(bit + if which == 1 { 63 } else { 0 });
                pop &= pop - 1;
            }
        }
        Ok(out)
    }
}

const fn split_chunk(chunk: u8) -> (usize, u8) {
    if chunk < 63 {
        (0, chunk)
    } else {
        (1, chunk - 63)
    }
}

// ---------------------------------------------------------------------------
// Sorted ObjKey lists
// ---------------------------------------------------------------------------

/// Create a sorted list node holding `keys` (must be ascending).
pub fn list_create(alloc: &mut SlabAlloc, keys: &[ObjKey]) -> Result<Ref> {
    let mut list = Array::create(alloc, ArrayKind::Plain, 0, 0)?;
    for k in keys {
        list.push(alloc, sign_flip(k.0))?;
    }
    Ok(list.ref_())
}

/// All keys of a list, ascending.
pub fn list_keys(alloc: &SlabAlloc, ref_: Ref) -> Result<Vec<ObjKey>> {
    let list = Array::init_from_ref(alloc, ref_)?;
    (0..list.size())
        .map(|i| Ok(ObjKey(sign_unflip(list.get(alloc, i)?))))
        .collect()
}

/// Insert `key` in sorted position; duplicate inserts are a no-op.
/// Returns the (possibly relocated) list ref.
pub fn list_insert(alloc: &mut SlabAlloc, ref_: Ref, key: ObjKey) -> Result<Ref> {
    let mut list = Array::init_from_ref(alloc, ref_)?;
    let encoded = sign_flip(key.0);
    let mut at = list.size();
    for i in 0..list.size() {
        let v = list.get(alloc, i)?;
        if v == encoded {
            return Ok(list.ref_());
        }
        if v > encoded {
            at = i;
            break;
        }
    }
    list.insert(alloc, at, encoded)?;
    Ok(list.ref_())
}

/// Remove `key` from the list. Returns the remaining keys' new ref, or
/// `None` with the list freed when it became empty. The second field is
/// the remaining count.
pub fn list_erase(alloc: &mut SlabAlloc, ref_: Ref, key: ObjKey) -> Result<(Option<Ref>, usize)> {
    let mut list = Array::init_from_ref(alloc, ref_)?;
    let encoded = sign_flip(key.0);
    let mut found = None;
    for i in 0..list.size() {
        if list.get(alloc, i)? == encoded {
            found = Some(i);
            break;
        }
    }
    if let Some(i) = found {
        list.erase(alloc, i)?;
    }
    let remaining = list.size();
    if remaining == 0 {
        let size = list.byte_size();
        alloc.free(list.ref_(), size);
        Ok((None, 0))
    } else {
        Ok((Some(list.ref_()), remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_node_is_empty_with_metadata_slots() {
        let mut alloc = SlabAlloc::new_scratch();
        let node = IndexNode::create(&mut alloc).unwrap();
        assert!(node.is_empty(&alloc).unwrap());
        assert_eq!(node.array.size(), METADATA_SLOTS);
        assert!(node.prefix(&alloc).unwrap().is_empty());
    }

    #[test]
    fn population_and_slot_arithmetic() {
        let mut alloc = SlabAlloc::new_scratch();
        let mut node = IndexNode::create(&mut alloc).unwrap();
        for chunk in [5_u8, 0, 63, 17] {
            node.insert_child(&mut alloc, chunk, Entry::Single(ObjKey(i64::from(chunk))))
                .unwrap();
        }
        assert_eq!(node.child_count(&alloc).unwrap(), 4);
        assert_eq!(node.chunks(&alloc).unwrap(), vec![0, 5, 17, 63]);
        // Children sit in ascending chunk order right after the metadata.
        for (i, chunk) in [0_u8, 5, 17, 63].into_iter().enumerate() {
            assert_eq!(node.slot_of(&alloc, chunk).unwrap(), METADATA_SLOTS + i);
            assert_eq!(
                node.child(&alloc, chunk).unwrap(),
                Entry::Single(ObjKey(i64::from(chunk)))
            );
        }
        // P6: node size accounts for exactly the populated slots.
        assert_eq!(
            node.array.size(),
            METADATA_SLOTS
                + (node.population(&alloc, 0).unwrap().count_ones()
                    + node.population(&alloc, 1).unwrap().count_ones()) as usize
        );
    }

    #[test]
    fn remove_child_clears_bit() {
        let mut alloc = SlabAlloc::new_scratch();
        let mut node = IndexNode::create(&mut alloc).unwrap();
        node.insert_child(&mut alloc, 9, Entry::Single(ObjKey(1)))
            .unwrap();
        node.insert_child(&mut alloc, 30, Entry::Single(ObjKey(2)))
            .unwrap();
        node.remove_child(&mut alloc, 9).unwrap();
        assert!(!node.has_chunk(&alloc, 9).unwrap());
        assert!(node.has_chunk(&alloc, 30).unwrap());
        assert_eq!(node.child(&alloc, 30).unwrap(), Entry::Single(ObjKey(2)));
    }

    #[test]
    fn long_prefix_spills_to_a_list() {
        let mut alloc = SlabAlloc::new_scratch();
        let mut node = IndexNode::create(&mut alloc).unwrap();
        let prefix: Vec<u8> = (0..20).map(|i| i % 64).collect();
        node.set_prefix(&mut alloc, &prefix).unwrap();
        assert_eq!(node.prefix(&alloc).unwrap(), prefix);
        // Shrinking back to a short prefix frees the spilled list.
        node.set_prefix(&mut alloc, &[1, 2, 3]).unwrap();
        assert_eq!(node.prefix(&alloc).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn tombstones_never_fit_inline() {
        assert!(fits_inline(ObjKey(0)));
        assert!(fits_inline(ObjKey(42)));
        assert!(!fits_inline(ObjKey(-1)));
        assert!(!fits_inline(ObjKey(i64::MIN)));
    }

    #[test]
    fn sorted_list_round_trip() {
        let mut alloc = SlabAlloc::new_scratch();
        let r = list_create(&mut alloc, &[ObjKey(3)]).unwrap();
        let r = list_insert(&mut alloc, r, ObjKey(1)).unwrap();
        let r = list_insert(&mut alloc, r, ObjKey(7)).unwrap();
        let r = list_insert(&mut alloc, r, ObjKey(-4)).unwrap();
        // Duplicate insert is a no-op.
        let r = list_insert(&mut alloc, r, ObjKey(3)).unwrap();
        assert_eq!(
            list_keys(&alloc, r).unwrap(),
            vec![ObjKey(-4), ObjKey(1), ObjKey(3), ObjKey(7)]
        );
        let (r, n) = list_erase(&mut alloc, r, ObjKey(1)).unwrap();
        assert_eq!(n, 3);
        let (r, n) = list_erase(&mut alloc, r.unwrap(), ObjKey(-4)).unwrap();
        assert_eq!(n, 2);
        let (r, _) = list_erase(&mut alloc, r.unwrap(), ObjKey(3)).unwrap();
        let (r, n) = list_erase(&mut alloc, r.unwrap(), ObjKey(7)).unwrap();
        assert_eq!(n, 0);
        assert!(r.is_none(), "emptied list is freed");
    }
}
