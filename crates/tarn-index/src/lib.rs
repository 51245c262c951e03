//! The radix-tree search index.
//!
//! Maps the encoded bits of a value to the ObjKeys holding that value.
//! Keys are cut into 6-bit chunks ([`key::CHUNK_WIDTH`]); each node
//! branches on one chunk and carries a compressed prefix of chunks every
//! descendant matches. Equality and range lookups walk chunk by chunk;
//! duplicates hang off a slot as a sorted list.
//!
//! Inserting a diverging key splits a node: a fresh sibling takes the old
//! suffix and children, the node keeps the common prefix and gains two
//! branches. Erasing folds the structure back: an emptied node is freed
//! and its parent bit cleared, and a node left with a single subnode child
//! absorbs that child's prefix and children.

pub mod key;
pub mod node;

use tarn_alloc::SlabAlloc;
use tarn_error::{Result, TarnError};
use tarn_types::{Mixed, ObjKey, Ref, RefOrTagged};
use tracing::trace;

pub use key::{CHUNK_WIDTH, IndexKey};
pub use node::{Entry, METADATA_SLOTS};

use node::{IndexNode, fits_inline, list_create, list_erase, list_insert, list_keys};

/// A search index bound to its root node.
///
/// The root ref changes under copy-on-write; owners persist `root_ref()`
/// into the table's index slot after each mutating call.
#[derive(Debug, Clone, Copy)]
pub struct RadixTree {
    root: Ref,
}

impl RadixTree {
    /// Create an empty index.
    pub fn create(alloc: &mut SlabAlloc) -> Result<Self> {
        let node = IndexNode::create(alloc)?;
        Ok(Self { root: node.ref_() })
    }

    /// Bind to an existing index.
    #[must_use]
    pub const fn from_ref(root: Ref) -> Self {
        Self { root }
    }

    /// The current root ref.
    #[inline]
    #[must_use]
    pub const fn root_ref(&self) -> Ref {
        self.root
    }

    /// Whether the index holds no keys at all.
    pub fn is_empty(&self, alloc: &SlabAlloc) -> Result<bool> {
        IndexNode::bind(alloc, self.root)?.is_empty(alloc)
    }

    // -- mutation ----------------------------------------------------------

    /// Register `obj` under `value`.
    pub fn insert(&mut self, alloc: &mut SlabAlloc, value: &Mixed, obj: ObjKey) -> Result<()> {
        match IndexKey::from_mixed(value) {
            None => self.insert_null(alloc, obj),
            Some(k) => {
                self.root = Self::insert_in(alloc, self.root, k.chunks(), 0, obj)?;
                Ok(())
            }
        }
    }

    /// Remove `obj` from under `value`. Removing an absent pair is a no-op.
    pub fn erase(&mut self, alloc: &mut SlabAlloc, value: &Mixed, obj: ObjKey) -> Result<()> {
        match IndexKey::from_mixed(value) {
            None => self.erase_null(alloc, obj),
            Some(k) => {
                self.root = Self::erase_in(alloc, self.root, k.chunks(), 0, obj, true)?
                    .expect("the root node is never freed");
                Ok(())
            }
        }
    }

    fn insert_null(&mut self, alloc: &mut SlabAlloc, obj: ObjKey) -> Result<()> {
        let mut root = IndexNode::bind(alloc, self.root)?;
        let nulls = match root.nulls_raw(alloc)? {
            RefOrTagged::Ref(r) if r.is_none() => {
                if fits_inline(obj) {
                    RefOrTagged::Tagged(obj.0)
                } else {
                    RefOrTagged::Ref(list_create(alloc, &[obj])?)
                }
            }
            RefOrTagged::Tagged(existing) => {
                if existing == obj.0 {
                    return Ok(());
                }
                let mut both = [ObjKey(existing), obj];
                both.sort();
                RefOrTagged::Ref(list_create(alloc, &both)?)
            }
            RefOrTagged::Ref(list) => RefOrTagged::Ref(list_insert(alloc, list, obj)?),
        };
        root.set_nulls(alloc, nulls)?;
        self.root = root.ref_();
        Ok(())
    }

    fn erase_null(&mut self, alloc: &mut SlabAlloc, obj: ObjKey) -> Result<()> {
        let mut root = IndexNode::bind(alloc, self.root)?;
        let nulls = match root.nulls_raw(alloc)? {
            RefOrTagged::Ref(r) if r.is_none() => return Ok(()),
            RefOrTagged::Tagged(existing) => {
                if existing != obj.0 {
                    return Ok(());
                }
                RefOrTagged::Ref(Ref::NONE)
            }
            RefOrTagged::Ref(list) => match list_erase(alloc, list, obj)? {
                (None, _) => RefOrTagged::Ref(Ref::NONE),
                (Some(rest), 1) => {
                    let survivor = list_keys(alloc, rest)?[0];
                    if fits_inline(survivor) {
                        let (_, _) = list_erase(alloc, rest, survivor)?;
                        RefOrTagged::Tagged(survivor.0)
                    } else {
                        RefOrTagged::Ref(rest)
                    }
                }
                (Some(rest), _) => RefOrTagged::Ref(rest),
            },
        };
        root.set_nulls(alloc, nulls)?;
        self.root = root.ref_();
        Ok(())
    }

    /// Entry for one unique key whose chunks are fully consumed.
    fn single_entry(alloc: &mut SlabAlloc, obj: ObjKey) -> Result<Entry> {
        Ok(if fits_inline(obj) {
            Entry::Single(obj)
        } else {
            Entry::DupList(list_create(alloc, &[obj])?)
        })
    }

    /// Build the minimal chain holding `obj` under the chunk sequence
    /// `rest` (non-empty): one node absorbing all but the last chunk as
    /// its prefix.
    fn chain_for(alloc: &mut SlabAlloc, rest: &[u8], obj: ObjKey) -> Result<Ref> {
        let mut node = IndexNode::create(alloc)?;
        node.set_prefix(alloc, &rest[..rest.len() - 1])?;
        let entry = Self::single_entry(alloc, obj)?;
        node.insert_child(alloc, rest[rest.len() - 1], entry)?;
        Ok(node.ref_())
    }

    fn insert_in(
        alloc: &mut SlabAlloc,
        node_ref: Ref,
        chunks: &[u8],
        mut pos: usize,
        obj: ObjKey,
    ) -> Result<Ref> {
        let mut node = IndexNode::bind(alloc, node_ref)?;

        // A childless node (fresh root, or root holding only nulls)
        // absorbs the whole key: prefix plus one branch chunk.
        if node.child_count(alloc)? == 0 {
            let rest = &chunks[pos..];
            node.set_prefix(alloc, &rest[..rest.len() - 1])?;
            let entry = Self::single_entry(alloc, obj)?;
            node.insert_child(alloc, rest[rest.len() - 1], entry)?;
            return Ok(node.ref_());
        }

        let prefix = node.prefix(alloc)?;
        let rest = &chunks[pos..];
        let common = prefix
            .iter()
            .zip(rest.iter())
            .take_while(|(a, b)| a == b)
            .count();
        if common == rest.len() {
            // Only possible when encodings are not prefix-free, i.e. the
            // index was fed keys from two different type encodings.
            return Err(TarnError::invalid_database(
                "index key ends inside a node prefix",
            ));
        }
        if common < prefix.len() {
            // Diverging key: split. A fresh sibling takes the old suffix,
            // population, and children; this node keeps the common prefix
            // and branches to the sibling, then falls through to attach
            // the new key.
            let mut sibling = IndexNode::create(alloc)?;
            sibling.set_prefix(alloc, &prefix[common + 1..])?;
            let raw_children: Vec<u64> = (METADATA_SLOTS..node.array.size())
                .map(|i| node.array.get(alloc, i))
                .collect::<Result<_>>()?;
            for raw in &raw_children {
                sibling.array.push(alloc, *raw)?;
            }
            for which in 0..2 {
                let pop = node.population(alloc, which)?;
                sibling
                    .array
                    .set_rot(alloc, which, RefOrTagged::Tagged(pop as i64))?;
            }
            node.array.truncate(alloc, METADATA_SLOTS)?;
            for which in 0..2 {
                node.array.set_rot(alloc, which, RefOrTagged::Tagged(0))?;
            }
            node.set_prefix(alloc, &prefix[..common])?;
            node.insert_child(alloc, prefix[common], Entry::Subnode(sibling.ref_()))?;
            trace!(at = common, "split index node");
        }
        pos += common.min(prefix.len());

        let branch = chunks[pos];
        let rest = &chunks[pos + 1..];
        if !node.has_chunk(alloc, branch)? {
            let entry = if rest.is_empty() {
                Self::single_entry(alloc, obj)?
            } else {
                Entry::Subnode(Self::chain_for(alloc, rest, obj)?)
            };
            node.insert_child(alloc, branch, entry)?;
            return Ok(node.ref_());
        }

        match node.child(alloc, branch)? {
            Entry::Single(existing) => {
                if !rest.is_empty() {
                    return Err(TarnError::invalid_database(
                        "index entry terminates inside another key's chunk path",
                    ));
                }
                if existing != obj {
                    let mut both = [existing, obj];
                    both.sort();
                    let list = list_create(alloc, &both)?;
                    node.set_child(alloc, branch, Entry::DupList(list))?;
                }
            }
            Entry::DupList(list) => {
                if !rest.is_empty() {
                    return Err(TarnError::invalid_database(
                        "index entry terminates inside another key's chunk path",
                    ));
                }
                let list = list_insert(alloc, list, obj)?;
                node.set_child(alloc, branch, Entry::DupList(list))?;
            }
            Entry::Subnode(child) => {
                if rest.is_empty() {
                    return Err(TarnError::invalid_database(
                        "index key ends at an interior node",
                    ));
                }
                let new_child = Self::insert_in(alloc, child, chunks, pos + 1, obj)?;
                if new_child != child {
                    node.set_child(alloc, branch, Entry::Subnode(new_child))?;
                }
            }
        }
        Ok(node.ref_())
    }

    fn erase_in(
        alloc: &mut SlabAlloc,
        node_ref: Ref,
        chunks: &[u8],
        mut pos: usize,
        obj: ObjKey,
        is_root: bool,
    ) -> Result<Option<Ref>> {
        let mut node = IndexNode::bind(alloc, node_ref)?;
        let prefix = node.prefix(alloc)?;
        let rest = &chunks[pos..];
        if rest.len() <= prefix.len() || !rest.starts_with(&prefix) {
            return Ok(Some(node.ref_())); // key not present
        }
        pos += prefix.len();

        let branch = chunks[pos];
        let rest = &chunks[pos + 1..];
        if !node.has_chunk(alloc, branch)? {
            return Ok(Some(node.ref_()));
        }

        match node.child(alloc, branch)? {
            Entry::Single(existing) => {
                if rest.is_empty() && existing == obj {
                    node.remove_child(alloc, branch)?;
                }
            }
            Entry::DupList(list) => {
                if rest.is_empty() {
                    match list_erase(alloc, list, obj)? {
                        (None, _) => node.remove_child(alloc, branch)?,
                        (Some(remaining), 1) => {
                            let survivor = list_keys(alloc, remaining)?[0];
                            if fits_inline(survivor) {
                                let (freed, _) = list_erase(alloc, remaining, survivor)?;
                                debug_assert!(freed.is_none());
                                node.set_child(alloc, branch, Entry::Single(survivor))?;
                            } else {
                                node.set_child(alloc, branch, Entry::DupList(remaining))?;
                            }
                        }
                        (Some(remaining), _) => {
                            node.set_child(alloc, branch, Entry::DupList(remaining))?;
                        }
                    }
                }
            }
            Entry::Subnode(child) => {
                if !rest.is_empty() {
                    match Self::erase_in(alloc, child, chunks, pos + 1, obj, false)? {
                        None => node.remove_child(alloc, branch)?,
                        Some(new_child) => {
                            if new_child != child {
                                node.set_child(alloc, branch, Entry::Subnode(new_child))?;
                            }
                        }
                    }
                }
            }
        }

        if node.is_empty(alloc)? {
            if is_root {
                // The root survives empty, with its prefix reset so the
                // next insert re-absorbs a full key.
                node.set_prefix(alloc, &[])?;
                return Ok(Some(node.ref_()));
            }
            let size = node.array.byte_size();
            alloc.free(node.ref_(), size);
            return Ok(None);
        }

        Self::fold(alloc, &mut node)?;
        Ok(Some(node.ref_()))
    }

    /// Collapse `node` when its prefix plus a single remaining subnode
    /// child can be folded upward into one node.
    fn fold(alloc: &mut SlabAlloc, node: &mut IndexNode) -> Result<()> {
        if node.child_count(alloc)? != 1 {
            return Ok(());
        }
        let chunk = node.chunks(alloc)?[0];
        let Entry::Subnode(child_ref) = node.child(alloc, chunk)? else {
            return Ok(());
        };
        let child = IndexNode::bind(alloc, child_ref)?;
        let mut prefix = node.prefix(alloc)?;
        prefix.push(chunk);
        prefix.extend(child.prefix(alloc)?);

        let raw_children: Vec<u64> = (METADATA_SLOTS..child.array.size())
            .map(|i| child.array.get(alloc, i))
            .collect::<Result<_>>()?;
        let pops = [
            child.population(alloc, 0)?,
            child.population(alloc, 1)?,
        ];

        node.remove_child(alloc, chunk)?;
        node.set_prefix(alloc, &prefix)?;
        for which in 0..2 {
            node.array
                .set_rot(alloc, which, RefOrTagged::Tagged(pops[which] as i64))?;
        }
        for raw in raw_children {
            node.array.push(alloc, raw)?;
        }
        // Free the absorbed child's own node (its children now belong to
        // us, so no deep destroy).
        let mut child = child;
        child.set_prefix(alloc, &[])?;
        let size = child.array.byte_size();
        alloc.free(child.ref_(), size);
        trace!("folded index node into parent");
        Ok(())
    }

    // -- lookup ------------------------------------------------------------

    fn find_entry(&self, alloc: &SlabAlloc, value: &Mixed) -> Result<Option<Entry>> {
        let Some(k) = IndexKey::from_mixed(value) else {
            let root = IndexNode::bind(alloc, self.root)?;
            return Ok(match root.nulls_raw(alloc)? {
                RefOrTagged::Ref(r) if r.is_none() => None,
                RefOrTagged::Tagged(v) => Some(Entry::Single(ObjKey(v))),
                RefOrTagged::Ref(list) => Some(Entry::DupList(list)),
            });
        };
        let chunks = k.chunks();
        let mut pos = 0;
        let mut node_ref = self.root;
        loop {
            let node = IndexNode::bind(alloc, node_ref)?;
            let prefix = node.prefix(alloc)?;
            let rest = &chunks[pos..];
            if rest.len() <= prefix.len() || !rest.starts_with(&prefix) {
                return Ok(None);
            }
            pos += prefix.len();
            let branch = chunks[pos];
            let rest = &chunks[pos + 1..];
            if !node.has_chunk(alloc, branch)? {
                return Ok(None);
            }
            match node.child(alloc, branch)? {
                Entry::Subnode(child) => {
                    if rest.is_empty() {
                        return Ok(None); // the key is a strict prefix
                    }
                    node_ref = child;
                    pos += 1;
                }
                entry @ (Entry::Single(_) | Entry::DupList(_)) => {
                    return Ok(if rest.is_empty() { Some(entry) } else { None });
                }
            }
        }
    }

    /// First ObjKey registered under `value`, if any.
    pub fn find_first(&self, alloc: &SlabAlloc, value: &Mixed) -> Result<Option<ObjKey>> {
        Ok(match self.find_entry(alloc, value)? {
            None => None,
            Some(Entry::Single(k)) => Some(k),
            Some(Entry::DupList(list)) => list_keys(alloc, list)?.first().copied(),
            Some(Entry::Subnode(_)) => None,
        })
    }

    /// Number of rows holding `value`.
    pub fn count(&self, alloc: &SlabAlloc, value: &Mixed) -> Result<usize> {
        Ok(match self.find_entry(alloc, value)? {
            None => 0,
            Some(Entry::Single(_)) => 1,
            Some(Entry::DupList(list)) => list_keys(alloc, list)?.len(),
            Some(Entry::Subnode(_)) => 0,
        })
    }

    /// All ObjKeys holding `value`, in ascending key order.
    pub fn find_all(&self, alloc: &SlabAlloc, value: &Mixed) -> Result<Vec<ObjKey>> {
        Ok(match self.find_entry(alloc, value)? {
            None => Vec::new(),
            Some(Entry::Single(k)) => vec![k],
            Some(Entry::DupList(list)) => list_keys(alloc, list)?,
            Some(Entry::Subnode(_)) => Vec::new(),
        })
    }

    /// All ObjKeys whose value sorts within `[lo, hi]`, visited in value
    /// order. Nulls are never part of a range.
    pub fn find_all_between<F: FnMut(ObjKey)>(
        &self,
        alloc: &SlabAlloc,
        lo: &Mixed,
        hi: &Mixed,
        f: &mut F,
    ) -> Result<()> {
        let (Some(lo), Some(hi)) = (IndexKey::from_mixed(lo), IndexKey::from_mixed(hi)) else {
            return Err(TarnError::invalid_query("range bounds cannot be null"));
        };
        let mut path = Vec::new();
        self.walk_range(alloc, self.root, &mut path, lo.chunks(), hi.chunks(), f)
    }

    fn walk_range<F: FnMut(ObjKey)>(
        &self,
        alloc: &SlabAlloc,
        node_ref: Ref,
        path: &mut Vec<u8>,
        lo: &[u8],
        hi: &[u8],
        f: &mut F,
    ) -> Result<()> {
        let node = IndexNode::bind(alloc, node_ref)?;
        let depth = path.len();
        path.extend(node.prefix(alloc)?);
        for chunk in node.chunks(alloc)? {
            path.push(chunk);
            // Prune subtrees wholly outside the bounds: compare the path
            // as a (possibly partial) chunk sequence.
            let above_lo = path.as_slice() >= &lo[..lo.len().min(path.len())];
            let below_hi = &path[..path.len().min(hi.len())] <= hi;
            if above_lo && below_hi {
                match node.child(alloc, chunk)? {
                    Entry::Single(k) => {
                        if path.as_slice() >= lo && path.as_slice() <= hi {
                            f(k);
                        }
                    }
                    Entry::DupList(list) => {
                        if path.as_slice() >= lo && path.as_slice() <= hi {
                            for k in list_keys(alloc, list)? {
                                f(k);
                            }
                        }
                    }
                    Entry::Subnode(child) => {
                        self.walk_range(alloc, child, path, lo, hi, f)?;
                    }
                }
            }
            path.pop();
        }
        path.truncate(depth);
        Ok(())
    }

    /// Whether any value (null included) is held by two or more rows.
    pub fn has_duplicate_values(&self, alloc: &SlabAlloc) -> Result<bool> {
        fn scan(alloc: &SlabAlloc, node_ref: Ref) -> Result<bool> {
            let node = IndexNode::bind(alloc, node_ref)?;
            if let RefOrTagged::Ref(list) = node.nulls_raw(alloc)? {
                if list.is_some() && list_keys(alloc, list)?.len() > 1 {
                    return Ok(true);
                }
            }
            for chunk in node.chunks(alloc)? {
                match node.child(alloc, chunk)? {
                    Entry::Single(_) => {}
                    Entry::DupList(list) => {
                        if list_keys(alloc, list)?.len() > 1 {
                            return Ok(true);
                        }
                    }
                    Entry::Subnode(child) => {
                        if scan(alloc, child)? {
                            return Ok(true);
                        }
                    }
                }
            }
            Ok(false)
        }
        scan(alloc, self.root)
    }

    /// Remove every key, leaving an empty root.
    pub fn clear(&mut self, alloc: &mut SlabAlloc) -> Result<()> {
        let mut root = IndexNode::bind(alloc, self.root)?;
        for chunk in root.chunks(alloc)? {
            if let Entry::DupList(r) | Entry::Subnode(r) = root.child(alloc, chunk)? {
                tarn_node::Array::init_from_ref(alloc, r)?.destroy_deep(alloc)?;
            }
        }
        if let RefOrTagged::Ref(list) = root.nulls_raw(alloc)? {
            if list.is_some() {
                tarn_node::Array::init_from_ref(alloc, list)?.destroy_deep(alloc)?;
            }
        }
        root.array.truncate(alloc, METADATA_SLOTS)?;
        for which in 0..2 {
            root.array.set_rot(alloc, which, RefOrTagged::Tagged(0))?;
        }
        root.set_prefix(alloc, &[])?;
        root.set_nulls(alloc, RefOrTagged::Ref(Ref::NONE))?;
        self.root = root.ref_();
        Ok(())
    }

    /// Free the whole index including the root node.
    pub fn destroy(mut self, alloc: &mut SlabAlloc) -> Result<()> {
        self.clear(alloc)?;
        let root = IndexNode::bind(alloc, self.root)?;
        let size = root.array.byte_size();
        alloc.free(root.ref_(), size);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::{BTreeMap, BTreeSet};

    fn scratch() -> SlabAlloc {
        SlabAlloc::new_scratch()
    }

    /// Structural dump used to compare index states.
    fn dump(alloc: &SlabAlloc, node_ref: Ref) -> Vec<String> {
        let node = IndexNode::bind(alloc, node_ref).unwrap();
        let mut out = vec![format!(
            "prefix={:?} pops=({:#x},{:#x}) nulls={:?}",
            node.prefix(alloc).unwrap(),
            node.population(alloc, 0).unwrap(),
            node.population(alloc, 1).unwrap(),
            node.nulls_raw(alloc).unwrap(),
        )];
        for chunk in node.chunks(alloc).unwrap() {
            match node.child(alloc, chunk).unwrap() {
                Entry::Single(k) => out.push(format!("{chunk}:single {k}")),
                Entry::DupList(list) => {
                    out.push(format!("{chunk}:list {:?}", list_keys(alloc, list).unwrap()));
                }
                Entry::Subnode(child) => {
                    out.push(format!("{chunk}:sub"));
                    out.extend(dump(alloc, child));
                }
            }
        }
        out
    }

    #[test]
    fn integer_index_scenario() {
        // Values [0, 1, 2, 3, 4, 4, 5, 5, 5, null, -1] on rows 0..=10.
        let mut alloc = scratch();
        let mut tree = RadixTree::create(&mut alloc).unwrap();
        let values = [
            Mixed::Int(0),
            Mixed::Int(1),
            Mixed::Int(2),
            Mixed::Int(3),
            Mixed::Int(4),
            Mixed::Int(4),
            Mixed::Int(5),
            Mixed::Int(5),
            Mixed::Int(5),
            Mixed::Null,
            Mixed::Int(-1),
        ];
        for (row, v) in values.iter().enumerate() {
            tree.insert(&mut alloc, v, ObjKey(row as i64)).unwrap();
        }
        assert_eq!(tree.count(&alloc, &Mixed::Int(4)).unwrap(), 2);
        assert_eq!(tree.count(&alloc, &Mixed::Int(5)).unwrap(), 3);
        assert_eq!(tree.count(&alloc, &Mixed::Null).unwrap(), 1);
        assert_eq!(
            tree.find_first(&alloc, &Mixed::Int(-1)).unwrap(),
            Some(ObjKey(10))
        );
        assert!(tree.has_duplicate_values(&alloc).unwrap());
        assert_eq!(
            tree.find_all(&alloc, &Mixed::Int(5)).unwrap(),
            vec![ObjKey(6), ObjKey(7), ObjKey(8)]
        );

        for (row, v) in values.iter().enumerate() {
            tree.erase(&mut alloc, v, ObjKey(row as i64)).unwrap();
        }
        assert!(tree.is_empty(&alloc).unwrap());
    }

    #[test]
    fn prefix_split_and_collapse() {
        let mut alloc = scratch();
        let mut tree = RadixTree::create(&mut alloc).unwrap();
        let a = Mixed::Int(0x0F0_0000_0000_0000);
        let b = Mixed::Int(0xFFF_0000_0000_0000);

        tree.insert(&mut alloc, &a, ObjKey(1)).unwrap();
        // A single key folds entirely into the root: full-path prefix,
        // one tagged entry.
        let root = IndexNode::bind(&alloc, tree.root_ref()).unwrap();
        let single_prefix = root.prefix(&alloc).unwrap();
        assert_eq!(single_prefix.len(), 10, "prefix holds all but one chunk");
        assert_eq!(root.child_count(&alloc).unwrap(), 1);

        tree.insert(&mut alloc, &b, ObjKey(2)).unwrap();
        // The diverging key splits the root at the common prefix; a child
        // subnode carries the distinguishing chunks.
        let root = IndexNode::bind(&alloc, tree.root_ref()).unwrap();
        let split_prefix = root.prefix(&alloc).unwrap();
        assert!(split_prefix.len() < single_prefix.len());
        assert!(single_prefix.starts_with(&split_prefix));
        assert_eq!(root.child_count(&alloc).unwrap(), 2);
        let mut found_subnode = false;
        for chunk in root.chunks(&alloc).unwrap() {
            if let Entry::Subnode(_) = root.child(&alloc, chunk).unwrap() {
                found_subnode = true;
            }
        }
        assert!(found_subnode, "one branch must descend into a subnode");
        assert_eq!(tree.find_first(&alloc, &a).unwrap(), Some(ObjKey(1)));
        assert_eq!(tree.find_first(&alloc, &b).unwrap(), Some(ObjKey(2)));

        tree.erase(&mut alloc, &b, ObjKey(2)).unwrap();
        // The root folds back to a single-value leaf with the full path.
        let root = IndexNode::bind(&alloc, tree.root_ref()).unwrap();
        assert_eq!(root.prefix(&alloc).unwrap(), single_prefix);
        assert_eq!(root.child_count(&alloc).unwrap(), 1);
        assert_eq!(tree.find_first(&alloc, &a).unwrap(), Some(ObjKey(1)));
    }

    #[test]
    fn insert_erase_restores_structure() {
        let mut alloc = scratch();
        let mut tree = RadixTree::create(&mut alloc).unwrap();
        for (row, v) in [3_i64, -8, 3, 900, 17].into_iter().enumerate() {
            tree.insert(&mut alloc, &Mixed::Int(v), ObjKey(row as i64))
                .unwrap();
        }
        let before = dump(&alloc, tree.root_ref());
        tree.insert(&mut alloc, &Mixed::Int(55), ObjKey(99)).unwrap();
        tree.erase(&mut alloc, &Mixed::Int(55), ObjKey(99)).unwrap();
        let after = dump(&alloc, tree.root_ref());
        assert_eq!(before, after, "insert followed by erase must be identity");
    }

    #[test]
    fn tombstone_keys_go_through_lists() {
        let mut alloc = scratch();
        let mut tree = RadixTree::create(&mut alloc).unwrap();
        let dead = ObjKey(-7);
        assert!(dead.is_tombstone());
        tree.insert(&mut alloc, &Mixed::Int(12), dead).unwrap();
        let root = IndexNode::bind(&alloc, tree.root_ref()).unwrap();
        let chunk = root.chunks(&alloc).unwrap()[0];
        assert!(
            matches!(root.child(&alloc, chunk).unwrap(), Entry::DupList(_)),
            "a tombstone cannot be a tagged inline entry"
        );
        assert_eq!(tree.find_all(&alloc, &Mixed::Int(12)).unwrap(), vec![dead]);
        tree.erase(&mut alloc, &Mixed::Int(12), dead).unwrap();
        assert!(tree.is_empty(&alloc).unwrap());
    }

    #[test]
    fn string_keys() {
        let mut alloc = scratch();
        let mut tree = RadixTree::create(&mut alloc).unwrap();
        let words = ["apple", "app", "banana", "", "apple"];
        for (row, w) in words.into_iter().enumerate() {
            tree.insert(&mut alloc, &Mixed::from(w), ObjKey(row as i64))
                .unwrap();
        }
        assert_eq!(tree.count(&alloc, &Mixed::from("apple")).unwrap(), 2);
        assert_eq!(tree.count(&alloc, &Mixed::from("app")).unwrap(), 1);
        assert_eq!(tree.count(&alloc, &Mixed::from("")).unwrap(), 1);
        assert_eq!(tree.count(&alloc, &Mixed::from("appl")).unwrap(), 0);
        assert_eq!(tree.count(&alloc, &Mixed::Null).unwrap(), 0);
        tree.erase(&mut alloc, &Mixed::from("apple"), ObjKey(0)).unwrap();
        assert_eq!(tree.count(&alloc, &Mixed::from("apple")).unwrap(), 1);
    }

    #[test]
    fn range_enumeration() {
        let mut alloc = scratch();
        let mut tree = RadixTree::create(&mut alloc).unwrap();
        for (row, v) in [-50_i64, -3, 0, 1, 7, 7, 100, 5000].into_iter().enumerate() {
            tree.insert(&mut alloc, &Mixed::Int(v), ObjKey(row as i64))
                .unwrap();
        }
        let mut seen = Vec::new();
        tree.find_all_between(&alloc, &Mixed::Int(-3), &Mixed::Int(100), &mut |k| {
            seen.push(k)
        })
        .unwrap();
        assert_eq!(seen.len(), 6, "-3, 0, 1, 7, 7, 100");
    }

    #[test]
    fn clear_empties_everything() {
        let mut alloc = scratch();
        let mut tree = RadixTree::create(&mut alloc).unwrap();
        for v in 0..100_i64 {
            tree.insert(&mut alloc, &Mixed::Int(v * 37), ObjKey(v)).unwrap();
        }
        tree.insert(&mut alloc, &Mixed::Null, ObjKey(500)).unwrap();
        tree.clear(&mut alloc).unwrap();
        assert!(tree.is_empty(&alloc).unwrap());
        assert_eq!(tree.count(&alloc, &Mixed::Int(37)).unwrap(), 0);
        assert_eq!(tree.count(&alloc, &Mixed::Null).unwrap(), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]
        #[test]
        fn matches_btreemap_oracle(ops in prop::collection::vec(
            (prop::bool::ANY, -40_i64..40, 0_i64..20), 0..300,
        )) {
            let mut alloc = scratch();
            let mut tree = RadixTree::create(&mut alloc).unwrap();
            let mut oracle: BTreeMap<i64, BTreeSet<i64>> = BTreeMap::new();
            for (is_insert, value, row) in ops {
                let mixed = Mixed::Int(value);
                if is_insert {
                    tree.insert(&mut alloc, &mixed, ObjKey(row)).unwrap();
                    oracle.entry(value).or_default().insert(row);
                } else {
                    tree.erase(&mut alloc, &mixed, ObjKey(row)).unwrap();
                    if let Some(set) = oracle.get_mut(&value) {
                        set.remove(&row);
                        if set.is_empty() {
                            oracle.remove(&value);
                        }
                    }
                }
            }
            for (value, rows) in &oracle {
                let got = tree.find_all(&alloc, &Mixed::Int(*value)).unwrap();
                let want: Vec<ObjKey> = rows.iter().map(|r| ObjKey(*r)).collect();
                prop_assert_eq!(got, want);
            }
            prop_assert_eq!(tree.is_empty(&alloc).unwrap(), oracle.is_empty());
        }
    }
}
