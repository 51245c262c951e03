//! Positional B+tree over packed-array leaves.
//!
//! The tree stores an ordered sequence of 64-bit elements (callers encode
//! their own value types). Interior nodes hold `(child ref, accumulated
//! count)` pairs so positional lookup is O(log N) without scanning
//! siblings; all leaves sit at the same depth, so `get(i)` always descends
//! the same number of levels.
//!
//! Leaves split at [`LEAF_CAP`] elements and merge with a neighbor when
//! they fall below the low watermark. Interior nodes split at
//! [`INNER_CAP`] children. Copy-on-write is inherent: every mutation path
//! returns the possibly-relocated child ref, which the parent writes into
//! its own (already shadowed) pair slot.

use tarn_alloc::SlabAlloc;
use tarn_error::{Result, TarnError};
use tarn_types::{Ref, RefOrTagged};
use tracing::trace;

use crate::array::{Array, ArrayKind};

/// Maximum elements per leaf.
pub const LEAF_CAP: usize = 256;

/// Low watermark: a leaf below this merges with a neighbor when possible.
pub const LEAF_LOW: usize = LEAF_CAP / 4;

/// Maximum children per interior node.
pub const INNER_CAP: usize = 64;

enum InsertOutcome {
    Done(Ref),
    Split {
        left: Ref,
        left_count: u64,
        right: Ref,
        right_count: u64,
    },
}

/// A positional B+tree bound to a root ref.
///
/// The root ref changes on mutation; owners persist `root_ref()` into
/// their own slot after each operation.
#[derive(Debug, Clone, Copy)]
pub struct BpTree {
    root: Ref,
}

struct Inner {
    array: Array,
}

impl Inner {
    fn bind(alloc: &SlabAlloc, ref_: Ref) -> Result<Self> {
        Ok(Self {
            array: Array::init_from_ref(alloc, ref_)?,
        })
    }

    fn child_count(&self) -> usize {
        self.array.size() / 2
    }

    fn child(&self, alloc: &SlabAlloc, i: usize) -> Result<Ref> {
        match self.array.get_rot(alloc, 2 * i)? {
            RefOrTagged::Ref(r) => Ok(r),
            RefOrTagged::Tagged(_) => Err(TarnError::invalid_database(
                "b+tree interior child slot holds a tagged value",
            )),
        }
    }

    fn cum(&self, alloc: &SlabAlloc, i: usize) -> Result<u64> {
        match self.array.get_rot(alloc, 2 * i + 1)? {
            RefOrTagged::Tagged(v) => Ok(u64::try_from(v).map_err(|_| {
                TarnError::invalid_database("negative b+tree accumulated count")
            })?),
            RefOrTagged::Ref(_) => Err(TarnError::invalid_database(
                "b+tree interior count slot holds a ref",
            )),
        }
    }

    /// Locate the child covering `idx`: returns `(child index, offset of
    /// the child's first element)`.
    fn locate(&self, alloc: &SlabAlloc, idx: u64) -> Result<(usize, u64)> {
        let mut prev = 0_u64;
        for i in 0..self.child_count() {
            let cum = self.cum(alloc, i)?;
            if idx < cum {
                return Ok((i, prev));
            }
            prev = cum;
        }
        Err(TarnError::OutOfBounds {
            what: "b+tree index",
            index: usize::try_from(idx).unwrap_or(usize::MAX),
            size: usize::try_from(prev).unwrap_or(usize::MAX),
        })
    }

    fn set_child(&mut self, alloc: &mut SlabAlloc, i: usize, child: Ref) -> Result<()> {
        self.array.set_rot(alloc, 2 * i, RefOrTagged::Ref(child))
    }

    fn adjust_cums(&mut self, alloc: &mut SlabAlloc, from: usize, delta: i64) -> Result<()> {
        for i in from..self.child_count() {
            let cum = self.cum(alloc, i)?;
            let new = i64::try_from(cum).expect("count fits i64") + delta;
            self.array
                .set_rot(alloc, 2 * i + 1, RefOrTagged::Tagged(new))?;
        }
        Ok(())
    }
}

fn is_inner(alloc: &SlabAlloc, ref_: Ref) -> Result<bool> {
    Ok(Array::init_from_ref(alloc, ref_)?.flags().is_inner_bptree())
}

fn node_count(alloc: &SlabAlloc, ref_: Ref) -> Result<u64> {
    let array = Array::init_from_ref(alloc, ref_)?;
    if array.flags().is_inner_bptree() {
        let inner = Inner { array };
        let n = inner.child_count();
        if n == 0 { Ok(0) } else { inner.cum(alloc, n - 1) }
    } else {
        Ok(array.size() as u64)
    }
}

impl BpTree {
    /// Create an empty tree (a single empty leaf).
    pub fn create(alloc: &mut SlabAlloc) -> Result<Self> {
        let leaf = Array::create(alloc, ArrayKind::Plain, 0, 0)?;
        Ok(Self { root: leaf.ref_() })
    }

    /// Bind to an existing tree.
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

    /// Total number of elements.
    pub fn size(&self, alloc: &SlabAlloc) -> Result<u64> {
        node_count(alloc, self.root)
    }

    /// Whether the tree holds no elements.
    pub fn is_empty(&self, alloc: &SlabAlloc) -> Result<bool> {
        Ok(self.size(alloc)? == 0)
    }

    /// Read the element at `idx`.
    pub fn get(&self, alloc: &SlabAlloc, idx: u64) -> Result<u64> {
        let mut ref_ = self.root;
        let mut idx = idx;
        loop {
            let array = Array::init_from_ref(alloc, ref_)?;
            if !array.flags().is_inner_bptree() {
                return array.get(alloc, usize::try_from(idx).map_err(|_| {
                    TarnError::OutOfBounds {
                        what: "b+tree index",
                        index: usize::MAX,
                        size: array.size(),
                    }
                })?);
            }
            let inner = Inner { array };
            let (child_idx, offset) = inner.locate(alloc, idx)?;
            ref_ = inner.child(alloc, child_idx)?;
            idx -= offset;
        }
    }

    /// Overwrite the element at `idx`.
    pub fn set(&mut self, alloc: &mut SlabAlloc, idx: u64, value: u64) -> Result<()> {
        self.root = Self::set_in(alloc, self.root, idx, value)?;
        Ok(())
    }

    fn set_in(alloc: &mut SlabAlloc, ref_: Ref, idx: u64, value: u64) -> Result<Ref> {
        let array = Array::init_from_ref(alloc, ref_)?;
        if !array.flags().is_inner_bptree() {
            let mut leaf = array;
            leaf.set(
                alloc,
                usize::try_from(idx).map_err(|_| TarnError::OutOfBounds {
                    what: "b+tree index",
                    index: usize::MAX,
                    size: leaf.size(),
                })?,
                value,
            )?;
            return Ok(leaf.ref_());
        }
        let mut inner = Inner { array };
        let (child_idx, offset) = inner.locate(alloc, idx)?;
        let child = inner.child(alloc, child_idx)?;
        let new_child = Self::set_in(alloc, child, idx - offset, value)?;
        if new_child != child {
            inner.set_child(alloc, child_idx, new_child)?;
        }
        Ok(inner.array.ref_())
    }

    /// Insert `value` before position `idx` (`idx == size` appends).
    pub fn insert(&mut self, alloc: &mut SlabAlloc, idx: u64, value: u64) -> Result<()> {
        match Self::insert_in(alloc, self.root, idx, value)? {
            InsertOutcome::Done(r) => {
                self.root = r;
            }
            InsertOutcome::Split {
                left,
                left_count,
                right,
                right_count,
            } => {
                // Root split: grow the tree by one level, keeping height
                // uniform.
                let mut root = Array::create(alloc, ArrayKind::BpTreeInner, 0, 0)?;
                root.push_rot(alloc, RefOrTagged::Ref(left))?;
                root.push_rot(
                    alloc,
                    RefOrTagged::Tagged(i64::try_from(left_count).expect("fits")),
                )?;
                root.push_rot(alloc, RefOrTagged::Ref(right))?;
                root.push_rot(
                    alloc,
                    RefOrTagged::Tagged(i64::try_from(left_count + right_count).expect("fits")),
                )?;
                trace!(new_root = %root.ref_(), "b+tree root split");
                self.root = root.ref_();
            }
        }
        Ok(())
    }

    /// Append `value` at the end.
    pub fn push(&mut self, alloc: &mut SlabAlloc, value: u64) -> Result<()> {
        let size = self.size(alloc)?;
        self.insert(alloc, size, value)
    }

    fn insert_in(alloc: &mut SlabAlloc, ref_: Ref, idx: u64, value: u64) -> Result<InsertOutcome> {
        let array = Array::init_from_ref(alloc, ref_)?;
        if !array.flags().is_inner_bptree() {
            let mut leaf = array;
            let size = leaf.size();
            let at = usize::try_from(idx).map_err(|_| TarnError::OutOfBounds {
                what: "b+tree insert position",
                index: usize::MAX,
                size,
            })?;
            if at > size {
                return Err(TarnError::OutOfBounds {
                    what: "b+tree insert position",
                    index: at,
                    size,
                });
            }
            if size < LEAF_CAP {
                leaf.insert(alloc, at, value)?;
                return Ok(InsertOutcome::Done(leaf.ref_()));
            }
            // Split the full leaf, then insert into the proper half.
            let half = size / 2;
            let mut right = Array::create(alloc, ArrayKind::Plain, 0, 0)?;
            for i in half..size {
                let v = leaf.get(alloc, i)?;
                right.push(alloc, v)?;
            }
            leaf.truncate(alloc, half)?;
            if at <= half {
                leaf.insert(alloc, at, value)?;
            } else {
                right.insert(alloc, at - half, value)?;
            }
            return Ok(InsertOutcome::Split {
                left: leaf.ref_(),
                left_count: leaf.size() as u64,
                right: right.ref_(),
                right_count: right.size() as u64,
            });
        }

        let mut inner = Inner { array };
        let total = {
            let n = inner.child_count();
            if n == 0 { 0 } else { inner.cum(alloc, n - 1)? }
        };
        // An append targets the last child.
        let (child_idx, offset) = if idx == total {
            let n = inner.child_count();
            let prev = if n >= 2 { inner.cum(alloc, n - 2)? } else { 0 };
            (n - 1, prev)
        } else {
            inner.locate(alloc, idx)?
        };
        let child = inner.child(alloc, child_idx)?;
        match Self::insert_in(alloc, child, idx - offset, value)? {
            InsertOutcome::Done(new_child) => {
                if new_child != child {
                    inner.set_child(alloc, child_idx, new_child)?;
                }
                inner.adjust_cums(alloc, child_idx, 1)?;
            }
            InsertOutcome::Split {
                left,
                left_count,
                right,
                right_count,
            } => {
                inner.set_child(alloc, child_idx, left)?;
                let left_cum = offset + left_count;
                inner
                    .array
                    .set_rot(alloc, 2 * child_idx + 1, RefOrTagged::Tagged(
                        i64::try_from(left_cum).expect("fits"),
                    ))?;
                inner
                    .array
                    .insert(alloc, 2 * child_idx + 2, RefOrTagged::Ref(right).pack())?;
                inner.array.insert(
                    alloc,
                    2 * child_idx + 3,
                    RefOrTagged::Tagged(i64::try_from(left_cum + right_count).expect("fits"))
                        .pack(),
                )?;
                inner.adjust_cums(alloc, child_idx + 2, 1)?;
            }
        }

        if inner.child_count() > INNER_CAP {
            return Self::split_inner(alloc, inner);
        }
        Ok(InsertOutcome::Done(inner.array.ref_()))
    }

    fn split_inner(alloc: &mut SlabAlloc, inner: Inner) -> Result<InsertOutcome> {
        let n = inner.child_count();
        let half = n / 2;
        let left_total = inner.cum(alloc, half - 1)?;
        let total = inner.cum(alloc, n - 1)?;
        let mut right = Array::create(alloc, ArrayKind::BpTreeInner, 0, 0)?;
        for i in half..n {
            let child = inner.child(alloc, i)?;
            let cum = inner.cum(alloc, i)?;
            right.push_rot(alloc, RefOrTagged::Ref(child))?;
            right.push_rot(
                alloc,
                RefOrTagged::Tagged(i64::try_from(cum - left_total).expect("fits")),
            )?;
        }
        let mut left = inner.array;
        left.truncate(alloc, 2 * half)?;
        Ok(InsertOutcome::Split {
            left: left.ref_(),
            left_count: left_total,
            right: right.ref_(),
            right_count: total - left_total,
        })
    }

    /// Remove the element at `idx`.
    pub fn erase(&mut self, alloc: &mut SlabAlloc, idx: u64) -> Result<()> {
        self.root = Self::erase_in(alloc, self.root, idx)?;
        // Collapse a root left with a single child so height shrinks in
        // step with growth.
        loop {
            let array = Array::init_from_ref(alloc, self.root)?;
            if !array.flags().is_inner_bptree() {
                break;
            }
            let inner = Inner { array };
            if inner.child_count() != 1 {
                break;
            }
            let child = inner.child(alloc, 0)?;
            let size = inner.array.byte_size();
            alloc.free(inner.array.ref_(), size);
            self.root = child;
        }
        Ok(())
    }

    fn erase_in(alloc: &mut SlabAlloc, ref_: Ref, idx: u64) -> Result<Ref> {
        let array = Array::init_from_ref(alloc, ref_)?;
        if !array.flags().is_inner_bptree() {
            let mut leaf = array;
            leaf.erase(
                alloc,
                usize::try_from(idx).map_err(|_| TarnError::OutOfBounds {
                    what: "b+tree index",
                    index: usize::MAX,
                    size: leaf.size(),
                })?,
            )?;
            return Ok(leaf.ref_());
        }
        let mut inner = Inner { array };
        let (child_idx, offset) = inner.locate(alloc, idx)?;
        let child = inner.child(alloc, child_idx)?;
        let new_child = Self::erase_in(alloc, child, idx - offset)?;
        if new_child != child {
            inner.set_child(alloc, child_idx, new_child)?;
        }
        inner.adjust_cums(alloc, child_idx, -1)?;
        Self::rebalance_child(alloc, &mut inner, child_idx)?;
        Ok(inner.array.ref_())
    }

    /// Merge an underfull leaf child with a neighbor, or drop it entirely
    /// when empty.
    fn rebalance_child(alloc: &mut SlabAlloc, inner: &mut Inner, child_idx: usize) -> Result<()> {
        let child_ref = inner.child(alloc, child_idx)?;
        let prev_cum = if child_idx == 0 {
            0
        } else {
            inner.cum(alloc, child_idx - 1)?
        };
        let count = inner.cum(alloc, child_idx)? - prev_cum;

        if count == 0 {
            // Keep the last child even when empty; the root-collapse pass
            // folds a single-child root back into a plain leaf.
            if inner.child_count() > 1 {
                let child = Array::init_from_ref(alloc, child_ref)?;
                child.destroy_deep(alloc)?;
                inner.array.erase(alloc, 2 * child_idx)?;
                inner.array.erase(alloc, 2 * child_idx)?;
            }
            return Ok(());
        }
        if count as usize >= LEAF_LOW || is_inner(alloc, child_ref)? {
            return Ok(());
        }
        // Merge with the right neighbor when the combined leaf fits.
        let right_idx = child_idx + 1;
        if right_idx >= inner.child_count() {
            return Ok(());
        }
        let right_count = inner.cum(alloc, right_idx)? - inner.cum(alloc, child_idx)?;
        if count + right_count > LEAF_CAP as u64 {
            return Ok(());
        }
        let right_ref = inner.child(alloc, right_idx)?;
        if is_inner(alloc, right_ref)? {
            return Ok(());
        }
        let mut left = Array::init_from_ref(alloc, child_ref)?;
        let right = Array::init_from_ref(alloc, right_ref)?;
        for i in 0..right.size() {
            let v = right.get(alloc, i)?;
            left.push(alloc, v)?;
        }
        right.destroy_deep(alloc)?;
        inner.set_child(alloc, child_idx, left.ref_())?;
        let merged_cum = inner.cum(alloc, right_idx)?;
        inner.array.set_rot(
            alloc,
            2 * child_idx + 1,
            RefOrTagged::Tagged(i64::try_from(merged_cum).expect("fits")),
        )?;
        inner.array.erase(alloc, 2 * right_idx)?;
        inner.array.erase(alloc, 2 * right_idx)?;
        trace!(child = child_idx, "merged underfull b+tree leaves");
        Ok(())
    }

    /// Remove every element, leaving a single empty leaf.
    pub fn clear(&mut self, alloc: &mut SlabAlloc) -> Result<()> {
        Array::init_from_ref(alloc, self.root)?.destroy_deep(alloc)?;
        let leaf = Array::create(alloc, ArrayKind::Plain, 0, 0)?;
        self.root = leaf.ref_();
        Ok(())
    }

    /// Free the whole tree including the root.
    pub fn destroy(self, alloc: &mut SlabAlloc) -> Result<()> {
        Array::init_from_ref(alloc, self.root)?.destroy_deep(alloc)
    }

    /// Visit every element in order.
    pub fn for_each<F: FnMut(u64)>(&self, alloc: &SlabAlloc, f: &mut F) -> Result<()> {
        Self::for_each_in(alloc, self.root, f)
    }

    fn for_each_in<F: FnMut(u64)>(alloc: &SlabAlloc, ref_: Ref, f: &mut F) -> Result<()> {
        let array = Array::init_from_ref(alloc, ref_)?;
        if array.flags().is_inner_bptree() {
            let inner = Inner { array };
            for i in 0..inner.child_count() {
                Self::for_each_in(alloc, inner.child(alloc, i)?, f)?;
            }
        } else {
            for i in 0..array.size() {
                f(array.get(alloc, i)?);
            }
        }
        Ok(())
    }

    /// Collect all elements (test and small-collection helper).
    pub fn to_vec(&self, alloc: &SlabAlloc) -> Result<Vec<u64>> {
        let mut out = Vec::new();
        self.for_each(alloc, &mut |v| out.push(v))?;
        Ok(out)
    }

    /// Position of the first element equal to `value`, if any.
    pub fn find_first(&self, alloc: &SlabAlloc, value: u64) -> Result<Option<u64>> {
        let mut found = None;
        let mut pos = 0_u64;
        self.for_each(alloc, &mut |v| {
            if found.is_none() && v == value {
                found = Some(pos);
            }
            pos += 1;
        })?;
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn depth(alloc: &SlabAlloc, ref_: Ref) -> usize {
        let array = Array::init_from_ref(alloc, ref_).unwrap();
        if array.flags().is_inner_bptree() {
            let inner = Inner { array };
            1 + depth(alloc, inner.child(alloc, 0).unwrap())
        } else {
            1
        }
    }

    fn max_depth(alloc: &SlabAlloc, ref_: Ref) -> usize {
        let array = Array::init_from_ref(alloc, ref_).unwrap();
        if array.flags().is_inner_bptree() {
            let inner = Inner { array };
            let mut max = 0;
            for i in 0..inner.child_count() {
                max = max.max(max_depth(alloc, inner.child(alloc, i).unwrap()));
            }
            1 + max
        } else {
            1
        }
    }

    #[test]
    fn push_and_get() {
        let mut alloc = SlabAlloc::new_scratch();
        let mut tree = BpTree::create(&mut alloc).unwrap();
        for v in 0..1000_u64 {
            tree.push(&mut alloc, v * 3).unwrap();
        }
        assert_eq!(tree.size(&alloc).unwrap(), 1000);
        for i in 0..1000_u64 {
            assert_eq!(tree.get(&alloc, i).unwrap(), i * 3);
        }
    }

    #[test]
    fn uniform_height_after_growth() {
        let mut alloc = SlabAlloc::new_scratch();
        let mut tree = BpTree::create(&mut alloc).unwrap();
        for v in 0..5000_u64 {
            tree.push(&mut alloc, v).unwrap();
        }
        let root = tree.root_ref();
        assert!(depth(&alloc, root) > 1, "5000 elements must split");
        assert_eq!(
            depth(&alloc, root),
            max_depth(&alloc, root),
            "all leaves sit at the same depth"
        );
    }

    #[test]
    fn insert_in_middle() {
        let mut alloc = SlabAlloc::new_scratch();
        let mut tree = BpTree::create(&mut alloc).unwrap();
        for v in [1_u64, 2, 4, 5] {
            tree.push(&mut alloc, v).unwrap();
        }
        tree.insert(&mut alloc, 2, 3).unwrap();
        assert_eq!(tree.to_vec(&alloc).unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn erase_shrinks_back_to_empty() {
        let mut alloc = SlabAlloc::new_scratch();
        let mut tree = BpTree::create(&mut alloc).unwrap();
        for v in 0..600_u64 {
            tree.push(&mut alloc, v).unwrap();
        }
        for _ in 0..600 {
            tree.erase(&mut alloc, 0).unwrap();
        }
        assert!(tree.is_empty(&alloc).unwrap());
        assert_eq!(depth(&alloc, tree.root_ref()), 1, "height collapses");
    }

    #[test]
    fn set_overwrites() {
        let mut alloc = SlabAlloc::new_scratch();
        let mut tree = BpTree::create(&mut alloc).unwrap();
        for v in 0..300_u64 {
            tree.push(&mut alloc, v).unwrap();
        }
        tree.set(&mut alloc, 299, 7777).unwrap();
        assert_eq!(tree.get(&alloc, 299).unwrap(), 7777);
        assert_eq!(tree.size(&alloc).unwrap(), 300);
    }

    #[test]
    fn clear_resets() {
        let mut alloc = SlabAlloc::new_scratch();
        let mut tree = BpTree::create(&mut alloc).unwrap();
        for v in 0..400_u64 {
            tree.push(&mut alloc, v).unwrap();
        }
        tree.clear(&mut alloc).unwrap();
        assert!(tree.is_empty(&alloc).unwrap());
        assert_eq!(tree.to_vec(&alloc).unwrap(), Vec::<u64>::new());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]
        #[test]
        fn matches_vec_oracle(ops in prop::collection::vec(
            (0_u8..3, 0_usize..2000, 0_u64..1_000_000), 0..600,
        )) {
            let mut alloc = SlabAlloc::new_scratch();
            let mut tree = BpTree::create(&mut alloc).unwrap();
            let mut oracle: Vec<u64> = Vec::new();
            for (op, pos, value) in ops {
                match op {
                    0 => {
                        let i = pos % (oracle.len() + 1);
                        tree.insert(&mut alloc, i as u64, value).unwrap();
                        oracle.insert(i, value);
                    }
                    1 if !oracle.is_empty() => {
                        let i = pos % oracle.len();
                        tree.erase(&mut alloc, i as u64).unwrap();
                        oracle.remove(i);
                    }
                    _ => {
                        tree.push(&mut alloc, value).unwrap();
                        oracle.push(value);
                    }
                }
                prop_assert_eq!(tree.size(&alloc).unwrap(), oracle.len() as u64);
            }
            prop_assert_eq!(tree.to_vec(&alloc).unwrap(), oracle);
            let root = tree.root_ref();
            prop_assert_eq!(depth(&alloc, root), max_depth(&alloc, root));
        }
    }
}
