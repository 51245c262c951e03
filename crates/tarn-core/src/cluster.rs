//! The cluster tree: row storage for one table.
//!
//! A table's rows live in a keyed B+tree over [`ObjKey`]. Each leaf (a
//! *cluster*) owns a contiguous key range: one sorted key array plus one
//! column leaf per schema column, all parallel. Interior nodes hold
//! `(minimum key, child ref)` pairs. Reading row R column C descends by R,
//! then indexes the C-th column leaf at the intra-cluster offset.
//!
//! Keys are stored sign-flipped so the packed arrays sort unsigned while
//! the logical order is signed (tombstones, with negative keys, sort
//! first).

use tarn_alloc::SlabAlloc;
use tarn_error::{Result, TarnError};
use tarn_node::{Array, ArrayKind};
use tarn_types::{ObjKey, Ref, RefOrTagged};
use tracing::trace;

use crate::column;
use tarn_index::key::{sign_flip, sign_unflip};

/// Maximum rows per cluster.
pub const CLUSTER_CAP: usize = 256;

/// Slot of the key array inside a cluster; column leaves follow.
const NDX_KEYS: usize = 0;

enum InsertOutcome {
    Done(Ref),
    Split {
        left: Ref,
        left_min: i64,
        right: Ref,
        right_min: i64,
    },
}

/// Create an empty cluster tree for a table of `ncols` columns.
pub fn create(alloc: &mut SlabAlloc, ncols: usize) -> Result<Ref> {
    let mut cluster = Array::create(alloc, ArrayKind::WithRefs, 0, 0)?;
    let keys = Array::create(alloc, ArrayKind::Plain, 0, 0)?;
    cluster.push_rot(alloc, RefOrTagged::Ref(keys.ref_()))?;
    for _ in 0..ncols {
        let leaf = Array::create(alloc, ArrayKind::Plain, 0, 0)?;
        cluster.push_rot(alloc, RefOrTagged::Ref(leaf.ref_()))?;
    }
    Ok(cluster.ref_())
}

fn is_interior(alloc: &SlabAlloc, ref_: Ref) -> Result<bool> {
    Ok(Array::init_from_ref(alloc, ref_)?.flags().is_inner_bptree())
}

fn child_slot_ref(array: &Array, alloc: &SlabAlloc, slot: usize) -> Result<Ref> {
    match array.get_rot(alloc, slot)? {
        RefOrTagged::Ref(r) => Ok(r),
        RefOrTagged::Tagged(_) => Err(TarnError::invalid_database(
            "cluster slot holds a tagged value where a ref is required",
        )),
    }
}

/// Interior child selection: the last child whose minimum key is ≤ `key`
/// (the first child is the catch-all for smaller keys).
fn pick_child(array: &Array, alloc: &SlabAlloc, key: ObjKey) -> Result<usize> {
    let n = array.size() / 2;
    let mut chosen = 0;
    for i in 0..n {
        let min = match array.get_rot(alloc, 2 * i)? {
            RefOrTagged::Tagged(v) => v,
            RefOrTagged::Ref(_) => {
                return Err(TarnError::invalid_database("cluster interior key slot holds a ref"));
            }
        };
        if min <= key.0 {
            chosen = i;
        } else {
            break;
        }
    }
    Ok(chosen)
}

/// Number of rows stored under `root`.
pub fn row_count(alloc: &SlabAlloc, root: Ref) -> Result<u64> {
    let array = Array::init_from_ref(alloc, root)?;
    if array.flags().is_inner_bptree() {
        let mut total = 0;
        for i in 0..array.size() / 2 {
            total += row_count(alloc, child_slot_ref(&array, alloc, 2 * i + 1)?)?;
        }
        Ok(total)
    } else {
        let keys = Array::init_from_ref(alloc, child_slot_ref(&array, alloc, NDX_KEYS)?)?;
        Ok(keys.size() as u64)
    }
}

/// Visit every row key in ascending key order.
pub fn for_each_key<F: FnMut(ObjKey)>(alloc: &SlabAlloc, root: Ref, f: &mut F) -> Result<()> {
    let array = Array::init_from_ref(alloc, root)?;
    if array.flags().is_inner_bptree() {
        for i in 0..array.size() / 2 {
            for_each_key(alloc, child_slot_ref(&array, alloc, 2 * i + 1)?, f)?;
        }
    } else {
        let keys = Array::init_from_ref(alloc, child_slot_ref(&array, alloc, NDX_KEYS)?)?;
        for i in 0..keys.size() {
            f(ObjKey(sign_unflip(keys.get(alloc, i)?)));
        }
    }
    Ok(())
}

/// Locate `key`'s cluster leaf and intra-cluster position.
fn locate(alloc: &SlabAlloc, root: Ref, key: ObjKey) -> Result<Option<(Ref, usize)>> {
    let mut ref_ = root;
    loop {
        let array = Array::init_from_ref(alloc, ref_)?;
        if array.flags().is_inner_bptree() {
            let child = pick_child(&array, alloc, key)?;
            ref_ = child_slot_ref(&array, alloc, 2 * child + 1)?;
            continue;
        }
        let keys = Array::init_from_ref(alloc, child_slot_ref(&array, alloc, NDX_KEYS)?)?;
        let encoded = sign_flip(key.0);
        for i in 0..keys.size() {
            let k = keys.get(alloc, i)?;
            if k == encoded {
                return Ok(Some((ref_, i)));
            }
            if k > encoded {
                return Ok(None);
            }
        }
        return Ok(None);
    }
}

/// Whether `key` has a row.
pub fn contains(alloc: &SlabAlloc, root: Ref, key: ObjKey) -> Result<bool> {
    Ok(locate(alloc, root, key)?.is_some())
}

/// Read the raw element of one column for `key`.
pub fn get_raw(alloc: &SlabAlloc, root: Ref, key: ObjKey, col: usize) -> Result<Option<u64>> {
    let Some((leaf, pos)) = locate(alloc, root, key)? else {
        return Ok(None);
    };
    let cluster = Array::init_from_ref(alloc, leaf)?;
    let column = Array::init_from_ref(alloc, child_slot_ref(&cluster, alloc, col + 1)?)?;
    Ok(Some(column.get(alloc, pos)?))
}

/// Read every column's raw element for `key`.
pub fn get_row_raws(alloc: &SlabAlloc, root: Ref, key: ObjKey) -> Result<Option<Vec<u64>>> {
    let Some((leaf, pos)) = locate(alloc, root, key)? else {
        return Ok(None);
    };
    let cluster = Array::init_from_ref(alloc, leaf)?;
    let ncols = cluster.size() - 1;
    let mut out = Vec::with_capacity(ncols);
    for c in 0..ncols {
        let column = Array::init_from_ref(alloc, child_slot_ref(&cluster, alloc, c + 1)?)?;
        out.push(column.get(alloc, pos)?);
    }
    Ok(Some(out))
}

/// Overwrite one column element for `key`, returning the new root and the
/// old raw value.
pub fn set_raw(
    alloc: &mut SlabAlloc,
    root: Ref,
    key: ObjKey,
    col: usize,
    raw: u64,
) -> Result<(Ref, u64)> {
    let (new_root, old) = set_raw_in(alloc, root, key, col, raw)?;
    let old = old.ok_or_else(|| TarnError::stale(format!("row {key} no longer exists")))?;
    Ok((new_root, old))
}

fn set_raw_in(
    alloc: &mut SlabAlloc,
    ref_: Ref,
    key: ObjKey,
    col: usize,
    raw: u64,
) -> Result<(Ref, Option<u64>)> {
    let mut array = Array::init_from_ref(alloc, ref_)?;
    if array.flags().is_inner_bptree() {
        let child_idx = pick_child(&array, alloc, key)?;
        let child = child_slot_ref(&array, alloc, 2 * child_idx + 1)?;
        let (new_child, old) = set_raw_in(alloc, child, key, col, raw)?;
        if old.is_some() && new_child != child {
            array.set_rot(alloc, 2 * child_idx + 1, RefOrTagged::Ref(new_child))?;
        }
        return Ok((array.ref_(), old));
    }

    let keys = Array::init_from_ref(alloc, child_slot_ref(&array, alloc, NDX_KEYS)?)?;
    let encoded = sign_flip(key.0);
    let mut pos = None;
    for i in 0..keys.size() {
        if keys.get(alloc, i)? == encoded {
            pos = Some(i);
            break;
        }
    }
    let Some(pos) = pos else {
        return Ok((array.ref_(), None));
    };
    let col_ref = child_slot_ref(&array, alloc, col + 1)?;
    let mut column = Array::init_from_ref(alloc, col_ref)?;
    let old = column.get(alloc, pos)?;
    column.set(alloc, pos, raw)?;
    if column.ref_() != col_ref {
        array.set_rot(alloc, col + 1, RefOrTagged::Ref(column.ref_()))?;
    }
    Ok((array.ref_(), Some(old)))
}

/// Insert a fresh row for `key` with per-column default elements.
/// Fails `LogicError` if the key already exists.
pub fn insert_row(
    alloc: &mut SlabAlloc,
    root: Ref,
    key: ObjKey,
    defaults: &[u64],
) -> Result<Ref> {
    match insert_in(alloc, root, key, defaults)? {
        InsertOutcome::Done(r) => Ok(r),
        InsertOutcome::Split {
            left,
            left_min,
            right,
            right_min,
        } => {
            let mut node = Array::create(alloc, ArrayKind::BpTreeInner, 0, 0)?;
            node.push_rot(alloc, RefOrTagged::Tagged(left_min))?;
            node.push_rot(alloc, RefOrTagged::Ref(left))?;
            node.push_rot(alloc, RefOrTagged::Tagged(right_min))?;
            node.push_rot(alloc, RefOrTagged::Ref(right))?;
            trace!(new_root = %node.ref_(), "cluster tree root split");
            Ok(node.ref_())
        }
    }
}

fn insert_in(
    alloc: &mut SlabAlloc,
    ref_: Ref,
    key: ObjKey,
    defaults: &[u64],
) -> Result<InsertOutcome> {
    let mut array = Array::init_from_ref(alloc, ref_)?;
    if array.flags().is_inner_bptree() {
        let child_idx = pick_child(&array, alloc, key)?;
        let child = child_slot_ref(&array, alloc, 2 * child_idx + 1)?;
        match insert_in(alloc, child, key, defaults)? {
            InsertOutcome::Done(new_child) => {
                if new_child != child {
                    array.set_rot(alloc, 2 * child_idx + 1, RefOrTagged::Ref(new_child))?;
                }
                // A key smaller than every existing one lowers the
                // catch-all child's minimum.
                let min = match array.get_rot(alloc, 2 * child_idx)? {
                    RefOrTagged::Tagged(v) => v,
                    RefOrTagged::Ref(_) => unreachable!("validated by pick_child"),
                };
                if key.0 < min {
                    array.set_rot(alloc, 2 * child_idx, RefOrTagged::Tagged(key.0))?;
                }
            }
            InsertOutcome::Split {
                left,
                left_min,
                right,
                right_min,
            } => {
                array.set_rot(alloc, 2 * child_idx, RefOrTagged::Tagged(left_min))?;
                array.set_rot(alloc, 2 * child_idx + 1, RefOrTagged::Ref(left))?;
                array.insert(
                    alloc,
                    2 * child_idx + 2,
                    RefOrTagged::Tagged(right_min).pack(),
                )?;
                array.insert(alloc, 2 * child_idx + 3, RefOrTagged::Ref(right).pack())?;
            }
        }
        if array.size() / 2 > tarn_node::INNER_CAP {
            return split_interior(alloc, array);
        }
        return Ok(InsertOutcome::Done(array.ref_()));
    }

    // Leaf cluster.
    let keys_ref = child_slot_ref(&array, alloc, NDX_KEYS)?;
    let mut keys = Array::init_from_ref(alloc, keys_ref)?;
    let encoded = sign_flip(key.0);
    let mut at = keys.size();
    for i in 0..keys.size() {
        let k = keys.get(alloc, i)?;
        if k == encoded {
            return Err(TarnError::logic(format!("row {key} already exists")));
        }
        if k > encoded {
            at = i;
            break;
        }
    }
    let ncols = array.size() - 1;
    if ncols != defaults.len() {
        return Err(TarnError::logic("column default count mismatch"));
    }

    keys.insert(alloc, at, encoded)?;
    if keys.ref_() != keys_ref {
        array.set_rot(alloc, NDX_KEYS, RefOrTagged::Ref(keys.ref_()))?;
    }
    for (c, default) in defaults.iter().enumerate() {
        let col_ref = child_slot_ref(&array, alloc, c + 1)?;
        let mut column = Array::init_from_ref(alloc, col_ref)?;
        column.insert(alloc, at, *default)?;
        if column.ref_() != col_ref {
            array.set_rot(alloc, c + 1, RefOrTagged::Ref(column.ref_()))?;
        }
    }

    if keys.size() <= CLUSTER_CAP {
        return Ok(InsertOutcome::Done(array.ref_()));
    }

    // Split the cluster in half, keys and every column leaf alike.
    let half = keys.size() / 2;
    let mut right = Array::create(alloc, ArrayKind::WithRefs, 0, 0)?;
    let mut right_keys = Array::create(alloc, ArrayKind::Plain, 0, 0)?;
    for i in half..keys.size() {
        let v = keys.get(alloc, i)?;
        right_keys.push(alloc, v)?;
    }
    let right_min = sign_unflip(right_keys.get(alloc, 0)?);
    right.push_rot(alloc, RefOrTagged::Ref(right_keys.ref_()))?;
    for c in 0..ncols {
        let col_ref = child_slot_ref(&array, alloc, c + 1)?;
        let column = Array::init_from_ref(alloc, col_ref)?;
        let mut right_col = Array::create(alloc, ArrayKind::Plain, 0, 0)?;
        for i in half..column.size() {
            let v = column.get(alloc, i)?;
            right_col.push(alloc, v)?;
        }
        right.push_rot(alloc, RefOrTagged::Ref(right_col.ref_()))?;
    }
    keys.truncate(alloc, half)?;
    if keys.ref_() != keys_ref {
        array.set_rot(alloc, NDX_KEYS, RefOrTagged::Ref(keys.ref_()))?;
    }
    for c in 0..ncols {
        let col_ref = child_slot_ref(&array, alloc, c + 1)?;
        let mut column = Array::init_from_ref(alloc, col_ref)?;
        column.truncate(alloc, half)?;
        if column.ref_() != col_ref {
            array.set_rot(alloc, c + 1, RefOrTagged::Ref(column.ref_()))?;
        }
    }
    let left_min = sign_unflip(keys.get(alloc, 0)?);
    trace!(left_min, right_min, "cluster split");
    Ok(InsertOutcome::Split {
        left: array.ref_(),
        left_min,
        right: right.ref_(),
        right_min,
    })
}

fn split_interior(alloc: &mut SlabAlloc, array: Array) -> Result<InsertOutcome> {
    let n = array.size() / 2;
    let half = n / 2;
    let mut right = Array::create(alloc, ArrayKind::BpTreeInner, 0, 0)?;
    for i in half..n {
        let min = array.get(alloc, 2 * i)?;
        let child = array.get(alloc, 2 * i + 1)?;
        right.push(alloc, min)?;
        right.push(alloc, child)?;
    }
    let left_min = match array.get_rot(alloc, 0)? {
        RefOrTagged::Tagged(v) => v,
        RefOrTagged::Ref(_) => unreachable!("interior key slots are tagged"),
    };
    let right_min = match right.get_rot(alloc, 0)? {
        RefOrTagged::Tagged(v) => v,
        RefOrTagged::Ref(_) => unreachable!("interior key slots are tagged"),
    };
    let mut left = array;
    left.truncate(alloc, 2 * half)?;
    Ok(InsertOutcome::Split {
        left: left.ref_(),
        left_min,
        right: right.ref_(),
        right_min,
    })
}

/// Remove `key`'s row. Returns the new root, or an error if the key has no
/// row. Blob storage owned by the row must be freed by the caller first
/// (read the raws, free them, then erase).
pub fn erase_row(alloc: &mut SlabAlloc, root: Ref, key: ObjKey) -> Result<Ref> {
    let (new_root, found) = erase_in(alloc, root, key)?;
    if !found {
        return Err(TarnError::stale(format!("row {key} no longer exists")));
    }
    // Collapse an interior root with a single child.
    let mut root = new_root;
    loop {
        let array = Array::init_from_ref(alloc, root)?;
        if !array.flags().is_inner_bptree() || array.size() != 2 {
            break;
        }
        let child = child_slot_ref(&array, alloc, 1)?;
        let size = array.byte_size();
        alloc.free(array.ref_(), size);
        root = child;
    }
    Ok(root)
}

fn erase_in(alloc: &mut SlabAlloc, ref_: Ref, key: ObjKey) -> Result<(Ref, bool)> {
    let mut array = Array::init_from_ref(alloc, ref_)?;
    if array.flags().is_inner_bptree() {
        let child_idx = pick_child(&array, alloc, key)?;
        let child = child_slot_ref(&array, alloc, 2 * child_idx + 1)?;
        let (new_child, found) = erase_in(alloc, child, key)?;
        if !found {
            return Ok((array.ref_(), false));
        }
        if new_child != child {
            array.set_rot(alloc, 2 * child_idx + 1, RefOrTagged::Ref(new_child))?;
        }
        // Drop a child that lost its last row (unless it is the only one).
        let child_array = Array::init_from_ref(alloc, new_child)?;
        let empty = if child_array.flags().is_inner_bptree() {
            false
        } else {
            let keys =
                Array::init_from_ref(alloc, child_slot_ref(&child_array, alloc, NDX_KEYS)?)?;
            keys.is_empty()
        };
        if empty && array.size() / 2 > 1 {
            child_array.destroy_deep(alloc)?;
            array.erase(alloc, 2 * child_idx)?;
            array.erase(alloc, 2 * child_idx)?;
        }
        return Ok((array.ref_(), true));
    }

    let keys_ref = child_slot_ref(&array, alloc, NDX_KEYS)?;
    let mut keys = Array::init_from_ref(alloc, keys_ref)?;
    let encoded = sign_flip(key.0);
    let mut pos = None;
    for i in 0..keys.size() {
        if keys.get(alloc, i)? == encoded {
            pos = Some(i);
            break;
        }
    }
    let Some(pos) = pos else {
        return Ok((array.ref_(), false));
    };
    keys.erase(alloc, pos)?;
    if keys.ref_() != keys_ref {
        array.set_rot(alloc, NDX_KEYS, RefOrTagged::Ref(keys.ref_()))?;
    }
    for c in 0..array.size() - 1 {
        let col_ref = child_slot_ref(&array, alloc, c + 1)?;
        let mut column = Array::init_from_ref(alloc, col_ref)?;
        column.erase(alloc, pos)?;
        if column.ref_() != col_ref {
            array.set_rot(alloc, c + 1, RefOrTagged::Ref(column.ref_()))?;
        }
    }
    Ok((array.ref_(), true))
}

/// Append a column leaf (filled with `default`) to every cluster: the
/// storage side of adding a column to a populated table.
pub fn add_column(alloc: &mut SlabAlloc, root: Ref, default: u64) -> Result<Ref> {
    let mut array = Array::init_from_ref(alloc, root)?;
    if array.flags().is_inner_bptree() {
        for i in 0..array.size() / 2 {
            let child = child_slot_ref(&array, alloc, 2 * i + 1)?;
            let new_child = add_column(alloc, child, default)?;
            if new_child != child {
                array.set_rot(alloc, 2 * i + 1, RefOrTagged::Ref(new_child))?;
            }
        }
        return Ok(array.ref_());
    }
    let keys = Array::init_from_ref(alloc, child_slot_ref(&array, alloc, NDX_KEYS)?)?;
    let rows = keys.size();
    let leaf = Array::create(alloc, ArrayKind::Plain, rows, default)?;
    array.push_rot(alloc, RefOrTagged::Ref(leaf.ref_()))?;
    Ok(array.ref_())
}

/// Remove column `col` from every cluster, freeing its leaves. Blob
/// storage inside the column must already have been freed by the caller.
pub fn remove_column(alloc: &mut SlabAlloc, root: Ref, col: usize) -> Result<Ref> {
    let mut array = Array::init_from_ref(alloc, root)?;
    if array.flags().is_inner_bptree() {
        for i in 0..array.size() / 2 {
            let child = child_slot_ref(&array, alloc, 2 * i + 1)?;
            let new_child = remove_column(alloc, child, col)?;
            if new_child != child {
                array.set_rot(alloc, 2 * i + 1, RefOrTagged::Ref(new_child))?;
            }
        }
        return Ok(array.ref_());
    }
    let col_ref = child_slot_ref(&array, alloc, col + 1)?;
    Array::init_from_ref(alloc, col_ref)?.destroy_deep(alloc)?;
    array.erase(alloc, col + 1)?;
    Ok(array.ref_())
}

/// Free the whole tree. Blob storage referenced from column elements must
/// already have been freed (column leaves do not own their blobs for deep
/// destroy purposes).
pub fn destroy(alloc: &mut SlabAlloc, root: Ref) -> Result<()> {
    Array::init_from_ref(alloc, root)?.destroy_deep(alloc)
}

/// Convenience: read and decode one value.
pub fn get_value(
    alloc: &SlabAlloc,
    root: Ref,
    key: ObjKey,
    col_idx: usize,
    col: tarn_types::ColKey,
) -> Result<Option<tarn_types::Mixed>> {
    match get_raw(alloc, root, key, col_idx)? {
        None => Ok(None),
        Some(raw) => Ok(Some(column::decode(alloc, col, raw)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_find_erase() {
        let mut alloc = SlabAlloc::new_scratch();
        let mut root = create(&mut alloc, 2).unwrap();
        for k in [5_i64, 1, 3, -2] {
            root = insert_row(&mut alloc, root, ObjKey(k), &[0, 0]).unwrap();
        }
        assert_eq!(row_count(&alloc, root).unwrap(), 4);
        assert!(contains(&alloc, root, ObjKey(3)).unwrap());
        assert!(!contains(&alloc, root, ObjKey(4)).unwrap());

        let mut seen = Vec::new();
        for_each_key(&alloc, root, &mut |k| seen.push(k.0)).unwrap();
        assert_eq!(seen, vec![-2, 1, 3, 5], "keys iterate in signed order");

        root = erase_row(&mut alloc, root, ObjKey(3)).unwrap();
        assert_eq!(row_count(&alloc, root).unwrap(), 3);
        assert!(!contains(&alloc, root, ObjKey(3)).unwrap());
    }

    #[test]
    fn duplicate_key_rejected() {
        let mut alloc = SlabAlloc::new_scratch();
        let mut root = create(&mut alloc, 0).unwrap();
        root = insert_row(&mut alloc, root, ObjKey(7), &[]).unwrap();
        assert!(insert_row(&mut alloc, root, ObjKey(7), &[]).is_err());
    }

    #[test]
    fn values_follow_rows_across_splits() {
        let mut alloc = SlabAlloc::new_scratch();
        let mut root = create(&mut alloc, 1).unwrap();
        // Enough rows to force several cluster splits.
        for k in 0..1000_i64 {
            root = insert_row(&mut alloc, root, ObjKey(k), &[0]).unwrap();
            let (r, _) = set_raw(&mut alloc, root, ObjKey(k), 0, (k as u64) * 7).unwrap();
            root = r;
        }
        assert_eq!(row_count(&alloc, root).unwrap(), 1000);
        for k in (0..1000_i64).step_by(37) {
            assert_eq!(
                get_raw(&alloc, root, ObjKey(k), 0).unwrap(),
                Some((k as u64) * 7)
            );
        }
    }

    #[test]
    fn one_row_cluster_boundary() {
        let mut alloc = SlabAlloc::new_scratch();
        let mut root = create(&mut alloc, 1).unwrap();
        root = insert_row(&mut alloc, root, ObjKey(0), &[9]).unwrap();
        assert_eq!(row_count(&alloc, root).unwrap(), 1);
        root = erase_row(&mut alloc, root, ObjKey(0)).unwrap();
        assert_eq!(row_count(&alloc, root).unwrap(), 0);
        // An emptied table accepts new rows again.
        root = insert_row(&mut alloc, root, ObjKey(42), &[1]).unwrap();
        assert_eq!(get_raw(&alloc, root, ObjKey(42), 0).unwrap(), Some(1));
    }

    #[test]
    fn erase_collapses_tree() {
        let mut alloc = SlabAlloc::new_scratch();
        let mut root = create(&mut alloc, 0).unwrap();
        for k in 0..600_i64 {
            root = insert_row(&mut alloc, root, ObjKey(k), &[]).unwrap();
        }
        for k in 0..600_i64 {
            root = erase_row(&mut alloc, root, ObjKey(k)).unwrap();
        }
        assert_eq!(row_count(&alloc, root).unwrap(), 0);
        assert!(
            !is_interior(&alloc, root).unwrap(),
            "empty tree is a single cluster again"
        );
    }

    #[test]
    fn add_and_remove_column_backfills() {
        let mut alloc = SlabAlloc::new_scratch();
        let mut root = create(&mut alloc, 1).unwrap();
        for k in 0..300_i64 {
            root = insert_row(&mut alloc, root, ObjKey(k), &[3]).unwrap();
        }
        root = add_column(&mut alloc, root, 77).unwrap();
        assert_eq!(get_raw(&alloc, root, ObjKey(250), 1).unwrap(), Some(77));
        root = remove_column(&mut alloc, root, 0).unwrap();
        assert_eq!(get_raw(&alloc, root, ObjKey(250), 0).unwrap(), Some(77));
    }

    #[test]
    fn tombstone_keys_sort_before_live_keys() {
        let mut alloc = SlabAlloc::new_scratch();
        let mut root = create(&mut alloc, 0).unwrap();
        root = insert_row(&mut alloc, root, ObjKey(10), &[]).unwrap();
        root = insert_row(&mut alloc, root, ObjKey(-10), &[]).unwrap();
        let mut seen = Vec::new();
        for_each_key(&alloc, root, &mut |k| seen.push(k.0)).unwrap();
        assert_eq!(seen, vec![-10, 10]);
    }
}
