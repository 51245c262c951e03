//! Object-level operations: columns, rows, values, links, collections.
//!
//! Everything here works on `(allocator, group)` pairs owned by the write
//! transaction; read paths take the allocator and group immutably. Link
//! writes maintain the reciprocal backlink column on the target table, and
//! object removal runs the cascade: strong links pull their targets along,
//! and every incoming link to a removed row is nullified, with the whole
//! set delivered to the registered handler before anything is touched.

use std::collections::HashSet;

use smallvec::SmallVec;
use tarn_alloc::SlabAlloc;
use tarn_error::{Result, TarnError};
use tarn_index::RadixTree;
use tarn_index::node::{
    list_create as keyset_create, list_erase as keyset_erase, list_insert as keyset_insert,
    list_keys as keyset_keys,
};
use tarn_node::BpTree;
use tarn_types::{
    ColKey, ColumnAttr, DataType, Mixed, ObjKey, Ref, RefOrTagged, TableKey,
};
use tracing::debug;

use crate::cluster;
use crate::column;
use crate::group::{ColumnSpec, Group, TableInfo};

/// A link broken by a cascade: the origin field that pointed at a removed
/// row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokenLink {
    pub origin_table: TableKey,
    pub origin_col: ColKey,
    pub origin_key: ObjKey,
    pub old_target: ObjKey,
}

/// The cascade set computed before a removal executes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CascadeNotification {
    /// Rows removed *in addition to* the explicitly removed one.
    pub rows: Vec<(TableKey, ObjKey)>,
    /// Links nullified because their target goes away.
    pub links: Vec<BrokenLink>,
}

/// Handler invoked synchronously inside the transaction before a cascade
/// executes.
pub type CascadeHandler<'a> = &'a mut dyn FnMut(&CascadeNotification);

// ---------------------------------------------------------------------------
// Columns
// ---------------------------------------------------------------------------

fn check_new_column_name(info: &TableInfo, name: &str) -> Result<()> {
    if info.columns.iter().any(|c| c.name == name) {
        return Err(TarnError::logic(format!(
            "column '{name}' already exists in table '{}'",
            info.name
        )));
    }
    Ok(())
}

/// Add a scalar (or scalar-collection) column.
pub fn add_column(
    alloc: &mut SlabAlloc,
    group: &mut Group,
    tk: TableKey,
    name: &str,
    dt: DataType,
    attrs: ColumnAttr,
) -> Result<ColKey> {
    if matches!(dt, DataType::Link) {
        return Err(TarnError::logic("link columns need a target table"));
    }
    if attrs.contains(ColumnAttr::INDEXED) && !dt.is_indexable() {
        return Err(TarnError::logic(format!(
            "{dt:?} columns cannot carry a search index"
        )));
    }
    add_column_raw(alloc, group, tk, name, dt, attrs, None, None)
}

/// Add a link (or link-list) column targeting `target`, wiring up the
/// reciprocal backlink column.
pub fn add_column_link(
    alloc: &mut SlabAlloc,
    group: &mut Group,
    tk: TableKey,
    name: &str,
    list: bool,
    target: TableKey,
    strong: bool,
) -> Result<ColKey> {
    group.table(target)?; // target must exist
    let mut attrs = ColumnAttr::NULLABLE;
    if list {
        attrs |= ColumnAttr::LIST;
    }
    if strong {
        attrs |= ColumnAttr::STRONG;
    }
    let col = add_column_raw(alloc, group, tk, name, DataType::Link, attrs, Some(target), None)?;

    let origin_name = group.table(tk)?.name.clone();
    let backlink_name = format!("!backlink_{origin_name}_{name}");
    add_column_raw(
        alloc,
        group,
        target,
        &backlink_name,
        DataType::Link,
        ColumnAttr::BACKLINK,
        Some(tk),
        Some(col),
    )?;
    Ok(col)
}

#[allow(clippy::too_many_arguments)]
fn add_column_raw(
    alloc: &mut SlabAlloc,
    group: &mut Group,
    tk: TableKey,
    name: &str,
    dt: DataType,
    attrs: ColumnAttr,
    target: Option<TableKey>,
    origin_col: Option<ColKey>,
) -> Result<ColKey> {
    let info = group.table(tk)?;
    check_new_column_name(info, name)?;
    let index = u16::try_from(info.columns.len())
        .map_err(|_| TarnError::logic("too many columns"))?;
    let key = ColKey::new(index, dt, attrs);

    let new_root = cluster::add_column(alloc, info.cluster_root, column::default_raw(key))?;
    let index_root = if attrs.contains(ColumnAttr::INDEXED) {
        let mut tree = RadixTree::create(alloc)?;
        // Backfill: every existing row holds the column default.
        let default = column::decode(alloc, key, column::default_raw(key))?;
        let mut keys = Vec::new();
        cluster::for_each_key(alloc, new_root, &mut |k| keys.push(k))?;
        for k in keys {
            tree.insert(alloc, &default, k)?;
        }
        tree.root_ref()
    } else {
        Ref::NONE
    };

    let info = group.table_mut(tk)?;
    info.cluster_root = new_root;
    info.columns.push(ColumnSpec {
        name: name.to_owned(),
        key,
        target,
        origin_col,
    });
    info.index_roots.push(index_root);
    debug!(table = %tk, column = name, ?dt, "added column");
    Ok(key)
}

/// Remove a public column, its storage, its index, and (for link columns)
/// the reciprocal backlink column.
pub fn remove_column(
    alloc: &mut SlabAlloc,
    group: &mut Group,
    tk: TableKey,
    col: ColKey,
) -> Result<()> {
    let info = group.table(tk)?;
    let idx = info.col_index(col)?;
    let spec = info.columns[idx].clone();
    let cluster_root = info.cluster_root;
    let index_root = info.index_roots[idx];

    // Free value blobs and collection trees row by row.
    let mut keys = Vec::new();
    cluster::for_each_key(alloc, cluster_root, &mut |k| keys.push(k))?;
    for k in &keys {
        let raw = cluster::get_raw(alloc, cluster_root, *k, idx)?
            .ok_or_else(|| TarnError::stale("row vanished during column removal"))?;
        free_cell(alloc, group, tk, *k, &spec, raw, None)?;
    }

    if index_root.is_some() {
        RadixTree::from_ref(index_root).destroy(alloc)?;
    }
    let new_root = cluster::remove_column(alloc, cluster_root, idx)?;

    let info = group.table_mut(tk)?;
    info.cluster_root = new_root;
    info.columns.remove(idx);
    info.index_roots.remove(idx);
    // Column keys embed their position: re-index the survivors.
    for (i, spec) in info.columns.iter_mut().enumerate().skip(idx) {
        spec.key = ColKey::new(
            u16::try_from(i).expect("shrunk below the previous count"),
            spec.key.data_type(),
            spec.key.attrs(),
        );
    }

    // Backlink columns elsewhere reference this table's columns by key;
    // keys past the removed position shifted down by one.
    let table_keys: Vec<TableKey> = group.tables().map(|t| t.key).collect();
    for other_tk in table_keys {
        let other = group.table_mut(other_tk)?;
        for spec in &mut other.columns {
            if spec.is_backlink() && spec.target == Some(tk) {
                if let Some(origin) = spec.origin_col {
                    if origin.index() > idx {
                        spec.origin_col = Some(ColKey::new(
                            u16::try_from(origin.index() - 1).expect("fits"),
                            origin.data_type(),
                            origin.attrs(),
                        ));
                    }
                }
            }
        }
    }

    // A removed link column takes its backlink twin with it.
    if spec.key.data_type() == DataType::Link && !spec.is_backlink() {
        let target_tk = spec.target.ok_or_else(|| {
            TarnError::invalid_database("link column without a target table")
        })?;
        if let Ok(target_info) = group.table(target_tk) {
            if let Some(bl) = target_info
                .columns
                .iter()
                .find(|c| c.is_backlink() && c.target == Some(tk) && c.origin_col == Some(col))
            {
                let bl_key = bl.key;
                remove_column(alloc, group, target_tk, bl_key)?;
            }
        }
    }
    Ok(())
}

/// Build a search index over an existing column. Returns the column's
/// updated key (the indexed attribute is part of the key).
pub fn add_search_index(
    alloc: &mut SlabAlloc,
    group: &mut Group,
    tk: TableKey,
    col: ColKey,
) -> Result<ColKey> {
    let info = group.table(tk)?;
    let idx = info.col_index(col)?;
    if !col.data_type().is_indexable() {
        return Err(TarnError::logic(format!(
            "{:?} columns cannot carry a search index",
            col.data_type()
        )));
    }
    if info.index_roots[idx].is_some() {
        return Ok(col);
    }
    let cluster_root = info.cluster_root;
    let mut tree = RadixTree::create(alloc)?;
    let mut keys = Vec::new();
    cluster::for_each_key(alloc, cluster_root, &mut |k| keys.push(k))?;
    for k in keys {
        let raw = cluster::get_raw(alloc, cluster_root, k, idx)?
            .ok_or_else(|| TarnError::stale("row vanished during index build"))?;
        let value = column::decode(alloc, col, raw)?;
        tree.insert(alloc, &value, k)?;
    }

    let new_key = col.with_attrs(col.attrs() | ColumnAttr::INDEXED);
    let info = group.table_mut(tk)?;
    info.index_roots[idx] = tree.root_ref();
    info.columns[idx].key = new_key;
    Ok(new_key)
}

/// Drop a column's search index. Primary-key columns keep theirs.
pub fn remove_search_index(
    alloc: &mut SlabAlloc,
    group: &mut Group,
    tk: TableKey,
    col: ColKey,
) -> Result<ColKey> {
    if col.is_primary_key() {
        return Err(TarnError::logic("primary-key columns are always indexed"));
    }
    let info = group.table(tk)?;
    let idx = info.col_index(col)?;
    let root = info.index_roots[idx];
    if root.is_none() {
        return Ok(col);
    }
    RadixTree::from_ref(root).destroy(alloc)?;
    let new_key = col.with_attrs(col.attrs() - ColumnAttr::INDEXED);
    let info = group.table_mut(tk)?;
    info.index_roots[idx] = Ref::NONE;
    info.columns[idx].key = new_key;
    Ok(new_key)
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

/// Create an empty table.
pub fn add_table(alloc: &mut SlabAlloc, group: &mut Group, name: &str) -> Result<TableKey> {
    group.add_table(alloc, name)
}

/// Create a table whose first column is an indexed primary key.
pub fn add_table_with_primary_key(
    alloc: &mut SlabAlloc,
    group: &mut Group,
    name: &str,
    pk_name: &str,
    pk_type: DataType,
    nullable: bool,
) -> Result<TableKey> {
    if !pk_type.is_indexable() {
        return Err(TarnError::logic(format!(
            "{pk_type:?} cannot be a primary key"
        )));
    }
    let tk = group.add_table(alloc, name)?;
    let mut attrs = ColumnAttr::PRIMARY_KEY | ColumnAttr::INDEXED;
    if nullable {
        attrs |= ColumnAttr::NULLABLE;
    }
    add_column_raw(alloc, group, tk, pk_name, pk_type, attrs, None, None)?;
    Ok(tk)
}

/// Remove a table. Fails `CrossTableLinkTarget` while any other table's
/// link column still targets it.
pub fn remove_table(alloc: &mut SlabAlloc, group: &mut Group, tk: TableKey) -> Result<()> {
    let name = group.table(tk)?.name.clone();
    for other in group.tables() {
        if other.key == tk {
            continue;
        }
        for spec in &other.columns {
            if !spec.is_backlink()
                && spec.key.data_type() == DataType::Link
                && spec.target == Some(tk)
            {
                return Err(TarnError::CrossTableLinkTarget {
                    name,
                    origin: format!("{}.{}", other.name, spec.name),
                });
            }
        }
    }

    // Remove this table's own link columns first so backlink twins on
    // other tables disappear.
    loop {
        let link_col = group.table(tk)?.columns.iter().find_map(|c| {
            (!c.is_backlink() && c.key.data_type() == DataType::Link).then_some(c.key)
        });
        match link_col {
            Some(col) => remove_column(alloc, group, tk, col)?,
            None => break,
        }
    }

    // Free remaining storage.
    let info = group.table(tk)?.clone();
    let mut keys = Vec::new();
    cluster::for_each_key(alloc, info.cluster_root, &mut |k| keys.push(k))?;
    for (idx, spec) in info.columns.iter().enumerate() {
        for k in &keys {
            let raw = cluster::get_raw(alloc, info.cluster_root, *k, idx)?
                .ok_or_else(|| TarnError::stale("row vanished during table removal"))?;
            free_cell(alloc, group, tk, *k, spec, raw, None)?;
        }
        if info.index_roots[idx].is_some() {
            RadixTree::from_ref(info.index_roots[idx]).destroy(alloc)?;
        }
    }
    cluster::destroy(alloc, info.cluster_root)?;
    group.drop_table_slot(tk)?;
    debug!(table = %tk, "removed table");
    Ok(())
}

// ---------------------------------------------------------------------------
// Objects
// ---------------------------------------------------------------------------

fn defaults_for(info: &TableInfo) -> Vec<u64> {
    info.columns.iter().map(|c| column::default_raw(c.key)).collect()
}

/// Create an object with a caller-chosen key (placeholders, tombstones).
pub fn create_object_with_key(
    alloc: &mut SlabAlloc,
    group: &mut Group,
    tk: TableKey,
    key: ObjKey,
) -> Result<ObjKey> {
    let info = group.table(tk)?;
    let defaults = defaults_for(info);
    let new_root = cluster::insert_row(alloc, info.cluster_root, key, &defaults)?;

    // Indexed columns gain the default value for the new row.
    let mut new_index_roots: SmallVec<[(usize, Ref); 2]> = SmallVec::new();
    for (idx, spec) in info.columns.iter().enumerate() {
        let root = info.index_roots[idx];
        if root.is_some() {
            let default = column::decode(alloc, spec.key, column::default_raw(spec.key))?;
            let mut tree = RadixTree::from_ref(root);
            tree.insert(alloc, &default, key)?;
            new_index_roots.push((idx, tree.root_ref()));
        }
    }

    let info = group.table_mut(tk)?;
    info.cluster_root = new_root;
    for (idx, root) in new_index_roots {
        info.index_roots[idx] = root;
    }
    if key.0 >= info.next_key {
        info.next_key = key.0 + 1;
    }
    Ok(key)
}

/// Create an object with the next sequential key.
pub fn create_object(alloc: &mut SlabAlloc, group: &mut Group, tk: TableKey) -> Result<ObjKey> {
    let key = ObjKey(group.table(tk)?.next_key);
    create_object_with_key(alloc, group, tk, key)
}

/// Create an object identified by its primary key.
pub fn create_object_with_primary_key(
    alloc: &mut SlabAlloc,
    group: &mut Group,
    tk: TableKey,
    pk: &Mixed,
) -> Result<ObjKey> {
    let info = group.table(tk)?;
    let pk_spec = info.primary_key_column().ok_or_else(|| TarnError::logic(
        format!("table '{}' has no primary key", info.name),
    ))?;
    let pk_key = pk_spec.key;
    if pk.is_null() && !pk_key.is_nullable() {
        return Err(TarnError::MissingPrimaryKey {
            table: info.name.clone(),
        });
    }
    if find_by_primary_key(alloc, group, tk, pk)?.is_some() {
        return Err(TarnError::DuplicatePrimaryKey {
            table: group.table(tk)?.name.clone(),
        });
    }
    let key = create_object(alloc, group, tk)?;
    set_value_raw(alloc, group, tk, key, pk_key, pk)?;
    Ok(key)
}

/// Look an object up by primary-key value through the mandatory index.
pub fn find_by_primary_key(
    alloc: &SlabAlloc,
    group: &Group,
    tk: TableKey,
    pk: &Mixed,
) -> Result<Option<ObjKey>> {
    let info = group.table(tk)?;
    let pk_spec = info.primary_key_column().ok_or_else(|| TarnError::logic(
        format!("table '{}' has no primary key", info.name),
    ))?;
    let idx = info.col_index(pk_spec.key)?;
    let root = info.index_roots[idx];
    if root.is_none() {
        return Err(TarnError::invalid_database(
            "primary-key column is missing its search index",
        ));
    }
    RadixTree::from_ref(root).find_first(alloc, pk)
}

/// Whether the object exists.
pub fn object_exists(alloc: &SlabAlloc, group: &Group, tk: TableKey, key: ObjKey) -> Result<bool> {
    cluster::contains(alloc, group.table(tk)?.cluster_root, key)
}

/// Number of rows (tombstones included).
pub fn row_count(alloc: &SlabAlloc, group: &Group, tk: TableKey) -> Result<u64> {
    cluster::row_count(alloc, group.table(tk)?.cluster_root)
}

/// Visit every row key in key order.
pub fn for_each_key<F: FnMut(ObjKey)>(
    alloc: &SlabAlloc,
    group: &Group,
    tk: TableKey,
    f: &mut F,
) -> Result<()> {
    cluster::for_each_key(alloc, group.table(tk)?.cluster_root, f)
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// Read one value. Collection columns return their placeholder.
pub fn get_value(
    alloc: &SlabAlloc,
    group: &Group,
    tk: TableKey,
    key: ObjKey,
    col: ColKey,
) -> Result<Mixed> {
    let info = group.table(tk)?;
    let idx = info.col_index(col)?;
    if col.attrs().contains(ColumnAttr::DICTIONARY) {
        return Ok(Mixed::Dictionary);
    }
    if col.attrs().is_collection() {
        return Ok(Mixed::List);
    }
    let raw = cluster::get_raw(alloc, info.cluster_root, key, idx)?
        .ok_or_else(|| TarnError::stale(format!("row {key} no longer exists")))?;
    column::decode(alloc, col, raw)
}

/// Write one value, maintaining indexes and backlinks.
pub fn set_value(
    alloc: &mut SlabAlloc,
    group: &mut Group,
    tk: TableKey,
    key: ObjKey,
    col: ColKey,
    value: &Mixed,
) -> Result<()> {
    if col.is_primary_key() {
        return Err(TarnError::logic("primary-key values are immutable"));
    }
    set_value_raw(alloc, group, tk, key, col, value)
}

fn set_value_raw(
    alloc: &mut SlabAlloc,
    group: &mut Group,
    tk: TableKey,
    key: ObjKey,
    col: ColKey,
    value: &Mixed,
) -> Result<()> {
    let info = group.table(tk)?;
    let idx = info.col_index(col)?;
    if col.attrs().is_collection() {
        return Err(TarnError::logic("collections are edited through list calls"));
    }
    let spec = info.columns[idx].clone();
    let cluster_root = info.cluster_root;
    let index_root = info.index_roots[idx];

    let old_raw = cluster::get_raw(alloc, cluster_root, key, idx)?
        .ok_or_else(|| TarnError::stale(format!("row {key} no longer exists")))?;
    let old_value = column::decode(alloc, col, old_raw)?;

    // Link columns keep the reciprocal backlink in step.
    if spec.key.data_type() == DataType::Link && !spec.is_backlink() {
        let target_tk = spec.target.ok_or_else(|| {
            TarnError::invalid_database("link column without a target table")
        })?;
        if let Mixed::Link(new_target) = value {
            if !object_exists(alloc, group, target_tk, *new_target)? {
                return Err(TarnError::logic(format!(
                    "link target {new_target} does not exist"
                )));
            }
        }
        if let Mixed::Link(old_target) = old_value {
            backlink_remove(alloc, group, target_tk, old_target, tk, col, key)?;
        }
        if let Mixed::Link(new_target) = value {
            backlink_add(alloc, group, target_tk, *new_target, tk, col, key)?;
        }
    }

    let new_raw = column::encode(alloc, col, value)?;
    column::free_raw(alloc, col, old_raw)?;
    let cluster_root = group.table(tk)?.cluster_root;
    let (new_root, _) = cluster::set_raw(alloc, cluster_root, key, idx, new_raw)?;

    let mut new_index_root = None;
    if index_root.is_some() {
        let mut tree = RadixTree::from_ref(index_root);
        tree.erase(alloc, &old_value, key)?;
        tree.insert(alloc, value, key)?;
        new_index_root = Some(tree.root_ref());
    }

    let info = group.table_mut(tk)?;
    info.cluster_root = new_root;
    if let Some(root) = new_index_root {
        info.index_roots[idx] = root;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Backlinks
// ---------------------------------------------------------------------------

fn backlink_col_index(
    target_info: &TableInfo,
    origin_tk: TableKey,
    origin_col: ColKey,
) -> Result<usize> {
    target_info
        .columns
        .iter()
        .position(|c| {
            c.is_backlink() && c.target == Some(origin_tk) && c.origin_col == Some(origin_col)
        })
        .ok_or_else(|| {
            TarnError::invalid_database(format!(
                "missing backlink column for {origin_col} in table '{}'",
                target_info.name
            ))
        })
}

fn backlink_add(
    alloc: &mut SlabAlloc,
    group: &mut Group,
    target_tk: TableKey,
    target_key: ObjKey,
    origin_tk: TableKey,
    origin_col: ColKey,
    origin_key: ObjKey,
) -> Result<()> {
    let target_info = group.table(target_tk)?;
    let idx = backlink_col_index(target_info, origin_tk, origin_col)?;
    let cluster_root = target_info.cluster_root;
    let raw = cluster::get_raw(alloc, cluster_root, target_key, idx)?
        .ok_or_else(|| TarnError::stale(format!("link target {target_key} vanished")))?;
    let new_raw = match RefOrTagged::unpack(raw) {
        RefOrTagged::Ref(r) if r.is_none() => RefOrTagged::Tagged(origin_key.0).pack(),
        RefOrTagged::Tagged(existing) => {
            let mut both = [ObjKey(existing), origin_key];
            both.sort();
            RefOrTagged::Ref(keyset_create(alloc, &both)?).pack()
        }
        RefOrTagged::Ref(list) => {
            RefOrTagged::Ref(keyset_insert(alloc, list, origin_key)?).pack()
        }
    };
    let (new_root, _) = cluster::set_raw(alloc, cluster_root, target_key, idx, new_raw)?;
    group.table_mut(target_tk)?.cluster_root = new_root;
    Ok(())
}

fn backlink_remove(
    alloc: &mut SlabAlloc,
    group: &mut Group,
    target_tk: TableKey,
    target_key: ObjKey,
    origin_tk: TableKey,
    origin_col: ColKey,
    origin_key: ObjKey,
) -> Result<()> {
    let target_info = group.table(target_tk)?;
    let idx = backlink_col_index(target_info, origin_tk, origin_col)?;
    let cluster_root = target_info.cluster_root;
    let Some(raw) = cluster::get_raw(alloc, cluster_root, target_key, idx)? else {
        return Ok(()); // target already gone (cascade ordering)
    };
    let new_raw = match RefOrTagged::unpack(raw) {
        RefOrTagged::Ref(r) if r.is_none() => return Ok(()),
        RefOrTagged::Tagged(existing) => {
            if existing != origin_key.0 {
                return Ok(());
            }
            0
        }
        RefOrTagged::Ref(list) => match keyset_erase(alloc, list, origin_key)? {
            (None, _) => 0,
            (Some(rest), 1) => {
                let survivor = keyset_keys(alloc, rest)?[0];
                let (freed, _) = keyset_erase(alloc, rest, survivor)?;
                debug_assert!(freed.is_none());
                RefOrTagged::Tagged(survivor.0).pack()
            }
            (Some(rest), _) => RefOrTagged::Ref(rest).pack(),
        },
    };
    let (new_root, _) = cluster::set_raw(alloc, cluster_root, target_key, idx, new_raw)?;
    group.table_mut(target_tk)?.cluster_root = new_root;
    Ok(())
}

/// All origin keys linking into `(tk, key)` through `backlink_col`.
pub fn get_backlinks(
    alloc: &SlabAlloc,
    group: &Group,
    tk: TableKey,
    key: ObjKey,
    backlink_col: ColKey,
) -> Result<Vec<ObjKey>> {
    let info = group.table(tk)?;
    let idx = info.col_index(backlink_col)?;
    let raw = cluster::get_raw(alloc, info.cluster_root, key, idx)?
        .ok_or_else(|| TarnError::stale(format!("row {key} no longer exists")))?;
    Ok(match RefOrTagged::unpack(raw) {
        RefOrTagged::Ref(r) if r.is_none() => Vec::new(),
        RefOrTagged::Tagged(origin) => vec![ObjKey(origin)],
        RefOrTagged::Ref(list) => keyset_keys(alloc, list)?,
    })
}

// ---------------------------------------------------------------------------
// Collections
// ---------------------------------------------------------------------------

/// The element key a collection column's entries are encoded with.
fn element_key(col: ColKey) -> ColKey {
    let attrs = col.attrs()
        - ColumnAttr::LIST
        - ColumnAttr::SET
        - ColumnAttr::DICTIONARY
        - ColumnAttr::INDEXED
        - ColumnAttr::PRIMARY_KEY;
    ColKey::new(
        u16::try_from(col.index()).expect("column index fits"),
        col.data_type(),
        attrs,
    )
}

fn collection_tree(
    alloc: &SlabAlloc,
    group: &Group,
    tk: TableKey,
    key: ObjKey,
    col: ColKey,
) -> Result<(usize, Option<BpTree>)> {
    let info = group.table(tk)?;
    let idx = info.col_index(col)?;
    if !col.attrs().is_collection() {
        return Err(TarnError::logic(format!("{col} is not a collection column")));
    }
    let raw = cluster::get_raw(alloc, info.cluster_root, key, idx)?
        .ok_or_else(|| TarnError::stale(format!("row {key} no longer exists")))?;
    let root = column::collection_ref(raw);
    Ok((idx, root.is_some().then(|| BpTree::from_ref(root))))
}

fn store_collection_root(
    alloc: &mut SlabAlloc,
    group: &mut Group,
    tk: TableKey,
    key: ObjKey,
    idx: usize,
    root: Ref,
) -> Result<()> {
    let cluster_root = group.table(tk)?.cluster_root;
    let (new_root, _) =
        cluster::set_raw(alloc, cluster_root, key, idx, RefOrTagged::Ref(root).pack())?;
    group.table_mut(tk)?.cluster_root = new_root;
    Ok(())
}

/// Number of elements in a collection.
pub fn list_size(
    alloc: &SlabAlloc,
    group: &Group,
    tk: TableKey,
    key: ObjKey,
    col: ColKey,
) -> Result<u64> {
    let (_, tree) = collection_tree(alloc, group, tk, key, col)?;
    tree.map_or(Ok(0), |t| t.size(alloc))
}

/// All elements of a collection, in order.
pub fn list_get_all(
    alloc: &SlabAlloc,
    group: &Group,
    tk: TableKey,
    key: ObjKey,
    col: ColKey,
) -> Result<Vec<Mixed>> {
    let (_, tree) = collection_tree(alloc, group, tk, key, col)?;
    let Some(tree) = tree else {
        return Ok(Vec::new());
    };
    let elem = element_key(col);
    tree.to_vec(alloc)?
        .into_iter()
        .map(|raw| column::decode(alloc, elem, raw))
        .collect()
}

/// One element of a collection.
pub fn list_get(
    alloc: &SlabAlloc,
    group: &Group,
    tk: TableKey,
    key: ObjKey,
    col: ColKey,
    pos: u64,
) -> Result<Mixed> {
    let (_, tree) = collection_tree(alloc, group, tk, key, col)?;
    let tree = tree.ok_or(TarnError::OutOfBounds {
        what: "list index",
        index: usize::try_from(pos).unwrap_or(usize::MAX),
        size: 0,
    })?;
    column::decode(alloc, element_key(col), tree.get(alloc, pos)?)
}

/// Insert an element at `pos` (set columns ignore `pos` and keep sorted
/// unique order; duplicate inserts are a no-op).
pub fn list_insert(
    alloc: &mut SlabAlloc,
    group: &mut Group,
    tk: TableKey,
    key: ObjKey,
    col: ColKey,
    pos: u64,
    value: &Mixed,
) -> Result<()> {
    let (idx, tree) = collection_tree(alloc, group, tk, key, col)?;
    let elem = element_key(col);

    if col.data_type() == DataType::Link {
        let target_tk = link_target(group, tk, col)?;
        if let Mixed::Link(t) = value {
            if !object_exists(alloc, group, target_tk, *t)? {
                return Err(TarnError::logic(format!("link target {t} does not exist")));
            }
        }
    }

    let mut tree = match tree {
        Some(t) => t,
        None => BpTree::create(alloc)?,
    };

    let pos = if col.attrs().contains(ColumnAttr::SET) {
        // Sorted unique membership.
        let existing = tree.to_vec(alloc)?;
        let mut at = existing.len() as u64;
        for (i, raw) in existing.iter().enumerate() {
            let v = column::decode(alloc, elem, *raw)?;
            match v.total_cmp(value) {
                std::cmp::Ordering::Equal => return Ok(()),
                std::cmp::Ordering::Greater => {
                    at = i as u64;
                    break;
                }
                std::cmp::Ordering::Less => {}
            }
        }
        at
    } else {
        let size = tree.size(alloc)?;
        if pos > size {
            return Err(TarnError::OutOfBounds {
                what: "list insert position",
                index: usize::try_from(pos).unwrap_or(usize::MAX),
                size: usize::try_from(size).unwrap_or(usize::MAX),
            });
        }
        pos
    };

    let raw = column::encode(alloc, elem, value)?;
    tree.insert(alloc, pos, raw)?;
    store_collection_root(alloc, group, tk, key, idx, tree.root_ref())?;

    if col.data_type() == DataType::Link {
        if let Mixed::Link(t) = value {
            let target_tk = link_target(group, tk, col)?;
            backlink_add(alloc, group, target_tk, *t, tk, col, key)?;
        }
    }
    Ok(())
}

/// Remove the element at `pos`.
pub fn list_erase(
    alloc: &mut SlabAlloc,
    group: &mut Group,
    tk: TableKey,
    key: ObjKey,
    col: ColKey,
    pos: u64,
) -> Result<()> {
    let (idx, tree) = collection_tree(alloc, group, tk, key, col)?;
    let mut tree = tree.ok_or(TarnError::OutOfBounds {
        what: "list index",
        index: usize::try_from(pos).unwrap_or(usize::MAX),
        size: 0,
    })?;
    let elem = element_key(col);
    let raw = tree.get(alloc, pos)?;
    let value = column::decode(alloc, elem, raw)?;
    column::free_raw(alloc, elem, raw)?;
    tree.erase(alloc, pos)?;
    store_collection_root(alloc, group, tk, key, idx, tree.root_ref())?;

    if col.data_type() == DataType::Link {
        if let Mixed::Link(t) = value {
            let target_tk = link_target(group, tk, col)?;
            backlink_remove(alloc, group, target_tk, t, tk, col, key)?;
        }
    }
    Ok(())
}

fn link_target(group: &Group, tk: TableKey, col: ColKey) -> Result<TableKey> {
    let info = group.table(tk)?;
    let idx = info.col_index(col)?;
    info.columns[idx]
        .target
        .ok_or_else(|| TarnError::invalid_database("link column without a target table"))
}

// ---------------------------------------------------------------------------
// Removal and cascade
// ---------------------------------------------------------------------------

/// Compute the cascade set for removing `(tk, key)` without touching
/// anything.
pub fn compute_cascade(
    alloc: &SlabAlloc,
    group: &Group,
    tk: TableKey,
    key: ObjKey,
) -> Result<CascadeNotification> {
    let mut removed: HashSet<(TableKey, ObjKey)> = HashSet::new();
    removed.insert((tk, key));
    let mut queue = vec![(tk, key)];
    let mut rows = Vec::new();

    while let Some((cur_tk, cur_key)) = queue.pop() {
        let info = group.table(cur_tk)?;
        for (idx, spec) in info.columns.iter().enumerate() {
            if spec.is_backlink()
                || spec.key.data_type() != DataType::Link
                || !spec.key.attrs().contains(ColumnAttr::STRONG)
            {
                continue;
            }
            let target_tk = spec.target.ok_or_else(|| {
                TarnError::invalid_database("link column without a target table")
            })?;
            let mut targets = Vec::new();
            if spec.key.attrs().is_collection() {
                for v in list_get_all(alloc, group, cur_tk, cur_key, spec.key)? {
                    if let Mixed::Link(t) = v {
                        targets.push(t);
                    }
                }
            } else {
                let raw = cluster::get_raw(alloc, info.cluster_root, cur_key, idx)?
                    .ok_or_else(|| TarnError::stale("row vanished during cascade"))?;
                if let Mixed::Link(t) = column::decode(alloc, spec.key, raw)? {
                    targets.push(t);
                }
            }
            for t in targets {
                if removed.insert((target_tk, t)) {
                    rows.push((target_tk, t));
                    queue.push((target_tk, t));
                }
            }
        }
    }

    // Every incoming link to a removed row is broken.
    let mut links = Vec::new();
    for (cur_tk, cur_key) in &removed {
        let info = group.table(*cur_tk)?;
        for spec in &info.columns {
            if !spec.is_backlink() {
                continue;
            }
            let origin_tk = spec.target.ok_or_else(|| {
                TarnError::invalid_database("backlink column without an origin table")
            })?;
            let origin_col = spec.origin_col.ok_or_else(|| {
                TarnError::invalid_database("backlink column without an origin column")
            })?;
            for origin_key in get_backlinks(alloc, group, *cur_tk, *cur_key, spec.key)? {
                links.push(BrokenLink {
                    origin_table: origin_tk,
                    origin_col,
                    origin_key,
                    old_target: *cur_key,
                });
            }
        }
    }
    links.sort_by_key(|l| (l.origin_table, l.origin_key, l.origin_col));
    rows.sort_unstable_by_key(|(t, k)| (*t, *k));
    Ok(CascadeNotification { rows, links })
}

/// Remove an object and everything its strong links own. The handler (if
/// any) observes the cascade set before the removal executes.
pub fn remove_object(
    alloc: &mut SlabAlloc,
    group: &mut Group,
    tk: TableKey,
    key: ObjKey,
    handler: Option<CascadeHandler<'_>>,
) -> Result<()> {
    if !object_exists(alloc, group, tk, key)? {
        return Err(TarnError::stale(format!("row {key} no longer exists")));
    }
    let cascade = compute_cascade(alloc, group, tk, key)?;
    if let Some(handler) = handler {
        handler(&cascade);
    }

    let mut removed: HashSet<(TableKey, ObjKey)> = HashSet::new();
    removed.insert((tk, key));
    removed.extend(cascade.rows.iter().copied());

    // Nullify surviving origins' links into the doomed rows.
    for broken in &cascade.links {
        if removed.contains(&(broken.origin_table, broken.origin_key)) {
            continue;
        }
        if broken.origin_col.attrs().is_collection() {
            // Remove every occurrence of the target from the list.
            loop {
                let all = list_get_all(
                    alloc,
                    group,
                    broken.origin_table,
                    broken.origin_key,
                    broken.origin_col,
                )?;
                let Some(pos) = all
                    .iter()
                    .position(|v| matches!(v, Mixed::Link(t) if *t == broken.old_target))
                else {
                    break;
                };
                list_erase(
                    alloc,
                    group,
                    broken.origin_table,
                    broken.origin_key,
                    broken.origin_col,
                    pos as u64,
                )?;
            }
        } else {
            set_value_raw(
                alloc,
                group,
                broken.origin_table,
                broken.origin_key,
                broken.origin_col,
                &Mixed::Null,
            )?;
        }
    }

    // Tear the rows down.
    for (cur_tk, cur_key) in &removed {
        erase_single_row(alloc, group, *cur_tk, *cur_key, &removed)?;
    }
    Ok(())
}

/// Free one row's storage and erase it, without cascading (the cascade set
/// was computed up front).
fn erase_single_row(
    alloc: &mut SlabAlloc,
    group: &mut Group,
    tk: TableKey,
    key: ObjKey,
    removed: &HashSet<(TableKey, ObjKey)>,
) -> Result<()> {
    // Re-fetch per column: self-link backlink maintenance can relocate
    // this table's own cluster root mid-teardown.
    let ncols = group.table(tk)?.columns.len();
    for idx in 0..ncols {
        let info = group.table(tk)?;
        let spec = info.columns[idx].clone();
        let root = info.index_roots[idx];
        let Some(raw) = cluster::get_raw(alloc, info.cluster_root, key, idx)? else {
            return Ok(()); // already erased through another path
        };
        free_cell(alloc, group, tk, key, &spec, raw, Some(removed))?;
        // Indexed columns drop the row's value.
        if root.is_some() {
            let value = column::decode(alloc, spec.key, raw)?;
            let mut tree = RadixTree::from_ref(root);
            tree.erase(alloc, &value, key)?;
            group.table_mut(tk)?.index_roots[idx] = tree.root_ref();
        }
    }
    let cluster_root = group.table(tk)?.cluster_root;
    let new_root = cluster::erase_row(alloc, cluster_root, key)?;
    group.table_mut(tk)?.cluster_root = new_root;
    Ok(())
}

/// Free the heap storage one cell owns: blobs, collection trees, and (for
/// outgoing links) the reciprocal backlink entries on surviving targets.
fn free_cell(
    alloc: &mut SlabAlloc,
    group: &mut Group,
    tk: TableKey,
    key: ObjKey,
    spec: &ColumnSpec,
    raw: u64,
    removed: Option<&HashSet<(TableKey, ObjKey)>>,
) -> Result<()> {
    let col = spec.key;
    let is_link = col.data_type() == DataType::Link && !spec.is_backlink();

    if spec.is_backlink() {
        // Surviving origins were nullified before teardown; whatever list
        // node remains belongs to doomed origins.
        if let RefOrTagged::Ref(list) = RefOrTagged::unpack(raw) {
            if list.is_some() {
                tarn_node::Array::init_from_ref(alloc, list)?.destroy_deep(alloc)?;
            }
        }
        return Ok(());
    }

    if col.attrs().is_collection() {
        let root = column::collection_ref(raw);
        if root.is_some() {
            let tree = BpTree::from_ref(root);
            let elem = element_key(col);
            for elem_raw in tree.to_vec(alloc)? {
                if is_link {
                    if let Mixed::Link(t) = column::decode(alloc, elem, elem_raw)? {
                        let target_tk = spec.target.ok_or_else(|| {
                            TarnError::invalid_database("link column without a target table")
                        })?;
                        let survives =
                            removed.map_or(true, |set| !set.contains(&(target_tk, t)));
                        if survives {
                            backlink_remove(alloc, group, target_tk, t, tk, col, key)?;
                        }
                    }
                } else {
                    column::free_raw(alloc, elem, elem_raw)?;
                }
            }
            tree.destroy(alloc)?;
        }
        return Ok(());
    }

    if is_link {
        if let Mixed::Link(t) = column::decode(alloc, col, raw)? {
            let target_tk = spec.target.ok_or_else(|| {
                TarnError::invalid_database("link column without a target table")
            })?;
            let survives = removed.map_or(true, |set| !set.contains(&(target_tk, t)));
            if survives {
                backlink_remove(alloc, group, target_tk, t, tk, col, key)?;
            }
        }
        return Ok(());
    }

    column::free_raw(alloc, col, raw)
}

/// Soft-delete: replace the object with a tombstone twin that keeps only
/// the primary-key value, for sync conflict resolution.
pub fn invalidate_object(
    alloc: &mut SlabAlloc,
    group: &mut Group,
    tk: TableKey,
    key: ObjKey,
) -> Result<ObjKey> {
    let info = group.table(tk)?;
    let pk = info
        .primary_key_column()
        .map(|spec| get_value(alloc, group, tk, key, spec.key))
        .transpose()?;
    remove_object(alloc, group, tk, key, None)?;

    let tombstone = key.toggled_tombstone();
    create_object_with_key(alloc, group, tk, tombstone)?;
    if let Some(pk_value) = pk {
        let pk_key = group
            .table(tk)?
            .primary_key_column()
            .expect("checked above")
            .key;
        set_value_raw(alloc, group, tk, tombstone, pk_key, &pk_value)?;
    }
    Ok(tombstone)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (SlabAlloc, Group) {
        (SlabAlloc::new_scratch(), Group::default())
    }

    #[test]
    fn scalar_columns_round_trip() {
        let (mut alloc, mut group) = setup();
        let tk = add_table(&mut alloc, &mut group, "person").unwrap();
        let age = add_column(
            &mut alloc,
            &mut group,
            tk,
            "age",
            DataType::Int,
            ColumnAttr::NULLABLE,
        )
        .unwrap();
        let name = add_column(
            &mut alloc,
            &mut group,
            tk,
            "name",
            DataType::String,
            ColumnAttr::empty(),
        )
        .unwrap();
        let k = create_object(&mut alloc, &mut group, tk).unwrap();
        assert_eq!(get_value(&alloc, &group, tk, k, age).unwrap(), Mixed::Null);
        assert_eq!(
            get_value(&alloc, &group, tk, k, name).unwrap(),
            Mixed::from("")
        );
        set_value(&mut alloc, &mut group, tk, k, age, &Mixed::Int(30)).unwrap();
        set_value(&mut alloc, &mut group, tk, k, name, &Mixed::from("ada")).unwrap();
        assert_eq!(get_value(&alloc, &group, tk, k, age).unwrap(), Mixed::Int(30));
        assert_eq!(
            get_value(&alloc, &group, tk, k, name).unwrap(),
            Mixed::from("ada")
        );
    }

    #[test]
    fn primary_key_unique_and_immutable() {
        let (mut alloc, mut group) = setup();
        let tk = add_table_with_primary_key(
            &mut alloc,
            &mut group,
            "account",
            "id",
            DataType::Int,
            false,
        )
        .unwrap();
        let pk_col = group.table(tk).unwrap().primary_key_column().unwrap().key;
        let a = create_object_with_primary_key(&mut alloc, &mut group, tk, &Mixed::Int(1)).unwrap();
        assert!(matches!(
            create_object_with_primary_key(&mut alloc, &mut group, tk, &Mixed::Int(1)),
            Err(TarnError::DuplicatePrimaryKey { .. })
        ));
        assert!(matches!(
            create_object_with_primary_key(&mut alloc, &mut group, tk, &Mixed::Null),
            Err(TarnError::MissingPrimaryKey { .. })
        ));
        assert!(set_value(&mut alloc, &mut group, tk, a, pk_col, &Mixed::Int(9)).is_err());
        assert_eq!(
            find_by_primary_key(&alloc, &group, tk, &Mixed::Int(1)).unwrap(),
            Some(a)
        );
    }

    #[test]
    fn index_stays_consistent_with_column() {
        let (mut alloc, mut group) = setup();
        let tk = add_table(&mut alloc, &mut group, "t").unwrap();
        let col = add_column(
            &mut alloc,
            &mut group,
            tk,
            "x",
            DataType::Int,
            ColumnAttr::NULLABLE,
        )
        .unwrap();
        let keys: Vec<ObjKey> = (0..10)
            .map(|_| create_object(&mut alloc, &mut group, tk).unwrap())
            .collect();
        for (i, k) in keys.iter().enumerate() {
            set_value(&mut alloc, &mut group, tk, *k, col, &Mixed::Int(i as i64 % 3)).unwrap();
        }
        let col = add_search_index(&mut alloc, &mut group, tk, col).unwrap();
        assert!(col.is_indexed());

        // P4: every row's value is findable through the index.
        let idx = group.table(tk).unwrap().col_index(col).unwrap();
        let tree = RadixTree::from_ref(group.table(tk).unwrap().index_roots[idx]);
        for k in &keys {
            let v = get_value(&alloc, &group, tk, *k, col).unwrap();
            assert!(tree.find_all(&alloc, &v).unwrap().contains(k));
        }

        // Updates keep the index in step.
        set_value(&mut alloc, &mut group, tk, keys[0], col, &Mixed::Int(99)).unwrap();
        let tree = RadixTree::from_ref(
            group.table(tk).unwrap().index_roots[idx],
        );
        assert_eq!(tree.find_all(&alloc, &Mixed::Int(99)).unwrap(), vec![keys[0]]);
        assert!(!tree.find_all(&alloc, &Mixed::Int(0)).unwrap().contains(&keys[0]));
    }

    #[test]
    fn backlink_reciprocity() {
        let (mut alloc, mut group) = setup();
        let target = add_table(&mut alloc, &mut group, "target").unwrap();
        let origin = add_table(&mut alloc, &mut group, "origin").unwrap();
        let link = add_column_link(
            &mut alloc,
            &mut group,
            origin,
            "link",
            false,
            target,
            false,
        )
        .unwrap();

        let t1 = create_object(&mut alloc, &mut group, target).unwrap();
        let o1 = create_object(&mut alloc, &mut group, origin).unwrap();
        let o2 = create_object(&mut alloc, &mut group, origin).unwrap();
        set_value(&mut alloc, &mut group, origin, o1, link, &Mixed::Link(t1)).unwrap();
        set_value(&mut alloc, &mut group, origin, o2, link, &Mixed::Link(t1)).unwrap();

        // P5: the backlink column mirrors both links.
        let bl = group
            .table(target)
            .unwrap()
            .columns
            .iter()
            .find(|c| c.is_backlink())
            .unwrap()
            .key;
        assert_eq!(
            get_backlinks(&alloc, &group, target, t1, bl).unwrap(),
            vec![o1, o2]
        );

        // Nulling one link removes exactly its backlink.
        set_value(&mut alloc, &mut group, origin, o1, link, &Mixed::Null).unwrap();
        assert_eq!(
            get_backlinks(&alloc, &group, target, t1, bl).unwrap(),
            vec![o2]
        );
    }

    #[test]
    fn cascade_delete_scenario() {
        // Table O with a strong link to table T; removing o1 cascades to
        // t1 and reports the broken link.
        let (mut alloc, mut group) = setup();
        let t = add_table(&mut alloc, &mut group, "T").unwrap();
        let o = add_table(&mut alloc, &mut group, "O").unwrap();
        let link_col =
            add_column_link(&mut alloc, &mut group, o, "child", false, t, true).unwrap();

        let t1 = create_object(&mut alloc, &mut group, t).unwrap();
        let o1 = create_object(&mut alloc, &mut group, o).unwrap();
        set_value(&mut alloc, &mut group, o, o1, link_col, &Mixed::Link(t1)).unwrap();

        let mut seen = None;
        remove_object(
            &mut alloc,
            &mut group,
            o,
            o1,
            Some(&mut |n: &CascadeNotification| seen = Some(n.clone())),
        )
        .unwrap();

        let n = seen.expect("handler must run");
        assert_eq!(n.rows, vec![(t, t1)]);
        assert_eq!(
            n.links,
            vec![BrokenLink {
                origin_table: o,
                origin_col: link_col,
                origin_key: o1,
                old_target: t1,
            }]
        );
        assert_eq!(row_count(&alloc, &group, t).unwrap(), 0, "T ends empty");
        assert_eq!(row_count(&alloc, &group, o).unwrap(), 0);
    }

    #[test]
    fn weak_links_nullify_instead_of_cascading() {
        let (mut alloc, mut group) = setup();
        let t = add_table(&mut alloc, &mut group, "T").unwrap();
        let o = add_table(&mut alloc, &mut group, "O").unwrap();
        let link_col =
            add_column_link(&mut alloc, &mut group, o, "ref", false, t, false).unwrap();
        let t1 = create_object(&mut alloc, &mut group, t).unwrap();
        let o1 = create_object(&mut alloc, &mut group, o).unwrap();
        set_value(&mut alloc, &mut group, o, o1, link_col, &Mixed::Link(t1)).unwrap();

        // Removing the *target* nullifies the origin's link.
        remove_object(&mut alloc, &mut group, t, t1, None).unwrap();
        assert_eq!(
            get_value(&alloc, &group, o, o1, link_col).unwrap(),
            Mixed::Null
        );
        assert_eq!(row_count(&alloc, &group, o).unwrap(), 1);
    }

    #[test]
    fn link_lists_and_backlinks() {
        let (mut alloc, mut group) = setup();
        let t = add_table(&mut alloc, &mut group, "T").unwrap();
        let o = add_table(&mut alloc, &mut group, "O").unwrap();
        let list_col =
            add_column_link(&mut alloc, &mut group, o, "children", true, t, false).unwrap();
        let t1 = create_object(&mut alloc, &mut group, t).unwrap();
        let t2 = create_object(&mut alloc, &mut group, t).unwrap();
        let o1 = create_object(&mut alloc, &mut group, o).unwrap();

        list_insert(&mut alloc, &mut group, o, o1, list_col, 0, &Mixed::Link(t1)).unwrap();
        list_insert(&mut alloc, &mut group, o, o1, list_col, 1, &Mixed::Link(t2)).unwrap();
        assert_eq!(list_size(&alloc, &group, o, o1, list_col).unwrap(), 2);
        assert_eq!(
            list_get(&alloc, &group, o, o1, list_col, 0).unwrap(),
            Mixed::Link(t1)
        );

        let bl = group
            .table(t)
            .unwrap()
            .columns
            .iter()
            .find(|c| c.is_backlink())
            .unwrap()
            .key;
        assert_eq!(get_backlinks(&alloc, &group, t, t2, bl).unwrap(), vec![o1]);

        // Removing t2 drops it from the list.
        remove_object(&mut alloc, &mut group, t, t2, None).unwrap();
        assert_eq!(
            list_get_all(&alloc, &group, o, o1, list_col).unwrap(),
            vec![Mixed::Link(t1)]
        );
    }

    #[test]
    fn remove_table_link_target_protection() {
        let (mut alloc, mut group) = setup();
        let t = add_table(&mut alloc, &mut group, "T").unwrap();
        let o = add_table(&mut alloc, &mut group, "O").unwrap();
        add_column_link(&mut alloc, &mut group, o, "ref", false, t, false).unwrap();

        assert!(matches!(
            remove_table(&mut alloc, &mut group, t),
            Err(TarnError::CrossTableLinkTarget { .. })
        ));
        // Removing the origin table first clears the way.
        remove_table(&mut alloc, &mut group, o).unwrap();
        remove_table(&mut alloc, &mut group, t).unwrap();
    }

    #[test]
    fn value_sets_keep_sorted_unique_membership() {
        let (mut alloc, mut group) = setup();
        let tk = add_table(&mut alloc, &mut group, "t").unwrap();
        let col = add_column(
            &mut alloc,
            &mut group,
            tk,
            "tags",
            DataType::Int,
            ColumnAttr::SET | ColumnAttr::NULLABLE,
        )
        .unwrap();
        let k = create_object(&mut alloc, &mut group, tk).unwrap();
        for v in [5_i64, 1, 5, 3, 1] {
            list_insert(&mut alloc, &mut group, tk, k, col, 0, &Mixed::Int(v)).unwrap();
        }
        assert_eq!(
            list_get_all(&alloc, &group, tk, k, col).unwrap(),
            vec![Mixed::Int(1), Mixed::Int(3), Mixed::Int(5)]
        );
    }

    #[test]
    fn invalidate_leaves_a_tombstone() {
        let (mut alloc, mut group) = setup();
        let tk = add_table_with_primary_key(
            &mut alloc,
            &mut group,
            "acct",
            "id",
            DataType::Int,
            false,
        )
        .unwrap();
        let k =
            create_object_with_primary_key(&mut alloc, &mut group, tk, &Mixed::Int(7)).unwrap();
        let dead = invalidate_object(&mut alloc, &mut group, tk, k).unwrap();
        assert!(dead.is_tombstone());
        assert!(!object_exists(&alloc, &group, tk, k).unwrap());
        assert!(object_exists(&alloc, &group, tk, dead).unwrap());
        // The tombstone keeps the primary key for conflict resolution.
        assert_eq!(
            find_by_primary_key(&alloc, &group, tk, &Mixed::Int(7)).unwrap(),
            Some(dead)
        );
    }
}
