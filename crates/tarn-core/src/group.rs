//! The group: schema registry and top-array serialization.
//!
//! The top array is the root of every snapshot. Slot order is part of the
//! file format:
//!
//! ```text
//! 0  table names      (ref: array of name-blob refs, 0 per free slot)
//! 1  table tops       (ref: array of table-top refs, or a tagged
//!                      generation marking a freed position)
//! 2  logical file size (tagged)
//! 3  free positions   (ref)
//! 4  free sizes       (ref)
//! 5  free versions    (ref)
//! 6  current version  (tagged)
//! 7  history type     (tagged)      ─┐
//! 8  history ref      (ref)          │ present only on sync
//! 9  history schema version (tagged) │ snapshots
//! 10 sync file ident  (tagged)       │
//! 11 evacuation point (tagged)      ─┘
//! ```
//!
//! A freed table position keeps its last generation tag in the table-tops
//! array, so a table created later at the same position gets a fresh
//! generation and old [`TableKey`]s can never alias it.

use tarn_alloc::{FreeEntry, SlabAlloc};
use tarn_error::{Result, TarnError};
use tarn_node::{Array, ArrayKind, blob};
use tarn_types::{ColKey, ColumnAttr, Ref, RefOrTagged, TableKey, VersionId};
use tracing::{debug, info};

use crate::cluster;

/// Slot indices in the top array.
const TOP_NAMES: usize = 0;
const TOP_TABLES: usize = 1;
const TOP_LOGICAL_SIZE: usize = 2;
const TOP_FREE_POSITIONS: usize = 3;
const TOP_FREE_SIZES: usize = 4;
const TOP_FREE_VERSIONS: usize = 5;
const TOP_VERSION: usize = 6;
const TOP_HISTORY_TYPE: usize = 7;
const TOP_HISTORY_REF: usize = 8;
const TOP_HISTORY_SCHEMA_VERSION: usize = 9;
const TOP_FILE_IDENT: usize = 10;
const TOP_EVACUATION_POINT: usize = 11;

/// Top-array sizes this build reads and writes.
const TOP_SIZE_MINIMAL: usize = 3;
const TOP_SIZE_PLAIN: usize = 7;
const TOP_SIZE_SYNC: usize = 12;

/// Table-top slot indices.
const TT_KEY: usize = 0;
const TT_COL_NAMES: usize = 1;
const TT_COL_KEYS: usize = 2;
const TT_AUX_TABLE: usize = 3;
const TT_AUX_COL: usize = 4;
const TT_CLUSTER: usize = 5;
const TT_INDEXES: usize = 6;
const TT_NEXT_KEY: usize = 7;
const TT_SIZE: usize = 8;

/// One column of a table's specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub key: ColKey,
    /// Link and list-of-link columns: the target table. Backlink columns:
    /// the origin table.
    pub target: Option<TableKey>,
    /// Backlink columns: the origin link column.
    pub origin_col: Option<ColKey>,
}

impl ColumnSpec {
    /// Whether this is an automatically-maintained backlink column.
    #[must_use]
    pub fn is_backlink(&self) -> bool {
        self.key.attrs().contains(ColumnAttr::BACKLINK)
    }

    /// Whether this column is visible to applications.
    #[must_use]
    pub fn is_public(&self) -> bool {
        !self.is_backlink()
    }
}

/// In-memory state of one table.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub key: TableKey,
    pub name: String,
    pub columns: Vec<ColumnSpec>,
    pub cluster_root: Ref,
    /// Search-index roots, parallel to `columns` (`Ref::NONE` = no index).
    pub index_roots: Vec<Ref>,
    /// Next object key to assign.
    pub next_key: i64,
}

impl TableInfo {
    /// Position of `col` in the column specification, validating the key.
    pub fn col_index(&self, col: ColKey) -> Result<usize> {
        let idx = col.index();
        match self.columns.get(idx) {
            Some(spec) if spec.key == col => Ok(idx),
            _ => Err(TarnError::stale(format!(
                "column {col} no longer exists in table '{}'",
                self.name
            ))),
        }
    }

    /// The primary-key column, if the table has one.
    #[must_use]
    pub fn primary_key_column(&self) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.key.is_primary_key())
    }

    /// Look up a public column by name.
    pub fn col_by_name(&self, name: &str) -> Result<&ColumnSpec> {
        self.columns
            .iter()
            .find(|c| c.name == name && c.is_public())
            .ok_or_else(|| TarnError::NoSuchColumn {
                table: self.name.clone(),
                name: name.to_owned(),
            })
    }
}

/// One position in the group's table registry.
#[derive(Debug, Clone)]
pub enum TableSlot {
    Present(TableInfo),
    /// A removed table's position, remembering the generation it last had.
    Free(u16),
}

/// History bookkeeping for sync snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryInfo {
    pub history_type: i64,
    pub root: Ref,
    pub schema_version: i64,
    pub file_ident: i64,
    pub evacuation_point: i64,
}

/// The schema registry bound to one snapshot.
#[derive(Debug, Clone, Default)]
pub struct Group {
    pub slots: Vec<TableSlot>,
    pub version: VersionId,
    pub history: Option<HistoryInfo>,
}

impl Group {
    /// Resolve a table key, failing `StaleAccessor` when the generation
    /// does not match (the table was removed, possibly replaced).
    pub fn table(&self, key: TableKey) -> Result<&TableInfo> {
        match self.slots.get(key.index()) {
            Some(TableSlot::Present(info)) if info.key == key => Ok(info),
            _ => Err(TarnError::stale(format!("table {key} no longer exists"))),
        }
    }

    /// Mutable variant of [`Self::table`].
    pub fn table_mut(&mut self, key: TableKey) -> Result<&mut TableInfo> {
        match self.slots.get_mut(key.index()) {
            Some(TableSlot::Present(info)) if info.key == key => Ok(info),
            _ => Err(TarnError::stale(format!("table {key} no longer exists"))),
        }
    }

    /// Find a table by name.
    pub fn table_by_name(&self, name: &str) -> Result<&TableInfo> {
        self.tables()
            .find(|t| t.name == name)
            .ok_or_else(|| TarnError::NoSuchTable {
                name: name.to_owned(),
            })
    }

    /// All live tables.
    pub fn tables(&self) -> impl Iterator<Item = &TableInfo> {
        self.slots.iter().filter_map(|s| match s {
            TableSlot::Present(info) => Some(info),
            TableSlot::Free(_) => None,
        })
    }

    /// Register a new, empty table and return its key.
    pub fn add_table(&mut self, alloc: &mut SlabAlloc, name: &str) -> Result<TableKey> {
        if self.tables().any(|t| t.name == name) {
            return Err(TarnError::TableNameInUse {
                name: name.to_owned(),
            });
        }
        // Reuse the lowest freed position, bumping its generation.
        let (index, generation) = match self
            .slots
            .iter()
            .position(|s| matches!(s, TableSlot::Free(_)))
        {
            Some(i) => {
                let TableSlot::Free(generation) = self.slots[i] else {
                    unreachable!("position filtered to free slots");
                };
                (i, generation.wrapping_add(1))
            }
            None => {
                self.slots.push(TableSlot::Free(0));
                (self.slots.len() - 1, 0)
            }
        };
        let key = TableKey::new(
            u16::try_from(index).map_err(|_| TarnError::logic("too many tables"))?,
            generation,
        );
        let cluster_root = cluster::create(alloc, 0)?;
        self.slots[index] = TableSlot::Present(TableInfo {
            key,
            name: name.to_owned(),
            columns: Vec::new(),
            cluster_root,
            index_roots: Vec::new(),
            next_key: 0,
        });
        info!(table = name, %key, "added table");
        Ok(key)
    }

    /// Rename a table.
    pub fn rename_table(&mut self, key: TableKey, new_name: &str) -> Result<()> {
        if self.tables().any(|t| t.name == new_name && t.key != key) {
            return Err(TarnError::TableNameInUse {
                name: new_name.to_owned(),
            });
        }
        self.table_mut(key)?.name = new_name.to_owned();
        Ok(())
    }

    /// Drop a table from the registry, leaving a generation-tagged free
    /// slot behind. Storage teardown and link-target checks live in the
    /// table layer.
    pub(crate) fn drop_table_slot(&mut self, key: TableKey) -> Result<TableInfo> {
        let info = self.table(key)?.clone();
        self.slots[key.index()] = TableSlot::Free(key.generation());
        Ok(info)
    }

    // -- serialization -----------------------------------------------------

    /// Load a group from a snapshot's top ref. Also returns the published
    /// free-space entries for the allocator.
    pub fn load(alloc: &SlabAlloc, top_ref: Ref) -> Result<(Self, Vec<FreeEntry>)> {
        if top_ref.is_none() {
            return Ok((Self::default(), Vec::new()));
        }
        let top = Array::init_from_ref(alloc, top_ref)?;
        if !matches!(top.size(), TOP_SIZE_MINIMAL | TOP_SIZE_PLAIN | TOP_SIZE_SYNC) {
            return Err(TarnError::invalid_database(format!(
                "top array has unexpected size {}",
                top.size()
            )));
        }

        let names_ref = expect_ref(top.get_rot(alloc, TOP_NAMES)?)?;
        let tables_ref = expect_ref(top.get_rot(alloc, TOP_TABLES)?)?;
        let names = Array::init_from_ref(alloc, names_ref)?;
        let tables = Array::init_from_ref(alloc, tables_ref)?;
        if names.size() != tables.size() {
            return Err(TarnError::invalid_database(
                "table-name and table-top arrays disagree",
            ));
        }

        let mut slots = Vec::with_capacity(tables.size());
        for i in 0..tables.size() {
            match tables.get_rot(alloc, i)? {
                RefOrTagged::Tagged(generation) => {
                    slots.push(TableSlot::Free(generation as u16));
                }
                RefOrTagged::Ref(tt_ref) => {
                    let name_ref = expect_ref(names.get_rot(alloc, i)?)?;
                    let name = String::from_utf8(blob::read(alloc, name_ref)?.to_vec())
                        .map_err(|_| TarnError::invalid_database("non-UTF-8 table name"))?;
                    slots.push(TableSlot::Present(load_table(alloc, tt_ref, name)?));
                }
            }
        }

        let version = if top.size() >= TOP_SIZE_PLAIN {
            VersionId(expect_tagged(top.get_rot(alloc, TOP_VERSION)?)? as u64)
        } else {
            VersionId::ZERO
        };

        let free = if top.size() >= TOP_SIZE_PLAIN {
            let positions = Array::init_from_ref(
                alloc,
                expect_ref(top.get_rot(alloc, TOP_FREE_POSITIONS)?)?,
            )?;
            let sizes =
                Array::init_from_ref(alloc, expect_ref(top.get_rot(alloc, TOP_FREE_SIZES)?)?)?;
            let versions = Array::init_from_ref(
                alloc,
                expect_ref(top.get_rot(alloc, TOP_FREE_VERSIONS)?)?,
            )?;
            let mut entries = Vec::with_capacity(positions.size());
            for i in 0..positions.size() {
                entries.push(FreeEntry {
                    pos: positions.get(alloc, i)?,
                    size: usize::try_from(sizes.get(alloc, i)?)
                        .map_err(|_| TarnError::invalid_database("oversized free entry"))?,
                    version: versions.get(alloc, i)?,
                });
            }
            entries
        } else {
            Vec::new()
        };

        let history = if top.size() >= TOP_SIZE_SYNC {
            Some(HistoryInfo {
                history_type: expect_tagged(top.get_rot(alloc, TOP_HISTORY_TYPE)?)?,
                root: expect_ref(top.get_rot(alloc, TOP_HISTORY_REF)?)?,
                schema_version: expect_tagged(top.get_rot(alloc, TOP_HISTORY_SCHEMA_VERSION)?)?,
                file_ident: expect_tagged(top.get_rot(alloc, TOP_FILE_IDENT)?)?,
                evacuation_point: expect_tagged(top.get_rot(alloc, TOP_EVACUATION_POINT)?)?,
            })
        } else {
            None
        };

        Ok((
            Self {
                slots,
                version,
                history,
            },
            free,
        ))
    }

    /// Serialize the group into a fresh top array and return its ref. The
    /// metadata of the previous snapshot rooted at `old_top` is freed
    /// (stamped with the committing version, so pinned readers keep it).
    pub fn serialize(&self, alloc: &mut SlabAlloc, old_top: Ref) -> Result<Ref> {
        // Phase 1: table tops and registry arrays, normal allocation.
        let mut names = Array::create(alloc, ArrayKind::WithRefs, 0, 0)?;
        let mut tables = Array::create(alloc, ArrayKind::WithRefs, 0, 0)?;
        for slot in &self.slots {
            match slot {
                TableSlot::Free(generation) => {
                    names.push(alloc, 0)?;
                    tables.push_rot(alloc, RefOrTagged::Tagged(i64::from(*generation)))?;
                }
                TableSlot::Present(info) => {
                    let name_ref = blob::create(alloc, info.name.as_bytes())?;
                    names.push_rot(alloc, RefOrTagged::Ref(name_ref))?;
                    let tt = store_table(alloc, info)?;
                    tables.push_rot(alloc, RefOrTagged::Ref(tt))?;
                }
            }
        }

        // Free the superseded snapshot's metadata now so its space shows
        // up in the list published below.
        if old_top.is_some() {
            free_metadata(alloc, old_top)?;
        }

        // Phase 2: the free list and the top array. These are reserved at
        // full width *before* the free space is snapshotted, and then
        // filled in place; filling a reserved width-64 slot never
        // allocates, so the published entries stay true after
        // publication.
        let reserve = alloc.free_entry_count() + 8;
        let mut positions = Array::create(alloc, ArrayKind::Plain, reserve, u64::MAX)?;
        let mut sizes = Array::create(alloc, ArrayKind::Plain, reserve, u64::MAX)?;
        let mut versions = Array::create(alloc, ArrayKind::Plain, reserve, u64::MAX)?;
        let top_size = if self.history.is_some() {
            TOP_SIZE_SYNC
        } else {
            TOP_SIZE_PLAIN
        };
        let mut top = Array::create(alloc, ArrayKind::WithRefs, top_size, 0)?;

        let entries = alloc.free_space_snapshot();
        if entries.len() > reserve {
            return Err(TarnError::logic(
                "free-list reservation undershot the entry count",
            ));
        }
        for (i, e) in entries.iter().enumerate() {
            positions.set(alloc, i, e.pos)?;
            sizes.set(alloc, i, e.size as u64)?;
            versions.set(alloc, i, e.version)?;
        }
        positions.truncate(alloc, entries.len())?;
        sizes.truncate(alloc, entries.len())?;
        versions.truncate(alloc, entries.len())?;

        top.set_rot(alloc, TOP_NAMES, RefOrTagged::Ref(names.ref_()))?;
        top.set_rot(alloc, TOP_TABLES, RefOrTagged::Ref(tables.ref_()))?;
        top.set_rot(
            alloc,
            TOP_LOGICAL_SIZE,
            RefOrTagged::Tagged(i64::try_from(alloc.size()).expect("file size fits")),
        )?;
        top.set_rot(alloc, TOP_FREE_POSITIONS, RefOrTagged::Ref(positions.ref_()))?;
        top.set_rot(alloc, TOP_FREE_SIZES, RefOrTagged::Ref(sizes.ref_()))?;
        top.set_rot(alloc, TOP_FREE_VERSIONS, RefOrTagged::Ref(versions.ref_()))?;
        top.set_rot(
            alloc,
            TOP_VERSION,
            RefOrTagged::Tagged(i64::try_from(self.version.0).expect("version fits")),
        )?;
        if let Some(h) = self.history {
            top.set_rot(alloc, TOP_HISTORY_TYPE, RefOrTagged::Tagged(h.history_type))?;
            top.set_rot(alloc, TOP_HISTORY_REF, RefOrTagged::Ref(h.root))?;
            top.set_rot(
                alloc,
                TOP_HISTORY_SCHEMA_VERSION,
                RefOrTagged::Tagged(h.schema_version),
            )?;
            top.set_rot(alloc, TOP_FILE_IDENT, RefOrTagged::Tagged(h.file_ident))?;
            top.set_rot(
                alloc,
                TOP_EVACUATION_POINT,
                RefOrTagged::Tagged(h.evacuation_point),
            )?;
        }
        let top_ref = top.ref_();
        debug!(version = %self.version, top = %top_ref, "serialized group");
        Ok(top_ref)
    }
}

fn expect_ref(v: RefOrTagged) -> Result<Ref> {
    v.as_ref()
        .ok_or_else(|| TarnError::invalid_database("expected a ref slot"))
}

fn expect_tagged(v: RefOrTagged) -> Result<i64> {
    v.as_tagged()
        .ok_or_else(|| TarnError::invalid_database("expected a tagged slot"))
}

fn load_table(alloc: &SlabAlloc, tt_ref: Ref, name: String) -> Result<TableInfo> {
    let tt = Array::init_from_ref(alloc, tt_ref)?;
    if tt.size() != TT_SIZE {
        return Err(TarnError::invalid_database(format!(
            "table top has unexpected size {}",
            tt.size()
        )));
    }
    let key = TableKey::from_raw(
        u32::try_from(expect_tagged(tt.get_rot(alloc, TT_KEY)?)?)
            .map_err(|_| TarnError::invalid_database("table key out of range"))?,
    );
    let col_names = Array::init_from_ref(alloc, expect_ref(tt.get_rot(alloc, TT_COL_NAMES)?)?)?;
    let col_keys = Array::init_from_ref(alloc, expect_ref(tt.get_rot(alloc, TT_COL_KEYS)?)?)?;
    let aux_table = Array::init_from_ref(alloc, expect_ref(tt.get_rot(alloc, TT_AUX_TABLE)?)?)?;
    let aux_col = Array::init_from_ref(alloc, expect_ref(tt.get_rot(alloc, TT_AUX_COL)?)?)?;
    let indexes = Array::init_from_ref(alloc, expect_ref(tt.get_rot(alloc, TT_INDEXES)?)?)?;

    let ncols = col_keys.size();
    let mut columns = Vec::with_capacity(ncols);
    let mut index_roots = Vec::with_capacity(ncols);
    for i in 0..ncols {
        let name_ref = expect_ref(col_names.get_rot(alloc, i)?)?;
        let col_name = String::from_utf8(blob::read(alloc, name_ref)?.to_vec())
            .map_err(|_| TarnError::invalid_database("non-UTF-8 column name"))?;
        let col_key = ColKey::from_raw(col_keys.get(alloc, i)?);
        let target_raw = aux_table.get(alloc, i)?;
        let target = if target_raw == 0 {
            None
        } else {
            Some(TableKey::from_raw(
                u32::try_from(target_raw - 1)
                    .map_err(|_| TarnError::invalid_database("link target out of range"))?,
            ))
        };
        let origin_raw = aux_col.get(alloc, i)?;
        let origin_col = if origin_raw == 0 {
            None
        } else {
            Some(ColKey::from_raw(origin_raw - 1))
        };
        columns.push(ColumnSpec {
            name: col_name,
            key: col_key,
            target,
            origin_col,
        });
        index_roots.push(expect_ref(indexes.get_rot(alloc, i)?)?);
    }

    Ok(TableInfo {
        key,
        name,
        columns,
        cluster_root: expect_ref(tt.get_rot(alloc, TT_CLUSTER)?)?,
        index_roots,
        next_key: expect_tagged(tt.get_rot(alloc, TT_NEXT_KEY)?)?,
    })
}

fn store_table(alloc: &mut SlabAlloc, info: &TableInfo) -> Result<Ref> {
    let mut col_names = Array::create(alloc, ArrayKind::WithRefs, 0, 0)?;
    let mut col_keys = Array::create(alloc, ArrayKind::Plain, 0, 0)?;
    let mut aux_table = Array::create(alloc, ArrayKind::Plain, 0, 0)?;
    let mut aux_col = Array::create(alloc, ArrayKind::Plain, 0, 0)?;
    let mut indexes = Array::create(alloc, ArrayKind::WithRefs, 0, 0)?;
    for (spec, index_root) in info.columns.iter().zip(&info.index_roots) {
        let name_ref = blob::create(alloc, spec.name.as_bytes())?;
        col_names.push_rot(alloc, RefOrTagged::Ref(name_ref))?;
        col_keys.push(alloc, spec.key.raw())?;
        aux_table.push(
            alloc,
            spec.target.map_or(0, |t| u64::from(t.raw()) + 1),
        )?;
        aux_col.push(alloc, spec.origin_col.map_or(0, |c| c.raw() + 1))?;
        indexes.push_rot(alloc, RefOrTagged::Ref(*index_root))?;
    }

    let mut tt = Array::create(alloc, ArrayKind::WithRefs, 0, 0)?;
    tt.push_rot(alloc, RefOrTagged::Tagged(i64::from(info.key.raw())))?;
    tt.push_rot(alloc, RefOrTagged::Ref(col_names.ref_()))?;
    tt.push_rot(alloc, RefOrTagged::Ref(col_keys.ref_()))?;
    tt.push_rot(alloc, RefOrTagged::Ref(aux_table.ref_()))?;
    tt.push_rot(alloc, RefOrTagged::Ref(aux_col.ref_()))?;
    tt.push_rot(alloc, RefOrTagged::Ref(info.cluster_root))?;
    tt.push_rot(alloc, RefOrTagged::Ref(indexes.ref_()))?;
    tt.push_rot(alloc, RefOrTagged::Tagged(info.next_key))?;
    Ok(tt.ref_())
}

/// Free the metadata arrays of a superseded snapshot: the top array, the
/// registry arrays, and every table top, but never the cluster trees,
/// index trees, or history those tops point at (they are either still
/// live or freed by the mutation that replaced them).
fn free_metadata(alloc: &mut SlabAlloc, top_ref: Ref) -> Result<()> {
    let top = Array::init_from_ref(alloc, top_ref)?;

    let names_ref = expect_ref(top.get_rot(alloc, TOP_NAMES)?)?;
    Array::init_from_ref(alloc, names_ref)?.destroy_deep(alloc)?;

    let tables_ref = expect_ref(top.get_rot(alloc, TOP_TABLES)?)?;
    let tables = Array::init_from_ref(alloc, tables_ref)?;
    for i in 0..tables.size() {
        if let RefOrTagged::Ref(tt_ref) = tables.get_rot(alloc, i)? {
            if tt_ref.is_none() {
                continue;
            }
            let tt = Array::init_from_ref(alloc, tt_ref)?;
            for slot in [TT_COL_NAMES, TT_COL_KEYS, TT_AUX_TABLE, TT_AUX_COL] {
                let r = expect_ref(tt.get_rot(alloc, slot)?)?;
                Array::init_from_ref(alloc, r)?.destroy_deep(alloc)?;
            }
            // The index-roots array node only; the index trees live on.
            let indexes_ref = expect_ref(tt.get_rot(alloc, TT_INDEXES)?)?;
            let indexes = Array::init_from_ref(alloc, indexes_ref)?;
            let size = indexes.byte_size();
            alloc.free(indexes_ref, size);
            let size = tt.byte_size();
            alloc.free(tt_ref, size);
        }
    }
    let size = tables.byte_size();
    alloc.free(tables_ref, size);

    if top.size() >= TOP_SIZE_PLAIN {
        for slot in [TOP_FREE_POSITIONS, TOP_FREE_SIZES, TOP_FREE_VERSIONS] {
            let r = expect_ref(top.get_rot(alloc, slot)?)?;
            Array::init_from_ref(alloc, r)?.destroy_deep(alloc)?;
        }
    }
    let size = top.byte_size();
    alloc.free(top_ref, size);
    Ok(())
}
