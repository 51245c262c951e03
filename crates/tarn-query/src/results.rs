//! Change-aware result sets.
//!
//! A [`Results`] starts in one of five states (empty, a whole table, a
//! collection projection, an unevaluated query, or a materialized view)
//! and lazily materializes into a vector of entries with a content
//! version. `ensure_up_to_date` re-evaluates when the database has moved
//! past the content version and the update policy allows it; a snapshot
//! freezes the current view and never updates again.
//!
//! Descriptor calls (`sort`, `distinct`, `filter`, `limit`) never mutate
//! the receiver: each returns a new `Results` with the descriptor
//! appended.

use tarn_core::{Db, Group, ReadTransaction, table};
use tarn_error::{Result, TarnError};
use tarn_types::{ColKey, DataType, Mixed, ObjKey, TableKey, VersionId};

use crate::condition::{self, Condition};

/// Whether a materialized view refreshes on access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdatePolicy {
    /// Re-evaluate whenever the database has advanced.
    #[default]
    Auto,
    /// Keep the materialized view forever (snapshots).
    Never,
}

/// The externally-visible state of a `Results`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultsMode {
    Empty,
    Table,
    Collection,
    Query,
    TableView,
}

/// One materialized entry: a row, or a position within a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    Obj(ObjKey),
    Pos(u64),
}

/// An ordering/limiting step appended to a `Results`.
#[derive(Debug, Clone)]
pub enum Descriptor {
    /// Sort by a column (object results) or by element value
    /// (collections, where the column is ignored).
    Sort { col: ColKey, ascending: bool },
    /// Keep the first row per distinct value.
    Distinct { col: ColKey },
    /// Keep at most this many entries.
    Limit(usize),
    /// Keep entries matching the condition (object results only).
    Filter(Condition),
}

#[derive(Debug, Clone)]
enum Source {
    Empty,
    Table(TableKey),
    Collection {
        table: TableKey,
        obj: ObjKey,
        col: ColKey,
    },
    Query {
        table: TableKey,
        condition: Condition,
    },
}

#[derive(Debug, Clone)]
struct View {
    entries: Vec<Entry>,
    version: VersionId,
}

/// Aggregate operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateOp {
    Min,
    Max,
    Sum,
    Avg,
    Count,
}

/// A lazily-evaluated, change-aware result set.
#[derive(Clone)]
pub struct Results {
    db: Db,
    source: Source,
    descriptors: Vec<Descriptor>,
    policy: UpdatePolicy,
    view: Option<View>,
}

impl std::fmt::Debug for Results {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Results")
            .field("mode", &self.mode())
            .field("descriptors", &self.descriptors.len())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Results {
    /// A results object bound to nothing.
    #[must_use]
    pub fn empty(db: Db) -> Self {
        Self {
            db,
            source: Source::Empty,
            descriptors: Vec::new(),
            policy: UpdatePolicy::Auto,
            view: None,
        }
    }

    /// The whole table, in key order.
    #[must_use]
    pub fn from_table(db: Db, table: TableKey) -> Self {
        Self {
            db,
            source: Source::Table(table),
            descriptors: Vec::new(),
            policy: UpdatePolicy::Auto,
            view: None,
        }
    }

    /// A collection column projected onto results.
    #[must_use]
    pub fn from_collection(db: Db, table: TableKey, obj: ObjKey, col: ColKey) -> Self {
        Self {
            db,
            source: Source::Collection { table, obj, col },
            descriptors: Vec::new(),
            policy: UpdatePolicy::Auto,
            view: None,
        }
    }

    /// An unevaluated query.
    #[must_use]
    pub fn from_query(db: Db, table: TableKey, condition: Condition) -> Self {
        Self {
            db,
            source: Source::Query { table, condition },
            descriptors: Vec::new(),
            policy: UpdatePolicy::Auto,
            view: None,
        }
    }

    /// The current state.
    #[must_use]
    pub fn mode(&self) -> ResultsMode {
        match (&self.source, &self.view) {
            (Source::Empty, _) => ResultsMode::Empty,
            (_, Some(_)) => ResultsMode::TableView,
            (Source::Table(_), None) => ResultsMode::Table,
            (Source::Collection { .. }, None) => ResultsMode::Collection,
            (Source::Query { .. }, None) => ResultsMode::Query,
        }
    }

    /// The table backing this results object, if any.
    #[must_use]
    pub fn table(&self) -> Option<TableKey> {
        match &self.source {
            Source::Table(t)
            | Source::Collection { table: t, .. }
            | Source::Query { table: t, .. } => Some(*t),
            Source::Empty => None,
        }
    }

    fn derived(&self, descriptor: Descriptor) -> Self {
        let mut out = self.clone();
        out.descriptors.push(descriptor);
        out.view = None;
        out
    }

    /// New results sorted by `col`.
    #[must_use]
    pub fn sort(&self, col: ColKey, ascending: bool) -> Self {
        self.derived(Descriptor::Sort { col, ascending })
    }

    /// New results keeping the first row per distinct `col` value.
    #[must_use]
    pub fn distinct(&self, col: ColKey) -> Self {
        self.derived(Descriptor::Distinct { col })
    }

    /// New results truncated to `n` entries.
    #[must_use]
    pub fn limit(&self, n: usize) -> Self {
        self.derived(Descriptor::Limit(n))
    }

    /// New results filtered by `condition`.
    #[must_use]
    pub fn filter(&self, condition: Condition) -> Self {
        self.derived(Descriptor::Filter(condition))
    }

    /// The content version of the materialized view, if any.
    #[must_use]
    pub fn content_version(&self) -> Option<VersionId> {
        self.view.as_ref().map(|v| v.version)
    }

    /// Bring the materialized view up to date with the database, honoring
    /// the update policy.
    pub fn ensure_up_to_date(&mut self) -> Result<()> {
        if matches!(self.source, Source::Empty) {
            return Ok(());
        }
        if let Some(view) = &self.view {
            if self.policy == UpdatePolicy::Never || view.version == self.db.version() {
                return Ok(());
            }
        }
        let txn = self.db.begin_read()?;
        let entries = self.evaluate(&txn)?;
        self.view = Some(View {
            entries,
            version: txn.version(),
        });
        Ok(())
    }

    /// Evaluate source plus descriptors against one snapshot.
    fn evaluate(&self, txn: &ReadTransaction) -> Result<Vec<Entry>> {
        txn.with_parts(|alloc, group| {
            let mut entries: Vec<Entry> = match &self.source {
                Source::Empty => Vec::new(),
                Source::Table(tk) => {
                    let mut keys = Vec::new();
                    table::for_each_key(alloc, group, *tk, &mut |k| {
                        if !k.is_tombstone() {
                            keys.push(Entry::Obj(k));
                        }
                    })?;
                    keys
                }
                Source::Query { table, condition } => {
                    condition::evaluate(alloc, group, *table, condition)?
                        .into_iter()
                        .map(Entry::Obj)
                        .collect()
                }
                Source::Collection { table, obj, col } => {
                    let n = table::list_size(alloc, group, *table, *obj, *col)?;
                    (0..n).map(Entry::Pos).collect()
                }
            };

            for descriptor in &self.descriptors {
                entries = self.apply_descriptor(alloc, group, descriptor, entries)?;
            }
            Ok(entries)
        })
    }

    fn entry_value(
        &self,
        alloc: &tarn_alloc::SlabAlloc,
        group: &Group,
        entry: Entry,
        col: Option<ColKey>,
    ) -> Result<Mixed> {
        match (entry, &self.source) {
            (Entry::Obj(key), _) => {
                let col = col.ok_or_else(|| {
                    TarnError::DescriptorMismatch {
                        detail: "object results need a column".to_owned(),
                    }
                })?;
                let tk = self.table().ok_or_else(|| {
                    TarnError::stale("results no longer bound to a table")
                })?;
                table::get_value(alloc, group, tk, key, col)
            }
            (Entry::Pos(pos), Source::Collection { table, obj, col }) => {
                table::list_get(alloc, group, *table, *obj, *col, pos)
            }
            (Entry::Pos(_), _) => Err(TarnError::logic(
                "positional entry outside a collection source",
            )),
        }
    }

    fn apply_descriptor(
        &self,
        alloc: &tarn_alloc::SlabAlloc,
        group: &Group,
        descriptor: &Descriptor,
        mut entries: Vec<Entry>,
    ) -> Result<Vec<Entry>> {
        match descriptor {
            Descriptor::Limit(n) => {
                entries.truncate(*n);
                Ok(entries)
            }
            Descriptor::Filter(condition) => {
                let tk = self.table().ok_or_else(|| TarnError::DescriptorMismatch {
                    detail: "filter applied to a collection of elements".to_owned(),
                })?;
                if matches!(self.source, Source::Collection { .. }) {
                    return Err(TarnError::DescriptorMismatch {
                        detail: "filter applied to a collection of elements".to_owned(),
                    });
                }
                let mut out = Vec::with_capacity(entries.len());
                for e in entries {
                    let Entry::Obj(key) = e else {
                        continue;
                    };
                    if condition.matches(alloc, group, tk, key)? {
                        out.push(e);
                    }
                }
                Ok(out)
            }
            Descriptor::Sort { col, ascending } => {
                let sort_col = self.descriptor_column(*col);
                let mut keyed: Vec<(Mixed, Entry)> = entries
                    .into_iter()
                    .map(|e| Ok((self.entry_value(alloc, group, e, sort_col)?, e)))
                    .collect::<Result<_>>()?;
                keyed.sort_by(|a, b| {
                    let ord = a.0.total_cmp(&b.0);
                    if *ascending { ord } else { ord.reverse() }
                });
                Ok(keyed.into_iter().map(|(_, e)| e).collect())
            }
            Descriptor::Distinct { col } => {
                let distinct_col = self.descriptor_column(*col);
                let mut seen: Vec<Mixed> = Vec::new();
                let mut out = Vec::new();
                for e in entries {
                    let v = self.entry_value(alloc, group, e, distinct_col)?;
                    if !seen
                        .iter()
                        .any(|s| s.total_cmp(&v) == std::cmp::Ordering::Equal)
                    {
                        seen.push(v);
                        out.push(e);
                    }
                }
                Ok(out)
            }
        }
    }

    /// Collections sort and distinct by element value; the descriptor's
    /// column only applies to object sources.
    fn descriptor_column(&self, col: ColKey) -> Option<ColKey> {
        match self.source {
            Source::Collection { .. } => None,
            _ => Some(col),
        }
    }

    /// Number of entries.
    pub fn len(&mut self) -> Result<usize> {
        self.ensure_up_to_date()?;
        Ok(self.view.as_ref().map_or(0, |v| v.entries.len()))
    }

    /// Whether the results are empty.
    pub fn is_empty(&mut self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn entries(&self) -> &[Entry] {
        self.view.as_ref().map_or(&[], |v| &v.entries)
    }

    /// The entry at `i`.
    pub fn get(&mut self, i: usize) -> Result<Entry> {
        self.ensure_up_to_date()?;
        self.entries()
            .get(i)
            .copied()
            .ok_or_else(|| TarnError::OutOfBounds {
                what: "results index",
                index: i,
                size: self.entries().len(),
            })
    }

    /// The row key at `i` (object results).
    pub fn get_key(&mut self, i: usize) -> Result<ObjKey> {
        match self.get(i)? {
            Entry::Obj(k) => Ok(k),
            Entry::Pos(_) => Err(TarnError::logic("collection results hold elements, not rows")),
        }
    }

    /// The value at `i`: a column value for object results, the element
    /// value for collections.
    pub fn value_at(&mut self, i: usize, col: Option<ColKey>) -> Result<Mixed> {
        let entry = self.get(i)?;
        let txn = self.db.begin_read()?;
        txn.with_parts(|alloc, group| self.entry_value(alloc, group, entry, col))
    }

    /// All row keys (object results).
    pub fn to_keys(&mut self) -> Result<Vec<ObjKey>> {
        self.ensure_up_to_date()?;
        self.entries()
            .iter()
            .map(|e| match e {
                Entry::Obj(k) => Ok(*k),
                Entry::Pos(_) => Err(TarnError::logic(
                    "collection results hold elements, not rows",
                )),
            })
            .collect()
    }

    /// All values of `col` (or elements for collections), in result order.
    pub fn to_values(&mut self, col: Option<ColKey>) -> Result<Vec<Mixed>> {
        self.ensure_up_to_date()?;
        let entries: Vec<Entry> = self.entries().to_vec();
        let txn = self.db.begin_read()?;
        txn.with_parts(|alloc, group| {
            entries
                .iter()
                .map(|e| self.entry_value(alloc, group, *e, col))
                .collect()
        })
    }

    /// Position of the row `key`, if present.
    pub fn index_of_key(&mut self, key: ObjKey) -> Result<Option<usize>> {
        self.ensure_up_to_date()?;
        Ok(self
            .entries()
            .iter()
            .position(|e| matches!(e, Entry::Obj(k) if *k == key)))
    }

    /// Position of the first entry whose value equals `value`.
    pub fn index_of_value(&mut self, value: &Mixed, col: Option<ColKey>) -> Result<Option<usize>> {
        self.ensure_up_to_date()?;
        let entries: Vec<Entry> = self.entries().to_vec();
        let txn = self.db.begin_read()?;
        txn.with_parts(|alloc, group| {
            for (i, e) in entries.iter().enumerate() {
                let v = self.entry_value(alloc, group, *e, col)?;
                if v.total_cmp(value) == std::cmp::Ordering::Equal {
                    return Ok(Some(i));
                }
            }
            Ok(None)
        })
    }

    /// Freeze the current view: the returned results keep the same source
    /// for value reads but never re-evaluate.
    pub fn snapshot(&mut self) -> Result<Self> {
        self.ensure_up_to_date()?;
        Ok(Self {
            db: self.db.clone(),
            source: self.source.clone(),
            descriptors: self.descriptors.clone(),
            policy: UpdatePolicy::Never,
            view: self.view.clone(),
        })
    }

    /// Run an aggregate over `col` (object results) or the elements
    /// (collections). `None` means the operation is unsupported for the
    /// column type; `Some(Mixed::Null)` means no rows contributed.
    #[allow(clippy::cast_precision_loss)]
    pub fn aggregate(&mut self, op: AggregateOp, col: Option<ColKey>) -> Result<Option<Mixed>> {
        self.ensure_up_to_date()?;
        if op == AggregateOp::Count {
            return Ok(Some(Mixed::Int(
                i64::try_from(self.entries().len()).expect("count fits"),
            )));
        }
        // Type gate: numerics for everything, timestamps for min/max.
        let dt = match (&self.source, col) {
            (Source::Collection { col, .. }, _) => col.data_type(),
            (_, Some(c)) => c.data_type(),
            (_, None) => return Ok(None),
        };
        let supported = dt.is_numeric()
            || (dt == DataType::Timestamp && matches!(op, AggregateOp::Min | AggregateOp::Max));
        if !supported {
            return Ok(None);
        }

        let entries: Vec<Entry> = self.entries().to_vec();
        let txn = self.db.begin_read()?;
        let values: Vec<Mixed> = txn.with_parts(|alloc, group| {
            let mut out = Vec::new();
            for e in &entries {
                // Snapshot views can hold keys whose rows are gone.
                if let Entry::Obj(key) = e {
                    if let Some(tk) = self.table() {
                        if !table::object_exists(alloc, group, tk, *key)? {
                            continue;
                        }
                    }
                }
                let v = self.entry_value(alloc, group, *e, col)?;
                if !v.is_null() {
                    out.push(v);
                }
            }
            Ok(out)
        })?;

        if values.is_empty() {
            return Ok(Some(Mixed::Null));
        }
        Ok(Some(match op {
            AggregateOp::Min => values
                .iter()
                .min_by(|a, b| a.total_cmp(b))
                .cloned()
                .expect("non-empty"),
            AggregateOp::Max => values
                .iter()
                .max_by(|a, b| a.total_cmp(b))
                .cloned()
                .expect("non-empty"),
            AggregateOp::Sum => sum_values(&values),
            AggregateOp::Avg => {
                let sum = match sum_values(&values) {
                    Mixed::Int(v) => v as f64,
                    Mixed::Double(v) => v,
                    other => return Ok(Some(other)),
                };
                Mixed::Double(sum / values.len() as f64)
            }
            AggregateOp::Count => unreachable!("handled above"),
        }))
    }
}

impl Results {
    /// Entries plus their visible values, used by the notifier to diff
    /// consecutive evaluations.
    pub(crate) fn fingerprint(&mut self) -> Result<Vec<(Entry, Vec<Mixed>)>> {
        self.ensure_up_to_date()?;
        let entries: Vec<Entry> = self.entries().to_vec();
        let txn = self.db.begin_read()?;
        txn.with_parts(|alloc, group| {
            entries
                .iter()
                .map(|e| {
                    let values = match e {
                        Entry::Obj(key) => {
                            let tk = self.table().ok_or_else(|| {
                                TarnError::stale("results no longer bound to a table")
                            })?;
                            let info = group.table(tk)?;
                            info.columns
                                .iter()
                                .filter(|c| c.is_public() && !c.key.attrs().is_collection())
                                .map(|c| table::get_value(alloc, group, tk, *key, c.key))
                                .collect::<Result<Vec<Mixed>>>()?
                        }
                        Entry::Pos(_) => vec![self.entry_value(alloc, group, *e, None)?],
                    };
                    Ok((*e, values))
                })
                .collect()
        })
    }
}

#[allow(clippy::cast_precision_loss)]
fn sum_values(values: &[Mixed]) -> Mixed {
    let all_int = values.iter().all(|v| matches!(v, Mixed::Int(_)));
    if all_int {
        Mixed::Int(values.iter().filter_map(Mixed::as_int).sum())
    } else {
        Mixed::Double(values.iter().filter_map(Mixed::numeric_value).sum())
    }
}
