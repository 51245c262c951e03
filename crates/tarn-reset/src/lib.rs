//! Client-reset reconciliation.
//!
//! Given a local database and an authoritative remote copy with the same
//! schema intent, make the local database converge on the remote state
//! while (optionally) preserving local changesets for later replay:
//!
//! 1. Precheck a persisted previous-reset marker to break reset cycles,
//!    then record `(mode, timestamp)` before touching anything.
//! 2. Capture the ordered local changesets when recovery is requested.
//! 3. Transfer schema: create missing tables and columns from the remote,
//!    failing on incompatible primary keys or column types.
//! 4. Transfer rows: delete local rows absent remotely, create
//!    placeholders for remote rows missing locally (dangling link targets
//!    first), then copy every property through a converter that resolves
//!    links and embedded objects recursively.
//! 5. Rewrite the sync history around the remote anchor, appending the
//!    recovered changesets.
//! 6. Commit. A failure at any step leaves the marker in place so the
//!    next attempt sees the prior failed mode.

use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use tarn_core::{Db, HistoryInfo, ReadTransaction, WriteTransaction, history};
use tarn_error::{Result, TarnError};
use tarn_types::{ColumnAttr, DataType, Mixed, ObjKey, TableKey, Timestamp};

/// Hidden table holding the previous-reset marker.
const MARKER_TABLE: &str = "!reset_metadata";
/// Column holding the JSON marker payload.
const MARKER_COLUMN: &str = "payload";
/// The marker row's fixed key.
const MARKER_KEY: ObjKey = ObjKey(0);

/// How a client reset reconciles local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientResetMode {
    /// Converge on the remote; local uncommitted work is lost.
    DiscardLocal,
    /// Converge while preserving local changesets; fail on conflict.
    Recover,
    /// Attempt `Recover`; downgrade to `DiscardLocal` on conflict or a
    /// prior-reset marker.
    RecoverOrDiscard,
    /// Handled entirely by the caller; the engine rejects it.
    Manual,
}

/// The persisted record of a performed (or attempted) reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetMarker {
    pub mode: ClientResetMode,
    pub at: Timestamp,
}

/// Summary of a completed reset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientResetReport {
    pub mode_applied: Option<ClientResetMode>,
    pub tables_created: usize,
    pub columns_added: usize,
    pub rows_deleted: usize,
    pub rows_created: usize,
    pub changesets_recovered: usize,
}

/// Read the persisted marker, if any.
pub fn read_marker(db: &Db) -> Result<Option<ResetMarker>> {
    let read = db.begin_read()?;
    let Ok(tk) = read.table_by_name(MARKER_TABLE) else {
        return Ok(None);
    };
    if !read.object_exists(tk, MARKER_KEY)? {
        return Ok(None);
    }
    let col = read.table_info(tk)?.col_by_name(MARKER_COLUMN)?.key;
    match read.get_value(tk, MARKER_KEY, col)? {
        Mixed::String(payload) => serde_json::from_str(&payload)
            .map(Some)
            .map_err(|e| TarnError::invalid_database(format!("corrupt reset marker: {e}"))),
        _ => Ok(None),
    }
}

/// Remove the persisted marker (applications call this once the reset has
/// been fully handled).
pub fn clear_marker(db: &Db) -> Result<()> {
    let mut txn = db.begin_write()?;
    if let Ok(tk) = txn.table_by_name(MARKER_TABLE) {
        if txn.object_exists(tk, MARKER_KEY)? {
            txn.remove_object(tk, MARKER_KEY)?;
        }
    }
    txn.commit()?;
    Ok(())
}

fn write_marker(db: &Db, marker: ResetMarker) -> Result<()> {
    let mut txn = db.begin_write()?;
    let tk = match txn.table_by_name(MARKER_TABLE) {
        Ok(tk) => tk,
        Err(_) => {
            let tk = txn.add_table(MARKER_TABLE)?;
            txn.add_column(tk, MARKER_COLUMN, DataType::String, ColumnAttr::NULLABLE)?;
            tk
        }
    };
    let col = txn.table_info(tk)?.col_by_name(MARKER_COLUMN)?.key;
    if !txn.object_exists(tk, MARKER_KEY)? {
        txn.create_object_with_key(tk, MARKER_KEY)?;
    }
    let payload = serde_json::to_string(&marker)
        .map_err(|e| TarnError::client_reset(format!("marker serialization failed: {e}")))?;
    txn.set_value(tk, MARKER_KEY, col, &Mixed::String(payload))?;
    txn.commit()?;
    Ok(())
}

fn now_timestamp() -> Timestamp {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    Timestamp::new(
        i64::try_from(since_epoch.as_secs()).unwrap_or(i64::MAX),
        i32::try_from(since_epoch.subsec_nanos()).unwrap_or(0),
    )
}

fn is_public(name: &str) -> bool {
    !name.starts_with('!')
}

/// Reconcile `local` against the authoritative `remote`.
pub fn perform_client_reset(
    local: &Db,
    remote: &Db,
    mode: ClientResetMode,
) -> Result<ClientResetReport> {
    if mode == ClientResetMode::Manual {
        return Err(TarnError::client_reset(
            "manual mode is resolved by the application, not the engine",
        ));
    }

    // Step 1: precheck + record the marker.
    let effective = match (read_marker(local)?, mode) {
        (None, m) => m,
        (Some(prior), ClientResetMode::RecoverOrDiscard) => {
            warn!(
                ?prior,
                "prior reset marker found; downgrading to DiscardLocal"
            );
            ClientResetMode::DiscardLocal
        }
        (Some(prior), m) => {
            return Err(TarnError::client_reset(format!(
                "reset cycle: a {:?} reset at {}.{:09} is already recorded and a new {m:?} \
                 reset was requested",
                prior.mode,
                prior.at.seconds,
                prior.at.nanoseconds.unsigned_abs(),
            )));
        }
    };
    let recovering = matches!(effective, ClientResetMode::Recover);
    write_marker(
        local,
        ResetMarker {
            mode: effective,
            at: now_timestamp(),
        },
    )?;
    info!(?effective, "client reset started");

    // Step 2: capture local changesets when recovering.
    let captured: Vec<Vec<u8>> = if recovering {
        let read = local.begin_read()?;
        match read.group().history {
            Some(h) if h.root.is_some() => {
                read.with_parts(|alloc, _| history::all(alloc, h.root))?
            }
            _ => Vec::new(),
        }
    } else {
        Vec::new()
    };

    let remote_read = remote.begin_read()?;
    let mut txn = local.begin_write()?;
    let mut report = ClientResetReport {
        mode_applied: Some(effective),
        changesets_recovered: captured.len(),
        ..ClientResetReport::default()
    };

    // Step 3: schema.
    let table_map = transfer_schema(&remote_read, &mut txn, effective, &mut report)?;

    // Step 4: rows.
    let mut converter = Converter::new(table_map);
    converter.transfer_rows(&remote_read, &mut txn, &mut report)?;

    // Step 5: history rewrite around the remote anchor.
    rewrite_history(&remote_read, &mut txn, &captured)?;

    // Step 6: commit.
    txn.commit()?;
    info!(?report, "client reset finished");
    Ok(report)
}

/// Ensure every public remote table and column exists locally with
/// compatible shape. Returns remote → local table key mapping.
fn transfer_schema(
    remote: &ReadTransaction,
    local: &mut WriteTransaction,
    mode: ClientResetMode,
    report: &mut ClientResetReport,
) -> Result<HashMap<TableKey, TableKey>> {
    let mut map = HashMap::new();
    let remote_tables: Vec<_> = remote
        .group()
        .tables()
        .filter(|t| is_public(&t.name))
        .cloned()
        .collect();

    // Local public tables missing remotely are non-recoverable schema
    // drift unless recovery keeps them.
    let remote_names: HashSet<&str> = remote_tables.iter().map(|t| t.name.as_str()).collect();
    let local_only: Vec<String> = local
        .group()
        .tables()
        .filter(|t| is_public(&t.name) && !remote_names.contains(t.name.as_str()))
        .map(|t| t.name.clone())
        .collect();
    if !local_only.is_empty() && mode == ClientResetMode::DiscardLocal {
        return Err(TarnError::client_reset(format!(
            "table '{}' exists locally but not remotely (non-recoverable schema removal)",
            local_only[0]
        )));
    }

    // First pass: the tables themselves (link targets must exist before
    // link columns can be created).
    for rt in &remote_tables {
        let local_tk = match local.table_by_name(&rt.name) {
            Ok(tk) => {
                check_primary_keys_match(remote, local, rt.key, tk, &rt.name)?;
                tk
            }
            Err(_) => {
                report.tables_created += 1;
                match rt.primary_key_column() {
                    Some(pk) => local.add_table_with_primary_key(
                        &rt.name,
                        &pk.name,
                        pk.key.data_type(),
                        pk.key.is_nullable(),
                    )?,
                    None => local.add_table(&rt.name)?,
                }
            }
        };
        map.insert(rt.key, local_tk);
    }

    // Second pass: columns.
    for rt in &remote_tables {
        let local_tk = map[&rt.key];
        for spec in rt.columns.iter().filter(|c| c.is_public()) {
            let existing = local
                .table_info(local_tk)?
                .columns
                .iter()
                .find(|c| c.name == spec.name && c.is_public())
                .map(|c| c.key);
            match existing {
                Some(local_key) => {
                    let same_core = local_key.data_type() == spec.key.data_type()
                        && local_key.is_nullable() == spec.key.is_nullable()
                        && local_key.attrs().is_collection()
                            == spec.key.attrs().is_collection();
                    if !same_core {
                        return Err(TarnError::client_reset(format!(
                            "column '{}.{}' differs between local and remote",
                            rt.name, spec.name
                        )));
                    }
                }
                None => {
                    report.columns_added += 1;
                    if spec.key.data_type() == DataType::Link {
                        let remote_target = spec.target.ok_or_else(|| {
                            TarnError::invalid_database("link column without a target table")
                        })?;
                        let local_target = *map.get(&remote_target).ok_or_else(|| {
                            TarnError::client_reset(
                                "link column targets a non-public table",
                            )
                        })?;
                        local.add_column_link(
                            local_tk,
                            &spec.name,
                            spec.key.is_list(),
                            local_target,
                            spec.key.attrs().contains(ColumnAttr::STRONG),
                        )?;
                    } else {
                        let attrs = spec.key.attrs()
                            - ColumnAttr::INDEXED
                            - ColumnAttr::PRIMARY_KEY;
                        local.add_column(
                            local_tk,
                            &spec.name,
                            spec.key.data_type(),
                            attrs,
                        )?;
                    }
                }
            }
        }
    }
    Ok(map)
}

fn check_primary_keys_match(
    remote: &ReadTransaction,
    local: &WriteTransaction,
    remote_tk: TableKey,
    local_tk: TableKey,
    name: &str,
) -> Result<()> {
    let remote_pk = remote
        .table_info(remote_tk)?
        .primary_key_column()
        .map(|c| (c.name.clone(), c.key.data_type(), c.key.is_nullable()));
    let local_pk = local
        .table_info(local_tk)?
        .primary_key_column()
        .map(|c| (c.name.clone(), c.key.data_type(), c.key.is_nullable()));
    if remote_pk != local_pk {
        return Err(TarnError::client_reset(format!(
            "table '{name}' has an incompatible primary key \
             (local {local_pk:?}, remote {remote_pk:?})"
        )));
    }
    Ok(())
}

/// Maps remote rows onto local rows and copies property values, resolving
/// links (and embedded objects) recursively.
struct Converter {
    table_map: HashMap<TableKey, TableKey>,
    obj_map: HashMap<(TableKey, ObjKey), ObjKey>,
}

impl Converter {
    fn new(table_map: HashMap<TableKey, TableKey>) -> Self {
        Self {
            table_map,
            obj_map: HashMap::new(),
        }
    }

    fn transfer_rows(
        &mut self,
        remote: &ReadTransaction,
        local: &mut WriteTransaction,
        report: &mut ClientResetReport,
    ) -> Result<()> {
        let remote_tables: Vec<TableKey> = self.table_map.keys().copied().collect();

        // Delete-then-create per table so later property copies always
        // find their link targets.
        for remote_tk in &remote_tables {
            self.align_rows(remote, local, *remote_tk, report)?;
        }
        for remote_tk in &remote_tables {
            self.copy_properties(remote, local, *remote_tk)?;
        }
        Ok(())
    }

    /// Make the local row set of one table match the remote's.
    fn align_rows(
        &mut self,
        remote: &ReadTransaction,
        local: &mut WriteTransaction,
        remote_tk: TableKey,
        report: &mut ClientResetReport,
    ) -> Result<()> {
        let local_tk = self.table_map[&remote_tk];
        let remote_pk = remote.table_info(remote_tk)?.primary_key_column().cloned();
        let remote_keys: Vec<ObjKey> = remote
            .object_keys(remote_tk)?
            .into_iter()
            .filter(|k| !k.is_tombstone())
            .collect();

        match remote_pk {
            Some(pk_spec) => {
                let mut remote_pks = Vec::with_capacity(remote_keys.len());
                for rk in &remote_keys {
                    remote_pks.push(remote.get_value(remote_tk, *rk, pk_spec.key)?);
                }

                // Delete local rows whose primary key is absent remotely.
                let local_keys: Vec<ObjKey> = local
                    .object_keys(local_tk)?
                    .into_iter()
                    .filter(|k| !k.is_tombstone())
                    .collect();
                let local_pk_key = local
                    .table_info(local_tk)?
                    .primary_key_column()
                    .expect("primary keys were matched during schema transfer")
                    .key;
                for lk in local_keys {
                    let pk = local.get_value(local_tk, lk, local_pk_key)?;
                    let present = remote_pks
                        .iter()
                        .any(|r| r.total_cmp(&pk) == std::cmp::Ordering::Equal);
                    if !present {
                        debug!(table = %local_tk, key = %lk, "deleting local-only row");
                        local.remove_object(local_tk, lk)?;
                        report.rows_deleted += 1;
                    }
                }

                // Create placeholders for remote rows missing locally.
                for (rk, pk) in remote_keys.iter().zip(&remote_pks) {
                    let existing = local.find_by_primary_key(local_tk, pk)?;
                    let lk = match existing {
                        Some(lk) => lk,
                        None => {
                            report.rows_created += 1;
                            local.create_object_with_primary_key(local_tk, pk)?
                        }
                    };
                    self.obj_map.insert((remote_tk, *rk), lk);
                }
            }
            None => {
                // No primary key: local rows cannot be matched, so the
                // remote row set replaces them wholesale.
                let local_keys = local.object_keys(local_tk)?;
                for lk in local_keys {
                    if local.object_exists(local_tk, lk)? {
                        local.remove_object(local_tk, lk)?;
                        report.rows_deleted += 1;
                    }
                }
                for rk in &remote_keys {
                    let lk = local.create_object(local_tk)?;
                    report.rows_created += 1;
                    self.obj_map.insert((remote_tk, *rk), lk);
                }
            }
        }
        Ok(())
    }

    /// Copy every public property of every mapped row.
    fn copy_properties(
        &mut self,
        remote: &ReadTransaction,
        local: &mut WriteTransaction,
        remote_tk: TableKey,
    ) -> Result<()> {
        let local_tk = self.table_map[&remote_tk];
        let columns = remote.table_info(remote_tk)?.columns.clone();
        let pairs: Vec<(ObjKey, ObjKey)> = self
            .obj_map
            .iter()
            .filter(|((t, _), _)| *t == remote_tk)
            .map(|((_, rk), lk)| (*rk, *lk))
            .collect();

        for (rk, lk) in pairs {
            for spec in columns.iter().filter(|c| c.is_public()) {
                if spec.key.is_primary_key() {
                    continue;
                }
                let local_col = local
                    .table_info(local_tk)?
                    .col_by_name(&spec.name)?
                    .key;
                if spec.key.attrs().is_collection() {
                    // Replace the local collection contents.
                    while !local.list_get_all(local_tk, lk, local_col)?.is_empty() {
                        local.list_erase(local_tk, lk, local_col, 0)?;
                    }
                    let elements = remote.list_get_all(remote_tk, rk, spec.key)?;
                    for (i, element) in elements.iter().enumerate() {
                        let converted = self.convert(remote, local, spec, element)?;
                        local.list_insert(local_tk, lk, local_col, i as u64, &converted)?;
                    }
                } else {
                    let value = remote.get_value(remote_tk, rk, spec.key)?;
                    let converted = self.convert(remote, local, spec, &value)?;
                    local.set_value(local_tk, lk, local_col, &converted)?;
                }
            }
        }
        Ok(())
    }

    /// Convert one remote value into its local form, resolving links.
    fn convert(
        &mut self,
        remote: &ReadTransaction,
        local: &mut WriteTransaction,
        spec: &tarn_core::ColumnSpec,
        value: &Mixed,
    ) -> Result<Mixed> {
        let Mixed::Link(remote_target) = value else {
            return Ok(value.clone());
        };
        let remote_target_tk = spec.target.ok_or_else(|| {
            TarnError::invalid_database("link column without a target table")
        })?;
        let local_key =
            self.resolve_object(remote, local, remote_target_tk, *remote_target)?;
        Ok(Mixed::Link(local_key))
    }

    /// Find (or create) the local twin of a remote object. Creating a
    /// dangling target first means later list assignments see it.
    fn resolve_object(
        &mut self,
        remote: &ReadTransaction,
        local: &mut WriteTransaction,
        remote_tk: TableKey,
        remote_key: ObjKey,
    ) -> Result<ObjKey> {
        if let Some(lk) = self.obj_map.get(&(remote_tk, remote_key)) {
            return Ok(*lk);
        }
        let local_tk = *self.table_map.get(&remote_tk).ok_or_else(|| {
            TarnError::client_reset("link target table was not transferred")
        })?;
        let pk_spec = remote.table_info(remote_tk)?.primary_key_column().cloned();
        let lk = match pk_spec {
            Some(pk_spec) => {
                let pk = remote.get_value(remote_tk, remote_key, pk_spec.key)?;
                match local.find_by_primary_key(local_tk, &pk)? {
                    Some(lk) => lk,
                    None => local.create_object_with_primary_key(local_tk, &pk)?,
                }
            }
            None => local.create_object(local_tk)?,
        };
        self.obj_map.insert((remote_tk, remote_key), lk);
        Ok(lk)
    }
}

/// Replace the local history with the remote anchor plus the recovered
/// changesets.
fn rewrite_history(
    remote: &ReadTransaction,
    local: &mut WriteTransaction,
    captured: &[Vec<u8>],
) -> Result<()> {
    let remote_history = remote.group().history;
    local.with_parts_mut(|alloc, group| {
        if let Some(h) = group.history {
            if h.root.is_some() {
                history::destroy(alloc, h.root)?;
            }
        }
        group.history = match remote_history {
            None => None,
            Some(remote_h) => {
                let anchor = remote.version();
                let mut root = history::create(alloc, anchor)?;
                for changeset in captured {
                    root = history::append(alloc, root, changeset)?;
                }
                Some(HistoryInfo {
                    history_type: remote_h.history_type,
                    root,
                    schema_version: remote_h.schema_version,
                    file_ident: remote_h.file_ident,
                    evacuation_point: 0,
                })
            }
        };
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarn_alloc::Durability;
    use tarn_core::DbOptions;

    fn mem_db() -> Db {
        Db::open_in_memory(DbOptions {
            durability: Durability::None,
            ..DbOptions::default()
        })
        .unwrap()
    }

    /// A database with table `item(id pk int, value string)` holding the
    /// given `(id, value)` rows.
    fn seeded(rows: &[(i64, &str)]) -> Db {
        let db = mem_db();
        let mut txn = db.begin_write().unwrap();
        let tk = txn
            .add_table_with_primary_key("item", "id", DataType::Int, false)
            .unwrap();
        let val = txn
            .add_column(tk, "value", DataType::String, ColumnAttr::NULLABLE)
            .unwrap();
        for (id, value) in rows {
            let k = txn
                .create_object_with_primary_key(tk, &Mixed::Int(*id))
                .unwrap();
            txn.set_value(tk, k, val, &Mixed::from(*value)).unwrap();
        }
        txn.commit().unwrap();
        db
    }

    fn pk_set(db: &Db) -> Vec<i64> {
        let read = db.begin_read().unwrap();
        let tk = read.table_by_name("item").unwrap();
        let pk = read
            .table_info(tk)
            .unwrap()
            .primary_key_column()
            .unwrap()
            .key;
        let mut out: Vec<i64> = read
            .object_keys(tk)
            .unwrap()
            .into_iter()
            .map(|k| read.get_value(tk, k, pk).unwrap().as_int().unwrap())
            .collect();
        out.sort_unstable();
        out
    }

    #[test]
    fn discard_local_scenario() {
        // Local {1, 2, 3} against remote {2, 3, 4}: DiscardLocal ends with
        // exactly {2, 3, 4} and a recorded marker; a second DiscardLocal
        // fails citing the cycle.
        let local = seeded(&[(1, "a"), (2, "b"), (3, "c")]);
        let remote = seeded(&[(2, "b"), (3, "c"), (4, "d")]);

        let report =
            perform_client_reset(&local, &remote, ClientResetMode::DiscardLocal).unwrap();
        assert_eq!(report.mode_applied, Some(ClientResetMode::DiscardLocal));
        assert_eq!(report.rows_deleted, 1);
        assert_eq!(report.rows_created, 1);
        assert_eq!(pk_set(&local), vec![2, 3, 4]);

        let marker = read_marker(&local).unwrap().expect("marker recorded");
        assert_eq!(marker.mode, ClientResetMode::DiscardLocal);

        let err =
            perform_client_reset(&local, &remote, ClientResetMode::DiscardLocal).unwrap_err();
        match err {
            TarnError::ClientResetFailed { detail } => {
                assert!(detail.contains("cycle"), "got: {detail}");
            }
            other => panic!("expected ClientResetFailed, got {other:?}"),
        }
    }

    #[test]
    fn reset_against_identical_remote_is_a_no_op() {
        // Reconciling against an identical remote only records the marker.
        let local = seeded(&[(1, "a"), (2, "b")]);
        let remote = seeded(&[(1, "a"), (2, "b")]);

        let report = perform_client_reset(&local, &remote, ClientResetMode::Recover).unwrap();
        assert_eq!(report.rows_deleted, 0);
        assert_eq!(report.rows_created, 0);
        assert_eq!(pk_set(&local), vec![1, 2]);

        let read = local.begin_read().unwrap();
        let tk = read.table_by_name("item").unwrap();
        let val = read.table_info(tk).unwrap().col_by_name("value").unwrap().key;
        let k = read.find_by_primary_key(tk, &Mixed::Int(1)).unwrap().unwrap();
        assert_eq!(read.get_value(tk, k, val).unwrap(), Mixed::from("a"));
        assert!(read_marker(&local).unwrap().is_some());
    }

    #[test]
    fn values_are_copied_from_remote() {
        let local = seeded(&[(1, "stale")]);
        let remote = seeded(&[(1, "fresh")]);
        perform_client_reset(&local, &remote, ClientResetMode::DiscardLocal).unwrap();

        let read = local.begin_read().unwrap();
        let tk = read.table_by_name("item").unwrap();
        let val = read.table_info(tk).unwrap().col_by_name("value").unwrap().key;
        let k = read.find_by_primary_key(tk, &Mixed::Int(1)).unwrap().unwrap();
        assert_eq!(read.get_value(tk, k, val).unwrap(), Mixed::from("fresh"));
    }

    #[test]
    fn missing_tables_and_columns_are_created() {
        let local = mem_db();
        let remote = seeded(&[(7, "x")]);
        let report =
            perform_client_reset(&local, &remote, ClientResetMode::DiscardLocal).unwrap();
        assert_eq!(report.tables_created, 1);
        assert!(report.columns_added >= 1);
        assert_eq!(pk_set(&local), vec![7]);
    }

    #[test]
    fn local_only_table_fails_discard_but_survives_recover() {
        let build = || {
            let db = seeded(&[(1, "a")]);
            let mut txn = db.begin_write().unwrap();
            txn.add_table_with_primary_key("local_extra", "id", DataType::Int, false)
                .unwrap();
            txn.commit().unwrap();
            db
        };
        let remote = seeded(&[(1, "a")]);

        let local = build();
        assert!(matches!(
            perform_client_reset(&local, &remote, ClientResetMode::DiscardLocal),
            Err(TarnError::ClientResetFailed { .. })
        ));

        let local = build();
        perform_client_reset(&local, &remote, ClientResetMode::Recover).unwrap();
        let read = local.begin_read().unwrap();
        assert!(read.table_by_name("local_extra").is_ok());
    }

    #[test]
    fn recover_or_discard_downgrades_on_marker() {
        let local = seeded(&[(1, "a")]);
        let remote = seeded(&[(2, "b")]);

        perform_client_reset(&local, &remote, ClientResetMode::Recover).unwrap();
        // A marker now exists; RecoverOrDiscard downgrades transparently.
        let report =
            perform_client_reset(&local, &remote, ClientResetMode::RecoverOrDiscard).unwrap();
        assert_eq!(report.mode_applied, Some(ClientResetMode::DiscardLocal));
        assert_eq!(
            read_marker(&local).unwrap().unwrap().mode,
            ClientResetMode::DiscardLocal
        );
    }

    #[test]
    fn manual_mode_is_rejected() {
        let local = seeded(&[]);
        let remote = seeded(&[]);
        assert!(matches!(
            perform_client_reset(&local, &remote, ClientResetMode::Manual),
            Err(TarnError::ClientResetFailed { .. })
        ));
    }

    #[test]
    fn links_are_remapped_through_primary_keys() {
        let build = |link_to: i64| {
            let db = mem_db();
            let mut txn = db.begin_write().unwrap();
            let items = txn
                .add_table_with_primary_key("item", "id", DataType::Int, false)
                .unwrap();
            let orders = txn
                .add_table_with_primary_key("order", "id", DataType::Int, false)
                .unwrap();
            let link = txn
                .add_column_link(orders, "item", false, items, false)
                .unwrap();
            let item = txn
                .create_object_with_primary_key(items, &Mixed::Int(link_to))
                .unwrap();
            let order = txn
                .create_object_with_primary_key(orders, &Mixed::Int(100))
                .unwrap();
            txn.set_value(orders, order, link, &Mixed::Link(item)).unwrap();
            txn.commit().unwrap();
            db
        };
        // Different insertion histories give the linked item different
        // object keys; the reset must remap through the primary key.
        let local = build(5);
        let remote = build(5);

        perform_client_reset(&local, &remote, ClientResetMode::DiscardLocal).unwrap();
        let read = local.begin_read().unwrap();
        let items = read.table_by_name("item").unwrap();
        let orders = read.table_by_name("order").unwrap();
        let link = read.table_info(orders).unwrap().col_by_name("item").unwrap().key;
        let order = read
            .find_by_primary_key(orders, &Mixed::Int(100))
            .unwrap()
            .unwrap();
        let linked = read.get_value(orders, order, link).unwrap();
        let target = read.find_by_primary_key(items, &Mixed::Int(5)).unwrap().unwrap();
        assert_eq!(linked, Mixed::Link(target));
    }

    #[test]
    fn history_is_rewritten_around_the_remote_anchor() {
        let options = DbOptions {
            durability: Durability::None,
            history_type: Some(2),
            ..DbOptions::default()
        };
        let local = Db::open_in_memory(options.clone()).unwrap();
        let remote = Db::open_in_memory(options).unwrap();

        for db in [&local, &remote] {
            let mut txn = db.begin_write().unwrap();
            txn.add_table_with_primary_key("item", "id", DataType::Int, false)
                .unwrap();
            txn.commit_with_changeset(Some(b"schema")).unwrap();
        }
        // Extra local commits to be recovered.
        let mut txn = local.begin_write().unwrap();
        let tk = txn.table_by_name("item").unwrap();
        txn.create_object_with_primary_key(tk, &Mixed::Int(1)).unwrap();
        txn.commit_with_changeset(Some(b"local-change")).unwrap();

        let report = perform_client_reset(&local, &remote, ClientResetMode::Recover).unwrap();
        assert_eq!(report.changesets_recovered, 2);

        let read = local.begin_read().unwrap();
        let h = read.group().history.expect("history preserved");
        read.with_parts(|alloc, _| {
            let blobs = history::all(alloc, h.root).unwrap();
            assert_eq!(blobs, vec![b"schema".to_vec(), b"local-change".to_vec()]);
            assert_eq!(
                history::base_version(alloc, h.root).unwrap(),
                remote.version(),
            );
            Ok(())
        })
        .unwrap();
    }
}
