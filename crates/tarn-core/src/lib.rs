//! The Tarn engine core: cluster row storage, the schema group, and the
//! transaction machinery that ties the allocator, node forest, and search
//! indexes into user-visible snapshots.

pub mod cluster;
pub mod column;
pub mod group;
pub mod history;
pub mod table;
pub mod txn;

pub use group::{ColumnSpec, Group, HistoryInfo, TableInfo, TableSlot};
pub use table::{BrokenLink, CascadeNotification};
pub use txn::{
    CascadeFn, CommitObserverFn, Db, DbOptions, FrozenTransaction, ReadTransaction,
    SchemaChangedFn, WriteTransaction,
};
