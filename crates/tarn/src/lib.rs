//! Tarn: an embedded, transactional object database.
//!
//! Applications see a strongly-typed schema of tables, objects, columns,
//! and collections; the engine stores everything in a single file (or
//! memory buffer) with MVCC snapshots, copy-on-write updates, and optional
//! synchronization histories.
//!
//! ```
//! use tarn::{ColumnAttr, DataType, Db, DbOptions, Mixed};
//!
//! # fn main() -> tarn::Result<()> {
//! let db = Db::open_in_memory(DbOptions::default())?;
//!
//! let mut txn = db.begin_write()?;
//! let people = txn.add_table("person")?;
//! let age = txn.add_column(people, "age", DataType::Int, ColumnAttr::NULLABLE)?;
//! let ada = txn.create_object(people)?;
//! txn.set_value(people, ada, age, &Mixed::Int(36))?;
//! txn.commit()?;
//!
//! let read = db.begin_read()?;
//! assert_eq!(read.get_value(people, ada, age)?, Mixed::Int(36));
//! # Ok(())
//! # }
//! ```

pub use tarn_alloc::{AllocOptions, Durability, SlabAlloc};
pub use tarn_core::{
    BrokenLink, CascadeNotification, ColumnSpec, Db, DbOptions, FrozenTransaction, Group,
    HistoryInfo, ReadTransaction, TableInfo, WriteTransaction,
};
pub use tarn_error::{Result, TarnError};
pub use tarn_index::RadixTree;
pub use tarn_node::{Array, ArrayKind, BpTree};
pub use tarn_query::{
    AggregateOp, ChangeSet, CmpOp, Condition, NotificationToken, NotifierHub, Results,
    ResultsMode, StrOp,
};
pub use tarn_reset::{
    ClientResetMode, ClientResetReport, ResetMarker, clear_marker, perform_client_reset,
    read_marker,
};
pub use tarn_types::{
    ColKey, ColumnAttr, DataType, Decimal, Mixed, ObjKey, ObjLink, ObjectId, Ref, RefOrTagged,
    TableKey, Timestamp, Uuid, VersionId,
};
