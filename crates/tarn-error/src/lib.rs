use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for Tarn operations.
///
/// Structured variants carry the offending identifier (table name, column
/// name, key, ref) so callers can report precisely what failed without
/// parsing message strings.
#[derive(Error, Debug)]
pub enum TarnError {
    // === File / format errors ===
    /// The file is not a valid database: bad header, truncated, or an
    /// unsupported file-format version.
    #[error("invalid database: {detail}")]
    InvalidDatabase { detail: String },

    /// File I/O failure (open, read, write, sync, lock).
    #[error("file access error: {0}")]
    FileAccess(#[from] std::io::Error),

    /// The database file could not be opened.
    #[error("unable to open database file: '{path}'")]
    CannotOpen { path: PathBuf },

    /// File extension failed while allocating.
    #[error("out of disk space while growing database by {requested} bytes")]
    OutOfDiskSpace { requested: usize },

    /// A ref pointed outside the mapped file.
    #[error("invalid ref {ref_value:#x}: outside mapped size {mapped_size}")]
    InvalidRef { ref_value: u64, mapped_size: u64 },

    // === Transaction errors ===
    /// An accessor was used after its transaction ended or its target was
    /// removed.
    #[error("stale accessor: {detail}")]
    StaleAccessor { detail: String },

    /// A mutating call was made on a read transaction, or a transaction
    /// operation was issued in the wrong state.
    #[error("wrong transaction state: {detail}")]
    WrongTransactionState { detail: String },

    /// Write-lock acquisition timed out.
    #[error("timed out waiting for the write lock after {millis} ms")]
    LockTimeout { millis: u64 },

    // === Schema errors ===
    /// A table with this name already exists.
    #[error("table name already in use: '{name}'")]
    TableNameInUse { name: String },

    /// No table with this name exists.
    #[error("no such table: '{name}'")]
    NoSuchTable { name: String },

    /// No column with this name exists in the table.
    #[error("no such column: '{name}' in table '{table}'")]
    NoSuchColumn { table: String, name: String },

    /// A table still referenced by link columns cannot be removed.
    #[error("table '{name}' is still the target of link column '{origin}'")]
    CrossTableLinkTarget { name: String, origin: String },

    /// A primary-key value already exists in the table.
    #[error("duplicate primary key in table '{table}'")]
    DuplicatePrimaryKey { table: String },

    /// A primary-key column value was null or absent.
    #[error("missing primary key value for table '{table}'")]
    MissingPrimaryKey { table: String },

    // === Query errors ===
    /// A descriptor (sort/distinct) named a column unusable for it.
    #[error("descriptor mismatch: {detail}")]
    DescriptorMismatch { detail: String },

    /// A semantically invalid query (type mismatch, bad operator).
    #[error("invalid query: {detail}")]
    InvalidQuery { detail: String },

    /// A query string failed to parse.
    #[error("syntax error near '{token}'")]
    SyntaxError { token: String },

    // === Usage errors ===
    /// Index out of range.
    #[error("{what} out of bounds: {index} >= {size}")]
    OutOfBounds {
        what: &'static str,
        index: usize,
        size: usize,
    },

    /// API misuse that is a caller bug, not an environmental failure.
    #[error("logic error: {0}")]
    LogicError(String),

    // === Client reset ===
    /// Client-reset reconciliation failed.
    #[error("client reset failed: {detail}")]
    ClientResetFailed { detail: String },
}

impl TarnError {
    /// Whether retrying the same operation may succeed without changes.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }

    /// Whether this error indicates on-disk corruption rather than misuse.
    pub const fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::InvalidDatabase { .. } | Self::InvalidRef { .. }
        )
    }

    /// Create an `InvalidDatabase` error.
    pub fn invalid_database(detail: impl Into<String>) -> Self {
        Self::InvalidDatabase {
            detail: detail.into(),
        }
    }

    /// Create a `StaleAccessor` error.
    pub fn stale(detail: impl Into<String>) -> Self {
        Self::StaleAccessor {
            detail: detail.into(),
        }
    }

    /// Create a `WrongTransactionState` error.
    pub fn wrong_state(detail: impl Into<String>) -> Self {
        Self::WrongTransactionState {
            detail: detail.into(),
        }
    }

    /// Create a `LogicError`.
    pub fn logic(detail: impl Into<String>) -> Self {
        Self::LogicError(detail.into())
    }

    /// Create an `InvalidQuery` error.
    pub fn invalid_query(detail: impl Into<String>) -> Self {
        Self::InvalidQuery {
            detail: detail.into(),
        }
    }

    /// Create a `ClientResetFailed` error.
    pub fn client_reset(detail: impl Into<String>) -> Self {
        Self::ClientResetFailed {
            detail: detail.into(),
        }
    }
}

/// Result type alias using `TarnError`.
pub type Result<T> = std::result::Result<T, TarnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_identifiers() {
        let err = TarnError::NoSuchTable {
            name: "person".to_owned(),
        };
        assert_eq!(err.to_string(), "no such table: 'person'");

        let err = TarnError::NoSuchColumn {
            table: "person".to_owned(),
            name: "age".to_owned(),
        };
        assert_eq!(err.to_string(), "no such column: 'age' in table 'person'");

        let err = TarnError::InvalidRef {
            ref_value: 0x48,
            mapped_size: 64,
        };
        assert_eq!(err.to_string(), "invalid ref 0x48: outside mapped size 64");
    }

    #[test]
    fn classification() {
        assert!(TarnError::LockTimeout { millis: 100 }.is_transient());
        assert!(!TarnError::logic("oops").is_transient());
        assert!(TarnError::invalid_database("bad magic").is_corruption());
        assert!(
            TarnError::InvalidRef {
                ref_value: 8,
                mapped_size: 0
            }
            .is_corruption()
        );
        assert!(!TarnError::LockTimeout { millis: 1 }.is_corruption());
    }

    #[test]
    fn io_error_from() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: TarnError = io.into();
        assert!(matches!(err, TarnError::FileAccess(_)));
    }

    #[test]
    fn out_of_bounds_display() {
        let err = TarnError::OutOfBounds {
            what: "row index",
            index: 10,
            size: 3,
        };
        assert_eq!(err.to_string(), "row index out of bounds: 10 >= 3");
    }
}
