//! Error type for storage operations.

use thiserror::Error;

/// Error type for blob storage operations.
///
/// Expected runtime failures are surfaced as values; contract violations
/// (calling `write_at`, a last-used update touching anything but exactly
/// one row) panic instead.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The connection pool is closed or could not provide a connection.
    #[error("connection pool is closed")]
    PoolClosed,

    /// No blob with the requested name exists.
    ///
    /// Distinct from end-of-stream: reading past the end of an existing
    /// blob is a short read, not an error.
    #[error("blob not found")]
    BlobNotFound,

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Connection pool error.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// I/O error while buffering or streaming blob bytes.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Metrics registration or construction error.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl StorageError {
    /// Whether this error is SQLite reporting lock contention.
    ///
    /// The write path retries on this condition; the read path surfaces
    /// it directly.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::Database(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::DatabaseBusy
        )
    }
}
