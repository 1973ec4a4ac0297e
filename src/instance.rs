//! Per-blob handles.
//!
//! An [`Instance`] pairs a blob name with the provider that stores it
//! and exposes file-like operations. Handles are cheap values; nothing
//! is touched in the database until an operation runs.
//!
//! Range reads go through SQL `substr` projections rather than blob
//! handles: opening blob objects on an in-memory database without WAL
//! has been observed to lock, and the projection sidesteps it entirely.

use std::io::{self, Read};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StorageError;
use crate::provider::ProviderShared;
use crate::storage::pool::PoolConn;

/// Attempts a write makes while SQLite reports contention.
const PUT_BUSY_ATTEMPTS: u32 = 10;
/// Wait between contended attempts.
const PUT_BUSY_DELAY: Duration = Duration::from_secs(1);

/// Handle for one named blob.
#[derive(Clone)]
pub struct Instance {
    location: String,
    shared: Arc<ProviderShared>,
}

impl Instance {
    pub(crate) fn new(location: &str, shared: Arc<ProviderShared>) -> Self {
        Self {
            location: location.to_owned(),
            shared,
        }
    }

    /// The blob name this handle operates on.
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Store the reader's entire contents under this name, replacing
    /// any existing blob.
    ///
    /// The reader is buffered fully in memory first. Routed through the
    /// write batcher; returns once the containing transaction commits.
    pub async fn put<R: Read>(&self, mut reader: R) -> Result<(), StorageError> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        drop(reader);

        let location = self.location.clone();
        self.shared
            .with_write_conn(Box::new(move |conn| put_blob(conn, &location, &data)))
            .await
    }

    /// Open the blob for streaming reads.
    ///
    /// Counts as a content access: `last_used` is bumped. The returned
    /// reader holds a pool connection for its whole lifetime and
    /// releases it exactly once, on drop.
    pub fn get(&self) -> Result<BlobReader, StorageError> {
        let conn = self.shared.acquire()?;
        let (rowid, size) = conn
            .query_row(
                "select rowid, length(cast(data as blob)) from blob where name=?1",
                [&self.location],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .map_err(map_no_rows)?;
        let changed = conn.execute(
            "update blob set last_used=datetime('now') where rowid=?1",
            [rowid],
        )?;
        assert_eq!(changed, 1, "last_used update touched {changed} rows");
        Ok(BlobReader {
            conn,
            rowid,
            size: size as u64,
            pos: 0,
        })
    }

    /// Size of the blob, without counting as an access.
    pub fn stat(&self) -> Result<BlobInfo, StorageError> {
        let conn = self.shared.acquire()?;
        let size: i64 = conn
            .query_row(
                "select length(cast(data as blob)) from blob where name=?1",
                [&self.location],
                |row| row.get(0),
            )
            .map_err(map_no_rows)?;
        Ok(BlobInfo { size: size as u64 })
    }

    /// Read up to `buf.len()` bytes starting at `offset`.
    ///
    /// Returns the number of bytes read; fewer than requested means the
    /// blob ended. A missing blob is [`StorageError::BlobNotFound`],
    /// distinct from reading past the end of one that exists. Does not
    /// count as an access.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, StorageError> {
        let conn = self.shared.acquire()?;
        // SQL substr is 1-based.
        let chunk: Vec<u8> = conn
            .query_row(
                "select substr(cast(data as blob), ?1, ?2) from blob where name=?3",
                params![offset as i64 + 1, buf.len() as i64, self.location],
                |row| row.get(0),
            )
            .map_err(map_no_rows)?;
        let n = chunk.len();
        buf[..n].copy_from_slice(&chunk);
        Ok(n)
    }

    /// Names of every blob under `location + "/"`, with that prefix
    /// stripped.
    pub fn readdir_names(&self) -> Result<Vec<String>, StorageError> {
        let prefix = format!("{}/", self.location);
        let conn = self.shared.acquire()?;
        let mut stmt = conn.prepare("select name from blob where name like ?1 || '%'")?;
        let names = stmt
            .query_map([&prefix], |row| row.get::<_, String>(0))?
            .map(|name| name.map(|name| name[prefix.len()..].to_owned()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    /// Delete the blob. The triggers adjust the stored total.
    pub async fn delete(&self) -> Result<(), StorageError> {
        let location = self.location.clone();
        self.shared
            .with_write_conn(Box::new(move |conn| {
                conn.execute("delete from blob where name=?1", [&location])?;
                Ok(())
            }))
            .await
    }

    /// Unsupported; blobs are written whole via [`Instance::put`].
    ///
    /// # Panics
    ///
    /// Always. Calling this is a contract violation.
    pub fn write_at(&self, _buf: &[u8], _offset: u64) -> Result<usize, StorageError> {
        unimplemented!("write_at is not supported by sqlite-backed blobs")
    }
}

/// Insert-or-replace with the documented busy retry: up to ten attempts
/// one second apart, then the error surfaces.
fn put_blob(conn: &Connection, name: &str, data: &[u8]) -> Result<(), StorageError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match conn
            .execute(
                "insert or replace into blob (name, data) values (?1, ?2)",
                params![name, data],
            )
            .map_err(StorageError::from)
        {
            Err(error) if error.is_busy() && attempt < PUT_BUSY_ATTEMPTS => {
                tracing::warn!(attempt, name, "sqlite busy, retrying put");
                thread::sleep(PUT_BUSY_DELAY);
            }
            Err(error) => return Err(error),
            Ok(_) => return Ok(()),
        }
    }
}

fn map_no_rows(e: rusqlite::Error) -> StorageError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => StorageError::BlobNotFound,
        other => other.into(),
    }
}

/// Minimal file metadata for a blob. Only the size is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobInfo {
    size: u64,
}

impl BlobInfo {
    /// The blob's length in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Streaming reader over one blob.
///
/// Holds its pool connection until dropped. Bytes are fetched with
/// `substr` projections sized to the caller's buffer, so the blob is
/// never materialized whole.
pub struct BlobReader {
    conn: PoolConn,
    rowid: i64,
    size: u64,
    pos: u64,
}

impl Read for BlobReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.pos >= self.size {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(self.size - self.pos) as usize;
        let chunk: Option<Vec<u8>> = self
            .conn
            .query_row(
                "select substr(cast(data as blob), ?1, ?2) from blob where rowid=?3",
                params![self.pos as i64 + 1, want as i64, self.rowid],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let Some(chunk) = chunk else {
            // Evicted or replaced while we were reading.
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "blob no longer exists",
            ));
        };
        let n = chunk.len();
        buf[..n].copy_from_slice(&chunk);
        self.pos += n as u64;
        Ok(n)
    }
}
