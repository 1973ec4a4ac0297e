//! Provider: owns the connection pool, the write queue and the batcher.
//!
//! A [`Provider`] hands out [`Instance`] handles keyed by blob name.
//! Reads acquire a connection directly; writes travel through the
//! batcher unless batching is disabled.

use std::io::Write;
use std::sync::{Arc, RwLock};

use rusqlite::params;

use crate::error::StorageError;
use crate::instance::Instance;
use crate::observability::metrics::StorageMetrics;
use crate::storage::pool::{self, open_pool, ConnPool, PoolConn, PoolOpts};
use crate::storage::schema;
use crate::storage::writer::{BatcherHandle, WriteBatcher, WriteQuery};

/// Options governing a provider's use of its pool.
///
/// A subset of [`PoolOpts`]; deriving one from the other keeps the two
/// construction steps composable.
#[derive(Debug, Clone)]
pub struct ProviderOpts {
    /// Number of connections in the pool the provider owns.
    pub num_conns: usize,
    /// Whether the pool was opened for concurrent blob reads (WAL).
    pub concurrent_blob_read: bool,
    /// Route writes through the batching coordinator.
    pub batch_writes: bool,
}

impl Default for ProviderOpts {
    fn default() -> Self {
        Self {
            num_conns: 0,
            concurrent_blob_read: false,
            batch_writes: true,
        }
    }
}

impl From<&PoolOpts> for ProviderOpts {
    fn from(opts: &PoolOpts) -> Self {
        Self {
            num_conns: pool::resolve_num_conns(opts.num_conns),
            concurrent_blob_read: opts.concurrent_blob_reads,
            batch_writes: true,
        }
    }
}

/// State shared between a provider and the instances it produced.
pub(crate) struct ProviderShared {
    pool: Arc<ConnPool>,
    writes: RwLock<Option<BatcherHandle>>,
    opts: ProviderOpts,
    metrics: StorageMetrics,
}

impl ProviderShared {
    /// Check out a connection for a read.
    pub(crate) fn acquire(&self) -> Result<PoolConn, StorageError> {
        self.pool.acquire().ok_or(StorageError::PoolClosed)
    }

    /// Run a write query: through the batcher when batching is on,
    /// directly on an acquired connection otherwise.
    pub(crate) async fn with_write_conn(&self, query: WriteQuery) -> Result<(), StorageError> {
        let handle = self
            .writes
            .read()
            .expect("write-handle lock poisoned")
            .clone();
        match handle {
            Some(handle) => handle.submit(query).await,
            None if self.opts.batch_writes => Err(StorageError::PoolClosed),
            None => {
                let conn = self.acquire()?;
                query(&conn)
            }
        }
    }
}

/// Owns the pool and the write batcher; produces [`Instance`] handles.
pub struct Provider {
    shared: Arc<ProviderShared>,
    batcher: Option<WriteBatcher>,
}

impl Provider {
    /// Build a provider over an opened pool, spawning the batcher if
    /// write batching is enabled.
    pub fn new(pool: Arc<ConnPool>, opts: ProviderOpts) -> Result<Self, StorageError> {
        let metrics = StorageMetrics::new()?;
        let (batcher, handle) = if opts.batch_writes {
            let (batcher, handle) = WriteBatcher::spawn(Arc::clone(&pool), metrics.clone())?;
            (Some(batcher), Some(handle))
        } else {
            (None, None)
        };
        tracing::debug!(
            num_conns = opts.num_conns,
            batch_writes = opts.batch_writes,
            "blob provider ready"
        );
        Ok(Self {
            shared: Arc::new(ProviderShared {
                pool,
                writes: RwLock::new(handle),
                opts,
                metrics,
            }),
            batcher,
        })
    }

    /// Open the database described by `opts` and build a provider over
    /// it, with write batching enabled.
    pub fn open(opts: PoolOpts) -> Result<Self, StorageError> {
        let provider_opts = ProviderOpts::from(&opts);
        let pool = open_pool(opts)?;
        Self::new(pool, provider_opts)
    }

    /// Produce a handle for the named blob. Never fails; the blob need
    /// not exist yet.
    pub fn new_instance(&self, location: &str) -> Instance {
        Instance::new(location, Arc::clone(&self.shared))
    }

    /// The batch counters for this provider.
    pub fn metrics(&self) -> &StorageMetrics {
        &self.shared.metrics
    }

    /// Stream every blob whose name is `prefix` followed by an integer
    /// into `sink`, in ascending numeric order of the suffix. Returns
    /// the number of bytes written.
    ///
    /// This is how a chunked file is reassembled from its pieces.
    pub fn write_consecutive_chunks<W: Write + ?Sized>(
        &self,
        prefix: &str,
        sink: &mut W,
    ) -> Result<u64, StorageError> {
        let conn = self.shared.acquire()?;
        let mut stmt = conn.prepare(
            "select cast(data as blob) from blob \
             where name like ?1 || '%' \
             order by cast(substr(name, ?2 + 1) as integer)",
        )?;
        let mut rows = stmt.query(params![prefix, prefix.len() as i64])?;
        let mut written = 0u64;
        while let Some(row) = rows.next()? {
            let data: Vec<u8> = row.get(0)?;
            sink.write_all(&data)?;
            written += data.len() as u64;
        }
        Ok(written)
    }

    /// Set the capacity ceiling, in bytes.
    ///
    /// Takes effect on the next mutating write.
    pub fn set_capacity(&self, capacity: i64) -> Result<(), StorageError> {
        let conn = self.shared.acquire()?;
        schema::set_capacity(&conn, capacity)
    }

    /// Remove the capacity ceiling.
    pub fn unlimit_capacity(&self) -> Result<(), StorageError> {
        let conn = self.shared.acquire()?;
        schema::unlimit_capacity(&conn)
    }

    /// Shut down: stop the batcher after its current batch, wait for it,
    /// then close the pool.
    pub fn close(mut self) -> Result<(), StorageError> {
        self.shutdown_batcher();
        self.shared.pool.close()
    }

    fn shutdown_batcher(&mut self) {
        let handle = self
            .shared
            .writes
            .write()
            .expect("write-handle lock poisoned")
            .take();
        drop(handle);
        if let Some(batcher) = self.batcher.take() {
            batcher.join();
        }
    }
}

impl Drop for Provider {
    fn drop(&mut self) {
        // Safety net for providers dropped without close: closing the
        // queue lets the batcher finish its current batch and exit.
        if let Ok(mut writes) = self.shared.writes.write() {
            writes.take();
        }
    }
}
