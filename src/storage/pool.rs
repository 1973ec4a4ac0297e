//! Connection pool abstraction.
//!
//! Callers tune parallelism by choosing a pool flavor once, at
//! construction; nothing else in the crate branches on it:
//! - Multi-connection: r2d2 over `r2d2_sqlite`, one database, many
//!   connections
//! - Single-connection: one owned connection handed out under a mutex
//!   and condvar, for callers that want strict serialization
//!
//! Connections are RAII guards: dropping a [`PoolConn`] releases it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};

use crate::error::StorageError;
use crate::storage::schema;

/// Options for opening the backing database.
#[derive(Debug, Clone, Default)]
pub struct PoolOpts {
    /// Filesystem path of the database. Ignored when `memory` is set.
    pub path: PathBuf,
    /// Use an in-memory database.
    pub memory: bool,
    /// Number of connections; 0 means the host CPU count.
    pub num_conns: usize,
    /// Forces WAL and disables the shared cache, allowing blob reads to
    /// proceed concurrently with a writer.
    pub concurrent_blob_reads: bool,
    /// Skip schema initialization; the caller guarantees it exists.
    pub dont_init_schema: bool,
    /// If set, overrides the capacity persisted in the database.
    pub capacity: Option<i64>,
}

pub(crate) fn resolve_num_conns(num_conns: usize) -> usize {
    if num_conns == 0 {
        num_cpus::get()
    } else {
        num_conns
    }
}

/// A pool of connections to one database.
pub enum ConnPool {
    /// Thin wrapper over an r2d2 pool.
    Pooled {
        pool: Pool<SqliteConnectionManager>,
        closed: AtomicBool,
    },
    /// One connection behind a mutex.
    Single(Arc<SingleConn>),
}

/// Shared state of the single-connection serializer.
pub struct SingleConn {
    state: Mutex<SingleState>,
    available: Condvar,
}

struct SingleState {
    conn: Option<Connection>,
    closed: bool,
}

impl ConnPool {
    fn new_pooled(pool: Pool<SqliteConnectionManager>) -> Self {
        Self::Pooled {
            pool,
            closed: AtomicBool::new(false),
        }
    }

    fn new_single(conn: Connection) -> Self {
        Self::Single(Arc::new(SingleConn {
            state: Mutex::new(SingleState {
                conn: Some(conn),
                closed: false,
            }),
            available: Condvar::new(),
        }))
    }

    /// Check out a connection, blocking until one is available.
    ///
    /// Returns `None` when the pool is closed or cannot provide a
    /// connection.
    pub fn acquire(&self) -> Option<PoolConn> {
        match self {
            Self::Pooled { pool, closed } => {
                if closed.load(Ordering::Acquire) {
                    return None;
                }
                match pool.get() {
                    Ok(conn) => Some(PoolConn {
                        inner: ConnInner::Pooled(conn),
                    }),
                    Err(error) => {
                        tracing::warn!(%error, "connection checkout failed");
                        None
                    }
                }
            }
            Self::Single(shared) => {
                let mut state = shared
                    .state
                    .lock()
                    .expect("single-connection state poisoned");
                loop {
                    if state.closed {
                        return None;
                    }
                    if let Some(conn) = state.conn.take() {
                        return Some(PoolConn {
                            inner: ConnInner::Single(Some(conn), Arc::clone(shared)),
                        });
                    }
                    state = shared
                        .available
                        .wait(state)
                        .expect("single-connection state poisoned");
                }
            }
        }
    }

    /// Close the pool. Subsequent `acquire` calls return `None`.
    ///
    /// For the multi-connection flavor the underlying connections close
    /// as their guards drop back in; for the single-connection flavor
    /// the stored connection closes now (or on return, if checked out).
    pub fn close(&self) -> Result<(), StorageError> {
        match self {
            Self::Pooled { closed, .. } => {
                closed.store(true, Ordering::Release);
                Ok(())
            }
            Self::Single(shared) => {
                let conn = {
                    let mut state = shared
                        .state
                        .lock()
                        .expect("single-connection state poisoned");
                    state.closed = true;
                    state.conn.take()
                };
                shared.available.notify_all();
                if let Some(conn) = conn {
                    conn.close().map_err(|(_, e)| StorageError::Database(e))?;
                }
                Ok(())
            }
        }
    }
}

/// RAII guard for a checked-out connection.
///
/// Dereferences to [`Connection`]; dropping it releases the connection
/// back to its pool exactly once.
pub struct PoolConn {
    inner: ConnInner,
}

enum ConnInner {
    Pooled(r2d2::PooledConnection<SqliteConnectionManager>),
    Single(Option<Connection>, Arc<SingleConn>),
}

impl std::ops::Deref for PoolConn {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match &self.inner {
            ConnInner::Pooled(conn) => conn,
            ConnInner::Single(conn, _) => conn.as_ref().expect("connection already returned"),
        }
    }
}

impl std::ops::DerefMut for PoolConn {
    fn deref_mut(&mut self) -> &mut Connection {
        match &mut self.inner {
            ConnInner::Pooled(conn) => conn,
            ConnInner::Single(conn, _) => conn.as_mut().expect("connection already returned"),
        }
    }
}

impl Drop for ConnInner {
    fn drop(&mut self) {
        if let ConnInner::Single(conn, shared) = self {
            if let Some(conn) = conn.take() {
                let mut state = shared
                    .state
                    .lock()
                    .expect("single-connection state poisoned");
                if !state.closed {
                    state.conn = Some(conn);
                    shared.available.notify_one();
                }
                // A closed pool discards the connection instead.
            }
        }
    }
}

/// Applies the per-connection pragmas as r2d2 establishes connections.
#[derive(Debug)]
struct PragmaCustomizer {
    wal: bool,
}

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for PragmaCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        schema::apply_conn_pragmas(conn, self.wal)
    }
}

/// Open the database and build a pool over it.
///
/// The database is addressed with a `file:` URI so the shared cache can
/// be requested as a query parameter; an in-memory database combined
/// with the shared cache is what lets several pooled connections see one
/// store. Schema initialization and any capacity override run on a
/// connection drawn from the finished pool.
///
/// Pragma application is eager: r2d2 establishes its connections before
/// `build` returns and the single-connection flavor applies them
/// directly, so a pragma failure fails construction.
pub fn open_pool(opts: PoolOpts) -> Result<Arc<ConnPool>, StorageError> {
    let num_conns = resolve_num_conns(opts.num_conns);
    let path = if opts.memory {
        ":memory:".to_owned()
    } else {
        opts.path.display().to_string()
    };
    let query = if opts.concurrent_blob_reads {
        ""
    } else {
        "cache=shared"
    };
    let uri = format!("file:{path}?{query}");
    let wal = opts.concurrent_blob_reads;
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;

    let pool = if num_conns == 1 {
        let conn = Connection::open_with_flags(&uri, flags)?;
        schema::apply_conn_pragmas(&conn, wal)?;
        ConnPool::new_single(conn)
    } else {
        let manager = SqliteConnectionManager::file(&uri).with_flags(flags);
        let pool = Pool::builder()
            .max_size(num_conns as u32)
            .connection_customizer(Box::new(PragmaCustomizer { wal }))
            .build(manager)?;
        ConnPool::new_pooled(pool)
    };
    let pool = Arc::new(pool);

    {
        let conn = pool.acquire().ok_or(StorageError::PoolClosed)?;
        if !opts.dont_init_schema {
            schema::initialize_schema(&conn)?;
        }
        if let Some(capacity) = opts.capacity {
            schema::set_capacity(&conn, capacity)?;
        }
    }

    tracing::debug!(num_conns, wal, %uri, "opened blob store");
    Ok(pool)
}
