//! Test fixtures for the blob cache tests.
//!
//! Provides a temporary file-backed database plus raw-connection
//! helpers for inspecting state the public API deliberately hides
//! (trigger-maintained totals, last-used timestamps).

#![allow(dead_code)]

use std::path::PathBuf;

use cistern::{PoolOpts, Provider};
use rusqlite::Connection;
use tempfile::TempDir;

/// Install a tracing subscriber routed to the test harness.
///
/// Safe to call from every test; only the first call wins.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_test_writer()
        .try_init();
}

/// Temporary database directory, cleaned up on drop.
pub struct TestFixture {
    pub temp_dir: TempDir,
    pub db_path: PathBuf,
}

impl TestFixture {
    pub fn new() -> Self {
        init_test_tracing();
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let db_path = temp_dir.path().join("blobs.db");
        Self { temp_dir, db_path }
    }

    /// Pool options pointing at the fixture database.
    pub fn pool_opts(&self) -> PoolOpts {
        PoolOpts {
            path: self.db_path.clone(),
            num_conns: 2,
            ..PoolOpts::default()
        }
    }

    /// Open a provider over the fixture database.
    pub fn provider(&self) -> Provider {
        Provider::open(self.pool_opts()).expect("failed to open provider")
    }

    /// Open a provider with a capacity ceiling.
    pub fn provider_with_capacity(&self, capacity: i64) -> Provider {
        Provider::open(PoolOpts {
            capacity: Some(capacity),
            ..self.pool_opts()
        })
        .expect("failed to open provider")
    }

    /// A direct connection for raw inspection, outside the pool.
    pub fn raw_conn(&self) -> Connection {
        Connection::open(&self.db_path).expect("failed to open raw connection")
    }

    /// The trigger-maintained total of stored bytes.
    pub fn stored_size(&self) -> i64 {
        self.raw_conn()
            .query_row("select value from blob_meta where key='size'", [], |row| {
                row.get(0)
            })
            .expect("size row missing")
    }

    /// Sum of actual blob lengths, for checking the total against.
    pub fn summed_size(&self) -> i64 {
        self.raw_conn()
            .query_row(
                "select coalesce(sum(length(cast(data as blob))), 0) from blob",
                [],
                |row| row.get(0),
            )
            .expect("failed to sum blob lengths")
    }

    /// Every stored blob name, sorted.
    pub fn blob_names(&self) -> Vec<String> {
        let conn = self.raw_conn();
        let mut stmt = conn
            .prepare("select name from blob order by name")
            .expect("failed to prepare");
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .expect("failed to query names")
            .collect::<Result<Vec<_>, _>>()
            .expect("failed to read names");
        names
    }

    /// The raw last-used timestamp of a blob.
    pub fn last_used(&self, name: &str) -> String {
        self.raw_conn()
            .query_row(
                "select last_used from blob where name=?1",
                [name],
                |row| row.get(0),
            )
            .expect("blob missing")
    }

    /// Rewrite a blob's last-used timestamp with a SQLite datetime
    /// modifier such as `-1 hour`.
    pub fn backdate(&self, name: &str, modifier: &str) {
        let changed = self
            .raw_conn()
            .execute(
                "update blob set last_used = datetime('now', ?1) where name = ?2",
                [modifier, name],
            )
            .expect("failed to backdate");
        assert_eq!(changed, 1, "no blob named {name}");
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}
