//! Cistern: a persistent, capacity-bounded blob cache on SQLite.
//!
//! Cistern stores named byte blobs in a single SQLite database and keeps
//! their total size under a configurable ceiling with a trigger-enforced
//! LRU eviction policy. It is meant to sit behind a chunked-file
//! transport (for example a peer-to-peer piece store) as its content
//! storage backend.
//!
//! # Architecture
//!
//! - **Trigger-Enforced Capacity**: eviction lives in the database
//!   schema, so every mutating path is consistent by construction
//! - **Batched Writes**: a dedicated writer thread coalesces concurrent
//!   write requests into single transactions
//! - **Streaming Reads**: blobs are read incrementally over a held
//!   connection, never buffered whole
//! - **Observable**: batch commit counters exposed via prometheus
//!
//! # Modules
//!
//! - [`error`]: crate-wide error type
//! - [`instance`]: per-blob handles with file-like operations
//! - [`observability`]: metrics surface
//! - [`provider`]: pool and write-queue ownership, instance factory
//! - [`resource`]: the traits external adapters bind against
//! - [`storage`]: schema, connection pooling, write batching

// Lint configuration
#![warn(clippy::all)]
#![allow(
    clippy::module_name_repetitions,    // storage::pool::PoolOpts is fine
    clippy::must_use_candidate,         // Not all functions need #[must_use]
    clippy::missing_errors_doc,         // Error docs can be verbose
    clippy::missing_panics_doc,         // Panic docs can be verbose
    clippy::needless_raw_string_hashes  // r#""# is fine for SQL
)]

pub mod error;
pub mod instance;
pub mod observability;
pub mod provider;
pub mod resource;
pub mod storage;

pub use error::StorageError;
pub use instance::{BlobInfo, BlobReader, Instance};
pub use provider::{Provider, ProviderOpts};
pub use resource::{ConsecutiveChunkWriter, Resource, ResourceProvider};
pub use storage::pool::{open_pool, ConnPool, PoolConn, PoolOpts};
pub use storage::schema::{set_capacity, unlimit_capacity};
