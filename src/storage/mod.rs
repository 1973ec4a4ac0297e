//! SQLite storage layer.
//!
//! Provides:
//! - Schema initialization with trigger-enforced capacity eviction
//! - Connection pool abstraction (multi-connection and single-connection)
//! - Dedicated writer thread with group commit

pub mod pool;
pub mod schema;
pub mod writer;
