//! Prometheus counters for the write batcher.
//!
//! Key metrics (namespace `sqlite_storage`):
//! - sqlite_storage_batch_transactions_total: committed batch transactions
//! - sqlite_storage_batched_queries_total: queries in committed batches
//! - sqlite_storage_batch_transaction_errors_total: transaction-level failures

use prometheus::{IntCounter, Opts, Registry};

/// Metric namespace; a single identifier, so the counters group together
/// in any scrape output.
const NAMESPACE: &str = "sqlite_storage";

/// Counters describing batched write behavior.
///
/// Counters are created unregistered so a provider can exist without any
/// scrape infrastructure; call [`StorageMetrics::register`] to plug them
/// into a [`Registry`]. Values are also readable in-process via
/// [`IntCounter::get`], which is how throughput tests observe batching.
#[derive(Debug, Clone)]
pub struct StorageMetrics {
    /// Number of committed batch transactions.
    pub batch_transactions: IntCounter,
    /// Number of write queries that participated in committed batches.
    pub batched_queries: IntCounter,
    /// Number of batches whose transaction failed to commit.
    pub batch_transaction_errors: IntCounter,
}

impl StorageMetrics {
    /// Create the counter set.
    pub fn new() -> Result<Self, prometheus::Error> {
        Ok(Self {
            batch_transactions: IntCounter::with_opts(
                Opts::new(
                    "batch_transactions_total",
                    "Committed write batch transactions",
                )
                .namespace(NAMESPACE),
            )?,
            batched_queries: IntCounter::with_opts(
                Opts::new(
                    "batched_queries_total",
                    "Write queries that participated in committed batches",
                )
                .namespace(NAMESPACE),
            )?,
            batch_transaction_errors: IntCounter::with_opts(
                Opts::new(
                    "batch_transaction_errors_total",
                    "Write batches whose transaction failed to commit",
                )
                .namespace(NAMESPACE),
            )?,
        })
    }

    /// Register every counter with the given registry.
    pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.batch_transactions.clone()))?;
        registry.register(Box::new(self.batched_queries.clone()))?;
        registry.register(Box::new(self.batch_transaction_errors.clone()))?;
        Ok(())
    }
}
