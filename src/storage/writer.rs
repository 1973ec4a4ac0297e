//! Write batcher: a dedicated thread with group commit.
//!
//! Concurrent writers enqueue closures on a bounded channel; one writer
//! thread drains the queue, runs everything immediately available inside
//! a single savepoint, commits, and only then fans results back to the
//! waiting callers. Batching is opportunistic, not timer-driven: under
//! light load each request commits alone, under heavy load throughput
//! scales with batch size.
//!
//! A query that fails does not abort its batch; every caller learns its
//! own result and the transaction still commits the rest.

use std::sync::Arc;
use std::thread;

use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot};

use crate::error::StorageError;
use crate::observability::metrics::StorageMetrics;
use crate::storage::pool::{ConnPool, PoolConn};

/// Queue depth for pending write requests. Submitters block once the
/// queue is full, which is the backpressure mechanism.
pub const WRITE_QUEUE_CAPACITY: usize = 64;

/// A write closure executed on the batcher's connection, inside its
/// transaction.
pub type WriteQuery = Box<dyn FnOnce(&Connection) -> Result<(), StorageError> + Send>;

/// A queued write and the channel its result is delivered on.
pub struct WriteRequest {
    query: WriteQuery,
    reply: oneshot::Sender<Result<(), StorageError>>,
}

/// Cloneable submission side of the write queue.
#[derive(Clone)]
pub struct BatcherHandle {
    tx: mpsc::Sender<WriteRequest>,
}

impl BatcherHandle {
    /// Submit a write and wait for its result.
    ///
    /// The result arrives only after the batch transaction containing
    /// the query has committed. Blocks on a full queue.
    pub async fn submit(&self, query: WriteQuery) -> Result<(), StorageError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WriteRequest { query, reply })
            .await
            .map_err(|_| StorageError::PoolClosed)?;
        rx.await.map_err(|_| StorageError::PoolClosed)?
    }
}

/// The batcher thread. At most one exists per provider.
pub struct WriteBatcher {
    thread: thread::JoinHandle<()>,
}

impl WriteBatcher {
    /// Spawn the batcher thread over the given pool.
    pub fn spawn(
        pool: Arc<ConnPool>,
        metrics: StorageMetrics,
    ) -> Result<(Self, BatcherHandle), StorageError> {
        let (tx, rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        let thread = thread::Builder::new()
            .name("blob-writer".to_owned())
            .spawn(move || run(rx, &pool, &metrics))?;
        Ok((Self { thread }, BatcherHandle { tx }))
    }

    /// Wait for the batcher thread to exit.
    ///
    /// The thread exits once every [`BatcherHandle`] is dropped and the
    /// queue has drained.
    pub fn join(self) {
        if self.thread.join().is_err() {
            tracing::error!("writer thread panicked");
        }
    }
}

fn run(
    mut rx: mpsc::Receiver<WriteRequest>,
    pool: &ConnPool,
    metrics: &StorageMetrics,
) {
    while let Some(first) = rx.blocking_recv() {
        let mut replies = Vec::new();
        let committed = match pool.acquire() {
            Some(mut conn) => run_batch(&mut conn, &mut rx, first, &mut replies),
            None => {
                replies.push((first.reply, Err(StorageError::PoolClosed)));
                false
            }
        };
        if committed {
            metrics.batch_transactions.inc();
            metrics.batched_queries.inc_by(replies.len() as u64);
            tracing::debug!(queries = replies.len(), "committed write batch");
        } else {
            metrics.batch_transaction_errors.inc();
        }
        // Fan results out only after the transaction's fate is known.
        for (reply, result) in replies {
            let _ = reply.send(result);
        }
    }
}

/// Run one batch on `conn`: the first request plus everything already
/// waiting in the queue. Returns whether the transaction committed.
fn run_batch(
    conn: &mut PoolConn,
    rx: &mut mpsc::Receiver<WriteRequest>,
    first: WriteRequest,
    replies: &mut Vec<(oneshot::Sender<Result<(), StorageError>>, Result<(), StorageError>)>,
) -> bool {
    let sp = match conn.savepoint() {
        Ok(sp) => sp,
        Err(error) => {
            tracing::warn!(%error, "failed to open write transaction");
            replies.push((first.reply, Err(error.into())));
            return false;
        }
    };
    let result = (first.query)(&sp);
    replies.push((first.reply, result));
    while let Ok(request) = rx.try_recv() {
        let result = (request.query)(&sp);
        replies.push((request.reply, result));
    }
    match sp.commit() {
        Ok(()) => true,
        Err(error) => {
            tracing::warn!(%error, "write batch commit failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::pool::{open_pool, PoolOpts};
    use rusqlite::params;

    fn single_conn_pool() -> Arc<ConnPool> {
        open_pool(PoolOpts {
            memory: true,
            num_conns: 1,
            ..PoolOpts::default()
        })
        .unwrap()
    }

    fn put_query(name: &str, data: Vec<u8>) -> WriteQuery {
        let name = name.to_owned();
        Box::new(move |conn| {
            conn.execute(
                "insert or replace into blob (name, data) values (?1, ?2)",
                params![name, data],
            )?;
            Ok(())
        })
    }

    /// Enqueue a request directly, returning the reply receiver without
    /// waiting on it. Lets tests pin down batch composition exactly.
    async fn enqueue(
        handle: &BatcherHandle,
        query: WriteQuery,
    ) -> oneshot::Receiver<Result<(), StorageError>> {
        let (reply, rx) = oneshot::channel();
        handle.tx.send(WriteRequest { query, reply }).await.unwrap();
        rx
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_waiting_requests_commit_in_one_batch() {
        let pool = single_conn_pool();
        let metrics = StorageMetrics::new().unwrap();
        let (batcher, handle) = WriteBatcher::spawn(Arc::clone(&pool), metrics.clone()).unwrap();

        // Starve the batcher of its connection so submissions pile up.
        let held = pool.acquire().unwrap();
        let mut pending = Vec::new();
        for i in 0..8 {
            pending.push(enqueue(&handle, put_query(&format!("blob/{i}"), vec![0; 16])).await);
        }
        drop(held);

        for reply in pending {
            reply.await.unwrap().unwrap();
        }
        assert_eq!(metrics.batch_transactions.get(), 1);
        assert_eq!(metrics.batched_queries.get(), 8);
        assert_eq!(metrics.batch_transaction_errors.get(), 0);

        drop(handle);
        batcher.join();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_query_does_not_abort_batch() {
        let pool = single_conn_pool();
        let metrics = StorageMetrics::new().unwrap();
        let (batcher, handle) = WriteBatcher::spawn(Arc::clone(&pool), metrics.clone()).unwrap();

        let held = pool.acquire().unwrap();
        let bad = enqueue(
            &handle,
            Box::new(|conn| {
                conn.execute("insert into no_such_table values (1)", [])?;
                Ok(())
            }),
        )
        .await;
        let good = enqueue(&handle, put_query("survivor", vec![1, 2, 3])).await;
        drop(held);

        assert!(bad.await.unwrap().is_err());
        good.await.unwrap().unwrap();

        // The failing query was reported to its caller alone; the batch
        // still committed the good one.
        let conn = pool.acquire().unwrap();
        let count: i64 = conn
            .query_row("select count(*) from blob where name='survivor'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(metrics.batch_transactions.get(), 1);

        drop(conn);
        drop(handle);
        batcher.join();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_closed_pool_surfaces_error() {
        let pool = single_conn_pool();
        let metrics = StorageMetrics::new().unwrap();
        let (batcher, handle) = WriteBatcher::spawn(Arc::clone(&pool), metrics.clone()).unwrap();

        pool.close().unwrap();
        let err = handle
            .submit(put_query("after-close", vec![0]))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::PoolClosed));
        assert_eq!(metrics.batch_transaction_errors.get(), 1);

        drop(handle);
        batcher.join();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_batcher_exits_when_handles_drop() {
        let pool = single_conn_pool();
        let metrics = StorageMetrics::new().unwrap();
        let (batcher, handle) = WriteBatcher::spawn(pool, metrics).unwrap();

        handle.submit(put_query("final", vec![9])).await.unwrap();
        drop(handle);
        // join returns because the channel closed.
        batcher.join();
    }
}
