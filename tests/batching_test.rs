//! Write batching under concurrency.
//!
//! Tests:
//! - Concurrent puts coalesce into fewer transactions than writers
//! - No submitted write is silently lost
//! - Disabling batching still serves writes, without touching counters

mod common;

use std::io::Read;
use std::sync::Arc;

use cistern::{open_pool, Provider, ProviderOpts};
use common::TestFixture;

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_puts_batch_into_fewer_transactions() {
    let fixture = TestFixture::new();
    let provider = Arc::new(fixture.provider());

    let mut tasks = Vec::new();
    for i in 0..100 {
        let provider = Arc::clone(&provider);
        tasks.push(tokio::spawn(async move {
            provider
                .new_instance(&format!("piece/{i}"))
                .put(&[i as u8; 512][..])
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let metrics = provider.metrics();
    assert_eq!(metrics.batched_queries.get(), 100);
    assert!(
        metrics.batch_transactions.get() < 100,
        "expected coalescing, got {} transactions",
        metrics.batch_transactions.get()
    );
    assert!(metrics.batch_transactions.get() >= 1);
    assert_eq!(metrics.batch_transaction_errors.get(), 0);

    // Every write landed.
    assert_eq!(fixture.blob_names().len(), 100);
    assert_eq!(fixture.stored_size(), 100 * 512);
    assert_eq!(fixture.stored_size(), fixture.summed_size());

    Arc::try_unwrap(provider)
        .unwrap_or_else(|_| panic!("provider still shared"))
        .close()
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_writes_from_one_caller_apply_in_order() {
    let fixture = TestFixture::new();
    let provider = fixture.provider();

    let blob = provider.new_instance("serial");
    for round in 0..10u8 {
        blob.put(&[round; 8][..]).await.unwrap();
    }

    let mut contents = Vec::new();
    blob.get().unwrap().read_to_end(&mut contents).unwrap();
    assert_eq!(contents, [9u8; 8]);

    provider.close().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unbatched_writes_work_and_skip_counters() {
    let fixture = TestFixture::new();
    let pool = open_pool(fixture.pool_opts()).unwrap();
    let provider = Provider::new(
        pool,
        ProviderOpts {
            num_conns: 2,
            batch_writes: false,
            ..ProviderOpts::default()
        },
    )
    .unwrap();

    let blob = provider.new_instance("direct");
    blob.put(&b"unbatched"[..]).await.unwrap();

    let mut contents = Vec::new();
    blob.get().unwrap().read_to_end(&mut contents).unwrap();
    assert_eq!(contents, b"unbatched");

    assert_eq!(provider.metrics().batch_transactions.get(), 0);
    assert_eq!(provider.metrics().batched_queries.get(), 0);

    blob.delete().await.unwrap();
    assert_eq!(fixture.blob_names().len(), 0);

    provider.close().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_interleaved_puts_and_deletes_keep_accounting() {
    let fixture = TestFixture::new();
    let provider = Arc::new(fixture.provider());

    let mut tasks = Vec::new();
    for i in 0..32 {
        let provider = Arc::clone(&provider);
        tasks.push(tokio::spawn(async move {
            let blob = provider.new_instance(&format!("churn/{i}"));
            blob.put(&[1u8; 64][..]).await?;
            if i % 2 == 0 {
                blob.delete().await?;
            }
            Ok::<_, cistern::StorageError>(())
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(fixture.blob_names().len(), 16);
    assert_eq!(fixture.stored_size(), 16 * 64);
    assert_eq!(fixture.stored_size(), fixture.summed_size());

    Arc::try_unwrap(provider)
        .unwrap_or_else(|_| panic!("provider still shared"))
        .close()
        .unwrap();
}
