//! Concurrency and durability checks for the usage store.
//!
//! Admission must stay atomic per key: when many tasks race for the last
//! slots of a window, exactly the limit is admitted, never more. The store
//! also has to survive a process restart with its entries and index intact,
//! and slow storage must surface as a timeout instead of wedging callers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use ratekeeper::clock::ManualClock;
use ratekeeper::config::{Config, OperationLimits};
use ratekeeper::limiter::RateLimiter;
use ratekeeper::store::{StorageError, UsageKey, UsageStore};

async fn open_store(dir: &TempDir) -> Arc<UsageStore> {
    Arc::new(
        UsageStore::open(dir.path(), Duration::from_secs(5))
            .await
            .unwrap(),
    )
}

fn config_with(op: &str, limits: OperationLimits) -> Config {
    let mut config = Config::default();
    config.rate_limits.insert(op.to_string(), limits);
    config
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_consumes_never_oversubscribe() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    let config = config_with(
        "api_calls",
        OperationLimits {
            daily_limit: 10,
            weekly_limit: 1_000_000,
            monthly_limit: 1_000_000,
            burst_limit: 1_000_000,
            degradable: true,
            ..OperationLimits::default()
        },
    );
    let limiter = RateLimiter::new(Arc::clone(&store), config);

    let mut handles = Vec::new();
    for _ in 0..20 {
        let limiter = limiter.clone();
        handles.push(tokio::spawn(async move {
            limiter.consume("u1", "api_calls", 1, None, None).await
        }));
    }

    let results: Vec<_> = futures::future::join_all(handles).await;
    let mut admitted = 0u64;
    let mut refused = 0u64;
    for result in results {
        match result.unwrap().unwrap() {
            true => admitted += 1,
            false => refused += 1,
        }
    }
    assert_eq!(admitted, 10, "exactly the daily limit must be admitted");
    assert_eq!(refused, 10);

    let key = UsageKey::new("u1", "api_calls");
    let entry = store.get(&key).await.unwrap().unwrap();
    assert_eq!(entry.total_usage, 10);
    assert_eq!(entry.usage_records.len(), 10);
    assert_eq!(entry.blocked_count, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writes_to_one_key_all_land() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    let key = UsageKey::new("writer", "file_ops");

    let mut handles = Vec::new();
    for _ in 0..50 {
        let store = Arc::clone(&store);
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            store.record_usage(&key, 1, None, None).await
        }));
    }
    for result in futures::future::join_all(handles).await {
        result.unwrap().unwrap();
    }

    let entry = store.get(&key).await.unwrap().unwrap();
    assert_eq!(entry.total_usage, 50);
    assert_eq!(entry.usage_records.len(), 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distinct_keys_do_not_contend() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    let limiter = RateLimiter::new(
        Arc::clone(&store),
        config_with(
            "api_calls",
            OperationLimits {
                daily_limit: 1,
                weekly_limit: 1_000_000,
                monthly_limit: 1_000_000,
                burst_limit: 1_000_000,
                ..OperationLimits::default()
            },
        ),
    );

    let mut handles = Vec::new();
    for i in 0..10 {
        let limiter = limiter.clone();
        handles.push(tokio::spawn(async move {
            limiter
                .consume(&format!("user-{i}"), "api_calls", 1, None, None)
                .await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().unwrap(), "each key has its own limit");
    }

    assert_eq!(store.all_keys().await.len(), 10);
    for i in 0..10 {
        let entry = store
            .get(&UsageKey::new(&format!("user-{i}"), "api_calls"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.total_usage, 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cleanup_removal_keeps_late_writers_serialized() {
    let tmp = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap(),
    ));
    let store = Arc::new(
        UsageStore::open_with_clock(tmp.path(), Duration::from_secs(5), clock.clone())
            .await
            .unwrap(),
    );
    let key = UsageKey::new("u1", "api_calls");

    store.record_usage(&key, 1, None, None).await.unwrap();
    clock.advance(chrono::Duration::days(10));

    // Pin the key's lock so cleanup and a slow writer queue up behind it.
    let holder = {
        let store = Arc::clone(&store);
        let key = key.clone();
        tokio::spawn(async move {
            store
                .mutate(&key, |_| std::thread::sleep(Duration::from_millis(300)))
                .await
                .unwrap();
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let cleaner = {
        let store = Arc::clone(&store);
        tokio::spawn(async move { store.cleanup(3).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Queued before the entry is removed; still in its closure when the
    // write below arrives.
    let slow_writer = {
        let store = Arc::clone(&store);
        let key = key.clone();
        tokio::spawn(async move {
            store
                .mutate(&key, |entry| {
                    std::thread::sleep(Duration::from_millis(300));
                    entry.total_usage += 1;
                })
                .await
                .unwrap();
        })
    };

    let outcome = cleaner.await.unwrap();
    assert_eq!(outcome.entries_removed, 1);

    // Issued after the removal; must serialize behind the queued writer.
    store.record_usage(&key, 1, None, None).await.unwrap();

    holder.await.unwrap();
    slow_writer.await.unwrap();

    let entry = store.get(&key).await.unwrap().unwrap();
    assert_eq!(entry.total_usage, 2, "both post-removal writes must land");
    assert_eq!(entry.usage_records.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn held_key_lock_surfaces_timeout() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(
        UsageStore::open(tmp.path(), Duration::from_millis(50))
            .await
            .unwrap(),
    );
    let key = UsageKey::new("u1", "api_calls");

    let holder = {
        let store = Arc::clone(&store);
        let key = key.clone();
        tokio::spawn(async move {
            // The holder's own write times out as well once the closure
            // returns, so the result is discarded.
            let _ = store
                .mutate(&key, |_| std::thread::sleep(Duration::from_millis(400)))
                .await;
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = store.record_usage(&key, 1, None, None).await.unwrap_err();
    assert!(matches!(err, StorageError::Timeout { .. }));
    holder.await.unwrap();
}

#[tokio::test]
async fn store_reopens_with_persisted_state() {
    let tmp = TempDir::new().unwrap();
    let key = UsageKey::new("durable", "api_calls");
    {
        let store = open_store(&tmp).await;
        for _ in 0..3 {
            store.record_usage(&key, 2, None, None).await.unwrap();
        }
        store.record_block(&key).await.unwrap();
    }

    let reopened = open_store(&tmp).await;
    let entry = reopened.get(&key).await.unwrap().unwrap();
    assert_eq!(entry.total_usage, 6);
    assert_eq!(entry.usage_records.len(), 3);
    assert_eq!(entry.blocked_count, 1);
    assert!(entry.first_usage.is_some());
    assert!(reopened.all_keys().await.contains(&key));
}

#[tokio::test]
async fn index_rebuilds_when_missing() {
    let tmp = TempDir::new().unwrap();
    let key = UsageKey::new("indexed", "api_calls");
    {
        let store = open_store(&tmp).await;
        store.record_usage(&key, 1, None, None).await.unwrap();
    }

    std::fs::remove_file(tmp.path().join("index.json")).unwrap();

    let reopened = open_store(&tmp).await;
    assert!(
        reopened.all_keys().await.contains(&key),
        "index must be rebuilt from the usage directory"
    );
    let entry = reopened.get(&key).await.unwrap().unwrap();
    assert_eq!(entry.total_usage, 1);
}
