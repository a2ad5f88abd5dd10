use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, TimeZone, Utc};
use feedscan_core::config::StorageConfig;
use feedscan_core::scan::{LatestItemRecord, LatestItemResolver};
use feedscan_core::store::{InMemoryTableStore, TableStore};
use serde_json::json;

const WRITERS: usize = 8;
const ITEMS: usize = 12;

fn commit(writer: usize, item: usize) -> DateTime<Utc> {
    let base = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
    base + Duration::minutes(((writer * 7 + item * 3) % 11) as i64)
}

fn batch(writer: usize) -> Vec<LatestItemRecord> {
    (0..ITEMS)
        .map(|item| {
            LatestItemRecord::new(
                format!("pkg{}", item % 4),
                format!("{item}.0.0"),
                commit(writer, item),
                json!({ "writer": writer }),
            )
        })
        .collect()
}

/// Every writer merges an overlapping batch at once; each key must end up
/// at the newest commit any writer offered.
async fn concurrent_writers_converge(store: Arc<dyn TableStore>) -> Result<()> {
    let config = StorageConfig {
        merge_retry_attempts: 50,
        max_batch_size: 5,
        ..StorageConfig::default()
    };
    let resolver = LatestItemResolver::new(store, "latest_test", &config);

    let mut tasks = Vec::new();
    for writer in 0..WRITERS {
        let resolver = resolver.clone();
        tasks.push(tokio::spawn(async move { resolver.merge(batch(writer)).await }));
    }
    let mut total_writes = 0;
    for task in tasks {
        let summary = task.await??;
        total_writes += summary.inserted + summary.replaced + summary.skipped;
    }
    assert_eq!(total_writes, WRITERS * ITEMS);

    let mut expected: BTreeMap<(String, String), DateTime<Utc>> = BTreeMap::new();
    for writer in 0..WRITERS {
        for record in batch(writer) {
            let newest = expected
                .entry((record.partition_key, record.row_key))
                .or_insert(record.commit_timestamp);
            *newest = (*newest).max(record.commit_timestamp);
        }
    }
    for ((partition, row), newest) in expected {
        let stored = resolver.get(&partition, &row).await?.expect("merged row");
        assert_eq!(stored.commit_timestamp, newest, "{partition}/{row}");
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_merges_converge_in_memory() -> Result<()> {
    concurrent_writers_converge(Arc::new(InMemoryTableStore::new(5))).await
}

#[cfg(feature = "postgres")]
#[sqlx::test(migrator = "feedscan_core::MIGRATOR")]
async fn concurrent_merges_converge_in_postgres(pool: sqlx::PgPool) -> Result<()> {
    let store = feedscan_core::store::PostgresTableStore::new(pool, 5).await?;
    concurrent_writers_converge(Arc::new(store)).await
}

#[tokio::test]
async fn replays_never_move_items_backwards() -> Result<()> {
    let store = Arc::new(InMemoryTableStore::default());
    let resolver = LatestItemResolver::new(store, "latest_test", &StorageConfig::default());

    resolver.merge(batch(3)).await?;
    let newest: Vec<LatestItemRecord> = batch(3)
        .into_iter()
        .map(|mut record| {
            record.commit_timestamp += Duration::hours(1);
            record.payload = json!({ "writer": "replay" });
            record
        })
        .collect();
    resolver.merge(newest).await?;

    let summary = resolver.merge(batch(3)).await?;
    assert_eq!(summary.skipped, ITEMS);
    assert_eq!(summary.inserted + summary.replaced, 0);

    let stored = resolver.get("pkg0", "0.0.0").await?.expect("row");
    assert_eq!(stored.payload, json!({ "writer": "replay" }));
    Ok(())
}
