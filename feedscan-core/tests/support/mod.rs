#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use feedscan_core::config::PipelineConfig;
use feedscan_core::feed::FeedClient;
use feedscan_core::queue::{InMemoryQueue, QueueName, QueueTransport};
use feedscan_core::runtime::Pipeline;
use feedscan_core::store::InMemoryTableStore;
use feedscan_core::{Result, ScanError};
use feedscan_model::{CatalogIndex, CatalogLeafItem, CatalogPage, CatalogPageItem, LeafType};
use serde_json::{Value, json};

pub fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, day, hour, 0, 0).unwrap()
}

pub fn leaf(id: &str, version: &str, commit: DateTime<Utc>) -> CatalogLeafItem {
    CatalogLeafItem {
        url: format!(
            "https://feed.test/data/{}/{}.{}.json",
            commit.format("%Y.%m.%d.%H"),
            id.to_lowercase(),
            version
        ),
        leaf_type: LeafType::Details,
        commit_timestamp: commit,
        item_id: id.to_string(),
        item_version: version.to_string(),
    }
}

pub fn page_url(index: usize) -> String {
    format!("https://feed.test/page{index}.json")
}

/// Scripted in-memory feed. Page commit timestamps are the newest leaf of
/// each page; the index commit is the newest page.
#[derive(Default)]
pub struct FakeFeed {
    pages: Mutex<Vec<Vec<CatalogLeafItem>>>,
    pub index_fetches: AtomicUsize,
    pub page_fetches: AtomicUsize,
    pub leaf_fetches: Mutex<HashMap<String, usize>>,
}

impl FakeFeed {
    pub fn new(pages: Vec<Vec<CatalogLeafItem>>) -> Self {
        Self {
            pages: Mutex::new(pages),
            ..Self::default()
        }
    }

    pub fn push_page(&self, leaves: Vec<CatalogLeafItem>) {
        self.pages.lock().unwrap().push(leaves);
    }

    pub fn index(&self) -> CatalogIndex {
        let pages = self.pages.lock().unwrap();
        let items: Vec<CatalogPageItem> = pages
            .iter()
            .enumerate()
            .map(|(i, leaves)| CatalogPageItem {
                url: page_url(i),
                commit_timestamp: newest(leaves),
                count: Some(leaves.len() as u32),
            })
            .collect();
        CatalogIndex {
            commit_timestamp: items
                .iter()
                .map(|p| p.commit_timestamp)
                .max()
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            items,
        }
    }

    pub fn leaf_fetch_total(&self) -> usize {
        self.leaf_fetches.lock().unwrap().values().sum()
    }
}

fn newest(leaves: &[CatalogLeafItem]) -> DateTime<Utc> {
    leaves
        .iter()
        .map(|l| l.commit_timestamp)
        .max()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[async_trait]
impl FeedClient for FakeFeed {
    async fn fetch_index(&self) -> Result<CatalogIndex> {
        self.index_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.index())
    }

    async fn fetch_page(&self, url: &str) -> Result<CatalogPage> {
        self.page_fetches.fetch_add(1, Ordering::SeqCst);
        let pages = self.pages.lock().unwrap();
        let leaves = (0..pages.len())
            .find(|i| page_url(*i) == url)
            .map(|i| pages[i].clone())
            .ok_or_else(|| ScanError::NotFound(url.to_string()))?;
        Ok(CatalogPage {
            commit_timestamp: newest(&leaves),
            items: leaves,
        })
    }

    async fn fetch_leaf(&self, leaf_type: LeafType, url: &str) -> Result<Value> {
        *self
            .leaf_fetches
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default() += 1;
        Ok(json!({ "url": url, "type": leaf_type.as_str() }))
    }
}

pub struct Harness {
    pub store: InMemoryTableStore,
    pub queue: InMemoryQueue,
    pub feed: Arc<FakeFeed>,
    pub pipeline: Pipeline,
}

pub fn harness(feed: FakeFeed) -> Harness {
    harness_with(feed, PipelineConfig::default())
}

pub fn harness_with(feed: FakeFeed, config: PipelineConfig) -> Harness {
    let store = InMemoryTableStore::new(config.storage.max_batch_size);
    let queue = InMemoryQueue::new(config.queue.max_message_size, config.queue.max_dequeue_count);
    let feed = Arc::new(feed);
    let pipeline = Pipeline::new(
        config,
        Arc::new(store.clone()),
        Arc::new(queue.clone()),
        feed.clone(),
    );
    Harness {
        store,
        queue,
        feed,
        pipeline,
    }
}

impl Harness {
    /// Process work until the queue is empty, letting paused time run
    /// forward over delayed messages.
    pub async fn drain(&self) -> usize {
        let mut handled = 0;
        for _ in 0..10_000 {
            let received = self.pipeline.process_batch().await.unwrap();
            handled += received;
            if received == 0 {
                if self.queue.approximate_count(QueueName::Work).await.unwrap() == 0 {
                    return handled;
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
        panic!("work queue did not drain");
    }

    pub async fn poison_depth(&self) -> usize {
        self.queue.approximate_count(QueueName::Poison).await.unwrap()
    }
}

/// Three pages, four leaves each, one hour apart, spread over days 1-3.
/// `b` appears in two versions and gets a second commit on page 1.
pub fn three_page_feed() -> FakeFeed {
    FakeFeed::new(vec![
        vec![
            leaf("A", "1.0.0", at(1, 1)),
            leaf("B", "1.0.0", at(1, 2)),
            leaf("C", "1.0.0", at(1, 3)),
            leaf("D", "1.0.0", at(1, 4)),
        ],
        vec![
            leaf("B", "1.0.0", at(2, 1)),
            leaf("B", "2.0.0", at(2, 2)),
            leaf("E", "1.0.0", at(2, 3)),
            leaf("B", "1.0.0", at(2, 4)),
        ],
        vec![
            leaf("F", "1.0.0", at(3, 1)),
            leaf("A", "1.0.0", at(3, 2)),
            leaf("G", "1.0.0", at(3, 3)),
            leaf("H", "1.0.0", at(3, 4)),
        ],
    ])
}
