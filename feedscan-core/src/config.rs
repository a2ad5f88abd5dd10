use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Knobs for the whole pipeline.
///
/// Every section has defaults, so a configuration file only needs the
/// values it wants to change.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    /// Where the feed lives and how it is fetched.
    pub feed: FeedConfig,
    /// Message size limits, batching and delivery policy.
    pub queue: QueueConfig,
    /// Table store paging, batching and conflict retry policy.
    pub storage: StorageConfig,
    /// Worker pool sizing and leaf retry limits.
    pub worker: WorkerConfig,
}

/// Feed location and HTTP client settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// URL of the top-level index document.
    pub index_url: String,
    /// Lower bound used when neither the caller nor a cursor supplies one.
    pub default_min: DateTime<Utc>,
    /// Per-request timeout for feed documents (ms).
    pub request_timeout_ms: u64,
    /// `User-Agent` header sent with every feed request.
    pub user_agent: String,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            index_url: "https://api.nuget.org/v3/catalog0/index.json"
                .to_string(),
            default_min: DateTime::<Utc>::UNIX_EPOCH,
            request_timeout_ms: 30_000,
            user_agent: concat!("feedscan/", env!("CARGO_PKG_VERSION"))
                .to_string(),
        }
    }
}

impl FeedConfig {
    /// [`Self::request_timeout_ms`] as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Queue message limits and delivery policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Largest serialized message the transport accepts (bytes).
    pub max_message_size: usize,
    /// Enqueue calls with at least this many messages are packed into bulk
    /// envelopes; smaller calls send each message on its own.
    pub bulk_enqueue_threshold: usize,
    /// Concurrent sends when messages go out individually.
    pub enqueue_parallelism: usize,
    /// Deliveries after which the transport moves a message to poison.
    pub max_dequeue_count: u32,
    /// How long a received message stays invisible before redelivery (ms).
    pub visibility_timeout_ms: u64,
    /// Messages fetched per receive call.
    pub receive_batch_size: usize,
    /// Sleep between polls when the queue is empty (ms).
    pub idle_backoff_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_message_size: 65_536,
            bulk_enqueue_threshold: 10,
            enqueue_parallelism: 8,
            max_dequeue_count: 32,
            visibility_timeout_ms: 60_000,
            receive_batch_size: 16,
            idle_backoff_ms: 500,
        }
    }
}

impl QueueConfig {
    /// [`Self::visibility_timeout_ms`] as a [`Duration`].
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    /// [`Self::idle_backoff_ms`] as a [`Duration`].
    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }
}

/// Table store paging, batching and the tables the drivers write to.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Rows fetched per range query page. Also caps the lower-bound count.
    pub query_page_size: usize,
    /// Operations per atomic batch; the store rejects larger batches.
    pub max_batch_size: usize,
    /// Full re-fetch attempts when a latest-item merge loses a write race.
    pub merge_retry_attempts: u32,
    /// Table written by direct-aggregation scans.
    pub latest_table: String,
    /// Table written by the leaf details driver.
    pub leaf_details_table: String,
    /// How long a scan start lease is held before it may be stolen (ms).
    pub start_lease_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            query_page_size: 1_000,
            max_batch_size: 100,
            merge_retry_attempts: 5,
            latest_table: "latest_leaves".to_string(),
            leaf_details_table: "leaf_details".to_string(),
            start_lease_ms: 60_000,
        }
    }
}

/// Worker pool settings.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Tasks consuming the work queue.
    pub parallelism: usize,
    /// Driver retries a leaf may request before it is poisoned.
    pub max_leaf_attempts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            max_leaf_attempts: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: PipelineConfig = serde_json::from_str(
            r#"{ "queue": { "bulk_enqueue_threshold": 1 }, "worker": { "parallelism": 2 } }"#,
        )
        .unwrap();

        assert_eq!(cfg.queue.bulk_enqueue_threshold, 1);
        assert_eq!(cfg.queue.max_message_size, 65_536);
        assert_eq!(cfg.worker.parallelism, 2);
        assert_eq!(cfg.worker.max_leaf_attempts, 10);
        assert_eq!(cfg.storage.max_batch_size, 100);
    }
}
