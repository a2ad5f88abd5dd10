//! # Feedscan Core
//!
//! Queue-driven, resumable scans over a hierarchical, append-only change
//! feed (index → pages → leaves).
//!
//! ## Overview
//!
//! - **Queue layer** ([`queue`]): schema-stamped envelopes, oversized
//!   message splitting, bulk packing and a poison queue over an
//!   at-least-once [`queue::QueueTransport`].
//! - **Table storage** ([`store`]): partitioned rows with etag-guarded
//!   writes, atomic same-partition batches and paged range queries.
//! - **Scan pipeline** ([`scan`]): the index scan state machine, page and
//!   leaf processors, the latest-item conflict resolver, pluggable drivers
//!   and the [`scan::CatalogScanService`] callers start scans with.
//! - **Runtime** ([`runtime`]): message dispatch and the worker pool.
//!
//! Scan state lives entirely in the table store. A worker can crash at any
//! point; redelivery of the same message resumes from what was persisted.
//!
//! ## Feature Flags
//!
//! - `postgres` (default): PostgreSQL-backed queue and table store.
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use feedscan_core::{
//!     config::PipelineConfig,
//!     feed::HttpFeedClient,
//!     queue::InMemoryQueue,
//!     runtime::Pipeline,
//!     scan::StartScanRequest,
//!     store::InMemoryTableStore,
//! };
//! use feedscan_model::ScanType;
//!
//! async fn run() -> feedscan_core::Result<()> {
//!     let config = PipelineConfig::default();
//!     let feed = Arc::new(HttpFeedClient::new(&config.feed)?);
//!     let pipeline = Pipeline::new(
//!         config,
//!         Arc::new(InMemoryTableStore::default()),
//!         Arc::new(InMemoryQueue::default()),
//!         feed,
//!     );
//!     pipeline.initialize().await?;
//!     pipeline
//!         .service()
//!         .start(StartScanRequest::with_default_cursor(ScanType::LatestLeaves))
//!         .await?;
//!     while pipeline.process_batch().await? > 0 {}
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

/// Pipeline configuration sections
pub mod config;

/// Error types
#[allow(missing_docs)]
pub mod error;

/// Feed client
#[allow(missing_docs)]
pub mod feed;

/// Durable queue layer
#[allow(missing_docs)]
pub mod queue;

/// Runtime: dispatch and workers
#[allow(missing_docs)]
pub mod runtime;

/// Index, page and leaf scans
#[allow(missing_docs)]
pub mod scan;

/// Partitioned table storage
#[allow(missing_docs)]
pub mod store;

/// Migrations for the PostgreSQL queue and table store.
#[cfg(feature = "postgres")]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub use error::{Result, ScanError};
pub use feedscan_model as model;
