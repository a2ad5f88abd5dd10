//! Wiring the processors into something that consumes a queue.

pub mod dispatcher;
pub mod worker;

use std::fmt;
use std::sync::Arc;

pub use dispatcher::{DispatchStatus, MessageDispatcher, PipelineDispatcher};
pub use worker::{QueueWorkerPool, process_batch};

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::feed::FeedClient;
use crate::queue::{MessageEnqueuer, QueueTransport};
use crate::scan::{
    CatalogScanService, DriverRegistry, IndexScanProcessor, LatestItemResolver,
    LeafScanProcessor, LeaseService, PageScanProcessor, ScanStorageService, TableCursorStore,
};
use crate::store::TableStore;

/// Every pipeline component built over one table store, one queue
/// transport and one feed client.
#[derive(Clone)]
pub struct Pipeline {
    config: PipelineConfig,
    transport: Arc<dyn QueueTransport>,
    storage: ScanStorageService,
    enqueuer: MessageEnqueuer,
    service: CatalogScanService,
    dispatcher: Arc<PipelineDispatcher>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("service", &self.service)
            .finish()
    }
}

impl Pipeline {
    /// Pipeline with the built-in driver for every scan type.
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn TableStore>,
        transport: Arc<dyn QueueTransport>,
        feed: Arc<dyn FeedClient>,
    ) -> Self {
        let drivers = DriverRegistry::with_defaults(feed.clone(), store.clone(), &config.storage);
        Self::with_drivers(config, store, transport, feed, drivers)
    }

    pub fn with_drivers(
        config: PipelineConfig,
        store: Arc<dyn TableStore>,
        transport: Arc<dyn QueueTransport>,
        feed: Arc<dyn FeedClient>,
        drivers: DriverRegistry,
    ) -> Self {
        let storage = ScanStorageService::new(store.clone(), config.storage.query_page_size);
        let enqueuer = MessageEnqueuer::new(transport.clone(), config.queue.clone());
        let latest = LatestItemResolver::new(
            store.clone(),
            config.storage.latest_table.clone(),
            &config.storage,
        );

        let index = IndexScanProcessor::new(
            storage.clone(),
            feed.clone(),
            enqueuer.clone(),
            drivers.clone(),
            config.feed.default_min,
        );
        let page = PageScanProcessor::new(
            storage.clone(),
            feed.clone(),
            enqueuer.clone(),
            drivers.clone(),
            latest,
        );
        let leaf = LeafScanProcessor::new(
            storage.clone(),
            enqueuer.clone(),
            drivers,
            config.worker.max_leaf_attempts,
        );
        let dispatcher = Arc::new(PipelineDispatcher::new(index, page, leaf, enqueuer.clone()));

        let service = CatalogScanService::new(
            storage.clone(),
            Arc::new(TableCursorStore::new(store.clone())),
            LeaseService::new(
                store,
                std::time::Duration::from_millis(config.storage.start_lease_ms),
            ),
            enqueuer.clone(),
            feed,
            config.feed.default_min,
        );

        Self {
            config,
            transport,
            storage,
            enqueuer,
            service,
            dispatcher,
        }
    }

    /// Prepare the table store and the queue.
    pub async fn initialize(&self) -> Result<()> {
        self.service.initialize().await
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn QueueTransport> {
        &self.transport
    }

    pub fn storage(&self) -> &ScanStorageService {
        &self.storage
    }

    pub fn enqueuer(&self) -> &MessageEnqueuer {
        &self.enqueuer
    }

    pub fn service(&self) -> &CatalogScanService {
        &self.service
    }

    pub fn dispatcher(&self) -> Arc<PipelineDispatcher> {
        self.dispatcher.clone()
    }

    /// Handle one batch of work messages on the calling task.
    pub async fn process_batch(&self) -> Result<usize> {
        process_batch(
            self.transport.as_ref(),
            self.dispatcher.as_ref(),
            &self.config.queue,
        )
        .await
    }

    pub fn worker_pool(&self, parallelism: usize) -> QueueWorkerPool {
        QueueWorkerPool::new(
            self.transport.clone(),
            self.dispatcher.clone(),
            self.config.queue.clone(),
            parallelism,
        )
    }
}
