//! Read-only access to the hierarchical change feed.

use std::fmt;

use async_trait::async_trait;
use feedscan_model::{CatalogIndex, CatalogPage, LeafType};
use reqwest::Client;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::config::FeedConfig;
use crate::error::{Result, ScanError};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FeedClient: Send + Sync {
    async fn fetch_index(&self) -> Result<CatalogIndex>;

    async fn fetch_page(&self, url: &str) -> Result<CatalogPage>;

    /// The raw leaf document. Its shape depends on the leaf type and is
    /// only interpreted by drivers.
    async fn fetch_leaf(&self, leaf_type: LeafType, url: &str) -> Result<Value>;
}

/// Feed client over HTTP(S).
#[derive(Clone)]
pub struct HttpFeedClient {
    client: Client,
    index_url: Url,
}

impl fmt::Debug for HttpFeedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpFeedClient")
            .field("index_url", &self.index_url.as_str())
            .finish()
    }
}

impl HttpFeedClient {
    pub fn new(config: &FeedConfig) -> Result<Self> {
        let index_url = Url::parse(&config.index_url).map_err(|e| {
            ScanError::InvalidRequest(format!(
                "invalid feed index url {}: {e}",
                config.index_url
            ))
        })?;
        let client = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client, index_url })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        debug!(url = %url, "fetching feed document");
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl FeedClient for HttpFeedClient {
    async fn fetch_index(&self) -> Result<CatalogIndex> {
        self.get_json(self.index_url.as_str()).await
    }

    async fn fetch_page(&self, url: &str) -> Result<CatalogPage> {
        self.get_json(url).await
    }

    async fn fetch_leaf(&self, leaf_type: LeafType, url: &str) -> Result<Value> {
        debug!(leaf_type = leaf_type.as_str(), "fetching leaf");
        self.get_json(url).await
    }
}
