//! Client for the indexer's query API.

use async_trait::async_trait;
use loom_types::error::ClientError;
use loom_types::snapshot::StoredRejection;
use serde::Deserialize;
use std::time::Duration;

/// A consumer-side view of the rejection feed.
#[async_trait]
pub trait RejectionFeed: Send + Sync {
    /// Rejections with ordinal at or above `from_ordinal`, oldest last
    /// (the indexer orders ordinal-descending).
    async fn rejections_since(
        &self,
        from_ordinal: u64,
        limit: usize,
    ) -> Result<Vec<StoredRejection>, ClientError>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RejectionsPage {
    rejections: Vec<StoredRejection>,
}

/// HTTP client over the indexer query surface.
#[derive(Clone)]
pub struct IndexerClient {
    http: reqwest::Client,
    base_url: String,
}

impl IndexerClient {
    /// Builds a client for the given indexer base URL.
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .build()
            .map_err(|e| ClientError::Network(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl RejectionFeed for IndexerClient {
    async fn rejections_since(
        &self,
        from_ordinal: u64,
        limit: usize,
    ) -> Result<Vec<StoredRejection>, ClientError> {
        let url = format!(
            "{}/rejections?fromOrdinal={from_ordinal}&limit={limit}",
            self.base_url
        );
        let resp = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(3))
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }
        let page: RejectionsPage = resp
            .json()
            .await
            .map_err(|e| ClientError::Malformed(e.to_string()))?;
        Ok(page.rejections)
    }
}
