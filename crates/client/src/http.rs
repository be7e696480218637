//! The production `reqwest`-backed implementation of the client traits.

use crate::api::DataLayerApi;
use crate::health::{ClusterHealth, HealthApi, NodeState, SyncStatus};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use loom_types::config::Endpoints;
use loom_types::envelope::Signed;
use loom_types::error::ClientError;
use loom_types::fiber::{Checkpoint, DataUpdate, Fiber, SubmitReceipt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Deadline for read-side queries.
const QUERY_TIMEOUT: Duration = Duration::from_secs(3);
/// Deadline for submissions.
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client over the configured metagraph endpoints.
#[derive(Clone)]
pub struct HttpDataLayer {
    http: reqwest::Client,
    ml0_url: String,
    dl1_urls: Vec<String>,
    /// Submission targets: the external bridge first when configured, then
    /// the data nodes.
    submit_urls: Vec<String>,
    gl0_url: Option<String>,
}

impl HttpDataLayer {
    /// Builds a client from the endpoint configuration.
    pub fn new(endpoints: &Endpoints) -> Result<Self, ClientError> {
        if endpoints.ml0_url.is_empty() {
            return Err(ClientError::Malformed("ML0_URL is required".to_string()));
        }
        if endpoints.dl1_urls.is_empty() {
            return Err(ClientError::Malformed(
                "at least one DL1_URL is required".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .build()
            .map_err(|e| ClientError::Network(e.to_string()))?;
        let dl1_urls: Vec<String> = endpoints.dl1_urls.iter().map(|u| trim_base(u)).collect();
        let submit_urls: Vec<String> = endpoints
            .bridge_url
            .as_deref()
            .map(trim_base)
            .into_iter()
            .chain(dl1_urls.iter().cloned())
            .collect();
        Ok(Self {
            http,
            ml0_url: trim_base(&endpoints.ml0_url),
            dl1_urls,
            submit_urls,
            gl0_url: endpoints.gl0_url.as_deref().map(trim_base),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String) -> Result<T, ClientError> {
        let resp = self
            .http
            .get(&url)
            .timeout(QUERY_TIMEOUT)
            .send()
            .await
            .map_err(|e| classify(e, QUERY_TIMEOUT))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }
        resp.json::<T>()
            .await
            .map_err(|e| ClientError::Malformed(e.to_string()))
    }

    async fn submit_to(
        &self,
        base: &str,
        envelope: &Signed<DataUpdate>,
    ) -> Result<SubmitReceipt, ClientError> {
        let url = format!("{base}/data");
        let resp = self
            .http
            .post(&url)
            .timeout(SUBMIT_TIMEOUT)
            .json(envelope)
            .send()
            .await
            .map_err(|e| classify(e, SUBMIT_TIMEOUT))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }
        resp.json::<SubmitReceipt>()
            .await
            .map_err(|e| ClientError::Malformed(e.to_string()))
    }

    /// Dispatches the envelope to every data node in parallel, returning the
    /// first success. When all endpoints fail the errors are aggregated.
    pub async fn submit_broadcast(
        &self,
        envelope: &Signed<DataUpdate>,
    ) -> Result<SubmitReceipt, ClientError> {
        if self.submit_urls.len() == 1 {
            return self.submit_to(&self.submit_urls[0], envelope).await;
        }
        let mut inflight: FuturesUnordered<_> = self
            .submit_urls
            .iter()
            .map(|base| {
                let base = base.clone();
                async move { (base.clone(), self.submit_to(&base, envelope).await) }
            })
            .collect();

        let mut failures = Vec::new();
        while let Some((base, result)) = inflight.next().await {
            match result {
                Ok(receipt) => return Ok(receipt),
                Err(e) => {
                    tracing::debug!(target: "client", endpoint = %base, error = %e, "broadcast leg failed");
                    failures.push(format!("{base}: {e}"));
                }
            }
        }
        Err(ClientError::Network(format!(
            "all {} data nodes failed: [{}]",
            failures.len(),
            failures.join("; ")
        )))
    }

    /// Ordinal of the latest global (L0) snapshot, when a GL0 URL is set.
    pub async fn get_global_ordinal(&self) -> Result<Option<u64>, ClientError> {
        let Some(base) = &self.gl0_url else {
            return Ok(None);
        };
        let v: Value = self
            .get_json(format!("{base}/global-snapshots/latest"))
            .await?;
        Ok(parse_ordinal(&v))
    }

    /// Registers a webhook subscription with the snapshot layer.
    pub async fn subscribe_webhook(
        &self,
        callback_url: &str,
        secret: Option<&str>,
    ) -> Result<WebhookSubscription, ClientError> {
        let url = format!("{}/data-application/v1/webhooks/subscribe", self.ml0_url);
        let body = SubscribeRequest {
            callback_url: callback_url.to_string(),
            secret: secret.map(str::to_string),
        };
        let resp = self
            .http
            .post(&url)
            .timeout(QUERY_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify(e, QUERY_TIMEOUT))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }
        resp.json::<WebhookSubscription>()
            .await
            .map_err(|e| ClientError::Malformed(e.to_string()))
    }

    /// Removes a webhook subscription.
    pub async fn unsubscribe_webhook(&self, id: &str) -> Result<(), ClientError> {
        let url = format!(
            "{}/data-application/v1/webhooks/subscribe/{id}",
            self.ml0_url
        );
        let resp = self
            .http
            .delete(&url)
            .timeout(QUERY_TIMEOUT)
            .send()
            .await
            .map_err(|e| classify(e, QUERY_TIMEOUT))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    /// Lists the snapshot layer's current webhook subscribers.
    pub async fn list_webhook_subscribers(
        &self,
    ) -> Result<Vec<WebhookSubscription>, ClientError> {
        self.get_json(format!(
            "{}/data-application/v1/webhooks/subscribers",
            self.ml0_url
        ))
        .await
    }

    async fn layer_health(&self, layer: &str, base: &str) -> ClusterHealth {
        let peers: Result<Vec<PeerInfo>, ClientError> =
            self.get_json(format!("{base}/cluster/info")).await;
        let peer_states = match peers {
            Ok(list) if !list.is_empty() => list.into_iter().map(|p| p.state).collect(),
            // Single-node layers expose /node/info only.
            _ => match self
                .get_json::<PeerInfo>(format!("{base}/node/info"))
                .await
            {
                Ok(info) => vec![info.state],
                Err(e) => {
                    tracing::warn!(target: "client", layer, error = %e, "health probe failed");
                    vec![NodeState::Other("unreachable".to_string())]
                }
            },
        };
        ClusterHealth {
            layer: layer.to_string(),
            peer_states,
        }
    }
}

#[async_trait]
impl DataLayerApi for HttpDataLayer {
    async fn submit(&self, envelope: &Signed<DataUpdate>) -> Result<SubmitReceipt, ClientError> {
        self.submit_broadcast(envelope).await
    }

    async fn get_state_machine(&self, fiber_id: &str) -> Result<Option<Fiber>, ClientError> {
        let url = format!(
            "{}/data-application/v1/state-machines/{fiber_id}",
            self.ml0_url
        );
        let resp = self
            .http
            .get(&url)
            .timeout(QUERY_TIMEOUT)
            .send()
            .await
            .map_err(|e| classify(e, QUERY_TIMEOUT))?;
        let status = resp.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }
        resp.json::<Fiber>()
            .await
            .map(Some)
            .map_err(|e| ClientError::Malformed(e.to_string()))
    }

    async fn get_checkpoint(&self) -> Result<Checkpoint, ClientError> {
        self.get_json(format!("{}/data-application/v1/checkpoint", self.ml0_url))
            .await
    }

    async fn get_latest_ordinal(&self) -> Result<Option<u64>, ClientError> {
        let url = format!("{}/snapshots/latest/ordinal", self.ml0_url);
        let resp = self
            .http
            .get(&url)
            .timeout(QUERY_TIMEOUT)
            .send()
            .await
            .map_err(|e| classify(e, QUERY_TIMEOUT))?;
        let status = resp.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }
        let v: Value = resp
            .json()
            .await
            .map_err(|e| ClientError::Malformed(e.to_string()))?;
        Ok(parse_ordinal(&v))
    }
}

#[async_trait]
impl HealthApi for HttpDataLayer {
    async fn sync_status(&self) -> Result<SyncStatus, ClientError> {
        let mut clusters = vec![self.layer_health("ml0", &self.ml0_url).await];
        for (i, base) in self.dl1_urls.iter().enumerate() {
            clusters.push(self.layer_health(&format!("dl1-{i}"), base).await);
        }
        if let Some(gl0) = &self.gl0_url {
            clusters.push(self.layer_health("gl0", gl0).await);
        }
        Ok(SyncStatus { clusters })
    }
}

/// A registered webhook subscription.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct WebhookSubscription {
    /// Subscription id assigned by the snapshot layer.
    pub id: String,
    /// The callback URL events are delivered to.
    #[serde(default)]
    pub callback_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubscribeRequest {
    callback_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    secret: Option<String>,
}

#[derive(Deserialize)]
struct PeerInfo {
    state: NodeState,
}

fn trim_base(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

fn classify(err: reqwest::Error, deadline: Duration) -> ClientError {
    if err.is_timeout() {
        ClientError::Timeout(deadline.as_millis() as u64)
    } else {
        ClientError::Network(err.to_string())
    }
}

/// Accepts the ordinal shapes seen across node versions: a bare number,
/// `{"ordinal": n}`, `{"value": n}`, or `{"value": {"ordinal": n}}`.
fn parse_ordinal(v: &Value) -> Option<u64> {
    if let Some(n) = v.as_u64() {
        return Some(n);
    }
    if let Some(n) = v.get("ordinal").and_then(Value::as_u64) {
        return Some(n);
    }
    match v.get("value") {
        Some(inner) if inner.is_u64() => inner.as_u64(),
        Some(inner) => inner.get("ordinal").and_then(Value::as_u64),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ordinal_shapes_parse() {
        assert_eq!(parse_ordinal(&json!(7)), Some(7));
        assert_eq!(parse_ordinal(&json!({"ordinal": 7})), Some(7));
        assert_eq!(parse_ordinal(&json!({"value": 7})), Some(7));
        assert_eq!(parse_ordinal(&json!({"value": {"ordinal": 7}})), Some(7));
        assert_eq!(parse_ordinal(&json!({"other": 7})), None);
    }

    #[test]
    fn base_urls_are_trimmed() {
        assert_eq!(trim_base("http://a:9000/"), "http://a:9000");
        assert_eq!(trim_base("http://a:9000"), "http://a:9000");
    }
}
