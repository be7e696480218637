//! The indexer HTTP server: intake + query routes behind the usual layer
//! stack, with graceful shutdown and idempotent webhook re-subscription.

use crate::store::Store;
use crate::{intake, query};
use axum::{
    error_handling::HandleErrorLayer,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use loom_client::{DataLayerApi, HttpDataLayer};
use loom_types::snapshot::StoredRejection;
use loom_types::MAX_WEBHOOK_BODY_BYTES;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tower::{BoxError, ServiceBuilder};
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

// --- Error Handling ---

/// Errors surfaced by HTTP handlers, mapped to `{error, details?}` bodies.
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "error": msg }),
            ),
            AppError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                serde_json::json!({ "error": msg }),
            ),
            AppError::Internal(e) => {
                tracing::error!(target: "indexer", "Internal error: {e:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    serde_json::json!({ "error": "internal server error" }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

async fn map_middleware_error(err: BoxError) -> impl IntoResponse {
    if err.is::<tower::timeout::error::Elapsed>() {
        (
            StatusCode::REQUEST_TIMEOUT,
            Json(serde_json::json!({ "error": "request timed out" })),
        )
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": err.to_string() })),
        )
    }
}

/// Shared state behind the router.
pub struct IndexerState {
    /// The persistent store.
    pub store: Store,
    /// Newly indexed rejections, published for the orchestrator's
    /// progression logic and any external consumer.
    pub rejections_tx: broadcast::Sender<StoredRejection>,
    /// Shared secret deliveries must be signed with, when configured.
    pub webhook_secret: Option<String>,
    /// Snapshot-layer access for post-confirmation checkpoint sync; fiber
    /// state and transition indexing are disabled when absent.
    pub checkpoint_source: Option<Arc<dyn DataLayerApi>>,
}

/// Builds the indexer router over the given state.
pub fn router(state: Arc<IndexerState>) -> Router {
    Router::new()
        .route("/webhook/rejection", post(intake::rejection_handler))
        .route("/webhook/snapshot", post(intake::snapshot_handler))
        .route("/rejections", get(query::list_rejections))
        .route("/rejections/:update_hash", get(query::rejection_by_hash))
        .route("/fibers/:fiber_id", get(query::fiber_state))
        .route("/fibers/:fiber_id/rejections", get(query::fiber_rejections))
        .route(
            "/fibers/:fiber_id/transitions",
            get(query::fiber_transitions),
        )
        .with_state(state)
        // `HandleErrorLayer` must wrap the fallible layers to make the
        // service infallible.
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(map_middleware_error))
                .load_shed()
                .concurrency_limit(64)
                .timeout(Duration::from_secs(5)),
        )
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(MAX_WEBHOOK_BODY_BYTES))
}

/// Serves the indexer until the shutdown channel fires.
pub async fn run_server(
    listen_addr: SocketAddr,
    state: Arc<IndexerState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = router(state);
    tracing::info!(target: "indexer", %listen_addr, "indexer listening");
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;

    let server = axum::serve(listener, app.into_make_service()).with_graceful_shutdown(
        async move {
            shutdown_rx.changed().await.ok();
            tracing::info!(target: "indexer", "shutting down gracefully");
        },
    );

    if let Err(e) = server.await {
        tracing::error!(target: "indexer", error = %e, "server error");
    }
    Ok(())
}

/// Ensures a webhook subscription for `callback_url` exists, surviving
/// restarts without duplicating subscribers. Failures are logged and
/// retried on the next boot rather than aborting the indexer.
pub async fn ensure_subscription(
    client: &HttpDataLayer,
    callback_url: &str,
    secret: Option<&str>,
) {
    match client.list_webhook_subscribers().await {
        Ok(subscribers) => {
            if subscribers.iter().any(|s| s.callback_url == callback_url) {
                tracing::info!(target: "indexer", callback_url, "webhook subscription already present");
                return;
            }
        }
        Err(e) => {
            tracing::warn!(target: "indexer", error = %e, "could not list webhook subscribers");
        }
    }
    match client.subscribe_webhook(callback_url, secret).await {
        Ok(subscription) => {
            tracing::info!(
                target: "indexer",
                id = %subscription.id,
                callback_url,
                "webhook subscription registered"
            );
        }
        Err(e) => {
            tracing::warn!(target: "indexer", error = %e, "webhook subscription failed; intake will still accept deliveries");
        }
    }
}
