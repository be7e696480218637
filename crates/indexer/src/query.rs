//! The indexer's query surface.

use crate::server::{AppError, IndexerState};
use crate::store::{RejectionFilter, RejectionPage};
use axum::extract::{Path, Query, State};
use axum::Json;
use loom_types::fiber::Fiber;
use loom_types::snapshot::{IndexedTransition, StoredRejection};
use loom_types::MAX_QUERY_LIMIT;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const DEFAULT_LIMIT: usize = 50;

/// Query string accepted by the rejection list endpoints.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct RejectionQuery {
    pub fiber_id: Option<String>,
    pub update_type: Option<String>,
    pub signer: Option<String>,
    pub error_code: Option<String>,
    pub from_ordinal: Option<u64>,
    pub to_ordinal: Option<u64>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl RejectionQuery {
    fn into_filter(self) -> Result<RejectionFilter, AppError> {
        let limit = self.limit.unwrap_or(DEFAULT_LIMIT);
        if limit == 0 || limit > MAX_QUERY_LIMIT {
            return Err(AppError::BadRequest(format!(
                "limit must be within 1..={MAX_QUERY_LIMIT}"
            )));
        }
        if let (Some(from), Some(to)) = (self.from_ordinal, self.to_ordinal) {
            if from > to {
                return Err(AppError::BadRequest(
                    "fromOrdinal must not exceed toOrdinal".into(),
                ));
            }
        }
        Ok(RejectionFilter {
            fiber_id: self.fiber_id,
            update_type: self.update_type,
            signer: self.signer,
            error_code: self.error_code,
            from_ordinal: self.from_ordinal,
            to_ordinal: self.to_ordinal,
            limit,
            offset: self.offset.unwrap_or(0),
        })
    }
}

/// Response body for the rejection list endpoints.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RejectionsResponse {
    pub rejections: Vec<StoredRejection>,
    pub total: usize,
    pub has_more: bool,
}

impl From<RejectionPage> for RejectionsResponse {
    fn from(page: RejectionPage) -> Self {
        Self {
            rejections: page.rejections,
            total: page.total,
            has_more: page.has_more,
        }
    }
}

/// `GET /rejections`
pub async fn list_rejections(
    State(state): State<Arc<IndexerState>>,
    Query(query): Query<RejectionQuery>,
) -> Result<Json<RejectionsResponse>, AppError> {
    let filter = query.into_filter()?;
    let page = state
        .store
        .query_rejections(&filter)
        .map_err(|e| AppError::Internal(e.into()))?;
    Ok(Json(page.into()))
}

/// `GET /rejections/:updateHash` — includes `rawPayload`.
pub async fn rejection_by_hash(
    State(state): State<Arc<IndexerState>>,
    Path(update_hash): Path<String>,
) -> Result<Json<StoredRejection>, AppError> {
    state
        .store
        .rejection_by_hash(&update_hash)
        .map_err(|e| AppError::Internal(e.into()))?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("no rejection with hash {update_hash}")))
}

/// `GET /fibers/:fiberId/rejections`
pub async fn fiber_rejections(
    State(state): State<Arc<IndexerState>>,
    Path(fiber_id): Path<String>,
    Query(mut query): Query<RejectionQuery>,
) -> Result<Json<RejectionsResponse>, AppError> {
    query.fiber_id = Some(fiber_id);
    list_rejections(State(state), Query(query)).await
}

/// `GET /fibers/:fiberId` — last-indexed state.
pub async fn fiber_state(
    State(state): State<Arc<IndexerState>>,
    Path(fiber_id): Path<String>,
) -> Result<Json<Fiber>, AppError> {
    state
        .store
        .fiber(&fiber_id)
        .map_err(|e| AppError::Internal(e.into()))?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("fiber {fiber_id} is not indexed")))
}

#[derive(Deserialize, Debug, Default)]
pub struct TransitionsQuery {
    pub limit: Option<usize>,
}

/// `GET /fibers/:fiberId/transitions` — recent successful transitions.
pub async fn fiber_transitions(
    State(state): State<Arc<IndexerState>>,
    Path(fiber_id): Path<String>,
    Query(query): Query<TransitionsQuery>,
) -> Result<Json<Vec<IndexedTransition>>, AppError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_QUERY_LIMIT);
    state
        .store
        .transitions_for(&fiber_id, limit)
        .map(Json)
        .map_err(|e| AppError::Internal(e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use loom_types::fiber::UpdateType;
    use loom_types::snapshot::{RejectedTransaction, RejectionReason};
    use serde_json::json;
    use tokio::sync::broadcast;

    fn seeded_state() -> (Arc<IndexerState>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("indexer.redb")).unwrap();
        store
            .upsert_rejection(&RejectedTransaction {
                ordinal: 9,
                timestamp: 1,
                update_type: UpdateType::TransitionStateMachine,
                fiber_id: "F".into(),
                target_sequence_number: None,
                errors: vec![RejectionReason {
                    code: "NotSignedByOwner".into(),
                    message: String::new(),
                }],
                signers: vec!["addr-1".into()],
                update_hash: "h".into(),
                raw_payload: json!({"eventName": "accept"}),
            })
            .unwrap();
        let (rejections_tx, _) = broadcast::channel(4);
        (
            Arc::new(IndexerState {
                store,
                rejections_tx,
                webhook_secret: None,
                checkpoint_source: None,
            }),
            dir,
        )
    }

    #[tokio::test]
    async fn rejection_is_reachable_through_every_route() {
        let (state, _dir) = seeded_state();

        // Scoped by fiber.
        let by_fiber = fiber_rejections(
            State(state.clone()),
            Path("F".to_string()),
            Query(RejectionQuery::default()),
        )
        .await
        .unwrap();
        assert_eq!(by_fiber.total, 1);

        // Filtered by error code.
        let by_code = list_rejections(
            State(state.clone()),
            Query(RejectionQuery {
                error_code: Some("NotSignedByOwner".into()),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
        assert_eq!(by_code.total, 1);

        // Direct by hash, with the raw payload attached.
        let direct = rejection_by_hash(State(state.clone()), Path("h".to_string()))
            .await
            .unwrap();
        assert_eq!(direct.rejection.raw_payload["eventName"], "accept");

        // Unknown hash is a 404.
        let missing = rejection_by_hash(State(state), Path("nope".to_string())).await;
        assert!(matches!(missing, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn limit_bounds_are_validated() {
        let (state, _dir) = seeded_state();
        let err = list_rejections(
            State(state),
            Query(RejectionQuery {
                limit: Some(0),
                ..Default::default()
            }),
        )
        .await;
        assert!(matches!(err, Err(AppError::BadRequest(_))));
    }
}
