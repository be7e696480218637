//! Webhook intake handlers.
//!
//! The metagraph delivers `transaction.rejected` and `snapshot.confirmed`
//! events here. Rejections deduplicate on `updateHash` (re-delivery answers
//! 2xx with `alreadyIndexed: true` and writes nothing); confirmations move
//! the snapshot row to CONFIRMED and sweep older PENDING rows to ORPHANED.
//! Newly indexed rejections are published on the broadcast channel consumed
//! by the orchestrator's progression logic.

use crate::server::{AppError, IndexerState};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use loom_crypto::canonical::sha256;
use loom_telemetry::intake_metrics;
use loom_types::snapshot::{ConfirmationEvent, RejectionEvent};
use loom_types::time::now_ms;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// Header carrying `hex(sha256(secret || body))` when a subscription secret
/// is configured.
const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// Verifies the shared-secret signature on a delivery, when configured.
/// Unsigned or mis-signed deliveries are refused and counted.
fn verify_delivery(
    state: &IndexerState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), AppError> {
    let Some(secret) = &state.webhook_secret else {
        return Ok(());
    };
    let mut preimage = Vec::with_capacity(secret.len() + body.len());
    preimage.extend_from_slice(secret.as_bytes());
    preimage.extend_from_slice(body);
    let expected = hex::encode(sha256(&preimage));

    match headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()) {
        Some(signature) if signature.eq_ignore_ascii_case(&expected) => Ok(()),
        _ => {
            intake_metrics().inc_webhook_rejected();
            Err(AppError::BadRequest(
                "webhook signature verification failed".into(),
            ))
        }
    }
}

fn decode_event<T: DeserializeOwned>(body: &[u8]) -> Result<T, AppError> {
    serde_json::from_slice(body).map_err(|e| {
        intake_metrics().inc_webhook_rejected();
        AppError::BadRequest(format!("malformed webhook payload: {e}"))
    })
}

/// Response body for rejection intake.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RejectionAck {
    pub accepted: bool,
    pub already_indexed: bool,
}

/// Response body for confirmation intake.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationAck {
    pub accepted: bool,
    pub orphaned: u64,
}

/// `POST /webhook/rejection`
pub async fn rejection_handler(
    State(state): State<Arc<IndexerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<RejectionAck>, AppError> {
    verify_delivery(&state, &headers, &body)?;
    let event: RejectionEvent = decode_event(&body)?;
    if event.event != "transaction.rejected" {
        intake_metrics().inc_webhook_rejected();
        return Err(AppError::BadRequest(format!(
            "unexpected event '{}' on the rejection endpoint",
            event.event
        )));
    }
    if event.rejection.update_hash.is_empty() {
        intake_metrics().inc_webhook_rejected();
        return Err(AppError::BadRequest("updateHash is required".into()));
    }

    let outcome = state
        .store
        .upsert_rejection(&event.rejection)
        .map_err(|e| AppError::Internal(e.into()))?;

    if outcome.inserted {
        intake_metrics().inc_rejections_indexed();
        tracing::info!(
            target: "intake",
            update_hash = %event.rejection.update_hash,
            fiber_id = %event.rejection.fiber_id,
            ordinal = event.ordinal,
            "rejection indexed"
        );
        // Subscribers may lag or be absent; delivery is best-effort.
        if let Some(stored) = state
            .store
            .rejection_by_hash(&event.rejection.update_hash)
            .map_err(|e| AppError::Internal(e.into()))?
        {
            let _ = state.rejections_tx.send(stored);
        }
    } else {
        intake_metrics().inc_duplicate_rejections();
        tracing::debug!(
            target: "intake",
            update_hash = %event.rejection.update_hash,
            "duplicate rejection delivery"
        );
    }

    Ok(Json(RejectionAck {
        accepted: true,
        already_indexed: !outcome.inserted,
    }))
}

/// `POST /webhook/snapshot`
pub async fn snapshot_handler(
    State(state): State<Arc<IndexerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ConfirmationAck>, AppError> {
    verify_delivery(&state, &headers, &body)?;
    let event: ConfirmationEvent = decode_event(&body)?;
    if event.event != "snapshot.confirmed" {
        intake_metrics().inc_webhook_rejected();
        return Err(AppError::BadRequest(format!(
            "unexpected event '{}' on the snapshot endpoint",
            event.event
        )));
    }

    let outcome = state
        .store
        .confirm_snapshot(event.ordinal, &event.hash, event.gl0_ordinal, now_ms())
        .map_err(|e| AppError::Internal(e.into()))?;

    intake_metrics().inc_confirmations();
    if outcome.orphaned > 0 {
        intake_metrics().inc_orphaned(outcome.orphaned);
    }
    tracing::info!(
        target: "intake",
        ordinal = event.ordinal,
        gl0_ordinal = ?event.gl0_ordinal,
        orphaned = outcome.orphaned,
        "snapshot confirmed"
    );

    // Fiber states and their transition log follow the confirmed view.
    if state.checkpoint_source.is_some() {
        sync_checkpoint(&state, event.ordinal).await;
    }

    Ok(Json(ConfirmationAck {
        accepted: true,
        orphaned: outcome.orphaned,
    }))
}

/// Refreshes last-indexed fiber state from the checkpoint and records an
/// entry in the transition log for every fiber whose sequence advanced.
/// Sync failures never fail the webhook; the next confirmation retries.
async fn sync_checkpoint(state: &IndexerState, ordinal: u64) {
    let Some(source) = &state.checkpoint_source else {
        return;
    };
    let checkpoint = match source.get_checkpoint().await {
        Ok(checkpoint) => checkpoint,
        Err(e) => {
            tracing::warn!(target: "intake", error = %e, "checkpoint sync failed");
            return;
        }
    };
    for fiber in checkpoint.state.state_machines.values() {
        let prior_sequence = match state.store.fiber(&fiber.fiber_id) {
            Ok(Some(prior)) => Some(prior.sequence_number),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(target: "intake", error = %e, fiber_id = %fiber.fiber_id, "fiber lookup failed");
                continue;
            }
        };
        let advanced = prior_sequence
            .map(|prior| fiber.sequence_number > prior)
            .unwrap_or(fiber.sequence_number > 0);
        if let Err(e) = state.store.put_fiber(fiber) {
            tracing::warn!(target: "intake", error = %e, fiber_id = %fiber.fiber_id, "fiber index failed");
            continue;
        }
        if !advanced {
            continue;
        }
        let event_name = fiber
            .state_data
            .get("lastEvent")
            .and_then(|v| v.as_str())
            .unwrap_or("applied")
            .to_string();
        let transition = loom_types::snapshot::IndexedTransition {
            fiber_id: fiber.fiber_id.clone(),
            sequence_number: fiber.sequence_number,
            event_name,
            state: fiber.current_state.clone(),
            ordinal,
            timestamp: now_ms(),
        };
        if let Err(e) = state.store.record_transition(&transition) {
            tracing::warn!(target: "intake", error = %e, fiber_id = %fiber.fiber_id, "transition index failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{RejectionFilter, Store};
    use loom_types::fiber::UpdateType;
    use loom_types::snapshot::{RejectedTransaction, RejectionReason, SnapshotStatus};
    use serde_json::json;
    use tokio::sync::broadcast;

    fn state_with_secret(secret: Option<&str>) -> (Arc<IndexerState>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("indexer.redb")).unwrap();
        let (rejections_tx, _) = broadcast::channel(16);
        (
            Arc::new(IndexerState {
                store,
                rejections_tx,
                webhook_secret: secret.map(str::to_string),
                checkpoint_source: None,
            }),
            dir,
        )
    }

    fn state() -> (Arc<IndexerState>, tempfile::TempDir) {
        state_with_secret(None)
    }

    fn body_of(event: &RejectionEvent) -> Bytes {
        Bytes::from(serde_json::to_vec(event).unwrap())
    }

    fn event(hash: &str) -> RejectionEvent {
        RejectionEvent {
            event: "transaction.rejected".into(),
            ordinal: 42,
            timestamp: 1,
            metagraph_id: "mg".into(),
            rejection: RejectedTransaction {
                ordinal: 42,
                timestamp: 1,
                update_type: UpdateType::TransitionStateMachine,
                fiber_id: "f-1".into(),
                target_sequence_number: None,
                errors: vec![RejectionReason {
                    code: "NotSignedByOwner".into(),
                    message: String::new(),
                }],
                signers: vec!["addr".into()],
                update_hash: hash.into(),
                raw_payload: json!({}),
            },
        }
    }

    #[tokio::test]
    async fn duplicate_delivery_reports_already_indexed() {
        let (state, _dir) = state();
        let mut rx = state.rejections_tx.subscribe();

        let first = rejection_handler(
            State(state.clone()),
            HeaderMap::new(),
            body_of(&event("h-1")),
        )
        .await
        .unwrap();
        assert!(!first.already_indexed);
        assert_eq!(rx.recv().await.unwrap().rejection.update_hash, "h-1");

        let second = rejection_handler(
            State(state.clone()),
            HeaderMap::new(),
            body_of(&event("h-1")),
        )
        .await
        .unwrap();
        assert!(second.already_indexed);
        // No second publication.
        assert!(rx.try_recv().is_err());

        let page = state
            .store
            .query_rejections(&RejectionFilter {
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn wrong_event_kind_is_a_bad_request() {
        let (state, _dir) = state();
        let mut bad = event("h-2");
        bad.event = "snapshot.confirmed".into();
        let err = rejection_handler(State(state), HeaderMap::new(), body_of(&bad)).await;
        assert!(matches!(err, Err(AppError::BadRequest(_))));
    }

    #[tokio::test]
    async fn unsigned_delivery_is_refused_when_a_secret_is_set() {
        let (state, _dir) = state_with_secret(Some("s3cret"));
        let body = body_of(&event("h-3"));

        let unsigned = rejection_handler(State(state.clone()), HeaderMap::new(), body.clone()).await;
        assert!(matches!(unsigned, Err(AppError::BadRequest(_))));

        // A correctly signed delivery passes.
        let mut preimage = b"s3cret".to_vec();
        preimage.extend_from_slice(&body);
        let mut headers = HeaderMap::new();
        headers.insert(
            SIGNATURE_HEADER,
            hex::encode(sha256(&preimage)).parse().unwrap(),
        );
        let signed = rejection_handler(State(state), headers, body).await.unwrap();
        assert!(signed.accepted);
    }

    #[tokio::test]
    async fn confirmation_syncs_fibers_and_transitions() {
        use loom_client::testing::MockDataLayer;
        use loom_types::fiber::Fiber;

        let mock = Arc::new(MockDataLayer::new());
        mock.put_fiber(Fiber {
            fiber_id: "f-9".into(),
            definition: None,
            current_state: "ACTIVE".into(),
            state_data: json!({ "status": "ACTIVE", "lastEvent": "accept" }),
            sequence_number: 2,
            owners: None,
            parent_fiber_id: None,
        });

        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("indexer.redb")).unwrap();
        let (rejections_tx, _) = broadcast::channel(4);
        let state = Arc::new(IndexerState {
            store,
            rejections_tx,
            webhook_secret: None,
            checkpoint_source: Some(mock),
        });

        let confirmation = serde_json::to_vec(&ConfirmationEvent {
            event: "snapshot.confirmed".into(),
            ordinal: 11,
            hash: "s11".into(),
            gl0_ordinal: None,
        })
        .unwrap();
        snapshot_handler(
            State(state.clone()),
            HeaderMap::new(),
            Bytes::from(confirmation),
        )
        .await
        .unwrap();

        let fiber = state.store.fiber("f-9").unwrap().unwrap();
        assert_eq!(fiber.sequence_number, 2);
        let transitions = state.store.transitions_for("f-9", 10).unwrap();
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].event_name, "accept");
        assert_eq!(transitions[0].ordinal, 11);
        assert_eq!(transitions[0].state, "ACTIVE");
    }

    #[tokio::test]
    async fn confirmation_sweeps_pending_rows() {
        let (state, _dir) = state();
        state.store.mark_pending(1, "s1").unwrap();
        state.store.mark_pending(2, "s2").unwrap();

        let confirmation = serde_json::to_vec(&ConfirmationEvent {
            event: "snapshot.confirmed".into(),
            ordinal: 3,
            hash: "s3".into(),
            gl0_ordinal: Some(77),
        })
        .unwrap();
        let ack = snapshot_handler(
            State(state.clone()),
            HeaderMap::new(),
            Bytes::from(confirmation),
        )
        .await
        .unwrap();
        assert!(ack.accepted);
        assert_eq!(ack.orphaned, 2);

        let confirmed = state.store.snapshot(3).unwrap().unwrap();
        assert_eq!(confirmed.status, SnapshotStatus::Confirmed);
        assert_eq!(confirmed.gl0_ordinal, Some(77));
    }
}
