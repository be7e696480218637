//! Snapshot records, rejection records, and the webhook event shapes.

use crate::fiber::UpdateType;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle status of an indexed snapshot.
///
/// For any ordinal at most one snapshot is `Confirmed`; older `Pending`
/// snapshots preceding a newer confirmation become `Orphaned`.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnapshotStatus {
    /// Seen at the metagraph layer, not yet confirmed globally.
    Pending,
    /// Included in a confirmed global snapshot.
    Confirmed,
    /// Superseded by a later confirmation without ever confirming.
    Orphaned,
}

/// An indexed snapshot row, keyed by `ordinal`.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    /// Monotonic, globally ordered snapshot ordinal.
    pub ordinal: u64,
    /// Snapshot hash.
    pub hash: String,
    /// Current lifecycle status.
    pub status: SnapshotStatus,
    /// The global (L0) ordinal that confirmed this snapshot, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gl0_ordinal: Option<u64>,
    /// Millisecond epoch when the confirmation arrived, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed_at: Option<u64>,
}

/// A structured rejection reason `{code, message}`.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct RejectionReason {
    /// Stable machine-readable code (e.g. `NotSignedByOwner`).
    pub code: String,
    /// Human-readable detail.
    #[serde(default)]
    pub message: String,
}

/// A transaction accepted by the data layer but discarded by the snapshot
/// layer during guard evaluation or validation.
///
/// `update_hash` is globally unique and is the deduplication key for intake:
/// re-delivery of the same hash is a no-op.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RejectedTransaction {
    /// Snapshot ordinal the rejection was observed at.
    pub ordinal: u64,
    /// Millisecond epoch of the rejection.
    pub timestamp: u64,
    /// Kind of the rejected update.
    pub update_type: UpdateType,
    /// The fiber the update addressed.
    pub fiber_id: String,
    /// The stale sequence number carried by the update, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_sequence_number: Option<u64>,
    /// Structured rejection reasons.
    pub errors: Vec<RejectionReason>,
    /// Addresses whose proofs were attached to the update.
    pub signers: Vec<String>,
    /// Globally unique hash of the rejected update.
    pub update_hash: String,
    /// The raw rejected payload, retained verbatim for diagnosis.
    #[serde(default)]
    pub raw_payload: Value,
}

/// A stored rejection: the webhook record plus its synthetic row id.
///
/// The id is assigned monotonically at insert time, making the
/// `(ordinal desc, id desc)` query ordering a stable total order.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StoredRejection {
    /// Synthetic monotonically increasing row id.
    pub id: u64,
    /// The rejection record itself.
    #[serde(flatten)]
    pub rejection: RejectedTransaction,
}

/// The `transaction.rejected` webhook event shape.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RejectionEvent {
    /// Always `"transaction.rejected"`.
    pub event: String,
    /// Snapshot ordinal of the rejection.
    pub ordinal: u64,
    /// Millisecond epoch of the rejection.
    pub timestamp: u64,
    /// Identifier of the emitting metagraph.
    pub metagraph_id: String,
    /// The rejection record.
    pub rejection: RejectedTransaction,
}

/// The `snapshot.confirmed` webhook event shape.
///
/// Producers disagree on the ordinal field name (`ordinal` vs `ml0Ordinal`);
/// both are accepted.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationEvent {
    /// Always `"snapshot.confirmed"`.
    pub event: String,
    /// The metagraph-layer ordinal being confirmed.
    #[serde(alias = "ml0Ordinal")]
    pub ordinal: u64,
    /// Hash of the confirmed snapshot.
    pub hash: String,
    /// The confirming global (L0) ordinal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gl0_ordinal: Option<u64>,
}

/// A successfully applied transition, as indexed for the query surface.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct IndexedTransition {
    /// The fiber that transitioned.
    pub fiber_id: String,
    /// Sequence number after the transition.
    pub sequence_number: u64,
    /// The event that fired.
    pub event_name: String,
    /// Destination state.
    pub state: String,
    /// Ordinal of the snapshot that included the transition.
    pub ordinal: u64,
    /// Millisecond epoch when the transition was indexed.
    pub timestamp: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn confirmation_accepts_both_ordinal_spellings() {
        let a: ConfirmationEvent = serde_json::from_value(json!({
            "event": "snapshot.confirmed",
            "ordinal": 5,
            "hash": "h"
        }))
        .unwrap();
        let b: ConfirmationEvent = serde_json::from_value(json!({
            "event": "snapshot.confirmed",
            "ml0Ordinal": 5,
            "gl0Ordinal": 99,
            "hash": "h"
        }))
        .unwrap();
        assert_eq!(a.ordinal, 5);
        assert_eq!(b.ordinal, 5);
        assert_eq!(b.gl0_ordinal, Some(99));
    }

    #[test]
    fn stored_rejection_flattens_record() {
        let stored = StoredRejection {
            id: 3,
            rejection: RejectedTransaction {
                ordinal: 10,
                timestamp: 1,
                update_type: UpdateType::TransitionStateMachine,
                fiber_id: "f".into(),
                target_sequence_number: Some(4),
                errors: vec![RejectionReason {
                    code: "NotSignedByOwner".into(),
                    message: String::new(),
                }],
                signers: vec!["addr".into()],
                update_hash: "h".into(),
                raw_payload: json!({}),
            },
        };
        let v = serde_json::to_value(&stored).unwrap();
        assert_eq!(v["id"], json!(3));
        assert_eq!(v["updateHash"], json!("h"));
    }
}
