//! Cluster health and fork-suspicion probing.

use async_trait::async_trait;
use loom_types::error::ClientError;
use serde::{Deserialize, Serialize};

/// Node lifecycle states reported by `/node/info` and `/cluster/info`.
///
/// Only `Ready` permits the orchestrator to submit; everything else is
/// treated as not-ready. Unknown strings decode to `Other` rather than
/// failing the probe.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
#[serde(from = "String", into = "String")]
pub enum NodeState {
    /// Fully synchronized and serving.
    Ready,
    /// Downloading or replaying snapshots.
    Observing,
    /// Waiting to join the cluster.
    WaitingForDownload,
    /// Any other reported state.
    Other(String),
}

impl From<String> for NodeState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "Ready" => Self::Ready,
            "Observing" => Self::Observing,
            "WaitingForDownload" => Self::WaitingForDownload,
            _ => Self::Other(s),
        }
    }
}

impl From<NodeState> for String {
    fn from(s: NodeState) -> Self {
        match s {
            NodeState::Ready => "Ready".to_string(),
            NodeState::Observing => "Observing".to_string(),
            NodeState::WaitingForDownload => "WaitingForDownload".to_string(),
            NodeState::Other(o) => o,
        }
    }
}

/// Health of one configured cluster layer.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ClusterHealth {
    /// Layer label (`ml0`, `dl1`, `gl0`).
    pub layer: String,
    /// States reported by the layer's peers.
    pub peer_states: Vec<NodeState>,
}

impl ClusterHealth {
    /// True when every peer reports `Ready`.
    pub fn ready(&self) -> bool {
        !self.peer_states.is_empty() && self.peer_states.iter().all(|s| *s == NodeState::Ready)
    }
}

/// The composite sync status the health gate evaluates.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct SyncStatus {
    /// One entry per configured cluster layer.
    pub clusters: Vec<ClusterHealth>,
}

impl SyncStatus {
    /// Every configured cluster is Ready. This is the gate the scheduler
    /// requires before issuing submissions.
    pub fn all_ready(&self) -> bool {
        !self.clusters.is_empty() && self.clusters.iter().all(ClusterHealth::ready)
    }

    /// Every peer of every cluster reports a known non-failure state.
    /// Surfaced for logging only; the gate keys off [`all_ready`](Self::all_ready).
    pub fn all_healthy(&self) -> bool {
        self.clusters.iter().all(|c| {
            c.peer_states
                .iter()
                .all(|s| !matches!(s, NodeState::Other(_)))
        })
    }

    /// Fork suspicion: peers of the same layer disagree on their state.
    pub fn fork_suspected(&self) -> bool {
        self.clusters.iter().any(|c| {
            c.peer_states
                .windows(2)
                .any(|pair| pair[0] != pair[1])
        })
    }
}

/// Probe for the composite sync status.
#[async_trait]
pub trait HealthApi: Send + Sync {
    /// Queries every configured layer and assembles the composite status.
    async fn sync_status(&self) -> Result<SyncStatus, ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(layer: &str, states: &[NodeState]) -> ClusterHealth {
        ClusterHealth {
            layer: layer.to_string(),
            peer_states: states.to_vec(),
        }
    }

    #[test]
    fn all_ready_requires_every_cluster() {
        let status = SyncStatus {
            clusters: vec![
                cluster("ml0", &[NodeState::Ready, NodeState::Ready]),
                cluster("dl1", &[NodeState::Observing]),
            ],
        };
        assert!(!status.all_ready());
        assert!(!status.fork_suspected());

        let status = SyncStatus {
            clusters: vec![cluster("ml0", &[NodeState::Ready])],
        };
        assert!(status.all_ready());
    }

    #[test]
    fn disagreeing_peers_suggest_a_fork() {
        let status = SyncStatus {
            clusters: vec![cluster(
                "ml0",
                &[NodeState::Ready, NodeState::Observing, NodeState::Ready],
            )],
        };
        assert!(status.fork_suspected());
    }

    #[test]
    fn empty_status_is_not_ready() {
        assert!(!SyncStatus::default().all_ready());
    }

    #[test]
    fn unknown_states_decode_as_other() {
        let s: NodeState = serde_json::from_str("\"SessionStarted\"").unwrap();
        assert!(matches!(s, NodeState::Other(_)));
    }
}
