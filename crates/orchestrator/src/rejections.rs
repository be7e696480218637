//! Rejection feedback into progression decisions.
//!
//! Guard-rule rejections reported by the metagraph arrive through the
//! indexer's query API. Each tick the scheduler absorbs new ones: a
//! rejection on a tracked fiber costs its signers reputation, and a fiber
//! that keeps bouncing is dropped from the active tables so the drivers
//! stop feeding it.

use crate::scheduler::Orchestrator;
use loom_client::RejectionFeed;
use std::collections::HashMap;
use std::sync::Arc;

/// Strikes after which a fiber is abandoned.
const STRIKE_LIMIT: u32 = 3;
/// Page size per poll.
const FEED_LIMIT: usize = 100;

/// Per-fiber rejection bookkeeping.
#[derive(Default)]
pub(crate) struct RejectionLedger {
    feed: Option<Arc<dyn RejectionFeed>>,
    next_ordinal: u64,
    strikes: HashMap<String, u32>,
}

impl RejectionLedger {
    pub(crate) fn with_feed(feed: Arc<dyn RejectionFeed>) -> Self {
        Self {
            feed: Some(feed),
            next_ordinal: 0,
            strikes: HashMap::new(),
        }
    }
}

impl Orchestrator {
    /// Installs the rejection feed consumed by [`absorb_rejections`](Self::absorb_rejections).
    pub fn with_rejection_feed(mut self, feed: Arc<dyn RejectionFeed>) -> Self {
        self.rejections = RejectionLedger::with_feed(feed);
        self
    }

    /// Pulls newly indexed rejections and applies their consequences.
    pub(crate) async fn absorb_rejections(&mut self) {
        let Some(feed) = self.rejections.feed.clone() else {
            return;
        };
        let from = self.rejections.next_ordinal;
        let rejections = match feed.rejections_since(from, FEED_LIMIT).await {
            Ok(rejections) => rejections,
            Err(e) => {
                tracing::debug!(target: "orchestrator", error = %e, "rejection feed unavailable");
                return;
            }
        };

        for stored in rejections {
            let rejection = &stored.rejection;
            self.rejections.next_ordinal = self
                .rejections
                .next_ordinal
                .max(rejection.ordinal.saturating_add(1));

            let tracked = self.contracts.contains_key(&rejection.fiber_id)
                || self.markets.contains_key(&rejection.fiber_id);
            if !tracked {
                continue;
            }

            // Signers pay for rejected writes.
            for signer in &rejection.signers {
                if let Some(agent) = self.population.get_mut(signer) {
                    agent.meta.failed_contracts += 1;
                }
            }

            let strikes = self
                .rejections
                .strikes
                .entry(rejection.fiber_id.clone())
                .or_insert(0);
            *strikes += 1;
            tracing::warn!(
                target: "orchestrator",
                fiber_id = %rejection.fiber_id,
                strikes = *strikes,
                codes = ?rejection.errors.iter().map(|e| e.code.as_str()).collect::<Vec<_>>(),
                "tracked fiber rejected"
            );
            if *strikes >= STRIKE_LIMIT {
                self.abandon_fiber(&rejection.fiber_id);
            }
        }
    }

    fn abandon_fiber(&mut self, fiber_id: &str) {
        self.rejections.strikes.remove(fiber_id);
        if let Some(contract) = self.contracts.remove(fiber_id) {
            self.completions.remove(fiber_id);
            for party in [contract.proposer, contract.counterparty] {
                if let Some(agent) = self.population.get_mut(&party) {
                    agent.meta.active_contracts.remove(fiber_id);
                }
            }
            tracing::warn!(target: "orchestrator", fiber_id, "contract abandoned after repeated rejections");
        }
        if let Some(market) = self.markets.remove(fiber_id) {
            let mut members: Vec<String> = market.commitments.keys().cloned().collect();
            members.push(market.creator);
            for member in members {
                if let Some(agent) = self.population.get_mut(&member) {
                    agent.meta.active_markets.remove(fiber_id);
                }
            }
            tracing::warn!(target: "orchestrator", fiber_id, "market abandoned after repeated rejections");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet_pool::WalletPool;
    use async_trait::async_trait;
    use loom_bridge::{BridgeEngine, ReconcilerConfig};
    use loom_client::testing::{MockDataLayer, StaticHealth};
    use loom_client::SyncStatus;
    use loom_types::agent::{Contract, ContractState};
    use loom_types::config::OrchestratorConfig;
    use loom_types::error::ClientError;
    use loom_types::snapshot::{RejectedTransaction, RejectionReason, StoredRejection};
    use std::sync::Mutex;

    struct StaticFeed(Mutex<Vec<StoredRejection>>);

    #[async_trait]
    impl RejectionFeed for StaticFeed {
        async fn rejections_since(
            &self,
            from_ordinal: u64,
            _limit: usize,
        ) -> Result<Vec<StoredRejection>, ClientError> {
            Ok(self
                .0
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.rejection.ordinal >= from_ordinal)
                .cloned()
                .collect())
        }
    }

    fn stored(ordinal: u64, fiber_id: &str, signer: &str) -> StoredRejection {
        StoredRejection {
            id: ordinal,
            rejection: RejectedTransaction {
                ordinal,
                timestamp: ordinal,
                update_type: loom_types::fiber::UpdateType::TransitionStateMachine,
                fiber_id: fiber_id.to_string(),
                target_sequence_number: None,
                errors: vec![RejectionReason {
                    code: "GuardRejected".into(),
                    message: String::new(),
                }],
                signers: vec![signer.to_string()],
                update_hash: format!("h-{ordinal}"),
                raw_payload: serde_json::json!({}),
            },
        }
    }

    fn orchestrator_with_feed(feed: Arc<dyn RejectionFeed>) -> Orchestrator {
        let engine = Arc::new(BridgeEngine::new(
            Arc::new(MockDataLayer::new()),
            ReconcilerConfig::default(),
        ));
        let health = Arc::new(StaticHealth(SyncStatus::default()));
        Orchestrator::with_seed(
            OrchestratorConfig::default(),
            engine,
            health,
            WalletPool::load(None).unwrap(),
            7,
        )
        .with_rejection_feed(feed)
    }

    #[tokio::test]
    async fn repeated_rejections_drop_the_fiber_and_cost_the_signer() {
        let feed = Arc::new(StaticFeed(Mutex::new(vec![
            stored(1, "c-1", "addr-a"),
            stored(2, "c-1", "addr-a"),
            stored(3, "c-1", "addr-a"),
            stored(4, "untracked", "addr-a"),
        ])));
        let mut orch = orchestrator_with_feed(feed);
        orch.population.spawn(
            "addr-a".into(),
            "00".repeat(32),
            "a".into(),
            "generated".into(),
            0,
            false,
            0.5,
        );
        orch.contracts.insert(
            "c-1".into(),
            Contract {
                fiber_id: "c-1".into(),
                proposer: "addr-a".into(),
                counterparty: "addr-b".into(),
                state: ContractState::Active,
                terms: serde_json::json!({}),
                created_generation: 0,
                expected_completion: 5,
            },
        );

        orch.absorb_rejections().await;

        // Three strikes abandoned the fiber; the untracked one was ignored.
        assert!(!orch.contracts.contains_key("c-1"));
        let agent = orch.population.get("addr-a").unwrap();
        assert_eq!(agent.meta.failed_contracts, 3);

        // The cursor advanced past everything seen.
        assert_eq!(orch.rejections.next_ordinal, 5);
    }
}
