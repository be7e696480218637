//! Deterministic market settlement math.
//!
//! Settlement is computed on-chain by the finalize/refund effects; this
//! module reproduces it exactly so drivers can pre-compute expected claims
//! and tests can assert payouts without a metagraph.

use loom_types::agent::{Market, MarketSettlement, MarketType};
use std::collections::BTreeMap;

/// Fee retained from the losing pool at finalization, in basis points.
pub const PAYOUT_FEE_BPS: u64 = 200; // 2%

/// Computes the settlement for a finalized or refunded market.
///
/// * Prediction: winners split the losing pool (minus the fee) in proportion
///   to their stake, and recover their own stake. Losers settle to zero.
///   With no winning stake, every commitment is refunded in full.
/// * Auction: the highest committer wins and pays; everyone else is
///   refunded in full.
/// * Crowdfund: at or above threshold the creator collects the pool;
///   otherwise full refunds.
/// * Group buy: at or above threshold all commitments settle (goods in lieu
///   of payout); otherwise full refunds.
///
/// `outcome` is required for prediction markets and ignored elsewhere.
pub fn settle_market(market: &Market, outcome: Option<&str>) -> MarketSettlement {
    match market.market_type {
        MarketType::Prediction => settle_prediction(market, outcome.unwrap_or_default()),
        MarketType::Auction => settle_auction(market),
        MarketType::Crowdfund => settle_threshold(market, true),
        MarketType::GroupBuy => settle_threshold(market, false),
    }
}

/// The amount the given address may claim under a settlement.
pub fn claim_amount(settlement: &MarketSettlement, address: &str) -> u64 {
    settlement.payouts.get(address).copied().unwrap_or(0)
}

fn settle_prediction(market: &Market, outcome: &str) -> MarketSettlement {
    let winning_pool: u64 = market
        .commitments
        .values()
        .filter(|c| c.outcome() == Some(outcome))
        .map(|c| c.amount)
        .sum();
    let losing_pool = market.total_committed.saturating_sub(winning_pool);

    if winning_pool == 0 {
        // Nobody backed the resolved outcome: full refunds, no fee.
        return full_refund(market, outcome);
    }

    let fee = losing_pool * PAYOUT_FEE_BPS / 10_000;
    let distributable = losing_pool - fee;

    let payouts: BTreeMap<String, u64> = market
        .commitments
        .iter()
        .filter(|(_, c)| c.outcome() == Some(outcome))
        .map(|(addr, c)| {
            let share = (c.amount as u128 * distributable as u128 / winning_pool as u128) as u64;
            (addr.clone(), c.amount + share)
        })
        .collect();

    MarketSettlement {
        outcome: outcome.to_string(),
        fee,
        payouts,
    }
}

fn settle_auction(market: &Market) -> MarketSettlement {
    // Highest commitment wins; ties break on address order for determinism.
    let winner = market
        .commitments
        .iter()
        .max_by(|(a_addr, a), (b_addr, b)| a.amount.cmp(&b.amount).then(b_addr.cmp(a_addr)))
        .map(|(addr, _)| addr.clone());

    let payouts: BTreeMap<String, u64> = market
        .commitments
        .iter()
        .map(|(addr, c)| {
            let refund = if Some(addr) == winner.as_ref() { 0 } else { c.amount };
            (addr.clone(), refund)
        })
        .collect();

    MarketSettlement {
        outcome: winner.unwrap_or_default(),
        fee: 0,
        payouts,
    }
}

fn settle_threshold(market: &Market, pay_creator: bool) -> MarketSettlement {
    let threshold = market.threshold.unwrap_or(0);
    if market.total_committed < threshold {
        return full_refund(market, "REFUNDED");
    }
    let mut payouts = BTreeMap::new();
    if pay_creator {
        payouts.insert(market.creator.clone(), market.total_committed);
    }
    MarketSettlement {
        outcome: "FUNDED".to_string(),
        fee: 0,
        payouts,
    }
}

fn full_refund(market: &Market, outcome: &str) -> MarketSettlement {
    MarketSettlement {
        outcome: outcome.to_string(),
        fee: 0,
        payouts: market
            .commitments
            .iter()
            .map(|(addr, c)| (addr.clone(), c.amount))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_types::agent::{MarketCommitment, MarketState};
    use serde_json::json;
    use std::collections::{BTreeMap, BTreeSet};

    fn market_with(market_type: MarketType, commitments: &[(&str, u64, &str)]) -> Market {
        let commitments: BTreeMap<String, MarketCommitment> = commitments
            .iter()
            .map(|(addr, amount, outcome)| {
                (
                    (*addr).to_string(),
                    MarketCommitment {
                        amount: *amount,
                        data: json!({ "outcome": outcome }),
                        last_commit_at: 1,
                    },
                )
            })
            .collect();
        let total = commitments.values().map(|c| c.amount).sum();
        Market {
            fiber_id: "m-1".into(),
            market_type,
            creator: "creator".into(),
            oracles: BTreeSet::new(),
            quorum: 1,
            deadline: None,
            threshold: None,
            state: MarketState::Resolving,
            commitments,
            total_committed: total,
            resolutions: vec![],
            claims: BTreeMap::new(),
            final_outcome: None,
            settlement: None,
        }
    }

    #[test]
    fn prediction_winners_split_losing_pool_minus_fee() {
        // Five participants, YES pool = 300, NO pool = 200.
        let market = market_with(
            MarketType::Prediction,
            &[
                ("p1", 100, "YES"),
                ("p2", 200, "YES"),
                ("p3", 50, "NO"),
                ("p4", 100, "NO"),
                ("p5", 50, "NO"),
            ],
        );
        let s = settle_market(&market, Some("YES"));

        // 2% of the 200 losing pool.
        assert_eq!(s.fee, 4);
        let distributable = 196u64;
        assert_eq!(claim_amount(&s, "p1"), 100 + distributable * 100 / 300);
        assert_eq!(claim_amount(&s, "p2"), 200 + distributable * 200 / 300);
        // Losers settle to zero.
        assert_eq!(claim_amount(&s, "p3"), 0);
        assert_eq!(claim_amount(&s, "p4"), 0);
        assert_eq!(claim_amount(&s, "p5"), 0);
        // Payouts never exceed the pot.
        let paid: u64 = s.payouts.values().sum();
        assert!(paid + s.fee <= market.total_committed);
    }

    #[test]
    fn prediction_with_no_winners_refunds_everyone() {
        let market = market_with(MarketType::Prediction, &[("p1", 80, "NO"), ("p2", 20, "NO")]);
        let s = settle_market(&market, Some("YES"));
        assert_eq!(s.fee, 0);
        assert_eq!(claim_amount(&s, "p1"), 80);
        assert_eq!(claim_amount(&s, "p2"), 20);
    }

    #[test]
    fn crowdfund_below_threshold_refunds_in_full() {
        let mut market = market_with(
            MarketType::Crowdfund,
            &[("p1", 70, "-"), ("p2", 50, "-")],
        );
        market.threshold = Some(500);
        assert_eq!(market.total_committed, 120);
        let s = settle_market(&market, None);
        assert_eq!(s.outcome, "REFUNDED");
        assert_eq!(claim_amount(&s, "p1"), 70);
        assert_eq!(claim_amount(&s, "p2"), 50);
    }

    #[test]
    fn crowdfund_at_threshold_pays_the_creator() {
        let mut market = market_with(
            MarketType::Crowdfund,
            &[("p1", 300, "-"), ("p2", 250, "-")],
        );
        market.threshold = Some(500);
        let s = settle_market(&market, None);
        assert_eq!(s.outcome, "FUNDED");
        assert_eq!(claim_amount(&s, "creator"), 550);
        assert_eq!(claim_amount(&s, "p1"), 0);
    }

    #[test]
    fn auction_refunds_everyone_but_the_winner() {
        let market = market_with(
            MarketType::Auction,
            &[("p1", 120, "-"), ("p2", 200, "-"), ("p3", 80, "-")],
        );
        let s = settle_market(&market, None);
        assert_eq!(s.outcome, "p2");
        assert_eq!(claim_amount(&s, "p2"), 0);
        assert_eq!(claim_amount(&s, "p1"), 120);
        assert_eq!(claim_amount(&s, "p3"), 80);
    }
}
