//! Strategy Agent.
//!
//! Turns `opportunity` signals into scored reallocation candidates:
//! source/destination pool pairs, the amount to move, and an expected
//! gain net of the configured slippage allowance and bridge fee
//! estimate. Pipeline shape is detect -> validate/enhance -> rank,
//! generalized from a two-leg trade to an N-way cross-chain
//! reallocation.

use chrono::Utc;

use crate::config::StrategyConfig;
use crate::model::{MarketSnapshot, ReallocationStep, Signal, SignalKind, StrategyScore};

pub struct StrategyAgent {
    config: StrategyConfig,
}

impl StrategyAgent {
    pub fn new(config: StrategyConfig) -> Self {
        Self { config }
    }

    /// Builds and ranks reallocation candidates from this cycle's
    /// `opportunity` signals, using `snapshot` to size the move against
    /// the source pool's observed TVL. Returns the top
    /// `top_k_candidates` scores, highest expected gain first.
    pub fn propose(&self, snapshot: &MarketSnapshot, signals: &[Signal]) -> Vec<StrategyScore> {
        let mut scores: Vec<StrategyScore> = signals
            .iter()
            .filter(|s| s.kind == SignalKind::Opportunity)
            .filter_map(|s| self.score_opportunity(snapshot, s))
            .collect();

        scores.sort_by(|a, b| b.expected_gain_bps.cmp(&a.expected_gain_bps));
        scores.truncate(self.config.top_k_candidates);
        scores
    }

    /// Fee/slippage-adjusted net gain for a single opportunity signal,
    /// expressed in basis points over a reallocation amount rather than
    /// dollars over a two-leg trade.
    fn score_opportunity(&self, snapshot: &MarketSnapshot, signal: &Signal) -> Option<StrategyScore> {
        let source_pool = snapshot
            .pools
            .values()
            .filter(|p| p.key.chain_id == signal.chain && p.key.protocol == signal.protocol && p.key.token == signal.token)
            .max_by_key(|p| p.tvl_smallest_unit)?;

        let dest_pool = snapshot
            .pools
            .values()
            .filter(|p| p.key != source_pool.key && p.key.token == signal.token)
            .max_by_key(|p| p.apr_bps)?;

        let gross_gain_bps = dest_pool.apr_bps - source_pool.apr_bps;
        let cost_bps = self.config.slippage_allowance_bps as i32 + self.config.bridge_fee_bps_estimate as i32;
        let expected_gain_bps = gross_gain_bps - cost_bps;

        if expected_gain_bps <= 0 {
            return None;
        }

        // Move a conservative fraction of source TVL so the reallocation
        // itself doesn't dominate the source pool's liquidity.
        let amount_smallest_unit = source_pool.tvl_smallest_unit / 10;
        if amount_smallest_unit == 0 {
            return None;
        }

        let step = ReallocationStep {
            from_chain: source_pool.key.chain_id,
            to_chain: dest_pool.key.chain_id,
            token: signal.token.clone(),
            amount_smallest_unit,
            target_pool_address: dest_pool.key.pool_address.clone(),
            expected_apy_bps: dest_pool.apr_bps,
        };

        let risk_bps = self.config.slippage_allowance_bps + dest_pool.utilization_bps / 10;

        Some(StrategyScore {
            candidate: vec![step],
            expected_gain_bps,
            risk_bps,
            confidence_ppm: signal.confidence_ppm,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PoolKey, PoolSnapshot, Protocol};
    use std::collections::BTreeMap;

    fn pool(chain: u64, protocol: Protocol, apr_bps: i32, tvl: u128, util_bps: u32) -> (PoolKey, PoolSnapshot) {
        let key = PoolKey::new(chain, protocol, "0xpool", "usdc");
        (key.clone(), PoolSnapshot::new(key, apr_bps, tvl, util_bps, Utc::now()))
    }

    fn signal(chain: u64, protocol: Protocol, magnitude_bps: i32) -> Signal {
        Signal {
            kind: SignalKind::Opportunity,
            chain,
            to_chain: chain + 1,
            protocol,
            token: "usdc".into(),
            magnitude_bps,
            confidence_ppm: 900_000,
            message: "test".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn proposes_candidate_when_gain_exceeds_costs() {
        let agent = StrategyAgent::new(StrategyConfig::default());
        let mut pools = BTreeMap::new();
        let (k1, p1) = pool(1, Protocol::Aave, 300, 10_000_000, 50);
        let (k2, p2) = pool(2, Protocol::Compound, 900, 10_000_000, 50);
        pools.insert(k1, p1);
        pools.insert(k2, p2);
        let snapshot = MarketSnapshot::new(pools, BTreeMap::new(), Utc::now());

        let signals = vec![signal(1, Protocol::Aave, 600)];
        let scores = agent.propose(&snapshot, &signals);
        assert_eq!(scores.len(), 1);
        assert!(scores[0].expected_gain_bps > 0);
        assert_eq!(scores[0].candidate[0].to_chain, 2);
    }

    #[test]
    fn drops_candidate_when_costs_exceed_gain() {
        let mut config = StrategyConfig::default();
        config.slippage_allowance_bps = 10_000;
        let agent = StrategyAgent::new(config);
        let mut pools = BTreeMap::new();
        let (k1, p1) = pool(1, Protocol::Aave, 300, 10_000_000, 50);
        let (k2, p2) = pool(2, Protocol::Compound, 350, 10_000_000, 50);
        pools.insert(k1, p1);
        pools.insert(k2, p2);
        let snapshot = MarketSnapshot::new(pools, BTreeMap::new(), Utc::now());

        let signals = vec![signal(1, Protocol::Aave, 50)];
        let scores = agent.propose(&snapshot, &signals);
        assert!(scores.is_empty());
    }

    #[test]
    fn ranks_top_k_by_expected_gain() {
        let mut config = StrategyConfig::default();
        config.top_k_candidates = 1;
        let agent = StrategyAgent::new(config);
        let mut pools = BTreeMap::new();
        let (k1, p1) = pool(1, Protocol::Aave, 100, 10_000_000, 50);
        let (k2, p2) = pool(2, Protocol::Compound, 900, 10_000_000, 50);
        let (k3, p3) = pool(3, Protocol::Curve, 1200, 10_000_000, 50);
        pools.insert(k1, p1);
        pools.insert(k2, p2);
        pools.insert(k3, p3);
        let snapshot = MarketSnapshot::new(pools, BTreeMap::new(), Utc::now());

        let signals = vec![signal(1, Protocol::Aave, 200), signal(2, Protocol::Compound, 300)];
        let scores = agent.propose(&snapshot, &signals);
        assert_eq!(scores.len(), 1);
    }
}
