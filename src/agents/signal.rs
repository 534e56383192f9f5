//! Signal Agent.
//!
//! Ingests a [`MarketSnapshot`] (plus gas observations) and produces a
//! finite sequence of [`Signal`]s, re-derivable from its inputs: running
//! the same snapshot through `detect_all` twice yields the same signals.

use chrono::Utc;
use std::collections::HashMap;

use crate::chain_registry::ChainRegistry;
use crate::config::SignalConfig;
use crate::model::{ChainId, MarketSnapshot, Protocol, Signal, SignalKind};

pub struct SignalAgent {
    config: SignalConfig,
}

impl SignalAgent {
    pub fn new(config: SignalConfig) -> Self {
        Self { config }
    }

    /// Runs all detection rules in spec order over `snapshot`, folding in
    /// `gas_prices` (current gas price per chain) and any
    /// `significant_price_change` events observed this cycle.
    pub fn detect_all(
        &self,
        snapshot: &MarketSnapshot,
        gas_prices: &HashMap<ChainId, u64>,
        chain_registry: &ChainRegistry,
        significant_price_changes: &[(String, i32)],
    ) -> Vec<Signal> {
        let mut signals = Vec::with_capacity(snapshot.pools.len());

        self.detect_apr_opportunities(snapshot, &mut signals);
        self.detect_capacity_risk(snapshot, &mut signals);
        let gas_blocked_chains = self.detect_gas_alerts(gas_prices, chain_registry, &mut signals);
        self.detect_price_change_info(significant_price_changes, &mut signals);

        // Rule 3 suppresses opportunities on chains whose gas exceeds the
        // ceiling — drop any already-emitted opportunity signal touching
        // a blocked chain rather than re-ordering the rule pipeline.
        signals.retain(|s| {
            s.kind != SignalKind::Opportunity || !gas_blocked_chains.contains(&s.chain)
        });

        signals
    }

    /// Rule 1: same-token pools across chains/protocols with an APR delta
    /// at or above `apr_delta_threshold_bps` become `opportunity` signals.
    fn detect_apr_opportunities(&self, snapshot: &MarketSnapshot, out: &mut Vec<Signal>) {
        let pools: Vec<_> = snapshot.pools.values().collect();
        for (i, a) in pools.iter().enumerate() {
            for b in pools.iter().skip(i + 1) {
                if a.key.token != b.key.token {
                    continue;
                }
                if a.key.chain_id == b.key.chain_id && a.key.protocol == b.key.protocol {
                    continue;
                }
                let delta = (a.apr_bps - b.apr_bps).abs();
                if delta >= self.config.apr_delta_threshold_bps {
                    let (lower, higher) = if a.apr_bps <= b.apr_bps { (a, b) } else { (b, a) };
                    out.push(Signal {
                        kind: SignalKind::Opportunity,
                        chain: lower.key.chain_id,
                        to_chain: higher.key.chain_id,
                        protocol: lower.key.protocol.clone(),
                        token: lower.key.token.clone(),
                        magnitude_bps: delta,
                        confidence_ppm: 1_000_000,
                        message: format!(
                            "apr delta {delta}bps on {} between {:?}@{} and {:?}@{}",
                            lower.key.token, lower.key.protocol, lower.key.chain_id, higher.key.protocol, higher.key.chain_id
                        ),
                        created_at: Utc::now(),
                    });
                }
            }
        }
    }

    /// Rule 2: pool utilization >= configured alert threshold is a
    /// capacity-risk `alert`.
    fn detect_capacity_risk(&self, snapshot: &MarketSnapshot, out: &mut Vec<Signal>) {
        for pool in snapshot.pools.values() {
            if pool.utilization_bps >= self.config.utilization_alert_bps {
                out.push(Signal {
                    kind: SignalKind::Alert,
                    chain: pool.key.chain_id,
                    to_chain: pool.key.chain_id,
                    protocol: pool.key.protocol.clone(),
                    token: String::new(),
                    magnitude_bps: pool.utilization_bps as i32,
                    confidence_ppm: 1_000_000,
                    message: format!(
                        "pool {} utilization {}bps at/above capacity threshold",
                        pool.key.pool_address, pool.utilization_bps
                    ),
                    created_at: Utc::now(),
                });
            }
        }
    }

    /// Rule 3: gas above the registry's configured ceiling for a chain is
    /// an `alert`; returns the set of chains whose opportunities must be
    /// suppressed until gas recovers.
    fn detect_gas_alerts(
        &self,
        gas_prices: &HashMap<ChainId, u64>,
        chain_registry: &ChainRegistry,
        out: &mut Vec<Signal>,
    ) -> std::collections::HashSet<ChainId> {
        let mut blocked = std::collections::HashSet::new();
        for (&chain_id, &gas_price) in gas_prices {
            if let Some(ceiling) = chain_registry.gas_ceiling(chain_id) {
                if gas_price > ceiling {
                    blocked.insert(chain_id);
                    out.push(Signal {
                        kind: SignalKind::Alert,
                        chain: chain_id,
                        to_chain: chain_id,
                        protocol: Protocol::Other("*".to_string()),
                        token: String::new(),
                        magnitude_bps: 0,
                        confidence_ppm: 1_000_000,
                        message: format!(
                            "gas price {gas_price} exceeds ceiling {ceiling} on chain {chain_id}"
                        ),
                        created_at: Utc::now(),
                    });
                }
            }
        }
        blocked
    }

    /// Rule 4: significant price changes become `info` signals tagged with
    /// the chain implied by the pair. We don't have a chain mapping for
    /// bare pairs here, so chain 0 is used as a sentinel meaning
    /// "cross-chain/unspecified" — downstream consumers key off `kind`
    /// and `message`, not `chain`, for info signals.
    fn detect_price_change_info(&self, changes: &[(String, i32)], out: &mut Vec<Signal>) {
        for (pair, delta_bps) in changes {
            out.push(Signal {
                kind: SignalKind::Info,
                chain: 0,
                to_chain: 0,
                protocol: Protocol::Other("*".to_string()),
                token: String::new(),
                magnitude_bps: *delta_bps,
                confidence_ppm: 1_000_000,
                message: format!("significant price change on {pair}: {delta_bps}bps"),
                created_at: Utc::now(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_registry::ChainEntry;
    use crate::model::{PoolKey, PoolSnapshot};
    use std::collections::BTreeMap;

    fn registry() -> ChainRegistry {
        ChainRegistry::build(vec![
            ChainEntry {
                chain_id: 1,
                name: "A".into(),
                chain_selector: 10,
                router_address: "0x".into(),
                link_token_address: "0x".into(),
                explorer_url: "https://example.com".into(),
                native_decimals: 18,
                gas_ceiling: 100,
            },
            ChainEntry {
                chain_id: 2,
                name: "B".into(),
                chain_selector: 20,
                router_address: "0x".into(),
                link_token_address: "0x".into(),
                explorer_url: "https://example.com".into(),
                native_decimals: 18,
                gas_ceiling: 100,
            },
        ])
        .unwrap()
    }

    fn pool(chain: ChainId, apr_bps: i32, util_bps: u32) -> (PoolKey, PoolSnapshot) {
        let key = PoolKey::new(chain, Protocol::Aave, "0xpool", "usdc");
        (
            key.clone(),
            PoolSnapshot::new(key, apr_bps, 1_000_000, util_bps, Utc::now()),
        )
    }

    #[test]
    fn emits_opportunity_above_threshold() {
        let agent = SignalAgent::new(SignalConfig::default());
        let mut pools = BTreeMap::new();
        let (k1, p1) = pool(1, 650, 50);
        let (k2, p2) = pool(2, 890, 50);
        pools.insert(k1, p1);
        pools.insert(k2, p2);
        let snapshot = MarketSnapshot::new(pools, BTreeMap::new(), Utc::now());

        let signals = agent.detect_all(&snapshot, &HashMap::new(), &registry(), &[]);
        let opportunity = signals
            .iter()
            .find(|s| s.kind == SignalKind::Opportunity && s.magnitude_bps == 240)
            .expect("opportunity signal");
        assert_eq!(opportunity.token, "usdc");
        assert_eq!(opportunity.chain, 1);
        assert_eq!(opportunity.to_chain, 2);
    }

    #[test]
    fn different_tokens_never_pair_into_an_opportunity() {
        let agent = SignalAgent::new(SignalConfig::default());
        let mut pools = BTreeMap::new();
        let (k1, p1) = pool(1, 650, 50);
        let key2 = PoolKey::new(2, Protocol::Aave, "0xpool", "dai");
        let p2 = PoolSnapshot::new(key2.clone(), 890, 1_000_000, 50, Utc::now());
        pools.insert(k1, p1);
        pools.insert(key2, p2);
        let snapshot = MarketSnapshot::new(pools, BTreeMap::new(), Utc::now());

        let signals = agent.detect_all(&snapshot, &HashMap::new(), &registry(), &[]);
        assert!(!signals.iter().any(|s| s.kind == SignalKind::Opportunity));
    }

    #[test]
    fn no_opportunity_below_threshold() {
        let agent = SignalAgent::new(SignalConfig::default());
        let mut pools = BTreeMap::new();
        let (k1, p1) = pool(1, 650, 50);
        let (k2, p2) = pool(2, 700, 50);
        pools.insert(k1, p1);
        pools.insert(k2, p2);
        let snapshot = MarketSnapshot::new(pools, BTreeMap::new(), Utc::now());

        let signals = agent.detect_all(&snapshot, &HashMap::new(), &registry(), &[]);
        assert!(!signals.iter().any(|s| s.kind == SignalKind::Opportunity));
    }

    #[test]
    fn gas_ceiling_suppresses_opportunity_on_blocked_chain() {
        let agent = SignalAgent::new(SignalConfig::default());
        let mut pools = BTreeMap::new();
        let (k1, p1) = pool(1, 650, 50);
        let (k2, p2) = pool(2, 890, 50);
        pools.insert(k1, p1);
        pools.insert(k2, p2);
        let snapshot = MarketSnapshot::new(pools, BTreeMap::new(), Utc::now());

        let mut gas = HashMap::new();
        gas.insert(1u64, 1000u64); // exceeds chain 1's ceiling of 100
        let signals = agent.detect_all(&snapshot, &gas, &registry(), &[]);

        assert!(!signals
            .iter()
            .any(|s| s.kind == SignalKind::Opportunity && s.chain == 1));
        assert!(signals.iter().any(|s| s.kind == SignalKind::Alert));
    }

    #[test]
    fn utilization_above_threshold_emits_alert() {
        let agent = SignalAgent::new(SignalConfig::default());
        let mut pools = BTreeMap::new();
        let (k, p) = pool(1, 500, 9_500);
        pools.insert(k, p);
        let snapshot = MarketSnapshot::new(pools, BTreeMap::new(), Utc::now());

        let signals = agent.detect_all(&snapshot, &HashMap::new(), &registry(), &[]);
        assert!(signals.iter().any(|s| s.kind == SignalKind::Alert));
    }
}
