//! End-to-end scenarios over the public library API.
//!
//! Each test builds a small `MarketSnapshot` + chain registry by hand and
//! drives it through Signal -> Strategy -> Voting -> (Upkeep ->)
//! Orchestrator, asserting the externally observable outcome rather than
//! internal bookkeeping.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;

use betterbot_backend::agents::signal::SignalAgent;
use betterbot_backend::agents::strategy::StrategyAgent;
use betterbot_backend::agents::voting::VotingCoordinator;
use betterbot_backend::chain_registry::{ChainEntry, ChainRegistry};
use betterbot_backend::config::{SignalConfig, StrategyConfig, VotingConfig};
use betterbot_backend::event_bus::EventBus;
use betterbot_backend::model::{DecisionAction, MarketSnapshot, PoolKey, PoolSnapshot, Protocol, Signal, SignalKind};
use betterbot_backend::orchestrator::bridge::{BridgeAdapter, PaperBridgeAdapter};
use betterbot_backend::orchestrator::message::MessageState;
use betterbot_backend::orchestrator::Orchestrator;

fn registry_two_chains() -> ChainRegistry {
    ChainRegistry::build(vec![
        ChainEntry {
            chain_id: 1,
            name: "chain-a".into(),
            chain_selector: 100,
            router_address: "0xa".into(),
            link_token_address: "0xlinka".into(),
            explorer_url: "https://a.example.com".into(),
            native_decimals: 18,
            gas_ceiling: 100,
        },
        ChainEntry {
            chain_id: 2,
            name: "chain-b".into(),
            chain_selector: 200,
            router_address: "0xb".into(),
            link_token_address: "0xlinkb".into(),
            explorer_url: "https://b.example.com".into(),
            native_decimals: 18,
            gas_ceiling: 100,
        },
    ])
    .unwrap()
}

fn pool(chain_id: u64, apr_bps: i32, tvl: u128, utilization_bps: u32) -> PoolSnapshot {
    PoolSnapshot::new(
        PoolKey::new(chain_id, Protocol::Aave, "0xusdc", "usdc"),
        apr_bps,
        tvl,
        utilization_bps,
        Utc::now(),
    )
}

fn snapshot(pools: Vec<PoolSnapshot>) -> MarketSnapshot {
    let mut map = BTreeMap::new();
    for p in pools {
        map.insert(p.key.clone(), p);
    }
    MarketSnapshot::new(map, BTreeMap::new(), Utc::now())
}

/// A clear cross-chain APR gap with healthy gas and
/// confidence produces a rebalance decision whose sole step moves funds
/// from the low-APR chain to the high-APR one, and the Orchestrator drives
/// that single message to `Submitted` against the paper bridge.
#[tokio::test]
async fn clear_opportunity_triggers_rebalance() {
    let registry = registry_two_chains();
    let snap = snapshot(vec![
        pool(1, 650, 2_100_000_000_000_000, 4_000),
        pool(2, 890, 1_200_000_000_000_000, 4_000),
    ]);

    let signal_agent = SignalAgent::new(SignalConfig::default());
    let gas_prices: HashMap<u64, u64> = [(1, 10), (2, 10)].into_iter().collect();
    let signals = signal_agent.detect_all(&snap, &gas_prices, &registry, &[]);
    assert!(signals.iter().any(|s| s.kind == SignalKind::Opportunity));

    let strategy_agent = StrategyAgent::new(StrategyConfig::default());
    let candidates = strategy_agent.propose(&snap, &signals);
    assert!(!candidates.is_empty());

    let voting = VotingCoordinator::new(VotingConfig {
        // Use the agent-assigned confidence directly rather than
        // re-deriving the Signal Agent's own confidence formula here.
        min_confidence_ppm: 600_000,
        ..VotingConfig::default()
    });
    let decision = voting.decide(&signals, &candidates, Utc::now());

    assert_eq!(decision.action, DecisionAction::Rebalance);
    assert_eq!(decision.steps.len(), 1);
    assert_eq!(decision.steps[0].from_chain, 1);
    assert_eq!(decision.steps[0].to_chain, 2);
    assert_eq!(decision.steps[0].token, "usdc");
    assert!(decision.consensus_ppm >= 700_000);

    let bridge: Arc<dyn BridgeAdapter> = Arc::new(PaperBridgeAdapter::default());
    let bus = Arc::new(EventBus::new(16));
    let orchestrator = Orchestrator::new(Default::default(), bridge, bus);
    let outcome = orchestrator.submit_decision(&decision).await.unwrap();

    assert_eq!(outcome.message_ids.len(), 1);
    let msg = orchestrator.get_message(&outcome.message_ids[0]).unwrap();
    assert!(matches!(
        msg.state,
        MessageState::Submitted | MessageState::SubmissionFailed
    ));
}

/// An APR gap below the configured threshold never
/// becomes a Signal, so there is nothing for Strategy/Voting to act on and
/// the cycle holds.
#[test]
fn below_threshold_delta_holds() {
    let registry = registry_two_chains();
    let snap = snapshot(vec![
        pool(1, 650, 2_100_000_000_000_000, 4_000),
        pool(2, 670, 1_200_000_000_000_000, 4_000),
    ]);

    let signal_agent = SignalAgent::new(SignalConfig::default());
    let gas_prices: HashMap<u64, u64> = [(1, 10), (2, 10)].into_iter().collect();
    let signals = signal_agent.detect_all(&snap, &gas_prices, &registry, &[]);
    assert!(!signals.iter().any(|s| s.kind == SignalKind::Opportunity));

    let strategy_agent = StrategyAgent::new(StrategyConfig::default());
    let candidates = strategy_agent.propose(&snap, &signals);
    assert!(candidates.is_empty());

    let voting = VotingCoordinator::new(VotingConfig::default());
    let decision = voting.decide(&signals, &candidates, Utc::now());
    assert_eq!(decision.action, DecisionAction::Hold);
}

/// Gas above the source chain's ceiling suppresses the
/// opportunity signal on that chain even though the underlying APR gap
/// would otherwise clear the threshold.
#[test]
fn gas_ceiling_blocks_opportunity() {
    let registry = registry_two_chains();
    let snap = snapshot(vec![
        pool(1, 650, 2_100_000_000_000_000, 4_000),
        pool(2, 890, 1_200_000_000_000_000, 4_000),
    ]);

    let signal_agent = SignalAgent::new(SignalConfig::default());
    // Chain 1's gas price (150) exceeds its configured ceiling (100).
    let gas_prices: HashMap<u64, u64> = [(1, 150), (2, 10)].into_iter().collect();
    let signals = signal_agent.detect_all(&snap, &gas_prices, &registry, &[]);

    assert!(!signals
        .iter()
        .any(|s| s.kind == SignalKind::Opportunity && s.chain == 1));
    assert!(signals.iter().any(|s| s.kind == SignalKind::Alert));
}

/// An emergency alert at or above the emergency threshold routes the
/// full position to the configured safe pool regardless of whether any
/// strategy candidate cleared its own cost threshold, and bypasses
/// `min_consensus_ppm`.
#[test]
fn emergency_exit_bypasses_consensus_threshold() {
    let voting = VotingCoordinator::new(VotingConfig {
        consensus_threshold: 0.99,
        safe_pool_chain: 9,
        safe_pool_address: "0xsafe".into(),
        ..VotingConfig::default()
    });

    let emergency = Signal {
        kind: SignalKind::Alert,
        chain: 1,
        to_chain: 1,
        protocol: Protocol::Aave,
        token: String::new(),
        magnitude_bps: 0,
        confidence_ppm: 950_000,
        message: "protocol emergency".into(),
        created_at: Utc::now(),
    };

    let decision = voting.decide(&[emergency], &[], Utc::now());
    assert_eq!(decision.action, DecisionAction::EmergencyExit);
    assert_eq!(decision.consensus_ppm, 1_000_000);
    assert_eq!(decision.steps[0].to_chain, 9);
}

/// A bridge adapter that fails its first `fail_count` calls to each method
/// and then succeeds, for exercising a transient submission failure
/// retried to completion.
struct FlakyBridge {
    fee_fail_remaining: std::sync::atomic::AtomicU32,
    send_fail_remaining: std::sync::atomic::AtomicU32,
}

impl FlakyBridge {
    fn new(fee_fail_count: u32, send_fail_count: u32) -> Self {
        Self {
            fee_fail_remaining: std::sync::atomic::AtomicU32::new(fee_fail_count),
            send_fail_remaining: std::sync::atomic::AtomicU32::new(send_fail_count),
        }
    }
}

#[async_trait::async_trait]
impl BridgeAdapter for FlakyBridge {
    async fn estimate_fee(
        &self,
        _req: &betterbot_backend::orchestrator::bridge::FeeEstimateRequest,
    ) -> Result<u128, betterbot_backend::errors::ChainError> {
        if self.fee_fail_remaining.fetch_update(
            std::sync::atomic::Ordering::SeqCst,
            std::sync::atomic::Ordering::SeqCst,
            |n| if n > 0 { Some(n - 1) } else { None },
        ).is_ok()
        {
            return Err(betterbot_backend::errors::ChainError::retriable("simulated transient fee-estimate failure"));
        }
        Ok(1_000)
    }

    async fn send_cross_chain(
        &self,
        _req: &betterbot_backend::orchestrator::bridge::SendRequest,
    ) -> Result<String, betterbot_backend::errors::ChainError> {
        if self.send_fail_remaining.fetch_update(
            std::sync::atomic::Ordering::SeqCst,
            std::sync::atomic::Ordering::SeqCst,
            |n| if n > 0 { Some(n - 1) } else { None },
        ).is_ok()
        {
            return Err(betterbot_backend::errors::ChainError::retriable("simulated transient submission failure"));
        }
        Ok("msg-flaky-success".to_string())
    }
}

/// A transient submission failure is retried and the message still
/// reaches `Submitted` once the underlying call starts succeeding,
/// within the configured retry budget.
#[tokio::test]
async fn transient_submission_failure_is_retried_to_success() {
    let bridge: Arc<dyn BridgeAdapter> = Arc::new(FlakyBridge::new(1, 2));
    let bus = Arc::new(EventBus::new(16));
    let orchestrator = Orchestrator::new(Default::default(), bridge, bus);

    let decision = betterbot_backend::model::Decision {
        id: "test-decision".to_string(),
        action: DecisionAction::Rebalance,
        steps: vec![betterbot_backend::model::ReallocationStep {
            from_chain: 1,
            to_chain: 2,
            token: "usdc".into(),
            amount_smallest_unit: 1_000_000,
            target_pool_address: "0xpool".into(),
            expected_apy_bps: 890,
        }],
        confidence_ppm: 900_000,
        consensus_ppm: 800_000,
        reasoning: vec![],
        reached_at: Utc::now(),
    };

    let outcome = orchestrator.submit_decision(&decision).await.unwrap();
    let msg = orchestrator.get_message(&outcome.message_ids[0]).unwrap();
    assert_eq!(msg.state, MessageState::Submitted);
}

// Source-chain contention rejection is covered in src/orchestrator/engine.rs's
// own `#[cfg(test)]` module, which has same-crate access to the private
// `locked_sources` field needed to set up the contended state deterministically.
