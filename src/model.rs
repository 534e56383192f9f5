//! Core domain model for the rebalance control plane.
//!
//! Monetary amounts are integers in the smallest unit of the relevant
//! token; APRs and utilizations are integers in basis points. Nothing here
//! touches floats on the hot path — floats only show up in agent scoring
//! further downstream (confidence/risk math).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unsigned 64-bit chain identifier (e.g. an EVM chain id).
pub type ChainId = u64;

/// Opaque bridge-side selector for a chain. One-to-one with `ChainId` via
/// the chain registry.
pub type ChainSelector = u64;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Aave,
    Compound,
    Uniswap,
    Curve,
    Other(String),
}

impl Protocol {
    pub fn as_str(&self) -> &str {
        match self {
            Protocol::Aave => "aave",
            Protocol::Compound => "compound",
            Protocol::Uniswap => "uniswap",
            Protocol::Curve => "curve",
            Protocol::Other(s) => s.as_str(),
        }
    }
}

/// (chain, protocol, pool address) — unique key for a lending/AMM pool.
/// `token` carries the underlying asset's symbol (e.g. "USDC") so pools
/// holding different assets are never mistaken for the same reallocation
/// target; it participates in ordering so `MarketSnapshot::pools`' key
/// order stays deterministic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PoolKey {
    pub chain_id: ChainId,
    pub protocol: Protocol,
    pub pool_address: String,
    pub token: String,
}

impl PoolKey {
    pub fn new(chain_id: ChainId, protocol: Protocol, pool_address: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            chain_id,
            protocol,
            pool_address: pool_address.into(),
            token: token.into(),
        }
    }
}

/// A single observed lending/AMM pool state.
///
/// Invariant: `0 <= utilization_bps <= 10_000`. `apr_bps` may exceed
/// 10_000 but must fit a signed 32-bit integer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub key: PoolKey,
    pub apr_bps: i32,
    pub tvl_smallest_unit: u128,
    pub utilization_bps: u32,
    pub observed_at: DateTime<Utc>,
}

impl PoolSnapshot {
    pub fn new(
        key: PoolKey,
        apr_bps: i32,
        tvl_smallest_unit: u128,
        utilization_bps: u32,
        observed_at: DateTime<Utc>,
    ) -> Self {
        debug_assert!(utilization_bps <= 10_000);
        Self {
            key,
            apr_bps,
            tvl_smallest_unit,
            utilization_bps: utilization_bps.min(10_000),
            observed_at,
        }
    }
}

/// A single price observation for a trading pair.
///
/// Invariant: `confidence_ppm in [0, 1_000_000]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    pub pair: String,
    pub price_e18: u128,
    pub confidence_ppm: u32,
    pub source: String,
    pub observed_at: DateTime<Utc>,
    pub latency_ms: u32,
}

impl PriceTick {
    pub fn confidence_ppm_clamped(confidence_ppm: u32) -> u32 {
        confidence_ppm.min(1_000_000)
    }
}

/// An immutable, timestamped view of the market at one instant.
///
/// A new snapshot supersedes the old one atomically (see
/// [`crate::aggregator::MarketDataAggregator`], which swaps an `ArcSwap`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub pools: BTreeMap<PoolKey, PoolSnapshot>,
    pub prices: BTreeMap<String, PriceTick>,
    pub taken_at: Option<DateTime<Utc>>,
}

impl MarketSnapshot {
    pub fn new(
        pools: BTreeMap<PoolKey, PoolSnapshot>,
        prices: BTreeMap<String, PriceTick>,
        taken_at: DateTime<Utc>,
    ) -> Self {
        Self {
            pools,
            prices,
            taken_at: Some(taken_at),
        }
    }

    /// Canonical encoding used to test idempotence of snapshot
    /// construction: two snapshots built from the same inputs must
    /// serialize identically. `BTreeMap` already gives us deterministic
    /// key order.
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(self).expect("MarketSnapshot serialization is infallible")
    }

    pub fn pools_for_token_symbol<'a>(
        &'a self,
        protocol_token_filter: impl Fn(&PoolKey) -> bool + 'a,
    ) -> impl Iterator<Item = &'a PoolSnapshot> + 'a {
        self.pools
            .iter()
            .filter(move |(k, _)| protocol_token_filter(k))
            .map(|(_, v)| v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Opportunity,
    Alert,
    Info,
}

/// `chain`/`to_chain`/`token` are only meaningful for `opportunity`
/// signals, where they identify the source chain, destination chain, and
/// shared token of the APR gap that produced the signal — the Voting
/// Coordinator matches a candidate's `(from_chain, to_chain, token)`
/// against these to compute signal support. Other kinds leave `to_chain`
/// equal to `chain` and `token` empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub kind: SignalKind,
    pub chain: ChainId,
    pub to_chain: ChainId,
    pub protocol: Protocol,
    pub token: String,
    pub magnitude_bps: i32,
    pub confidence_ppm: u32,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReallocationStep {
    pub from_chain: ChainId,
    pub to_chain: ChainId,
    pub token: String,
    pub amount_smallest_unit: u128,
    pub target_pool_address: String,
    pub expected_apy_bps: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyScore {
    pub candidate: Vec<ReallocationStep>,
    pub expected_gain_bps: i32,
    pub risk_bps: u32,
    pub confidence_ppm: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Hold,
    Rebalance,
    EmergencyExit,
}

/// `id` is a stable handle for the `explain` CLI command and the history
/// store's by-id lookup; it has no bearing on decision logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub action: DecisionAction,
    pub steps: Vec<ReallocationStep>,
    pub confidence_ppm: u32,
    pub consensus_ppm: u32,
    pub reasoning: Vec<String>,
    pub reached_at: DateTime<Utc>,
}

impl Decision {
    /// Action-step consistency invariant: `rebalance` and
    /// `emergency_exit` both carry non-empty steps; `hold` never does.
    pub fn is_consistent(&self) -> bool {
        match self.action {
            DecisionAction::Hold => self.steps.is_empty(),
            DecisionAction::Rebalance | DecisionAction::EmergencyExit => !self.steps.is_empty(),
        }
    }

    pub fn hold(reasoning: Vec<String>, reached_at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            action: DecisionAction::Hold,
            steps: Vec::new(),
            confidence_ppm: 0,
            consensus_ppm: 0,
            reasoning,
            reached_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpkeepConfig {
    pub id: String,
    pub target_chain: ChainId,
    pub target_contract: String,
    pub check_data: Vec<u8>,
    pub gas_limit: u64,
    pub min_confidence_ppm: u32,
    pub min_consensus_ppm: u32,
    pub active: bool,
}
