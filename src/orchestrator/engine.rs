//! Cross-Chain Execution Orchestrator.
//!
//! Owns the in-flight set of [`CrossChainMessage`]s, keyed by
//! `message_id`. Messages for a given Decision submit sequentially
//! unless `parallel_per_source` is set and their source chains differ;
//! state transitions are serialized per message_id via a
//! `parking_lot::Mutex` guarding the whole map — contention is low since
//! a message only changes state a handful of times over its lifetime.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::errors::{ChainError, ConsensusError};
use crate::event_bus::{Event, EventBus};
use crate::model::{ChainId, Decision};
use crate::orchestrator::bridge::{BridgeAdapter, FeeEstimateRequest, SendRequest};
use crate::orchestrator::message::{CrossChainMessage, MessageState};

/// Aggregated outcome of driving one Decision's messages to completion.
#[derive(Debug, Clone)]
pub struct RebalanceOutcome {
    pub message_ids: Vec<String>,
    /// True if every message reached `Submitted` (not `FeeEstimateFailed`
    /// or `SubmissionFailed`). Submission success, not settlement —
    /// `Finalized` is only reached later, via `on_destination_event`.
    pub all_submitted: bool,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    bridge: Arc<dyn BridgeAdapter>,
    event_bus: Arc<EventBus>,
    messages: Mutex<HashMap<String, CrossChainMessage>>,
    /// Source chains with a Decision currently in flight. This
    /// deployment manages a single portfolio, so the source chain alone
    /// already identifies the contended position.
    locked_sources: Mutex<HashSet<ChainId>>,
    fee_variance_accum: AtomicU64,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, bridge: Arc<dyn BridgeAdapter>, event_bus: Arc<EventBus>) -> Self {
        Self {
            config,
            bridge,
            event_bus,
            messages: Mutex::new(HashMap::new()),
            locked_sources: Mutex::new(HashSet::new()),
            fee_variance_accum: AtomicU64::new(0),
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.messages.lock().values().filter(|m| !m.state.is_terminal()).count()
    }

    pub fn get_message(&self, message_id: &str) -> Option<CrossChainMessage> {
        self.messages.lock().get(message_id).cloned()
    }

    /// Converts a `rebalance`/`emergency_exit` Decision into one
    /// CrossChainMessage per step and drives each through FeeEstimated
    /// and Submitted. Rejects with `ConsensusError` if any step's source
    /// chain already has a Decision in flight.
    pub async fn submit_decision(&self, decision: &Decision) -> Result<RebalanceOutcome, ConsensusError> {
        let source_chains: Vec<ChainId> = decision.steps.iter().map(|s| s.from_chain).collect();
        {
            let mut locked = self.locked_sources.lock();
            for chain in &source_chains {
                if locked.contains(chain) {
                    return Err(ConsensusError(format!(
                        "source chain {chain} already has a rebalance in flight"
                    )));
                }
            }
            locked.extend(source_chains.iter().copied());
        }

        let now = Utc::now();
        let mut ids = Vec::with_capacity(decision.steps.len());
        for step in &decision.steps {
            let message_id = Uuid::new_v4().to_string();
            let msg = CrossChainMessage::new(
                message_id.clone(),
                step.from_chain,
                step.to_chain,
                step.token.clone(),
                step.amount_smallest_unit,
                step.target_pool_address.clone(),
                "",
                200_000,
                now,
            );
            self.messages.lock().insert(message_id.clone(), msg);
            ids.push(message_id);
        }

        // Different source chains never contend for the same lock, so
        // driving them concurrently is safe whenever the config allows it;
        // same-source steps (shouldn't happen, since the lock above already
        // rejects overlapping sources within one Decision) fall back to
        // sequential driving either way.
        if self.config.parallel_per_source {
            let futures = ids.iter().map(|id| self.drive_to_submitted(id));
            futures_util::future::join_all(futures).await;
        } else {
            for id in &ids {
                self.drive_to_submitted(id).await;
            }
        }

        for chain in &source_chains {
            self.locked_sources.lock().remove(chain);
        }

        let all_submitted = ids.iter().all(|id| {
            self.get_message(id)
                .map(|m| m.state != MessageState::FeeEstimateFailed && m.state != MessageState::SubmissionFailed)
                .unwrap_or(false)
        });

        Ok(RebalanceOutcome {
            message_ids: ids,
            all_submitted,
        })
    }

    /// Drives one message from `Created` through `Submitted`, retrying
    /// only the two retriable terminal-failure-prone steps: fee
    /// estimation and submission.
    async fn drive_to_submitted(&self, message_id: &str) {
        let (source_chain, dest_chain, amount, target_pool, token, gas_limit) = {
            let messages = self.messages.lock();
            let m = &messages[message_id];
            (m.source_chain, m.dest_chain, m.amount, m.target_pool.clone(), m.token.clone(), m.gas_limit)
        };

        let fee = match self
            .retry(self.config.max_fee_estimate_retries, |attempt| {
                let req = FeeEstimateRequest {
                    source_chain,
                    dest_chain,
                    amount,
                    target_protocol: String::new(),
                    gas_limit,
                };
                let bridge = self.bridge.clone();
                let _ = attempt;
                async move { bridge.estimate_fee(&req).await }
            })
            .await
        {
            Ok(fee) => fee,
            Err(_) => {
                self.set_state(message_id, MessageState::FeeEstimateFailed);
                return;
            }
        };

        {
            let mut messages = self.messages.lock();
            if let Some(m) = messages.get_mut(message_id) {
                m.fee_native = fee;
                let _ = m.transition(MessageState::FeeEstimated, Utc::now());
            }
        }
        self.publish_state(message_id);

        let send_result = self
            .retry(self.config.max_submit_retries, |_| {
                let req = SendRequest {
                    source_chain,
                    dest_chain,
                    token: token.clone(),
                    amount,
                    target_pool: target_pool.clone(),
                    fee_native: fee,
                    gas_limit,
                };
                let bridge = self.bridge.clone();
                async move { bridge.send_cross_chain(&req).await }
            })
            .await;

        match send_result {
            Ok(_bridge_message_id) => {
                let mut messages = self.messages.lock();
                if let Some(m) = messages.get_mut(message_id) {
                    m.submitted_at = Some(Utc::now());
                    let _ = m.transition(MessageState::Submitted, Utc::now());
                }
                drop(messages);
                self.publish_state(message_id);
            }
            Err(_) => {
                self.set_state(message_id, MessageState::SubmissionFailed);
            }
        }
    }

    async fn retry<F, Fut>(&self, max_attempts: u32, mut op: F) -> Result<String, ChainError>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<String, ChainError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) if e.retriable && attempt < max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> std::time::Duration {
        let base = self.config.retry_backoff_base_ms;
        let exp = base.saturating_mul(1u64 << attempt.min(16));
        std::time::Duration::from_millis(exp.min(30_000))
    }

    fn set_state(&self, message_id: &str, to: MessageState) {
        {
            let mut messages = self.messages.lock();
            if let Some(m) = messages.get_mut(message_id) {
                let _ = m.transition(to, Utc::now());
            }
        }
        self.publish_state(message_id);
    }

    fn publish_state(&self, message_id: &str) {
        if let Some(msg) = self.get_message(message_id) {
            self.event_bus.publish(Event::from(&msg));
        }
    }

    /// Applies an observed source-chain confirmation event, advancing
    /// `Submitted -> SourceConfirmed` and then, once confirmation depth
    /// is satisfied, automatically to `InFlight`.
    pub fn on_source_confirmed(&self, message_id: &str, confirmations: u32) {
        {
            let mut messages = self.messages.lock();
            if let Some(m) = messages.get_mut(message_id) {
                if m.state == MessageState::Submitted {
                    let _ = m.transition(MessageState::SourceConfirmed, Utc::now());
                }
                if m.state == MessageState::SourceConfirmed && confirmations >= self.config.confirmation_depth {
                    let _ = m.transition(MessageState::InFlight, Utc::now());
                }
            }
        }
        self.publish_state(message_id);
    }

    /// Applies an observed destination-chain delivery event.
    /// `success = false` reports a destination-side revert.
    pub fn on_destination_event(&self, message_id: &str, success: bool) {
        {
            let mut messages = self.messages.lock();
            if let Some(m) = messages.get_mut(message_id) {
                if m.state == MessageState::InFlight {
                    let _ = m.transition(MessageState::DestinationDelivered, Utc::now());
                }
                if m.state == MessageState::DestinationDelivered {
                    if success {
                        let _ = m.transition(MessageState::Finalized, Utc::now());
                    } else {
                        let _ = m.transition(MessageState::DestinationReverted, Utc::now());
                    }
                }
            }
        }
        self.publish_state(message_id);
    }

    /// Sweeps in-flight messages for timeouts: `Submitted` past
    /// `source_confirm_timeout_secs` becomes `SourceReverted`; `InFlight`
    /// past `delivery_timeout_secs` becomes `DeliveryTimeout`. Called
    /// periodically by the Supervisor.
    pub fn sweep_timeouts(&self) {
        let now = Utc::now();
        let source_timeout = chrono::Duration::seconds(self.config.source_confirm_timeout_secs as i64);
        let delivery_timeout = chrono::Duration::seconds(self.config.delivery_timeout_secs as i64);

        let expired: Vec<(String, MessageState)> = {
            let messages = self.messages.lock();
            messages
                .values()
                .filter_map(|m| {
                    let age = now.signed_duration_since(m.last_event_at);
                    match m.state {
                        MessageState::Submitted if age >= source_timeout => {
                            Some((m.message_id.clone(), MessageState::SourceReverted))
                        }
                        MessageState::InFlight if age >= delivery_timeout => {
                            Some((m.message_id.clone(), MessageState::DeliveryTimeout))
                        }
                        _ => None,
                    }
                })
                .collect()
        };

        for (id, to) in expired {
            self.set_state(&id, to);
        }
    }

    /// Reconciles quoted vs realized fee for a finalized message and
    /// accumulates the absolute variance into the `feeVariance` metric.
    pub fn record_fee_variance(&self, message_id: &str, realized_fee_native: u128) {
        let quoted = self.get_message(message_id).map(|m| m.fee_native).unwrap_or(0);
        let variance = (quoted as i128 - realized_fee_native as i128).unsigned_abs() as u64;
        self.fee_variance_accum.fetch_add(variance, Ordering::Relaxed);
        metrics::histogram!("rebalancer_fee_variance_native").record(variance as f64);
    }

    pub fn total_fee_variance(&self) -> u64 {
        self.fee_variance_accum.load(Ordering::Relaxed)
    }
}
