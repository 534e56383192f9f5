//! Supervisor.
//!
//! Starts every component in dependency order (Config -> HTTP -> Feed ->
//! Aggregator -> Agents -> Voting -> Upkeep -> Orchestrator), restarts a
//! failed long-lived task with exponential backoff (max 5 attempts)
//! before marking the system degraded, and periodically emits a
//! `healthReport` per component.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::agents::signal::SignalAgent;
use crate::agents::strategy::StrategyAgent;
use crate::agents::voting::VotingCoordinator;
use crate::aggregator::MarketDataAggregator;
use crate::chain_registry::ChainRegistry;
use crate::config::Config;
use crate::event_bus::{ComponentStatus, Event, EventBus, HealthReport};
use crate::feed::price::PriceFeed;
use crate::feed::yield_feed::YieldFeed;
use crate::history::{CheckpointStore, HistoryRecord, HistoryStore};
use crate::model::ChainId;
use crate::orchestrator::Orchestrator;
use crate::upkeep::UpkeepEngine;

const MAX_RESTART_ATTEMPTS: u32 = 5;

pub struct Supervisor {
    config: Config,
    chain_registry: Arc<ChainRegistry>,
    event_bus: Arc<EventBus>,
    price_feed: Arc<PriceFeed>,
    yield_feed: Arc<YieldFeed>,
    aggregator: Arc<MarketDataAggregator>,
    signal_agent: SignalAgent,
    strategy_agent: StrategyAgent,
    voting: VotingCoordinator,
    upkeep_engine: Arc<UpkeepEngine>,
    orchestrator: Arc<Orchestrator>,
    history: Arc<HistoryStore>,
    checkpoint: Arc<CheckpointStore>,
    degraded: AtomicBool,
    pending_price_changes: Mutex<Vec<(String, i32)>>,
}

impl Supervisor {
    pub fn new(
        config: Config,
        chain_registry: Arc<ChainRegistry>,
        event_bus: Arc<EventBus>,
        price_feed: Arc<PriceFeed>,
        yield_feed: Arc<YieldFeed>,
        aggregator: Arc<MarketDataAggregator>,
        upkeep_engine: Arc<UpkeepEngine>,
        orchestrator: Arc<Orchestrator>,
        history: Arc<HistoryStore>,
        checkpoint: Arc<CheckpointStore>,
    ) -> Self {
        let signal_agent = SignalAgent::new(config.signal.clone());
        let strategy_agent = StrategyAgent::new(config.strategy.clone());
        let voting = VotingCoordinator::new(config.voting.clone());
        Self {
            config,
            chain_registry,
            event_bus,
            price_feed,
            yield_feed,
            aggregator,
            signal_agent,
            strategy_agent,
            voting,
            upkeep_engine,
            orchestrator,
            history,
            checkpoint,
            degraded: AtomicBool::new(false),
            pending_price_changes: Mutex::new(Vec::new()),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Runs forever, driving the price/yield polling loops, the
    /// aggregate-decide-upkeep evaluation cycle, and periodic health
    /// reporting. Each loop is wrapped in [`Self::run_with_restart`] so a
    /// transient panic/error in one doesn't take down the others.
    pub async fn run(self: Arc<Self>) {
        let price_interval = self.config.price_poll_interval();
        let yield_interval = self.config.yield_poll_interval();
        let eval_interval = Duration::from_secs(self.config.upkeep.evaluation_interval_secs);

        let price_task = {
            let this = self.clone();
            this.clone().run_with_restart("price_feed", move || {
                let this = this.clone();
                async move { this.price_poll_loop(price_interval).await }
            })
        };
        let yield_task = {
            let this = self.clone();
            this.clone().run_with_restart("yield_feed", move || {
                let this = this.clone();
                async move { this.yield_poll_loop(yield_interval).await }
            })
        };
        let eval_task = {
            let this = self.clone();
            this.clone().run_with_restart("evaluation_cycle", move || {
                let this = this.clone();
                async move { this.evaluation_loop(eval_interval).await }
            })
        };
        let health_task = {
            let this = self.clone();
            this.clone().run_with_restart("health_reporter", move || {
                let this = this.clone();
                async move { this.health_report_loop(Duration::from_secs(30)).await }
            })
        };
        let price_change_task = {
            let this = self.clone();
            this.clone().run_with_restart("price_change_collector", move || {
                let this = this.clone();
                async move { this.price_change_collector_loop().await }
            })
        };

        tokio::join!(price_task, yield_task, eval_task, health_task, price_change_task);
    }

    /// Subscribes to the event bus and buffers every
    /// `SignificantPriceChange` event until the next evaluation cycle
    /// drains it, so the Signal Agent's price-change rule sees the moves
    /// the price feed actually publishes instead of an empty slice.
    async fn price_change_collector_loop(&self) -> anyhow::Result<()> {
        let mut rx = self.event_bus.subscribe();
        loop {
            match rx.recv().await {
                Ok(Event::SignificantPriceChange { pair, delta_bps }) => {
                    self.pending_price_changes.lock().push((pair, delta_bps));
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    for _ in 0..skipped {
                        self.event_bus.record_drop("significantPriceChange");
                    }
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    return Err(anyhow::anyhow!("event bus closed"));
                }
            }
        }
    }

    async fn price_poll_loop(&self, period: Duration) -> anyhow::Result<()> {
        let mut ticker = interval(period);
        loop {
            ticker.tick().await;
            let _ = self.price_feed.poll_once().await;
        }
    }

    async fn yield_poll_loop(&self, period: Duration) -> anyhow::Result<()> {
        let mut ticker = interval(period);
        loop {
            ticker.tick().await;
            let _ = self.yield_feed.poll_once().await;
            self.aggregator.recompute();
        }
    }

    /// One full Signal -> Strategy -> Voting -> Upkeep -> Orchestrator
    /// cycle, repeated at `evaluation_interval_secs`.
    async fn evaluation_loop(&self, period: Duration) -> anyhow::Result<()> {
        let mut ticker = interval(period);
        loop {
            ticker.tick().await;
            self.run_evaluation_cycle().await;
        }
    }

    async fn run_evaluation_cycle(&self) {
        let snapshot = self.aggregator.current_snapshot();
        let gas_prices = self.current_gas_prices();

        let significant_changes: Vec<(String, i32)> = std::mem::take(&mut self.pending_price_changes.lock());
        let signals = self
            .signal_agent
            .detect_all(&snapshot, &gas_prices, &self.chain_registry, &significant_changes);
        for s in &signals {
            self.event_bus.publish(Event::Signal(s.clone()));
        }

        let candidates = self.strategy_agent.propose(&snapshot, &signals);
        let decision = self.voting.decide(&signals, &candidates, Utc::now());
        self.event_bus.publish(Event::Decision(decision.clone()));
        let _ = self.history.append(HistoryRecord::Decision {
            recorded_at: Utc::now(),
            decision: decision.clone(),
        });

        let apr_delta_by_chain_pair = Self::apr_deltas(&snapshot);
        self.upkeep_engine
            .evaluate_all(&snapshot, &decision, &apr_delta_by_chain_pair, &gas_prices, &self.chain_registry)
            .await;

        self.orchestrator.sweep_timeouts();

        let _ = self.checkpoint.set("last_eval_at", Utc::now().to_rfc3339());
    }

    fn apr_deltas(snapshot: &crate::model::MarketSnapshot) -> HashMap<(ChainId, ChainId), u32> {
        let mut deltas = HashMap::new();
        let pools: Vec<_> = snapshot.pools.values().collect();
        for (i, a) in pools.iter().enumerate() {
            for b in pools.iter().skip(i + 1) {
                if a.key.chain_id == b.key.chain_id {
                    continue;
                }
                let delta = (a.apr_bps - b.apr_bps).unsigned_abs();
                deltas.insert((a.key.chain_id, b.key.chain_id), delta);
            }
        }
        deltas
    }

    /// Chain RPC gas polling has no feed defined yet and would plug in
    /// here. Until that's wired up, every configured chain reports a gas
    /// price of zero, which never trips the ceiling check.
    fn current_gas_prices(&self) -> HashMap<ChainId, u64> {
        self.chain_registry.chain_ids().map(|id| (id, 0u64)).collect()
    }

    async fn health_report_loop(&self, period: Duration) -> anyhow::Result<()> {
        let mut ticker = interval(period);
        loop {
            ticker.tick().await;
            self.publish_health_reports();
        }
    }

    fn publish_health_reports(&self) {
        let reports = [
            ("price_feed", self.price_feed.is_degraded()),
            ("yield_feed", self.yield_feed.is_degraded()),
        ];
        for (name, degraded) in reports {
            let status = if degraded { ComponentStatus::Degraded } else { ComponentStatus::Up };
            self.event_bus.publish(Event::HealthReport(HealthReport {
                component: name.to_string(),
                status,
                last_activity_age_ms: 0,
                detail: None,
            }));
        }
        self.event_bus.publish(Event::HealthReport(HealthReport {
            component: "orchestrator".to_string(),
            status: ComponentStatus::Up,
            last_activity_age_ms: 0,
            detail: Some(format!("{} messages in flight", self.orchestrator.in_flight_count())),
        }));
    }

    /// Runs `make_task` to completion, restarting it with exponential
    /// backoff on error up to `MAX_RESTART_ATTEMPTS` times. After the
    /// final failed attempt the component is reported `Down` and the
    /// whole system is marked degraded, but this task simply exits
    /// rather than tearing down sibling components.
    async fn run_with_restart<F, Fut>(self: Arc<Self>, name: &'static str, mut make_task: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let mut attempt = 0u32;
        loop {
            match make_task().await {
                Ok(()) => return,
                Err(err) => {
                    attempt += 1;
                    warn!(component = name, attempt, error = %err, "component task failed");
                    self.event_bus.publish(Event::HealthReport(HealthReport {
                        component: name.to_string(),
                        status: ComponentStatus::Down,
                        last_activity_age_ms: 0,
                        detail: Some(err.to_string()),
                    }));
                    if attempt >= MAX_RESTART_ATTEMPTS {
                        error!(component = name, "exhausted restart attempts; marking system degraded");
                        self.degraded.store(true, Ordering::Relaxed);
                        return;
                    }
                    let backoff = Duration::from_millis(250u64.saturating_mul(1u64 << attempt.min(10)));
                    tokio::time::sleep(backoff).await;
                    info!(component = name, attempt, "restarting component");
                }
            }
        }
    }
}
