//! Event Bus & Metrics.
//!
//! Typed topics multiplexed over a single `tokio::sync::broadcast`
//! channel carrying one `Event` enum. Counters/gauges/histograms go
//! through the `metrics` facade.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::trace;

use crate::model::{Decision, PriceTick, Signal};
use crate::orchestrator::message::{CrossChainMessage, MessageState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub component: String,
    pub status: ComponentStatus,
    pub last_activity_age_ms: u64,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Up,
    Degraded,
    Down,
}

/// One event per topic. A single enum keeps one broadcast channel
/// manageable while letting subscribers `match` on what they care about;
/// `topic_name` is what backpressure-drop metrics are keyed by.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    PriceUpdate(PriceTick),
    SignificantPriceChange { pair: String, delta_bps: i32 },
    Snapshot { taken_at: DateTime<Utc> },
    Signal(Signal),
    Decision(Decision),
    UpkeepNeeded { upkeep_id: String },
    UpkeepFailed { upkeep_id: String, reason: String },
    MessageStateChanged { message_id: String, state: MessageState },
    RebalanceCompleted { decision_reached_at: DateTime<Utc>, success: bool },
    HealthReport(HealthReport),
}

impl Event {
    pub fn topic_name(&self) -> &'static str {
        match self {
            Event::PriceUpdate(_) => "priceUpdate",
            Event::SignificantPriceChange { .. } => "significantPriceChange",
            Event::Snapshot { .. } => "snapshot",
            Event::Signal(_) => "signal",
            Event::Decision(_) => "decision",
            Event::UpkeepNeeded { .. } => "upkeepNeeded",
            Event::UpkeepFailed { .. } => "upkeepFailed",
            Event::MessageStateChanged { .. } => "messageStateChanged",
            Event::RebalanceCompleted { .. } => "rebalanceCompleted",
            Event::HealthReport(_) => "healthReport",
        }
    }
}

/// Also relevant to [`CrossChainMessage`]; referenced here for the
/// `messageStateChanged` payload constructor used by the orchestrator.
impl From<&CrossChainMessage> for Event {
    fn from(msg: &CrossChainMessage) -> Self {
        Event::MessageStateChanged {
            message_id: msg.message_id.clone(),
            state: msg.state,
        }
    }
}

/// Process-wide event bus. Publish never blocks: a full channel just drops
/// the oldest buffered event (broadcast channel semantics) and we bump
/// `backpressure_drop` for that topic.
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    backpressure_drops: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _rx) = broadcast::channel(capacity.max(1));
        metrics::describe_counter!(
            "rebalancer_events_published_total",
            "Events published to the bus, by topic"
        );
        metrics::describe_counter!(
            "rebalancer_events_dropped_total",
            "Events dropped due to full subscriber buffers"
        );
        Self {
            sender,
            backpressure_drops: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publish an event. Never suspends: a lagging subscriber drops older
    /// events from its own receive queue per broadcast-channel semantics,
    /// so the publisher itself never blocks.
    pub fn publish(&self, event: Event) {
        let topic = event.topic_name();
        metrics::counter!("rebalancer_events_published_total", "topic" => topic).increment(1);
        match self.sender.send(event) {
            Ok(_receiver_count) => {}
            Err(broadcast::error::SendError(_)) => {
                // No active subscribers; not a drop in the backpressure
                // sense (nothing was waiting), so only trace-log it.
                trace!(topic, "published event with no subscribers");
            }
        }
    }

    pub fn record_drop(&self, topic: &str) {
        self.backpressure_drops.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("rebalancer_events_dropped_total", "topic" => topic.to_string())
            .increment(1);
    }

    pub fn backpressure_drop_count(&self) -> u64 {
        self.backpressure_drops.load(Ordering::Relaxed)
    }
}

/// Lightweight per-component counters used by the Supervisor's health
/// report and exposed through the Prometheus exporter.
#[derive(Debug, Default)]
pub struct ComponentMetrics {
    pub requests: AtomicU64,
    pub successes: AtomicU64,
    pub errors: AtomicU64,
}

impl ComponentMetrics {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ComponentMetricsSnapshot {
        ComponentMetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ComponentMetricsSnapshot {
    pub requests: u64,
    pub successes: u64,
    pub errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_is_fifo_per_subscriber() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(Event::UpkeepNeeded {
            upkeep_id: "a".into(),
        });
        bus.publish(Event::UpkeepNeeded {
            upkeep_id: "b".into(),
        });

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        match (first, second) {
            (Event::UpkeepNeeded { upkeep_id: a }, Event::UpkeepNeeded { upkeep_id: b }) => {
                assert_eq!(a, "a");
                assert_eq!(b, "b");
            }
            _ => panic!("unexpected event variants"),
        }
    }

    #[test]
    fn component_metrics_snapshot_reflects_updates() {
        let metrics = ComponentMetrics::default();
        metrics.record_request();
        metrics.record_request();
        metrics.record_success();
        metrics.record_error();

        let snap = metrics.snapshot();
        assert_eq!(snap.requests, 2);
        assert_eq!(snap.successes, 1);
        assert_eq!(snap.errors, 1);
    }
}
