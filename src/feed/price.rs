//! Price leg of the Price/Yield Data Feed.

use chrono::Utc;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::chain_registry::ChainRegistry;
use crate::config::FeedConfig;
use crate::event_bus::{Event, EventBus};
use crate::feed::SourceHealth;
use crate::http_client::RateLimitedHttpClient;
use crate::model::{ChainId, PriceTick};

/// One oracle/off-chain pair this feed is responsible for.
#[derive(Debug, Clone)]
pub struct OraclePairConfig {
    pub chain_id: ChainId,
    pub pair: String,
    /// Identifier used against the off-chain price API (e.g. a CoinGecko
    /// asset id like "ethereum").
    pub asset_id: String,
}

#[derive(Debug, Deserialize)]
struct SimplePriceEntry {
    usd: f64,
    #[serde(default)]
    usd_24h_vol: Option<f64>,
}

pub enum NotReady {
    NoDataYet,
    Stale,
}

/// Polls on-chain price oracles (simulated here via the same off-chain
/// price API — a real bridge/RPC oracle read has no feed defined yet)
/// and the off-chain simple price API, normalizing both into
/// [`PriceTick`].
pub struct PriceFeed {
    http: Arc<RateLimitedHttpClient>,
    event_bus: Arc<EventBus>,
    chain_registry: Arc<ChainRegistry>,
    config: FeedConfig,
    price_api_url: String,
    pairs: Vec<OraclePairConfig>,
    latest: RwLock<HashMap<(ChainId, String), PriceTick>>,
    last_emitted: RwLock<HashMap<String, PriceTick>>,
    health: RwLock<SourceHealth>,
}

impl PriceFeed {
    pub fn new(
        http: Arc<RateLimitedHttpClient>,
        event_bus: Arc<EventBus>,
        chain_registry: Arc<ChainRegistry>,
        config: FeedConfig,
        price_api_url: String,
        pairs: Vec<OraclePairConfig>,
    ) -> Self {
        let threshold = config.degraded_after_failures;
        Self {
            http,
            event_bus,
            chain_registry,
            config,
            price_api_url,
            pairs,
            latest: RwLock::new(HashMap::new()),
            last_emitted: RwLock::new(HashMap::new()),
            health: RwLock::new(SourceHealth::new("price_api", threshold)),
        }
    }

    pub fn latest_price(&self, chain_id: ChainId, pair: &str) -> Option<PriceTick> {
        self.latest
            .read()
            .get(&(chain_id, pair.to_string()))
            .cloned()
    }

    pub fn is_degraded(&self) -> bool {
        self.health.read().is_degraded()
    }

    /// One polling cycle: fetch every configured pair from the price API,
    /// normalize, filter, and emit `priceUpdate`/`significantPriceChange`.
    pub async fn poll_once(&self) -> Result<(), crate::http_client::FetchError> {
        if self.pairs.is_empty() {
            return Ok(());
        }
        let ids = self
            .pairs
            .iter()
            .map(|p| p.asset_id.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let url = format!(
            "{}?ids={}&vs_currencies=usd&include_24hr_vol=true",
            self.price_api_url, ids
        );

        let started = Instant::now();
        match self
            .http
            .fetch_json::<HashMap<String, SimplePriceEntry>>(&url, &ids)
            .await
        {
            Ok(body) => {
                self.health.write().record_success(started.elapsed().as_secs_f64() * 1000.0);
                self.ingest(body);
                Ok(())
            }
            Err(err) => {
                self.health.write().record_failure();
                warn!(error = %err, "price feed poll failed; isolating source failure");
                Err(err)
            }
        }
    }

    fn ingest(&self, body: HashMap<String, SimplePriceEntry>) {
        let now = Utc::now();
        for pair_cfg in &self.pairs {
            let Some(entry) = body.get(&pair_cfg.asset_id) else {
                continue;
            };
            if self.chain_registry.get(pair_cfg.chain_id).is_none() {
                continue;
            }

            let confidence_ppm = match entry.usd_24h_vol {
                Some(v) if v > 0.0 => 990_000,
                _ => 700_000,
            };
            let price_e18 = (entry.usd * 1e18).round().max(0.0) as u128;

            let tick = PriceTick {
                pair: pair_cfg.pair.clone(),
                price_e18,
                confidence_ppm,
                source: "price_api".to_string(),
                observed_at: now,
                latency_ms: 0,
            };

            if tick.confidence_ppm < self.config.min_confidence_ppm {
                debug!(pair = %tick.pair, confidence = tick.confidence_ppm, "dropping low-confidence tick");
                continue;
            }

            self.latest
                .write()
                .insert((pair_cfg.chain_id, pair_cfg.pair.clone()), tick.clone());
            self.event_bus.publish(Event::PriceUpdate(tick.clone()));
            self.maybe_emit_significant_change(&tick);
        }
    }

    /// Staleness filter applied when a consumer reads a tick back out:
    /// ingestion itself always records the latest reading, and staleness
    /// is evaluated at read time, ignoring ticks older than
    /// `max_staleness`.
    pub fn latest_price_checked(&self, chain_id: ChainId, pair: &str) -> Result<PriceTick, NotReady> {
        match self.latest_price(chain_id, pair) {
            None => Err(NotReady::NoDataYet),
            Some(tick) => {
                let age = Utc::now().signed_duration_since(tick.observed_at);
                if age.num_seconds() as u64 > self.config.max_staleness_secs {
                    Err(NotReady::Stale)
                } else {
                    Ok(tick)
                }
            }
        }
    }

    fn maybe_emit_significant_change(&self, tick: &PriceTick) {
        let mut last_emitted = self.last_emitted.write();
        let should_emit = match last_emitted.get(&tick.pair) {
            None => true,
            Some(prev) => {
                let delta = (tick.price_e18 as i128 - prev.price_e18 as i128).unsigned_abs();
                let delta_bps = if prev.price_e18 == 0 {
                    0
                } else {
                    (delta * 10_000 / prev.price_e18) as u64
                };
                delta_bps >= self.config.significant_change_bps as u64
            }
        };

        if should_emit {
            let delta_bps = match last_emitted.get(&tick.pair) {
                None => 0,
                Some(prev) => {
                    let signed_delta = tick.price_e18 as i128 - prev.price_e18 as i128;
                    if prev.price_e18 == 0 {
                        0
                    } else {
                        (signed_delta * 10_000 / prev.price_e18 as i128) as i32
                    }
                }
            };
            last_emitted.insert(tick.pair.clone(), tick.clone());
            drop(last_emitted);
            self.event_bus.publish(Event::SignificantPriceChange {
                pair: tick.pair.clone(),
                delta_bps,
            });
        }
    }
}
