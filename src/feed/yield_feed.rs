//! Yield leg of the Price/Yield Data Feed.

use chrono::Utc;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

use crate::chain_registry::ChainRegistry;
use crate::config::FeedConfig;
use crate::feed::SourceHealth;
use crate::http_client::RateLimitedHttpClient;
use crate::model::{ChainId, PoolKey, PoolSnapshot, Protocol};

/// One row of the yield aggregator's `pools` endpoint response: an array
/// with at least `{project, chain, apy, tvlUsd}`.
#[derive(Debug, Deserialize)]
struct YieldPoolRow {
    project: String,
    chain: String,
    apy: f64,
    #[serde(rename = "tvlUsd")]
    tvl_usd: f64,
    #[serde(default)]
    pool: Option<String>,
    #[serde(default)]
    utilization: Option<f64>,
    #[serde(default)]
    symbol: Option<String>,
}

#[derive(Debug, Deserialize)]
struct YieldPoolsResponse {
    data: Vec<YieldPoolRow>,
}

fn protocol_from_project(project: &str) -> Option<Protocol> {
    match project.to_ascii_lowercase().as_str() {
        "aave" | "aave-v2" | "aave-v3" => Some(Protocol::Aave),
        "compound" | "compound-v2" | "compound-v3" => Some(Protocol::Compound),
        "uniswap" | "uniswap-v2" | "uniswap-v3" => Some(Protocol::Uniswap),
        "curve" | "curve-dex" => Some(Protocol::Curve),
        other if !other.is_empty() => Some(Protocol::Other(other.to_string())),
        _ => None,
    }
}

/// Maps the aggregator's human-readable chain name to a configured
/// `ChainId` by scanning the registry for a case-insensitive name match.
fn chain_id_from_name(registry: &ChainRegistry, name: &str) -> Option<ChainId> {
    registry
        .chain_ids()
        .find(|&id| registry.get(id).map(|e| e.name.eq_ignore_ascii_case(name)).unwrap_or(false))
}

pub struct YieldFeed {
    http: Arc<RateLimitedHttpClient>,
    chain_registry: Arc<ChainRegistry>,
    yield_api_url: String,
    latest: RwLock<BTreeMap<PoolKey, PoolSnapshot>>,
    health: RwLock<SourceHealth>,
}

impl YieldFeed {
    pub fn new(
        http: Arc<RateLimitedHttpClient>,
        chain_registry: Arc<ChainRegistry>,
        yield_api_url: String,
        config: &FeedConfig,
    ) -> Self {
        Self {
            http,
            chain_registry,
            yield_api_url,
            latest: RwLock::new(BTreeMap::new()),
            health: RwLock::new(SourceHealth::new("yield_api", config.degraded_after_failures)),
        }
    }

    pub fn latest_yields(&self) -> BTreeMap<PoolKey, PoolSnapshot> {
        self.latest.read().clone()
    }

    pub fn is_degraded(&self) -> bool {
        self.health.read().is_degraded()
    }

    pub async fn poll_once(&self) -> Result<(), crate::http_client::FetchError> {
        let started = Instant::now();
        match self
            .http
            .fetch_json::<YieldPoolsResponse>(&self.yield_api_url, "")
            .await
        {
            Ok(resp) => {
                self.health
                    .write()
                    .record_success(started.elapsed().as_secs_f64() * 1000.0);
                self.ingest(resp.data);
                Ok(())
            }
            Err(err) => {
                self.health.write().record_failure();
                warn!(error = %err, "yield feed poll failed; isolating source failure");
                Err(err)
            }
        }
    }

    fn ingest(&self, rows: Vec<YieldPoolRow>) {
        let now = Utc::now();
        let mut next = BTreeMap::new();

        for row in rows {
            let Some(chain_id) = chain_id_from_name(&self.chain_registry, &row.chain) else {
                continue;
            };
            let Some(protocol) = protocol_from_project(&row.project) else {
                continue;
            };
            let pool_address = row.pool.clone().unwrap_or_else(|| row.project.clone());
            let token = row
                .symbol
                .clone()
                .unwrap_or_default()
                .to_ascii_uppercase();
            let key = PoolKey::new(chain_id, protocol, pool_address, token);

            let apr_bps = ((row.apy * 100.0).round() as i64).clamp(i32::MIN as i64, i32::MAX as i64) as i32;
            let tvl_smallest_unit = (row.tvl_usd.max(0.0) * 1e6) as u128;
            let utilization_bps = row
                .utilization
                .map(|u| (u * 10_000.0).clamp(0.0, 10_000.0) as u32)
                .unwrap_or(0);

            next.insert(
                key.clone(),
                PoolSnapshot::new(key, apr_bps, tvl_smallest_unit, utilization_bps, now),
            );
        }

        *self.latest.write() = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_registry::ChainEntry;
    use crate::config::HttpClientConfig;

    fn registry() -> Arc<ChainRegistry> {
        Arc::new(
            ChainRegistry::build(vec![ChainEntry {
                chain_id: 1,
                name: "Ethereum".into(),
                chain_selector: 100,
                router_address: "0x".into(),
                link_token_address: "0x".into(),
                explorer_url: "https://example.com".into(),
                native_decimals: 18,
                gas_ceiling: 100,
            }])
            .unwrap(),
        )
    }

    fn feed() -> YieldFeed {
        let http = Arc::new(RateLimitedHttpClient::new(HttpClientConfig::default()).unwrap());
        YieldFeed::new(
            http,
            registry(),
            "https://example.com/pools".to_string(),
            &FeedConfig::default(),
        )
    }

    #[test]
    fn ingest_filters_unsupported_chains() {
        let feed = feed();
        feed.ingest(vec![
            YieldPoolRow {
                project: "aave".into(),
                chain: "Ethereum".into(),
                apy: 6.5,
                tvl_usd: 2_000_000.0,
                pool: Some("0xpool".into()),
                utilization: Some(0.5),
                symbol: Some("usdc".into()),
            },
            YieldPoolRow {
                project: "aave".into(),
                chain: "Unsupported Chain".into(),
                apy: 9.0,
                tvl_usd: 1_000_000.0,
                pool: Some("0xother".into()),
                utilization: None,
                symbol: Some("usdc".into()),
            },
        ]);

        let snapshot = feed.latest_yields();
        assert_eq!(snapshot.len(), 1);
        let (key, pool) = snapshot.iter().next().unwrap();
        assert_eq!(key.chain_id, 1);
        assert_eq!(key.token, "USDC");
        assert_eq!(pool.apr_bps, 650);
        assert_eq!(pool.utilization_bps, 5_000);
    }
}
