//! Application configuration: environment + optional TOML file.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::chain_registry::ChainEntry;
use crate::errors::ConfigError;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub price_poll_secs: u64,
    pub yield_poll_secs: u64,
    pub oracle_poll_secs: u64,
    pub significant_change_bps: u32,
    pub max_staleness_secs: u64,
    pub min_confidence_ppm: u32,
    pub degraded_after_failures: u32,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            price_poll_secs: 60,
            yield_poll_secs: 300,
            oracle_poll_secs: 30,
            significant_change_bps: 200,
            max_staleness_secs: 3600,
            min_confidence_ppm: 950_000,
            degraded_after_failures: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    pub apr_delta_threshold_bps: i32,
    pub utilization_alert_bps: u32,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            apr_delta_threshold_bps: 100,
            utilization_alert_bps: 9_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub top_k_candidates: usize,
    pub slippage_allowance_bps: u32,
    pub bridge_fee_bps_estimate: u32,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            top_k_candidates: 8,
            slippage_allowance_bps: 100,
            bridge_fee_bps_estimate: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VotingConfig {
    pub signal_weight: f64,
    pub strategy_weight: f64,
    pub consensus_threshold: f64,
    pub min_confidence_ppm: u32,
    pub emergency_threshold_ppm: u32,
    pub safe_pool_chain: u64,
    pub safe_pool_address: String,
}

impl Default for VotingConfig {
    fn default() -> Self {
        Self {
            signal_weight: 0.4,
            strategy_weight: 0.6,
            consensus_threshold: 0.70,
            min_confidence_ppm: 600_000,
            emergency_threshold_ppm: 900_000,
            safe_pool_chain: 0,
            safe_pool_address: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpkeepEngineConfig {
    pub evaluation_interval_secs: u64,
    pub max_submit_retries: u32,
    pub submit_backoff_base_ms: u64,
    /// Minimum cross-chain APR delta (bps) that alone justifies an
    /// upkeep run, independent of elapsed time or TVL drift.
    pub apr_delta_trigger_bps: u32,
    /// Minimum TVL change (percent) on the upkeep's target chain that
    /// alone justifies an upkeep run.
    pub tvl_delta_trigger_pct: u32,
}

impl Default for UpkeepEngineConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_secs: 60,
            max_submit_retries: 5,
            submit_backoff_base_ms: 250,
            apr_delta_trigger_bps: 100,
            tvl_delta_trigger_pct: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub source_confirm_timeout_secs: u64,
    pub delivery_timeout_secs: u64,
    pub confirmation_depth: u32,
    pub max_submit_retries: u32,
    pub max_fee_estimate_retries: u32,
    pub retry_backoff_base_ms: u64,
    pub parallel_per_source: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            source_confirm_timeout_secs: 15 * 60,
            delivery_timeout_secs: 60 * 60,
            confirmation_depth: 3,
            max_submit_retries: 3,
            max_fee_estimate_retries: 3,
            retry_backoff_base_ms: 250,
            parallel_per_source: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpClientConfig {
    pub max_concurrent_per_host: usize,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub cache_ttl_secs: u64,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            max_concurrent_per_host: 8,
            max_retries: 3,
            backoff_base_ms: 250,
            backoff_cap_ms: 4_000,
            cache_ttl_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    pub history_capacity: usize,
    pub event_bus_capacity: usize,
    pub history_path: String,
    pub checkpoint_path: String,
    pub chains: Vec<ChainEntry>,
    pub feed: FeedConfig,
    pub signal: SignalConfig,
    pub strategy: StrategyConfig,
    pub voting: VotingConfig,
    pub upkeep: UpkeepEngineConfig,
    pub orchestrator: OrchestratorConfig,
    pub http_client: HttpClientConfig,
    pub yield_api_url: String,
    pub price_api_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9090".to_string(),
            history_capacity: 500,
            event_bus_capacity: 1024,
            history_path: "./rebalancer_history.jsonl".to_string(),
            checkpoint_path: "./rebalancer_checkpoint.json".to_string(),
            chains: Vec::new(),
            feed: FeedConfig::default(),
            signal: SignalConfig::default(),
            strategy: StrategyConfig::default(),
            voting: VotingConfig::default(),
            upkeep: UpkeepEngineConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            http_client: HttpClientConfig::default(),
            yield_api_url: "https://yields.llama.fi/pools".to_string(),
            price_api_url: "https://api.coingecko.com/api/v3/simple/price".to_string(),
        }
    }
}

impl Config {
    /// Load config layered as: built-in defaults, optional TOML file,
    /// environment overrides, and finally a `--config <path>` CLI flag
    /// pointing at the TOML file to load.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let mut config = match config_path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    ConfigError(format!("failed to read config file {}: {e}", path.display()))
                })?;
                toml::from_str(&text)
                    .map_err(|e| ConfigError(format!("failed to parse config file: {e}")))?
            }
            None => Config::default(),
        };

        if let Ok(addr) = std::env::var("REBALANCER_LISTEN_ADDR") {
            config.listen_addr = addr;
        }
        if let Ok(cap) = std::env::var("REBALANCER_HISTORY_CAPACITY") {
            config.history_capacity = cap
                .parse()
                .map_err(|_| ConfigError("REBALANCER_HISTORY_CAPACITY must be a number".into()))?;
        }
        if let Ok(path) = std::env::var("REBALANCER_HISTORY_PATH") {
            config.history_path = path;
        }
        if let Ok(path) = std::env::var("REBALANCER_CHECKPOINT_PATH") {
            config.checkpoint_path = path;
        }
        if let Ok(url) = std::env::var("REBALANCER_YIELD_API_URL") {
            config.yield_api_url = url;
        }
        if let Ok(url) = std::env::var("REBALANCER_PRICE_API_URL") {
            config.price_api_url = url;
        }

        if config.chains.is_empty() {
            return Err(ConfigError(
                "chain registry is empty: configure at least one [[chains]] entry".into(),
            ));
        }

        Ok(config)
    }

    pub fn price_poll_interval(&self) -> Duration {
        Duration::from_secs(self.feed.price_poll_secs)
    }

    pub fn yield_poll_interval(&self) -> Duration {
        Duration::from_secs(self.feed.yield_poll_secs)
    }

    pub fn oracle_poll_interval(&self) -> Duration {
        Duration::from_secs(self.feed.oracle_poll_secs)
    }
}
