//! Rebalancer control-plane CLI.
//!
//! Usage:
//!   rebalancer serve --config <path> [--listen <addr>] [--log-level <level>]
//!   rebalancer once --config <path> [--dry-run]
//!   rebalancer explain --config <path> --id <message_id>
//!
//! Exit codes: 0 success, 2 configuration error, 3 upstream-unavailable
//! (retries exhausted on startup), 4 fatal internal.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use betterbot_backend::agents::signal::SignalAgent;
use betterbot_backend::agents::strategy::StrategyAgent;
use betterbot_backend::agents::voting::VotingCoordinator;
use betterbot_backend::aggregator::MarketDataAggregator;
use betterbot_backend::chain_registry::ChainRegistry;
use betterbot_backend::config::Config;
use betterbot_backend::event_bus::EventBus;
use betterbot_backend::feed::price::PriceFeed;
use betterbot_backend::feed::yield_feed::YieldFeed;
use betterbot_backend::history::{CheckpointStore, HistoryRecord, HistoryStore};
use betterbot_backend::http_client::RateLimitedHttpClient;
use betterbot_backend::orchestrator::bridge::PaperBridgeAdapter;
use betterbot_backend::orchestrator::Orchestrator;
use betterbot_backend::supervisor::Supervisor;
use betterbot_backend::upkeep::UpkeepEngine;

#[derive(Parser, Debug)]
#[command(name = "rebalancer")]
#[command(about = "Autonomous cross-chain yield rebalancer control plane")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the full control plane: feeds, agents, upkeep, orchestrator.
    Serve {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        listen: Option<String>,
        #[arg(long, default_value = "info")]
        log_level: String,
    },
    /// Execute a single snapshot + decision + (optional) upkeep cycle, print the decision, exit.
    Once {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Read a decision/message from the history store and print reasoning.
    Explain {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        id: String,
    },
}

fn init_tracing(log_level: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| log_level.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            return ExitCode::from(4);
        }
    };

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> ExitCode {
    match cli.command {
        Commands::Serve { config, listen, log_level } => {
            init_tracing(&log_level);
            run_serve(config, listen).await
        }
        Commands::Once { config, dry_run } => {
            init_tracing("info");
            run_once(config, dry_run).await
        }
        Commands::Explain { config, id } => {
            init_tracing("warn");
            run_explain(config, &id)
        }
    }
}

struct Components {
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
}

fn load_config(config_path: Option<PathBuf>) -> Result<Config, ExitCode> {
    match Config::load(config_path.as_deref()) {
        Ok(c) => Ok(c),
        Err(e) => {
            error!(error = %e, "configuration error");
            Err(ExitCode::from(2))
        }
    }
}

fn build_components(config: Config) -> Result<Components, ExitCode> {
    let chain_registry = match ChainRegistry::build(config.chains.clone()) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            error!(error = %e, "configuration error");
            return Err(ExitCode::from(2));
        }
    };

    let event_bus = Arc::new(EventBus::new(config.event_bus_capacity));
    let http = match RateLimitedHttpClient::new(config.http_client.clone()) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!(error = %e, "failed to build HTTP client");
            return Err(ExitCode::from(4));
        }
    };

    let price_feed = Arc::new(PriceFeed::new(
        http.clone(),
        event_bus.clone(),
        chain_registry.clone(),
        config.feed.clone(),
        config.price_api_url.clone(),
        Vec::new(),
    ));
    let yield_feed = Arc::new(YieldFeed::new(
        http.clone(),
        chain_registry.clone(),
        config.yield_api_url.clone(),
        &config.feed,
    ));
    let aggregator = Arc::new(MarketDataAggregator::new(yield_feed.clone(), event_bus.clone(), 100));

    let bridge: Arc<dyn betterbot_backend::orchestrator::bridge::BridgeAdapter> =
        Arc::new(PaperBridgeAdapter::default());
    let orchestrator = Arc::new(Orchestrator::new(config.orchestrator.clone(), bridge, event_bus.clone()));
    let upkeep_engine = Arc::new(UpkeepEngine::new(config.upkeep.clone(), orchestrator.clone(), event_bus.clone()));

    let history = match HistoryStore::open(&config.history_path, config.history_capacity) {
        Ok(h) => Arc::new(h),
        Err(e) => {
            error!(error = %e, path = %config.history_path, "failed to open history store");
            return Err(ExitCode::from(4));
        }
    };
    let checkpoint = match CheckpointStore::open(&config.checkpoint_path) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!(error = %e, path = %config.checkpoint_path, "failed to open checkpoint store");
            return Err(ExitCode::from(4));
        }
    };

    Ok(Components {
        config,
        chain_registry,
        event_bus,
        price_feed,
        yield_feed,
        aggregator,
        upkeep_engine,
        orchestrator,
        history,
        checkpoint,
    })
}

async fn run_serve(config_path: Option<PathBuf>, listen_override: Option<String>) -> ExitCode {
    let mut config = match load_config(config_path) {
        Ok(c) => c,
        Err(code) => return code,
    };
    if let Some(addr) = listen_override {
        config.listen_addr = addr;
    }

    let components = match build_components(config) {
        Ok(c) => c,
        Err(code) => return code,
    };

    info!(listen_addr = %components.config.listen_addr, "starting rebalancer control plane");

    if let Err(e) = components.yield_feed.poll_once().await {
        error!(error = %e, "yield feed unreachable on startup after exhausting retries");
        return ExitCode::from(3);
    }

    let listen_addr = components.config.listen_addr.clone();
    let supervisor = Arc::new(Supervisor::new(
        components.config,
        components.chain_registry,
        components.event_bus.clone(),
        components.price_feed,
        components.yield_feed,
        components.aggregator,
        components.upkeep_engine,
        components.orchestrator,
        components.history,
        components.checkpoint,
    ));

    let metrics_task = tokio::spawn(serve_metrics(supervisor.clone(), listen_addr));
    supervisor.clone().run().await;
    metrics_task.abort();

    if supervisor.is_degraded() {
        ExitCode::from(4)
    } else {
        ExitCode::SUCCESS
    }
}

/// Minimal axum server exposing `/healthz` and the Prometheus exporter.
async fn serve_metrics(supervisor: Arc<Supervisor>, listen_addr: String) {
    use axum::routing::get;
    use axum::{extract::State, Router};

    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    if let Err(e) = builder.install() {
        error!(error = %e, "failed to install prometheus recorder");
    }

    async fn healthz(State(supervisor): State<Arc<Supervisor>>) -> &'static str {
        if supervisor.is_degraded() {
            "degraded"
        } else {
            "ok"
        }
    }

    let app = Router::new().route("/healthz", get(healthz)).with_state(supervisor.clone());

    let listener = match tokio::net::TcpListener::bind(&listen_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, listen_addr = %listen_addr, "failed to bind metrics listener");
            return;
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "metrics server exited");
    }
}

async fn run_once(config_path: Option<PathBuf>, dry_run: bool) -> ExitCode {
    let config = match load_config(config_path) {
        Ok(c) => c,
        Err(code) => return code,
    };
    let components = match build_components(config) {
        Ok(c) => c,
        Err(code) => return code,
    };

    let _ = components.yield_feed.poll_once().await;
    let _ = components.price_feed.poll_once().await;
    components.aggregator.recompute();

    let snapshot = components.aggregator.current_snapshot();
    let signal_agent = SignalAgent::new(components.config_signal());
    let strategy_agent = StrategyAgent::new(components.config_strategy());
    let voting = VotingCoordinator::new(components.config_voting());

    let gas_prices = components.chain_registry.chain_ids().map(|id| (id, 0u64)).collect();
    let signals = signal_agent.detect_all(&snapshot, &gas_prices, &components.chain_registry, &[]);
    let candidates = strategy_agent.propose(&snapshot, &signals);
    let decision = voting.decide(&signals, &candidates, Utc::now());

    println!("{}", serde_json::to_string_pretty(&decision).unwrap_or_default());

    if !dry_run && decision.action != betterbot_backend::model::DecisionAction::Hold {
        match components.orchestrator.submit_decision(&decision).await {
            Ok(outcome) => {
                for id in &outcome.message_ids {
                    if let Some(message) = components.orchestrator.get_message(id) {
                        let _ = components.history.append(HistoryRecord::Message {
                            recorded_at: Utc::now(),
                            message,
                        });
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "orchestrator rejected decision");
            }
        }
    }

    let _ = components.history.append(HistoryRecord::Decision {
        recorded_at: Utc::now(),
        decision,
    });

    ExitCode::SUCCESS
}

fn run_explain(config_path: Option<PathBuf>, id: &str) -> ExitCode {
    let config = match load_config(config_path) {
        Ok(c) => c,
        Err(code) => return code,
    };
    let history = match HistoryStore::open(&config.history_path, config.history_capacity) {
        Ok(h) => h,
        Err(e) => {
            error!(error = %e, "failed to open history store");
            return ExitCode::from(4);
        }
    };

    if let Some(decision) = history.find_decision(id) {
        println!("decision {} reached {}", decision.id, decision.reached_at);
        println!("action: {:?}", decision.action);
        println!("confidence_ppm: {}  consensus_ppm: {}", decision.confidence_ppm, decision.consensus_ppm);
        println!("reasoning:");
        for line in &decision.reasoning {
            println!("  - {line}");
        }
        if !decision.steps.is_empty() {
            println!("steps:");
            println!("{}", serde_json::to_string_pretty(&decision.steps).unwrap_or_default());
        }
        return ExitCode::SUCCESS;
    }

    match history.find_message(id) {
        Some(message) => {
            println!("{}", serde_json::to_string_pretty(&message).unwrap_or_default());
            ExitCode::SUCCESS
        }
        None => {
            eprintln!("no history record found for id {id}");
            ExitCode::from(4)
        }
    }
}

impl Components {
    fn config_signal(&self) -> betterbot_backend::config::SignalConfig {
        self.config.signal.clone()
    }
    fn config_strategy(&self) -> betterbot_backend::config::StrategyConfig {
        self.config.strategy.clone()
    }
    fn config_voting(&self) -> betterbot_backend::config::VotingConfig {
        self.config.voting.clone()
    }
}
