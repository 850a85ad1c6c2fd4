use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use voxbot_core::agent::adapter::{AgentAdapter, LlmClient};
use voxbot_core::catalog::Catalog;
use voxbot_core::config::{Config, ConfigLoader};
use voxbot_core::fleet::FleetOrchestrator;
use voxbot_core::llm::{OllamaClient, OllamaConfig};
use voxbot_core::metrics::MetricsRegistry;
use voxbot_core::sim::SimAdapter;
use voxbot_core::store::{MemoryStore, SqliteStore, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults from environment variables, then `--flag value` overrides.
    let mut config_path = std::env::var("VOXBOT_CONFIG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "voxbot.toml".to_string());
    let mut log_filter = std::env::var("VOXBOT_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "info".to_string());
    let mut bot_count_override: Option<u32> = None;

    apply_runner_cli_overrides(
        std::env::args().skip(1),
        &mut config_path,
        &mut log_filter,
        &mut bot_count_override,
    )?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&log_filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let mut config = match ConfigLoader::parse_from_file(&config_path) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(path = %config_path, error = %format!("{err:#}"), "runner.config_default");
            Config::default()
        }
    };
    if let Some(bots) = bot_count_override {
        config.fleet.bot_count = bots;
    }
    config.clamp();
    let config = Arc::new(config);

    let store: Arc<dyn Store> = if config.store.db_path.is_empty() {
        tracing::info!("runner.store mode=memory");
        Arc::new(MemoryStore::new())
    } else {
        tracing::info!(path = %config.store.db_path, "runner.store mode=sqlite");
        Arc::new(SqliteStore::open(config.store.db_path.clone().into()).await?)
    };

    let catalog = Arc::new(Catalog::builtin());
    let metrics = Arc::new(MetricsRegistry::new());
    let llm: Arc<dyn LlmClient> = Arc::new(OllamaClient::new(OllamaConfig {
        endpoint: config.llm.endpoint.clone(),
        model: config.llm.model.clone(),
    }));

    // The game-client adapter is an integration concern; the built-in sim
    // world stands in so a fleet can be exercised end to end.
    let adapters: Vec<(String, Arc<dyn AgentAdapter>)> = (0..config.fleet.bot_count)
        .map(|i| {
            (
                format!("bot-{i}"),
                Arc::new(SimAdapter::with_default_world(Arc::clone(&catalog)))
                    as Arc<dyn AgentAdapter>,
            )
        })
        .collect();

    let mut fleet = FleetOrchestrator::new(
        Arc::clone(&config),
        catalog,
        llm,
        Arc::clone(&store),
        Arc::clone(&metrics),
    );
    fleet.spawn(adapters).await?;
    tracing::info!(bots = config.fleet.bot_count, "runner.fleet_up");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    tracing::info!("runner.shutdown_requested");
    fleet.stop().await;
    tracing::info!(metrics = %metrics.to_json(), "runner.final_metrics");
    Ok(())
}

fn apply_runner_cli_overrides(
    args: impl IntoIterator<Item = String>,
    config_path: &mut String,
    log_filter: &mut String,
    bot_count: &mut Option<u32>,
) -> anyhow::Result<()> {
    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        if !arg.starts_with("--") {
            eprintln!("Unexpected positional argument: {}", arg);
            continue;
        }

        let flag = arg.trim_start_matches("--");
        let Some(val) = it.next() else {
            anyhow::bail!("Expected value after flag: --{flag}");
        };

        match flag {
            "config" => *config_path = val,
            "log-filter" => *log_filter = val,
            "bots" => {
                *bot_count = Some(
                    val.parse()
                        .with_context(|| format!("bots must be a number, got: {val}"))?,
                );
            }
            _ => eprintln!("Unknown flag: --{}", flag),
        }
    }

    Ok(())
}
