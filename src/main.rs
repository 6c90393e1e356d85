//! hivemind - autonomous mindmap-driven token trading engine.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use hivemind::adapters::{
    HttpPredictionService, HttpPriceOracle, HttpSwapBackend, WsEventStream, WsStreamConfig,
};
use hivemind::application::{Engine, Ports};
use hivemind::config::{load_config, Config};
use hivemind::store::{KeyValueStore, MemoryStore, PositionStore, RedisStore};

/// Autonomous mindmap-driven token trading engine
#[derive(Parser, Debug)]
#[command(
    name = "hivemind",
    version = env!("CARGO_PKG_VERSION"),
    about = "Autonomous mindmap-driven token trading engine",
    long_about = "hivemind watches the mindmaps of tracked actors, admits tokens \
                  through a filter and prediction pipeline, and manages every \
                  position to exit with stepped trailing stops."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the engine
    Run(RunCmd),
    /// Validate the configuration and store connectivity
    Verify(VerifyCmd),
    /// Clear simulated positions and reset the paper ledger state
    ResetPaper(ResetPaperCmd),
}

#[derive(Parser, Debug)]
struct RunCmd {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", default_value = "config/hivemind.toml")]
    config: PathBuf,

    /// Force paper trading regardless of the config
    #[arg(short, long)]
    paper: bool,
}

#[derive(Parser, Debug)]
struct VerifyCmd {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", default_value = "config/hivemind.toml")]
    config: PathBuf,
}

#[derive(Parser, Debug)]
struct ResetPaperCmd {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", default_value = "config/hivemind.toml")]
    config: PathBuf,

    /// Skip the confirmation prompt
    #[arg(short = 'y', long)]
    yes: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Secrets live in .env, not in the committed config.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(cmd) => run_command(cmd, cli.debug).await,
        Command::Verify(cmd) => verify_command(cmd, cli.debug).await,
        Command::ResetPaper(cmd) => reset_paper_command(cmd, cli.debug).await,
    }
}

fn init_logging(level: &str, debug: bool) {
    let default = if debug { "debug" } else { level };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default.to_string()));
    fmt().with_env_filter(filter).init();
}

/// The streaming endpoint lives next to the HTTP API.
fn stream_url(server_url: &str) -> String {
    let ws = if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        server_url.to_string()
    };
    format!("{}/stream", ws.trim_end_matches('/'))
}

async fn connect_store(config: &Config) -> Result<Arc<dyn KeyValueStore>> {
    match config.store.get_url() {
        Some(url) => {
            info!(url = %url, "connecting to store");
            let store = RedisStore::connect(&url)
                .await
                .context("failed to connect to store")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("no store.url configured, running on the in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

fn build_ports(config: &Config) -> Result<Ports> {
    let api_key = config.api.get_api_key();
    let base = config.api.server_url.trim_end_matches('/').to_string();

    let stream = WsEventStream::new(WsStreamConfig::new(
        stream_url(&config.api.server_url),
        api_key.clone(),
    ));
    let oracle = HttpPriceOracle::new(base.clone(), api_key.clone())
        .context("failed to build oracle client")?;
    let prediction = HttpPredictionService::new(base.clone(), api_key.clone())
        .context("failed to build prediction client")?;
    let swap =
        HttpSwapBackend::new(base, api_key).context("failed to build swap client")?;

    Ok(Ports {
        stream: Arc::new(stream),
        oracle: Arc::new(oracle),
        prediction: Arc::new(prediction),
        swap: Arc::new(swap),
    })
}

async fn run_command(cmd: RunCmd, debug: bool) -> Result<()> {
    let mut config = load_config(&cmd.config).context("failed to load configuration")?;
    if cmd.paper {
        config.simulation.enabled = true;
    }
    init_logging(&config.logging.level, debug);

    info!("starting hivemind");
    info!("  config: {}", cmd.config.display());
    info!("  mode: {}", if config.simulation.enabled { "paper" } else { "live" });
    info!("  monitoring: {}", config.monitoring.mode);
    if config.simulation.enabled {
        warn!("PAPER TRADING MODE - no real transactions");
    }

    let store = connect_store(&config).await?;
    let ports = build_ports(&config)?;

    let engine = Engine::start(&config, ports, store)
        .await
        .context("failed to start engine")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for interrupt")?;
    info!("interrupt received, shutting down");
    engine.stop().await;

    Ok(())
}

async fn verify_command(cmd: VerifyCmd, debug: bool) -> Result<()> {
    let config = load_config(&cmd.config).context("configuration invalid")?;
    init_logging(&config.logging.level, debug);

    println!("configuration OK: {}", cmd.config.display());
    println!("  api: {}", config.api.server_url);
    println!(
        "  store: {}",
        config.store.get_url().as_deref().unwrap_or("(in-memory)")
    );
    println!("  monitoring: {}", config.monitoring.mode);
    println!(
        "  risk: tp {}% / sl {}% / trail {:?}",
        config.risk.take_profit_pct, config.risk.stop_loss_pct, config.risk.trailing_stop_pct
    );

    if let Some(url) = config.store.get_url() {
        RedisStore::connect(&url)
            .await
            .context("store unreachable")?;
        println!("store connection OK");
    }

    Ok(())
}

async fn reset_paper_command(cmd: ResetPaperCmd, debug: bool) -> Result<()> {
    let config = load_config(&cmd.config).context("failed to load configuration")?;
    init_logging(&config.logging.level, debug);

    if !cmd.yes {
        println!("This clears every stored position record. Type 'RESET' to confirm: ");
        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if input.trim() != "RESET" {
            println!("aborted");
            return Ok(());
        }
    }

    let store = connect_store(&config).await?;
    let positions = PositionStore::new(store);
    positions
        .clear_all()
        .await
        .context("failed to clear positions")?;

    println!("paper trading state cleared");
    Ok(())
}
