//! Configuration loading and validation.
//!
//! Configuration comes from a TOML file matching the sections below;
//! secrets (API key, store URL) can be overridden from the environment so
//! they stay out of committed config files.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::domain::filter::FilterThresholds;
use crate::domain::position::SellConditions;

/// Wrapped native mint used as the quote side of most pools.
pub const DEFAULT_NATIVE_QUOTE: &str = "So11111111111111111111111111111111111111112";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation failed: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub monitoring: MonitoringSection,
    pub filter: FilterSection,
    pub risk: RiskSection,
    pub trading: TradingSection,
    #[serde(default)]
    pub tokens: TokensSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub simulation: SimulationSection,
}

/// Event/RPC connection.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiSection {
    /// Engine API service base URL (events, swaps, predictions, oracle).
    pub server_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Bind address for the dashboard WebSocket broadcast; unset
    /// disables it.
    #[serde(default)]
    pub dashboard_bind: Option<String>,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:3000".to_string(),
            api_key: None,
            dashboard_bind: None,
        }
    }
}

impl ApiSection {
    /// API key with environment override (`HIVEMIND_API_KEY`).
    pub fn get_api_key(&self) -> Option<String> {
        std::env::var("HIVEMIND_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .or_else(|| self.api_key.clone().filter(|k| !k.is_empty()))
    }
}

/// Position/cache store connection.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreSection {
    /// `redis://...`; when unset the engine runs on the in-memory store.
    #[serde(default)]
    pub url: Option<String>,
}

impl StoreSection {
    /// Store URL with environment override (`HIVEMIND_STORE_URL`).
    pub fn get_url(&self) -> Option<String> {
        std::env::var("HIVEMIND_STORE_URL")
            .ok()
            .filter(|u| !u.is_empty())
            .or_else(|| self.url.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringSection {
    /// `all` follows the firehose, `subscribed` only the listed actors.
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub actors: Vec<String>,
}

fn default_mode() -> String {
    "all".to_string()
}

impl Default for MonitoringSection {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            actors: Vec::new(),
        }
    }
}

/// Mindmap filter thresholds.
#[derive(Debug, Clone, Deserialize)]
pub struct FilterSection {
    pub min_trade_volume: f64,
    pub min_connected_actors: usize,
    /// Quality floor in [0, 100].
    pub min_influence_score: f64,
    pub min_total_trades: u64,
    #[serde(default)]
    pub min_viral_velocity: Option<u32>,
    #[serde(default)]
    pub require_smart_money: bool,
    #[serde(default)]
    pub min_consensus_score: Option<f64>,
    #[serde(default)]
    pub min_market_cap_usd: Option<f64>,
    #[serde(default)]
    pub min_liquidity_usd: Option<f64>,
}

/// Exit rules applied to every new position.
#[derive(Debug, Clone, Deserialize)]
pub struct RiskSection {
    /// Take profit percentage in [1, 1000].
    pub take_profit_pct: f64,
    /// Stop loss percentage in [1, 100].
    pub stop_loss_pct: f64,
    #[serde(default)]
    pub trailing_stop_pct: Option<f64>,
    #[serde(default)]
    pub trailing_stop_enabled: bool,
    #[serde(default)]
    pub max_hold_minutes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradingSection {
    /// Quote-asset amount spent per buy.
    pub buy_amount: f64,
    #[serde(default)]
    pub allow_additional_entries: bool,
    #[serde(default)]
    pub max_entries_per_token: Option<u32>,
    /// Slippage tolerance in basis points.
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: u16,
    /// Fingerprint agent id for duplicate prevention.
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
}

fn default_slippage_bps() -> u16 {
    100
}

fn default_agent_id() -> String {
    "hivemind".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokensSection {
    /// The wrapped native quote asset; the engine never opens a position
    /// in it.
    #[serde(default = "default_native_quote")]
    pub native_quote_mint: String,
}

fn default_native_quote() -> String {
    DEFAULT_NATIVE_QUOTE.to_string()
}

impl Default for TokensSection {
    fn default() -> Self {
        Self {
            native_quote_mint: default_native_quote(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    /// `debug`, `info`, `warn` or `error`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimulationSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_initial_balance")]
    pub initial_balance: f64,
}

fn default_initial_balance() -> f64 {
    100.0
}

impl Default for SimulationSection {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_balance: default_initial_balance(),
        }
    }
}

/// Load configuration from a TOML file and validate it.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.risk.take_profit_pct < 1.0 || self.risk.take_profit_pct > 1000.0 {
            return Err(ConfigError::Validation(format!(
                "take_profit_pct must be in [1, 1000], got {}",
                self.risk.take_profit_pct
            )));
        }
        if self.risk.stop_loss_pct < 1.0 || self.risk.stop_loss_pct > 100.0 {
            return Err(ConfigError::Validation(format!(
                "stop_loss_pct must be in [1, 100], got {}",
                self.risk.stop_loss_pct
            )));
        }
        if let Some(trailing) = self.risk.trailing_stop_pct {
            if trailing <= 0.0 || trailing >= 100.0 {
                return Err(ConfigError::Validation(format!(
                    "trailing_stop_pct must be in (0, 100), got {trailing}"
                )));
            }
        }
        if self.risk.trailing_stop_enabled && self.risk.trailing_stop_pct.is_none() {
            return Err(ConfigError::Validation(
                "trailing_stop_enabled requires trailing_stop_pct".to_string(),
            ));
        }

        if self.trading.buy_amount <= 0.0 {
            return Err(ConfigError::Validation(format!(
                "buy_amount must be > 0, got {}",
                self.trading.buy_amount
            )));
        }
        if self.trading.slippage_bps > 10_000 {
            return Err(ConfigError::Validation(format!(
                "slippage_bps cannot exceed 10000, got {}",
                self.trading.slippage_bps
            )));
        }

        if self.filter.min_influence_score < 0.0 || self.filter.min_influence_score > 100.0 {
            return Err(ConfigError::Validation(format!(
                "min_influence_score must be in [0, 100], got {}",
                self.filter.min_influence_score
            )));
        }
        if self.filter.min_trade_volume < 0.0 {
            return Err(ConfigError::Validation(
                "min_trade_volume cannot be negative".to_string(),
            ));
        }
        if let Some(consensus) = self.filter.min_consensus_score {
            if !(0.0..=100.0).contains(&consensus) {
                return Err(ConfigError::Validation(format!(
                    "min_consensus_score must be in [0, 100], got {consensus}"
                )));
            }
        }

        match self.monitoring.mode.as_str() {
            "all" => {}
            "subscribed" => {
                if self.monitoring.actors.is_empty() {
                    return Err(ConfigError::Validation(
                        "monitoring.mode = \"subscribed\" requires a non-empty actor list"
                            .to_string(),
                    ));
                }
            }
            other => {
                return Err(ConfigError::Validation(format!(
                    "monitoring.mode must be \"all\" or \"subscribed\", got \"{other}\""
                )));
            }
        }

        match self.logging.level.as_str() {
            "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ConfigError::Validation(format!(
                    "logging.level must be one of debug/info/warn/error, got \"{other}\""
                )));
            }
        }

        if self.simulation.enabled && self.simulation.initial_balance <= 0.0 {
            return Err(ConfigError::Validation(format!(
                "simulation.initial_balance must be > 0, got {}",
                self.simulation.initial_balance
            )));
        }

        Ok(())
    }

    /// Thresholds for the mindmap filter engine.
    pub fn filter_thresholds(&self) -> FilterThresholds {
        FilterThresholds {
            min_trade_volume: self.filter.min_trade_volume,
            min_connected_actors: self.filter.min_connected_actors,
            min_influence_score: self.filter.min_influence_score,
            min_total_trades: self.filter.min_total_trades,
            min_viral_velocity: self.filter.min_viral_velocity,
            require_smart_money: self.filter.require_smart_money,
            min_consensus_score: self.filter.min_consensus_score,
            min_market_cap_usd: self.filter.min_market_cap_usd,
            min_liquidity_usd: self.filter.min_liquidity_usd,
            native_quote_mint: self.tokens.native_quote_mint.clone(),
        }
    }

    /// Exit rules stamped onto every new position.
    pub fn sell_conditions(&self) -> SellConditions {
        SellConditions {
            take_profit_pct: Some(self.risk.take_profit_pct),
            stop_loss_pct: Some(self.risk.stop_loss_pct),
            trailing_stop_pct: if self.risk.trailing_stop_enabled {
                self.risk.trailing_stop_pct
            } else {
                None
            },
            max_hold_minutes: self.risk.max_hold_minutes,
            ..Default::default()
        }
    }
}

impl Default for Config {
    /// Paper-trading defaults used by tests and `run --paper` without a
    /// config file.
    fn default() -> Self {
        Self {
            api: ApiSection::default(),
            store: StoreSection::default(),
            monitoring: MonitoringSection::default(),
            filter: FilterSection {
                min_trade_volume: 10_000.0,
                min_connected_actors: 5,
                min_influence_score: 50.0,
                min_total_trades: 10,
                min_viral_velocity: Some(3),
                require_smart_money: false,
                min_consensus_score: None,
                min_market_cap_usd: None,
                min_liquidity_usd: None,
            },
            risk: RiskSection {
                take_profit_pct: 50.0,
                stop_loss_pct: 20.0,
                trailing_stop_pct: Some(10.0),
                trailing_stop_enabled: true,
                max_hold_minutes: Some(240),
            },
            trading: TradingSection {
                buy_amount: 0.5,
                allow_additional_entries: false,
                max_entries_per_token: None,
                slippage_bps: default_slippage_bps(),
                agent_id: default_agent_id(),
            },
            tokens: TokensSection::default(),
            logging: LoggingSection::default(),
            simulation: SimulationSection {
                enabled: true,
                initial_balance: default_initial_balance(),
            },
        }
    }
}
