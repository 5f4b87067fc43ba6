//! Configuration management for the momentum rebalancer.
//!
//! Loads settings from an optional `config.toml` and `SWAPMOM__*` environment variables.

use crate::exchange::{MarginMode, RetryPolicy};
use crate::strategy::{ReverseWindow, ScoringPolicy};
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Exchange API credentials and account mode
    #[serde(default)]
    pub exchange: ExchangeConfig,
    /// Universe, selection sizes and scoring
    #[serde(default)]
    pub strategy: StrategyConfig,
    /// Candle fetch parameters
    #[serde(default)]
    pub market_data: MarketDataConfig,
    /// Cycle cadence
    #[serde(default)]
    pub schedule: ScheduleConfig,
    /// Order and retry parameters
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Cycle journal location
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// API key for authentication
    #[serde(default)]
    pub api_key: String,
    /// Secret key for signing requests
    #[serde(default)]
    pub secret_key: String,
    /// Use testnet instead of production
    #[serde(default = "default_sandbox")]
    pub sandbox: bool,
    /// Account holds long and short positions per instrument independently
    #[serde(default = "default_hedge_mode")]
    pub hedge_mode: bool,
    #[serde(default = "default_recv_window_ms")]
    pub recv_window_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Exchange-native symbols to trade
    #[serde(default = "default_universe")]
    pub universe: Vec<String>,
    /// Notional per selected instrument, in quote currency
    #[serde(default = "default_target_notional")]
    pub target_notional_per_leg: Decimal,
    /// Number of top-ranked instruments held long
    #[serde(default = "default_long_n")]
    pub long_n: usize,
    /// Number of bottom-ranked instruments held short
    #[serde(default = "default_short_n")]
    pub short_n: usize,
    #[serde(default)]
    pub scoring: ScoringPolicy,
    /// Largest allowed single-bar absolute return before a series is rejected
    #[serde(default = "default_max_bar_move")]
    pub max_bar_move: f64,
    /// Weekly window during which long and short assignments are swapped
    #[serde(default)]
    pub reverse_window: ReverseWindow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDataConfig {
    #[serde(default = "default_candle_timeframe")]
    pub candle_timeframe: String,
    /// Bars requested per instrument
    #[serde(default = "default_lookback_bars")]
    pub lookback_bars: usize,
    /// Per-instrument candle fetch timeout
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Minimum time between successful cycles
    #[serde(default = "default_rebalance_interval_secs")]
    pub rebalance_interval_secs: u64,
    /// How often the scheduler checks whether a cycle is due
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Maximum age of instrument metadata before a refresh
    #[serde(default = "default_instrument_refresh_secs")]
    pub instrument_refresh_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Leverage set on every instrument before opening
    #[serde(default = "default_max_leverage")]
    pub max_leverage: u8,
    #[serde(default = "default_margin_mode")]
    pub margin_mode: MarginMode,
    /// Attempts for idempotent reads, including the first
    #[serde(default = "default_max_read_attempts")]
    pub max_read_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_journal_path")]
    pub journal_path: PathBuf,
}

// Default value functions
fn default_sandbox() -> bool {
    true
}

fn default_hedge_mode() -> bool {
    true
}

fn default_recv_window_ms() -> u64 {
    5000
}

fn default_universe() -> Vec<String> {
    [
        "BTCUSDT", "ETHUSDT", "SOLUSDT", "BNBUSDT", "DOGEUSDT", "XRPUSDT", "TONUSDT", "ADAUSDT",
        "AVAXUSDT", "WLDUSDT",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_target_notional() -> Decimal {
    Decimal::new(200, 0) // 200 USDT per leg
}

fn default_long_n() -> usize {
    2
}

fn default_short_n() -> usize {
    2
}

fn default_max_bar_move() -> f64 {
    0.5 // 50% in one bar is treated as bad data
}

fn default_candle_timeframe() -> String {
    "1h".to_string()
}

fn default_lookback_bars() -> usize {
    200
}

fn default_fetch_timeout_secs() -> u64 {
    15
}

fn default_rebalance_interval_secs() -> u64 {
    4 * 60 * 60
}

fn default_tick_secs() -> u64 {
    60
}

fn default_instrument_refresh_secs() -> u64 {
    24 * 60 * 60
}

fn default_max_leverage() -> u8 {
    20
}

fn default_margin_mode() -> MarginMode {
    MarginMode::Cross
}

fn default_max_read_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    8000
}

fn default_journal_path() -> PathBuf {
    PathBuf::from("data/cycles.db")
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .prefix("SWAPMOM")
                    .list_separator(",")
                    .with_list_parse_key("strategy.universe")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        let strategy = &self.strategy;

        anyhow::ensure!(
            strategy.target_notional_per_leg > Decimal::ZERO,
            "target_notional_per_leg must be positive"
        );

        anyhow::ensure!(
            strategy.long_n + strategy.short_n > 0,
            "long_n + short_n must be at least 1"
        );

        anyhow::ensure!(!strategy.universe.is_empty(), "universe must not be empty");

        anyhow::ensure!(
            self.market_data.lookback_bars >= strategy.scoring.min_history(),
            "lookback_bars ({}) is below the {:?} policy's minimum history ({})",
            self.market_data.lookback_bars,
            strategy.scoring,
            strategy.scoring.min_history()
        );

        anyhow::ensure!(
            strategy.max_bar_move > 0.0 && strategy.max_bar_move <= 1.0,
            "max_bar_move must be in (0, 1]"
        );

        anyhow::ensure!(
            strategy.reverse_window.start_hour < 24 && strategy.reverse_window.end_hour < 24,
            "reverse_window hours must be below 24"
        );

        anyhow::ensure!(
            self.schedule.rebalance_interval_secs > 0 && self.schedule.tick_secs > 0,
            "rebalance_interval_secs and tick_secs must be positive"
        );

        anyhow::ensure!(
            (1..=125).contains(&self.execution.max_leverage),
            "max_leverage must be between 1 and 125"
        );

        Ok(())
    }
}

impl ScheduleConfig {
    pub fn rebalance_interval(&self) -> Duration {
        Duration::from_secs(self.rebalance_interval_secs)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn instrument_refresh(&self) -> Duration {
        Duration::from_secs(self.instrument_refresh_secs)
    }
}

impl ExecutionConfig {
    /// Backoff schedule for idempotent reads.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_read_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            secret_key: String::new(),
            sandbox: default_sandbox(),
            hedge_mode: default_hedge_mode(),
            recv_window_ms: default_recv_window_ms(),
        }
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            universe: default_universe(),
            target_notional_per_leg: default_target_notional(),
            long_n: default_long_n(),
            short_n: default_short_n(),
            scoring: ScoringPolicy::default(),
            max_bar_move: default_max_bar_move(),
            reverse_window: ReverseWindow::default(),
        }
    }
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            candle_timeframe: default_candle_timeframe(),
            lookback_bars: default_lookback_bars(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            rebalance_interval_secs: default_rebalance_interval_secs(),
            tick_secs: default_tick_secs(),
            instrument_refresh_secs: default_instrument_refresh_secs(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_leverage: default_max_leverage(),
            margin_mode: default_margin_mode(),
            max_read_attempts: default_max_read_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            journal_path: default_journal_path(),
        }
    }
}
