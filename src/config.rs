use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub exchange: ExchangeConfig,
    /// Spot instruments the agent may trade (e.g. "BTC-USDT")
    pub pairs: Vec<String>,
    pub risk: RiskConfig,
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    /// REST API endpoint for order execution
    pub rest_url: String,
    /// Public WebSocket endpoint for tickers
    pub ws_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub passphrase: String,
    /// Send the demo-trading header on every request
    #[serde(default)]
    pub simulated: bool,
    /// Route orders to the in-memory paper exchange instead of the venue
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

fn default_request_timeout() -> u64 {
    10_000
}

/// What happens once the hard drawdown limit has tripped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltPolicy {
    /// Stays halted until an operator runs `reset-halt`
    Sticky,
    /// Lifts once drawdown is back at or below the soft threshold
    AutoResume,
}

impl Default for HaltPolicy {
    fn default() -> Self {
        Self::Sticky
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    /// Balance assumed on a cold start before the first refresh
    pub starting_balance: Decimal,
    /// Fraction of balance risked between entry and stop (e.g., 0.05 = 5%)
    pub max_risk_per_trade: Decimal,
    /// Ceiling on position notional as a fraction of balance
    pub max_position_size: Decimal,
    /// Daily realized loss, as a fraction of the window's opening balance, that stops entries
    pub daily_loss_cap: Decimal,
    /// Drawdown from peak above which size is reduced
    pub soft_drawdown: Decimal,
    /// Drawdown from peak at which new entries halt
    pub hard_drawdown: Decimal,
    /// Size multiplier applied beyond the soft drawdown
    #[serde(default = "default_drawdown_multiplier")]
    pub drawdown_size_multiplier: Decimal,
    #[serde(default)]
    pub halt_policy: HaltPolicy,
    /// Maximum spread relative to mid (e.g., 0.001 = 0.1%)
    pub max_spread: Decimal,
    /// Maximum order notional as a fraction of 24h traded volume
    #[serde(default = "default_participation")]
    pub max_volume_participation: Decimal,
    /// Minimum 24h quote volume for a pair to be tradeable
    #[serde(default)]
    pub min_24h_volume: Decimal,
    #[serde(default = "default_daily_window_hours")]
    pub daily_window_hours: i64,
}

fn default_drawdown_multiplier() -> Decimal {
    Decimal::new(5, 1)
}

fn default_participation() -> Decimal {
    Decimal::new(1, 2)
}

fn default_daily_window_hours() -> i64 {
    24
}

/// Delay schedule between retries of a transient failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

impl Default for BackoffKind {
    fn default() -> Self {
        Self::Exponential
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Maximum attempts per exchange call, first try included
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,
    #[serde(default)]
    pub backoff: BackoffKind,
    /// Use slippage-bounded limit orders instead of market orders
    #[serde(default = "default_true")]
    pub use_limit_orders: bool,
    pub max_slippage: Decimal,
    pub taker_fee: Decimal,
    /// Take-profit distance from entry (e.g., 0.15 = 15%)
    pub profit_target: Decimal,
    /// Stop distance from entry (e.g., 0.05 = 5%)
    pub stop_loss: Decimal,
}

fn default_retry_base_delay() -> u64 {
    500
}

fn default_retry_max_delay() -> u64 {
    8_000
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub ping_interval_secs: u64,
    /// Silence longer than this is treated as a dead connection
    pub stale_after_secs: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            max_reconnect_attempts: 10,
            ping_interval_secs: 20,
            stale_after_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/spotkeeper_state.json"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconciliationConfig {
    /// Absolute quantity difference tolerated between local and exchange position
    pub position_tolerance_abs: Decimal,
    /// Relative quantity difference tolerated (fraction of local quantity)
    pub position_tolerance_pct: Decimal,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            position_tolerance_abs: Decimal::new(1, 8),
            position_tolerance_pct: Decimal::new(2, 3),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Periodic exit check interval
    pub tick_interval_ms: u64,
    pub balance_refresh_secs: u64,
    pub shutdown_timeout_secs: u64,
    /// Bind address for the `/health` endpoint; disabled when unset
    #[serde(default)]
    pub health_addr: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            balance_refresh_secs: 60,
            shutdown_timeout_secs: 30,
            health_addr: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for daily rolling log files
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("execution.max_retries", 3)?
            .set_default("state.path", "data/spotkeeper_state.json")?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Environment-specific overrides (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("SPOTKEEPER_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // SPOTKEEPER_RISK__DAILY_LOSS_CAP, SPOTKEEPER_EXCHANGE__API_KEY, ...
            .add_source(
                Environment::with_prefix("SPOTKEEPER")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("pairs"),
            );

        builder.build()?.try_deserialize()
    }

    /// Create a default configuration for CLI usage and tests
    pub fn default_config(dry_run: bool) -> Self {
        use rust_decimal_macros::dec;

        Self {
            exchange: ExchangeConfig {
                rest_url: "https://www.okx.com".to_string(),
                ws_url: "wss://ws.okx.com:8443/ws/v5/public".to_string(),
                api_key: String::new(),
                secret_key: String::new(),
                passphrase: String::new(),
                simulated: false,
                dry_run,
                request_timeout_ms: 10_000,
            },
            pairs: vec!["BTC-USDT".to_string(), "ETH-USDT".to_string()],
            risk: RiskConfig {
                starting_balance: dec!(15),
                max_risk_per_trade: dec!(0.05),
                max_position_size: dec!(0.50),
                daily_loss_cap: dec!(0.10),
                soft_drawdown: dec!(0.10),
                hard_drawdown: dec!(0.20),
                drawdown_size_multiplier: dec!(0.5),
                halt_policy: HaltPolicy::Sticky,
                max_spread: dec!(0.001),
                max_volume_participation: dec!(0.01),
                min_24h_volume: dec!(1000000),
                daily_window_hours: 24,
            },
            execution: ExecutionConfig {
                max_retries: 3,
                retry_base_delay_ms: 500,
                retry_max_delay_ms: 8_000,
                backoff: BackoffKind::Exponential,
                use_limit_orders: true,
                max_slippage: dec!(0.002),
                taker_fee: dec!(0.001),
                profit_target: dec!(0.15),
                stop_loss: dec!(0.05),
            },
            feed: FeedConfig::default(),
            state: StateConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            runtime: RuntimeConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let fractions = [
            ("risk.max_risk_per_trade", self.risk.max_risk_per_trade),
            ("risk.max_position_size", self.risk.max_position_size),
            ("risk.daily_loss_cap", self.risk.daily_loss_cap),
            ("risk.soft_drawdown", self.risk.soft_drawdown),
            ("risk.hard_drawdown", self.risk.hard_drawdown),
            ("risk.drawdown_size_multiplier", self.risk.drawdown_size_multiplier),
            ("risk.max_spread", self.risk.max_spread),
            ("risk.max_volume_participation", self.risk.max_volume_participation),
            ("execution.stop_loss", self.execution.stop_loss),
        ];
        for (name, value) in fractions {
            if value <= Decimal::ZERO || value >= Decimal::ONE {
                errors.push(format!("{name} must be between 0 and 1, got {value}"));
            }
        }

        if self.risk.soft_drawdown >= self.risk.hard_drawdown {
            errors.push("risk.soft_drawdown must be below risk.hard_drawdown".to_string());
        }

        if self.risk.starting_balance <= Decimal::ZERO {
            errors.push("risk.starting_balance must be positive".to_string());
        }

        if self.risk.daily_window_hours <= 0 {
            errors.push("risk.daily_window_hours must be positive".to_string());
        }

        if self.execution.max_retries == 0 {
            errors.push("execution.max_retries must be at least 1".to_string());
        }

        if self.execution.profit_target <= Decimal::ZERO {
            errors.push("execution.profit_target must be positive".to_string());
        }

        if self.execution.max_slippage < Decimal::ZERO || self.execution.taker_fee < Decimal::ZERO {
            errors.push("execution.max_slippage and execution.taker_fee must not be negative".to_string());
        }

        if self.pairs.is_empty() {
            errors.push("pairs must list at least one instrument".to_string());
        }

        if !self.exchange.dry_run
            && (self.exchange.api_key.is_empty()
                || self.exchange.secret_key.is_empty()
                || self.exchange.passphrase.is_empty())
        {
            errors.push("exchange credentials are required unless exchange.dry_run is set".to_string());
        }

        if self.feed.max_reconnect_attempts == 0 {
            errors.push("feed.max_reconnect_attempts must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config_is_valid_in_dry_run() {
        let cfg = AppConfig::default_config(true);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_live_config_requires_credentials() {
        let cfg = AppConfig::default_config(false);
        let errors = cfg.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("credentials")));
    }

    #[test]
    fn test_drawdown_thresholds_must_be_ordered() {
        let mut cfg = AppConfig::default_config(true);
        cfg.risk.soft_drawdown = dec!(0.25);
        let errors = cfg.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("soft_drawdown")));
    }

    #[test]
    fn test_load_from_shipped_defaults() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("config");
        let cfg = AppConfig::load_from(dir).expect("shipped config should load");
        assert_eq!(cfg.risk.daily_loss_cap, dec!(0.10));
        assert_eq!(cfg.risk.halt_policy, HaltPolicy::Sticky);
        assert!(cfg.exchange.dry_run);
    }
}
