use rust_decimal::Decimal;
use thiserror::Error;

/// Main error type for the trading agent
#[derive(Error, Debug)]
pub enum KeeperError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Transient exchange failure: {0}")]
    Transient(String),

    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    // Exchange rejected the request outright
    #[error("Permanent exchange failure: {0}")]
    Permanent(String),

    #[error("Duplicate client order id: {0}")]
    DuplicateOrder(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Lifecycle errors
    #[error("Busy: {0}")]
    Busy(String),

    #[error("Risk rejected: {0}")]
    RiskRejected(#[from] RiskVeto),

    #[error("No open position")]
    NoPosition,

    #[error("No live order")]
    NoLiveOrder,

    #[error("Shutting down, intent refused")]
    ShuttingDown,

    // Reconciliation errors
    #[error("Inconsistency: {0}")]
    Inconsistency(String),

    #[error("Reconciliation has not run yet")]
    NotReconciled,

    #[error("Reconciliation required before further action: {0}")]
    ReconciliationRequired(String),

    #[error("Trading halted: {0}")]
    Halted(String),

    // Market data errors
    #[error("Feed lost: {0}")]
    FeedLoss(String),

    #[error("Market data unavailable: {0}")]
    MarketDataUnavailable(String),

    // Durable state errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Signature error: {0}")]
    Signature(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for KeeperError
pub type Result<T> = std::result::Result<T, KeeperError>;

impl KeeperError {
    /// Whether a failed exchange call may be retried with the same client order id.
    pub fn is_transient(&self) -> bool {
        match self {
            KeeperError::Transient(_) | KeeperError::RateLimited(_) => true,
            KeeperError::WebSocket(_) => true,
            KeeperError::Http(e) => {
                if e.is_timeout() || e.is_connect() || e.is_request() {
                    return true;
                }
                match e.status() {
                    Some(status) => status.is_server_error() || status.as_u16() == 429,
                    None => false,
                }
            }
            _ => false,
        }
    }
}

/// Reason the risk governor refused to size an order.
///
/// A veto is a decision, not a failure: callers log it at info level.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RiskVeto {
    #[error("trading halted: {reason}")]
    Halted { reason: String },

    #[error("drawdown {drawdown} reached hard limit {limit}")]
    HardDrawdown { drawdown: Decimal, limit: Decimal },

    #[error("daily loss {loss_pct} reached cap {cap}")]
    DailyLossCap { loss_pct: Decimal, cap: Decimal },

    #[error("notional {notional} too large for 24h volume {volume}")]
    InsufficientLiquidity { notional: Decimal, volume: Decimal },

    #[error("spread {spread} exceeds max {max}")]
    SpreadTooWide { spread: Decimal, max: Decimal },

    #[error("no market data for {pair}")]
    NoMarketData { pair: String },

    #[error("balance {balance} too small to trade")]
    InsufficientBalance { balance: Decimal },

    #[error("sized quantity rounds to zero")]
    ZeroSize,
}
