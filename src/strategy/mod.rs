//! Order lifecycle, risk and recovery
//!
//! - `transition` - order state machine and its effect on position and balance
//! - `risk` - position sizing and the drawdown / daily-loss governor
//! - `lifecycle` - the single-writer manager that submits and tracks orders
//! - `reconciliation` - startup resolution of persisted state against the exchange
//! - `feeds` - last-price table and feed consumer
//! - `signal` - sources of trade intents

pub mod feeds;
pub mod lifecycle;
pub mod reconciliation;
pub mod risk;
pub mod signal;
pub mod transition;

pub use feeds::{FeedMessage, MarketFeedConsumer, PriceCache};
pub use lifecycle::{LifecycleSettings, OrderLifecycleManager};
pub use reconciliation::{
    account_equity, OrderResolution, PositionDiscrepancy, Reconciler, ReconciliationReport,
};
pub use risk::{RiskGovernor, SizingParams};
pub use signal::{ChannelSignalSource, JsonLinesSignalSource, SignalSource};
pub use transition::{apply_event, events_from_exchange, Applied, ExitParams, Ledger, Transition};
