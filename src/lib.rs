pub mod adapters;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod persistence;
pub mod signing;
pub mod strategy;

pub use config::AppConfig;
pub use coordination::{GracefulShutdown, ShutdownSignal, ShutdownToken};
pub use error::{KeeperError, Result, RiskVeto};
pub use exchange::{ExchangeClient, ExchangeGateway, PaperExchange, RetryPolicy};
pub use persistence::{JsonFileStore, MemoryStore, PersistedSnapshot, SnapshotStore};
pub use strategy::{OrderLifecycleManager, ReconciliationReport, RiskGovernor};
