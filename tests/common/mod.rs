#![allow(dead_code)]

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use spotkeeper::config::AppConfig;
use spotkeeper::domain::{MarketConditions, OrderSide, TradeIntent};
use spotkeeper::exchange::{ExchangeGateway, PaperExchange, RetryPolicy};
use spotkeeper::persistence::{JsonFileStore, SnapshotStore};
use spotkeeper::strategy::{
    LifecycleSettings, OrderLifecycleManager, PriceCache, RiskGovernor, SizingParams,
};
use std::path::PathBuf;
use std::sync::Arc;

pub const PAIR: &str = "BTC-USDT";

pub fn config() -> AppConfig {
    let mut config = AppConfig::default_config(true);
    config.pairs = vec![PAIR.to_string()];
    config.execution.taker_fee = Decimal::ZERO;
    config
}

pub fn temp_state_path() -> PathBuf {
    std::env::temp_dir()
        .join(format!("spotkeeper-it-{}", uuid::Uuid::new_v4()))
        .join("state.json")
}

pub fn market(last: Decimal) -> MarketConditions {
    MarketConditions {
        pair: PAIR.to_string(),
        last,
        best_bid: Some(last - dec!(0.01)),
        best_ask: Some(last + dec!(0.01)),
        volume_24h: dec!(50000000),
        timestamp: Utc::now(),
    }
}

pub fn open_intent(price: Decimal) -> TradeIntent {
    TradeIntent::open(PAIR, OrderSide::Buy, price)
}

/// One process lifetime: a fresh manager over a shared exchange and store
pub async fn start(
    config: &AppConfig,
    paper: Arc<PaperExchange>,
    store: Arc<dyn SnapshotStore>,
    last: Option<Decimal>,
) -> Arc<OrderLifecycleManager> {
    start_with_attempts(config, paper, store, last, 3).await
}

pub async fn start_with_attempts(
    config: &AppConfig,
    paper: Arc<PaperExchange>,
    store: Arc<dyn SnapshotStore>,
    last: Option<Decimal>,
    attempts: u32,
) -> Arc<OrderLifecycleManager> {
    let prices = PriceCache::new();
    if let Some(last) = last {
        prices.update(market(last)).await;
    }
    let governor = RiskGovernor::new(
        config.risk.clone(),
        SizingParams {
            stop_loss: config.execution.stop_loss,
            taker_fee: config.execution.taker_fee,
        },
    );
    Arc::new(OrderLifecycleManager::new(
        ExchangeGateway::new(paper, RetryPolicy::immediate(attempts)),
        store,
        governor,
        prices,
        LifecycleSettings::from_config(config),
    ))
}

pub fn file_store(path: &PathBuf) -> Arc<dyn SnapshotStore> {
    Arc::new(JsonFileStore::new(path))
}

pub fn paper(balance: Decimal) -> Arc<PaperExchange> {
    Arc::new(PaperExchange::new(balance, "USDT"))
}
