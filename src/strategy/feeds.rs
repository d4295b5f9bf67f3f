//! Market feed consumer and last-price table.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::coordination::ShutdownToken;
use crate::domain::{MarketConditions, PriceUpdate};
use crate::strategy::lifecycle::OrderLifecycleManager;

/// Messages produced by a streaming market session
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Ticker(MarketConditions),
    /// Connection restored after a drop
    Reconnected,
    /// Reconnect attempts exhausted; no further messages will follow
    Lost(String),
}

/// Latest market conditions per pair, shared between the feed and the lifecycle manager
#[derive(Clone, Default)]
pub struct PriceCache {
    markets: Arc<RwLock<HashMap<String, MarketConditions>>>,
    feed_lost: Arc<AtomicBool>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a ticker, ignoring ones older than what we already hold
    pub async fn update(&self, market: MarketConditions) -> bool {
        let mut markets = self.markets.write().await;
        match markets.get(&market.pair) {
            Some(existing) if existing.timestamp > market.timestamp => {
                debug!(pair = %market.pair, "out-of-order ticker dropped");
                false
            }
            _ => {
                markets.insert(market.pair.clone(), market);
                true
            }
        }
    }

    pub async fn market(&self, pair: &str) -> Option<MarketConditions> {
        self.markets.read().await.get(pair).cloned()
    }

    pub async fn last(&self, pair: &str) -> Option<Decimal> {
        self.markets.read().await.get(pair).map(|m| m.last)
    }

    pub async fn last_update(&self, pair: &str) -> Option<DateTime<Utc>> {
        self.markets.read().await.get(pair).map(|m| m.timestamp)
    }

    pub async fn len(&self) -> usize {
        self.markets.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.markets.read().await.is_empty()
    }

    pub fn mark_feed_lost(&self) {
        self.feed_lost.store(true, Ordering::SeqCst);
    }

    pub fn mark_feed_live(&self) {
        self.feed_lost.store(false, Ordering::SeqCst);
    }

    /// True once the streaming session gave up; prices are only as fresh as polling makes them
    pub fn is_feed_lost(&self) -> bool {
        self.feed_lost.load(Ordering::SeqCst)
    }
}

/// Drives the price table from a feed and nudges the lifecycle manager on every update
pub struct MarketFeedConsumer {
    cache: PriceCache,
    manager: Arc<OrderLifecycleManager>,
    updates_tx: broadcast::Sender<PriceUpdate>,
}

impl MarketFeedConsumer {
    pub fn new(cache: PriceCache, manager: Arc<OrderLifecycleManager>) -> Self {
        let (updates_tx, _) = broadcast::channel(1024);
        Self {
            cache,
            manager,
            updates_tx,
        }
    }

    /// Price updates for the signal source
    pub fn subscribe(&self) -> broadcast::Receiver<PriceUpdate> {
        self.updates_tx.subscribe()
    }

    /// Consume until the feed ends or shutdown is requested
    pub async fn run(&self, mut feed: mpsc::Receiver<FeedMessage>, mut shutdown: ShutdownToken) {
        info!("market feed consumer started");
        loop {
            tokio::select! {
                _ = shutdown.wait_for_shutdown() => {
                    info!("market feed consumer stopping");
                    break;
                }
                msg = feed.recv() => {
                    let Some(msg) = msg else {
                        warn!("market feed channel closed");
                        self.cache.mark_feed_lost();
                        break;
                    };
                    if !self.handle(msg).await {
                        break;
                    }
                }
            }
        }
    }

    /// Returns false once the feed is gone for good
    pub async fn handle(&self, msg: FeedMessage) -> bool {
        match msg {
            FeedMessage::Ticker(market) => {
                let update = market.price_update();
                if !self.cache.update(market).await {
                    return true;
                }
                let _ = self.updates_tx.send(update);
                if let Err(e) = self.manager.tick().await {
                    warn!("exit check on price update failed: {}", e);
                }
                true
            }
            FeedMessage::Reconnected => {
                info!("market feed reconnected");
                self.cache.mark_feed_live();
                true
            }
            FeedMessage::Lost(reason) => {
                error!(reason = %reason, "market feed lost, new entries disabled");
                self.cache.mark_feed_lost();
                false
            }
        }
    }
}
