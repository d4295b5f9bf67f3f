use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::{MarketConditions, OrderRef, OrderRequest, OrderStatus};
use crate::error::{KeeperError, Result};

/// Exchange acknowledgement of a placed order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub exchange_order_id: String,
    pub client_order_id: String,
    pub status: OrderStatus,
}

/// Exchange-side view of one order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeOrderState {
    pub exchange_order_id: String,
    pub client_order_id: Option<String>,
    /// Submitted, PartiallyFilled, Filled, Cancelled or Rejected
    pub status: OrderStatus,
    /// Cumulative filled quantity
    pub filled_quantity: Decimal,
    pub avg_fill_price: Option<Decimal>,
}

/// Split "BTC-USDT" into ("BTC", "USDT")
pub fn split_pair(pair: &str) -> Result<(&str, &str)> {
    pair.split_once('-')
        .filter(|(base, quote)| !base.is_empty() && !quote.is_empty())
        .ok_or_else(|| KeeperError::Validation(format!("invalid pair '{}'", pair)))
}

fn unsupported(feature: &str, exchange: &str) -> KeeperError {
    KeeperError::Validation(format!(
        "{} is not implemented for exchange '{}'",
        feature, exchange
    ))
}

/// Raw transport to a spot venue. Implementations make exactly one attempt
/// per call; retry and idempotency live in [`super::ExchangeGateway`].
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_dry_run(&self) -> bool {
        false
    }

    /// Place an order. A repeated client order id must fail with
    /// `KeeperError::DuplicateOrder` instead of creating a second order.
    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderAck>;

    /// Request cancellation. `Ok(false)` means the exchange refused because
    /// the order is already closed.
    async fn cancel_order(&self, pair: &str, order_ref: &OrderRef) -> Result<bool>;

    /// `Ok(None)` when the exchange has no record of the order.
    async fn get_order_status(
        &self,
        pair: &str,
        order_ref: &OrderRef,
    ) -> Result<Option<ExchangeOrderState>>;

    /// Total balance per currency
    async fn get_balance(&self) -> Result<HashMap<String, Decimal>>;

    /// Net base-currency holding for a spot pair
    async fn get_position(&self, pair: &str) -> Result<Decimal> {
        let (base, _) = split_pair(pair)?;
        let balances = self.get_balance().await?;
        Ok(balances.get(base).copied().unwrap_or(Decimal::ZERO))
    }

    /// Ticker snapshot, used as a polling fallback when the feed is lost
    async fn get_market(&self, _pair: &str) -> Result<MarketConditions> {
        Err(unsupported("get_market", self.name()))
    }
}
