use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{IntentKind, OrderRef, OrderSide};

/// A request to open or close a position, not yet sized or risk-checked
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeIntent {
    pub pair: String,
    pub side: OrderSide,
    pub reference_price: Decimal,
    pub kind: IntentKind,
    /// Free-form label carried into logs (signal name, exit reason)
    #[serde(default)]
    pub reason: Option<String>,
}

impl TradeIntent {
    pub fn open(pair: &str, side: OrderSide, reference_price: Decimal) -> Self {
        Self {
            pair: pair.to_string(),
            side,
            reference_price,
            kind: IntentKind::Open,
            reason: None,
        }
    }

    pub fn close(pair: &str, side: OrderSide, reference_price: Decimal, reason: &str) -> Self {
        Self {
            pair: pair.to_string(),
            side,
            reference_price,
            kind: IntentKind::Close,
            reason: Some(reason.to_string()),
        }
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }
}

/// Last traded price for a pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub pair: String,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Ticker snapshot used by the liquidity checks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketConditions {
    pub pair: String,
    pub last: Decimal,
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    /// 24h traded volume in quote currency
    pub volume_24h: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl MarketConditions {
    /// Spread relative to mid, if both sides are quoted
    pub fn relative_spread(&self) -> Option<Decimal> {
        let (bid, ask) = (self.best_bid?, self.best_ask?);
        let mid = (bid + ask) / Decimal::TWO;
        if mid <= Decimal::ZERO {
            return None;
        }
        Some((ask - bid) / mid)
    }

    pub fn price_update(&self) -> PriceUpdate {
        PriceUpdate {
            pair: self.pair.clone(),
            price: self.last,
            timestamp: self.timestamp,
        }
    }
}

/// Order event reported by the exchange (stream, poll, or reconciliation replay)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExchangeEvent {
    Acked {
        order_ref: OrderRef,
        exchange_order_id: String,
    },
    PartialFill {
        order_ref: OrderRef,
        quantity: Decimal,
        price: Decimal,
    },
    /// Fill the exchange reports as completing the order
    Fill {
        order_ref: OrderRef,
        quantity: Decimal,
        price: Decimal,
    },
    Cancelled {
        order_ref: OrderRef,
    },
    Rejected {
        order_ref: OrderRef,
        reason: String,
    },
}

impl ExchangeEvent {
    pub fn order_ref(&self) -> &OrderRef {
        match self {
            ExchangeEvent::Acked { order_ref, .. }
            | ExchangeEvent::PartialFill { order_ref, .. }
            | ExchangeEvent::Fill { order_ref, .. }
            | ExchangeEvent::Cancelled { order_ref }
            | ExchangeEvent::Rejected { order_ref, .. } => order_ref,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExchangeEvent::Acked { .. } => "acked",
            ExchangeEvent::PartialFill { .. } => "partial_fill",
            ExchangeEvent::Fill { .. } => "fill",
            ExchangeEvent::Cancelled { .. } => "cancelled",
            ExchangeEvent::Rejected { .. } => "rejected",
        }
    }
}

/// Fill notification as delivered by a fill source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillEvent {
    pub order_ref: OrderRef,
    pub quantity_delta: Decimal,
    pub price: Decimal,
}

impl From<FillEvent> for ExchangeEvent {
    fn from(fill: FillEvent) -> Self {
        ExchangeEvent::PartialFill {
            order_ref: fill.order_ref,
            quantity: fill.quantity_delta,
            price: fill.price,
        }
    }
}
