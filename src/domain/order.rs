use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// OKX caps `clOrdId` at 32 alphanumeric characters.
const CLIENT_ORDER_ID_MAX_LEN: usize = 32;

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    /// +1 for buy, -1 for sell
    pub fn sign(&self) -> Decimal {
        match self {
            OrderSide::Buy => Decimal::ONE,
            OrderSide::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Limit,
    Market,
}

/// Whether an order opens a new position or closes the current one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IntentKind {
    Open,
    Close,
}

/// Order status
///
/// Statuses only move forward in `rank()` order. `Reconciled` is the one
/// exception: it may replace any status once a restart has confirmed the
/// order's final disposition with the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Created locally, not yet acknowledged
    Pending,
    /// Acknowledged by the exchange
    Submitted,
    PartiallyFilled,
    Filled,
    Cancelled,
    /// Refused by the exchange, or never reached it
    Rejected,
    /// Final disposition confirmed after a restart
    Reconciled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Submitted => "SUBMITTED",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Reconciled => "RECONCILED",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            OrderStatus::Pending => 0,
            OrderStatus::Submitted => 1,
            OrderStatus::PartiallyFilled => 2,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected => 3,
            OrderStatus::Reconciled => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Rejected
                | OrderStatus::Reconciled
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OrderStatus::Pending | OrderStatus::Submitted | OrderStatus::PartiallyFilled
        )
    }

    /// Check if this status can move to `target`
    pub fn can_transition_to(&self, target: OrderStatus) -> bool {
        if target == OrderStatus::Reconciled {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        // Repeated partial fills keep the same status
        if *self == OrderStatus::PartiallyFilled && target == OrderStatus::PartiallyFilled {
            return true;
        }
        target.rank() > self.rank()
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Order request handed to the exchange gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub pair: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    /// None for market orders
    pub price: Option<Decimal>,
}

/// Order tracked by the lifecycle manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub pair: String,
    pub side: OrderSide,
    pub kind: IntentKind,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub filled_quantity: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub status: OrderStatus,
    /// Last status before a reconciliation override, kept for audit
    #[serde(default)]
    pub settled_as: Option<OrderStatus>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn new(
        pair: &str,
        side: OrderSide,
        kind: IntentKind,
        quantity: Decimal,
        price: Option<Decimal>,
    ) -> Self {
        let now = Utc::now();
        Self {
            client_order_id: new_client_order_id(pair),
            exchange_order_id: None,
            pair: pair.to_string(),
            side,
            kind,
            order_type: if price.is_some() {
                OrderType::Limit
            } else {
                OrderType::Market
            },
            quantity,
            price,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
            status: OrderStatus::Pending,
            settled_as: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn to_request(&self) -> OrderRequest {
        OrderRequest {
            client_order_id: self.client_order_id.clone(),
            pair: self.pair.clone(),
            side: self.side,
            order_type: self.order_type,
            quantity: self.quantity,
            price: self.price,
        }
    }

    pub fn remaining(&self) -> Decimal {
        (self.quantity - self.filled_quantity).max(Decimal::ZERO)
    }

    pub fn is_fully_filled(&self) -> bool {
        self.filled_quantity >= self.quantity
    }

    /// Whether this order answers to the given reference
    pub fn matches(&self, order_ref: &OrderRef) -> bool {
        match order_ref {
            OrderRef::Client(id) => &self.client_order_id == id,
            OrderRef::Exchange(id) => self.exchange_order_id.as_deref() == Some(id.as_str()),
        }
    }

    /// Best reference for querying the exchange
    pub fn order_ref(&self) -> OrderRef {
        match &self.exchange_order_id {
            Some(id) => OrderRef::Exchange(id.clone()),
            None => OrderRef::Client(self.client_order_id.clone()),
        }
    }

    /// Status the order settled in, looking through a `Reconciled` override
    pub fn effective_status(&self) -> OrderStatus {
        match (self.status, self.settled_as) {
            (OrderStatus::Reconciled, Some(settled)) => settled,
            (status, _) => status,
        }
    }
}

/// Reference to an order by either of its identifiers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderRef {
    Client(String),
    Exchange(String),
}

impl std::fmt::Display for OrderRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderRef::Client(id) => write!(f, "client:{}", id),
            OrderRef::Exchange(id) => write!(f, "exchange:{}", id),
        }
    }
}

/// Generate a client order id: pair letters, epoch millis, random hex.
/// Generated once per intent and reused on every retry.
pub fn new_client_order_id(pair: &str) -> String {
    let mut id: String = pair.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    id.push_str(&Utc::now().timestamp_millis().to_string());
    id.push_str(&Uuid::new_v4().simple().to_string()[..8]);
    if id.len() > CLIENT_ORDER_ID_MAX_LEN {
        id = id[id.len() - CLIENT_ORDER_ID_MAX_LEN..].to_string();
    }
    id
}
