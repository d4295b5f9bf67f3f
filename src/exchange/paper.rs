use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{split_pair, ExchangeClient, ExchangeOrderState, OrderAck};
use crate::domain::{MarketConditions, OrderRef, OrderRequest, OrderSide, OrderStatus, OrderType};
use crate::error::{KeeperError, Result};

/// How resting paper orders get filled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillMode {
    /// Fill marketable orders against the last price on submission and on every price mark
    Marketable,
    /// Only fill when a test calls `fill`
    Manual,
}

#[derive(Debug, Clone)]
struct PaperOrder {
    request: OrderRequest,
    state: ExchangeOrderState,
}

#[derive(Debug, Default)]
struct Faults {
    transient_submits: u32,
    lost_acks: u32,
    reject_next: Option<String>,
    transient_queries: u32,
}

#[derive(Debug)]
struct Book {
    orders: HashMap<String, PaperOrder>,
    by_exchange_id: HashMap<String, String>,
    balances: HashMap<String, Decimal>,
    markets: HashMap<String, MarketConditions>,
    next_id: u64,
    submit_calls: u32,
    faults: Faults,
}

/// In-memory spot exchange used for dry runs and tests.
///
/// Honors client order ids the way a real venue does: a second submission
/// with a known id fails with `DuplicateOrder`. Faults can be injected to
/// exercise the retry and recovery paths.
pub struct PaperExchange {
    quote_currency: String,
    fee_rate: Decimal,
    fill_mode: FillMode,
    book: Mutex<Book>,
}

impl PaperExchange {
    pub fn new(quote_balance: Decimal, quote_currency: &str) -> Self {
        let mut balances = HashMap::new();
        balances.insert(quote_currency.to_string(), quote_balance);
        Self {
            quote_currency: quote_currency.to_string(),
            fee_rate: Decimal::ZERO,
            fill_mode: FillMode::Manual,
            book: Mutex::new(Book {
                orders: HashMap::new(),
                by_exchange_id: HashMap::new(),
                balances,
                markets: HashMap::new(),
                next_id: 1,
                submit_calls: 0,
                faults: Faults::default(),
            }),
        }
    }

    pub fn with_fill_mode(mut self, mode: FillMode) -> Self {
        self.fill_mode = mode;
        self
    }

    pub fn with_fee_rate(mut self, fee_rate: Decimal) -> Self {
        self.fee_rate = fee_rate;
        self
    }

    /// Fail the next `n` submissions with a transient error before they reach the book
    pub async fn fail_next_submits(&self, n: u32) {
        self.book.lock().await.faults.transient_submits = n;
    }

    /// Accept the next `n` submissions but report a timeout to the caller
    pub async fn lose_next_acks(&self, n: u32) {
        self.book.lock().await.faults.lost_acks = n;
    }

    /// Reject the next submission permanently
    pub async fn reject_next(&self, reason: &str) {
        self.book.lock().await.faults.reject_next = Some(reason.to_string());
    }

    /// Fail the next `n` status/balance queries with a transient error
    pub async fn fail_next_queries(&self, n: u32) {
        self.book.lock().await.faults.transient_queries = n;
    }

    pub async fn set_balance(&self, currency: &str, amount: Decimal) {
        self.book
            .lock()
            .await
            .balances
            .insert(currency.to_string(), amount);
    }

    pub async fn set_market(&self, market: MarketConditions) {
        let mut book = self.book.lock().await;
        book.markets.insert(market.pair.clone(), market);
    }

    /// Record a new last price and fill any resting orders it crosses
    pub async fn mark_price(&self, pair: &str, price: Decimal) {
        let mut book = self.book.lock().await;
        let entry = book
            .markets
            .entry(pair.to_string())
            .or_insert_with(|| MarketConditions {
                pair: pair.to_string(),
                last: price,
                best_bid: None,
                best_ask: None,
                volume_24h: Decimal::ZERO,
                timestamp: Utc::now(),
            });
        entry.last = price;
        entry.timestamp = Utc::now();

        if self.fill_mode == FillMode::Marketable {
            let ids: Vec<String> = book
                .orders
                .values()
                .filter(|o| o.request.pair == pair && o.state.status.is_active())
                .map(|o| o.request.client_order_id.clone())
                .collect();
            for id in ids {
                self.try_fill_marketable(&mut book, &id, price);
            }
        }
    }

    /// Fill `quantity` of an order at `price`, as the matching engine would
    pub async fn fill(&self, order_ref: &OrderRef, quantity: Decimal, price: Decimal) -> Result<()> {
        let mut book = self.book.lock().await;
        let id = Self::resolve(&book, order_ref)
            .ok_or_else(|| KeeperError::Validation(format!("unknown paper order {}", order_ref)))?;
        self.apply_fill(&mut book, &id, quantity, price);
        Ok(())
    }

    /// Drop an order from the book, simulating a venue that never saw it
    pub async fn forget(&self, order_ref: &OrderRef) {
        let mut book = self.book.lock().await;
        if let Some(id) = Self::resolve(&book, order_ref) {
            if let Some(order) = book.orders.remove(&id) {
                book.by_exchange_id.remove(&order.state.exchange_order_id);
            }
        }
    }

    /// Distinct orders the exchange has accepted
    pub async fn order_count(&self) -> usize {
        self.book.lock().await.orders.len()
    }

    /// Raw submit calls, including duplicates and injected failures
    pub async fn submit_calls(&self) -> u32 {
        self.book.lock().await.submit_calls
    }

    fn resolve(book: &Book, order_ref: &OrderRef) -> Option<String> {
        match order_ref {
            OrderRef::Client(id) => book.orders.contains_key(id).then(|| id.clone()),
            OrderRef::Exchange(id) => book.by_exchange_id.get(id).cloned(),
        }
    }

    fn try_fill_marketable(&self, book: &mut Book, id: &str, last: Decimal) {
        let Some(order) = book.orders.get(id) else {
            return;
        };
        let crosses = match (order.request.order_type, order.request.price, order.request.side) {
            (OrderType::Market, _, _) => true,
            (OrderType::Limit, Some(limit), OrderSide::Buy) => last <= limit,
            (OrderType::Limit, Some(limit), OrderSide::Sell) => last >= limit,
            (OrderType::Limit, None, _) => false,
        };
        if crosses {
            let remaining = order.request.quantity - order.state.filled_quantity;
            self.apply_fill(book, id, remaining, last);
        }
    }

    fn apply_fill(&self, book: &mut Book, id: &str, quantity: Decimal, price: Decimal) {
        let Some(order) = book.orders.get_mut(id) else {
            return;
        };
        if !order.state.status.is_active() {
            return;
        }
        let quantity = quantity.min(order.request.quantity - order.state.filled_quantity);
        if quantity <= Decimal::ZERO {
            return;
        }

        let prev_qty = order.state.filled_quantity;
        let prev_avg = order.state.avg_fill_price.unwrap_or(Decimal::ZERO);
        let total = prev_qty + quantity;
        order.state.avg_fill_price = Some((prev_avg * prev_qty + price * quantity) / total);
        order.state.filled_quantity = total;
        order.state.status = if total >= order.request.quantity {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };

        let side = order.request.side;
        let pair = order.request.pair.clone();
        debug!(client_order_id = %id, %quantity, %price, status = %order.state.status, "paper fill");

        let Ok((base, quote)) = split_pair(&pair) else {
            return;
        };
        let notional = quantity * price;
        let fee = notional * self.fee_rate;
        let (base, quote) = (base.to_string(), quote.to_string());
        let base_bal = book.balances.entry(base).or_insert(Decimal::ZERO);
        *base_bal += side.sign() * quantity;
        let quote_bal = book.balances.entry(quote).or_insert(Decimal::ZERO);
        *quote_bal -= side.sign() * notional + fee;
    }

    fn take_query_fault(book: &mut Book) -> Result<()> {
        if book.faults.transient_queries > 0 {
            book.faults.transient_queries -= 1;
            return Err(KeeperError::Transient("paper: injected query timeout".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    fn name(&self) -> &'static str {
        "paper"
    }

    fn is_dry_run(&self) -> bool {
        true
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        let mut book = self.book.lock().await;
        book.submit_calls += 1;

        if book.faults.transient_submits > 0 {
            book.faults.transient_submits -= 1;
            return Err(KeeperError::Transient("paper: injected submit timeout".into()));
        }
        if let Some(reason) = book.faults.reject_next.take() {
            return Err(KeeperError::Permanent(reason));
        }
        if book.orders.contains_key(&request.client_order_id) {
            return Err(KeeperError::DuplicateOrder(request.client_order_id.clone()));
        }
        if request.quantity <= Decimal::ZERO {
            return Err(KeeperError::Permanent("paper: quantity must be positive".into()));
        }
        split_pair(&request.pair).map_err(|e| KeeperError::Permanent(e.to_string()))?;

        let exchange_order_id = format!("P{:08}", book.next_id);
        book.next_id += 1;
        let state = ExchangeOrderState {
            exchange_order_id: exchange_order_id.clone(),
            client_order_id: Some(request.client_order_id.clone()),
            status: OrderStatus::Submitted,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
        };
        book.by_exchange_id
            .insert(exchange_order_id.clone(), request.client_order_id.clone());
        book.orders.insert(
            request.client_order_id.clone(),
            PaperOrder {
                request: request.clone(),
                state,
            },
        );
        info!(
            client_order_id = %request.client_order_id,
            exchange_order_id = %exchange_order_id,
            side = %request.side,
            quantity = %request.quantity,
            "paper order accepted"
        );

        let last = book.markets.get(&request.pair).map(|m| m.last);
        if let (FillMode::Marketable, Some(last)) = (self.fill_mode, last) {
            self.try_fill_marketable(&mut book, &request.client_order_id, last);
        }

        if book.faults.lost_acks > 0 {
            book.faults.lost_acks -= 1;
            return Err(KeeperError::Transient("paper: ack lost".into()));
        }

        let status = book
            .orders
            .get(&request.client_order_id)
            .map(|o| o.state.status)
            .unwrap_or(OrderStatus::Submitted);
        Ok(OrderAck {
            exchange_order_id,
            client_order_id: request.client_order_id.clone(),
            status,
        })
    }

    async fn cancel_order(&self, _pair: &str, order_ref: &OrderRef) -> Result<bool> {
        let mut book = self.book.lock().await;
        Self::take_query_fault(&mut book)?;
        let Some(id) = Self::resolve(&book, order_ref) else {
            return Err(KeeperError::Permanent(format!("paper: order {} does not exist", order_ref)));
        };
        match book.orders.get_mut(&id) {
            Some(order) if order.state.status.is_active() => {
                order.state.status = OrderStatus::Cancelled;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_order_status(
        &self,
        _pair: &str,
        order_ref: &OrderRef,
    ) -> Result<Option<ExchangeOrderState>> {
        let mut book = self.book.lock().await;
        Self::take_query_fault(&mut book)?;
        Ok(Self::resolve(&book, order_ref)
            .and_then(|id| book.orders.get(&id))
            .map(|o| o.state.clone()))
    }

    async fn get_balance(&self) -> Result<HashMap<String, Decimal>> {
        let mut book = self.book.lock().await;
        Self::take_query_fault(&mut book)?;
        let mut balances = book.balances.clone();
        balances.entry(self.quote_currency.clone()).or_insert(Decimal::ZERO);
        Ok(balances)
    }

    async fn get_market(&self, pair: &str) -> Result<MarketConditions> {
        let book = self.book.lock().await;
        book.markets
            .get(pair)
            .cloned()
            .ok_or_else(|| KeeperError::MarketDataUnavailable(pair.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn buy(id: &str, qty: Decimal, price: Option<Decimal>) -> OrderRequest {
        OrderRequest {
            client_order_id: id.to_string(),
            pair: "BTC-USDT".to_string(),
            side: OrderSide::Buy,
            order_type: if price.is_some() { OrderType::Limit } else { OrderType::Market },
            quantity: qty,
            price,
        }
    }

    #[tokio::test]
    async fn partial_then_full_fill_moves_balances() {
        let paper = PaperExchange::new(dec!(1000), "USDT");
        let ack = paper.submit_order(&buy("a", dec!(2), Some(dec!(100)))).await.unwrap();
        let r = OrderRef::Exchange(ack.exchange_order_id);

        paper.fill(&r, dec!(0.5), dec!(100)).await.unwrap();
        let st = paper.get_order_status("BTC-USDT", &r).await.unwrap().unwrap();
        assert_eq!(st.status, OrderStatus::PartiallyFilled);

        paper.fill(&r, dec!(5), dec!(100)).await.unwrap();
        let st = paper.get_order_status("BTC-USDT", &r).await.unwrap().unwrap();
        assert_eq!(st.status, OrderStatus::Filled);
        assert_eq!(st.filled_quantity, dec!(2));

        assert_eq!(paper.get_position("BTC-USDT").await.unwrap(), dec!(2));
        let balances = paper.get_balance().await.unwrap();
        assert_eq!(balances["USDT"], dec!(800));
    }

    #[tokio::test]
    async fn marketable_mode_fills_on_submit_and_on_mark() {
        let paper = PaperExchange::new(dec!(1000), "USDT").with_fill_mode(FillMode::Marketable);
        paper.mark_price("BTC-USDT", dec!(101)).await;

        let resting = paper.submit_order(&buy("lim", dec!(1), Some(dec!(100)))).await.unwrap();
        assert_eq!(resting.status, OrderStatus::Submitted);

        paper.mark_price("BTC-USDT", dec!(99.5)).await;
        let st = paper
            .get_order_status("BTC-USDT", &OrderRef::Client("lim".into()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(st.status, OrderStatus::Filled);
        assert_eq!(st.avg_fill_price, Some(dec!(99.5)));

        let mkt = paper.submit_order(&buy("mkt", dec!(1), None)).await.unwrap();
        assert_eq!(mkt.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn cancel_after_fill_reports_false() {
        let paper = PaperExchange::new(dec!(1000), "USDT");
        paper.submit_order(&buy("c", dec!(1), Some(dec!(10)))).await.unwrap();
        let r = OrderRef::Client("c".into());
        paper.fill(&r, dec!(1), dec!(10)).await.unwrap();
        assert!(!paper.cancel_order("BTC-USDT", &r).await.unwrap());
    }

    #[tokio::test]
    async fn forgotten_order_is_unknown() {
        let paper = PaperExchange::new(dec!(1000), "USDT");
        paper.submit_order(&buy("f", dec!(1), None)).await.unwrap();
        let r = OrderRef::Client("f".into());
        paper.forget(&r).await;
        assert!(paper.get_order_status("BTC-USDT", &r).await.unwrap().is_none());
    }
}
