//! OKX v5 REST adapter for spot trading.
//!
//! One attempt per call. Exchange error codes are mapped onto the
//! transient/permanent split the gateway retries on.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ExchangeConfig;
use crate::domain::{MarketConditions, OrderRef, OrderRequest, OrderSide, OrderStatus, OrderType};
use crate::error::{KeeperError, Result};
use crate::exchange::{ExchangeClient, ExchangeOrderState, OrderAck};
use crate::signing::{ApiCredentials, OkxSigner};

const PLACE_ORDER: &str = "/api/v5/trade/order";
const QUERY_ORDER: &str = "/api/v5/trade/order";
const CANCEL_ORDER: &str = "/api/v5/trade/cancel-order";
const BALANCE: &str = "/api/v5/account/balance";
const TICKER: &str = "/api/v5/market/ticker";

/// Codes that will fail again however often they are retried
const PERMANENT_CODES: &[&str] = &[
    "51000", // parameter error
    "51001", // instrument does not exist
    "51008", // insufficient balance / amount exceeds limit
    "51020", // size or price below requirements
    "51119", // insufficient balance
    "51121", // size below lot
    "51400", // cancel failed: order already closed
];
const RATE_LIMIT_CODES: &[&str] = &["50011", "50024"];
const DUPLICATE_CLIENT_ID: &str = "51016";
const ORDER_NOT_FOUND: &str = "51603";
const CANCEL_ALREADY_CLOSED: &str = "51400";

/// Map an exchange error code to the error the gateway acts on.
/// Unknown codes are retried.
pub fn classify_code(code: &str, msg: &str) -> KeeperError {
    let detail = format!("{}: {}", code, msg);
    if code == DUPLICATE_CLIENT_ID {
        KeeperError::DuplicateOrder(detail)
    } else if PERMANENT_CODES.contains(&code) {
        KeeperError::Permanent(detail)
    } else if RATE_LIMIT_CODES.contains(&code) {
        KeeperError::RateLimited(detail)
    } else {
        KeeperError::Transient(detail)
    }
}

pub struct OkxRestClient {
    http: Client,
    base_url: String,
    signer: OkxSigner,
}

impl OkxRestClient {
    pub fn new(config: &ExchangeConfig) -> Result<Self> {
        let credentials = ApiCredentials::from_config(config)?;
        let http = Client::builder()
            .user_agent(concat!("spotkeeper/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;

        Ok(Self {
            http,
            base_url: config.rest_url.trim_end_matches('/').to_string(),
            signer: OkxSigner::new(credentials, config.simulated),
        })
    }

    /// Signed request; returns the `data` array of a `code == "0"` envelope
    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Vec<Value>> {
        let body_text = body.as_ref().map(Value::to_string).unwrap_or_default();
        let headers = self.signer.build_headers(method.as_str(), path, &body_text)?;
        let url = format!("{}{}", self.base_url, path);

        let mut req = self.http.request(method.clone(), &url).headers(headers);
        if !body_text.is_empty() {
            req = req.body(body_text);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        debug!(%method, path, status = status.as_u16(), "okx response");

        if status.as_u16() == 429 {
            return Err(KeeperError::RateLimited(format!("{} {}", method, path)));
        }
        if status.is_server_error() {
            return Err(KeeperError::Transient(format!(
                "{} {} failed: status={} body={}",
                method, path, status, text
            )));
        }

        let envelope: Value = serde_json::from_str(&text).map_err(|e| {
            KeeperError::Transient(format!("invalid JSON from {} {} ({}): {}", method, path, status, e))
        })?;
        parse_envelope(envelope)
    }

    fn order_query(pair: &str, order_ref: &OrderRef) -> String {
        match order_ref {
            OrderRef::Exchange(id) => format!("instId={}&ordId={}", pair, id),
            OrderRef::Client(id) => format!("instId={}&clOrdId={}", pair, id),
        }
    }
}

/// Unwrap `{"code","msg","data"}`. Batch-style endpoints report the real
/// failure per item in `sCode`/`sMsg`.
pub fn parse_envelope(envelope: Value) -> Result<Vec<Value>> {
    let code = envelope.get("code").and_then(Value::as_str).unwrap_or("");
    let data = envelope
        .get("data")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    if code == "0" {
        return Ok(data);
    }
    if let Some(item) = data.iter().find(|d| str_field(d, "sCode").is_some_and(|c| c != "0")) {
        let s_code = str_field(item, "sCode").unwrap_or(code);
        let s_msg = str_field(item, "sMsg").unwrap_or("");
        return Err(classify_code(s_code, s_msg));
    }
    let msg = envelope.get("msg").and_then(Value::as_str).unwrap_or("unknown error");
    Err(classify_code(code, msg))
}

fn str_field<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(Value::as_str)
}

/// Numeric strings; the exchange sends "" for absent values
fn decimal_field(v: &Value, key: &str) -> Option<Decimal> {
    str_field(v, key)
        .filter(|s| !s.is_empty())
        .and_then(|s| Decimal::from_str(s).ok())
}

fn millis_field(v: &Value, key: &str) -> Option<DateTime<Utc>> {
    str_field(v, key)
        .and_then(|s| s.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

pub fn parse_order_status(state: &str) -> Option<OrderStatus> {
    match state {
        "live" => Some(OrderStatus::Submitted),
        "partially_filled" => Some(OrderStatus::PartiallyFilled),
        "filled" => Some(OrderStatus::Filled),
        "canceled" | "mmp_canceled" => Some(OrderStatus::Cancelled),
        _ => None,
    }
}

pub fn parse_order_state(item: &Value) -> Result<ExchangeOrderState> {
    let exchange_order_id = str_field(item, "ordId")
        .filter(|s| !s.is_empty())
        .ok_or_else(|| KeeperError::Transient("order payload without ordId".into()))?;
    let state = str_field(item, "state").unwrap_or("");
    let status = parse_order_status(state)
        .ok_or_else(|| KeeperError::Transient(format!("unknown order state '{}'", state)))?;
    let filled_quantity = decimal_field(item, "accFillSz").unwrap_or(Decimal::ZERO);

    Ok(ExchangeOrderState {
        exchange_order_id: exchange_order_id.to_string(),
        client_order_id: str_field(item, "clOrdId")
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        status,
        filled_quantity,
        avg_fill_price: decimal_field(item, "avgPx").filter(|p| !p.is_zero()),
    })
}

/// Ticker payload, shared by the REST snapshot and the streaming channel
pub fn parse_ticker(item: &Value) -> Result<MarketConditions> {
    let pair = str_field(item, "instId")
        .ok_or_else(|| KeeperError::Transient("ticker without instId".into()))?;
    let last = decimal_field(item, "last")
        .ok_or_else(|| KeeperError::Transient(format!("ticker for {} without last", pair)))?;
    Ok(MarketConditions {
        pair: pair.to_string(),
        last,
        best_bid: decimal_field(item, "bidPx"),
        best_ask: decimal_field(item, "askPx"),
        volume_24h: decimal_field(item, "volCcy24h").unwrap_or(Decimal::ZERO),
        timestamp: millis_field(item, "ts").unwrap_or_else(Utc::now),
    })
}

/// `data[0].details[]` of the balance endpoint, by currency
pub fn parse_balances(data: &[Value]) -> HashMap<String, Decimal> {
    data.iter()
        .filter_map(|account| account.get("details").and_then(Value::as_array))
        .flatten()
        .filter_map(|d| {
            let ccy = str_field(d, "ccy")?;
            let amount = decimal_field(d, "cashBal").or_else(|| decimal_field(d, "availBal"))?;
            Some((ccy.to_string(), amount))
        })
        .collect()
}

pub fn order_body(request: &OrderRequest) -> Value {
    let mut body = json!({
        "instId": request.pair,
        "tdMode": "cash",
        "clOrdId": request.client_order_id,
        "side": request.side.as_str(),
        "ordType": match request.order_type {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
        },
        "sz": request.quantity.normalize().to_string(),
    });
    if request.order_type == OrderType::Market && request.side == OrderSide::Buy {
        // Spot market buys are sized in base currency, not quote
        body["tgtCcy"] = json!("base_ccy");
    }
    if let (OrderType::Limit, Some(price)) = (request.order_type, request.price) {
        body["px"] = json!(price.normalize().to_string());
    }
    body
}

#[async_trait]
impl ExchangeClient for OkxRestClient {
    fn name(&self) -> &'static str {
        "okx"
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        let data = self
            .request(Method::POST, PLACE_ORDER, Some(order_body(request)))
            .await?;
        let item = data
            .first()
            .ok_or_else(|| KeeperError::Transient("empty place-order response".into()))?;
        let exchange_order_id = str_field(item, "ordId")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| KeeperError::Transient("place-order response without ordId".into()))?;
        Ok(OrderAck {
            exchange_order_id: exchange_order_id.to_string(),
            client_order_id: request.client_order_id.clone(),
            status: OrderStatus::Submitted,
        })
    }

    async fn cancel_order(&self, pair: &str, order_ref: &OrderRef) -> Result<bool> {
        let mut body = json!({ "instId": pair });
        match order_ref {
            OrderRef::Exchange(id) => body["ordId"] = json!(id),
            OrderRef::Client(id) => body["clOrdId"] = json!(id),
        }
        match self.request(Method::POST, CANCEL_ORDER, Some(body)).await {
            Ok(_) => Ok(true),
            Err(KeeperError::Permanent(detail)) if detail.starts_with(CANCEL_ALREADY_CLOSED) => {
                debug!(%order_ref, "cancel refused, order already closed");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn get_order_status(
        &self,
        pair: &str,
        order_ref: &OrderRef,
    ) -> Result<Option<ExchangeOrderState>> {
        let path = format!("{}?{}", QUERY_ORDER, Self::order_query(pair, order_ref));
        let data = match self.request(Method::GET, &path, None).await {
            Ok(data) => data,
            Err(KeeperError::Transient(detail)) if detail.starts_with(ORDER_NOT_FOUND) => {
                return Ok(None)
            }
            Err(e) => return Err(e),
        };
        match data.first() {
            Some(item) => parse_order_state(item).map(Some),
            None => Ok(None),
        }
    }

    async fn get_balance(&self) -> Result<HashMap<String, Decimal>> {
        let data = self.request(Method::GET, BALANCE, None).await?;
        Ok(parse_balances(&data))
    }

    async fn get_market(&self, pair: &str) -> Result<MarketConditions> {
        let path = format!("{}?instId={}", TICKER, pair);
        let data = self.request(Method::GET, &path, None).await?;
        let item = data.first().ok_or_else(|| {
            warn!(pair, "empty ticker response");
            KeeperError::MarketDataUnavailable(pair.to_string())
        })?;
        parse_ticker(item)
    }
}
