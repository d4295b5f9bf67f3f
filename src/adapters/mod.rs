//! Venue adapters: OKX REST for orders and balances, OKX public WebSocket for tickers.

pub mod okx_rest;
pub mod okx_ws;

pub use okx_rest::{classify_code, OkxRestClient};
pub use okx_ws::OkxTickerFeed;
