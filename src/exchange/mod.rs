pub mod factory;
pub mod gateway;
pub mod paper;
pub mod retry;
mod traits;

pub use factory::{build_exchange_client, ExchangeHandle};
pub use gateway::ExchangeGateway;
pub use paper::{FillMode, PaperExchange};
pub use retry::{ExponentialBackoff, RetryPolicy};
pub use traits::{split_pair, ExchangeClient, ExchangeOrderState, OrderAck};
