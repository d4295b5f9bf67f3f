use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{ExchangeClient, ExchangeOrderState, OrderAck, RetryPolicy};
use crate::domain::{MarketConditions, OrderRef, OrderRequest};
use crate::error::{KeeperError, Result};

/// Exchange gateway: bounded retry around a raw client, with the client
/// order id as idempotency key.
///
/// Every retry of `submit_order` resends the identical request. If an earlier
/// attempt reached the exchange and only its acknowledgement was lost, the
/// exchange answers the resend with "duplicate client order id"; the gateway
/// then looks the order up by client id and returns it as the acknowledgement.
#[derive(Clone)]
pub struct ExchangeGateway {
    client: Arc<dyn ExchangeClient>,
    policy: RetryPolicy,
}

impl ExchangeGateway {
    pub fn new(client: Arc<dyn ExchangeClient>, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    pub fn client(&self) -> &Arc<dyn ExchangeClient> {
        &self.client
    }

    pub fn name(&self) -> &'static str {
        self.client.name()
    }

    pub async fn submit_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        let result = self
            .policy
            .run("submit_order", || self.client.submit_order(request))
            .await;

        match result {
            Err(KeeperError::DuplicateOrder(id)) => {
                info!(
                    client_order_id = %request.client_order_id,
                    "exchange already holds this client order id, resolving existing order"
                );
                self.resolve_duplicate(request, id).await
            }
            other => other,
        }
    }

    async fn resolve_duplicate(&self, request: &OrderRequest, id: String) -> Result<OrderAck> {
        let order_ref = OrderRef::Client(request.client_order_id.clone());
        match self.get_order_status(&request.pair, &order_ref).await? {
            Some(state) => {
                debug!(
                    client_order_id = %request.client_order_id,
                    exchange_order_id = %state.exchange_order_id,
                    status = %state.status,
                    "duplicate submission resolved"
                );
                Ok(OrderAck {
                    exchange_order_id: state.exchange_order_id,
                    client_order_id: request.client_order_id.clone(),
                    status: state.status,
                })
            }
            None => {
                warn!(client_order_id = %id, "duplicate reported but order not found");
                Err(KeeperError::DuplicateOrder(id))
            }
        }
    }

    pub async fn cancel_order(&self, pair: &str, order_ref: &OrderRef) -> Result<bool> {
        self.policy
            .run("cancel_order", || self.client.cancel_order(pair, order_ref))
            .await
    }

    pub async fn get_order_status(
        &self,
        pair: &str,
        order_ref: &OrderRef,
    ) -> Result<Option<ExchangeOrderState>> {
        self.policy
            .run("get_order_status", || self.client.get_order_status(pair, order_ref))
            .await
    }

    pub async fn get_balance(&self) -> Result<HashMap<String, Decimal>> {
        self.policy
            .run("get_balance", || self.client.get_balance())
            .await
    }

    pub async fn get_position(&self, pair: &str) -> Result<Decimal> {
        self.policy
            .run("get_position", || self.client.get_position(pair))
            .await
    }

    pub async fn get_market(&self, pair: &str) -> Result<MarketConditions> {
        self.policy
            .run("get_market", || self.client.get_market(pair))
            .await
    }
}
