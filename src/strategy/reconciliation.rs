//! Startup reconciliation of persisted state against the exchange.
//!
//! The exchange's order and balance state always wins over local belief.
//! Local state only fills gaps the exchange cannot answer, such as an order
//! that was persisted as `Pending` but never reached it.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::config::ReconciliationConfig;
use crate::domain::{ExchangeEvent, OrderRef, OrderStatus};
use crate::error::{KeeperError, Result};
use crate::exchange::{split_pair, ExchangeGateway};
use crate::persistence::{PersistedSnapshot, SnapshotStore};
use crate::strategy::risk::RiskGovernor;
use crate::strategy::transition::{events_from_exchange, ExitParams, Ledger};

/// What reconciliation decided about the recorded live order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrderResolution {
    /// Nothing was in flight
    NoLiveOrder,
    /// The exchange never saw it
    NotFoundRejected { client_order_id: String },
    /// The exchange reports a final status; replayed locally
    Settled {
        client_order_id: String,
        status: OrderStatus,
        filled_quantity: Decimal,
    },
    /// Filled in part locally but unknown to the exchange; needs an operator
    Missing { client_order_id: String },
    /// Still working on the exchange; monitoring resumes
    StillOpen {
        client_order_id: String,
        status: OrderStatus,
        filled_quantity: Decimal,
    },
}

/// Position mismatch beyond tolerance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionDiscrepancy {
    pub pair: String,
    pub local_quantity: Decimal,
    pub exchange_quantity: Decimal,
    pub difference: Decimal,
}

impl std::fmt::Display for PositionDiscrepancy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: local {} vs exchange {} (diff {})",
            self.pair, self.local_quantity, self.exchange_quantity, self.difference
        )
    }
}

/// Reconciliation result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub cold_start: bool,
    pub order: OrderResolution,
    pub discrepancies: Vec<PositionDiscrepancy>,
    pub equity: Decimal,
    pub duration_ms: u64,
}

impl ReconciliationReport {
    pub fn is_consistent(&self) -> bool {
        self.discrepancies.is_empty() && !matches!(self.order, OrderResolution::Missing { .. })
    }
}

/// One reconciliation pass. Callers must hold the lifecycle lock for the
/// whole run so no other exchange call overlaps it.
pub struct Reconciler<'a> {
    pub gateway: &'a ExchangeGateway,
    pub store: &'a dyn SnapshotStore,
    pub governor: &'a RiskGovernor,
    pub exits: &'a ExitParams,
    pub pairs: &'a [String],
    pub tolerance: &'a ReconciliationConfig,
}

impl<'a> Reconciler<'a> {
    pub async fn run(&self) -> Result<(PersistedSnapshot, ReconciliationReport)> {
        let start = Instant::now();

        // 1. Load, or cold start
        let (mut snapshot, cold_start) = match self.store.load().await? {
            Some(snapshot) => (snapshot, false),
            None => {
                info!("no snapshot on disk, cold start");
                (
                    PersistedSnapshot::fresh(self.governor.config().starting_balance),
                    true,
                )
            }
        };

        // 2. Resolve the live order
        let order = self.resolve_live_order(&mut snapshot).await?;

        // 3. Balances and positions
        let discrepancies = self.compare_positions(&snapshot).await?;
        let equity = self.refresh_equity(&mut snapshot, cold_start).await?;

        let mut problems: Vec<String> = discrepancies.iter().map(|d| d.to_string()).collect();
        if let OrderResolution::Missing { client_order_id } = &order {
            problems.push(format!("order {} filled locally but unknown to exchange", client_order_id));
        }

        if problems.is_empty() {
            if let Some(previous) = snapshot.inconsistency.take() {
                info!(previous = %previous, "position mismatch resolved");
            }
        } else {
            let summary = problems.join("; ");
            error!(problems = %summary, "RECONCILIATION MISMATCH, new orders halted");
            snapshot.inconsistency = Some(summary);
        }

        // 4. Persist before handing back control
        self.store.save(&snapshot).await?;

        let report = ReconciliationReport {
            cold_start,
            order,
            discrepancies,
            equity,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            cold_start,
            order = ?report.order,
            consistent = report.is_consistent(),
            equity = %report.equity,
            duration_ms = report.duration_ms,
            "reconciliation complete"
        );
        Ok((snapshot, report))
    }

    async fn resolve_live_order(&self, snapshot: &mut PersistedSnapshot) -> Result<OrderResolution> {
        let Some(order) = snapshot.live_order.clone() else {
            return Ok(OrderResolution::NoLiveOrder);
        };

        // Exchange id when we have one; otherwise the client id it was submitted under
        let mut remote = self
            .gateway
            .get_order_status(&order.pair, &order.order_ref())
            .await?;
        if remote.is_none() && order.exchange_order_id.is_some() {
            remote = self
                .gateway
                .get_order_status(&order.pair, &OrderRef::Client(order.client_order_id.clone()))
                .await?;
        }

        let now = Utc::now();
        let Some(remote) = remote else {
            let (event, resolution) = if order.status == OrderStatus::Pending {
                warn!(
                    client_order_id = %order.client_order_id,
                    "pending order never reached the exchange, marking rejected"
                );
                (
                    ExchangeEvent::Rejected {
                        order_ref: OrderRef::Client(order.client_order_id.clone()),
                        reason: "not found on exchange during reconciliation".to_string(),
                    },
                    OrderResolution::NotFoundRejected {
                        client_order_id: order.client_order_id.clone(),
                    },
                )
            } else if order.filled_quantity.is_zero() {
                // Venues purge unfilled cancelled orders; the position check
                // below still verifies that nothing was bought or sold.
                warn!(
                    client_order_id = %order.client_order_id,
                    "acknowledged order without fills no longer on exchange, treating as cancelled"
                );
                (
                    ExchangeEvent::Cancelled {
                        order_ref: OrderRef::Client(order.client_order_id.clone()),
                    },
                    OrderResolution::Settled {
                        client_order_id: order.client_order_id.clone(),
                        status: OrderStatus::Cancelled,
                        filled_quantity: Decimal::ZERO,
                    },
                )
            } else {
                error!(
                    client_order_id = %order.client_order_id,
                    filled = %order.filled_quantity,
                    "partially filled order unknown to exchange"
                );
                return Ok(OrderResolution::Missing {
                    client_order_id: order.client_order_id,
                });
            };
            self.ledger(snapshot).apply(&event, now)?;
            if matches!(resolution, OrderResolution::Settled { .. }) {
                mark_reconciled(snapshot, &order.client_order_id);
            }
            return Ok(resolution);
        };

        let events = events_from_exchange(&order, &remote);
        {
            let mut ledger = self.ledger(snapshot);
            for event in &events {
                ledger.apply(event, now)?;
            }
        }

        if remote.status.is_terminal() {
            mark_reconciled(snapshot, &order.client_order_id);
            info!(
                client_order_id = %order.client_order_id,
                status = %remote.status,
                filled = %remote.filled_quantity,
                "live order settled on exchange"
            );
            Ok(OrderResolution::Settled {
                client_order_id: order.client_order_id,
                status: remote.status,
                filled_quantity: remote.filled_quantity,
            })
        } else {
            let status = snapshot
                .live_order
                .as_ref()
                .map(|o| o.status)
                .unwrap_or(remote.status);
            info!(
                client_order_id = %order.client_order_id,
                %status,
                filled = %remote.filled_quantity,
                "live order still open, resuming monitoring"
            );
            Ok(OrderResolution::StillOpen {
                client_order_id: order.client_order_id,
                status,
                filled_quantity: remote.filled_quantity,
            })
        }
    }

    async fn compare_positions(&self, snapshot: &PersistedSnapshot) -> Result<Vec<PositionDiscrepancy>> {
        let mut pairs: BTreeSet<&str> = self.pairs.iter().map(String::as_str).collect();
        if let Some(pos) = &snapshot.position {
            pairs.insert(pos.pair.as_str());
        }

        let mut discrepancies = Vec::new();
        for pair in pairs {
            let local = match &snapshot.position {
                Some(pos) if pos.pair == pair => pos.side.sign() * pos.quantity,
                _ => Decimal::ZERO,
            };
            let exchange = self.gateway.get_position(pair).await?;
            let difference = exchange - local;
            let allowed = self
                .tolerance
                .position_tolerance_abs
                .max(local.abs() * self.tolerance.position_tolerance_pct);
            if difference.abs() > allowed {
                discrepancies.push(PositionDiscrepancy {
                    pair: pair.to_string(),
                    local_quantity: local,
                    exchange_quantity: exchange,
                    difference,
                });
            }
        }
        Ok(discrepancies)
    }

    /// Account equity in quote currency, open position at cost
    async fn refresh_equity(&self, snapshot: &mut PersistedSnapshot, cold_start: bool) -> Result<Decimal> {
        let equity = account_equity(self.gateway, snapshot, self.pairs).await?;
        let now = Utc::now();
        if cold_start {
            self.governor.seed_balance(equity, &mut snapshot.risk, now);
        } else {
            self.governor.refresh_balance(equity, &mut snapshot.risk, now);
        }
        Ok(equity)
    }

    fn ledger<'s>(&'s self, snapshot: &'s mut PersistedSnapshot) -> Ledger<'s> {
        Ledger {
            snapshot,
            governor: self.governor,
            exits: self.exits,
        }
    }
}

/// Flag the settled order as confirmed by the exchange
fn mark_reconciled(snapshot: &mut PersistedSnapshot, client_order_id: &str) {
    if let Some(settled) = snapshot
        .last_order
        .as_mut()
        .filter(|o| o.client_order_id == client_order_id)
    {
        settled.settled_as = Some(settled.status);
        settled.status = OrderStatus::Reconciled;
    }
}

/// Free quote balance plus the open position valued at its entry price.
///
/// Unrealized gains stay out of the balance: the closing fill books them
/// through `on_realized_pnl`, so marking here would count them twice and
/// lift the peak to a balance the account never held.
pub async fn account_equity(
    gateway: &ExchangeGateway,
    snapshot: &PersistedSnapshot,
    pairs: &[String],
) -> Result<Decimal> {
    let quote_pair = snapshot
        .position
        .as_ref()
        .map(|p| p.pair.as_str())
        .or_else(|| pairs.first().map(String::as_str))
        .ok_or_else(|| KeeperError::Validation("no pair configured".to_string()))?;
    let (_, quote) = split_pair(quote_pair)?;

    let balances = gateway.get_balance().await?;
    let mut equity = balances.get(quote).copied().unwrap_or(Decimal::ZERO);
    if let Some(pos) = &snapshot.position {
        equity += pos.side.sign() * pos.quantity * pos.entry_price;
    }
    Ok(equity)
}
