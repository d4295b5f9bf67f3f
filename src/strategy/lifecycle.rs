//! Order lifecycle manager.
//!
//! Turns intents into exchange orders and tracks them to a final status.
//! Every mutation of order, position and risk state happens under one
//! lock, and is persisted before it counts as committed. Intent to act is
//! written before the act: an order is saved as `Pending` before it is sent.

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, ReconciliationConfig};
use crate::domain::{
    ExchangeEvent, FillEvent, IntentKind, LifecycleState, Order, OrderSide, OrderStatus,
    TradeIntent,
};
use crate::error::{KeeperError, Result};
use crate::exchange::ExchangeGateway;
use crate::persistence::{PersistedSnapshot, SnapshotStore};
use crate::strategy::feeds::PriceCache;
use crate::strategy::reconciliation::{account_equity, Reconciler, ReconciliationReport};
use crate::strategy::risk::RiskGovernor;
use crate::strategy::transition::{events_from_exchange, Applied, ExitParams, Ledger, Transition};

/// Price precision for limit orders
const PRICE_DP: u32 = 8;

/// Execution settings the manager needs at decision time
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub pairs: Vec<String>,
    pub use_limit_orders: bool,
    pub max_slippage: Decimal,
    pub exits: ExitParams,
    pub tolerance: ReconciliationConfig,
}

impl LifecycleSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            pairs: config.pairs.clone(),
            use_limit_orders: config.execution.use_limit_orders,
            max_slippage: config.execution.max_slippage,
            exits: ExitParams {
                profit_target: config.execution.profit_target,
                stop_loss: config.execution.stop_loss,
                taker_fee: config.execution.taker_fee,
            },
            tolerance: config.reconciliation.clone(),
        }
    }
}

/// Whether the manager may talk to the exchange on its own initiative
#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    /// Startup: nothing is sent before the first reconciliation
    AwaitingReconciliation,
    Ready,
    /// Local state may not match an action already taken
    NeedsReconciliation(String),
}

struct Core {
    snapshot: PersistedSnapshot,
    phase: Phase,
    draining: bool,
}

pub struct OrderLifecycleManager {
    core: Mutex<Core>,
    gateway: ExchangeGateway,
    store: Arc<dyn SnapshotStore>,
    governor: RiskGovernor,
    prices: PriceCache,
    settings: LifecycleSettings,
}

impl OrderLifecycleManager {
    pub fn new(
        gateway: ExchangeGateway,
        store: Arc<dyn SnapshotStore>,
        governor: RiskGovernor,
        prices: PriceCache,
        settings: LifecycleSettings,
    ) -> Self {
        let snapshot = PersistedSnapshot::fresh(governor.config().starting_balance);
        Self {
            core: Mutex::new(Core {
                snapshot,
                phase: Phase::AwaitingReconciliation,
                draining: false,
            }),
            gateway,
            store,
            governor,
            prices,
            settings,
        }
    }

    // ==================== Queries ====================

    pub async fn snapshot(&self) -> PersistedSnapshot {
        self.core.lock().await.snapshot.clone()
    }

    pub async fn state(&self) -> LifecycleState {
        let core = self.core.lock().await;
        Self::guard(&core)
    }

    pub async fn is_ready(&self) -> bool {
        self.core.lock().await.phase == Phase::Ready
    }

    pub async fn needs_reconciliation(&self) -> bool {
        matches!(self.core.lock().await.phase, Phase::NeedsReconciliation(_))
    }

    pub fn prices(&self) -> &PriceCache {
        &self.prices
    }

    fn guard(core: &Core) -> LifecycleState {
        LifecycleState::derive(core.snapshot.position.as_ref(), core.snapshot.live_order.as_ref())
    }

    // ==================== Reconciliation ====================

    /// Resolve persisted state against the exchange. Holds the lock for the
    /// whole run, so no other exchange call can overlap it.
    pub async fn reconcile(&self) -> Result<ReconciliationReport> {
        let mut core = self.core.lock().await;
        let reconciler = Reconciler {
            gateway: &self.gateway,
            store: self.store.as_ref(),
            governor: &self.governor,
            exits: &self.settings.exits,
            pairs: &self.settings.pairs,
            tolerance: &self.settings.tolerance,
        };

        match reconciler.run().await {
            Ok((snapshot, report)) => {
                core.snapshot = snapshot;
                core.phase = Phase::Ready;
                info!(state = %Self::guard(&core), "lifecycle ready");
                Ok(report)
            }
            Err(e) => {
                error!("reconciliation failed: {}", e);
                if core.phase == Phase::Ready {
                    core.phase = Phase::NeedsReconciliation(e.to_string());
                }
                Err(e)
            }
        }
    }

    // ==================== Intents ====================

    /// Size, persist and submit an order for `intent`.
    pub async fn submit_intent(&self, intent: TradeIntent) -> Result<Order> {
        let mut core = self.core.lock().await;
        self.submit_locked(&mut core, intent).await
    }

    async fn submit_locked(&self, core: &mut Core, intent: TradeIntent) -> Result<Order> {
        if core.draining {
            return Err(KeeperError::ShuttingDown);
        }
        match &core.phase {
            Phase::AwaitingReconciliation => return Err(KeeperError::NotReconciled),
            Phase::NeedsReconciliation(reason) => {
                return Err(KeeperError::ReconciliationRequired(reason.clone()))
            }
            Phase::Ready => {}
        }
        if let Some(problem) = &core.snapshot.inconsistency {
            return Err(KeeperError::Inconsistency(problem.clone()));
        }

        let guard = Self::guard(core);
        let order = match intent.kind {
            IntentKind::Open => {
                if !guard.accepts_open_intent() {
                    return Err(KeeperError::Busy(format!("cannot open while {}", guard)));
                }
                if !self.settings.pairs.iter().any(|p| p == &intent.pair) {
                    return Err(KeeperError::Validation(format!("pair {} not configured", intent.pair)));
                }
                if self.prices.is_feed_lost() {
                    return Err(KeeperError::FeedLoss("entries disabled until the feed recovers".into()));
                }

                let now = Utc::now();
                self.governor.roll_daily_window(&mut core.snapshot.risk, now);
                let market = self.prices.market(&intent.pair).await;
                let quantity = match self
                    .governor
                    .size_order(&intent, &core.snapshot.risk, market.as_ref(), now)
                {
                    Ok(q) => q,
                    Err(veto) => {
                        info!(pair = %intent.pair, reason = %veto, "intent vetoed by risk governor");
                        return Err(veto.into());
                    }
                };
                Order::new(
                    &intent.pair,
                    intent.side,
                    IntentKind::Open,
                    quantity,
                    self.limit_price(intent.side, intent.reference_price),
                )
            }
            IntentKind::Close => {
                if guard != LifecycleState::Open {
                    return match guard {
                        LifecycleState::Idle => Err(KeeperError::NoPosition),
                        other => Err(KeeperError::Busy(format!("cannot close while {}", other))),
                    };
                }
                let Some(pos) = core.snapshot.position.as_ref() else {
                    return Err(KeeperError::NoPosition);
                };
                if pos.pair != intent.pair {
                    return Err(KeeperError::Validation(format!(
                        "close intent for {} but position is {}",
                        intent.pair, pos.pair
                    )));
                }
                let side = pos.side.opposite();
                Order::new(
                    &pos.pair,
                    side,
                    IntentKind::Close,
                    pos.quantity,
                    self.limit_price(side, intent.reference_price),
                )
            }
        };

        // Intent to act is durable before the act
        core.snapshot.live_order = Some(order.clone());
        if let Err(e) = self.store.save(&core.snapshot).await {
            core.snapshot.live_order = None;
            error!(client_order_id = %order.client_order_id, "could not persist pending order: {}", e);
            return Err(e);
        }
        info!(
            client_order_id = %order.client_order_id,
            pair = %order.pair,
            side = %order.side,
            kind = ?order.kind,
            quantity = %order.quantity,
            price = ?order.price,
            reason = intent.reason.as_deref().unwrap_or("-"),
            from = %guard,
            to = %Self::guard(core),
            "order pending"
        );

        match self.gateway.submit_order(&order.to_request()).await {
            Ok(ack) => {
                let event = ExchangeEvent::Acked {
                    order_ref: order.order_ref(),
                    exchange_order_id: ack.exchange_order_id.clone(),
                };
                self.apply_locked(core, &event).await?;
                info!(
                    client_order_id = %order.client_order_id,
                    exchange_order_id = %ack.exchange_order_id,
                    status = %ack.status,
                    "order acknowledged"
                );
                if ack.status != OrderStatus::Submitted {
                    // Already (partly) filled at the exchange: fetch the details now
                    self.sync_live_order_locked(core).await?;
                }
            }
            Err(e @ KeeperError::Permanent(_)) | Err(e @ KeeperError::DuplicateOrder(_)) => {
                warn!(client_order_id = %order.client_order_id, "order rejected: {}", e);
                let event = ExchangeEvent::Rejected {
                    order_ref: order.order_ref(),
                    reason: e.to_string(),
                };
                self.apply_locked(core, &event).await?;
                return Err(e);
            }
            Err(e) => {
                // The order may or may not exist on the exchange
                error!(
                    client_order_id = %order.client_order_id,
                    "submission outcome unknown, reconciliation required: {}", e
                );
                core.phase = Phase::NeedsReconciliation(format!(
                    "submission of {} failed: {}",
                    order.client_order_id, e
                ));
                return Err(e);
            }
        }

        let current = core
            .snapshot
            .live_order
            .clone()
            .or_else(|| core.snapshot.last_order.clone())
            .unwrap_or(order);
        Ok(current)
    }

    fn limit_price(&self, side: OrderSide, reference: Decimal) -> Option<Decimal> {
        if !self.settings.use_limit_orders {
            return None;
        }
        let buffer = match side {
            OrderSide::Buy => Decimal::ONE + self.settings.max_slippage,
            OrderSide::Sell => Decimal::ONE - self.settings.max_slippage,
        };
        Some((reference * buffer).round_dp(PRICE_DP))
    }

    // ==================== Exchange events ====================

    /// Apply an order event from any source. Returns once the result is durable.
    pub async fn on_exchange_event(&self, event: ExchangeEvent) -> Result<Applied> {
        let mut core = self.core.lock().await;
        if core.phase == Phase::AwaitingReconciliation {
            // Reconciliation re-derives everything from the exchange anyway
            debug!(event = event.name(), "event before reconciliation ignored");
            return Ok(Applied {
                transition: Transition::Ignored("not reconciled"),
                realized_pnl: None,
                guard: Self::guard(&core),
            });
        }
        self.apply_locked(&mut core, &event).await
    }

    /// Apply a fill delta to the matching order
    pub async fn on_fill_event(&self, fill: FillEvent) -> Result<Applied> {
        self.on_exchange_event(fill.into()).await
    }

    async fn apply_locked(&self, core: &mut Core, event: &ExchangeEvent) -> Result<Applied> {
        let now = Utc::now();
        let applied = {
            let mut ledger = Ledger {
                snapshot: &mut core.snapshot,
                governor: &self.governor,
                exits: &self.settings.exits,
            };
            ledger.apply(event, now)?
        };
        if applied.transition.is_applied() {
            self.commit_after_action(core).await?;
        }
        Ok(applied)
    }

    /// Persist state that reflects an action already taken on the exchange.
    /// If that fails the action must not be repeated blindly.
    async fn commit_after_action(&self, core: &mut Core) -> Result<()> {
        if let Err(e) = self.store.save(&core.snapshot).await {
            error!("snapshot write failed after exchange action, reconciliation required: {}", e);
            core.phase = Phase::NeedsReconciliation(format!("snapshot write failed: {}", e));
            return Err(e);
        }
        Ok(())
    }

    // ==================== Cancel / poll ====================

    /// Cancel the live order. A fill that won the race takes precedence.
    pub async fn cancel_live_order(&self) -> Result<Order> {
        let mut core = self.core.lock().await;
        if core.phase == Phase::AwaitingReconciliation {
            return Err(KeeperError::NotReconciled);
        }
        let Some(order) = core.snapshot.live_order.clone() else {
            return Err(KeeperError::NoLiveOrder);
        };

        match self.gateway.cancel_order(&order.pair, &order.order_ref()).await {
            Ok(accepted) => {
                debug!(client_order_id = %order.client_order_id, accepted, "cancel requested");
            }
            Err(KeeperError::Permanent(reason)) => {
                // Usually "already filled/cancelled"; the status query decides
                debug!(client_order_id = %order.client_order_id, %reason, "cancel refused");
            }
            Err(e) => return Err(e),
        }

        self.sync_live_order_locked(&mut core).await?;
        let settled = core
            .snapshot
            .live_order
            .clone()
            .or_else(|| core.snapshot.last_order.clone())
            .filter(|o| o.client_order_id == order.client_order_id)
            .unwrap_or(order);
        info!(client_order_id = %settled.client_order_id, status = %settled.status, "cancel resolved");
        Ok(settled)
    }

    /// Pull the live order's status from the exchange and apply any change
    pub async fn poll_live_order(&self) -> Result<()> {
        let mut core = self.core.lock().await;
        if core.phase != Phase::Ready {
            return Ok(());
        }
        self.sync_live_order_locked(&mut core).await
    }

    async fn sync_live_order_locked(&self, core: &mut Core) -> Result<()> {
        let Some(order) = core.snapshot.live_order.clone() else {
            return Ok(());
        };
        let remote = self
            .gateway
            .get_order_status(&order.pair, &order.order_ref())
            .await?;
        let Some(remote) = remote else {
            if order.status == OrderStatus::Pending {
                return Ok(());
            }
            warn!(client_order_id = %order.client_order_id, "live order missing on exchange");
            core.phase = Phase::NeedsReconciliation(format!(
                "order {} missing on exchange",
                order.client_order_id
            ));
            return Err(KeeperError::ReconciliationRequired(format!(
                "order {} missing on exchange",
                order.client_order_id
            )));
        };

        for event in events_from_exchange(&order, &remote) {
            self.apply_locked(core, &event).await?;
        }
        Ok(())
    }

    // ==================== Periodic ====================

    /// Exit check against the latest price. Skips if another transition holds the lock.
    pub async fn tick(&self) -> Result<Option<Order>> {
        let Ok(mut core) = self.core.try_lock() else {
            return Ok(None);
        };
        if core.phase != Phase::Ready || core.draining {
            return Ok(None);
        }
        if Self::guard(&core) != LifecycleState::Open {
            return Ok(None);
        }
        let Some(pos) = core.snapshot.position.clone() else {
            return Ok(None);
        };
        let Some(last) = self.prices.last(&pos.pair).await else {
            return Ok(None);
        };
        let Some(reason) = pos.exit_trigger(last) else {
            return Ok(None);
        };

        info!(
            pair = %pos.pair,
            %last,
            entry = %pos.entry_price,
            reason = reason.as_str(),
            "exit triggered"
        );
        let intent = TradeIntent::close(&pos.pair, pos.side.opposite(), last, reason.as_str());
        self.submit_locked(&mut core, intent).await.map(Some)
    }

    /// Re-read account equity and hand it to the risk governor
    pub async fn refresh_balance(&self) -> Result<Decimal> {
        let mut core = self.core.lock().await;
        if core.phase != Phase::Ready {
            return Err(KeeperError::NotReconciled);
        }
        let equity =
            account_equity(&self.gateway, &core.snapshot, &self.settings.pairs).await?;
        self.governor
            .refresh_balance(equity, &mut core.snapshot.risk, Utc::now());
        self.store.save(&core.snapshot).await?;
        debug!(%equity, drawdown = %core.snapshot.risk.drawdown, "balance refreshed");
        Ok(equity)
    }

    /// Lift a sticky risk halt
    pub async fn reset_halt(&self) -> Result<bool> {
        let mut core = self.core.lock().await;
        if core.phase == Phase::AwaitingReconciliation {
            return Err(KeeperError::NotReconciled);
        }
        let reset = self.governor.reset_halt(&mut core.snapshot.risk);
        if reset {
            self.store.save(&core.snapshot).await?;
        }
        Ok(reset)
    }

    // ==================== Shutdown ====================

    /// Stop accepting intents and write the final snapshot. Waits for any
    /// transition in progress, since it holds the lock.
    pub async fn drain(&self) -> Result<()> {
        let mut core = self.core.lock().await;
        core.draining = true;
        if core.phase == Phase::AwaitingReconciliation {
            // Nothing loaded, nothing to write
            return Ok(());
        }
        self.store.save(&core.snapshot).await?;
        info!(state = %Self::guard(&core), "lifecycle drained, final snapshot written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MarketConditions, OrderRef};
    use crate::exchange::{PaperExchange, RetryPolicy};
    use crate::persistence::MemoryStore;
    use crate::strategy::risk::SizingParams;
    use rust_decimal_macros::dec;

    struct Harness {
        paper: Arc<PaperExchange>,
        store: Arc<MemoryStore>,
        manager: OrderLifecycleManager,
    }

    async fn harness() -> Harness {
        let mut config = AppConfig::default_config(true);
        config.execution.taker_fee = dec!(0);
        let paper = Arc::new(PaperExchange::new(dec!(1000), "USDT"));
        let store = Arc::new(MemoryStore::new());
        let prices = PriceCache::new();
        prices
            .update(MarketConditions {
                pair: "BTC-USDT".into(),
                last: dec!(100),
                best_bid: Some(dec!(99.99)),
                best_ask: Some(dec!(100.01)),
                volume_24h: dec!(10000000),
                timestamp: Utc::now(),
            })
            .await;
        let governor = RiskGovernor::new(
            config.risk.clone(),
            SizingParams {
                stop_loss: config.execution.stop_loss,
                taker_fee: config.execution.taker_fee,
            },
        );
        let manager = OrderLifecycleManager::new(
            ExchangeGateway::new(paper.clone(), RetryPolicy::immediate(3)),
            store.clone(),
            governor,
            prices,
            LifecycleSettings::from_config(&config),
        );
        Harness {
            paper,
            store,
            manager,
        }
    }

    fn open_btc() -> TradeIntent {
        TradeIntent::open("BTC-USDT", OrderSide::Buy, dec!(100))
    }

    #[tokio::test]
    async fn refuses_intents_before_reconciliation() {
        let h = harness().await;
        let err = h.manager.submit_intent(open_btc()).await.unwrap_err();
        assert!(matches!(err, KeeperError::NotReconciled));
        assert_eq!(h.paper.submit_calls().await, 0);
    }

    #[tokio::test]
    async fn open_intent_is_persisted_then_submitted() {
        let h = harness().await;
        h.manager.reconcile().await.unwrap();

        let order = h.manager.submit_intent(open_btc()).await.unwrap();
        assert_eq!(order.status, OrderStatus::Submitted);
        assert!(order.exchange_order_id.is_some());
        // 1000 * 0.5 = 500 notional at 100
        assert_eq!(order.quantity, dec!(5));
        assert_eq!(order.price, Some(dec!(100.2)));

        let saved = h.store.current().await.unwrap();
        assert_eq!(saved.live_order.unwrap().client_order_id, order.client_order_id);
        assert_eq!(h.manager.state().await, LifecycleState::AwaitingOpen);
    }

    #[tokio::test]
    async fn second_open_is_busy_for_any_intent() {
        let h = harness().await;
        h.manager.reconcile().await.unwrap();
        h.manager.submit_intent(open_btc()).await.unwrap();

        for price in [dec!(1), dec!(100), dec!(99999)] {
            let err = h
                .manager
                .submit_intent(TradeIntent::open("BTC-USDT", OrderSide::Buy, price))
                .await
                .unwrap_err();
            assert!(matches!(err, KeeperError::Busy(_)), "{err:?}");
        }
        assert_eq!(h.paper.order_count().await, 1);
    }

    #[tokio::test]
    async fn fills_open_position_and_exit_closes_it() {
        let h = harness().await;
        h.manager.reconcile().await.unwrap();
        let order = h.manager.submit_intent(open_btc()).await.unwrap();
        let r = OrderRef::Client(order.client_order_id.clone());

        h.paper.fill(&r, dec!(5), dec!(100)).await.unwrap();
        let applied = h
            .manager
            .on_fill_event(FillEvent {
                order_ref: r.clone(),
                quantity_delta: dec!(5),
                price: dec!(100),
            })
            .await
            .unwrap();
        assert_eq!(applied.guard, LifecycleState::Open);

        // Duplicate delivery of the same fill changes nothing
        let dup = h
            .manager
            .on_fill_event(FillEvent {
                order_ref: r,
                quantity_delta: dec!(5),
                price: dec!(100),
            })
            .await
            .unwrap();
        assert!(!dup.transition.is_applied());
        assert_eq!(h.manager.snapshot().await.position.unwrap().quantity, dec!(5));

        h.manager
            .prices()
            .update(MarketConditions {
                pair: "BTC-USDT".into(),
                last: dec!(116),
                best_bid: None,
                best_ask: None,
                volume_24h: dec!(10000000),
                timestamp: Utc::now(),
            })
            .await;
        let close = h.manager.tick().await.unwrap().expect("exit should trigger");
        assert_eq!(close.kind, IntentKind::Close);
        assert_eq!(close.side, OrderSide::Sell);
        assert_eq!(close.quantity, dec!(5));
        assert_eq!(h.manager.state().await, LifecycleState::AwaitingClose);

        let cr = OrderRef::Client(close.client_order_id.clone());
        h.paper.fill(&cr, dec!(5), dec!(116)).await.unwrap();
        h.manager.poll_live_order().await.unwrap();

        let snap = h.manager.snapshot().await;
        assert!(snap.position.is_none());
        assert_eq!(snap.risk.current_balance, dec!(1080));
        assert_eq!(h.manager.state().await, LifecycleState::Idle);
    }

    #[tokio::test]
    async fn permanent_rejection_marks_order_rejected() {
        let h = harness().await;
        h.manager.reconcile().await.unwrap();
        h.paper.reject_next("51008 insufficient balance").await;

        let err = h.manager.submit_intent(open_btc()).await.unwrap_err();
        assert!(matches!(err, KeeperError::Permanent(_)));

        let snap = h.store.current().await.unwrap();
        assert!(snap.live_order.is_none());
        assert_eq!(snap.last_order.unwrap().status, OrderStatus::Rejected);
        assert_eq!(h.manager.state().await, LifecycleState::Idle);
    }

    #[tokio::test]
    async fn exhausted_retries_demand_reconciliation() {
        let h = harness().await;
        h.manager.reconcile().await.unwrap();
        h.paper.fail_next_submits(3).await;

        let err = h.manager.submit_intent(open_btc()).await.unwrap_err();
        assert!(matches!(err, KeeperError::RetriesExhausted { attempts: 3, .. }));
        assert!(h.manager.needs_reconciliation().await);
        assert_eq!(h.paper.order_count().await, 0);

        let err = h.manager.submit_intent(open_btc()).await.unwrap_err();
        assert!(matches!(err, KeeperError::ReconciliationRequired(_)));

        // The pending order never reached the exchange
        h.manager.reconcile().await.unwrap();
        let snap = h.manager.snapshot().await;
        assert!(snap.live_order.is_none());
        assert_eq!(snap.last_order.unwrap().status, OrderStatus::Rejected);
        assert!(h.manager.submit_intent(open_btc()).await.is_ok());
    }

    #[tokio::test]
    async fn pending_write_failure_sends_nothing() {
        let h = harness().await;
        h.manager.reconcile().await.unwrap();
        h.store.fail_next_saves(1);

        let err = h.manager.submit_intent(open_btc()).await.unwrap_err();
        assert!(matches!(err, KeeperError::Persistence(_)));
        assert_eq!(h.paper.submit_calls().await, 0);
        assert_eq!(h.manager.state().await, LifecycleState::Idle);
    }

    #[tokio::test]
    async fn cancel_race_with_fill_keeps_the_fill() {
        let h = harness().await;
        h.manager.reconcile().await.unwrap();
        let order = h.manager.submit_intent(open_btc()).await.unwrap();
        h.paper
            .fill(&OrderRef::Client(order.client_order_id.clone()), dec!(5), dec!(100))
            .await
            .unwrap();

        let settled = h.manager.cancel_live_order().await.unwrap();
        assert_eq!(settled.status, OrderStatus::Filled);
        assert_eq!(h.manager.snapshot().await.position.unwrap().quantity, dec!(5));
    }

    #[tokio::test]
    async fn confirmed_cancel_returns_to_idle() {
        let h = harness().await;
        h.manager.reconcile().await.unwrap();
        h.manager.submit_intent(open_btc()).await.unwrap();

        let settled = h.manager.cancel_live_order().await.unwrap();
        assert_eq!(settled.status, OrderStatus::Cancelled);
        assert_eq!(h.manager.state().await, LifecycleState::Idle);
    }

    #[tokio::test]
    async fn drain_refuses_new_intents() {
        let h = harness().await;
        h.manager.reconcile().await.unwrap();
        h.manager.drain().await.unwrap();
        let err = h.manager.submit_intent(open_btc()).await.unwrap_err();
        assert!(matches!(err, KeeperError::ShuttingDown));
    }

    #[tokio::test]
    async fn feed_loss_blocks_entries() {
        let h = harness().await;
        h.manager.reconcile().await.unwrap();
        h.manager.prices().mark_feed_lost();
        let err = h.manager.submit_intent(open_btc()).await.unwrap_err();
        assert!(matches!(err, KeeperError::FeedLoss(_)));
    }
}
