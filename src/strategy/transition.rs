//! Order transitions and their effect on position and risk state.
//!
//! Every exchange event, whether streamed, polled, or replayed during
//! reconciliation, goes through [`apply_event`] for the order and through
//! [`Ledger::apply`] for the position and balance consequences.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::domain::{
    ExchangeEvent, IntentKind, LifecycleState, Order, OrderStatus, Position,
};
use crate::error::{KeeperError, Result};
use crate::exchange::ExchangeOrderState;
use crate::persistence::PersistedSnapshot;
use crate::strategy::risk::RiskGovernor;

/// What a single event did to an order
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Applied {
        from: OrderStatus,
        to: OrderStatus,
        /// Quantity and price actually credited, after clamping
        fill: Option<(Decimal, Decimal)>,
    },
    Ignored(&'static str),
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied { .. })
    }
}

/// Apply one exchange event to one order.
pub fn apply_event(order: &mut Order, event: &ExchangeEvent, now: DateTime<Utc>) -> Transition {
    let from = order.status;
    if from.is_terminal() {
        return Transition::Ignored("order already terminal");
    }

    match event {
        ExchangeEvent::Acked {
            exchange_order_id, ..
        } => {
            let mut changed = false;
            if order.exchange_order_id.is_none() {
                order.exchange_order_id = Some(exchange_order_id.clone());
                changed = true;
            }
            if from == OrderStatus::Pending {
                if let Some(refused) = refuse_backward(order, OrderStatus::Submitted) {
                    return refused;
                }
                order.status = OrderStatus::Submitted;
                changed = true;
            }
            if !changed {
                return Transition::Ignored("duplicate ack");
            }
            order.updated_at = now;
            Transition::Applied {
                from,
                to: order.status,
                fill: None,
            }
        }
        ExchangeEvent::PartialFill {
            quantity, price, ..
        }
        | ExchangeEvent::Fill {
            quantity, price, ..
        } => {
            let completes = matches!(event, ExchangeEvent::Fill { .. });
            apply_fill(order, *quantity, *price, completes, now)
        }
        ExchangeEvent::Cancelled { .. } => {
            if let Some(refused) = refuse_backward(order, OrderStatus::Cancelled) {
                return refused;
            }
            order.status = OrderStatus::Cancelled;
            order.updated_at = now;
            Transition::Applied {
                from,
                to: OrderStatus::Cancelled,
                fill: None,
            }
        }
        ExchangeEvent::Rejected { reason, .. } => {
            if let Some(refused) = refuse_backward(order, OrderStatus::Rejected) {
                return refused;
            }
            order.status = OrderStatus::Rejected;
            order.error = Some(reason.clone());
            order.updated_at = now;
            Transition::Applied {
                from,
                to: OrderStatus::Rejected,
                fill: None,
            }
        }
    }
}

fn apply_fill(
    order: &mut Order,
    quantity: Decimal,
    price: Decimal,
    completes: bool,
    now: DateTime<Utc>,
) -> Transition {
    let from = order.status;
    if order.is_fully_filled() {
        return Transition::Ignored("duplicate fill");
    }
    if quantity < Decimal::ZERO || (quantity == Decimal::ZERO && !completes) {
        return Transition::Ignored("empty fill");
    }

    let mut credited = quantity;
    let remaining = order.remaining();
    if credited > remaining {
        warn!(
            target: "data-integrity",
            client_order_id = %order.client_order_id,
            requested = %order.quantity,
            filled = %order.filled_quantity,
            delta = %quantity,
            "fill would overfill order, clamping"
        );
        credited = remaining;
    }

    let total = order.filled_quantity + credited;
    // A terminal fill from the exchange settles the order even when short
    let to = if completes || total >= order.quantity {
        OrderStatus::Filled
    } else {
        OrderStatus::PartiallyFilled
    };
    if let Some(refused) = refuse_backward(order, to) {
        return refused;
    }

    if credited > Decimal::ZERO {
        let prev_avg = order.avg_fill_price.unwrap_or(Decimal::ZERO);
        order.avg_fill_price = Some((prev_avg * order.filled_quantity + price * credited) / total);
        order.filled_quantity = total;
    }
    if to == OrderStatus::Filled && total < order.quantity {
        warn!(
            client_order_id = %order.client_order_id,
            requested = %order.quantity,
            filled = %total,
            "exchange completed order short of requested quantity"
        );
    }

    order.status = to;
    order.updated_at = now;

    Transition::Applied {
        from,
        to,
        fill: (credited > Decimal::ZERO).then_some((credited, price)),
    }
}

/// Status only moves forward; anything else is logged and dropped
fn refuse_backward(order: &Order, to: OrderStatus) -> Option<Transition> {
    if order.status.can_transition_to(to) {
        return None;
    }
    warn!(
        client_order_id = %order.client_order_id,
        from = %order.status,
        %to,
        "backward status transition refused"
    );
    Some(Transition::Ignored("backward transition"))
}

/// Events that bring a local order in line with the exchange's view of it,
/// in the order they must be applied: ack, fill delta, final status.
pub fn events_from_exchange(order: &Order, remote: &ExchangeOrderState) -> Vec<ExchangeEvent> {
    let order_ref = order.order_ref();
    let mut events = Vec::new();

    if order.exchange_order_id.is_none() || order.status == OrderStatus::Pending {
        events.push(ExchangeEvent::Acked {
            order_ref: order_ref.clone(),
            exchange_order_id: remote.exchange_order_id.clone(),
        });
    }
    // After the ack the order answers to its exchange id
    let order_ref = crate::domain::OrderRef::Exchange(remote.exchange_order_id.clone());

    let delta = remote.filled_quantity - order.filled_quantity;
    let fill_price = delta_price(order, remote, delta);

    match remote.status {
        OrderStatus::Filled => {
            events.push(ExchangeEvent::Fill {
                order_ref: order_ref.clone(),
                quantity: delta.max(Decimal::ZERO),
                price: fill_price,
            });
        }
        status => {
            if delta > Decimal::ZERO {
                events.push(ExchangeEvent::PartialFill {
                    order_ref: order_ref.clone(),
                    quantity: delta,
                    price: fill_price,
                });
            }
            match status {
                OrderStatus::Cancelled => events.push(ExchangeEvent::Cancelled { order_ref }),
                OrderStatus::Rejected => events.push(ExchangeEvent::Rejected {
                    order_ref,
                    reason: "rejected by exchange".to_string(),
                }),
                _ => {}
            }
        }
    }
    events
}

/// Price of the unseen fill delta, backed out of the exchange's running average
fn delta_price(order: &Order, remote: &ExchangeOrderState, delta: Decimal) -> Decimal {
    let remote_avg = remote
        .avg_fill_price
        .or(order.price)
        .unwrap_or(Decimal::ZERO);
    if delta <= Decimal::ZERO {
        return remote_avg;
    }
    let local_notional = order.avg_fill_price.unwrap_or(Decimal::ZERO) * order.filled_quantity;
    let derived = (remote_avg * remote.filled_quantity - local_notional) / delta;
    if derived > Decimal::ZERO {
        derived
    } else {
        remote_avg
    }
}

/// Exit levels applied to positions as they open
#[derive(Debug, Clone)]
pub struct ExitParams {
    pub profit_target: Decimal,
    pub stop_loss: Decimal,
    pub taker_fee: Decimal,
}

/// Outcome of applying an event to the snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub transition: Transition,
    pub realized_pnl: Option<Decimal>,
    pub guard: LifecycleState,
}

/// Owns the order/position half of the snapshot and routes P&L to the
/// risk governor. Shared by the lifecycle manager and reconciliation so
/// that a replayed event has exactly the effect a live one would.
pub struct Ledger<'a> {
    pub snapshot: &'a mut PersistedSnapshot,
    pub governor: &'a RiskGovernor,
    pub exits: &'a ExitParams,
}

impl<'a> Ledger<'a> {
    pub fn guard(&self) -> LifecycleState {
        LifecycleState::derive(self.snapshot.position.as_ref(), self.snapshot.live_order.as_ref())
    }

    pub fn apply(&mut self, event: &ExchangeEvent, now: DateTime<Utc>) -> Result<Applied> {
        let before = self.guard();
        let order_ref = event.order_ref();

        let Some(order) = self.snapshot.live_order.as_mut().filter(|o| o.matches(order_ref)) else {
            let reason = match &self.snapshot.last_order {
                Some(last) if last.matches(order_ref) => "order already settled",
                _ => "unknown order",
            };
            debug!(order_ref = %order_ref, event = event.name(), reason, "event ignored");
            return Ok(Applied {
                transition: Transition::Ignored(reason),
                realized_pnl: None,
                guard: before,
            });
        };

        let transition = apply_event(order, event, now);
        let (kind, pair, side, order_id, terminal, fully_filled) = (
            order.kind,
            order.pair.clone(),
            order.side,
            order.client_order_id.clone(),
            order.status.is_terminal(),
            order.status == OrderStatus::Filled,
        );

        let mut realized_pnl = None;
        if let Transition::Applied {
            fill: Some((qty, price)),
            ..
        } = &transition
        {
            realized_pnl = self.book_fill(kind, &pair, side, &order_id, *qty, *price, now)?;
        }

        if terminal {
            if kind == IntentKind::Close && fully_filled {
                if let Some(pos) = self.snapshot.position.take() {
                    info!(pair = %pos.pair, "position closed");
                }
            }
            self.snapshot.last_order = self.snapshot.live_order.take();
        }

        let after = self.guard();
        if before != after {
            if !before.can_transition_to(after) {
                warn!(from = %before, to = %after, "unexpected lifecycle transition");
            }
            info!(from = %before, to = %after, "lifecycle transition");
        }
        if let Transition::Applied { from, to, .. } = &transition {
            debug!(client_order_id = %order_id, %from, %to, event = event.name(), "order transition");
        }

        Ok(Applied {
            transition,
            realized_pnl,
            guard: after,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn book_fill(
        &mut self,
        kind: IntentKind,
        pair: &str,
        side: crate::domain::OrderSide,
        order_id: &str,
        quantity: Decimal,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Option<Decimal>> {
        match kind {
            IntentKind::Open => {
                match self.snapshot.position.as_mut() {
                    None => {
                        let pos = Position::open(
                            pair,
                            side,
                            price,
                            quantity,
                            order_id,
                            self.exits.profit_target,
                            self.exits.stop_loss,
                        );
                        info!(
                            pair,
                            entry = %pos.entry_price,
                            quantity = %pos.quantity,
                            target = %pos.target_price,
                            stop = %pos.stop_price,
                            "position opened"
                        );
                        self.snapshot.position = Some(pos);
                    }
                    Some(pos) if pos.opening_order_id == order_id => {
                        pos.add_fill(price, quantity, self.exits.profit_target, self.exits.stop_loss);
                    }
                    Some(pos) => {
                        return Err(KeeperError::Inconsistency(format!(
                            "opening fill for {} while position from {} is open",
                            order_id, pos.opening_order_id
                        )));
                    }
                }
                Ok(None)
            }
            IntentKind::Close => {
                let Some(pos) = self.snapshot.position.as_mut() else {
                    return Err(KeeperError::Inconsistency(format!(
                        "closing fill for {} with no open position",
                        order_id
                    )));
                };
                let quantity = quantity.min(pos.quantity);
                let pnl = pos.realized_pnl(price, quantity, self.exits.taker_fee);
                pos.quantity -= quantity;
                self.governor
                    .on_realized_pnl(pnl, &mut self.snapshot.risk, now);
                Ok(Some(pnl))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::domain::{OrderRef, OrderSide};
    use crate::strategy::risk::SizingParams;
    use rust_decimal_macros::dec;

    fn order(kind: IntentKind, side: OrderSide, qty: Decimal) -> Order {
        Order::new("BTC-USDT", side, kind, qty, Some(dec!(100)))
    }

    fn fill(o: &Order, qty: Decimal, price: Decimal) -> ExchangeEvent {
        ExchangeEvent::PartialFill {
            order_ref: OrderRef::Client(o.client_order_id.clone()),
            quantity: qty,
            price,
        }
    }

    fn governor() -> RiskGovernor {
        let cfg = AppConfig::default_config(true);
        RiskGovernor::new(
            cfg.risk,
            SizingParams {
                stop_loss: dec!(0.05),
                taker_fee: dec!(0),
            },
        )
    }

    fn exits() -> ExitParams {
        ExitParams {
            profit_target: dec!(0.15),
            stop_loss: dec!(0.05),
            taker_fee: dec!(0),
        }
    }

    #[test]
    fn partial_fills_accumulate_then_fill() {
        let mut o = order(IntentKind::Open, OrderSide::Buy, dec!(10));
        let now = Utc::now();
        let ev = fill(&o, dec!(4), dec!(100));
        let t = apply_event(&mut o, &ev, now);
        assert_eq!(o.status, OrderStatus::PartiallyFilled);
        assert!(t.is_applied());
        let ev = fill(&o, dec!(6), dec!(110));
        apply_event(&mut o, &ev, now);
        assert_eq!(o.status, OrderStatus::Filled);
        assert_eq!(o.avg_fill_price, Some(dec!(106)));
    }

    #[test]
    fn overfill_is_clamped_to_requested() {
        let mut o = order(IntentKind::Open, OrderSide::Buy, dec!(10));
        let now = Utc::now();
        let ev = fill(&o, dec!(8), dec!(100));
        apply_event(&mut o, &ev, now);
        let ev = fill(&o, dec!(5), dec!(100));
        let t = apply_event(&mut o, &ev, now);
        assert_eq!(o.filled_quantity, dec!(10));
        assert_eq!(o.status, OrderStatus::Filled);
        assert_eq!(
            t,
            Transition::Applied {
                from: OrderStatus::PartiallyFilled,
                to: OrderStatus::Filled,
                fill: Some((dec!(2), dec!(100))),
            }
        );
    }

    #[test]
    fn duplicate_fill_after_filled_is_ignored() {
        let mut o = order(IntentKind::Open, OrderSide::Buy, dec!(1));
        let now = Utc::now();
        let ev = fill(&o, dec!(1), dec!(100));
        apply_event(&mut o, &ev, now);
        assert_eq!(apply_event(&mut o, &ev, now), Transition::Ignored("order already terminal"));
        assert_eq!(o.filled_quantity, dec!(1));
    }

    #[test]
    fn short_completion_keeps_requested_quantity() {
        let mut o = order(IntentKind::Open, OrderSide::Buy, dec!(10));
        let now = Utc::now();
        let ev = fill(&o, dec!(4), dec!(100));
        apply_event(&mut o, &ev, now);
        let done = ExchangeEvent::Fill {
            order_ref: OrderRef::Client(o.client_order_id.clone()),
            quantity: dec!(2),
            price: dec!(101),
        };
        let t = apply_event(&mut o, &done, now);

        assert_eq!(o.status, OrderStatus::Filled);
        assert_eq!(o.quantity, dec!(10));
        assert_eq!(o.filled_quantity, dec!(6));
        assert_eq!(
            t,
            Transition::Applied {
                from: OrderStatus::PartiallyFilled,
                to: OrderStatus::Filled,
                fill: Some((dec!(2), dec!(101))),
            }
        );
    }

    #[test]
    fn status_never_moves_backward() {
        let mut o = order(IntentKind::Open, OrderSide::Buy, dec!(10));
        let now = Utc::now();
        let ev = fill(&o, dec!(4), dec!(100));
        apply_event(&mut o, &ev, now);
        assert_eq!(
            refuse_backward(&o, OrderStatus::Submitted),
            Some(Transition::Ignored("backward transition"))
        );
        assert_eq!(refuse_backward(&o, OrderStatus::PartiallyFilled), None);

        // A late ack only fills in the exchange id
        let ack = ExchangeEvent::Acked {
            order_ref: OrderRef::Client(o.client_order_id.clone()),
            exchange_order_id: "E1".into(),
        };
        assert!(apply_event(&mut o, &ack, now).is_applied());
        assert_eq!(o.status, OrderStatus::PartiallyFilled);
        assert_eq!(o.exchange_order_id.as_deref(), Some("E1"));
    }

    #[test]
    fn cancel_after_fill_is_noop() {
        let mut o = order(IntentKind::Open, OrderSide::Buy, dec!(1));
        let now = Utc::now();
        let ev = fill(&o, dec!(1), dec!(100));
        apply_event(&mut o, &ev, now);
        let cancel = ExchangeEvent::Cancelled {
            order_ref: OrderRef::Client(o.client_order_id.clone()),
        };
        assert!(!apply_event(&mut o, &cancel, now).is_applied());
        assert_eq!(o.status, OrderStatus::Filled);
    }

    #[test]
    fn exchange_state_replays_delta_then_status() {
        let mut o = order(IntentKind::Open, OrderSide::Buy, dec!(10));
        o.exchange_order_id = Some("E1".into());
        o.status = OrderStatus::PartiallyFilled;
        o.filled_quantity = dec!(2);
        o.avg_fill_price = Some(dec!(100));

        let remote = ExchangeOrderState {
            exchange_order_id: "E1".into(),
            client_order_id: Some(o.client_order_id.clone()),
            status: OrderStatus::Cancelled,
            filled_quantity: dec!(4),
            avg_fill_price: Some(dec!(101)),
        };
        let events = events_from_exchange(&o, &remote);
        assert_eq!(events.len(), 2);
        match &events[0] {
            ExchangeEvent::PartialFill { quantity, price, .. } => {
                assert_eq!(*quantity, dec!(2));
                assert_eq!(*price, dec!(102));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(events[1], ExchangeEvent::Cancelled { .. }));
    }

    #[test]
    fn ledger_opens_then_closes_position_with_pnl() {
        let g = governor();
        let x = exits();
        let mut snap = PersistedSnapshot::fresh(dec!(1000));
        let now = Utc::now();

        let open = order(IntentKind::Open, OrderSide::Buy, dec!(2));
        snap.live_order = Some(open.clone());
        {
            let mut ledger = Ledger { snapshot: &mut snap, governor: &g, exits: &x };
            ledger.apply(&fill(&open, dec!(1), dec!(100)), now).unwrap();
            assert_eq!(ledger.guard(), LifecycleState::AwaitingOpen);
            let applied = ledger.apply(&fill(&open, dec!(1), dec!(102)), now).unwrap();
            assert_eq!(applied.guard, LifecycleState::Open);
        }
        let pos = snap.position.clone().unwrap();
        assert_eq!(pos.quantity, dec!(2));
        assert_eq!(pos.entry_price, dec!(101));

        let close = order(IntentKind::Close, OrderSide::Sell, dec!(2));
        snap.live_order = Some(close.clone());
        let mut ledger = Ledger { snapshot: &mut snap, governor: &g, exits: &x };
        let applied = ledger.apply(&fill(&close, dec!(2), dec!(111)), now).unwrap();
        assert_eq!(applied.realized_pnl, Some(dec!(20)));
        assert_eq!(applied.guard, LifecycleState::Idle);
        assert!(snap.position.is_none());
        assert_eq!(snap.risk.current_balance, dec!(1020));
        assert_eq!(snap.last_order.as_ref().unwrap().client_order_id, close.client_order_id);
    }

    #[test]
    fn late_event_for_settled_order_is_ignored() {
        let g = governor();
        let x = exits();
        let mut snap = PersistedSnapshot::fresh(dec!(1000));
        let open = order(IntentKind::Open, OrderSide::Buy, dec!(1));
        snap.live_order = Some(open.clone());
        let mut ledger = Ledger { snapshot: &mut snap, governor: &g, exits: &x };
        ledger.apply(&fill(&open, dec!(1), dec!(100)), Utc::now()).unwrap();
        let again = ledger.apply(&fill(&open, dec!(1), dec!(100)), Utc::now()).unwrap();
        assert_eq!(again.transition, Transition::Ignored("order already settled"));
        assert_eq!(snap.position.unwrap().quantity, dec!(1));
    }
}
