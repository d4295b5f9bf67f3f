use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{IntentKind, Order, Position};

/// One-trade-at-a-time guard owned by the lifecycle manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    /// No position, no live order
    Idle,
    /// Opening order live
    AwaitingOpen,
    /// Position held, no live order
    Open,
    /// Closing order live
    AwaitingClose,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Idle => "IDLE",
            LifecycleState::AwaitingOpen => "AWAITING_OPEN",
            LifecycleState::Open => "OPEN",
            LifecycleState::AwaitingClose => "AWAITING_CLOSE",
        }
    }

    /// Derive the guard from what is held. A live opening order that already
    /// produced a position still counts as `AwaitingOpen`.
    pub fn derive(position: Option<&Position>, live_order: Option<&Order>) -> Self {
        match (position, live_order) {
            (_, Some(order)) if order.kind == IntentKind::Open => LifecycleState::AwaitingOpen,
            (_, Some(_)) => LifecycleState::AwaitingClose,
            (Some(_), None) => LifecycleState::Open,
            (None, None) => LifecycleState::Idle,
        }
    }

    /// Check if this state can transition to another state
    pub fn can_transition_to(&self, target: LifecycleState) -> bool {
        use LifecycleState::*;

        match (self, target) {
            (Idle, AwaitingOpen) => true,
            // Opening order filled, or died after a partial fill
            (AwaitingOpen, Open) => true,
            // Opening order died without fills
            (AwaitingOpen, Idle) => true,
            (Open, AwaitingClose) => true,
            // Closing order fully filled
            (AwaitingClose, Idle) => true,
            // Closing order died, position remains
            (AwaitingClose, Open) => true,
            (a, b) => *a == b,
        }
    }

    pub fn accepts_open_intent(&self) -> bool {
        *self == LifecycleState::Idle
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Capital-preservation bookkeeping, mutated only by the risk governor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    pub starting_balance: Decimal,
    pub current_balance: Decimal,
    /// Highest balance ever observed; never decreases
    pub peak_balance: Decimal,
    pub daily_pnl: Decimal,
    /// Balance when the current daily window opened
    pub daily_start_balance: Decimal,
    pub daily_window_start: DateTime<Utc>,
    /// Fractional decline of current balance from peak
    pub drawdown: Decimal,
    /// Set when the hard drawdown limit trips
    #[serde(default)]
    pub halted: Option<HaltRecord>,
}

impl RiskState {
    pub fn new(starting_balance: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            starting_balance,
            current_balance: starting_balance,
            peak_balance: starting_balance,
            daily_pnl: Decimal::ZERO,
            daily_start_balance: starting_balance,
            daily_window_start: now,
            drawdown: Decimal::ZERO,
            halted: None,
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    /// Daily P&L as a fraction of the window's opening balance
    pub fn daily_pnl_pct(&self) -> Decimal {
        if self.daily_start_balance <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.daily_pnl / self.daily_start_balance
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HaltRecord {
    pub reason: String,
    pub since: DateTime<Utc>,
}
