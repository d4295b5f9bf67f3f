use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::OrderSide;

/// Why an exit was triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    ProfitTarget,
    StopLoss,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::ProfitTarget => "PROFIT_TARGET",
            ExitReason::StopLoss => "STOP_LOSS",
        }
    }
}

/// The single open position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub pair: String,
    pub side: OrderSide,
    /// Volume-weighted entry across the opening order's fills
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub entry_timestamp: DateTime<Utc>,
    pub target_price: Decimal,
    pub stop_price: Decimal,
    /// Client id of the order that opened it
    pub opening_order_id: String,
}

impl Position {
    /// Position created by the first fill of an opening order
    pub fn open(
        pair: &str,
        side: OrderSide,
        price: Decimal,
        quantity: Decimal,
        opening_order_id: &str,
        profit_target: Decimal,
        stop_loss: Decimal,
    ) -> Self {
        let mut position = Self {
            pair: pair.to_string(),
            side,
            entry_price: price,
            quantity,
            entry_timestamp: Utc::now(),
            target_price: Decimal::ZERO,
            stop_price: Decimal::ZERO,
            opening_order_id: opening_order_id.to_string(),
        };
        position.set_exit_levels(profit_target, stop_loss);
        position
    }

    fn set_exit_levels(&mut self, profit_target: Decimal, stop_loss: Decimal) {
        let sign = self.side.sign();
        self.target_price = self.entry_price * (Decimal::ONE + sign * profit_target);
        self.stop_price = self.entry_price * (Decimal::ONE - sign * stop_loss);
    }

    /// Fold a later fill of the opening order into the entry price
    pub fn add_fill(
        &mut self,
        price: Decimal,
        quantity: Decimal,
        profit_target: Decimal,
        stop_loss: Decimal,
    ) {
        let total = self.quantity + quantity;
        if total > Decimal::ZERO {
            self.entry_price = (self.entry_price * self.quantity + price * quantity) / total;
        }
        self.quantity = total;
        self.set_exit_levels(profit_target, stop_loss);
    }

    /// P&L realized by closing `quantity` at `exit_price`, net of taker fees on both legs
    pub fn realized_pnl(&self, exit_price: Decimal, quantity: Decimal, fee_rate: Decimal) -> Decimal {
        let gross = (exit_price - self.entry_price) * quantity * self.side.sign();
        let fees = fee_rate * (self.entry_price + exit_price) * quantity;
        gross - fees
    }

    pub fn exit_trigger(&self, last: Decimal) -> Option<ExitReason> {
        match self.side {
            OrderSide::Buy if last >= self.target_price => Some(ExitReason::ProfitTarget),
            OrderSide::Buy if last <= self.stop_price => Some(ExitReason::StopLoss),
            OrderSide::Sell if last <= self.target_price => Some(ExitReason::ProfitTarget),
            OrderSide::Sell if last >= self.stop_price => Some(ExitReason::StopLoss),
            _ => None,
        }
    }

    pub fn notional(&self, price: Decimal) -> Decimal {
        self.quantity * price
    }
}
