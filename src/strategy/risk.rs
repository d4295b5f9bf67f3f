use chrono::{DateTime, Duration, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::{error, info, warn};

use crate::config::{HaltPolicy, RiskConfig};
use crate::domain::{HaltRecord, MarketConditions, RiskState, TradeIntent};
use crate::error::RiskVeto;

/// Quantity precision for sized orders
const QUANTITY_DP: u32 = 8;

/// Sizing inputs that come from execution settings rather than risk limits
#[derive(Debug, Clone)]
pub struct SizingParams {
    /// Stop distance used to turn risk-per-trade into notional
    pub stop_loss: Decimal,
    pub taker_fee: Decimal,
}

/// Risk governor: sizes opening orders and owns every mutation of `RiskState`.
///
/// Holds no state of its own; the `RiskState` it works on lives in the
/// snapshot, under the lifecycle manager's lock.
#[derive(Debug, Clone)]
pub struct RiskGovernor {
    config: RiskConfig,
    sizing: SizingParams,
}

impl RiskGovernor {
    pub fn new(config: RiskConfig, sizing: SizingParams) -> Self {
        Self { config, sizing }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    // ==================== Sizing ====================

    /// Allowed quantity for an opening intent, or the reason to stay flat.
    ///
    /// All fractions apply to the balance at decision time.
    pub fn size_order(
        &self,
        intent: &TradeIntent,
        state: &RiskState,
        market: Option<&MarketConditions>,
        now: DateTime<Utc>,
    ) -> Result<Decimal, RiskVeto> {
        if let Some(halt) = &state.halted {
            return Err(RiskVeto::Halted {
                reason: halt.reason.clone(),
            });
        }

        if state.drawdown > self.config.hard_drawdown {
            return Err(RiskVeto::HardDrawdown {
                drawdown: state.drawdown,
                limit: self.config.hard_drawdown,
            });
        }

        // A window that has already ended no longer counts against us
        if !self.window_expired(state, now) {
            let loss_pct = state.daily_pnl_pct();
            if loss_pct < -self.config.daily_loss_cap {
                return Err(RiskVeto::DailyLossCap {
                    loss_pct,
                    cap: self.config.daily_loss_cap,
                });
            }
        }

        let balance = state.current_balance;
        if balance <= Decimal::ZERO || intent.reference_price <= Decimal::ZERO {
            return Err(RiskVeto::InsufficientBalance { balance });
        }

        let notional = self.candidate_notional(balance, state.drawdown);
        self.check_liquidity(&intent.pair, notional, market)?;

        let quantity = (notional / intent.reference_price)
            .round_dp_with_strategy(QUANTITY_DP, RoundingStrategy::ToZero);
        if quantity <= Decimal::ZERO {
            return Err(RiskVeto::ZeroSize);
        }
        Ok(quantity)
    }

    /// Notional after risk cap, position cap, drawdown reduction and fees
    pub fn candidate_notional(&self, balance: Decimal, drawdown: Decimal) -> Decimal {
        let position_cap = balance * self.config.max_position_size;
        let risk_based = if self.sizing.stop_loss > Decimal::ZERO {
            balance * self.config.max_risk_per_trade / self.sizing.stop_loss
        } else {
            position_cap
        };

        let mut notional = risk_based.min(position_cap);
        if drawdown > self.config.soft_drawdown {
            notional *= self.config.drawdown_size_multiplier;
        }
        notional * (Decimal::ONE - self.sizing.taker_fee)
    }

    fn check_liquidity(
        &self,
        pair: &str,
        notional: Decimal,
        market: Option<&MarketConditions>,
    ) -> Result<(), RiskVeto> {
        let Some(market) = market else {
            return Err(RiskVeto::NoMarketData {
                pair: pair.to_string(),
            });
        };

        if market.volume_24h < self.config.min_24h_volume
            || notional > market.volume_24h * self.config.max_volume_participation
        {
            return Err(RiskVeto::InsufficientLiquidity {
                notional,
                volume: market.volume_24h,
            });
        }

        if let Some(spread) = market.relative_spread() {
            if spread > self.config.max_spread {
                return Err(RiskVeto::SpreadTooWide {
                    spread,
                    max: self.config.max_spread,
                });
            }
        }
        Ok(())
    }

    // ==================== State updates ====================

    /// Apply realized P&L from a closing fill
    pub fn on_realized_pnl(&self, delta: Decimal, state: &mut RiskState, now: DateTime<Utc>) {
        self.roll_daily_window(state, now);
        state.current_balance += delta;
        state.daily_pnl += delta;
        self.after_balance_change(state, now);

        info!(
            pnl = %delta,
            balance = %state.current_balance,
            daily_pnl = %state.daily_pnl,
            drawdown = %state.drawdown,
            "realized pnl recorded"
        );
    }

    /// Replace current balance with an observed account equity
    pub fn refresh_balance(&self, equity: Decimal, state: &mut RiskState, now: DateTime<Utc>) {
        self.roll_daily_window(state, now);
        state.current_balance = equity;
        self.after_balance_change(state, now);
    }

    /// First observation of the account on a cold start
    pub fn seed_balance(&self, equity: Decimal, state: &mut RiskState, now: DateTime<Utc>) {
        *state = RiskState::new(equity, now);
        info!(balance = %equity, "risk state seeded from exchange balance");
    }

    /// Reset the daily accumulator if the window boundary has passed.
    /// Returns true when a reset happened.
    pub fn roll_daily_window(&self, state: &mut RiskState, now: DateTime<Utc>) -> bool {
        if !self.window_expired(state, now) {
            return false;
        }
        let window = self.window();
        let mut start = state.daily_window_start;
        while start + window <= now {
            start += window;
        }
        info!(
            previous_pnl = %state.daily_pnl,
            balance = %state.current_balance,
            "daily window rolled"
        );
        state.daily_window_start = start;
        state.daily_pnl = Decimal::ZERO;
        state.daily_start_balance = state.current_balance;
        true
    }

    /// Manual intervention: lift a sticky halt
    pub fn reset_halt(&self, state: &mut RiskState) -> bool {
        match state.halted.take() {
            Some(halt) => {
                info!(reason = %halt.reason, "halt reset by operator");
                true
            }
            None => false,
        }
    }

    fn window(&self) -> Duration {
        Duration::hours(self.config.daily_window_hours.max(1))
    }

    fn window_expired(&self, state: &RiskState, now: DateTime<Utc>) -> bool {
        now >= state.daily_window_start + self.window()
    }

    fn after_balance_change(&self, state: &mut RiskState, now: DateTime<Utc>) {
        if state.current_balance > state.peak_balance {
            state.peak_balance = state.current_balance;
        }
        state.drawdown = drawdown(state.peak_balance, state.current_balance);

        if state.drawdown > self.config.hard_drawdown && state.halted.is_none() {
            error!(
                drawdown = %state.drawdown,
                peak = %state.peak_balance,
                balance = %state.current_balance,
                "HARD DRAWDOWN HALT"
            );
            state.halted = Some(HaltRecord {
                reason: format!(
                    "drawdown {} exceeded hard limit {}",
                    state.drawdown.round_dp(4),
                    self.config.hard_drawdown
                ),
                since: now,
            });
        } else if state.halted.is_some()
            && self.config.halt_policy == HaltPolicy::AutoResume
            && state.drawdown <= self.config.soft_drawdown
        {
            warn!(drawdown = %state.drawdown, "drawdown recovered, halt lifted");
            state.halted = None;
        }
    }
}

/// Fractional decline from peak
pub fn drawdown(peak: Decimal, current: Decimal) -> Decimal {
    if peak <= Decimal::ZERO || current >= peak {
        return Decimal::ZERO;
    }
    (peak - current) / peak
}
