// ===============================
// src/risk.rs (daily loss circuit breaker)
// ===============================
use chrono::NaiveDate;

/// Realized PnL accumulated for one trading day. Fractions add, they do not compound.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DailyRiskState {
    pub trading_day: NaiveDate,
    pub realized_pnl_pct: f64,
}

#[derive(Debug)]
pub struct RiskController {
    state: DailyRiskState,
    daily_limit: f64,
}

impl RiskController {
    /// `daily_limit` is a negative fraction, e.g. -0.03.
    pub fn new(today: NaiveDate, daily_limit: f64) -> Self {
        Self { state: DailyRiskState { trading_day: today, realized_pnl_pct: 0.0 }, daily_limit }
    }

    pub fn state(&self) -> DailyRiskState { self.state }

    pub fn daily_limit(&self) -> f64 { self.daily_limit }

    /// Resets the accumulator when `today` differs from the stored day. Returns true on reset.
    pub fn roll_day_if_needed(&mut self, today: NaiveDate) -> bool {
        if today == self.state.trading_day {
            return false;
        }
        self.state = DailyRiskState { trading_day: today, realized_pnl_pct: 0.0 };
        true
    }

    pub fn record_realized(&mut self, pnl_pct: f64) {
        self.state.realized_pnl_pct += pnl_pct;
    }

    pub fn breached(&self) -> bool {
        self.state.realized_pnl_pct <= self.daily_limit
    }
}
