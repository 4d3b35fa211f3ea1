// ===============================
// src/sizing.rs
// ===============================
use crate::config::Limits;

/// Minimum dollar risk per trade, keeps tiny accounts from sizing to zero risk.
const MIN_RISK_AMOUNT: f64 = 1.0;
/// Minimum per-share risk, keeps a near-zero stop from exploding the size.
const MIN_PER_SHARE_RISK: f64 = 0.01;

#[derive(Debug, Clone)]
pub struct PositionSizer {
    pub risk_pct: f64,
    pub stop_pct: f64,
    pub max_order_notional: f64,
    pub max_qty_per_order: u32,
}

impl PositionSizer {
    pub fn from_limits(lim: &Limits) -> Self {
        Self {
            risk_pct: lim.risk_per_trade,
            stop_pct: lim.stop_loss,
            max_order_notional: lim.max_order_usd,
            max_qty_per_order: lim.max_qty_per_order,
        }
    }

    /// Quantity = min(notional cap, risk-based size, per-order cap), floored at 0.
    pub fn size(&self, cash: f64, price: f64) -> u32 {
        if !(price > 0.0) || !price.is_finite() {
            return 0;
        }

        // 1) notional cap
        let qty_cap_by_usd = floor_to_u32(self.max_order_notional / price);

        // 2) risk based
        let risk_amt = (cash * self.risk_pct).max(MIN_RISK_AMOUNT);
        let per_share_risk = (price * self.stop_pct).max(MIN_PER_SHARE_RISK);
        let qty_risk = floor_to_u32(risk_amt / per_share_risk);

        // 3) hard cap
        qty_risk.min(qty_cap_by_usd).min(self.max_qty_per_order)
    }
}

fn floor_to_u32(x: f64) -> u32 {
    if x.is_nan() || x <= 0.0 {
        0
    } else if x >= u32::MAX as f64 {
        u32::MAX
    } else {
        x.floor() as u32
    }
}
