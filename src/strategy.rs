// ===============================
// src/strategy.rs
// ===============================
//
// RSI mean-reversion:
// - compute_rsi : rolling simple-mean RSI over closes (oldest first)
// - signal      : contrarian thresholds, oversold -> Buy, overbought -> Sell
//
// Notes:
// - Averages are plain trailing means over `period` deltas (not Wilder).
// - Loss average is floored at LOSS_FLOOR, so a window without losses pushes
//   RSI to ~100 instead of dividing by zero.
//

use crate::domain::Signal;

pub const DEFAULT_PERIOD: usize = 14;
pub const OVERSOLD: f64 = 25.0;
pub const OVERBOUGHT: f64 = 75.0;
const LOSS_FLOOR: f64 = 1e-9;

/// RSI aligned 1:1 with `prices`. Index `i` is `None` until `period` deltas
/// exist (i < period).
pub fn compute_rsi(prices: &[f64], period: usize) -> Vec<Option<f64>> {
    let n = prices.len();
    let mut out = vec![None; n];
    if period == 0 || n <= period {
        return out;
    }

    let mut gain_sum = 0.0;
    let mut loss_sum = 0.0;
    for i in 1..n {
        let delta = prices[i] - prices[i - 1];
        gain_sum += delta.max(0.0);
        loss_sum += (-delta).max(0.0);

        // drop the delta that left the window
        if i > period {
            let old = prices[i - period] - prices[i - period - 1];
            gain_sum -= old.max(0.0);
            loss_sum -= (-old).max(0.0);
        }

        if i >= period {
            let gain = (gain_sum / period as f64).max(0.0);
            let loss = (loss_sum / period as f64).max(LOSS_FLOOR);
            let rs = gain / loss;
            out[i] = Some((100.0 - 100.0 / (1.0 + rs)).clamp(0.0, 100.0));
        }
    }
    out
}

/// Latest RSI, only when the series is strictly longer than `period`.
pub fn latest_rsi(prices: &[f64], period: usize) -> Option<f64> {
    if prices.len() <= period {
        return None;
    }
    compute_rsi(prices, period).last().copied().flatten()
}

/// Maps the latest RSI to a trading signal. Boundaries are Hold.
pub fn signal(rsi_last: f64) -> Signal {
    if rsi_last < OVERSOLD {
        Signal::Buy
    } else if rsi_last > OVERBOUGHT {
        Signal::Sell
    } else {
        Signal::Hold
    }
}
