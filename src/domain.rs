// ===============================
// src/domain.rs
// ===============================
use std::num::NonZeroU32;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Order side as sent to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side { Buy, Sell }
impl Side { pub fn as_str(&self) -> &'static str { match self { Side::Buy => "BUY", Side::Sell => "SELL" } } }

/// Direction of the single open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide { Long, Short }
impl PositionSide {
    pub fn entry_side(&self) -> Side { match self { PositionSide::Long => Side::Buy, PositionSide::Short => Side::Sell } }
    pub fn exit_side(&self) -> Side { match self { PositionSide::Long => Side::Sell, PositionSide::Short => Side::Buy } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal { Buy, Sell, Hold }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason { TakeProfit, StopLoss, ForcedLiquidation }

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceBar { pub ts: NaiveDateTime, pub close: f64 }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub symbol: String,
    pub name: String,
    pub qty: i64,
    pub valuation: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum OrderKind {
    Market,
    // the control loop only sends market orders; kis.rs still encodes limits
    #[allow(dead_code)]
    Limit { price: f64 },
}

/// An order the controller wants placed. Quantity is non-zero by type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub cl_id: String,
    pub side: Side,
    pub qty: NonZeroU32,
    pub symbol: String,
    pub exchange: String,
    pub kind: OrderKind,
}

impl OrderIntent {
    pub fn market(side: Side, qty: NonZeroU32, symbol: &str, exchange: &str) -> Self {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(0);
        Self {
            cl_id: format!("CL-{}-{}", now, rand::thread_rng().gen::<u32>()),
            side,
            qty,
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            kind: OrderKind::Market,
        }
    }
}

/// Broker answer to a submit. Logged, never reasoned about further.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub accepted: bool,
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub raw: serde_json::Value,
}

// Audit events (one JSON line each)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    Startup {
        mode: String,
        backend: String,
        symbol: String,
        exchange: String,
        take_profit: f64,
        stop_loss: f64,
        daily_limit: f64,
        max_order_usd: f64,
        max_qty_per_order: u32,
    },
    DayRolled { trading_day: NaiveDate },
    MarketClosed,
    Dashboard { cash: f64, valuation: f64, holdings: Vec<Holding> },
    Waiting { reason: String, bars: usize },
    Signal { price: f64, rsi: f64, signal: Signal },
    Entry { side: PositionSide, qty: u32, price: f64, rsi: f64 },
    Exit { reason: ExitReason, side: PositionSide, qty: u32, entry: f64, price: f64, pnl_pct: f64, day_pnl_pct: f64 },
    OrderResponse { cl_id: String, side: Side, qty: u32, result: OrderResult },
    NoCapacity { cash: f64, price: f64 },
    Idle { signal: Signal },
    RiskBreach { day_pnl_pct: f64, limit: f64 },
    TransportError { error: String },
    Stopped { reason: String, open_position: Option<PositionSide> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub event: Event,
}
