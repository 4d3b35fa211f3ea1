// ===============================
// src/feed.rs
// ===============================
//
// Market data adapters:
// - MarketDataFeed : what the control loop consumes (bars oldest first,
//                    close already numeric)
// - SimFeed        : random-walk generator, one new bar per fetch
// - KIS REST bars live in kis.rs
//
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;

use crate::domain::PriceBar;
use crate::gateway::GatewayError;

#[async_trait]
pub trait MarketDataFeed: Send + Sync {
    async fn fetch_bars(
        &self,
        symbol: &str,
        exchange: &str,
        interval_minutes: u32,
    ) -> Result<Vec<PriceBar>, GatewayError>;
}

struct Tape {
    bars: VecDeque<PriceBar>,
    cap: usize,
}

impl Tape {
    fn last(&self) -> f64 {
        self.bars.back().map(|b| b.close).unwrap_or(0.0)
    }

    // one step of the walk, in cents, floored at 1.00
    fn step(&mut self, minutes: u32) {
        let cents = rand::thread_rng().gen_range(-30..=30);
        let close = ((self.last() * 100.0).round() + cents as f64).max(100.0) / 100.0;
        let ts = self
            .bars
            .back()
            .map(|b| b.ts + ChronoDuration::minutes(minutes as i64))
            .unwrap_or_else(|| Utc::now().naive_utc());
        if self.bars.len() == self.cap {
            self.bars.pop_front();
        }
        self.bars.push_back(PriceBar { ts, close });
    }
}

/// In-process random-walk feed for dry runs. Clones share the same tape.
#[derive(Clone)]
pub struct SimFeed {
    symbol: String,
    tape: Arc<Mutex<Tape>>,
}

impl SimFeed {
    /// Pre-fills `window` bars so indicators are ready on the first cycle.
    pub fn new(symbol: &str, start_px: f64, window: usize) -> Self {
        let cap = window.max(1);
        let start = Utc::now().naive_utc() - ChronoDuration::minutes(cap as i64);
        let mut tape = Tape { bars: VecDeque::with_capacity(cap), cap };
        tape.bars.push_back(PriceBar { ts: start, close: start_px.max(1.0) });
        while tape.bars.len() < cap {
            tape.step(1);
        }
        Self { symbol: symbol.to_string(), tape: Arc::new(Mutex::new(tape)) }
    }

    pub fn symbol(&self) -> &str { &self.symbol }

    pub fn last_price(&self) -> f64 {
        self.tape.lock().map(|t| t.last()).unwrap_or(0.0)
    }

    fn snapshot(&self, minutes: u32) -> Result<Vec<PriceBar>, GatewayError> {
        let mut tape = self.tape.lock().map_err(|_| GatewayError::Transport("sim tape poisoned".into()))?;
        tape.step(minutes);
        Ok(tape.bars.iter().copied().collect())
    }
}

#[async_trait]
impl MarketDataFeed for SimFeed {
    async fn fetch_bars(
        &self,
        symbol: &str,
        _exchange: &str,
        interval_minutes: u32,
    ) -> Result<Vec<PriceBar>, GatewayError> {
        if !symbol.eq_ignore_ascii_case(&self.symbol) {
            return Err(GatewayError::Config(format!("sim feed serves {}, not {}", self.symbol, symbol)));
        }
        self.snapshot(interval_minutes)
    }
}
