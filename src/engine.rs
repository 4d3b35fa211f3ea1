// ===============================
// src/engine.rs (control loop)
// ===============================
//
// One sequential cycle per interval:
//   roll day -> session gate -> fetch account/bars -> RSI/signal
//   -> TP/SL exit -> circuit breaker -> entry -> pre-close liquidation
//
// Error policy per cycle:
//   Transport -> log, fixed backoff, next cycle
//   Data      -> wait, next cycle
//   Config    -> fatal, run() returns Err
//   Breach    -> run() returns Ok(StopReason::RiskLimit), never resumes
//
// Shutdown is only observed between cycles (at the sleep), so an order that
// was already sent always finishes its bookkeeping.
//
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::calendar::MarketCalendar;
use crate::config::{Args, Limits, Timings};
use crate::domain::{Event, ExitReason, OrderIntent, PositionSide, Signal};
use crate::feed::MarketDataFeed;
use crate::gateway::{AccountGateway, ExecutionGateway, GatewayError};
use crate::metrics::{CYCLES, DAY_PNL_PCT, ORDERS, POSITION_QTY, RISK_HALTED, RSI_LAST, SIGNALS_BY, TRANSPORT_ERRORS};
use crate::positions::{Position, PositionManager};
use crate::recorder::EventLog;
use crate::risk::RiskController;
use crate::sizing::PositionSizer;
use crate::strategy;

/// What the loop should do after a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Sleep(Duration),
    Halt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    RiskLimit,
    Shutdown,
}

/// External collaborators, shared so one client can back several roles.
#[derive(Clone)]
pub struct Collaborators {
    pub feed: Arc<dyn MarketDataFeed>,
    pub account: Arc<dyn AccountGateway>,
    pub exec: Arc<dyn ExecutionGateway>,
    pub calendar: Arc<dyn MarketCalendar>,
}

pub struct ControlLoop {
    symbol: String,
    exchange: String,
    bar_minutes: u32,
    rsi_period: usize,
    min_bars: usize,
    timings: Timings,
    sizer: PositionSizer,
    positions: PositionManager,
    risk: RiskController,
    io: Collaborators,
    log: EventLog,
    halted: bool, // breaker tripped; sticky for the rest of the run
}

impl ControlLoop {
    pub fn new(args: &Args, limits: &Limits, io: Collaborators, log: EventLog, now: DateTime<Utc>) -> Self {
        let today = io.calendar.trading_day(now);
        Self {
            symbol: args.symbol.clone(),
            exchange: args.exchange.clone(),
            bar_minutes: args.bar_minutes,
            rsi_period: limits.rsi_period,
            min_bars: limits.min_bars,
            timings: args.timings.clone(),
            sizer: PositionSizer::from_limits(limits),
            positions: PositionManager::new(limits.take_profit, limits.stop_loss),
            risk: RiskController::new(today, limits.daily_limit),
            io,
            log,
            halted: false,
        }
    }

    pub fn position(&self) -> Position { self.positions.position() }

    pub fn risk(&self) -> &RiskController { &self.risk }

    pub fn is_halted(&self) -> bool { self.halted }

    /// Runs cycles until the breaker trips, shutdown is signalled, or a
    /// configuration error surfaces.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<StopReason, GatewayError> {
        info!(symbol = %self.symbol, exchange = %self.exchange, "control loop: started");
        let reason = loop {
            if *shutdown.borrow() {
                break StopReason::Shutdown;
            }

            let pause = match self.cycle(Utc::now()).await {
                Ok(CycleOutcome::Halt) => break StopReason::RiskLimit,
                Ok(CycleOutcome::Sleep(d)) => d,
                Err(GatewayError::Transport(e)) => {
                    TRANSPORT_ERRORS.inc();
                    CYCLES.with_label_values(&["transport_error"]).inc();
                    warn!(error = %e, backoff = ?self.timings.backoff, "transport error, backing off");
                    self.log.emit(Event::TransportError { error: e });
                    self.timings.backoff
                }
                Err(GatewayError::Data(e)) => {
                    CYCLES.with_label_values(&["data_wait"]).inc();
                    info!(reason = %e, "data not usable yet, waiting");
                    self.log.emit(Event::Waiting { reason: e, bars: 0 });
                    self.timings.wait
                }
                Err(e @ GatewayError::Config(_)) => {
                    error!(error = %e, "configuration rejected by collaborator, stopping");
                    self.log.emit(Event::Stopped { reason: e.to_string(), open_position: self.position().side() });
                    return Err(e);
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                res = shutdown.changed() => {
                    // sender gone counts as a stop request
                    if res.is_err() {
                        break StopReason::Shutdown;
                    }
                }
            }
        };

        let open_position = self.position().side();
        match reason {
            StopReason::RiskLimit => error!(day_pnl_pct = self.risk.state().realized_pnl_pct, "daily loss limit reached, trading stopped"),
            StopReason::Shutdown => info!(?open_position, "shutdown requested, control loop stopped"),
        }
        if open_position.is_some() {
            warn!(position = ?self.position(), "stopping with an open position");
        }
        self.log.emit(Event::Stopped { reason: format!("{reason:?}"), open_position });
        Ok(reason)
    }

    /// One decision cycle at wall-clock `now`.
    pub async fn cycle(&mut self, now: DateTime<Utc>) -> Result<CycleOutcome, GatewayError> {
        if self.halted {
            return Ok(CycleOutcome::Halt);
        }

        // 1) day rollover, before any decision
        let today = self.io.calendar.trading_day(now);
        if self.risk.roll_day_if_needed(today) {
            info!(%today, "new trading day, realized PnL reset");
            self.log.emit(Event::DayRolled { trading_day: today });
            DAY_PNL_PCT.set(0.0);
        }

        // 2) session gate
        if !self.io.calendar.is_open(now) {
            debug!("market closed, idle");
            CYCLES.with_label_values(&["closed"]).inc();
            self.log.emit(Event::MarketClosed);
            return Ok(CycleOutcome::Sleep(self.timings.idle));
        }

        // 3) account dashboard + bars
        let cash = self.io.account.cash_balance().await?;
        let holdings = self.io.account.holdings().await?;
        let valuation = self.io.account.total_valuation().await?;
        info!(cash, valuation, holdings = holdings.len(), "account dashboard");
        self.log.emit(Event::Dashboard { cash, valuation, holdings });

        let bars = self.io.feed.fetch_bars(&self.symbol, &self.exchange, self.bar_minutes).await?;
        let closes: Vec<f64> = bars.iter().map(|b| b.close).filter(|c| c.is_finite() && *c > 0.0).collect();

        // 4) enough history?
        if closes.len() < self.min_bars {
            info!(bars = closes.len(), need = self.min_bars, "not enough bars, waiting");
            CYCLES.with_label_values(&["data_wait"]).inc();
            self.log.emit(Event::Waiting { reason: "insufficient bars".into(), bars: closes.len() });
            return Ok(CycleOutcome::Sleep(self.timings.wait));
        }

        // 5) indicator + signal
        let price = closes[closes.len() - 1];
        let Some(rsi) = strategy::latest_rsi(&closes, self.rsi_period) else {
            return Err(GatewayError::Data(format!("rsi undefined for {} bars", closes.len())));
        };
        let sig = strategy::signal(rsi);
        info!(price, rsi = %format!("{rsi:.2}"), signal = ?sig, "signal");
        RSI_LAST.set(rsi);
        SIGNALS_BY.with_label_values(&[signal_label(sig)]).inc();
        self.log.emit(Event::Signal { price, rsi, signal: sig });

        // 6) take-profit first, then stop-loss
        if let Some(reason) = self.positions.exit_reason(price) {
            self.exit(price, reason).await?;
        }

        // 7) circuit breaker
        self.latch_breaker();
        if self.halted {
            CYCLES.with_label_values(&["halted"]).inc();
            return Ok(CycleOutcome::Halt);
        }

        // 8) entry when flat
        if self.positions.is_flat() {
            let qty = self.sizer.size(cash, price);
            match (NonZeroU32::new(qty), sig) {
                (None, _) => {
                    info!(cash, price, "sizing gives 0 qty, no entry");
                    self.log.emit(Event::NoCapacity { cash, price });
                }
                (Some(q), Signal::Buy) => self.enter(PositionSide::Long, price, q, rsi).await?,
                (Some(q), Signal::Sell) => self.enter(PositionSide::Short, price, q, rsi).await?,
                (Some(_), Signal::Hold) => {
                    debug!("no signal, idle");
                    self.log.emit(Event::Idle { signal: sig });
                }
            }
        }

        // 9) pre-close liquidation, regardless of PnL
        if self.io.calendar.in_liquidation_window(now) && !self.positions.is_flat() {
            info!("pre-close window, forcing liquidation");
            self.exit(price, ExitReason::ForcedLiquidation).await?;
            // must halt before a later cycle can roll the day
            if self.halted {
                CYCLES.with_label_values(&["halted"]).inc();
                return Ok(CycleOutcome::Halt);
            }
        }

        CYCLES.with_label_values(&["traded"]).inc();
        Ok(CycleOutcome::Sleep(self.timings.cycle))
    }

    async fn enter(&mut self, side: PositionSide, price: f64, qty: NonZeroU32, rsi: f64) -> Result<(), GatewayError> {
        let order = OrderIntent::market(side.entry_side(), qty, &self.symbol, &self.exchange);
        self.submit(&order, "entry").await?;
        if let Err(e) = self.positions.open(side, price, qty) {
            // the broker already has the order; the book no longer matches it
            error!(error = %e, cl_id = %order.cl_id, "entry bookkeeping failed after submit");
            return Err(GatewayError::Data(format!("entry {} not booked: {e}", order.cl_id)));
        }
        info!(?side, qty = qty.get(), price, rsi, "entered");
        self.log.emit(Event::Entry { side, qty: qty.get(), price, rsi });
        POSITION_QTY.set(signed_qty(&self.positions.position()));
        Ok(())
    }

    async fn exit(&mut self, price: f64, reason: ExitReason) -> Result<(), GatewayError> {
        let pos = self.positions.position();
        let (Some(side), Some(qty)) = (pos.side(), NonZeroU32::new(pos.qty())) else {
            return Ok(());
        };

        let order = OrderIntent::market(side.exit_side(), qty, &self.symbol, &self.exchange);
        self.submit(&order, exit_label(reason)).await?;

        let pnl_pct = self.positions.unrealized_pnl_pct(price);
        let Some(closed) = self.positions.close() else {
            return Ok(());
        };
        self.risk.record_realized(pnl_pct);
        let day_pnl_pct = self.risk.state().realized_pnl_pct;

        info!(?reason, side = ?closed.side, entry = closed.entry, price, pnl_pct, day_pnl_pct, "position closed");
        self.log.emit(Event::Exit {
            reason,
            side: closed.side,
            qty: closed.qty.get(),
            entry: closed.entry,
            price,
            pnl_pct,
            day_pnl_pct,
        });
        POSITION_QTY.set(0);
        DAY_PNL_PCT.set(day_pnl_pct);
        self.latch_breaker();
        Ok(())
    }

    /// Trips the breaker the moment realized PnL reaches the daily limit.
    fn latch_breaker(&mut self) {
        if self.halted || !self.risk.breached() {
            return;
        }
        let st = self.risk.state();
        self.halted = true;
        RISK_HALTED.set(1);
        error!(day_pnl_pct = st.realized_pnl_pct, limit = self.risk.daily_limit(), "daily loss limit breached");
        self.log.emit(Event::RiskBreach { day_pnl_pct: st.realized_pnl_pct, limit: self.risk.daily_limit() });
    }

    async fn submit(&self, order: &OrderIntent, purpose: &str) -> Result<(), GatewayError> {
        let result = self.io.exec.submit(order).await?;
        ORDERS.with_label_values(&[order.side.as_str(), purpose]).inc();
        if result.accepted {
            info!(cl_id = %order.cl_id, side = order.side.as_str(), qty = order.qty.get(), code = %result.code, "order response");
        } else {
            warn!(cl_id = %order.cl_id, side = order.side.as_str(), qty = order.qty.get(), code = %result.code, message = %result.message, "order not accepted");
        }
        self.log.emit(Event::OrderResponse { cl_id: order.cl_id.clone(), side: order.side, qty: order.qty.get(), result });
        Ok(())
    }
}

fn signed_qty(p: &Position) -> i64 {
    match p {
        Position::Flat => 0,
        Position::Long { qty, .. } => qty.get() as i64,
        Position::Short { qty, .. } => -(qty.get() as i64),
    }
}

fn signal_label(s: Signal) -> &'static str {
    match s {
        Signal::Buy => "buy",
        Signal::Sell => "sell",
        Signal::Hold => "hold",
    }
}

fn exit_label(r: ExitReason) -> &'static str {
    match r {
        ExitReason::TakeProfit => "take_profit",
        ExitReason::StopLoss => "stop_loss",
        ExitReason::ForcedLiquidation => "forced_liquidation",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use approx::assert_relative_eq;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, NaiveDate, TimeZone};
    use tokio::sync::mpsc;

    use crate::config::{Backend, TradeMode};
    use crate::domain::{Holding, OrderResult, PriceBar, Record, Side};

    // Scripted market: each fetch pops the next close series (the last one repeats).
    struct Script {
        series: Mutex<VecDeque<Vec<f64>>>,
        cash: f64,
        fetches: AtomicUsize,
        account_error: Mutex<Option<GatewayError>>,
        feed_error: Mutex<Option<GatewayError>>,
        exec_error: Mutex<Option<GatewayError>>,
        orders: Mutex<Vec<OrderIntent>>,
        open: AtomicBool,
        liquidate: AtomicBool,
    }

    impl Script {
        fn new(series: Vec<Vec<f64>>) -> Arc<Self> {
            Arc::new(Self {
                series: Mutex::new(series.into()),
                cash: 100_000.0,
                fetches: AtomicUsize::new(0),
                account_error: Mutex::new(None),
                feed_error: Mutex::new(None),
                exec_error: Mutex::new(None),
                orders: Mutex::new(Vec::new()),
                open: AtomicBool::new(true),
                liquidate: AtomicBool::new(false),
            })
        }

        fn push(&self, closes: Vec<f64>) {
            let mut q = self.series.lock().unwrap();
            q.clear();
            q.push_back(closes);
        }

        fn orders(&self) -> Vec<(Side, u32)> {
            self.orders.lock().unwrap().iter().map(|o| (o.side, o.qty.get())).collect()
        }
    }

    #[async_trait]
    impl MarketDataFeed for Script {
        async fn fetch_bars(&self, _s: &str, _e: &str, _m: u32) -> Result<Vec<PriceBar>, GatewayError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(e) = self.feed_error.lock().unwrap().take() {
                return Err(e);
            }
            let mut q = self.series.lock().unwrap();
            let closes = if q.len() > 1 { q.pop_front().unwrap() } else { q.front().cloned().unwrap_or_default() };
            let t0 = NaiveDate::from_ymd_opt(2025, 3, 4).unwrap().and_hms_opt(14, 30, 0).unwrap();
            Ok(closes
                .into_iter()
                .enumerate()
                .map(|(i, close)| PriceBar { ts: t0 + ChronoDuration::minutes(i as i64), close })
                .collect())
        }
    }

    #[async_trait]
    impl AccountGateway for Script {
        async fn cash_balance(&self) -> Result<f64, GatewayError> {
            match self.account_error.lock().unwrap().take() {
                Some(e) => Err(e),
                None => Ok(self.cash),
            }
        }
        async fn holdings(&self) -> Result<Vec<Holding>, GatewayError> { Ok(Vec::new()) }
        async fn total_valuation(&self) -> Result<f64, GatewayError> { Ok(self.cash) }
    }

    #[async_trait]
    impl ExecutionGateway for Script {
        async fn submit(&self, order: &OrderIntent) -> Result<OrderResult, GatewayError> {
            if let Some(e) = self.exec_error.lock().unwrap().take() {
                return Err(e);
            }
            self.orders.lock().unwrap().push(order.clone());
            Ok(OrderResult { accepted: true, code: "0".into(), message: "ok".into(), raw: serde_json::Value::Null })
        }
    }

    impl MarketCalendar for Script {
        fn is_open(&self, _now: DateTime<Utc>) -> bool { self.open.load(Ordering::SeqCst) }
        fn in_liquidation_window(&self, _now: DateTime<Utc>) -> bool { self.liquidate.load(Ordering::SeqCst) }
        fn trading_day(&self, now: DateTime<Utc>) -> chrono::NaiveDate { now.date_naive() }
    }

    fn args() -> Args {
        Args {
            mode: TradeMode::Paper,
            backend: Backend::Sim,
            symbol: "AMD".into(),
            exchange: "NASD".into(),
            bar_minutes: 1,
            kis: None,
            record_file: None,
            metrics_port: 0,
            timings: Timings {
                cycle: Duration::from_millis(1),
                idle: Duration::from_millis(2),
                wait: Duration::from_millis(3),
                backoff: Duration::from_millis(4),
            },
        }
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, hour, 0, 0).unwrap()
    }

    fn build(script: &Arc<Script>) -> (ControlLoop, mpsc::Receiver<Record>) {
        build_with(script, &args(), &Limits::default())
    }

    fn build_with(script: &Arc<Script>, args: &Args, limits: &Limits) -> (ControlLoop, mpsc::Receiver<Record>) {
        let (tx, rx) = mpsc::channel(256);
        let io = Collaborators {
            feed: script.clone(),
            account: script.clone(),
            exec: script.clone(),
            calendar: script.clone(),
        };
        (ControlLoop::new(args, limits, io, EventLog::new(tx), at(4, 0)), rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Record>) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(r) = rx.try_recv() {
            out.push(r.event);
        }
        out
    }

    // 25 closes falling 0.5 per bar, ending at `last` -> RSI 0 -> Buy
    fn falling_to(last: f64) -> Vec<f64> {
        (0..25).map(|i| last + 0.5 * (24 - i) as f64).collect()
    }

    // 25 closes rising 0.5 per bar, ending at `last` -> RSI ~100 -> Sell
    fn rising_to(last: f64) -> Vec<f64> {
        (0..25).map(|i| last - 0.5 * (24 - i) as f64).collect()
    }

    // 26 closes alternating lo/hi ending at `last` -> RSI 50 -> Hold
    fn choppy_ending(last: f64, other: f64) -> Vec<f64> {
        (0..26).map(|i| if i % 2 == 1 { last } else { other }).collect()
    }

    #[tokio::test]
    async fn buy_signal_opens_sized_long() {
        let script = Script::new(vec![falling_to(100.0)]);
        let (mut ctl, mut rx) = build(&script);

        let out = ctl.cycle(at(4, 15)).await.unwrap();
        assert_eq!(out, CycleOutcome::Sleep(Duration::from_millis(1)));
        // min(notional 2000/100, risk 1000/0.5, cap 50)
        assert_eq!(script.orders(), vec![(Side::Buy, 20)]);
        assert_eq!(ctl.position(), Position::Long { entry: 100.0, qty: NonZeroU32::new(20).unwrap() });

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(e, Event::Signal { signal: Signal::Buy, .. })));
        assert!(events.iter().any(|e| matches!(e, Event::Entry { side: PositionSide::Long, qty: 20, .. })));
        assert!(events.iter().any(|e| matches!(e, Event::OrderResponse { .. })));
    }

    #[tokio::test]
    async fn sell_signal_opens_short() {
        let script = Script::new(vec![rising_to(100.0)]);
        let (mut ctl, _rx) = build(&script);
        ctl.cycle(at(4, 15)).await.unwrap();
        assert_eq!(script.orders(), vec![(Side::Sell, 20)]);
        assert_eq!(ctl.position().side(), Some(PositionSide::Short));
    }

    #[tokio::test]
    async fn hold_stays_flat() {
        let script = Script::new(vec![choppy_ending(101.0, 100.0)]);
        let (mut ctl, mut rx) = build(&script);
        ctl.cycle(at(4, 15)).await.unwrap();
        assert!(script.orders().is_empty());
        assert!(ctl.position().is_flat());
        assert!(drain(&mut rx).iter().any(|e| matches!(e, Event::Idle { signal: Signal::Hold })));
    }

    #[tokio::test]
    async fn zero_size_means_no_entry() {
        // 2500 > max order notional 2000
        let script = Script::new(vec![falling_to(2500.0)]);
        let (mut ctl, mut rx) = build(&script);
        ctl.cycle(at(4, 15)).await.unwrap();
        assert!(script.orders().is_empty());
        assert!(drain(&mut rx).iter().any(|e| matches!(e, Event::NoCapacity { .. })));
    }

    #[tokio::test]
    async fn take_profit_exit_records_pnl() {
        let script = Script::new(vec![falling_to(100.0), choppy_ending(101.0, 100.0)]);
        let (mut ctl, mut rx) = build(&script);
        ctl.cycle(at(4, 15)).await.unwrap();
        ctl.cycle(at(4, 16)).await.unwrap();

        assert_eq!(script.orders(), vec![(Side::Buy, 20), (Side::Sell, 20)]);
        assert!(ctl.position().is_flat());
        assert_relative_eq!(ctl.risk().state().realized_pnl_pct, 0.01, epsilon = 1e-12);

        let exit = drain(&mut rx).into_iter().find(|e| matches!(e, Event::Exit { .. }));
        match exit {
            Some(Event::Exit { reason, side, qty, entry, price, .. }) => {
                assert_eq!(reason, ExitReason::TakeProfit);
                assert_eq!(side, PositionSide::Long);
                assert_eq!(qty, 20);
                assert_eq!(entry, 100.0);
                assert_eq!(price, 101.0);
            }
            other => panic!("expected exit event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stop_loss_exit_on_short() {
        let script = Script::new(vec![rising_to(100.0), choppy_ending(100.6, 99.6)]);
        let (mut ctl, _rx) = build(&script);
        ctl.cycle(at(4, 15)).await.unwrap();
        ctl.cycle(at(4, 16)).await.unwrap();

        assert_eq!(script.orders(), vec![(Side::Sell, 20), (Side::Buy, 20)]);
        assert!(ctl.position().is_flat());
        assert_relative_eq!(ctl.risk().state().realized_pnl_pct, -0.006, epsilon = 1e-9);
    }

    #[tokio::test]
    async fn breach_halts_and_suppresses_entries() {
        let script = Script::new(vec![falling_to(100.0), choppy_ending(96.0, 97.0)]);
        let (mut ctl, mut rx) = build(&script);
        ctl.cycle(at(4, 15)).await.unwrap();
        let out = ctl.cycle(at(4, 16)).await.unwrap();

        assert_eq!(out, CycleOutcome::Halt);
        assert!(ctl.is_halted());
        assert!(ctl.risk().breached());
        assert!(drain(&mut rx).iter().any(|e| matches!(e, Event::RiskBreach { .. })));

        // a strong buy signal later, even on a new day, opens nothing
        script.push(falling_to(90.0));
        assert_eq!(ctl.cycle(at(4, 17)).await.unwrap(), CycleOutcome::Halt);
        assert_eq!(ctl.cycle(at(5, 15)).await.unwrap(), CycleOutcome::Halt);
        assert_eq!(script.orders().len(), 2);
        assert!(ctl.position().is_flat());
    }

    #[tokio::test]
    async fn forced_liquidation_ignores_pnl_sign() {
        let script = Script::new(vec![falling_to(100.0), choppy_ending(100.3, 99.3)]);
        let (mut ctl, mut rx) = build(&script);
        ctl.cycle(at(4, 15)).await.unwrap();

        script.liquidate.store(true, Ordering::SeqCst);
        ctl.cycle(at(4, 20)).await.unwrap();

        // +0.3% is below take-profit, still closed
        assert_eq!(script.orders(), vec![(Side::Buy, 20), (Side::Sell, 20)]);
        assert!(ctl.position().is_flat());
        assert_relative_eq!(ctl.risk().state().realized_pnl_pct, 0.003, epsilon = 1e-9);
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, Event::Exit { reason: ExitReason::ForcedLiquidation, .. })));
    }

    #[tokio::test]
    async fn closed_market_skips_fetch() {
        let script = Script::new(vec![falling_to(100.0)]);
        script.open.store(false, Ordering::SeqCst);
        let (mut ctl, _rx) = build(&script);
        let out = ctl.cycle(at(4, 12)).await.unwrap();
        assert_eq!(out, CycleOutcome::Sleep(Duration::from_millis(2)));
        assert_eq!(script.fetches.load(Ordering::SeqCst), 0);
        assert!(script.orders().is_empty());
    }

    #[tokio::test]
    async fn short_history_waits() {
        let script = Script::new(vec![vec![100.0; 10]]);
        let (mut ctl, _rx) = build(&script);
        let out = ctl.cycle(at(4, 15)).await.unwrap();
        assert_eq!(out, CycleOutcome::Sleep(Duration::from_millis(3)));
        assert!(script.orders().is_empty());
    }

    #[tokio::test]
    async fn transport_error_surfaces_without_state_change() {
        let script = Script::new(vec![falling_to(100.0), choppy_ending(101.0, 100.0)]);
        let (mut ctl, _rx) = build(&script);
        ctl.cycle(at(4, 15)).await.unwrap();

        *script.exec_error.lock().unwrap() = Some(GatewayError::Transport("timeout".into()));
        let err = ctl.cycle(at(4, 16)).await.unwrap_err();
        assert!(matches!(err, GatewayError::Transport(_)));
        assert_eq!(ctl.position().side(), Some(PositionSide::Long));
        assert_eq!(ctl.risk().state().realized_pnl_pct, 0.0);
    }

    #[tokio::test]
    async fn day_rollover_resets_once() {
        let script = Script::new(vec![rising_to(100.0), choppy_ending(100.6, 99.6)]);
        let (mut ctl, mut rx) = build(&script);
        ctl.cycle(at(4, 15)).await.unwrap();
        ctl.cycle(at(4, 16)).await.unwrap();
        assert!(ctl.risk().state().realized_pnl_pct < 0.0);

        script.open.store(false, Ordering::SeqCst);
        ctl.cycle(at(5, 1)).await.unwrap();
        ctl.cycle(at(5, 2)).await.unwrap();
        let st = ctl.risk().state();
        assert_eq!(st.trading_day, NaiveDate::from_ymd_opt(2025, 3, 5).unwrap());
        assert_eq!(st.realized_pnl_pct, 0.0);
        let rolls = drain(&mut rx).iter().filter(|e| matches!(e, Event::DayRolled { .. })).count();
        assert_eq!(rolls, 1);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_before_first_cycle() {
        let script = Script::new(vec![falling_to(100.0)]);
        let (mut ctl, _rx) = build(&script);
        let (tx, rx) = watch::channel(true);
        let reason = ctl.run(rx).await.unwrap();
        drop(tx);
        assert_eq!(reason, StopReason::Shutdown);
        assert_eq!(script.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn run_retries_transport_then_halts_on_breach() {
        let script = Script::new(vec![falling_to(100.0), choppy_ending(96.0, 97.0)]);
        *script.account_error.lock().unwrap() = Some(GatewayError::Transport("reset".into()));
        let (mut ctl, _rx) = build(&script);
        let (_tx, rx) = watch::channel(false);

        let reason = ctl.run(rx).await.unwrap();
        assert_eq!(reason, StopReason::RiskLimit);
        assert_eq!(script.orders(), vec![(Side::Buy, 20), (Side::Sell, 20)]);
        assert!(ctl.position().is_flat());
    }

    #[tokio::test]
    async fn run_treats_data_errors_as_wait() {
        let script = Script::new(vec![falling_to(100.0)]);
        *script.feed_error.lock().unwrap() = Some(GatewayError::Data("missing field last".into()));
        let (mut ctl, _rx) = build(&script);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let r = ctl.run(rx).await;
            (r, ctl)
        });
        // wait until the entry happened, then stop
        for _ in 0..200 {
            if !script.orders().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();
        let (r, ctl) = handle.await.unwrap();
        assert_eq!(r.unwrap(), StopReason::Shutdown);
        assert_eq!(script.orders(), vec![(Side::Buy, 20)]);
        assert_eq!(ctl.position().side(), Some(PositionSide::Long));
    }

    #[tokio::test]
    async fn run_fails_fast_on_config_error() {
        let script = Script::new(vec![falling_to(100.0)]);
        *script.feed_error.lock().unwrap() = Some(GatewayError::Config("401 invalid appkey".into()));
        let (mut ctl, _rx) = build(&script);
        let (_tx, rx) = watch::channel(false);
        let err = ctl.run(rx).await.unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
        assert!(script.orders().is_empty());
    }

    #[tokio::test]
    async fn liquidation_loss_halts_before_next_day() {
        // wide stop so only the pre-close exit realizes the loss
        let limits = Limits { stop_loss: 0.5, ..Limits::default() };
        let script = Script::new(vec![falling_to(100.0), choppy_ending(96.0, 97.0)]);
        let (mut ctl, mut rx) = build_with(&script, &args(), &limits);
        ctl.cycle(at(4, 15)).await.unwrap();
        assert_eq!(script.orders(), vec![(Side::Buy, 20)]);

        script.liquidate.store(true, Ordering::SeqCst);
        let out = ctl.cycle(at(4, 20)).await.unwrap();
        assert_eq!(out, CycleOutcome::Halt);
        assert!(ctl.is_halted());
        assert_relative_eq!(ctl.risk().state().realized_pnl_pct, -0.04, epsilon = 1e-9);
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::Exit { reason: ExitReason::ForcedLiquidation, .. })));
        assert_eq!(events.iter().filter(|e| matches!(e, Event::RiskBreach { .. })).count(), 1);

        // next trading day with a strong buy signal
        script.liquidate.store(false, Ordering::SeqCst);
        script.push(falling_to(90.0));
        assert_eq!(ctl.cycle(at(5, 15)).await.unwrap(), CycleOutcome::Halt);
        assert_eq!(script.orders().len(), 2);
        assert!(ctl.position().is_flat());
    }

    #[tokio::test]
    async fn shutdown_interrupts_cycle_sleep() {
        let mut a = args();
        a.timings.cycle = Duration::from_secs(3600);
        let script = Script::new(vec![falling_to(100.0)]);
        let (mut ctl, _rx) = build_with(&script, &a, &Limits::default());
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { ctl.run(rx).await });
        for _ in 0..200 {
            if !script.orders().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(script.orders(), vec![(Side::Buy, 20)]);

        tx.send(true).unwrap();
        let reason = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("run kept sleeping after shutdown")
            .unwrap()
            .unwrap();
        assert_eq!(reason, StopReason::Shutdown);
    }

    #[tokio::test]
    async fn entry_on_open_book_is_reported() {
        let script = Script::new(vec![falling_to(100.0)]);
        let (mut ctl, _rx) = build(&script);
        let five = NonZeroU32::new(5).unwrap();
        ctl.positions.open(PositionSide::Long, 100.0, five).unwrap();

        let err = ctl
            .enter(PositionSide::Short, 100.0, NonZeroU32::new(20).unwrap(), 80.0)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Data(_)));
        assert_eq!(script.orders(), vec![(Side::Sell, 20)]);
        assert_eq!(ctl.position(), Position::Long { entry: 100.0, qty: five });
    }
}
