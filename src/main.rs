// ===============================
// src/main.rs
// ===============================
/*
 cd /home/kukuhtw/rust/rsi_bot_rust

 # dry run against the simulator, no credentials needed
 BACKEND=sim RUST_LOG=info cargo run

 # validate .env only
 cargo run -- --check-config --env-file .env.paper

 # what the loop is doing
curl -s localhost:9898/metrics | egrep '^(rsi_last|position_qty|day_realized_pnl_pct|risk_halted)'
curl -s localhost:9898/metrics | grep '^cycles_total'
*/
/*
=============================================================================
Project : rsi_bot_rust — single-symbol RSI trading controller in Rust
Module  : main.rs
Version : 0.1.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Polls intraday bars for one overseas symbol (KIS REST or a local
          simulator), trades RSI mean-reversion with take-profit/stop-loss,
          risk-based sizing and a daily loss circuit breaker, flattens before
          the close, exposes Prometheus metrics, and records JSONL events.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
mod domain;
mod config;
mod metrics;
mod recorder;
mod feed;
mod strategy;
mod sizing;
mod positions;
mod risk;
mod calendar;
mod gateway;   // traits + in-process sim broker
mod kis;       // KIS overseas REST (bars, balance, orders)
mod engine;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use tokio::{
    sync::{mpsc, watch},
    time::Duration,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::calendar::{AlwaysOpen, ApproxKstCalendar};
use crate::config::{Backend, TradeMode};
use crate::domain::{Event, Record};
use crate::engine::{Collaborators, ControlLoop};
use crate::feed::SimFeed;
use crate::gateway::SimBroker;
use crate::kis::KisClient;
use crate::recorder::EventLog;

const SIM_START_PX: f64 = 100.0;
const SIM_WINDOW: usize = 120;
const SIM_CASH: f64 = 100_000.0;

#[derive(Parser, Debug)]
#[command(name = "rsi_bot_rust", about = "Single-symbol RSI trading controller")]
struct Cli {
    /// Load this env file instead of ./.env
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Validate configuration, print the summary and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Load config & limits ----
    let (args, limits) = match config::load(cli.env_file.as_deref()) {
        Ok(v) => v,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    info!(
        mode = args.mode.as_str(),
        backend = args.backend.as_str(),
        symbol = %args.symbol,
        exchange = %args.exchange,
        bar_minutes = args.bar_minutes,
        take_profit = limits.take_profit,
        stop_loss = limits.stop_loss,
        daily_limit = limits.daily_limit,
        max_order_usd = limits.max_order_usd,
        max_qty_per_order = limits.max_qty_per_order,
        risk_per_trade = limits.risk_per_trade,
        rsi_period = limits.rsi_period,
        "startup config"
    );
    if cli.check_config {
        info!("configuration ok");
        return;
    }
    if args.mode == TradeMode::Live {
        warn!("LIVE mode: orders go to the real account");
    }

    // ---- Metrics ----
    metrics::init();
    if args.metrics_port != 0 {
        metrics::serve_metrics(args.metrics_port);
    }
    metrics::CONFIG_MODE
        .with_label_values(&[args.mode.as_str(), args.backend.as_str()])
        .set(1);
    metrics::CONFIG_SYMBOL
        .with_label_values(&[&args.symbol, &args.exchange])
        .set(1);

    // ---- Recorder (optional) ----
    let (log, recorder) = match args.record_file.clone() {
        Some(path) => {
            let (tx, rx) = mpsc::channel::<Record>(8192);
            (EventLog::new(tx), Some(tokio::spawn(recorder::run(rx, path))))
        }
        None => (EventLog::disabled(), None),
    };
    log.emit(Event::Startup {
        mode: args.mode.as_str().to_string(),
        backend: args.backend.as_str().to_string(),
        symbol: args.symbol.clone(),
        exchange: args.exchange.clone(),
        take_profit: limits.take_profit,
        stop_loss: limits.stop_loss,
        daily_limit: limits.daily_limit,
        max_order_usd: limits.max_order_usd,
        max_qty_per_order: limits.max_qty_per_order,
    });

    // ---- Collaborators ----
    let io = match args.backend {
        Backend::Kis => {
            let Some(creds) = args.kis.clone() else {
                error!("kis backend selected without credentials");
                std::process::exit(1);
            };
            let client = match KisClient::new(creds, args.mode, &args.exchange) {
                Ok(c) => Arc::new(c),
                Err(e) => {
                    error!(error = %e, "kis client init failed");
                    std::process::exit(1);
                }
            };
            Collaborators {
                feed: client.clone(),
                account: client.clone(),
                exec: client,
                calendar: Arc::new(ApproxKstCalendar::default()),
            }
        }
        Backend::Sim => {
            let feed = SimFeed::new(&args.symbol, SIM_START_PX, SIM_WINDOW);
            let broker = Arc::new(SimBroker::new(feed.clone(), SIM_CASH));
            Collaborators {
                feed: Arc::new(feed),
                account: broker.clone(),
                exec: broker,
                calendar: Arc::new(AlwaysOpen),
            }
        }
    };

    // ---- Shutdown on Ctrl-C ----
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, finishing current cycle");
            let _ = stop_tx.send(true);
        }
    });

    // ---- Control loop ----
    let mut ctl = ControlLoop::new(&args, &limits, io, log.clone(), Utc::now());
    let result = ctl.run(stop_rx).await;

    // close the recorder channel so it flushes
    drop(ctl);
    drop(log);
    if let Some(handle) = recorder {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }

    match result {
        Ok(reason) => info!(?reason, "exit"),
        Err(e) => {
            error!(error = %e, "control loop failed");
            std::process::exit(2);
        }
    }
}
