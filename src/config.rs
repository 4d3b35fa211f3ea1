// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : rsi_bot_rust — single-symbol RSI trading controller in Rust
Module  : config.rs
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
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveDateTime;
use thiserror::Error;

use crate::strategy;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{key}: cannot parse {value:?}")]
    Parse { key: &'static str, value: String },
    #[error("{0} is required for the kis backend")]
    Missing(&'static str),
    #[error("{key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("env file {0}: {1}")]
    EnvFile(String, String),
}

/// Which order namespace the broker uses. Core logic is identical in both.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TradeMode {
    Paper,
    Live,
}

impl TradeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeMode::Paper => "paper",
            TradeMode::Live => "live",
        }
    }
}

impl FromStr for TradeMode {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "paper" => Ok(TradeMode::Paper),
            "live" => Ok(TradeMode::Live),
            _ => Err(()),
        }
    }
}

/// Collaborator implementation behind the control loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Kis,
    Sim,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Kis => "kis",
            Backend::Sim => "sim",
        }
    }
}

impl FromStr for Backend {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kis" => Ok(Backend::Kis),
            "sim" | "mock" => Ok(Backend::Sim),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct KisCreds {
    pub base_url: String,
    pub app_key: String,
    pub app_secret: String,
    pub account: String,
    pub access_token: String,
    pub token_expires_at: Option<NaiveDateTime>, // KST wall clock
    pub close_field: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Timings {
    pub cycle: Duration,
    pub idle: Duration,
    pub wait: Duration,
    pub backoff: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            cycle: Duration::from_secs(60),
            idle: Duration::from_secs(60),
            wait: Duration::from_secs(30),
            backoff: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Args {
    pub mode: TradeMode,
    pub backend: Backend,
    pub symbol: String,
    pub exchange: String,
    pub bar_minutes: u32,
    pub kis: Option<KisCreds>, // present iff backend == Kis

    // files/metrics
    pub record_file: Option<String>,
    pub metrics_port: u16,

    pub timings: Timings,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Limits {
    pub take_profit: f64,
    pub stop_loss: f64,
    pub daily_limit: f64,
    pub max_order_usd: f64,
    pub max_qty_per_order: u32,
    pub risk_per_trade: f64,
    pub rsi_period: usize,
    pub min_bars: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            take_profit: 0.008,
            stop_loss: 0.005,
            daily_limit: -0.03,
            max_order_usd: 2000.0,
            max_qty_per_order: 50,
            risk_per_trade: 0.01,
            rsi_period: strategy::DEFAULT_PERIOD,
            min_bars: 20,
        }
    }
}

impl Limits {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key, reason: &str| Err(ConfigError::Invalid { key, reason: reason.to_string() });
        if !(self.take_profit > 0.0) {
            return invalid("TAKE_PROFIT", "must be > 0");
        }
        if !(self.stop_loss > 0.0) {
            return invalid("STOP_LOSS", "must be > 0");
        }
        if !(self.daily_limit < 0.0) {
            return invalid("RISK_DAILY_LIMIT", "must be < 0");
        }
        if !(self.max_order_usd > 0.0) {
            return invalid("MAX_ORDER_USD", "must be > 0");
        }
        if self.max_qty_per_order == 0 {
            return invalid("MAX_QTY_PER_ORDER", "must be > 0");
        }
        if !(self.risk_per_trade > 0.0 && self.risk_per_trade < 1.0) {
            return invalid("RISK_PER_TRADE", "must be in (0, 1)");
        }
        if self.rsi_period == 0 {
            return invalid("RSI_PERIOD", "must be > 0");
        }
        if self.min_bars <= self.rsi_period {
            return invalid("MIN_BARS", "must exceed RSI_PERIOD");
        }
        Ok(())
    }
}

/// Reads `.env` (or `env_file`) then the process environment.
pub fn load(env_file: Option<&Path>) -> Result<(Args, Limits), ConfigError> {
    match env_file {
        Some(p) => {
            dotenvy::from_path(p).map_err(|e| ConfigError::EnvFile(p.display().to_string(), e.to_string()))?;
        }
        None => {
            let _ = dotenvy::dotenv();
        }
    }
    load_from(|k| env::var(k).ok())
}

/// Builds the config from any key lookup. Unset keys take defaults; set but
/// unparseable keys are errors.
pub fn load_from<F>(lookup: F) -> Result<(Args, Limits), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |k: &str| lookup(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    fn parse<T: FromStr>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError> {
        match raw {
            None => Ok(default),
            Some(v) => v.parse().map_err(|_| ConfigError::Parse { key, value: v }),
        }
    }

    // ===== Basic =====
    let mode = parse("MODE", get("MODE"), TradeMode::Paper)?;
    let backend = parse("BACKEND", get("BACKEND"), Backend::Kis)?;
    let symbol = get("SYMBOL").unwrap_or_else(|| "AMD".to_string()).to_ascii_uppercase();
    let exchange = get("EXCH").unwrap_or_else(|| "NASD".to_string()).to_ascii_uppercase();
    let bar_minutes: u32 = parse("NMIN", get("NMIN"), 1)?;
    if bar_minutes == 0 {
        return Err(ConfigError::Invalid { key: "NMIN", reason: "must be > 0".into() });
    }

    // ===== Credentials =====
    let kis = match backend {
        Backend::Sim => None,
        Backend::Kis => {
            let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));
            let account = required("KIS_ACCOUNT")?;
            if account.len() != 8 || !account.chars().all(|c| c.is_ascii_digit()) {
                return Err(ConfigError::Invalid { key: "KIS_ACCOUNT", reason: "expected the 8-digit account prefix".into() });
            }
            let token_expires_at = match get("ACCESS_TOKEN_EXPIRES_AT") {
                None => None,
                Some(v) => Some(
                    NaiveDateTime::parse_from_str(&v, "%Y-%m-%d %H:%M:%S")
                        .map_err(|_| ConfigError::Parse { key: "ACCESS_TOKEN_EXPIRES_AT", value: v })?,
                ),
            };
            Some(KisCreds {
                base_url: get("KIS_BASE_URL").unwrap_or_else(|| "https://openapi.koreainvestment.com:9443".to_string()),
                app_key: required("KIS_APP_KEY")?,
                app_secret: required("KIS_APP_SECRET")?,
                account,
                access_token: required("ACCESS_TOKEN")?,
                token_expires_at,
                close_field: get("KIS_CLOSE_FIELD").unwrap_or_else(|| "last".to_string()),
            })
        }
    };

    // ===== Files / metrics =====
    // RECORD_FILE="" disables the recorder
    let record_file = match lookup("RECORD_FILE").map(|v| v.trim().to_string()) {
        None => Some("bot_log.jsonl".to_string()),
        Some(p) if p.is_empty() => None,
        Some(p) => Some(p),
    };
    let metrics_port = parse("METRICS_PORT", get("METRICS_PORT"), 9898u16)?;

    // ===== Timings =====
    let def = Timings::default();
    let secs = |key: &'static str, d: Duration| -> Result<Duration, ConfigError> {
        Ok(Duration::from_secs(parse(key, get(key), d.as_secs())?))
    };
    let timings = Timings {
        cycle: secs("CYCLE_SECS", def.cycle)?,
        idle: secs("IDLE_SECS", def.idle)?,
        wait: secs("WAIT_SECS", def.wait)?,
        backoff: secs("BACKOFF_SECS", def.backoff)?,
    };

    let args = Args { mode, backend, symbol, exchange, bar_minutes, kis, record_file, metrics_port, timings };

    // ===== Limits =====
    let d = Limits::default();
    let limits = Limits {
        take_profit: parse("TAKE_PROFIT", get("TAKE_PROFIT"), d.take_profit)?,
        stop_loss: parse("STOP_LOSS", get("STOP_LOSS"), d.stop_loss)?,
        daily_limit: parse("RISK_DAILY_LIMIT", get("RISK_DAILY_LIMIT"), d.daily_limit)?,
        max_order_usd: parse("MAX_ORDER_USD", get("MAX_ORDER_USD"), d.max_order_usd)?,
        max_qty_per_order: parse("MAX_QTY_PER_ORDER", get("MAX_QTY_PER_ORDER"), d.max_qty_per_order)?,
        risk_per_trade: parse("RISK_PER_TRADE", get("RISK_PER_TRADE"), d.risk_per_trade)?,
        rsi_period: parse("RSI_PERIOD", get("RSI_PERIOD"), d.rsi_period)?,
        min_bars: parse("MIN_BARS", get("MIN_BARS"), d.min_bars)?,
    };
    limits.validate()?;

    Ok((args, limits))
}
