// ===============================
// src/kis.rs
// ===============================
//
// Korea Investment (KIS) overseas-stock REST adapter.
// Implements MarketDataFeed, AccountGateway and ExecutionGateway.
//
// Notes:
// - Auth: bearer ACCESS_TOKEN + appkey/appsecret headers, `tr_id` per call.
//   Token issuance/refresh is done outside the bot; we only warn near expiry.
// - Order tr_id switches by mode (paper VTTS..., live TTTS...) and side.
// - Close price comes from one explicit field (KIS_CLOSE_FIELD, default "last").
//   No column guessing: a missing/unparseable field is a DataError.
// - Numeric fields arrive as strings, sometimes with thousands separators.
//
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use chrono_tz::Asia::Seoul;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::{KisCreds, TradeMode};
use crate::domain::{Holding, OrderIntent, OrderKind, OrderResult, PriceBar, Side};
use crate::feed::MarketDataFeed;
use crate::gateway::{AccountGateway, ExecutionGateway, GatewayError};

const TR_BARS: &str = "HHDFS00000300";
const TR_BALANCE: &str = "HHDFS00000500";
const PATH_BARS: &str = "/uapi/overseas-price/v1/quotations/inquire-time-series";
const PATH_BALANCE: &str = "/uapi/overseas-stock/v1/trading/inquire-balance";
const PATH_ORDER: &str = "/uapi/overseas-stock/v1/trading/order";
const ACCOUNT_PRODUCT: &str = "01";
const CASH_FIELD: &str = "frcr_cblc_amt";
const VALUATION_FIELD: &str = "frcr_evlu_amt";
const TOKEN_WARN_MINUTES: i64 = 30;

pub fn order_tr_id(mode: TradeMode, side: Side) -> &'static str {
    match (mode, side) {
        (TradeMode::Live, Side::Buy) => "TTTS03010100",
        (TradeMode::Live, Side::Sell) => "TTTS03010200",
        (TradeMode::Paper, Side::Buy) => "VTTS03010100",
        (TradeMode::Paper, Side::Sell) => "VTTS03010200",
    }
}

/// True when `expires_at` (KST wall clock) is within `buffer_min` of `now_kst`.
pub fn token_expiring_soon(expires_at: Option<NaiveDateTime>, now_kst: NaiveDateTime, buffer_min: i64) -> bool {
    match expires_at {
        Some(exp) => now_kst + chrono::Duration::minutes(buffer_min) >= exp,
        None => false,
    }
}

/// "1,234.50" | 1234.5 -> 1234.5
pub fn parse_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', "").parse().ok(),
        _ => None,
    }
}

fn field(row: &Value, name: &str) -> Result<f64, GatewayError> {
    let raw = row.get(name).ok_or_else(|| GatewayError::Data(format!("missing field {name}")))?;
    parse_number(raw).ok_or_else(|| GatewayError::Data(format!("unparseable {name}: {raw}")))
}

/// Time series rows (`output2`) -> bars sorted oldest first.
pub fn parse_bars(data: &Value, close_field: &str) -> Result<Vec<PriceBar>, GatewayError> {
    let rows = match data.get("output2") {
        Some(Value::Array(rows)) => rows,
        Some(Value::Null) | None => return Ok(Vec::new()),
        Some(other) => return Err(GatewayError::Data(format!("output2 is not a list: {other}"))),
    };

    let mut bars = Vec::with_capacity(rows.len());
    for row in rows {
        let ymd = row.get("xymd").and_then(Value::as_str).unwrap_or_default();
        let hms = row.get("xhms").and_then(Value::as_str).unwrap_or_default();
        let ts = NaiveDateTime::parse_from_str(&format!("{ymd}{hms}"), "%Y%m%d%H%M%S")
            .map_err(|_| GatewayError::Data(format!("bad bar timestamp {ymd:?} {hms:?}")))?;
        let close = field(row, close_field)?;
        if !(close > 0.0) {
            return Err(GatewayError::Data(format!("non-positive close {close} at {ts}")));
        }
        bars.push(PriceBar { ts, close });
    }
    bars.sort_by_key(|b| b.ts);
    Ok(bars)
}

fn summary(data: &Value) -> Result<&Value, GatewayError> {
    data.get("output1")
        .and_then(|o| o.get(0))
        .ok_or_else(|| GatewayError::Data("balance response has no output1 row".into()))
}

pub fn parse_cash(data: &Value) -> Result<f64, GatewayError> {
    field(summary(data)?, CASH_FIELD)
}

pub fn parse_valuation(data: &Value) -> Result<f64, GatewayError> {
    field(summary(data)?, VALUATION_FIELD)
}

/// Holding rows are informational; malformed rows are skipped.
pub fn parse_holdings(data: &Value) -> Vec<Holding> {
    let Some(rows) = data.get("output").and_then(Value::as_array) else {
        return Vec::new();
    };
    let num = |row: &Value, k: &str| row.get(k).and_then(parse_number);
    let text = |row: &Value, k: &str| row.get(k).and_then(Value::as_str).unwrap_or_default().to_string();

    rows.iter()
        .filter_map(|row| {
            let h = Holding {
                symbol: text(row, "ovrs_pdno"),
                name: text(row, "ovrs_item_name"),
                qty: num(row, "ord_psbl_qty").unwrap_or(0.0) as i64,
                valuation: num(row, "frcr_evlu_amt")?,
                pnl: num(row, "evlu_pfls_amt")?,
                pnl_pct: num(row, "evlu_pfls_rt")?,
            };
            if h.symbol.is_empty() {
                debug!(?row, "kis: holding row without symbol, skipped");
                return None;
            }
            Some(h)
        })
        .collect()
}

pub fn order_payload(account: &str, o: &OrderIntent) -> Value {
    let (dvsn, unpr) = match o.kind {
        OrderKind::Market => ("02", String::new()),
        OrderKind::Limit { price } => ("01", format!("{price}")),
    };
    json!({
        "CANO": account,
        "ACNT_PRDT_CD": ACCOUNT_PRODUCT,
        "OVRS_EXCG_CD": o.exchange,
        "ITEM_CD": o.symbol,
        "OVRS_ORD_QTY": o.qty.get().to_string(),
        "OVRS_ORD_DVSN": dvsn,
        "OVRS_ORD_UNPR": unpr,
    })
}

pub fn order_result(v: Value) -> OrderResult {
    let s = |k: &str| v.get(k).and_then(Value::as_str).unwrap_or_default().to_string();
    let (accepted, code, message) = (s("rt_cd") == "0", s("msg_cd"), s("msg1"));
    OrderResult { accepted, code, message, raw: v }
}

pub struct KisClient {
    http: reqwest::Client,
    creds: KisCreds,
    mode: TradeMode,
    exchange: String, // balance book to query
}

impl KisClient {
    pub fn new(creds: KisCreds, mode: TradeMode, exchange: &str) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| GatewayError::Config(format!("http client: {e}")))?;
        Ok(Self { http, creds, mode, exchange: exchange.to_string() })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.creds.base_url.trim_end_matches('/'), path)
    }

    fn authed(&self, req: reqwest::RequestBuilder, tr_id: &str) -> reqwest::RequestBuilder {
        req.header("authorization", format!("Bearer {}", self.creds.access_token))
            .header("appkey", &self.creds.app_key)
            .header("appsecret", &self.creds.app_secret)
            .header("tr_id", tr_id)
    }

    fn warn_if_token_expiring(&self) {
        let now_kst = Utc::now().with_timezone(&Seoul).naive_local();
        if token_expiring_soon(self.creds.token_expires_at, now_kst, TOKEN_WARN_MINUTES) {
            warn!(expires_at = ?self.creds.token_expires_at, "kis: access token expiring soon, refresh ACCESS_TOKEN");
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<Value, GatewayError> {
        let rsp = req.send().await?;
        let status = rsp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            let body = rsp.text().await.unwrap_or_default();
            return Err(GatewayError::Config(format!("{status}: {body}")));
        }
        if !status.is_success() {
            let body = rsp.text().await.unwrap_or_default();
            return Err(GatewayError::Transport(format!("{status}: {body}")));
        }
        Ok(rsp.json::<Value>().await?)
    }

    // queries: a non-zero rt_cd is retried like a transport failure
    async fn query(&self, path: &str, tr_id: &str, params: &[(&str, &str)]) -> Result<Value, GatewayError> {
        let req = self.authed(self.http.get(self.url(path)), tr_id).query(params);
        let v = self.send(req).await?;
        match v.get("rt_cd").and_then(Value::as_str) {
            Some(code) if code != "0" => {
                let msg = v.get("msg1").and_then(Value::as_str).unwrap_or_default();
                Err(GatewayError::Transport(format!("rt_cd={code} {msg}")))
            }
            _ => Ok(v),
        }
    }

    async fn inquire_balance(&self) -> Result<Value, GatewayError> {
        self.query(
            PATH_BALANCE,
            TR_BALANCE,
            &[
                ("CANO", self.creds.account.as_str()),
                ("ACNT_PRDT_CD", ACCOUNT_PRODUCT),
                ("OVRS_EXCG_CD", self.exchange.as_str()),
                ("ITEM_CD", ""),
            ],
        )
        .await
    }
}

#[async_trait]
impl MarketDataFeed for KisClient {
    async fn fetch_bars(&self, symbol: &str, exchange: &str, interval_minutes: u32) -> Result<Vec<PriceBar>, GatewayError> {
        self.warn_if_token_expiring();
        let nmin = interval_minutes.to_string();
        let data = self
            .query(
                PATH_BARS,
                TR_BARS,
                &[
                    ("EXCD", exchange),
                    ("SYMB", symbol),
                    ("NMIN", nmin.as_str()),
                    ("FID_ETC_CLS_CODE", "0"),
                    ("FID_COND_MRKT_DIV_CODE", "J"),
                ],
            )
            .await?;
        parse_bars(&data, &self.creds.close_field)
    }
}

#[async_trait]
impl AccountGateway for KisClient {
    async fn cash_balance(&self) -> Result<f64, GatewayError> {
        parse_cash(&self.inquire_balance().await?)
    }

    async fn holdings(&self) -> Result<Vec<Holding>, GatewayError> {
        Ok(parse_holdings(&self.inquire_balance().await?))
    }

    async fn total_valuation(&self) -> Result<f64, GatewayError> {
        parse_valuation(&self.inquire_balance().await?)
    }
}

#[async_trait]
impl ExecutionGateway for KisClient {
    async fn submit(&self, order: &OrderIntent) -> Result<OrderResult, GatewayError> {
        let tr_id = order_tr_id(self.mode, order.side);
        let body = order_payload(&self.creds.account, order);
        debug!(cl_id = %order.cl_id, %tr_id, ?body, "kis: order");
        let req = self.authed(self.http.post(self.url(PATH_ORDER)), tr_id).json(&body);
        Ok(order_result(self.send(req).await?))
    }
}
