// ===============================
// src/gateway.rs (account + execution collaborators)
// ===============================
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{Holding, OrderIntent, OrderResult, Side};
use crate::feed::SimFeed;

/// Collaborator failures, classified by how the control loop reacts.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Network / protocol failure. Backoff and retry next cycle.
    #[error("transport: {0}")]
    Transport(String),
    /// Missing or unparseable payload field. Skip the cycle.
    #[error("data: {0}")]
    Data(String),
    /// Credentials, account or symbol rejected. Fatal.
    #[error("config: {0}")]
    Config(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(code) if code.as_u16() == 401 || code.as_u16() == 403 => GatewayError::Config(e.to_string()),
            _ if e.is_decode() => GatewayError::Data(e.to_string()),
            _ => GatewayError::Transport(e.to_string()),
        }
    }
}

#[async_trait]
pub trait AccountGateway: Send + Sync {
    async fn cash_balance(&self) -> Result<f64, GatewayError>;
    async fn holdings(&self) -> Result<Vec<Holding>, GatewayError>;
    async fn total_valuation(&self) -> Result<f64, GatewayError>;
}

#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    async fn submit(&self, order: &OrderIntent) -> Result<OrderResult, GatewayError>;
}

// -----------------------------------------------------------------------------
// Simulated broker: fills every order immediately at the sim feed's last price.
// -----------------------------------------------------------------------------
#[derive(Debug, Default)]
struct SimAccount {
    cash: f64,
    qty: i64, // signed, short < 0
    cost: f64,
}

#[derive(Clone)]
pub struct SimBroker {
    feed: SimFeed,
    acct: Arc<Mutex<SimAccount>>,
}

impl SimBroker {
    pub fn new(feed: SimFeed, starting_cash: f64) -> Self {
        Self { feed, acct: Arc::new(Mutex::new(SimAccount { cash: starting_cash, ..Default::default() })) }
    }

    fn with_acct<T>(&self, f: impl FnOnce(&mut SimAccount) -> T) -> Result<T, GatewayError> {
        let mut acct = self.acct.lock().map_err(|_| GatewayError::Transport("sim account poisoned".into()))?;
        Ok(f(&mut acct))
    }
}

#[async_trait]
impl AccountGateway for SimBroker {
    async fn cash_balance(&self) -> Result<f64, GatewayError> {
        self.with_acct(|a| a.cash)
    }

    async fn holdings(&self) -> Result<Vec<Holding>, GatewayError> {
        let px = self.feed.last_price();
        let symbol = self.feed.symbol().to_string();
        self.with_acct(|a| {
            if a.qty == 0 {
                return Vec::new();
            }
            let valuation = a.qty as f64 * px;
            let pnl = valuation - a.cost;
            let pnl_pct = if a.cost != 0.0 { pnl / a.cost.abs() * 100.0 } else { 0.0 };
            vec![Holding { symbol: symbol.clone(), name: symbol, qty: a.qty, valuation, pnl, pnl_pct }]
        })
    }

    async fn total_valuation(&self) -> Result<f64, GatewayError> {
        let px = self.feed.last_price();
        self.with_acct(|a| a.cash + a.qty as f64 * px)
    }
}

#[async_trait]
impl ExecutionGateway for SimBroker {
    async fn submit(&self, order: &OrderIntent) -> Result<OrderResult, GatewayError> {
        let px = self.feed.last_price();
        let qty = order.qty.get() as i64;
        let signed = match order.side { Side::Buy => qty, Side::Sell => -qty };
        self.with_acct(|a| {
            a.cash -= signed as f64 * px;
            a.cost += signed as f64 * px;
            a.qty += signed;
            if a.qty == 0 {
                a.cost = 0.0;
            }
        })?;
        Ok(OrderResult {
            accepted: true,
            code: "0".to_string(),
            message: format!("filled {} {} @ {:.2}", order.side.as_str(), qty, px),
            raw: serde_json::json!({ "cl_id": order.cl_id, "px": px, "qty": qty }),
        })
    }
}
