// ===============================
// src/positions.rs (single position state machine & PnL)
// ===============================
use std::num::NonZeroU32;

use thiserror::Error;

use crate::domain::{ExitReason, PositionSide};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Position {
    #[default]
    Flat,
    Long { entry: f64, qty: NonZeroU32 },
    Short { entry: f64, qty: NonZeroU32 },
}

impl Position {
    pub fn is_flat(&self) -> bool { matches!(self, Position::Flat) }

    pub fn side(&self) -> Option<PositionSide> {
        match self {
            Position::Flat => None,
            Position::Long { .. } => Some(PositionSide::Long),
            Position::Short { .. } => Some(PositionSide::Short),
        }
    }

    pub fn entry(&self) -> Option<f64> {
        match self {
            Position::Flat => None,
            Position::Long { entry, .. } | Position::Short { entry, .. } => Some(*entry),
        }
    }

    pub fn qty(&self) -> u32 {
        match self {
            Position::Flat => 0,
            Position::Long { qty, .. } | Position::Short { qty, .. } => qty.get(),
        }
    }
}

/// What a close removed from the book.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClosedPosition {
    pub side: PositionSide,
    pub entry: f64,
    pub qty: NonZeroU32,
}

#[derive(Debug, Error, PartialEq)]
pub enum PositionError {
    #[error("position already open ({0:?})")]
    AlreadyOpen(PositionSide),
    #[error("entry price must be positive, got {0}")]
    BadPrice(f64),
}

pub struct PositionManager {
    position: Position,
    take_profit: f64,
    stop_loss: f64,
}

impl PositionManager {
    pub fn new(take_profit: f64, stop_loss: f64) -> Self {
        Self { position: Position::Flat, take_profit, stop_loss }
    }

    pub fn position(&self) -> Position { self.position }

    pub fn is_flat(&self) -> bool { self.position.is_flat() }

    pub fn open(&mut self, side: PositionSide, price: f64, qty: NonZeroU32) -> Result<(), PositionError> {
        if let Some(cur) = self.position.side() {
            return Err(PositionError::AlreadyOpen(cur));
        }
        if !(price > 0.0) || !price.is_finite() {
            return Err(PositionError::BadPrice(price));
        }
        self.position = match side {
            PositionSide::Long => Position::Long { entry: price, qty },
            PositionSide::Short => Position::Short { entry: price, qty },
        };
        Ok(())
    }

    /// Returns what was closed; `None` when already flat (no state change).
    pub fn close(&mut self) -> Option<ClosedPosition> {
        let closed = match self.position {
            Position::Flat => None,
            Position::Long { entry, qty } => Some(ClosedPosition { side: PositionSide::Long, entry, qty }),
            Position::Short { entry, qty } => Some(ClosedPosition { side: PositionSide::Short, entry, qty }),
        };
        self.position = Position::Flat;
        closed
    }

    /// Fractional PnL, positive when the move favours the held side.
    pub fn unrealized_pnl_pct(&self, price: f64) -> f64 {
        if price <= 0.0 {
            return 0.0;
        }
        match self.position {
            Position::Flat => 0.0,
            Position::Long { entry, .. } => (price - entry) / entry,
            Position::Short { entry, .. } => (entry - price) / entry,
        }
    }

    pub fn hit_take_profit(&self, price: f64) -> bool {
        !self.is_flat() && self.unrealized_pnl_pct(price) >= self.take_profit
    }

    pub fn hit_stop_loss(&self, price: f64) -> bool {
        !self.is_flat() && self.unrealized_pnl_pct(price) <= -self.stop_loss
    }

    /// Take-profit wins when both would trigger.
    pub fn exit_reason(&self, price: f64) -> Option<ExitReason> {
        if self.hit_take_profit(price) {
            Some(ExitReason::TakeProfit)
        } else if self.hit_stop_loss(price) {
            Some(ExitReason::StopLoss)
        } else {
            None
        }
    }
}
