// ===============================
// src/calendar.rs
// ===============================
//
// Session gate used by the control loop.
// - ApproxKstCalendar : coarse US-session window on the Seoul clock
//                       (no holidays, no DST shift)
// - AlwaysOpen        : simulation backend, never liquidates
//
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use chrono_tz::Asia::Seoul;

pub trait MarketCalendar: Send + Sync {
    fn is_open(&self, now: DateTime<Utc>) -> bool;
    /// Pre-close window in which any open position is flattened.
    fn in_liquidation_window(&self, now: DateTime<Utc>) -> bool;
    /// Date used to bucket realized PnL.
    fn trading_day(&self, now: DateTime<Utc>) -> NaiveDate;
}

/// US regular session approximated as 22:00..06:59 KST, liquidation 05:00..06:59 KST.
#[derive(Debug, Clone)]
pub struct ApproxKstCalendar {
    pub open_from_hour: u32,
    pub open_until_hour: u32,
    pub liquidate_from_hour: u32,
}

impl Default for ApproxKstCalendar {
    fn default() -> Self {
        Self { open_from_hour: 22, open_until_hour: 6, liquidate_from_hour: 5 }
    }
}

impl MarketCalendar for ApproxKstCalendar {
    fn is_open(&self, now: DateTime<Utc>) -> bool {
        let h = now.with_timezone(&Seoul).hour();
        h >= self.open_from_hour || h <= self.open_until_hour
    }

    fn in_liquidation_window(&self, now: DateTime<Utc>) -> bool {
        let h = now.with_timezone(&Seoul).hour();
        (self.liquidate_from_hour..=self.open_until_hour).contains(&h)
    }

    fn trading_day(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&Seoul).date_naive()
    }
}

#[derive(Debug, Clone, Default)]
pub struct AlwaysOpen;

impl MarketCalendar for AlwaysOpen {
    fn is_open(&self, _now: DateTime<Utc>) -> bool { true }
    fn in_liquidation_window(&self, _now: DateTime<Utc>) -> bool { false }
    fn trading_day(&self, now: DateTime<Utc>) -> NaiveDate { now.date_naive() }
}
