use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Local, NaiveDate, TimeZone, Utc};

pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;

    /// Calendar day the ledger partitions by.
    fn today(&self) -> NaiveDate;
}

/// Wall clock; days follow the local calendar.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

/// Manually driven clock for tests and replays.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn at_date(year: i32, month: u32, day: u32) -> Self {
        let now = Utc
            .with_ymd_and_hms(year, month, day, 12, 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        Self::new(now)
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard += by;
    }
}

impl Default for FixedClock {
    fn default() -> Self {
        Self::at_date(2025, 1, 15)
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}
