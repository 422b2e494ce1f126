//! Clock Abstraction for Object Naming
//!
//! Object keys embed the upload date. The date is read through this trait so
//! that production uses the wall clock while tests pin it.

use chrono::{Datelike, NaiveDate, Utc};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// Source of the as-of date used in object keys
pub trait SinkClock: Send + Sync + Clone + 'static {
    /// Current date (UTC)
    fn today(&self) -> NaiveDate;
}

/// Wall clock, UTC
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SinkClock for SystemClock {
    fn today(&self) -> NaiveDate {
        Utc::now().date_naive()
    }
}

/// Simulated clock for deterministic testing
///
/// The date only changes when explicitly told to via `advance_days()` or `set()`.
#[derive(Debug, Clone)]
pub struct SimulatedClock {
    /// Current date as days from the common era
    days_from_ce: Arc<AtomicI32>,
}

impl SimulatedClock {
    pub fn new(date: NaiveDate) -> Self {
        SimulatedClock {
            days_from_ce: Arc::new(AtomicI32::new(date.num_days_from_ce())),
        }
    }

    pub fn set(&self, date: NaiveDate) {
        self.days_from_ce
            .store(date.num_days_from_ce(), Ordering::SeqCst);
    }

    pub fn advance_days(&self, days: i32) {
        self.days_from_ce.fetch_add(days, Ordering::SeqCst);
    }
}

impl SinkClock for SimulatedClock {
    fn today(&self) -> NaiveDate {
        let days = self.days_from_ce.load(Ordering::SeqCst);
        NaiveDate::from_num_days_from_ce_opt(days).unwrap_or(NaiveDate::MAX)
    }
}
