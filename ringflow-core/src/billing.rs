//! Billing ticker
//!
//! Counts connected seconds, derives the remaining budget, and decides when a
//! per-minute deduction is due. Pure bookkeeping: the owning session turns a
//! [`TickOutcome`] into backend requests and timers.

use serde::{Deserialize, Serialize};

/// A deduction due for one whole minute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deduction {
    /// Minute being billed, starting at 1
    pub minute: u64,
    /// Connected seconds at the time the minute was crossed
    pub elapsed_seconds: u64,
}

/// What happened on one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickOutcome {
    /// Deduction to request, if a new minute boundary was crossed
    pub deduction: Option<Deduction>,
    /// Remaining budget reached zero on this tick
    pub exhausted: bool,
    /// Remaining budget dropped below the low-time threshold on this tick
    pub entered_low_time: bool,
}

/// Connected-time counter for one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingTicker {
    elapsed_seconds: u64,
    max_duration_seconds: Option<u64>,
    remaining_seconds: Option<u64>,
    last_deduction_minute_mark: u64,
    low_time_threshold: u64,
    is_low_time: bool,
}

impl BillingTicker {
    /// Ticker for a session with a purchased budget
    pub fn metered(max_duration_seconds: u64, low_time_threshold: u64) -> Self {
        let mut ticker = Self::unmetered(low_time_threshold);
        ticker.set_budget(max_duration_seconds);
        ticker
    }

    /// Ticker that only counts elapsed time
    pub fn unmetered(low_time_threshold: u64) -> Self {
        Self {
            elapsed_seconds: 0,
            max_duration_seconds: None,
            remaining_seconds: None,
            last_deduction_minute_mark: 0,
            low_time_threshold,
            is_low_time: false,
        }
    }

    /// Install or replace the purchased budget
    pub fn set_budget(&mut self, max_duration_seconds: u64) {
        self.max_duration_seconds = Some(max_duration_seconds);
        self.recompute();
    }

    /// Advance by one connected second
    pub fn on_second_tick(&mut self) -> TickOutcome {
        self.elapsed_seconds += 1;
        let was_low = self.is_low_time;
        self.recompute();

        let Some(remaining) = self.remaining_seconds else {
            return TickOutcome::default();
        };

        let mut outcome = TickOutcome {
            exhausted: remaining == 0,
            entered_low_time: self.is_low_time && !was_low,
            ..TickOutcome::default()
        };

        let minute = self.elapsed_seconds / 60;
        if minute > self.last_deduction_minute_mark {
            self.last_deduction_minute_mark = minute;
            outcome.deduction = Some(Deduction {
                minute,
                elapsed_seconds: self.elapsed_seconds,
            });
        }
        outcome
    }

    /// Grant extra budget without resetting elapsed time
    ///
    /// Returns the new remaining budget, or `None` for an unmetered ticker.
    pub fn extend_budget(&mut self, additional_seconds: u64) -> Option<u64> {
        let max = self.max_duration_seconds?;
        self.max_duration_seconds = Some(max.saturating_add(additional_seconds));
        self.recompute();
        self.remaining_seconds
    }

    fn recompute(&mut self) {
        self.remaining_seconds = self
            .max_duration_seconds
            .map(|max| max.saturating_sub(self.elapsed_seconds));
        self.is_low_time = self
            .remaining_seconds
            .is_some_and(|remaining| remaining < self.low_time_threshold);
    }

    /// Connected seconds
    #[must_use]
    pub fn elapsed_seconds(&self) -> u64 {
        self.elapsed_seconds
    }

    /// Purchased budget
    #[must_use]
    pub fn max_duration_seconds(&self) -> Option<u64> {
        self.max_duration_seconds
    }

    /// Remaining budget, floored at zero
    #[must_use]
    pub fn remaining_seconds(&self) -> Option<u64> {
        self.remaining_seconds
    }

    /// Last minute already billed
    #[must_use]
    pub fn last_deduction_minute_mark(&self) -> u64 {
        self.last_deduction_minute_mark
    }

    /// Remaining budget is below the threshold
    #[must_use]
    pub fn is_low_time(&self) -> bool {
        self.is_low_time
    }

    /// Remaining budget is used up
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.remaining_seconds == Some(0)
    }
}
