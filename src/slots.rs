use chrono::{Duration, NaiveDate, NaiveTime, Timelike};

use crate::engine::EngineError;
use crate::limits::MAX_WINDOW_DAYS;
use crate::model::*;

// ── Slot Calendar Generation ──────────────────────────────────────
//
// A window's slots are `time_first + k * time_unit` for every date in
// `[date_begin, date_end]`, keeping only slots that end by `time_last`.
// A trailing partial slot is never emitted, so the count per day is exactly
// `floor((time_last - time_first) / time_unit)`.

pub fn validate(config: &WindowConfig) -> Result<(), EngineError> {
    if config.date_begin > config.date_end {
        return Err(EngineError::InvalidWindow("date_begin is after date_end"));
    }
    if config.time_first >= config.time_last {
        return Err(EngineError::InvalidWindow("time_first must be before time_last"));
    }
    if config.time_unit <= 0 {
        return Err(EngineError::InvalidWindow("time_unit must be positive"));
    }
    if config.max_limit == Some(0) {
        return Err(EngineError::InvalidWindow("max_limit must be positive"));
    }
    if config.days() > MAX_WINDOW_DAYS {
        return Err(EngineError::LimitExceeded("window spans too many days"));
    }
    Ok(())
}

fn secs_of_day(t: NaiveTime) -> i64 {
    t.num_seconds_from_midnight() as i64
}

fn unit_secs(config: &WindowConfig) -> i64 {
    config.time_unit as i64 * 60
}

/// Slots per day. Zero for a malformed window.
pub fn slots_per_day(config: &WindowConfig) -> u32 {
    if config.time_unit <= 0 || config.time_first >= config.time_last {
        return 0;
    }
    let span = secs_of_day(config.time_last) - secs_of_day(config.time_first);
    (span / unit_secs(config)) as u32
}

/// The full slot sequence of a window, in `(date, time)` order.
pub fn generate(config: &WindowConfig) -> Result<Slots, EngineError> {
    validate(config)?;
    Ok(Slots::new(config, config.date_begin, config.date_end))
}

/// Slots of a single date; empty if the date is outside the window.
pub fn generate_for_date(config: &WindowConfig, date: NaiveDate) -> Result<Slots, EngineError> {
    validate(config)?;
    if !config.contains_date(date) {
        return Ok(Slots::empty(config));
    }
    Ok(Slots::new(config, date, date))
}

/// Slots of `[from, to]` clipped to the window's own date range.
pub fn generate_between(
    config: &WindowConfig,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Slots, EngineError> {
    validate(config)?;
    let from = from.max(config.date_begin);
    let to = to.min(config.date_end);
    if from > to {
        return Ok(Slots::empty(config));
    }
    Ok(Slots::new(config, from, to))
}

/// Membership test using the same rule as `generate`, without materializing
/// the sequence.
pub fn is_valid_slot(config: &WindowConfig, date: NaiveDate, time: NaiveTime) -> bool {
    let per_day = slots_per_day(config);
    if per_day == 0 || !config.contains_date(date) {
        return false;
    }
    let offset = secs_of_day(time) - secs_of_day(config.time_first);
    if offset < 0 {
        return false;
    }
    let unit = unit_secs(config);
    offset % unit == 0 && offset / unit < per_day as i64
}

/// Lazy slot sequence. Cheap to clone, so a consumer can restart it.
#[derive(Debug, Clone)]
pub struct Slots {
    first: NaiveTime,
    unit_secs: i64,
    per_day: u32,
    date: NaiveDate,
    end: NaiveDate,
    k: u32,
    done: bool,
}

impl Slots {
    fn new(config: &WindowConfig, from: NaiveDate, to: NaiveDate) -> Self {
        Self {
            first: config.time_first,
            unit_secs: unit_secs(config),
            per_day: slots_per_day(config),
            date: from,
            end: to,
            k: 0,
            done: from > to,
        }
    }

    fn empty(config: &WindowConfig) -> Self {
        let mut slots = Self::new(config, config.date_begin, config.date_begin);
        slots.done = true;
        slots
    }

    fn remaining(&self) -> usize {
        if self.done {
            return 0;
        }
        let later_days = (self.end - self.date).num_days().max(0) as usize;
        (self.per_day - self.k) as usize + later_days * self.per_day as usize
    }
}

impl Iterator for Slots {
    type Item = Slot;

    fn next(&mut self) -> Option<Slot> {
        while !self.done {
            if self.k < self.per_day {
                let time = self.first + Duration::seconds(self.k as i64 * self.unit_secs);
                self.k += 1;
                return Some(Slot::new(self.date, time));
            }
            match self.date.succ_opt() {
                Some(next) if self.date < self.end => {
                    self.date = next;
                    self.k = 0;
                }
                _ => self.done = true,
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining();
        (n, Some(n))
    }
}

impl ExactSizeIterator for Slots {}
