use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::ledger::CapacityLedger;

/// Unix milliseconds, used for audit timestamps (`created_at`, `cancelled_at`).
pub type Ms = i64;

/// Parse a time of day written as `HH:MM` (or `HH:MM:SS`).
pub fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .ok()
}

pub fn fmt_hhmm(t: NaiveTime) -> String {
    t.format("%H:%M").to_string()
}

/// Administrator-owned reservation window for one event/location.
///
/// Dates are an inclusive range; times are daily bounds. The slot set is
/// derived from this on every query and never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    pub date_begin: NaiveDate,
    pub date_end: NaiveDate,
    pub time_first: NaiveTime,
    pub time_last: NaiveTime,
    /// Slot granularity in minutes.
    pub time_unit: i32,
    /// Capacity per slot. `None` = unlimited.
    pub max_limit: Option<u32>,
}

impl WindowConfig {
    pub fn contains_date(&self, date: NaiveDate) -> bool {
        self.date_begin <= date && date <= self.date_end
    }

    /// Number of calendar days covered (inclusive). Zero or negative for a malformed range.
    pub fn days(&self) -> i64 {
        (self.date_end - self.date_begin).num_days() + 1
    }

    /// A window is expired once its last day is behind `today`.
    pub fn is_expired(&self, today: NaiveDate) -> bool {
        self.date_end < today
    }
}

/// Partial edit of a window. `None` keeps the current value; for the
/// nullable fields, `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowPatch {
    pub name: Option<Option<String>>,
    pub date_begin: Option<NaiveDate>,
    pub date_end: Option<NaiveDate>,
    pub time_first: Option<NaiveTime>,
    pub time_last: Option<NaiveTime>,
    pub time_unit: Option<i32>,
    pub max_limit: Option<Option<u32>>,
}

impl WindowPatch {
    /// A patch that overwrites every field.
    pub fn replace(name: Option<String>, config: WindowConfig) -> Self {
        Self {
            name: Some(name),
            date_begin: Some(config.date_begin),
            date_end: Some(config.date_end),
            time_first: Some(config.time_first),
            time_last: Some(config.time_last),
            time_unit: Some(config.time_unit),
            max_limit: Some(config.max_limit),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// The name and configuration after the edit.
    pub fn apply(&self, name: &Option<String>, config: &WindowConfig) -> (Option<String>, WindowConfig) {
        let name = self.name.clone().unwrap_or_else(|| name.clone());
        let config = WindowConfig {
            date_begin: self.date_begin.unwrap_or(config.date_begin),
            date_end: self.date_end.unwrap_or(config.date_end),
            time_first: self.time_first.unwrap_or(config.time_first),
            time_last: self.time_last.unwrap_or(config.time_last),
            time_unit: self.time_unit.unwrap_or(config.time_unit),
            max_limit: self.max_limit.unwrap_or(config.max_limit),
        };
        (name, config)
    }
}

/// One bookable `(date, time)` unit of a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Slot {
    pub date: NaiveDate,
    pub time: NaiveTime,
}

impl Slot {
    pub fn new(date: NaiveDate, time: NaiveTime) -> Self {
        Self { date, time }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.date, self.time.format("%H:%M"))
    }
}

/// Ledger key: a slot scoped to its window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotKey {
    pub window_id: Ulid,
    pub slot: Slot,
}

impl SlotKey {
    pub fn new(window_id: Ulid, slot: Slot) -> Self {
        Self { window_id, slot }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.window_id, self.slot)
    }
}

/// Remaining room in a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Limited(u32),
    Unbounded,
}

impl Availability {
    pub fn has_room(&self) -> bool {
        match self {
            Availability::Limited(n) => *n > 0,
            Availability::Unbounded => true,
        }
    }

    /// `None` for unbounded, matching how the wire encodes it (NULL).
    pub fn remaining(&self) -> Option<u32> {
        match self {
            Availability::Limited(n) => Some(*n),
            Availability::Unbounded => None,
        }
    }
}

/// Service line a visit is assigned to. Drives calendar coloring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ServiceLine {
    A,
    B,
    C,
    D,
}

impl ServiceLine {
    pub const ALL: [ServiceLine; 4] = [ServiceLine::A, ServiceLine::B, ServiceLine::C, ServiceLine::D];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceLine::A => "A",
            ServiceLine::B => "B",
            ServiceLine::C => "C",
            ServiceLine::D => "D",
        }
    }
}

impl FromStr for ServiceLine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(ServiceLine::A),
            "B" => Ok(ServiceLine::B),
            "C" => Ok(ServiceLine::C),
            "D" => Ok(ServiceLine::D),
            other => Err(format!("unknown service line: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Active,
    /// Terminal. Soft-deleted: the record stays, the ledger no longer counts it.
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Active => "active",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

/// A committed claim on exactly one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub window_id: Ulid,
    pub slot_date: NaiveDate,
    pub slot_time: NaiveTime,
    pub subject_id: String,
    pub contact_name: String,
    pub contact_phone: String,
    pub memo: Option<String>,
    pub line: Option<ServiceLine>,
    pub status: BookingStatus,
    pub created_at: Ms,
    pub cancelled_at: Option<Ms>,
    pub cancel_reason: Option<String>,
}

impl Booking {
    pub fn slot(&self) -> Slot {
        Slot::new(self.slot_date, self.slot_time)
    }

    pub fn key(&self) -> SlotKey {
        SlotKey::new(self.window_id, self.slot())
    }

    pub fn is_active(&self) -> bool {
        self.status == BookingStatus::Active
    }
}

/// Inbound booking attempt. Becomes a `Booking` only if admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookRequest {
    pub id: Ulid,
    pub window_id: Ulid,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub subject_id: String,
    pub contact_name: String,
    pub contact_phone: String,
    pub memo: Option<String>,
    pub line: Option<ServiceLine>,
}

impl BookRequest {
    pub fn slot(&self) -> Slot {
        Slot::new(self.date, self.time)
    }
}

#[derive(Debug, Clone)]
pub struct WindowState {
    pub id: Ulid,
    pub name: Option<String>,
    pub config: WindowConfig,
    /// Every booking ever made against the window, cancelled ones included,
    /// sorted by slot then creation time.
    pub bookings: Vec<Booking>,
    /// Occupancy of active bookings only.
    pub ledger: CapacityLedger,
    /// Set under the write lock on delete, so a mutation queued behind the
    /// delete sees the window as gone.
    pub deleted: bool,
}

impl WindowState {
    pub fn new(id: Ulid, name: Option<String>, config: WindowConfig) -> Self {
        Self {
            id,
            name,
            config,
            bookings: Vec::new(),
            ledger: CapacityLedger::new(),
            deleted: false,
        }
    }

    /// Insert keeping slot order; ties keep arrival order.
    pub fn insert_booking(&mut self, booking: Booking) {
        let slot = booking.slot();
        let pos = self.bookings.partition_point(|b| b.slot() <= slot);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    pub fn booking_position(&self, id: &Ulid) -> Option<usize> {
        self.bookings.iter().position(|b| b.id == *id)
    }

    pub fn active_bookings(&self) -> impl Iterator<Item = &Booking> {
        self.bookings.iter().filter(|b| b.is_active())
    }

    /// Bookings of one slot, via binary search on the sorted list.
    pub fn bookings_at(&self, slot: Slot) -> &[Booking] {
        let lo = self.bookings.partition_point(|b| b.slot() < slot);
        let hi = self.bookings.partition_point(|b| b.slot() <= slot);
        &self.bookings[lo..hi]
    }

    /// The subject's active booking on `slot`, if any.
    pub fn active_booking_for(&self, subject_id: &str, slot: Slot) -> Option<&Booking> {
        self.bookings_at(slot)
            .iter()
            .find(|b| b.is_active() && b.subject_id == subject_id)
    }

    pub fn info(&self) -> WindowInfo {
        WindowInfo {
            id: self.id,
            name: self.name.clone(),
            config: self.config.clone(),
            active_bookings: self.active_bookings().count(),
        }
    }
}

/// WAL record format. Flat; the ledger is never logged, only rebuilt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    WindowCreated {
        id: Ulid,
        name: Option<String>,
        config: WindowConfig,
    },
    WindowUpdated {
        id: Ulid,
        name: Option<String>,
        config: WindowConfig,
    },
    WindowDeleted {
        id: Ulid,
    },
    BookingConfirmed {
        booking: Booking,
    },
    BookingCancelled {
        id: Ulid,
        window_id: Ulid,
        reason: Option<String>,
        cancelled_at: Ms,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub config: WindowConfig,
    pub active_bookings: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotAvailability {
    pub slot: Slot,
    pub occupied: u32,
    pub available: Availability,
}

/// Availability for one date: every slot of that day in time order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayAvailability {
    pub date: NaiveDate,
    pub slots: Vec<SlotAvailability>,
}
