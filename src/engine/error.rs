use ulid::Ulid;

use crate::model::{Slot, SlotKey};

#[derive(Debug)]
pub enum EngineError {
    /// Malformed window configuration.
    InvalidWindow(&'static str),
    /// Missing, deleted, or (for booking) expired window.
    WindowNotFound(Ulid),
    /// Requested `(date, time)` is not a generated slot of the window.
    SlotOutOfWindow { window_id: Ulid, slot: Slot },
    /// Capacity exhausted at commit time.
    SlotFull { slot: Slot, capacity: u32 },
    /// The subject already holds this active booking.
    DuplicateBooking(Ulid),
    BookingNotFound(Ulid),
    AlreadyCancelled(Ulid),
    AlreadyExists(Ulid),
    InvalidBooking(&'static str),
    /// Window edit rejected: these active bookings would fall off the slot grid.
    BookingsOrphaned { window_id: Ulid, bookings: Vec<Ulid> },
    /// Window edit rejected: a slot already holds more than the new limit.
    CapacityBelowOccupancy { limit: u32, occupied: u32 },
    /// Could not get exclusive access to the window in time. Safe to retry.
    Contended(Ulid),
    /// Ledger decrement without a matching increment.
    LedgerUnderflow(SlotKey),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Stable label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidWindow(_) => "invalid_window",
            EngineError::WindowNotFound(_) => "window_not_found",
            EngineError::SlotOutOfWindow { .. } => "slot_out_of_window",
            EngineError::SlotFull { .. } => "slot_full",
            EngineError::DuplicateBooking(_) => "duplicate_booking",
            EngineError::BookingNotFound(_) => "booking_not_found",
            EngineError::AlreadyCancelled(_) => "already_cancelled",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::InvalidBooking(_) => "invalid_booking",
            EngineError::BookingsOrphaned { .. } => "bookings_orphaned",
            EngineError::CapacityBelowOccupancy { .. } => "capacity_below_occupancy",
            EngineError::Contended(_) => "contended",
            EngineError::LedgerUnderflow(_) => "ledger_underflow",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, EngineError::Contended(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidWindow(msg) => write!(f, "invalid window: {msg}"),
            EngineError::WindowNotFound(id) => write!(f, "window not found: {id}"),
            EngineError::SlotOutOfWindow { window_id, slot } => {
                write!(f, "slot {slot} is not part of window {window_id}")
            }
            EngineError::SlotFull { slot, capacity } => {
                write!(f, "slot {slot} is full (capacity {capacity})")
            }
            EngineError::DuplicateBooking(id) => {
                write!(f, "duplicate booking: already held as {id}")
            }
            EngineError::BookingNotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::AlreadyCancelled(id) => write!(f, "booking already cancelled: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidBooking(msg) => write!(f, "invalid booking: {msg}"),
            EngineError::BookingsOrphaned { window_id, bookings } => {
                write!(
                    f,
                    "edit of window {window_id} would orphan {} active booking(s): {bookings:?}",
                    bookings.len()
                )
            }
            EngineError::CapacityBelowOccupancy { limit, occupied } => {
                write!(f, "max_limit {limit} is below current occupancy {occupied}")
            }
            EngineError::Contended(id) => {
                write!(f, "window {id} is busy, retry the request")
            }
            EngineError::LedgerUnderflow(key) => write!(f, "ledger underflow at {key}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
