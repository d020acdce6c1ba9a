use chrono::NaiveDate;

use crate::limits::*;
use crate::model::*;
use crate::slots;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

fn check_len(value: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

pub(crate) fn validate_name(name: Option<&str>) -> Result<(), EngineError> {
    if let Some(n) = name {
        check_len(n, MAX_NAME_LEN, "window name too long")?;
    }
    Ok(())
}

pub(crate) fn validate_reason(reason: Option<&str>) -> Result<(), EngineError> {
    if let Some(r) = reason {
        check_len(r, MAX_REASON_LEN, "cancel reason too long")?;
    }
    Ok(())
}

/// Field checks that need no window state.
pub(crate) fn validate_request(req: &BookRequest) -> Result<(), EngineError> {
    if req.subject_id.trim().is_empty() {
        return Err(EngineError::InvalidBooking("subject_id is required"));
    }
    if req.contact_name.trim().is_empty() {
        return Err(EngineError::InvalidBooking("contact_name is required"));
    }
    if req.contact_phone.trim().is_empty() {
        return Err(EngineError::InvalidBooking("contact_phone is required"));
    }
    check_len(&req.subject_id, MAX_SUBJECT_ID_LEN, "subject_id too long")?;
    check_len(&req.contact_name, MAX_CONTACT_NAME_LEN, "contact_name too long")?;
    check_len(&req.contact_phone, MAX_CONTACT_PHONE_LEN, "contact_phone too long")?;
    if let Some(memo) = &req.memo {
        check_len(memo, MAX_MEMO_LEN, "memo too long")?;
    }
    Ok(())
}

/// Admission checks in order: window live, slot legal, no duplicate, room
/// left. Caller holds the window's write lock and commits the returned key
/// under that same lock, which makes check-then-increment one atomic step.
pub(crate) fn check_admission(
    ws: &WindowState,
    req: &BookRequest,
    today: NaiveDate,
) -> Result<SlotKey, EngineError> {
    if ws.deleted || ws.config.is_expired(today) {
        return Err(EngineError::WindowNotFound(ws.id));
    }
    let slot = req.slot();
    if !slots::is_valid_slot(&ws.config, slot.date, slot.time) {
        return Err(EngineError::SlotOutOfWindow {
            window_id: ws.id,
            slot,
        });
    }
    if let Some(existing) = ws.active_booking_for(&req.subject_id, slot) {
        return Err(EngineError::DuplicateBooking(existing.id));
    }
    if ws.bookings.len() >= MAX_BOOKINGS_PER_WINDOW {
        return Err(EngineError::LimitExceeded("too many bookings on window"));
    }
    let key = SlotKey::new(ws.id, slot);
    if !ws.ledger.available(ws.config.max_limit, &key).has_room() {
        return Err(EngineError::SlotFull {
            slot,
            capacity: ws.config.max_limit.unwrap_or(0),
        });
    }
    Ok(key)
}

/// Window edits are rejected, never applied partially: every active booking
/// must still sit on the new slot grid and no slot may already exceed the
/// new limit.
pub(crate) fn check_window_edit(ws: &WindowState, config: &WindowConfig) -> Result<(), EngineError> {
    let orphaned: Vec<_> = ws
        .active_bookings()
        .filter(|b| !slots::is_valid_slot(config, b.slot_date, b.slot_time))
        .map(|b| b.id)
        .collect();
    if !orphaned.is_empty() {
        return Err(EngineError::BookingsOrphaned {
            window_id: ws.id,
            bookings: orphaned,
        });
    }
    if let Some(limit) = config.max_limit {
        let occupied = ws.ledger.peak();
        if occupied > limit {
            return Err(EngineError::CapacityBelowOccupancy { limit, occupied });
        }
    }
    Ok(())
}
