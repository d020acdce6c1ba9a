use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::projector::{self, MonthGrid, MonthRef};
use crate::slots;

use super::{Engine, EngineError, SharedWindowState};

impl Engine {
    fn window(&self, id: Ulid) -> Result<SharedWindowState, EngineError> {
        self.get_window(&id).ok_or(EngineError::WindowNotFound(id))
    }

    pub async fn window_info(&self, id: Ulid) -> Result<WindowInfo, EngineError> {
        let ws = self.window(id)?;
        let guard = ws.read().await;
        if guard.deleted {
            return Err(EngineError::WindowNotFound(id));
        }
        Ok(guard.info())
    }

    /// Every live window, expired ones included, ordered by id.
    pub async fn list_windows(&self) -> Vec<WindowInfo> {
        let windows: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(windows.len());
        for ws in windows {
            let guard = ws.read().await;
            if !guard.deleted {
                out.push(guard.info());
            }
        }
        out.sort_by_key(|w| w.id);
        out
    }

    pub async fn slots(&self, window_id: Ulid) -> Result<Vec<Slot>, EngineError> {
        let ws = self.window(window_id)?;
        let guard = ws.read().await;
        Ok(slots::generate(&guard.config)?.collect())
    }

    /// Per-date slot availability over `[from, to]`, clipped to the window.
    /// Advisory: `book` re-checks under the lock.
    pub async fn availability(
        &self,
        window_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DayAvailability>, EngineError> {
        if (to - from).num_days() + 1 > MAX_QUERY_DAYS {
            return Err(EngineError::LimitExceeded("availability range too wide"));
        }
        let ws = self.window(window_id)?;
        let guard = ws.read().await;
        availability_between(&guard, from, to)
    }

    /// Availability of every date of the window.
    pub async fn window_availability(&self, window_id: Ulid) -> Result<Vec<DayAvailability>, EngineError> {
        let ws = self.window(window_id)?;
        let guard = ws.read().await;
        availability_between(&guard, guard.config.date_begin, guard.config.date_end)
    }

    pub async fn slot_availability(
        &self,
        window_id: Ulid,
        slot: Slot,
    ) -> Result<SlotAvailability, EngineError> {
        let ws = self.window(window_id)?;
        let guard = ws.read().await;
        if !slots::is_valid_slot(&guard.config, slot.date, slot.time) {
            return Err(EngineError::SlotOutOfWindow { window_id, slot });
        }
        Ok(slot_row(&guard, slot))
    }

    /// Bookings of a window in slot order. Cancelled ones only on request.
    pub async fn get_bookings(
        &self,
        window_id: Ulid,
        include_cancelled: bool,
    ) -> Result<Vec<Booking>, EngineError> {
        let ws = self.window(window_id)?;
        let guard = ws.read().await;
        Ok(guard
            .bookings
            .iter()
            .filter(|b| include_cancelled || b.is_active())
            .cloned()
            .collect())
    }

    pub async fn get_booking(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let window_id = self
            .get_window_for_booking(&booking_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        let ws = self.window(window_id)?;
        let guard = ws.read().await;
        guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::BookingNotFound(booking_id))
    }

    pub async fn calendar(&self, window_id: Ulid, month: MonthRef) -> Result<MonthGrid, EngineError> {
        let ws = self.window(window_id)?;
        let guard = ws.read().await;
        Ok(projector::month_grid(&guard.config, &guard.bookings, month))
    }
}

fn availability_between(
    ws: &WindowState,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<DayAvailability>, EngineError> {
    let mut days: Vec<DayAvailability> = Vec::new();
    for slot in slots::generate_between(&ws.config, from, to)? {
        let row = slot_row(ws, slot);
        match days.last_mut() {
            Some(day) if day.date == slot.date => day.slots.push(row),
            _ => days.push(DayAvailability {
                date: slot.date,
                slots: vec![row],
            }),
        }
    }
    Ok(days)
}

fn slot_row(ws: &WindowState, slot: Slot) -> SlotAvailability {
    let key = SlotKey::new(ws.id, slot);
    SlotAvailability {
        slot,
        occupied: ws.ledger.occupied(&key),
        available: ws.ledger.available(ws.config.max_limit, &key),
    }
}
