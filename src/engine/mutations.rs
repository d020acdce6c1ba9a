use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::slots;

use super::admission::{
    check_admission, check_window_edit, now_ms, validate_name, validate_reason, validate_request,
};
use super::{lock_deadline, Engine, EngineError, WalCommand};

impl Engine {
    pub async fn create_window(
        &self,
        id: Ulid,
        name: Option<String>,
        config: WindowConfig,
    ) -> Result<(), EngineError> {
        validate_name(name.as_deref())?;
        slots::validate(&config)?;
        if self.state.len() >= MAX_WINDOWS_PER_SITE {
            return Err(EngineError::LimitExceeded("too many windows"));
        }
        let _gate = self.enter_gate(lock_deadline(), id).await?;
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::WindowCreated {
            id,
            name: name.clone(),
            config: config.clone(),
        };
        self.wal_append(&event).await?;
        let ws = WindowState::new(id, name, config);
        self.state.insert(id, Arc::new(RwLock::new(ws)));
        info!("window {id} created");
        Ok(())
    }

    /// Replace a window's name and configuration.
    pub async fn update_window(
        &self,
        id: Ulid,
        name: Option<String>,
        config: WindowConfig,
    ) -> Result<(), EngineError> {
        self.edit_window(id, WindowPatch::replace(name, config)).await.map(|_| ())
    }

    /// Apply a partial edit under the window's lock. Rejected as a whole if any
    /// active booking would fall off the new slot grid or a slot already holds
    /// more bookings than the new limit.
    pub async fn edit_window(&self, id: Ulid, patch: WindowPatch) -> Result<WindowInfo, EngineError> {
        let mut guard = self.lock_window(id).await?;
        let (name, config) = patch.apply(&guard.name, &guard.config);
        validate_name(name.as_deref())?;
        slots::validate(&config)?;
        check_window_edit(&guard, &config)
            .inspect_err(|e| warn!("edit of window {id} rejected: {e}"))?;

        let event = Event::WindowUpdated { id, name, config };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("window {id} updated");
        Ok(guard.info())
    }

    /// Remove a window and, with it, all of its bookings.
    pub async fn delete_window(&self, id: Ulid) -> Result<(), EngineError> {
        let mut guard = self.lock_window(id).await?;

        let event = Event::WindowDeleted { id };
        self.wal_append(&event).await?;
        guard.deleted = true;
        for b in &guard.bookings {
            self.booking_to_window.remove(&b.id);
        }
        self.state.remove(&id);
        info!("window {id} deleted with {} booking(s)", guard.bookings.len());
        Ok(())
    }

    /// Admit a booking if its slot still has room. Check and commit happen
    /// under the window's write lock, so concurrent requests for the last
    /// unit of capacity cannot both succeed.
    pub async fn book(&self, req: BookRequest) -> Result<Booking, EngineError> {
        let result = self.admit(req).await;
        match &result {
            Ok(_) => metrics::counter!(observability::BOOKINGS_ADMITTED_TOTAL).increment(1),
            Err(e) => {
                metrics::counter!(observability::BOOKINGS_REJECTED_TOTAL, "kind" => e.kind())
                    .increment(1)
            }
        }
        result
    }

    /// Claims the booking id in the site-wide index before any window lock, so
    /// the same id sent to two windows at once is admitted at most once. The
    /// claim is released if admission fails.
    async fn admit(&self, req: BookRequest) -> Result<Booking, EngineError> {
        validate_request(&req)?;
        let (id, window_id) = (req.id, req.window_id);
        match self.booking_to_window.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(window_id);
            }
        }
        let result = self.admit_claimed(req).await;
        if result.is_err() {
            self.booking_to_window.remove_if(&id, |_, w| *w == window_id);
        }
        result
    }

    async fn admit_claimed(&self, req: BookRequest) -> Result<Booking, EngineError> {
        let mut guard = self.lock_window(req.window_id).await?;
        let key = check_admission(&guard, &req, self.today())?;

        let booking = Booking {
            id: req.id,
            window_id: req.window_id,
            slot_date: req.date,
            slot_time: req.time,
            subject_id: req.subject_id,
            contact_name: req.contact_name,
            contact_phone: req.contact_phone,
            memo: req.memo,
            line: req.line,
            status: BookingStatus::Active,
            created_at: now_ms(),
            cancelled_at: None,
            cancel_reason: None,
        };
        let event = Event::BookingConfirmed {
            booking: booking.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        debug!("booking {} admitted at {key}", booking.id);
        Ok(booking)
    }

    /// Soft-cancel: the record stays with its reason and timestamp, and the
    /// slot's capacity is released.
    pub async fn cancel(&self, booking_id: Ulid, reason: Option<String>) -> Result<Booking, EngineError> {
        validate_reason(reason.as_deref())?;
        let window_id = self
            .get_window_for_booking(&booking_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        let mut guard = self.lock_window(window_id).await?;
        match guard.booking(&booking_id) {
            None => return Err(EngineError::BookingNotFound(booking_id)),
            Some(b) if !b.is_active() => return Err(EngineError::AlreadyCancelled(booking_id)),
            Some(_) => {}
        }

        let event = Event::BookingCancelled {
            id: booking_id,
            window_id,
            reason,
            cancelled_at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(observability::BOOKINGS_CANCELLED_TOTAL).increment(1);
        debug!("booking {booking_id} cancelled");
        guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::BookingNotFound(booking_id))
    }

    /// Rewrite the WAL with the minimal events that recreate the current state.
    /// Cancelled bookings are kept; the ledger is rebuilt on replay.
    ///
    /// Returns `false` without touching the log when in-flight mutations or a
    /// busy window keep it from a consistent snapshot within `LOCK_WAIT`; the
    /// compactor retries on its next pass.
    pub async fn compact_wal(&self) -> Result<bool, EngineError> {
        let Ok(_gate) = tokio::time::timeout(LOCK_WAIT, self.gate.write()).await else {
            metrics::counter!(observability::LOCK_CONTENTION_TOTAL).increment(1);
            warn!("compaction deferred: mutations still hold the gate");
            return Ok(false);
        };
        let windows: Vec<_> = self.state.iter().map(|e| (*e.key(), e.value().clone())).collect();
        let mut events = Vec::new();
        for (id, ws) in windows {
            let Ok(guard) = tokio::time::timeout(LOCK_WAIT, ws.read()).await else {
                metrics::counter!(observability::LOCK_CONTENTION_TOTAL).increment(1);
                warn!("compaction deferred: window {id} stayed locked");
                return Ok(false);
            };
            if guard.deleted {
                continue;
            }
            events.push(Event::WindowCreated {
                id: guard.id,
                name: guard.name.clone(),
                config: guard.config.clone(),
            });
            events.extend(guard.bookings.iter().map(|b| Event::BookingConfirmed {
                booking: b.clone(),
            }));
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        debug!("WAL compacted to {count} event(s)");
        Ok(true)
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
