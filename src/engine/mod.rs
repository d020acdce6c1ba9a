mod admission;
mod error;
mod mutations;
mod queries;

pub use error::EngineError;

use std::io;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard};
use tokio::time::Instant;
use tracing::warn;
use ulid::Ulid;

use crate::ledger::CapacityLedger;
use crate::limits::{LOCK_ATTEMPTS, LOCK_WAIT};
use crate::model::*;
use crate::wal::Wal;

pub type SharedWindowState = Arc<RwLock<WindowState>>;

/// Source of "today" for window expiry.
pub type Clock = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that arrive while a batch is being collected share
/// one fsync; every sender gets the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch: Vec<PendingAppend> = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    // Flush what we have before compaction or counters see the log.
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    // A failed batch is cut back out of the log, so replay never resurrects
    // events whose callers were told they failed.
    let result = wal.append_batch(batch.iter().map(|(event, _)| event));

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL batch of {} failed: {e}", batch.len());
    }

    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// The booking coordinator for one site: every window, its bookings and its
/// ledger, persisted through the WAL.
pub struct Engine {
    pub state: DashMap<Ulid, SharedWindowState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: booking id → window id.
    pub(super) booking_to_window: DashMap<Ulid, Ulid>,
    /// Mutations hold it shared across lock-persist-apply; compaction holds it
    /// exclusively so its snapshot and the log swap see no appends in between.
    /// Always taken before any window lock.
    pub(super) gate: RwLock<()>,
    pub(super) clock: Clock,
}

/// Apply a window-scoped event. Caller holds the window's write lock and has
/// already validated the event against the current state.
fn apply_to_window(
    ws: &mut WindowState,
    event: &Event,
    index: &DashMap<Ulid, Ulid>,
) -> Result<(), EngineError> {
    match event {
        Event::BookingConfirmed { booking } => {
            if booking.is_active() {
                ws.ledger.increment(booking.key());
            }
            index.insert(booking.id, booking.window_id);
            ws.insert_booking(booking.clone());
        }
        Event::BookingCancelled {
            id,
            reason,
            cancelled_at,
            ..
        } => {
            let pos = ws
                .booking_position(id)
                .ok_or(EngineError::BookingNotFound(*id))?;
            let booking = &mut ws.bookings[pos];
            if !booking.is_active() {
                return Err(EngineError::AlreadyCancelled(*id));
            }
            ws.ledger.decrement(&booking.key())?;
            booking.status = BookingStatus::Cancelled;
            booking.cancelled_at = Some(*cancelled_at);
            booking.cancel_reason = reason.clone();
        }
        Event::WindowUpdated { name, config, .. } => {
            ws.name = name.clone();
            ws.config = config.clone();
        }
        // Created/Deleted are handled at the DashMap level.
        Event::WindowCreated { .. } | Event::WindowDeleted { .. } => {}
    }
    Ok(())
}

/// Window targeted by a window-scoped event.
fn event_window_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::WindowUpdated { id, .. } => Some(*id),
        Event::BookingConfirmed { booking } => Some(booking.window_id),
        Event::BookingCancelled { window_id, .. } => Some(*window_id),
        Event::WindowCreated { .. } | Event::WindowDeleted { .. } => None,
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        Self::with_clock(wal_path, Arc::new(admission::today))
    }

    pub fn with_clock(wal_path: PathBuf, clock: Clock) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            booking_to_window: DashMap::new(),
            gate: RwLock::new(()),
            clock,
        };
        engine.replay(&events);
        Ok(engine)
    }

    /// We own every Arc during replay, so try_write never contends. Blocking
    /// lock calls are avoided because this can run inside an async context
    /// (lazy site creation).
    fn replay(&self, events: &[Event]) {
        for event in events {
            match event {
                Event::WindowCreated { id, name, config } => {
                    let ws = WindowState::new(*id, name.clone(), config.clone());
                    self.state.insert(*id, Arc::new(RwLock::new(ws)));
                }
                Event::WindowDeleted { id } => {
                    if let Some((_, ws)) = self.state.remove(id)
                        && let Ok(guard) = ws.try_read()
                    {
                        for b in &guard.bookings {
                            self.booking_to_window.remove(&b.id);
                        }
                    }
                }
                other => {
                    let Some(window_id) = event_window_id(other) else { continue };
                    let Some(ws) = self.get_window(&window_id) else {
                        warn!("replay: event for unknown window {window_id}, skipped");
                        continue;
                    };
                    let Ok(mut guard) = ws.try_write() else { continue };
                    if let Err(e) = apply_to_window(&mut guard, other, &self.booking_to_window) {
                        warn!("replay: event for window {window_id} skipped: {e}");
                    }
                }
            }
        }
        for entry in self.state.iter() {
            if let Ok(mut guard) = entry.value().try_write() {
                guard.ledger = CapacityLedger::from_bookings(&guard.bookings);
            }
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_window(&self, id: &Ulid) -> Option<SharedWindowState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_window_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_window.get(booking_id).map(|e| *e.value())
    }

    pub(super) fn today(&self) -> NaiveDate {
        (self.clock)()
    }

    /// WAL-append, then apply. Nothing touches memory unless the append succeeded.
    pub(super) async fn persist_and_apply(
        &self,
        ws: &mut WindowState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_window(ws, event, &self.booking_to_window).inspect_err(|e| {
            tracing::error!("event logged but not applied to window {}: {e}", ws.id);
        })
    }

    /// Shared hold on the compaction gate, waiting no later than `deadline`.
    pub(super) async fn enter_gate(
        &self,
        deadline: Instant,
        target: Ulid,
    ) -> Result<RwLockReadGuard<'_, ()>, EngineError> {
        tokio::time::timeout_at(deadline, self.gate.read())
            .await
            .map_err(|_| {
                metrics::counter!(crate::observability::LOCK_CONTENTION_TOTAL).increment(1);
                warn!("{target}: compaction gate wait timed out");
                EngineError::Contended(target)
            })
    }

    /// Exclusive access to a live window, gate included. Both waits share one
    /// budget of `LOCK_WAIT` x `LOCK_ATTEMPTS`; past it the caller gets the
    /// retriable `Contended`.
    pub(super) async fn lock_window(&self, window_id: Ulid) -> Result<WindowGuard<'_>, EngineError> {
        let ws = self
            .get_window(&window_id)
            .ok_or(EngineError::WindowNotFound(window_id))?;
        let deadline = lock_deadline();
        let gate = self.enter_gate(deadline, window_id).await?;
        for attempt in 1..=LOCK_ATTEMPTS {
            let wait = LOCK_WAIT.min(deadline.saturating_duration_since(Instant::now()));
            match tokio::time::timeout(wait, ws.clone().write_owned()).await {
                Ok(window) if window.deleted => return Err(EngineError::WindowNotFound(window_id)),
                Ok(window) => return Ok(WindowGuard { window, _gate: gate }),
                Err(_) => {
                    metrics::counter!(crate::observability::LOCK_CONTENTION_TOTAL).increment(1);
                    warn!("window {window_id}: lock wait timed out (attempt {attempt}/{LOCK_ATTEMPTS})");
                }
            }
        }
        Err(EngineError::Contended(window_id))
    }
}

pub(super) fn lock_deadline() -> Instant {
    Instant::now() + LOCK_WAIT * LOCK_ATTEMPTS
}

/// A mutation's hold on one window. The window lock is released before the
/// gate.
pub(super) struct WindowGuard<'a> {
    window: OwnedRwLockWriteGuard<WindowState>,
    _gate: RwLockReadGuard<'a, ()>,
}

impl Deref for WindowGuard<'_> {
    type Target = WindowState;

    fn deref(&self) -> &WindowState {
        &self.window
    }
}

impl DerefMut for WindowGuard<'_> {
    fn deref_mut(&mut self) -> &mut WindowState {
        &mut self.window
    }
}
