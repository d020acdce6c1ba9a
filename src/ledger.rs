use std::collections::HashMap;

use crate::engine::EngineError;
use crate::model::*;

/// Active-booking count per slot.
///
/// A plain counter: it does not know about capacity policy. The engine holds
/// the owning window's write lock across "check availability, then
/// increment", which is what makes admission atomic. Zero counts are removed
/// so the map only holds occupied slots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapacityLedger {
    counts: HashMap<SlotKey, u32>,
}

impl CapacityLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a booking list, counting only active bookings.
    pub fn from_bookings<'a>(bookings: impl IntoIterator<Item = &'a Booking>) -> Self {
        let mut ledger = Self::new();
        for b in bookings.into_iter().filter(|b| b.is_active()) {
            ledger.increment(b.key());
        }
        ledger
    }

    pub fn occupied(&self, key: &SlotKey) -> u32 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    /// `max_limit - occupied`, clamped at zero, or unbounded without a limit.
    pub fn available(&self, max_limit: Option<u32>, key: &SlotKey) -> Availability {
        match max_limit {
            Some(limit) => Availability::Limited(limit.saturating_sub(self.occupied(key))),
            None => Availability::Unbounded,
        }
    }

    /// Returns the new count.
    pub fn increment(&mut self, key: SlotKey) -> u32 {
        let count = self.counts.entry(key).or_insert(0);
        *count += 1;
        *count
    }

    /// Returns the new count. Decrementing an empty slot means a cancel was
    /// applied without a matching admission and is reported, never clamped.
    pub fn decrement(&mut self, key: &SlotKey) -> Result<u32, EngineError> {
        let Some(count) = self.counts.get_mut(key) else {
            return Err(EngineError::LedgerUnderflow(*key));
        };
        *count -= 1;
        let remaining = *count;
        if remaining == 0 {
            self.counts.remove(key);
        }
        Ok(remaining)
    }

    /// Highest occupancy of any slot.
    pub fn peak(&self) -> u32 {
        self.counts.values().copied().max().unwrap_or(0)
    }

    /// Occupied slots, sorted.
    pub fn occupied_keys(&self) -> Vec<SlotKey> {
        let mut keys: Vec<SlotKey> = self.counts.keys().copied().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ulid::Ulid;

    fn key(window_id: Ulid, time: &str) -> SlotKey {
        SlotKey::new(
            window_id,
            Slot::new(NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(), parse_hhmm(time).unwrap()),
        )
    }

    #[test]
    fn counts_start_at_zero() {
        let ledger = CapacityLedger::new();
        let k = key(Ulid::new(), "10:00");
        assert_eq!(ledger.occupied(&k), 0);
        assert_eq!(ledger.available(Some(2), &k), Availability::Limited(2));
        assert_eq!(ledger.available(None, &k), Availability::Unbounded);
    }

    #[test]
    fn increment_and_decrement() {
        let mut ledger = CapacityLedger::new();
        let w = Ulid::new();
        let k = key(w, "10:00");
        assert_eq!(ledger.increment(k), 1);
        assert_eq!(ledger.increment(k), 2);
        assert_eq!(ledger.available(Some(2), &k), Availability::Limited(0));
        assert_eq!(ledger.decrement(&k).unwrap(), 1);
        assert_eq!(ledger.available(Some(2), &k), Availability::Limited(1));
        assert_eq!(ledger.decrement(&k).unwrap(), 0);
        assert!(ledger.occupied_keys().is_empty());
    }

    #[test]
    fn decrement_below_zero_fails() {
        let mut ledger = CapacityLedger::new();
        let k = key(Ulid::new(), "10:00");
        assert!(matches!(ledger.decrement(&k), Err(EngineError::LedgerUnderflow(_))));
        ledger.increment(k);
        ledger.decrement(&k).unwrap();
        assert!(matches!(ledger.decrement(&k), Err(EngineError::LedgerUnderflow(_))));
        assert_eq!(ledger.occupied(&k), 0);
    }

    #[test]
    fn available_clamps_when_over_limit() {
        // Lowering a limit below occupancy is blocked at the engine level;
        // the ledger itself still never reports a negative remainder.
        let mut ledger = CapacityLedger::new();
        let k = key(Ulid::new(), "10:00");
        for _ in 0..3 {
            ledger.increment(k);
        }
        assert_eq!(ledger.available(Some(1), &k), Availability::Limited(0));
    }

    #[test]
    fn keys_are_per_window_and_slot() {
        let mut ledger = CapacityLedger::new();
        let w1 = Ulid::new();
        let w2 = Ulid::new();
        ledger.increment(key(w1, "10:00"));
        ledger.increment(key(w1, "10:30"));
        ledger.increment(key(w2, "10:00"));
        ledger.increment(key(w2, "10:00"));
        assert_eq!(ledger.occupied(&key(w1, "10:00")), 1);
        assert_eq!(ledger.occupied(&key(w2, "10:00")), 2);
        assert_eq!(ledger.peak(), 2);
        assert_eq!(ledger.occupied_keys().len(), 3);
    }

    #[test]
    fn rebuild_ignores_cancelled() {
        let w = Ulid::new();
        let mk = |status| Booking {
            id: Ulid::new(),
            window_id: w,
            slot_date: NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(),
            slot_time: parse_hhmm("10:00").unwrap(),
            subject_id: "s".into(),
            contact_name: "n".into(),
            contact_phone: "p".into(),
            memo: None,
            line: None,
            status,
            created_at: 0,
            cancelled_at: None,
            cancel_reason: None,
        };
        let bookings = vec![
            mk(BookingStatus::Active),
            mk(BookingStatus::Cancelled),
            mk(BookingStatus::Active),
        ];
        let ledger = CapacityLedger::from_bookings(&bookings);
        assert_eq!(ledger.occupied(&key(w, "10:00")), 2);
    }
}
