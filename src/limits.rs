//! Hard limits on inputs. Anything above these is rejected with
//! `EngineError::LimitExceeded` before touching engine state.

use std::time::Duration;

pub const MAX_WINDOWS_PER_SITE: usize = 10_000;
pub const MAX_BOOKINGS_PER_WINDOW: usize = 100_000;
/// Longest date range a single window may cover.
pub const MAX_WINDOW_DAYS: i64 = 366;
/// Widest date range a single availability query may cover.
pub const MAX_QUERY_DAYS: i64 = 92;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_SUBJECT_ID_LEN: usize = 128;
pub const MAX_CONTACT_NAME_LEN: usize = 128;
pub const MAX_CONTACT_PHONE_LEN: usize = 32;
pub const MAX_MEMO_LEN: usize = 2_000;
pub const MAX_REASON_LEN: usize = 512;

pub const MAX_SITES: usize = 1_000;
pub const MAX_SITE_NAME_LEN: usize = 256;

/// How long a mutation waits for a window's write lock per attempt.
pub const LOCK_WAIT: Duration = Duration::from_millis(500);
/// Lock attempts before a mutation gives up with a retriable conflict.
pub const LOCK_ATTEMPTS: u32 = 3;
