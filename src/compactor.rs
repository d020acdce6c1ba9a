use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites a site's WAL once enough appends have piled
/// up since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}

/// One compactor pass. Returns whether a compaction ran and succeeded; a pass
/// deferred by contention is simply retried on the next tick.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        debug!("compactor: {appends} append(s) since last compaction, below {threshold}");
        return false;
    }
    match engine.compact_wal().await {
        Ok(true) => {
            info!("compacted WAL after {appends} append(s)");
            true
        }
        Ok(false) => {
            debug!("compactor: site busy, retrying next pass");
            false
        }
        Err(e) => {
            error!("WAL compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use chrono::NaiveDate;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("reslot_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn config() -> WindowConfig {
        WindowConfig {
            date_begin: NaiveDate::from_ymd_opt(2099, 3, 1).unwrap(),
            date_end: NaiveDate::from_ymd_opt(2099, 3, 2).unwrap(),
            time_first: parse_hhmm("09:00").unwrap(),
            time_last: parse_hhmm("12:00").unwrap(),
            time_unit: 60,
            max_limit: None,
        }
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Arc::new(Engine::new(path.clone()).unwrap());

        for _ in 0..3 {
            let id = Ulid::new();
            engine.create_window(id, None, config()).await.unwrap();
            engine.delete_window(id).await.unwrap();
        }
        let kept = Ulid::new();
        engine.create_window(kept, Some("Spring".into()), config()).await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 7);

        assert!(!compact_if_due(&engine, 10).await);
        assert_eq!(engine.wal_appends_since_compact().await, 7);

        assert!(compact_if_due(&engine, 5).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        let replayed = crate::wal::Wal::replay(&path).unwrap();
        assert_eq!(
            replayed,
            vec![Event::WindowCreated {
                id: kept,
                name: Some("Spring".into()),
                config: config(),
            }]
        );
    }
}
