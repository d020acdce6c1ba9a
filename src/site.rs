use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::info;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;

/// Per-site engines. A site is the database name a client connects to; each
/// one has its own WAL file, engine and compactor.
pub struct SiteManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
}

/// Reduce a site name to a safe file stem.
fn file_stem(site: &str) -> io::Result<String> {
    if site.len() > MAX_SITE_NAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "site name too long"));
    }
    let stem: String = site
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if stem.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty site name"));
    }
    Ok(stem)
}

impl SiteManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
        }
    }

    /// Engine for `site`, replaying its WAL on first use.
    pub fn get_or_create(&self, site: &str) -> io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(site) {
            return Ok(engine.value().clone());
        }
        let stem = file_stem(site)?;
        if self.engines.len() >= MAX_SITES {
            return Err(io::Error::other("too many sites"));
        }

        let engine = match self.engines.entry(site.to_string()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{stem}.wal"));
                let engine = Arc::new(Engine::new(wal_path)?);
                slot.insert(engine.clone());
                engine
            }
        };

        tokio::spawn(compactor::run_compactor(engine.clone(), self.compact_threshold));
        metrics::gauge!(crate::observability::SITES_ACTIVE).set(self.engines.len() as f64);
        info!("site {site} loaded");
        Ok(engine)
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use chrono::NaiveDate;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("reslot_test_site").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn config() -> WindowConfig {
        WindowConfig {
            date_begin: NaiveDate::from_ymd_opt(2099, 5, 1).unwrap(),
            date_end: NaiveDate::from_ymd_opt(2099, 5, 3).unwrap(),
            time_first: parse_hhmm("10:00").unwrap(),
            time_last: parse_hhmm("12:00").unwrap(),
            time_unit: 30,
            max_limit: Some(1),
        }
    }

    fn request(window_id: Ulid) -> BookRequest {
        BookRequest {
            id: Ulid::new(),
            window_id,
            date: NaiveDate::from_ymd_opt(2099, 5, 1).unwrap(),
            time: parse_hhmm("10:00").unwrap(),
            subject_id: "unit-1".into(),
            contact_name: "Kim".into(),
            contact_phone: "010-0000-0000".into(),
            memo: None,
            line: None,
        }
    }

    #[tokio::test]
    async fn sites_are_isolated() {
        let sm = SiteManager::new(test_data_dir("isolation"), 1000);
        let a = sm.get_or_create("tower_a").unwrap();
        let b = sm.get_or_create("tower_b").unwrap();

        // Same window id in both sites.
        let w = Ulid::new();
        a.create_window(w, None, config()).await.unwrap();
        b.create_window(w, None, config()).await.unwrap();

        a.book(request(w)).await.unwrap();
        // Site B's slot is still empty.
        b.book(request(w)).await.unwrap();
        assert!(matches!(a.book(request(w)).await, Err(crate::engine::EngineError::SlotFull { .. })));
    }

    #[tokio::test]
    async fn lazy_creation_writes_wal_file() {
        let dir = test_data_dir("lazy");
        let sm = SiteManager::new(dir.clone(), 1000);
        assert!(fs::read_dir(&dir).unwrap().next().is_none());
        assert!(sm.is_empty());

        let _engine = sm.get_or_create("my_site").unwrap();
        assert!(dir.join("my_site.wal").exists());
        assert_eq!(sm.len(), 1);
    }

    #[tokio::test]
    async fn same_engine_returned() {
        let sm = SiteManager::new(test_data_dir("same_engine"), 1000);
        let one = sm.get_or_create("foo").unwrap();
        let two = sm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&one, &two));
    }

    #[tokio::test]
    async fn site_state_survives_reload() {
        let dir = test_data_dir("reload");
        let w = Ulid::new();
        {
            let sm = SiteManager::new(dir.clone(), 1000);
            let engine = sm.get_or_create("reload").unwrap();
            engine.create_window(w, Some("Lobby".into()), config()).await.unwrap();
        }
        let sm = SiteManager::new(dir, 1000);
        let engine = sm.get_or_create("reload").unwrap();
        assert_eq!(engine.window_info(w).await.unwrap().name.as_deref(), Some("Lobby"));
    }

    #[tokio::test]
    async fn site_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let sm = SiteManager::new(dir.clone(), 1000);
        sm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());
        assert!(sm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn site_name_too_long() {
        let sm = SiteManager::new(test_data_dir("name_too_long"), 1000);
        let err = sm
            .get_or_create(&"x".repeat(MAX_SITE_NAME_LEN + 1))
            .err()
            .unwrap();
        assert!(err.to_string().contains("site name too long"));
    }

    #[test]
    fn file_stem_strips_everything_unsafe() {
        assert_eq!(file_stem("tower-b_2").unwrap(), "tower-b_2");
        assert_eq!(file_stem("a/b\\c.d").unwrap(), "abcd");
        assert!(file_stem("...").is_err());
    }
}
