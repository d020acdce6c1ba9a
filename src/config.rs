use std::path::PathBuf;
use std::str::FromStr;

/// Server settings, read once from `RESLOT_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends since the last compaction before the compactor rewrites the log.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "reslot".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unparseable numbers fall back to their defaults.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            port: parsed(&var, "RESLOT_PORT").unwrap_or(d.port),
            bind: var("RESLOT_BIND").unwrap_or(d.bind),
            data_dir: var("RESLOT_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: var("RESLOT_PASSWORD").unwrap_or(d.password),
            max_connections: parsed(&var, "RESLOT_MAX_CONNECTIONS").unwrap_or(d.max_connections),
            compact_threshold: parsed(&var, "RESLOT_COMPACT_THRESHOLD").unwrap_or(d.compact_threshold),
            metrics_port: parsed(&var, "RESLOT_METRICS_PORT"),
            tls_cert: var("RESLOT_TLS_CERT"),
            tls_key: var("RESLOT_TLS_KEY"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    var(key).and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = Config::from_lookup(lookup(&[]));
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.listen_addr(), "0.0.0.0:5433");
    }

    #[test]
    fn overrides_from_env() {
        let cfg = Config::from_lookup(lookup(&[
            ("RESLOT_PORT", "6000"),
            ("RESLOT_BIND", "127.0.0.1"),
            ("RESLOT_DATA_DIR", "/var/lib/reslot"),
            ("RESLOT_COMPACT_THRESHOLD", "50"),
            ("RESLOT_METRICS_PORT", "9100"),
        ]));
        assert_eq!(cfg.listen_addr(), "127.0.0.1:6000");
        assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/reslot"));
        assert_eq!(cfg.compact_threshold, 50);
        assert_eq!(cfg.metrics_port, Some(9100));
    }

    #[test]
    fn bad_numbers_fall_back() {
        let cfg = Config::from_lookup(lookup(&[
            ("RESLOT_PORT", "not-a-port"),
            ("RESLOT_MAX_CONNECTIONS", "-4"),
            ("RESLOT_METRICS_PORT", "99999"),
        ]));
        assert_eq!(cfg.port, 5433);
        assert_eq!(cfg.max_connections, 256);
        assert_eq!(cfg.metrics_port, None);
    }
}
