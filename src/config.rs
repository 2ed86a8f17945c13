use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Process-level settings read from the environment at start-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub log_filter: String,
    pub log_format: LogFormat,
    pub workspace: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let log_filter = non_empty("SCHOOLD_LOG")
            .or_else(|| non_empty("RUST_LOG"))
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
        let log_format = match non_empty("SCHOOLD_LOG_FORMAT").as_deref() {
            Some(f) if f.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };
        Self {
            log_filter,
            log_format,
            workspace: non_empty("SCHOOLD_WORKSPACE").map(PathBuf::from),
        }
    }
}

/// Logs go to stderr; stdout carries the protocol.
pub fn init_logging(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_filter)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    let _ = match config.log_format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
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
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let cfg = Config::from_lookup(lookup(&[]));
        assert_eq!(cfg.log_filter, "info");
        assert_eq!(cfg.log_format, LogFormat::Text);
        assert_eq!(cfg.workspace, None);
    }

    #[test]
    fn schoold_log_wins_over_rust_log() {
        let cfg = Config::from_lookup(lookup(&[
            ("RUST_LOG", "warn"),
            ("SCHOOLD_LOG", "schoold=debug"),
            ("SCHOOLD_LOG_FORMAT", "JSON"),
            ("SCHOOLD_WORKSPACE", "/tmp/school"),
        ]));
        assert_eq!(cfg.log_filter, "schoold=debug");
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(cfg.workspace, Some(PathBuf::from("/tmp/school")));

        let cfg = Config::from_lookup(lookup(&[("RUST_LOG", "warn"), ("SCHOOLD_LOG", " ")]));
        assert_eq!(cfg.log_filter, "warn");
    }
}
