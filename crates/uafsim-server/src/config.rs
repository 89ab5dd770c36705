//! Server configuration.
//!
//! Defaults bind the rehearsal server to loopback. Environment variables
//! override the defaults and command-line flags override both:
//! - `UAFSIM_HOST` (default `127.0.0.1`)
//! - `UAFSIM_PORT` (default `9000`)
//! - `UAFSIM_READ_BUFFER`: bytes per socket read, i.e. the largest frame (default `1024`)
//! - `UAFSIM_LOG_LEVEL`: `trace|debug|info|warn|error` (default `info`)
//!
//! Unparseable values fall back to the default rather than failing startup.

use crate::structured_log::LogLevel;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 9000;
pub const DEFAULT_READ_BUFFER: usize = 1024;
pub const SERVICE_NAME: &str = "uafsim";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Size of the per-connection read buffer. One read is one frame.
    pub read_buffer: usize,
    /// Service name used as the first segment of log trace ids.
    pub service: String,
    pub log_level: LogLevel,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            read_buffer: DEFAULT_READ_BUFFER,
            service: SERVICE_NAME.to_string(),
            log_level: LogLevel::Info,
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with `UAFSIM_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            host: lookup("UAFSIM_HOST")
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
                .unwrap_or(defaults.host),
            port: lookup("UAFSIM_PORT")
                .and_then(|p| p.trim().parse().ok())
                .unwrap_or(defaults.port),
            read_buffer: lookup("UAFSIM_READ_BUFFER")
                .and_then(|n| n.trim().parse().ok())
                .filter(|&n: &usize| n > 0)
                .unwrap_or(defaults.read_buffer),
            service: defaults.service,
            log_level: lookup("UAFSIM_LOG_LEVEL")
                .and_then(|l| LogLevel::from_str_loose(&l))
                .unwrap_or(defaults.log_level),
        }
    }

    /// `host:port` as given, for binding and display.
    #[must_use]
    pub fn bind_address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_bind_loopback_9000() {
        let cfg = ServerConfig::from_lookup(lookup_from(&[]));
        assert_eq!(cfg, ServerConfig::default());
        assert_eq!(cfg.bind_address(), "127.0.0.1:9000");
        assert_eq!(cfg.read_buffer, 1024);
    }

    #[test]
    fn env_overrides_apply() {
        let cfg = ServerConfig::from_lookup(lookup_from(&[
            ("UAFSIM_HOST", "0.0.0.0"),
            ("UAFSIM_PORT", "9100"),
            ("UAFSIM_READ_BUFFER", "4096"),
            ("UAFSIM_LOG_LEVEL", "WARN"),
        ]));
        assert_eq!(cfg.bind_address(), "0.0.0.0:9100");
        assert_eq!(cfg.read_buffer, 4096);
        assert_eq!(cfg.log_level, LogLevel::Warn);
    }

    #[test]
    fn invalid_values_fall_back() {
        let cfg = ServerConfig::from_lookup(lookup_from(&[
            ("UAFSIM_PORT", "ninety"),
            ("UAFSIM_READ_BUFFER", "0"),
            ("UAFSIM_LOG_LEVEL", "loud"),
            ("UAFSIM_HOST", "  "),
        ]));
        assert_eq!(cfg, ServerConfig::default());
    }

    #[test]
    fn ipv6_hosts_are_bracketed() {
        let cfg = ServerConfig {
            host: "::1".into(),
            ..ServerConfig::default()
        };
        assert_eq!(cfg.bind_address(), "[::1]:9000");
    }
}
