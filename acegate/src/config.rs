//! Environment-based configuration with struct defaults.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;
use url::Url;

/// Engine used directly when no orchestrator is configured.
#[derive(Debug, Clone)]
pub struct FallbackUpstream {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Default for FallbackUpstream {
    fn default() -> Self {
        Self {
            scheme: "http".to_string(),
            host: "127.0.0.1".to_string(),
            port: 6878,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DebugConfig {
    pub enabled: bool,
    pub log_dir: PathBuf,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_dir: PathBuf::from("logs"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Bind address for the client-facing server.
    pub listen_addr: String,
    pub upstream: FallbackUpstream,
    /// Empty or absent disables orchestrator mode entirely.
    pub orchestrator_url: Option<Url>,
    pub orchestrator_api_key: Option<String>,
    pub max_streams_per_engine: u32,
    /// Max time between non-empty writes before the copy is declared dead.
    pub idle_timeout: Duration,
    pub buffer_size: usize,
    /// Bound on how long engine middleware may take to produce headers.
    pub no_response_timeout: Duration,
    pub debug: DebugConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8000".to_string(),
            upstream: FallbackUpstream::default(),
            orchestrator_url: None,
            orchestrator_api_key: None,
            max_streams_per_engine: 1,
            idle_timeout: Duration::from_secs(60),
            buffer_size: 4 * 1024 * 1024,
            no_response_timeout: Duration::from_secs(1),
            debug: DebugConfig::default(),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults. Unparseable values keep the default and are logged.
    ///
    /// Supported env vars:
    /// - `ACEGATE_LISTEN_ADDR` (e.g. "0.0.0.0:8000")
    /// - `ACEGATE_UPSTREAM_SCHEME`, `ACEGATE_UPSTREAM_HOST`, `ACEGATE_UPSTREAM_PORT`
    /// - `ACEGATE_ORCHESTRATOR_URL` (empty disables orchestrator mode)
    /// - `ACEGATE_ORCHESTRATOR_API_KEY`
    /// - `ACEGATE_MAX_STREAMS_PER_ENGINE`
    /// - `ACEGATE_IDLE_TIMEOUT_SECS`
    /// - `ACEGATE_BUFFER_SIZE_BYTES`
    /// - `ACEGATE_NO_RESPONSE_TIMEOUT_MS`
    /// - `ACEGATE_DEBUG`, `ACEGATE_DEBUG_LOG_DIR`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("ACEGATE_LISTEN_ADDR")
            && !addr.trim().is_empty()
        {
            config.listen_addr = addr;
        }
        if let Some(scheme) = lookup("ACEGATE_UPSTREAM_SCHEME")
            && !scheme.trim().is_empty()
        {
            config.upstream.scheme = scheme;
        }
        if let Some(host) = lookup("ACEGATE_UPSTREAM_HOST")
            && !host.trim().is_empty()
        {
            config.upstream.host = host;
        }
        if let Some(port) = lookup("ACEGATE_UPSTREAM_PORT") {
            match port.parse::<u16>() {
                Ok(parsed) => config.upstream.port = parsed,
                Err(_) => warn!(port = %port, "invalid ACEGATE_UPSTREAM_PORT; keeping default"),
            }
        }
        if let Some(raw) = lookup("ACEGATE_ORCHESTRATOR_URL")
            && !raw.trim().is_empty()
        {
            match Url::parse(&raw) {
                Ok(url) => config.orchestrator_url = Some(url),
                Err(e) => warn!(url = %raw, error = %e, "invalid ACEGATE_ORCHESTRATOR_URL; orchestrator mode disabled"),
            }
        }
        if let Some(key) = lookup("ACEGATE_ORCHESTRATOR_API_KEY")
            && !key.trim().is_empty()
        {
            config.orchestrator_api_key = Some(key);
        }
        if let Some(raw) = lookup("ACEGATE_MAX_STREAMS_PER_ENGINE") {
            match raw.parse::<u32>() {
                Ok(parsed) if parsed > 0 => config.max_streams_per_engine = parsed,
                _ => warn!(raw = %raw, "invalid ACEGATE_MAX_STREAMS_PER_ENGINE; keeping default"),
            }
        }
        if let Some(raw) = lookup("ACEGATE_IDLE_TIMEOUT_SECS") {
            match raw.parse::<u64>() {
                Ok(parsed) if parsed > 0 => config.idle_timeout = Duration::from_secs(parsed),
                _ => warn!(raw = %raw, "invalid ACEGATE_IDLE_TIMEOUT_SECS; keeping default"),
            }
        }
        if let Some(raw) = lookup("ACEGATE_BUFFER_SIZE_BYTES") {
            match raw.parse::<usize>() {
                Ok(parsed) if parsed > 0 => config.buffer_size = parsed,
                _ => warn!(raw = %raw, "invalid ACEGATE_BUFFER_SIZE_BYTES; keeping default"),
            }
        }
        if let Some(raw) = lookup("ACEGATE_NO_RESPONSE_TIMEOUT_MS") {
            match raw.parse::<u64>() {
                Ok(parsed) if parsed > 0 => {
                    config.no_response_timeout = Duration::from_millis(parsed)
                }
                _ => warn!(raw = %raw, "invalid ACEGATE_NO_RESPONSE_TIMEOUT_MS; keeping default"),
            }
        }
        if let Some(raw) = lookup("ACEGATE_DEBUG") {
            config.debug.enabled = matches!(raw.trim(), "1" | "true" | "yes");
        }
        if let Some(dir) = lookup("ACEGATE_DEBUG_LOG_DIR")
            && !dir.trim().is_empty()
        {
            config.debug.log_dir = PathBuf::from(dir);
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from<'a>(map: &'a HashMap<&'a str, &'a str>) -> impl Fn(&str) -> Option<String> + 'a {
        |key| map.get(key).map(|v| v.to_string())
    }

    #[test]
    fn defaults_match_design() {
        let config = ProxyConfig::default();
        assert_eq!(config.max_streams_per_engine, 1);
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.buffer_size, 4 * 1024 * 1024);
        assert_eq!(config.no_response_timeout, Duration::from_secs(1));
        assert!(config.orchestrator_url.is_none());
        assert!(!config.debug.enabled);
    }

    #[test]
    fn env_overrides_apply() {
        let mut map = HashMap::new();
        map.insert("ACEGATE_LISTEN_ADDR", "127.0.0.1:9000");
        map.insert("ACEGATE_ORCHESTRATOR_URL", "http://orch:7000");
        map.insert("ACEGATE_MAX_STREAMS_PER_ENGINE", "3");
        map.insert("ACEGATE_IDLE_TIMEOUT_SECS", "30");
        map.insert("ACEGATE_NO_RESPONSE_TIMEOUT_MS", "2500");
        map.insert("ACEGATE_DEBUG", "true");

        let config = ProxyConfig::from_lookup(lookup_from(&map));
        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert_eq!(
            config.orchestrator_url.unwrap().as_str(),
            "http://orch:7000/"
        );
        assert_eq!(config.max_streams_per_engine, 3);
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.no_response_timeout, Duration::from_millis(2500));
        assert!(config.debug.enabled);
    }

    #[test]
    fn empty_orchestrator_url_disables() {
        let mut map = HashMap::new();
        map.insert("ACEGATE_ORCHESTRATOR_URL", "  ");
        let config = ProxyConfig::from_lookup(lookup_from(&map));
        assert!(config.orchestrator_url.is_none());
    }

    #[test]
    fn invalid_values_keep_defaults() {
        let mut map = HashMap::new();
        map.insert("ACEGATE_UPSTREAM_PORT", "not-a-port");
        map.insert("ACEGATE_MAX_STREAMS_PER_ENGINE", "0");
        map.insert("ACEGATE_ORCHESTRATOR_URL", "::nonsense::");
        let config = ProxyConfig::from_lookup(lookup_from(&map));
        assert_eq!(config.upstream.port, 6878);
        assert_eq!(config.max_streams_per_engine, 1);
        assert!(config.orchestrator_url.is_none());
    }
}
