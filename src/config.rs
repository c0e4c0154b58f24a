//! Server configuration
//!
//! [`ServerConfig`] carries everything the listener reads at startup. The
//! realm, throttle and alias side files are TOML documents loaded by their
//! own modules through [`read_toml`].

use crate::error::{RuntimeError, RuntimeResult};
use crate::session::{MIN_SWEEP_INTERVAL, SessionConfig};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host address to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Listen backlog
    pub backlog: u32,
    /// Connections served concurrently; further accepts wait
    pub max_connections: usize,
    /// Session inactivity timeout in minutes. Negative values make the
    /// session cookie persistent and stop the server from reaping idle sessions.
    pub session_timeout_minutes: i64,
    /// Interval between expiry sweeps (default: the session timeout)
    pub sweep_interval: Option<Duration>,
    /// Save sessions on shutdown and restore them on startup
    pub persist_sessions: bool,
    /// Directory holding the persisted session file
    pub session_dir: PathBuf,
    /// CGI directory prefix; CGI execution lives outside this server
    pub cgi_path: Option<String>,
    /// TOML file of `[[throttle]]` rules
    pub throttles_file: Option<PathBuf>,
    /// TOML file with an `[aliases]` table
    pub aliases_file: Option<PathBuf>,
    /// TOML file of `[[realm]]` definitions
    pub realms_file: Option<PathBuf>,
    /// Deadline for each socket read
    pub read_timeout: Option<Duration>,
    /// Deadline for each socket write
    pub write_timeout: Option<Duration>,
    /// How long shutdown waits for in-flight connections
    pub drain_timeout: Duration,
    /// Log one line per request at INFO
    pub access_log: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            backlog: 50,
            max_connections: 256,
            session_timeout_minutes: 30,
            sweep_interval: None,
            persist_sessions: true,
            session_dir: std::env::temp_dir(),
            cgi_path: None,
            throttles_file: None,
            aliases_file: None,
            realms_file: None,
            read_timeout: Some(Duration::from_secs(30)),
            write_timeout: Some(Duration::from_secs(30)),
            drain_timeout: Duration::from_secs(5),
            access_log: false,
        }
    }
}

impl ServerConfig {
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    pub fn with_session_timeout_minutes(mut self, minutes: i64) -> Self {
        self.session_timeout_minutes = minutes;
        self
    }

    /// Raised to [`MIN_SWEEP_INTERVAL`] if shorter
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval.max(MIN_SWEEP_INTERVAL));
        self
    }

    pub fn with_session_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.session_dir = dir.into();
        self
    }

    pub fn with_persist_sessions(mut self, persist: bool) -> Self {
        self.persist_sessions = persist;
        self
    }

    pub fn with_realms_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.realms_file = Some(path.into());
        self
    }

    pub fn with_throttles_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.throttles_file = Some(path.into());
        self
    }

    pub fn with_aliases_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.aliases_file = Some(path.into());
        self
    }

    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_access_log(mut self, enabled: bool) -> Self {
        self.access_log = enabled;
        self
    }

    /// Session settings derived from the timeout
    pub fn session_config(&self) -> SessionConfig {
        let mut config = SessionConfig::from_minutes(self.session_timeout_minutes);
        if let Some(interval) = self.sweep_interval {
            config.sweep_interval = interval.max(MIN_SWEEP_INTERVAL);
        }
        config
    }

    /// Persisted session file, named after host and port
    pub fn session_file(&self) -> PathBuf {
        let host: String = self
            .host
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.session_dir
            .join(format!("tinyserve-sessions-{}-{}.json", host, self.port))
    }
}

/// Read and deserialize a TOML file
pub fn read_toml<T: DeserializeOwned>(path: &Path) -> RuntimeResult<T> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        RuntimeError::config(format!("cannot read {}: {}", path.display(), e))
    })?;
    toml::from_str(&text)
        .map_err(|e| RuntimeError::config(format!("cannot parse {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert_eq!(config.session_timeout_minutes, 30);
        assert!(config.persist_sessions);
    }

    #[test]
    fn test_server_config_builder() {
        let config = ServerConfig::default()
            .with_port(9090)
            .with_host("127.0.0.1")
            .with_max_connections(0)
            .with_access_log(true);

        assert_eq!(config.port, 9090);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.max_connections, 1);
        assert!(config.access_log);
    }

    #[test]
    fn test_session_file_named_from_host_and_port() {
        let config = ServerConfig::default()
            .with_host("127.0.0.1")
            .with_port(9090)
            .with_session_dir("/var/lib/tinyserve");
        assert_eq!(
            config.session_file(),
            PathBuf::from("/var/lib/tinyserve/tinyserve-sessions-127_0_0_1-9090.json")
        );
    }

    #[test]
    fn test_sweep_interval_override() {
        let config = ServerConfig::default().with_sweep_interval(Duration::from_secs(2));
        assert_eq!(config.session_config().sweep_interval, Duration::from_secs(2));
    }

    #[test]
    fn test_zero_sweep_interval_is_raised() {
        let config = ServerConfig::default().with_sweep_interval(Duration::ZERO);
        assert_eq!(config.sweep_interval, Some(MIN_SWEEP_INTERVAL));
        assert_eq!(config.session_config().sweep_interval, MIN_SWEEP_INTERVAL);

        let mut config = ServerConfig::default();
        config.sweep_interval = Some(Duration::ZERO);
        assert_eq!(config.session_config().sweep_interval, MIN_SWEEP_INTERVAL);
    }

    #[test]
    fn test_negative_timeout_disables_reaping() {
        let config = ServerConfig::default().with_session_timeout_minutes(-10);
        let sessions = config.session_config();
        assert!(!sessions.reap);
        assert!(sessions.persistent_cookie);
        assert!(ServerConfig::default().session_config().reap);
    }

    #[test]
    fn test_read_toml_reports_path() {
        let err = read_toml::<toml::Value>(Path::new("/nonexistent/realms.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/realms.toml"));
    }
}
