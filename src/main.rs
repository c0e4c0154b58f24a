//! tinyserve CLI
//!
//! Runs a standalone server with the default not-found handler plus whatever
//! realms, throttles and aliases the side files configure.
//!
//! # Usage
//!
//! ```bash
//! # Serve on port 8080
//! tinyserve
//!
//! # Custom port, persistent session cookies lasting 60 minutes
//! tinyserve --port 9000 --session-timeout -60
//!
//! # Protect paths with Basic auth and log every request
//! tinyserve --realms realms.toml --access-log --verbose
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tinyserve::{Server, ServerConfig};
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

/// tinyserve - embeddable HTTP server for servlet-style handlers
#[derive(Parser, Debug)]
#[command(name = "tinyserve")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Serve HTTP/1.0 and HTTP/1.1 requests", long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "8080", env = "TINYSERVE_PORT")]
    port: u16,

    /// Host address to bind to
    #[arg(long, default_value = "0.0.0.0", env = "TINYSERVE_HOST")]
    host: String,

    /// Listen backlog
    #[arg(long, default_value = "50")]
    backlog: u32,

    /// Connections served concurrently
    #[arg(long, default_value = "256")]
    max_connections: usize,

    /// Session timeout in minutes; negative makes session cookies persistent
    #[arg(short = 't', long, default_value = "30", allow_hyphen_values = true)]
    session_timeout: i64,

    /// Seconds between session expiry sweeps (default: the session timeout)
    #[arg(long)]
    sweep_interval: Option<u64>,

    /// Directory for the persisted session file
    #[arg(long)]
    session_dir: Option<PathBuf>,

    /// Do not save sessions on shutdown or restore them on startup
    #[arg(long)]
    no_persist: bool,

    /// CGI path prefix
    #[arg(short = 'c', long)]
    cgi_path: Option<String>,

    /// TOML file of throttle rules
    #[arg(long)]
    throttles: Option<PathBuf>,

    /// TOML file of path aliases
    #[arg(long)]
    aliases: Option<PathBuf>,

    /// TOML file of Basic auth realms
    #[arg(long)]
    realms: Option<PathBuf>,

    /// Socket read timeout in seconds, 0 for none
    #[arg(long, default_value = "30")]
    read_timeout: u64,

    /// Socket write timeout in seconds, 0 for none
    #[arg(long, default_value = "30")]
    write_timeout: u64,

    /// Seconds to wait for in-flight connections on shutdown
    #[arg(long, default_value = "5")]
    drain_timeout: u64,

    /// Log one line per request
    #[arg(long)]
    access_log: bool,

    /// Enable verbose logging
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

fn seconds(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

impl Args {
    fn into_config(self) -> ServerConfig {
        let mut config = ServerConfig::default()
            .with_host(self.host)
            .with_port(self.port)
            .with_backlog(self.backlog)
            .with_max_connections(self.max_connections)
            .with_session_timeout_minutes(self.session_timeout)
            .with_persist_sessions(!self.no_persist)
            .with_read_timeout(seconds(self.read_timeout))
            .with_write_timeout(seconds(self.write_timeout))
            .with_drain_timeout(Duration::from_secs(self.drain_timeout))
            .with_access_log(self.access_log);
        if let Some(interval) = self.sweep_interval {
            config = config.with_sweep_interval(Duration::from_secs(interval.max(1)));
        }
        if let Some(dir) = self.session_dir {
            config = config.with_session_dir(dir);
        }
        if let Some(path) = self.throttles {
            config = config.with_throttles_file(path);
        }
        if let Some(path) = self.aliases {
            config = config.with_aliases_file(path);
        }
        if let Some(path) = self.realms {
            config = config.with_realms_file(path);
        }
        config.cgi_path = self.cgi_path;
        config
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging; RUST_LOG overrides the flags
    let log_level = if args.verbose {
        Level::DEBUG
    } else if args.quiet {
        Level::WARN
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_ascii_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    let config = args.into_config();
    info!("{} v{}", tinyserve::NAME, tinyserve::VERSION);
    info!("  Listen: {}:{}", config.host, config.port);
    info!("  Session timeout: {} min", config.session_timeout_minutes);
    info!(
        "  Session persistence: {}",
        if config.persist_sessions { "enabled" } else { "disabled" }
    );

    let bound = match Server::new(config).bind().await {
        Ok(bound) => bound,
        Err(e) => {
            error!("Startup failed: {}", e);
            std::process::exit(1);
        }
    };

    match bound.run().await {
        Ok(()) => {
            info!("Server stopped");
        }
        Err(e) => {
            error!("Server error: {}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_session_timeout_parses() {
        let args = Args::try_parse_from(["tinyserve", "--session-timeout", "-60"]).unwrap();
        assert_eq!(args.session_timeout, -60);
        let config = args.into_config();
        assert!(config.session_config().persistent_cookie);
    }

    #[test]
    fn test_zero_timeouts_disable_deadlines() {
        let args =
            Args::try_parse_from(["tinyserve", "--read-timeout", "0", "-p", "9001"]).unwrap();
        let config = args.into_config();
        assert_eq!(config.read_timeout, None);
        assert_eq!(config.write_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.port, 9001);
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        assert!(Args::try_parse_from(["tinyserve", "-v", "-q"]).is_err());
    }
}
