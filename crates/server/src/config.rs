//! Server configuration.
//!
//! Everything comes from the command line with `SCRIBBLE_*` environment
//! fallbacks. The core only ever sees the plain [`ServerConfig`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "scribble", version, about = "Session server for collaborative drawing")]
pub struct Cli {
    /// Address for drawing clients
    #[arg(long, env = "SCRIBBLE_LISTEN", default_value = "0.0.0.0:27750")]
    pub listen: SocketAddr,

    /// Address for the admin HTTP API (disabled when unset)
    #[arg(long, env = "SCRIBBLE_ADMIN_LISTEN")]
    pub admin_listen: Option<SocketAddr>,

    /// Base directory for logs and the log database (default ~/.scribble)
    #[arg(long, env = "SCRIBBLE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Store sessions on disk in this directory
    #[arg(long, env = "SCRIBBLE_SESSION_DIR")]
    pub session_dir: Option<PathBuf>,

    /// Load session templates from this directory
    #[arg(long, env = "SCRIBBLE_TEMPLATE_DIR")]
    pub template_dir: Option<PathBuf>,

    /// Keep the server log in an SQLite database in the data directory
    #[arg(long, env = "SCRIBBLE_DB_LOG")]
    pub db_log: bool,

    /// Entries kept by the in-memory server log
    #[arg(long, env = "SCRIBBLE_LOG_LIMIT", default_value_t = 1000)]
    pub log_limit: usize,

    /// Delete database log entries older than this many days (0 keeps all)
    #[arg(long, env = "SCRIBBLE_LOG_PURGE_DAYS", default_value_t = 0)]
    pub log_purge_days: u32,

    /// Write diagnostics to a file in the data directory instead of stderr
    #[arg(long, env = "SCRIBBLE_LOG_FILE")]
    pub log_file: bool,

    #[arg(long, env = "SCRIBBLE_SESSION_LIMIT", default_value_t = 25)]
    pub session_limit: usize,

    /// Seconds without activity before a client is dropped
    #[arg(long, env = "SCRIBBLE_CLIENT_TIMEOUT", default_value_t = 180)]
    pub client_timeout: u64,

    /// Seconds without events before a session expires (0 disables)
    #[arg(long, env = "SCRIBBLE_IDLE_TIME_LIMIT", default_value_t = 0)]
    pub idle_time_limit: u64,

    /// Session history size limit in bytes (0 is unlimited)
    #[arg(long, env = "SCRIBBLE_HISTORY_LIMIT", default_value_t = 0)]
    pub history_limit: u64,

    /// History size in bytes at which a reset is requested (0 disables)
    #[arg(long, env = "SCRIBBLE_AUTORESET_THRESHOLD", default_value_t = 0)]
    pub autoreset_threshold: u64,

    /// Rename the files of ended sessions instead of deleting them
    #[arg(long, env = "SCRIBBLE_ARCHIVE")]
    pub archive: bool,

    #[arg(long, env = "SCRIBBLE_TLS_CERT", requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    #[arg(long, env = "SCRIBBLE_TLS_KEY", requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,

    /// Refuse to identify clients that have not started TLS
    #[arg(long, env = "SCRIBBLE_SECURE_ONLY")]
    pub secure_only: bool,

    /// Listing server sessions may be announced at (repeatable). Without
    /// any, every http(s) listing server is allowed.
    #[arg(
        long = "listing-server",
        env = "SCRIBBLE_LISTING_SERVERS",
        value_delimiter = ','
    )]
    pub listing_servers: Vec<String>,

    /// Host name given to listing servers (default: the listen address)
    #[arg(long, env = "SCRIBBLE_PUBLIC_HOST")]
    pub public_host: Option<String>,
}

impl Cli {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            session_count_limit: self.session_limit,
            client_timeout: Duration::from_secs(self.client_timeout),
            idle_time_limit: Duration::from_secs(self.idle_time_limit),
            history_limit: self.history_limit,
            autoreset_threshold: self.autoreset_threshold,
            archive_mode: self.archive,
            tls_available: self.tls_cert.is_some(),
            secure_only: self.secure_only,
            listing_servers: self.listing_servers.clone(),
            public_host: self.public_host.clone().unwrap_or_else(|| {
                let ip = self.listen.ip();
                if ip.is_unspecified() {
                    DEFAULT_PUBLIC_HOST.to_string()
                } else {
                    ip.to_string()
                }
            }),
            public_port: self.listen.port(),
        }
    }
}

const DEFAULT_PUBLIC_HOST: &str = "localhost";

/// Read-only settings consumed by the session server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub session_count_limit: usize,
    /// Zero disables the client idle timeout
    pub client_timeout: Duration,
    /// Zero disables session idle expiry
    pub idle_time_limit: Duration,
    pub history_limit: u64,
    pub autoreset_threshold: u64,
    pub archive_mode: bool,
    pub tls_available: bool,
    pub secure_only: bool,
    /// URL prefixes of allowed listing servers; empty allows any
    pub listing_servers: Vec<String>,
    pub public_host: String,
    pub public_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            session_count_limit: 25,
            client_timeout: Duration::from_secs(180),
            idle_time_limit: Duration::ZERO,
            history_limit: 0,
            autoreset_threshold: 0,
            archive_mode: false,
            tls_available: false,
            secure_only: false,
            listing_servers: Vec::new(),
            public_host: DEFAULT_PUBLIC_HOST.to_string(),
            public_port: 27750,
        }
    }
}
