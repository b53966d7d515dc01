//! Configuration loading for bifrostd.
//!
//! Configuration is loaded from TOML files with the following resolution order:
//! 1. `--config <path>` (CLI flag)
//! 2. `~/.bifrost/config.toml` (user)
//! 3. `/etc/bifrost/config.toml` (system)
//!
//! ```toml
//! [server]
//! listen = "tcp://127.0.0.1:9001"
//! proto = "proto/greeter.proto"
//!
//! [server.tls]
//! cert = "certs/server.crt"
//! key = "certs/server.key"
//!
//! [workers]
//! command = ["php", "worker.php"]
//! num_workers = 4
//!
//! [env]
//! APP_ENV = "production"
//! ```

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{BifrostError, Result};

/// Bridge configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    /// Variables handed to every worker through the environment provider.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// gRPC server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address: `tcp://host:port`, `unix:///path/to.sock` or bare
    /// `host:port` (default: tcp://127.0.0.1:9001).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Protocol definition file declaring the proxied services.
    #[serde(default)]
    pub proto: PathBuf,
    /// Extra directories searched for `import`s of the protocol file.
    #[serde(default)]
    pub proto_includes: Vec<PathBuf>,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    /// Largest request message accepted, in bytes (tonic default when unset).
    #[serde(default)]
    pub max_recv_msg_size: Option<usize>,
    /// Largest response message sent, in bytes (tonic default when unset).
    #[serde(default)]
    pub max_send_msg_size: Option<usize>,
    /// Upper bound on one proxied call, in seconds (no bound when unset).
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_concurrent_streams: Option<u32>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            proto: PathBuf::new(),
            proto_includes: Vec::new(),
            tls: None,
            max_recv_msg_size: None,
            max_send_msg_size: None,
            request_timeout_secs: None,
            max_concurrent_streams: None,
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

fn default_listen() -> String {
    "tcp://127.0.0.1:9001".to_string()
}

/// TLS credentials (PEM files).
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
    /// CA bundle used to verify client certificates (mutual TLS).
    #[serde(default)]
    pub client_ca: Option<PathBuf>,
}

/// Worker pool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Program and arguments of one worker process.
    #[serde(default)]
    pub command: Vec<String>,
    /// Working directory of the workers.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Number of worker processes (default: available parallelism).
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Seconds a request may wait for a free worker (default: 60).
    #[serde(default = "default_allocate_timeout")]
    pub allocate_timeout_secs: u64,
    /// Crashes in a row, without one successful reply, after which a
    /// worker slot gives up and fails the pool (default: 10).
    #[serde(default = "default_max_crashes")]
    pub max_consecutive_crashes: u32,
    /// Largest frame read from a worker, in bytes (default: 64 MiB).
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: u32,
    /// Extra variables for the worker processes.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            dir: None,
            num_workers: default_num_workers(),
            allocate_timeout_secs: default_allocate_timeout(),
            max_consecutive_crashes: default_max_crashes(),
            max_frame_bytes: default_max_frame_bytes(),
            env: BTreeMap::new(),
        }
    }
}

impl WorkerConfig {
    pub fn allocate_timeout(&self) -> Duration {
        Duration::from_secs(self.allocate_timeout_secs)
    }

    /// Set one worker environment variable, replacing any previous value.
    pub fn set_env(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.env.insert(name.into(), value.into());
    }
}

fn default_num_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_allocate_timeout() -> u64 {
    60
}

fn default_max_crashes() -> u32 {
    10
}

fn default_max_frame_bytes() -> u32 {
    64 * 1024 * 1024
}

/// Control-plane service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    /// Serve `bifrost.control.v1.Control` next to the proxied services
    /// (default: true).
    #[serde(default = "default_control_enabled")]
    pub enabled: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: default_control_enabled(),
        }
    }
}

fn default_control_enabled() -> bool {
    true
}

/// Logging configuration. `RUST_LOG` takes precedence when set.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from the standard locations.
    ///
    /// Resolution order:
    /// 1. Explicit path (if provided)
    /// 2. `~/.bifrost/config.toml`
    /// 3. `/etc/bifrost/config.toml`
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_config_path(explicit_path)?;
        let content = fs::read_to_string(&path).map_err(|e| {
            BifrostError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        let mut config = Self::parse(&content).map_err(|e| match e {
            BifrostError::Configuration(msg) => {
                BifrostError::Configuration(format!("{msg} (in {path:?})"))
            }
            other => other,
        })?;
        config.resolve_relative_paths(path.parent().unwrap_or_else(|| Path::new(".")));
        Ok(config)
    }

    /// Parse and validate configuration text.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(|e| {
            BifrostError::Configuration(format!("Failed to parse config file: {e}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check the settings `serve` cannot do without.
    pub fn validate(&self) -> Result<()> {
        if self.server.proto.as_os_str().is_empty() {
            return Err(BifrostError::Configuration(
                "server.proto must name a protocol definition file".to_string(),
            ));
        }
        if self.workers.command.is_empty() {
            return Err(BifrostError::Configuration(
                "workers.command must not be empty".to_string(),
            ));
        }
        if self.workers.num_workers == 0 {
            return Err(BifrostError::Configuration(
                "workers.num_workers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Relative file paths are taken relative to the config file.
    fn resolve_relative_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() && !path.as_os_str().is_empty() {
                *path = base.join(&*path);
            }
        };
        resolve(&mut self.server.proto);
        self.server.proto_includes.iter_mut().for_each(resolve);
        if let Some(tls) = self.server.tls.as_mut() {
            resolve(&mut tls.cert);
            resolve(&mut tls.key);
            if let Some(ca) = tls.client_ca.as_mut() {
                resolve(ca);
            }
        }
    }

    /// Resolve the config file path.
    fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(path.to_path_buf());
            }
            return Err(BifrostError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        // User config
        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".bifrost").join("config.toml");
            if user_config.exists() {
                return Ok(user_config);
            }
        }

        // System config
        let system_config = PathBuf::from("/etc/bifrost/config.toml");
        if system_config.exists() {
            return Ok(system_config);
        }

        Err(BifrostError::Configuration(
            "No config file found. Create ~/.bifrost/config.toml or /etc/bifrost/config.toml"
                .to_string(),
        ))
    }
}
