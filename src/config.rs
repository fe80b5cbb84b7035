//! Configuration for the agency board, read from `.agency/agency.toml`.
//!
//! Settings are layered: file → environment → CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3141
//! dev_mode = false
//!
//! [database]
//! path = ".agency/agency.db"
//! busy_timeout_ms = 5000
//!
//! [slugs]
//! max_attempts = 50
//! backoff_base_ms = 2
//! backoff_jitter_ms = 5
//!
//! [logging]
//! level = "info"
//! json = false
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::board::allocator::RetryPolicy;
use crate::board::server::ServerConfig;

pub const AGENCY_DIR: &str = ".agency";
pub const CONFIG_FILE: &str = "agency.toml";

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Enables permissive CORS for a separately served frontend.
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3141
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSection {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    /// How long a connection waits on a locked database before failing.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(AGENCY_DIR).join("agency.db")
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// Retry budget for slug allocation under contention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlugsSection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_jitter_ms")]
    pub backoff_jitter_ms: u64,
}

fn default_max_attempts() -> u32 {
    50
}

fn default_backoff_base_ms() -> u64 {
    2
}

fn default_backoff_jitter_ms() -> u64 {
    5
}

impl Default for SlugsSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_jitter_ms: default_backoff_jitter_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSection {
    /// `EnvFilter` directive, e.g. `info` or `agency=debug,tower_http=warn`.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// The `agency.toml` file contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgencyToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub slugs: SlugsSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl AgencyToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse agency.toml")
    }

    /// Load `agency.toml` from `agency_dir`, or defaults if it doesn't exist.
    pub fn load_or_default(agency_dir: &Path) -> Result<Self> {
        let config_path = agency_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize agency.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.port == 0 {
            warnings.push("server.port is 0: the OS will pick a random port".to_string());
        }
        if self.database.path.as_os_str().is_empty() {
            warnings.push("database.path is empty".to_string());
        }
        if self.database.busy_timeout_ms == 0 {
            warnings.push(
                "database.busy_timeout_ms is 0: concurrent writers will fail immediately on lock"
                    .to_string(),
            );
        }
        if self.slugs.max_attempts == 0 {
            warnings.push("slugs.max_attempts is 0: treated as a single attempt".to_string());
        }
        if self.slugs.backoff_base_ms > 1000 {
            warnings.push(format!(
                "slugs.backoff_base_ms = {} is unusually high; allocations may stall",
                self.slugs.backoff_base_ms
            ));
        }
        if tracing_subscriber::EnvFilter::try_new(&self.logging.level).is_err() {
            warnings.push(format!(
                "Invalid logging.level '{}': expected an EnvFilter directive such as 'info'",
                self.logging.level
            ));
        }

        warnings
    }

    pub fn slug_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.slugs.max_attempts,
            backoff_base: Duration::from_millis(self.slugs.backoff_base_ms),
            backoff_jitter: Duration::from_millis(self.slugs.backoff_jitter_ms),
        }
    }
}

/// Command-line overrides, applied last.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub db_path: Option<PathBuf>,
    pub dev_mode: bool,
    pub log_level: Option<String>,
    pub log_json: bool,
}

/// Effective configuration after layering file, environment and CLI.
#[derive(Debug, Clone)]
pub struct AgencyConfig {
    /// Where `agency.toml` was (or would be) read from.
    pub config_path: PathBuf,
    pub toml: AgencyToml,
}

impl AgencyConfig {
    /// Load from an explicit file, or from `.agency/agency.toml` under the
    /// current directory when it exists. An explicit path must exist.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Ok(Self {
                config_path: path.to_path_buf(),
                toml: AgencyToml::load(path)?,
            }),
            None => {
                let agency_dir = PathBuf::from(AGENCY_DIR);
                Ok(Self {
                    config_path: agency_dir.join(CONFIG_FILE),
                    toml: AgencyToml::load_or_default(&agency_dir)?,
                })
            }
        }
    }

    /// Default settings that will be written to `config_path` by `init`.
    pub fn defaults_at(config_path: PathBuf) -> Self {
        Self {
            config_path,
            toml: AgencyToml::default(),
        }
    }

    /// Apply `AGENCY_PORT` and `AGENCY_DB_PATH` from the process environment.
    pub fn with_env(self) -> Result<Self> {
        self.with_env_from(|name| std::env::var(name).ok())
    }

    /// Apply environment overrides using `lookup` to read variables.
    pub fn with_env_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(port) = lookup("AGENCY_PORT") {
            self.toml.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid AGENCY_PORT '{}'", port))?;
        }
        if let Some(path) = lookup("AGENCY_DB_PATH")
            && !path.trim().is_empty()
        {
            self.toml.database.path = PathBuf::from(path.trim());
        }
        Ok(self)
    }

    pub fn with_cli(mut self, cli: CliOverrides) -> Self {
        if let Some(host) = cli.host {
            self.toml.server.host = host;
        }
        if let Some(port) = cli.port {
            self.toml.server.port = port;
        }
        if let Some(path) = cli.db_path {
            self.toml.database.path = path;
        }
        if cli.dev_mode {
            self.toml.server.dev_mode = true;
        }
        if let Some(level) = cli.log_level {
            self.toml.logging.level = level;
        }
        if cli.log_json {
            self.toml.logging.json = true;
        }
        self
    }

    pub fn db_path(&self) -> &Path {
        &self.toml.database.path
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.toml.database.busy_timeout_ms)
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.toml.server.host.clone(),
            port: self.toml.server.port,
            db_path: self.toml.database.path.clone(),
            busy_timeout: self.busy_timeout(),
            slug_policy: self.toml.slug_policy(),
            dev_mode: self.toml.server.dev_mode,
        }
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
