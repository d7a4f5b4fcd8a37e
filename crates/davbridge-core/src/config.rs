//! Configuration module for davbridge.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Name of the per-application directory under the platform data/config dirs.
pub const APP_DIR: &str = "davbridge";

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for davbridge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub admin: AdminConfig,
    pub session: SessionConfig,
    pub store: StoreConfig,
    pub network: NetworkConfig,
    pub backend: BackendConfig,
    pub logging: LoggingConfig,
}

/// File-server listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the file server listens on.
    pub listen: String,
    /// Seconds in-flight requests may take to drain on stop.
    pub grace_period_secs: u64,
}

/// Control API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Address the control API listens on.
    pub listen: String,
    /// Lifetime of an admin session, in hours.
    pub session_ttl_hours: u64,
    /// Seconds between sweeps of expired admin sessions.
    pub sweep_interval_secs: u64,
}

/// What to do when the automatic re-login after token expiry fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoLoginFailurePolicy {
    /// Log the failure and wait for a login through the control API.
    #[default]
    Wait,
    /// Surface the failure to the supervisor, which terminates the process.
    Exit,
}

/// Drive session settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub auto_login_failure: AutoLoginFailurePolicy,
}

/// Where session tokens are persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStorage {
    /// JSON file under the data directory.
    #[default]
    File,
    /// System keyring (Secret Service, Keychain, ...).
    Keyring,
}

/// Persistence settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub tokens: TokenStorage,
    /// Override for the data directory. `None` uses the platform default.
    pub data_dir: Option<PathBuf>,
}

/// Network reachability settings used before the file server starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// URL probed until it answers. `None` treats the network as always reachable.
    pub probe_url: Option<String>,
    /// Per-attempt timeout, in seconds.
    pub probe_timeout_secs: u64,
    /// First retry delay, in milliseconds.
    pub retry_initial_ms: u64,
    /// Upper bound for the retry delay, in seconds.
    pub retry_max_secs: u64,
}

/// Settings for the local development backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Directory exposed as the drive root.
    pub root: PathBuf,
    /// Account name accepted by the backend.
    pub username: String,
    /// Password accepted by the backend. Empty disables login.
    pub password: String,
    /// Second factor code required at login, if any.
    pub two_factor: Option<String>,
    /// Lifetime of an issued access token, in seconds.
    pub token_lifetime_secs: u64,
    /// Number of renewals before the backend expires the session. `None` renews forever.
    pub max_renewals: Option<u32>,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/davbridge/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join(APP_DIR)
            .join("config.yaml")
    }

    /// Directory holding persisted tokens and the admin credential.
    ///
    /// Returns `None` when neither an override is configured nor a platform
    /// data directory can be determined.
    pub fn data_dir(&self) -> Option<PathBuf> {
        self.store
            .data_dir
            .clone()
            .or_else(|| dirs::data_dir().map(|d| d.join(APP_DIR)))
    }
}

impl ServerConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

impl AdminConfig {
    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.session_ttl_hours as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl NetworkConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn retry_initial(&self) -> Duration {
        Duration::from_millis(self.retry_initial_ms)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_secs(self.retry_max_secs)
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7984".to_string(),
            grace_period_secs: 5,
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7985".to_string(),
            session_ttl_hours: 24,
            sweep_interval_secs: 600,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            probe_url: None,
            probe_timeout_secs: 5,
            retry_initial_ms: 500,
            retry_max_secs: 30,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            root: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("~"))
                .join("Drive"),
            username: String::new(),
            password: String::new(),
            two_factor: None,
            token_lifetime_secs: 3600,
            max_renewals: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"server.listen"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- server ---
        if self.server.listen.parse::<std::net::SocketAddr>().is_err() {
            errors.push(ValidationError {
                field: "server.listen".into(),
                message: format!("not a socket address: {}", self.server.listen),
            });
        }
        if self.server.grace_period_secs == 0 {
            errors.push(ValidationError {
                field: "server.grace_period_secs".into(),
                message: "must be greater than 0".into(),
            });
        }

        // --- admin ---
        if self.admin.listen.parse::<std::net::SocketAddr>().is_err() {
            errors.push(ValidationError {
                field: "admin.listen".into(),
                message: format!("not a socket address: {}", self.admin.listen),
            });
        }
        if self.admin.listen == self.server.listen {
            errors.push(ValidationError {
                field: "admin.listen".into(),
                message: "must differ from server.listen".into(),
            });
        }
        if self.admin.session_ttl_hours == 0 {
            errors.push(ValidationError {
                field: "admin.session_ttl_hours".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.admin.sweep_interval_secs == 0 {
            errors.push(ValidationError {
                field: "admin.sweep_interval_secs".into(),
                message: "must be greater than 0".into(),
            });
        }

        // --- network ---
        if let Some(url) = &self.network.probe_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                errors.push(ValidationError {
                    field: "network.probe_url".into(),
                    message: format!("must be an http(s) URL: {url}"),
                });
            }
        }
        if self.network.probe_timeout_secs == 0 {
            errors.push(ValidationError {
                field: "network.probe_timeout_secs".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.network.retry_initial_ms == 0 {
            errors.push(ValidationError {
                field: "network.retry_initial_ms".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.network.retry_max() < self.network.retry_initial() {
            errors.push(ValidationError {
                field: "network.retry_max_secs".into(),
                message: "must not be shorter than network.retry_initial_ms".into(),
            });
        }

        // --- backend ---
        if self.backend.token_lifetime_secs < 2 {
            errors.push(ValidationError {
                field: "backend.token_lifetime_secs".into(),
                message: "must be at least 2".into(),
            });
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}', expected one of: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust,no_run
/// use davbridge_core::config::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .server_listen("127.0.0.1:8080")
///     .logging_level("debug")
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Start from an already loaded configuration.
    pub fn from_config(config: Config) -> Self {
        Self { config }
    }

    // --- server ---

    pub fn server_listen(mut self, addr: impl Into<String>) -> Self {
        self.config.server.listen = addr.into();
        self
    }

    pub fn server_grace_period_secs(mut self, secs: u64) -> Self {
        self.config.server.grace_period_secs = secs;
        self
    }

    // --- admin ---

    pub fn admin_listen(mut self, addr: impl Into<String>) -> Self {
        self.config.admin.listen = addr.into();
        self
    }

    // --- session ---

    pub fn auto_login_failure(mut self, policy: AutoLoginFailurePolicy) -> Self {
        self.config.session.auto_login_failure = policy;
        self
    }

    // --- store ---

    pub fn token_storage(mut self, storage: TokenStorage) -> Self {
        self.config.store.tokens = storage;
        self
    }

    pub fn data_dir(mut self, dir: PathBuf) -> Self {
        self.config.store.data_dir = Some(dir);
        self
    }

    // --- network ---

    pub fn probe_url(mut self, url: impl Into<String>) -> Self {
        self.config.network.probe_url = Some(url.into());
        self
    }

    // --- backend ---

    pub fn backend_root(mut self, root: PathBuf) -> Self {
        self.config.backend.root = root;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// Consume the builder and return the [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Consume the builder, validate, and return the [`Config`] or errors.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let errors = self.config.validate();
        if errors.is_empty() {
            Ok(self.config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
