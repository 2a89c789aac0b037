//! Runner configuration.
//!
//! Holds the host-side storage root, container layout, default image and
//! secret key used by every step run. Values come from defaults, builder
//! methods, or `IAC_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration shared by all task runs on one runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Host directory under which task workspaces are created.
    pub storage_path: PathBuf,
    /// Image used when a run request does not override it.
    pub default_image: String,
    /// Mount point of the task workspace inside the container.
    pub container_workspace: String,
    /// Terraform plugin cache directory inside the container.
    pub plugin_cache_path: String,
    /// Host directory bound to `plugin_cache_path`, if any.
    pub host_plugin_cache_path: Option<PathBuf>,
    /// Directory holding runner assets (ansible inventory script) inside the container.
    pub assets_dir: String,
    /// State backend address used when a request leaves it empty.
    pub default_state_address: String,
    /// Key for sealed secret values.
    pub secret_key: String,
    /// Per-step timeout when the request carries none.
    pub default_step_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("./var/workspaces"),
            default_image: "cloudiac/ct-worker:latest".to_string(),
            container_workspace: "/cloudiac/workspace".to_string(),
            plugin_cache_path: "/cloudiac/cache/plugins".to_string(),
            host_plugin_cache_path: None,
            assets_dir: "/cloudiac/assets".to_string(),
            default_state_address: "127.0.0.1:8500".to_string(),
            secret_key: String::new(),
            default_step_timeout: Duration::from_secs(3600),
        }
    }
}

impl RunnerConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the workspace storage root.
    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = path.into();
        self
    }

    /// Sets the default container image.
    pub fn with_default_image(mut self, image: impl Into<String>) -> Self {
        self.default_image = image.into();
        self
    }

    /// Sets the secret key.
    pub fn with_secret_key(mut self, key: impl Into<String>) -> Self {
        self.secret_key = key.into();
        self
    }

    /// Sets the default state backend address.
    pub fn with_default_state_address(mut self, address: impl Into<String>) -> Self {
        self.default_state_address = address.into();
        self
    }

    /// Sets the host directory bound as the plugin cache.
    pub fn with_host_plugin_cache(mut self, path: impl Into<PathBuf>) -> Self {
        self.host_plugin_cache_path = Some(path.into());
        self
    }

    /// Sets the default step timeout.
    pub fn with_default_step_timeout(mut self, timeout: Duration) -> Self {
        self.default_step_timeout = timeout;
        self
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `IAC_STORAGE_PATH`: workspace root (default: ./var/workspaces)
    /// - `IAC_DEFAULT_IMAGE`: worker image (default: cloudiac/ct-worker:latest)
    /// - `IAC_CONTAINER_WORKSPACE`: workspace mount point (default: /cloudiac/workspace)
    /// - `IAC_PLUGIN_CACHE_PATH`: plugin cache inside the container
    /// - `IAC_HOST_PLUGIN_CACHE_PATH`: host plugin cache to bind
    /// - `IAC_ASSETS_DIR`: assets directory inside the container
    /// - `IAC_STATE_ADDRESS`: default state backend address
    /// - `IAC_SECRET_KEY`: key for sealed secrets (required)
    /// - `IAC_STEP_TIMEOUT_SECS`: default per-step timeout (default: 3600)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or have invalid values.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("IAC_STORAGE_PATH") {
            config.storage_path = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("IAC_DEFAULT_IMAGE") {
            config.default_image = val;
        }

        if let Ok(val) = std::env::var("IAC_CONTAINER_WORKSPACE") {
            config.container_workspace = val;
        }

        if let Ok(val) = std::env::var("IAC_PLUGIN_CACHE_PATH") {
            config.plugin_cache_path = val;
        }

        if let Ok(val) = std::env::var("IAC_HOST_PLUGIN_CACHE_PATH") {
            config.host_plugin_cache_path = Some(PathBuf::from(val));
        }

        if let Ok(val) = std::env::var("IAC_ASSETS_DIR") {
            config.assets_dir = val;
        }

        if let Ok(val) = std::env::var("IAC_STATE_ADDRESS") {
            config.default_state_address = val;
        }

        config.secret_key = std::env::var("IAC_SECRET_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("IAC_SECRET_KEY".to_string()))?;

        if let Ok(val) = std::env::var("IAC_STEP_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "IAC_STEP_TIMEOUT_SECS")?;
            config.default_step_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_image.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "default_image cannot be empty".to_string(),
            ));
        }

        if !self.container_workspace.starts_with('/') {
            return Err(ConfigError::ValidationFailed(
                "container_workspace must be an absolute path".to_string(),
            ));
        }

        if self.secret_key.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "secret_key cannot be empty".to_string(),
            ));
        }

        if self.default_step_timeout.as_secs() == 0 {
            return Err(ConfigError::ValidationFailed(
                "default_step_timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Parses an environment variable value into the target type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}
