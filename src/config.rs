//! Configuration management for cnbpack
//!
//! Settings are loaded from environment variables with defaults. Per-build
//! choices (builder, buildpacks, publish, ...) live on the build request, not here.
//!
//! # Environment Variables
//!
//! - `CNBPACK_LOG_LEVEL`: Logging level - default: "info"
//! - `CNBPACK_PULL_POLICY`: Image pull policy (always|if-not-present|never) - default: "if-not-present"
//! - `CNBPACK_PULL_RETRIES`: Attempts for transient pull failures - default: "3"
//! - `CNBPACK_CACHE_DIR`: Local state directory - default: user cache dir + "cnbpack"
//! - `CNBPACK_DIAGNOSTIC_LINES`: Output lines kept for failure diagnostics - default: "50"
//! - `CNBPACK_BUILD_TIMEOUT`: Build timeout in seconds - default: none
//! - `CNBPACK_REGISTRY_NAME`, `CNBPACK_REGISTRY_TYPE`, `CNBPACK_REGISTRY_URL`: an
//!   additional buildpack registry, selectable by name
//! - `CNBPACK_DOCKER_SOCKET`: Socket mounted into daemon-mode phases - default: "/var/run/docker.sock"
//!
//! # Example
//!
//! ```no_run
//! use cnbpack::CnbpackConfig;
//!
//! let config = CnbpackConfig::default();
//! config.validate().expect("Invalid configuration");
//! let store = config.local_store();
//! ```

use crate::buildpack::{LocalStore, RegistryConfig, RegistryKind};
use crate::engine::{PullOptions, PullPolicy};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_PULL_RETRIES: u32 = 3;
const MAX_PULL_RETRIES: u32 = 10;
const DEFAULT_DIAGNOSTIC_LINES: usize = 50;
const MAX_DIAGNOSTIC_LINES: usize = 10_000;
const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";
const PULL_BACKOFF: Duration = Duration::from_millis(500);

/// Configuration errors
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// Failed to parse configuration value
    #[error("Failed to parse {field}: {error}")]
    ParseError { field: String, error: String },

    /// Requested registry is not configured
    #[error("Unknown buildpack registry '{0}'")]
    UnknownRegistry(String),
}

/// Main configuration structure for cnbpack
#[derive(Debug, Clone)]
pub struct CnbpackConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,

    pub pull_policy: PullPolicy,

    /// Attempts for a pull that fails with a transient error
    pub pull_retries: u32,

    /// Root of local state; imported buildpacks live under `<cache_dir>/buildpacks`
    pub cache_dir: PathBuf,

    /// Number of trailing output lines kept for failure diagnostics
    pub diagnostic_lines: usize,

    pub build_timeout_secs: Option<u64>,

    /// Extra registry from the environment, in addition to the official one
    pub registry: Option<RegistryConfig>,

    pub docker_socket: PathBuf,

    errors: Vec<ConfigError>,
}

impl Default for CnbpackConfig {
    /// Loads CNBPACK_* environment variables, falling back to defaults.
    /// Unparseable values are remembered and reported by [`CnbpackConfig::validate`].
    fn default() -> Self {
        let mut errors = Vec::new();

        let log_level = env::var("CNBPACK_LOG_LEVEL")
            .unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string())
            .to_lowercase();

        let pull_policy = match env::var("CNBPACK_PULL_POLICY") {
            Ok(value) => value.parse::<PullPolicy>().unwrap_or_else(|e| {
                errors.push(ConfigError::ParseError {
                    field: "CNBPACK_PULL_POLICY".to_string(),
                    error: e,
                });
                PullPolicy::default()
            }),
            Err(_) => PullPolicy::default(),
        };

        let pull_retries = env::var("CNBPACK_PULL_RETRIES")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(DEFAULT_PULL_RETRIES);

        let cache_dir = env::var("CNBPACK_CACHE_DIR")
            .ok()
            .map(|dir| absolute(PathBuf::from(dir)))
            .unwrap_or_else(|| {
                dirs::cache_dir()
                    .unwrap_or_else(env::temp_dir)
                    .join("cnbpack")
            });

        let diagnostic_lines = env::var("CNBPACK_DIAGNOSTIC_LINES")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(DEFAULT_DIAGNOSTIC_LINES);

        let build_timeout_secs = env::var("CNBPACK_BUILD_TIMEOUT")
            .ok()
            .and_then(|v| v.parse::<u64>().ok());

        let registry = env::var("CNBPACK_REGISTRY_URL").ok().map(|url| {
            let kind = match env::var("CNBPACK_REGISTRY_TYPE") {
                Ok(value) => value.parse::<RegistryKind>().unwrap_or_else(|e| {
                    errors.push(ConfigError::ParseError {
                        field: "CNBPACK_REGISTRY_TYPE".to_string(),
                        error: e,
                    });
                    RegistryKind::default()
                }),
                Err(_) => RegistryKind::default(),
            };
            RegistryConfig {
                name: env::var("CNBPACK_REGISTRY_NAME").unwrap_or_else(|_| "custom".to_string()),
                kind,
                url,
            }
        });

        let docker_socket = env::var("CNBPACK_DOCKER_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_DOCKER_SOCKET));

        Self {
            log_level,
            pull_policy,
            pull_retries,
            cache_dir,
            diagnostic_lines,
            build_timeout_secs,
            registry,
            docker_socket,
            errors,
        }
    }
}

impl CnbpackConfig {
    /// Validates the configuration
    ///
    /// # Errors
    ///
    /// Returns the first unparseable environment value, or `ValidationFailed`
    /// when a value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(error) = self.errors.first() {
            return Err(error.clone());
        }

        if self.pull_retries == 0 {
            return Err(ConfigError::ValidationFailed(
                "Pull retries must be at least 1".to_string(),
            ));
        }
        if self.pull_retries > MAX_PULL_RETRIES {
            return Err(ConfigError::ValidationFailed(format!(
                "Pull retries cannot exceed {}",
                MAX_PULL_RETRIES
            )));
        }

        if self.diagnostic_lines == 0 || self.diagnostic_lines > MAX_DIAGNOSTIC_LINES {
            return Err(ConfigError::ValidationFailed(format!(
                "Diagnostic lines must be between 1 and {}",
                MAX_DIAGNOSTIC_LINES
            )));
        }

        if self.build_timeout_secs == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "Build timeout must be at least 1 second".to_string(),
            ));
        }

        if let Some(registry) = &self.registry {
            if registry.name.is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "Registry name cannot be empty".to_string(),
                ));
            }
            if !(registry.url.starts_with("https://")
                || registry.url.starts_with("http://")
                || registry.url.starts_with("file://"))
            {
                return Err(ConfigError::ValidationFailed(format!(
                    "Registry URL must be http(s):// or file://, got {}",
                    registry.url
                )));
            }
        }

        match self.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::ValidationFailed(format!(
                    "Invalid log level: {}. Valid options: trace, debug, info, warn, error",
                    self.log_level
                )))
            }
        }

        Ok(())
    }

    pub fn pull_options(&self) -> PullOptions {
        PullOptions {
            policy: self.pull_policy,
            retries: self.pull_retries,
            backoff: PULL_BACKOFF,
        }
    }

    /// Same options with a different pull policy, used for per-build overrides
    pub fn pull_options_with(&self, policy: PullPolicy) -> PullOptions {
        PullOptions {
            policy,
            ..self.pull_options()
        }
    }

    pub fn local_store(&self) -> LocalStore {
        LocalStore::new(self.cache_dir.join("buildpacks"))
    }

    pub fn build_timeout(&self) -> Option<Duration> {
        self.build_timeout_secs.map(Duration::from_secs)
    }

    /// Looks up a registry by name; `None` selects the environment registry if
    /// one is configured, otherwise the official registry.
    pub fn registry(&self, name: Option<&str>) -> Result<RegistryConfig, ConfigError> {
        let official = RegistryConfig::default();
        match name {
            None => Ok(self.registry.clone().unwrap_or(official)),
            Some(name) if name == official.name => Ok(official),
            Some(name) => self
                .registry
                .as_ref()
                .filter(|r| r.name == name)
                .cloned()
                .ok_or_else(|| ConfigError::UnknownRegistry(name.to_string())),
        }
    }

    /// Converts configuration to a display map for output formatting
    pub fn to_display_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();

        map.insert("log_level".to_string(), self.log_level.clone());
        map.insert("pull_policy".to_string(), self.pull_policy.to_string());
        map.insert("pull_retries".to_string(), self.pull_retries.to_string());
        map.insert(
            "cache_dir".to_string(),
            self.cache_dir.display().to_string(),
        );
        map.insert(
            "diagnostic_lines".to_string(),
            self.diagnostic_lines.to_string(),
        );
        if let Some(timeout) = self.build_timeout_secs {
            map.insert("build_timeout_secs".to_string(), timeout.to_string());
        }
        if let Some(ref registry) = self.registry {
            map.insert("registry_name".to_string(), registry.name.clone());
            map.insert("registry_type".to_string(), registry.kind.to_string());
            map.insert("registry_url".to_string(), registry.url.clone());
        }
        map.insert(
            "docker_socket".to_string(),
            self.docker_socket.display().to_string(),
        );

        map
    }
}

impl fmt::Display for CnbpackConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Cnbpack Configuration:")?;
        writeln!(f, "  Log Level: {}", self.log_level)?;
        writeln!(f, "  Pull Policy: {}", self.pull_policy)?;
        writeln!(f, "  Pull Retries: {}", self.pull_retries)?;
        writeln!(f, "  Cache Dir: {}", self.cache_dir.display())?;
        writeln!(f, "  Diagnostic Lines: {}", self.diagnostic_lines)?;
        if let Some(timeout) = self.build_timeout_secs {
            writeln!(f, "  Build Timeout: {}s", timeout)?;
        }
        if let Some(ref registry) = self.registry {
            writeln!(
                f,
                "  Registry: {} ({}, {})",
                registry.name, registry.kind, registry.url
            )?;
        }
        writeln!(f, "  Docker Socket: {}", self.docker_socket.display())?;
        Ok(())
    }
}

/// Anchors a relative path at the working directory; local state is bind-mounted
fn absolute(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    match env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path,
    }
}
