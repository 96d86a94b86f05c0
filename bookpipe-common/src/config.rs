//! Configuration loading and logging setup
//!
//! Configuration settings resolve in priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. Compiled default (fallback)
//!
//! Tiers 1 and 2 are handled by each binary's clap definition. This module
//! locates and parses the TOML file and applies the graceful-degradation
//! rule: a missing *default* config file is not an error, the stage starts
//! with compiled defaults and logs that it did so.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Name of the per-user configuration directory
pub const CONFIG_DIR_NAME: &str = "bookpipe";

/// Logging configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Where a loaded configuration came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Parsed from the given file
    File(PathBuf),
    /// No file found at the default location; compiled defaults in use
    Defaults,
}

/// Default config file path: `<config_dir>/bookpipe/<file_name>`
pub fn default_config_path(file_name: &str) -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(CONFIG_DIR_NAME).join(file_name))
}

/// Locate and parse a TOML config file.
///
/// An explicitly requested path (CLI argument or `env_var`) must exist.
/// The default path may be absent, in which case `T::default()` is returned.
pub fn load_toml_config<T>(
    explicit: Option<&Path>,
    env_var: &str,
    file_name: &str,
) -> Result<(T, ConfigSource)>
where
    T: DeserializeOwned + Default,
{
    let requested = explicit
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(env_var).map(PathBuf::from));

    if let Some(path) = requested {
        if !path.exists() {
            return Err(Error::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        let config = parse_toml_file(&path)?;
        return Ok((config, ConfigSource::File(path)));
    }

    match default_config_path(file_name) {
        Some(path) if path.exists() => {
            let config = parse_toml_file(&path)?;
            Ok((config, ConfigSource::File(path)))
        }
        _ => Ok((T::default(), ConfigSource::Defaults)),
    }
}

/// Parse one TOML file into `T`
pub fn parse_toml_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("read {} failed: {}", path.display(), e)))?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("parse {} failed: {}", path.display(), e)))
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `crate_target` and this crate log at
/// the configured level and everything else at `warn`.
pub fn init_logging(config: &LoggingConfig, crate_target: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{crate_target}={level},bookpipe_common={level},warn",
            level = config.level
        ))
    });

    let (stderr_layer, file_layer) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    Error::Config(format!("open log file {} failed: {}", path.display(), e))
                })?;
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file));
            (None, Some(layer))
        }
        None => (
            Some(tracing_subscriber::fmt::layer().with_writer(std::io::stderr)),
            None,
        ),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("logging already initialised: {}", e)))
}
