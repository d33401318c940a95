//! Worker configuration loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use canvasgen_core::job::DEFAULT_MAX_RETRIES;

const DEFAULT_API_URL: &str = "http://127.0.0.1:7860/sdapi/v1";
const DEFAULT_SETTINGS_PATH: &str = "canvasgen-settings.json";
const DEFAULT_OUTPUT_DIR: &str = "outputs";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 600;

/// Errors from parsing configuration values.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got '{value}'")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Endpoints, paths and limits for one worker run.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Generation HTTP base, e.g. `http://127.0.0.1:7860/sdapi/v1`.
    pub api_url: String,
    /// Progress socket `host[:port]`.
    pub socket_host: String,
    pub socket_secure: bool,
    pub settings_path: PathBuf,
    pub output_dir: PathBuf,
    pub max_retries: u32,
    pub request_timeout: Duration,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                  | Default                            |
    /// |--------------------------|------------------------------------|
    /// | `GENERATION_API_URL`     | `http://127.0.0.1:7860/sdapi/v1`   |
    /// | `PROGRESS_SOCKET_HOST`   | host of `GENERATION_API_URL`       |
    /// | `PROGRESS_SOCKET_SECURE` | `false`                            |
    /// | `SETTINGS_PATH`          | `canvasgen-settings.json`          |
    /// | `OUTPUT_DIR`             | `outputs`                          |
    /// | `MAX_RETRIES`            | `2`                                |
    /// | `REQUEST_TIMEOUT_SECS`   | `600`                              |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through `lookup` instead of the process
    /// environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_url = lookup("GENERATION_API_URL")
            .unwrap_or_else(|| DEFAULT_API_URL.into())
            .trim_end_matches('/')
            .to_string();

        let socket_host =
            lookup("PROGRESS_SOCKET_HOST").unwrap_or_else(|| host_of(&api_url).to_string());

        let socket_secure = match lookup("PROGRESS_SOCKET_SECURE") {
            Some(value) => parse_bool("PROGRESS_SOCKET_SECURE", &value)?,
            None => false,
        };

        let settings_path = lookup("SETTINGS_PATH")
            .unwrap_or_else(|| DEFAULT_SETTINGS_PATH.into())
            .into();

        let output_dir = lookup("OUTPUT_DIR")
            .unwrap_or_else(|| DEFAULT_OUTPUT_DIR.into())
            .into();

        let max_retries = match lookup("MAX_RETRIES") {
            Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
                var: "MAX_RETRIES",
                expected: "a non-negative integer",
                value,
            })?,
            None => DEFAULT_MAX_RETRIES,
        };

        let timeout_secs: u64 = match lookup("REQUEST_TIMEOUT_SECS") {
            Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
                var: "REQUEST_TIMEOUT_SECS",
                expected: "a number of seconds",
                value,
            })?,
            None => DEFAULT_REQUEST_TIMEOUT_SECS,
        };

        Ok(Self {
            api_url,
            socket_host,
            socket_secure,
            settings_path,
            output_dir,
            max_retries,
            request_timeout: Duration::from_secs(timeout_secs),
        })
    }
}

/// `host[:port]` part of a URL.
fn host_of(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    rest.split('/').next().unwrap_or(rest)
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            expected: "a boolean",
            value: value.to_string(),
        }),
    }
}
