use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api_host: String,
    pub api_port: u16,
    pub worker_config: WorkerConfig,
    pub upload_config: UploadConfig,
    pub telemetry_config: TelemetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub runtime: String,
    pub script_path: PathBuf,
    pub model_path: PathBuf,
    pub timeout_secs: Option<u64>, // None disables the timeout
    pub max_concurrent_workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    pub scratch_dir: PathBuf,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub stale_after_secs: u64,
}

impl WorkerConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_host: "0.0.0.0".to_string(),
            api_port: 3001,
            worker_config: WorkerConfig {
                runtime: "python3".to_string(),
                script_path: PathBuf::from("server/model.py"),
                model_path: PathBuf::from("tower_classifier.pth"),
                timeout_secs: Some(120),
                max_concurrent_workers: 4,
            },
            upload_config: UploadConfig {
                scratch_dir: PathBuf::from("uploads"),
                max_upload_bytes: 10 * 1024 * 1024, // 10MB
            },
            telemetry_config: TelemetryConfig {
                stale_after_secs: 30,
            },
        }
    }
}

impl Config {
    /// Build the configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn load() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let api_host = env::var("API_HOST").unwrap_or(defaults.api_host);

        let api_port = parse_env("API_PORT", defaults.api_port, "a TCP port number")?;

        // Worker process
        let runtime = env::var("WORKER_RUNTIME").unwrap_or(defaults.worker_config.runtime);

        let script_path = env::var("WORKER_SCRIPT")
            .map(PathBuf::from)
            .unwrap_or(defaults.worker_config.script_path);

        let model_path = env::var("MODEL_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.worker_config.model_path);

        // 0 turns the timeout off entirely
        let timeout_secs = match env::var("WORKER_TIMEOUT_SECS") {
            Ok(raw) => {
                let secs: u64 = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                    key: "WORKER_TIMEOUT_SECS".to_string(),
                    reason: format!("expected a whole number of seconds, got {:?}", raw),
                })?;
                (secs > 0).then_some(secs)
            }
            Err(_) => defaults.worker_config.timeout_secs,
        };

        let max_concurrent_workers = match env::var("MAX_CONCURRENT_WORKERS") {
            Ok(raw) => raw.trim().parse::<usize>().ok().filter(|n| *n > 0).ok_or_else(|| {
                ConfigError::InvalidValue {
                    key: "MAX_CONCURRENT_WORKERS".to_string(),
                    reason: format!("expected a positive integer, got {:?}", raw),
                }
            })?,
            Err(_) => defaults.worker_config.max_concurrent_workers,
        };

        // Uploads
        let scratch_dir = env::var("SCRATCH_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.upload_config.scratch_dir);

        let max_upload_bytes = parse_env(
            "MAX_UPLOAD_BYTES",
            defaults.upload_config.max_upload_bytes,
            "a byte count",
        )?;

        let stale_after_secs = parse_env(
            "SENSOR_STALE_AFTER_SECS",
            defaults.telemetry_config.stale_after_secs,
            "a whole number of seconds",
        )?;

        Ok(Self {
            api_host,
            api_port,
            worker_config: WorkerConfig {
                runtime,
                script_path,
                model_path,
                timeout_secs,
                max_concurrent_workers,
            },
            upload_config: UploadConfig {
                scratch_dir,
                max_upload_bytes,
            },
            telemetry_config: TelemetryConfig { stale_after_secs },
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }
}

/// Unset keys take the default; set but unparsable keys are an error.
fn parse_env<T: FromStr>(key: &str, default: T, expected: &str) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            reason: format!("expected {}, got {:?}", expected, raw),
        }),
        Err(_) => Ok(default),
    }
}
