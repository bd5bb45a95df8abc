//! Environment-driven configuration.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::health::{DEFAULT_ERR_BUF_SIZE, DEFAULT_HEALTH_CHECK_PERIOD};
use crate::kms::aws::AwsKmsConfig;

/// Configuration error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is unset.
    #[error("missing required configuration: {0}")]
    Missing(&'static str),

    /// A variable did not parse.
    #[error("invalid value for {name}: {value}")]
    Invalid {
        /// Variable name.
        name: &'static str,
        /// Offending value.
        value: String,
    },

    /// Both rate-limit schemes were configured at once.
    #[error("retry token capacity and qps/burst limits are mutually exclusive")]
    ConflictingRateLimits,

    /// A qps limit was given without a positive burst limit.
    #[error("burst limit expected >0 when qps limit is set, got {0}")]
    MissingBurst(usize),

    /// An encryption-context entry was not of the form `key=value`.
    #[error("invalid encryption context entry: {0}")]
    InvalidEncryptionContext(String),
}

/// Process configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// CMK the plugins encrypt under.
    pub key_arn: String,
    /// Additional authenticated data sent with every KMS call.
    pub encryption_context: HashMap<String, String>,
    /// AWS region override.
    pub region: Option<String>,
    /// KMS endpoint override.
    pub kms_endpoint: Option<String>,
    /// Client-side retry token capacity.
    pub retry_token_capacity: usize,
    /// Deprecated qps limit.
    pub qps_limit: usize,
    /// Deprecated burst limit.
    pub burst_limit: usize,
    /// Source ARN for confused-deputy headers.
    pub source_arn: Option<String>,
    /// Unix socket for the v1beta1 endpoint.
    pub listen: PathBuf,
    /// Unix socket for the v2 endpoint.
    pub listen_v2: PathBuf,
    /// Port for the probe/metrics HTTP server.
    pub health_port: u16,
    /// Readiness path.
    pub healthz_path: String,
    /// Liveness path.
    pub livez_path: String,
    /// Metrics path.
    pub metrics_path: String,
    /// Staleness period of cached health results.
    pub health_check_period: Duration,
    /// Capacity of the health error channel.
    pub err_buf_size: usize,
}

impl Config {
    /// Loads configuration from the environment (and `.env` when present).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let key_arn = env::var("KMS_KEY_ARN").map_err(|_| ConfigError::Missing("KMS_KEY_ARN"))?;

        let config = Config {
            key_arn,
            encryption_context: parse_encryption_context(
                &env::var("ENCRYPTION_CONTEXT").unwrap_or_default(),
            )?,
            region: env::var("AWS_REGION").ok().filter(|v| !v.is_empty()),
            kms_endpoint: env::var("KMS_ENDPOINT").ok().filter(|v| !v.is_empty()),
            retry_token_capacity: parse_env("RETRY_TOKEN_CAPACITY", 0)?,
            qps_limit: parse_env("QPS_LIMIT", 0)?,
            burst_limit: parse_env("BURST_LIMIT", 0)?,
            source_arn: env::var("SOURCE_ARN").ok().filter(|v| !v.is_empty()),
            listen: PathBuf::from(
                env::var("LISTEN_ADDR")
                    .unwrap_or_else(|_| "/var/run/kmsplugin/socket.sock".to_string()),
            ),
            listen_v2: PathBuf::from(
                env::var("LISTEN_ADDR_V2")
                    .unwrap_or_else(|_| "/var/run/kmsplugin/socketv2.sock".to_string()),
            ),
            health_port: parse_env("HEALTH_PORT", 8080)?,
            healthz_path: env::var("HEALTHZ_PATH").unwrap_or_else(|_| "/healthz".to_string()),
            livez_path: env::var("LIVEZ_PATH").unwrap_or_else(|_| "/livez".to_string()),
            metrics_path: env::var("METRICS_PATH").unwrap_or_else(|_| "/metrics".to_string()),
            health_check_period: Duration::from_secs(parse_env(
                "HEALTH_CHECK_PERIOD_SECONDS",
                DEFAULT_HEALTH_CHECK_PERIOD.as_secs(),
            )?),
            err_buf_size: parse_env("ERROR_BUFFER_SIZE", DEFAULT_ERR_BUF_SIZE)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_token_capacity > 0 && self.qps_limit > 0 {
            return Err(ConfigError::ConflictingRateLimits);
        }
        if self.qps_limit > 0 && self.burst_limit == 0 {
            return Err(ConfigError::MissingBurst(self.burst_limit));
        }
        Ok(())
    }

    /// KMS client settings derived from this configuration.
    pub fn kms(&self) -> AwsKmsConfig {
        AwsKmsConfig {
            region: self.region.clone(),
            endpoint: self.kms_endpoint.clone(),
            retry_token_capacity: self.retry_token_capacity,
            qps_limit: self.qps_limit,
            burst_limit: self.burst_limit,
            source_arn: self.source_arn.clone(),
        }
    }
}

fn parse_env<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.is_empty() => {
            value.parse().map_err(|_| ConfigError::Invalid { name, value })
        }
        _ => Ok(default),
    }
}

/// Parses `k=v,k2=v2` into a map. Empty input yields an empty map.
fn parse_encryption_context(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    let mut context = HashMap::new();
    for entry in raw.split(',').filter(|e| !e.trim().is_empty()) {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| ConfigError::InvalidEncryptionContext(entry.to_string()))?;
        let (key, value) = (key.trim(), value.trim());
        if key.is_empty() || value.is_empty() {
            return Err(ConfigError::InvalidEncryptionContext(entry.to_string()));
        }
        context.insert(key.to_string(), value.to_string());
    }
    Ok(context)
}
