//! Oracle configuration.
//!
//! Read from environment variables at startup. Required:
//! - `LEDGER_RPC_URL`: ledger JSON-RPC endpoint
//! - `LEDGER_PROGRAM_ID`: attestation program identifier
//! - `BACKEND_URL`: report store base URL
//! - `ORACLE_SIGNING_KEY` (hex) or `ORACLE_SIGNING_KEY_FILE` (path)
//!
//! Optional, with defaults:
//! - `CONTENT_GATEWAY_URL` (default: public IPFS gateway)
//! - `SUBMISSION_POLL_INTERVAL_MS` (30000)
//! - `INTEGRITY_POLL_INTERVAL_MS` (300000)
//! - `MAX_SUBMISSION_ATTEMPTS` (5)
//! - `CALL_TIMEOUT_MS` (60000)
//! - `CONFIRM_POLL_INTERVAL_MS` (2000)
//! - `MAX_IN_FLIGHT` (4)
//! - `SHUTDOWN_GRACE_MS` (10000)
//! - `ORACLE_HTTP_ADDR` (unset: ops endpoint disabled)

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::Url;
use thiserror::Error;
use tracing::warn;

use securizz_common::{CryptoError, OracleKeypair};

use crate::content_client::DEFAULT_GATEWAY_URL;

pub const DEFAULT_SUBMISSION_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_INTEGRITY_INTERVAL_MS: u64 = 300_000;
pub const DEFAULT_MAX_SUBMISSION_ATTEMPTS: u32 = 5;
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_CONFIRM_POLL_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_MAX_IN_FLIGHT: usize = 4;
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 10_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} environment variable not set")]
    Missing(&'static str),

    #[error("{name} invalid: '{value}'")]
    Invalid { name: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("signing key: {0}")]
    SigningKey(#[from] CryptoError),
}

/// Where the oracle's signing key comes from.
#[derive(Clone)]
pub enum SigningKeySource {
    Hex(String),
    File(PathBuf),
}

impl fmt::Debug for SigningKeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hex(_) => f.write_str("Hex(<redacted>)"),
            Self::File(p) => f.debug_tuple("File").field(p).finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OracleConfig {
    pub rpc_url: String,
    pub program_id: String,
    pub backend_url: String,
    pub gateway_url: String,
    pub signing_key: SigningKeySource,
    pub submission_interval: Duration,
    pub integrity_interval: Duration,
    pub max_attempts: u32,
    pub call_timeout: Duration,
    pub confirm_poll_interval: Duration,
    pub max_in_flight: usize,
    pub shutdown_grace: Duration,
    pub http_addr: Option<SocketAddr>,
}

impl OracleConfig {
    /// Reads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads configuration through `lookup`. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let required = |name: &'static str| get(name).ok_or(ConfigError::Missing(name));

        let signing_key = match (get("ORACLE_SIGNING_KEY"), get("ORACLE_SIGNING_KEY_FILE")) {
            (Some(hex), _) => SigningKeySource::Hex(hex),
            (None, Some(path)) => SigningKeySource::File(PathBuf::from(path)),
            (None, None) => return Err(ConfigError::Missing("ORACLE_SIGNING_KEY")),
        };

        let http_addr = match get("ORACLE_HTTP_ADDR") {
            Some(v) => Some(v.parse::<SocketAddr>().map_err(|_| ConfigError::Invalid {
                name: "ORACLE_HTTP_ADDR",
                value: v,
            })?),
            None => None,
        };

        Ok(Self {
            rpc_url: required("LEDGER_RPC_URL")?,
            program_id: required("LEDGER_PROGRAM_ID")?,
            backend_url: required("BACKEND_URL")?,
            gateway_url: get("CONTENT_GATEWAY_URL")
                .unwrap_or_else(|| DEFAULT_GATEWAY_URL.to_string()),
            signing_key,
            submission_interval: Duration::from_millis(parse_or(
                get("SUBMISSION_POLL_INTERVAL_MS"),
                "SUBMISSION_POLL_INTERVAL_MS",
                DEFAULT_SUBMISSION_INTERVAL_MS,
            )?),
            integrity_interval: Duration::from_millis(parse_or(
                get("INTEGRITY_POLL_INTERVAL_MS"),
                "INTEGRITY_POLL_INTERVAL_MS",
                DEFAULT_INTEGRITY_INTERVAL_MS,
            )?),
            max_attempts: parse_or(
                get("MAX_SUBMISSION_ATTEMPTS"),
                "MAX_SUBMISSION_ATTEMPTS",
                DEFAULT_MAX_SUBMISSION_ATTEMPTS,
            )?,
            call_timeout: Duration::from_millis(parse_or(
                get("CALL_TIMEOUT_MS"),
                "CALL_TIMEOUT_MS",
                DEFAULT_CALL_TIMEOUT_MS,
            )?),
            confirm_poll_interval: Duration::from_millis(parse_or(
                get("CONFIRM_POLL_INTERVAL_MS"),
                "CONFIRM_POLL_INTERVAL_MS",
                DEFAULT_CONFIRM_POLL_INTERVAL_MS,
            )?),
            max_in_flight: parse_or(get("MAX_IN_FLIGHT"), "MAX_IN_FLIGHT", DEFAULT_MAX_IN_FLIGHT)?,
            shutdown_grace: Duration::from_millis(parse_or(
                get("SHUTDOWN_GRACE_MS"),
                "SHUTDOWN_GRACE_MS",
                DEFAULT_SHUTDOWN_GRACE_MS,
            )?),
            http_addr,
        })
    }

    /// Rejects values the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, url) in [
            ("LEDGER_RPC_URL", &self.rpc_url),
            ("BACKEND_URL", &self.backend_url),
            ("CONTENT_GATEWAY_URL", &self.gateway_url),
        ] {
            let parsed = Url::parse(url).map_err(|_| ConfigError::Invalid {
                name,
                value: url.clone(),
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ConfigError::Invalid {
                    name,
                    value: url.clone(),
                });
            }
        }
        if self.program_id.len() > usize::from(u8::MAX) {
            return Err(ConfigError::Validation(
                "LEDGER_PROGRAM_ID longer than 255 bytes".to_string(),
            ));
        }
        if self.submission_interval.is_zero() || self.integrity_interval.is_zero() {
            return Err(ConfigError::Validation("poll intervals must be > 0".to_string()));
        }
        if self.call_timeout.is_zero() || self.confirm_poll_interval.is_zero() {
            return Err(ConfigError::Validation("timeouts must be > 0".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "MAX_SUBMISSION_ATTEMPTS must be > 0".to_string(),
            ));
        }
        if self.max_in_flight == 0 {
            return Err(ConfigError::Validation("MAX_IN_FLIGHT must be > 0".to_string()));
        }
        if self.call_timeout >= self.integrity_interval {
            return Err(ConfigError::Validation(
                "CALL_TIMEOUT_MS must be shorter than INTEGRITY_POLL_INTERVAL_MS".to_string(),
            ));
        }
        if self.call_timeout >= self.submission_interval {
            warn!(
                call_timeout_ms = self.call_timeout.as_millis() as u64,
                submission_interval_ms = self.submission_interval.as_millis() as u64,
                "call timeout exceeds submission interval, slow ticks will be skipped"
            );
        }
        Ok(())
    }

    /// Loads the signing keypair.
    pub fn load_signer(&self) -> Result<OracleKeypair, ConfigError> {
        Ok(match &self.signing_key {
            SigningKeySource::Hex(hex) => OracleKeypair::from_hex(hex)?,
            SigningKeySource::File(path) => OracleKeypair::from_file(path)?,
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    value: Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        Some(v) => v.parse::<T>().map_err(|_| ConfigError::Invalid { name, value: v }),
        None => Ok(default),
    }
}
