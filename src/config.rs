//! Environment-driven server settings.

use crate::modules::command::DEFAULT_EXEC_TIMEOUT;
use crate::modules::session_store::DEFAULT_SESSION_TTL;
use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_PORT: u16 = 8443;
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerSettings {
    pub port: u16,
    pub tls_enabled: bool,
    pub tls_cert_path: PathBuf,
    pub tls_key_path: PathBuf,
    pub private_key_path: PathBuf,
    pub public_key_path: Option<PathBuf>,
    pub allowed_commands: HashSet<String>,
    pub payload_encryption: bool,
    pub session_ttl: Duration,
    pub exec_timeout: Duration,
    pub sweep_interval: Duration,
}

impl ServerSettings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build settings from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let tls_cert_path = lookup("TLS_CERT_PATH");

        Ok(ServerSettings {
            port: parse_or(&lookup, "PORT", DEFAULT_PORT)?,
            tls_enabled: tls_cert_path.is_some(),
            tls_cert_path: PathBuf::from(
                tls_cert_path.unwrap_or_else(|| "./fullchain.pem".to_string()),
            ),
            tls_key_path: PathBuf::from(
                lookup("TLS_KEY_PATH").unwrap_or_else(|| "./privkey.pem".to_string()),
            ),
            private_key_path: PathBuf::from(
                lookup("SPI_PRIVATE_KEY_PATH")
                    .unwrap_or_else(|| "./certs/private_key.pem".to_string()),
            ),
            public_key_path: lookup("SPI_PUBLIC_KEY_PATH").map(PathBuf::from),
            allowed_commands: lookup("SPI_ALLOWED_COMMANDS")
                .map(|list| parse_command_list(&list))
                .unwrap_or_default(),
            payload_encryption: parse_or(&lookup, "SPI_PAYLOAD_ENCRYPTION", false)?,
            session_ttl: seconds_or(&lookup, "SPI_SESSION_TTL_SECS", DEFAULT_SESSION_TTL)?,
            exec_timeout: seconds_or(&lookup, "SPI_EXEC_TIMEOUT_SECS", DEFAULT_EXEC_TIMEOUT)?,
            sweep_interval: seconds_or(&lookup, "SPI_SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL)?,
        })
    }
}

/// Split a comma-separated whitelist, dropping blanks.
pub fn parse_command_list(list: &str) -> HashSet<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        None => Ok(default),
    }
}

fn seconds_or<F>(lookup: &F, name: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let secs: u64 = parse_or(lookup, name, default.as_secs())?;
    if secs == 0 {
        return Err(ConfigError::InvalidValue {
            name,
            value: secs.to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}
