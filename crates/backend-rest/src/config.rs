//! Environment-backed client configuration.

use std::{env, time::Duration};

use thiserror::Error;
use url::Url;

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_SNAPSHOT_PAGE_SIZE: u32 = 50;
const MAX_SNAPSHOT_PAGE_SIZE: u32 = 100;
const DEFAULT_PUSH_RECONNECT_BASE_MS: u64 = 500;
const DEFAULT_PUSH_RECONNECT_MAX_MS: u64 = 30_000;
const DEFAULT_KEYRING_SERVICE: &str = "dev.chat-backend.client";
const DEFAULT_PUSH_PATH: &str = "ws";

/// Runtime configuration for the REST transport and push channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Base URL all REST paths are joined onto. Always ends with `/`.
    pub api_base_url: Url,
    /// Websocket URL of the push channel.
    pub push_url: Url,
    /// Per-request timeout; expiry surfaces as `NETWORK_ERROR`.
    pub request_timeout: Duration,
    /// Page size used for `Refresh` and unknown-conversation reloads.
    pub snapshot_page_size: u32,
    pub push_reconnect_base: Duration,
    pub push_reconnect_max: Duration,
    /// Keyring service name when the OS keyring backs the credential store.
    pub keyring_service: String,
}

impl ClientConfig {
    /// Build a configuration with defaults for everything but the API URL.
    pub fn new(api_base_url: &str) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| (key == "CHAT_API_BASE_URL").then(|| api_base_url.to_owned()))
    }

    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let raw_api = optional_trimmed_env("CHAT_API_BASE_URL", &mut lookup)
            .ok_or(ConfigError::Missing {
                key: "CHAT_API_BASE_URL",
            })?;
        let api_base_url = parse_api_url(&raw_api)?;

        let push_url = match optional_trimmed_env("CHAT_PUSH_URL", &mut lookup) {
            Some(raw) => parse_push_url(&raw)?,
            None => derive_push_url(&api_base_url)?,
        };

        let request_timeout_ms = parse_u64_with_default(
            "CHAT_REQUEST_TIMEOUT_MS",
            DEFAULT_REQUEST_TIMEOUT_MS,
            &mut lookup,
        )?;
        if request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CHAT_REQUEST_TIMEOUT_MS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        let snapshot_page_size = parse_u64_with_default(
            "CHAT_SNAPSHOT_PAGE_SIZE",
            u64::from(DEFAULT_SNAPSHOT_PAGE_SIZE),
            &mut lookup,
        )?;
        if snapshot_page_size == 0 || snapshot_page_size > u64::from(MAX_SNAPSHOT_PAGE_SIZE) {
            return Err(ConfigError::InvalidValue {
                key: "CHAT_SNAPSHOT_PAGE_SIZE",
                value: snapshot_page_size.to_string(),
                reason: format!("must be within 1..={MAX_SNAPSHOT_PAGE_SIZE}"),
            });
        }

        let reconnect_base_ms = parse_u64_with_default(
            "CHAT_PUSH_RECONNECT_BASE_MS",
            DEFAULT_PUSH_RECONNECT_BASE_MS,
            &mut lookup,
        )?;
        let reconnect_max_ms = parse_u64_with_default(
            "CHAT_PUSH_RECONNECT_MAX_MS",
            DEFAULT_PUSH_RECONNECT_MAX_MS,
            &mut lookup,
        )?;
        if reconnect_max_ms < reconnect_base_ms {
            return Err(ConfigError::InvalidValue {
                key: "CHAT_PUSH_RECONNECT_MAX_MS",
                value: reconnect_max_ms.to_string(),
                reason: "must not be smaller than CHAT_PUSH_RECONNECT_BASE_MS".to_owned(),
            });
        }

        let keyring_service = optional_trimmed_env("CHAT_KEYRING_SERVICE", &mut lookup)
            .unwrap_or_else(|| DEFAULT_KEYRING_SERVICE.to_owned());

        Ok(Self {
            api_base_url,
            push_url,
            request_timeout: Duration::from_millis(request_timeout_ms),
            snapshot_page_size: snapshot_page_size as u32,
            push_reconnect_base: Duration::from_millis(reconnect_base_ms),
            push_reconnect_max: Duration::from_millis(reconnect_max_ms),
            keyring_service,
        })
    }
}

/// Errors produced while parsing client configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required {key}")]
    Missing { key: &'static str },
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_u64_with_default<F>(key: &'static str, default: u64, lookup: &mut F) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value
        .parse::<u64>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_api_url(raw: &str) -> Result<Url, ConfigError> {
    let mut url = Url::parse(raw).map_err(|err| ConfigError::InvalidValue {
        key: "CHAT_API_BASE_URL",
        value: raw.to_owned(),
        reason: err.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidValue {
            key: "CHAT_API_BASE_URL",
            value: raw.to_owned(),
            reason: "scheme must be http or https".to_owned(),
        });
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn parse_push_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|err| ConfigError::InvalidValue {
        key: "CHAT_PUSH_URL",
        value: raw.to_owned(),
        reason: err.to_string(),
    })?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(ConfigError::InvalidValue {
            key: "CHAT_PUSH_URL",
            value: raw.to_owned(),
            reason: "scheme must be ws or wss".to_owned(),
        });
    }
    Ok(url)
}

fn derive_push_url(api_base_url: &Url) -> Result<Url, ConfigError> {
    let scheme = if api_base_url.scheme() == "https" {
        "wss"
    } else {
        "ws"
    };
    let host = api_base_url.host_str().unwrap_or("localhost");
    let raw = match api_base_url.port() {
        Some(port) => format!("{scheme}://{host}:{port}/{DEFAULT_PUSH_PATH}"),
        None => format!("{scheme}://{host}/{DEFAULT_PUSH_PATH}"),
    };
    parse_push_url(&raw)
}
