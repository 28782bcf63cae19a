// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::constants::{
    DEFAULT_CHANNEL_CAPACITY, DEFAULT_HOST, DEFAULT_IDLE_INTERVAL, DEFAULT_MAX_BATCH_SIZE_BYTES,
    DEFAULT_PORT, DEFAULT_SUBMIT_TIMEOUT,
};
use crate::errors::RelayError;
use crate::event_hub::{ConnectionString, EventHubConfig};
use crate::handoff::ChannelCapacity;
use crate::relay::{BatchingSide, RelayOptions};
use crate::sink::RetryStrategy;

pub const ENV_CONNECTION_STRING: &str = "EVENT_HUB_CONN_STR";
pub const ENV_HUB_NAME: &str = "EVENT_HUB_NAME";
pub const ENV_HOST: &str = "RELAY_HOST";
pub const ENV_PORT: &str = "RELAY_PORT";
pub const ENV_LOG_LEVEL: &str = "RELAY_LOG_LEVEL";
pub const ENV_DEBUG: &str = "RELAY_DEBUG";
pub const ENV_CHANNEL_CAPACITY: &str = "RELAY_CHANNEL_CAPACITY";
pub const ENV_BATCHING: &str = "RELAY_BATCHING";
pub const ENV_IDLE_INTERVAL_SECS: &str = "RELAY_IDLE_INTERVAL_SECS";
pub const ENV_MAX_BATCH_BYTES: &str = "RELAY_MAX_BATCH_BYTES";
pub const ENV_SUBMIT_TIMEOUT_SECS: &str = "RELAY_SUBMIT_TIMEOUT_SECS";
pub const ENV_RETRY: &str = "RELAY_RETRY";
pub const ENV_HTTPS_PROXY: &str = "HTTPS_PROXY";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Runtime configuration of the relay. Read once at startup.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Event Hubs namespace credentials
    pub connection_string: ConnectionString,
    /// Hub to send to, when the connection string has no `EntityPath`
    pub hub_name: Option<String>,
    /// Address the UDP socket binds to
    pub host: String,
    pub port: u16,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
    pub channel_capacity: ChannelCapacity,
    pub batching: BatchingSide,
    pub idle_interval: Duration,
    /// Largest request body sent to the hub
    pub max_batch_size_bytes: usize,
    pub submit_timeout: Duration,
    pub retry: RetryStrategy,
    /// HTTPS proxy URL
    pub https_proxy: Option<String>,
}

impl RelayConfig {
    /// Configuration with every optional setting at its default.
    pub fn new(connection_string: ConnectionString) -> Self {
        Self {
            connection_string,
            hub_name: None,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            log_level: "warn".to_string(),
            channel_capacity: ChannelCapacity::Bounded(DEFAULT_CHANNEL_CAPACITY),
            batching: BatchingSide::default(),
            idle_interval: DEFAULT_IDLE_INTERVAL,
            max_batch_size_bytes: DEFAULT_MAX_BATCH_SIZE_BYTES,
            submit_timeout: DEFAULT_SUBMIT_TIMEOUT,
            retry: RetryStrategy::default(),
            https_proxy: None,
        }
    }

    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, RelayError> {
        Self::from_env_iter(env::vars())
    }

    /// Builds and validates the configuration from key/value pairs (typically for tests).
    pub fn from_env_iter<I, K, V>(iter: I) -> Result<Self, RelayError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: HashMap<String, String> = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let get = |key: &str| lookup(&map, key);

        let raw_connection_string = get(ENV_CONNECTION_STRING).ok_or_else(|| {
            RelayError::InvalidConfig(format!("{} must be set", ENV_CONNECTION_STRING))
        })?;
        let mut config = Self::new(ConnectionString::parse(raw_connection_string)?);

        config.hub_name = get(ENV_HUB_NAME).map(str::to_string);
        if let Some(host) = get(ENV_HOST) {
            config.host = host.to_string();
        }
        if let Some(port) = parse_var::<u16>(ENV_PORT, get(ENV_PORT))? {
            config.port = port;
        }
        let debug = get(ENV_DEBUG).is_some_and(|val| val.eq_ignore_ascii_case("true"));
        if debug {
            config.log_level = "debug".to_string();
        } else if let Some(level) = get(ENV_LOG_LEVEL) {
            config.log_level = level.to_lowercase();
        }
        if let Some(size) = parse_var::<usize>(ENV_CHANNEL_CAPACITY, get(ENV_CHANNEL_CAPACITY))? {
            config.channel_capacity = ChannelCapacity::from_size(size);
        }
        if let Some(batching) = get(ENV_BATCHING) {
            config.batching = batching.parse()?;
        }
        if let Some(secs) = parse_var::<u64>(ENV_IDLE_INTERVAL_SECS, get(ENV_IDLE_INTERVAL_SECS))? {
            config.idle_interval = Duration::from_secs(secs);
        }
        if let Some(bytes) = parse_var::<usize>(ENV_MAX_BATCH_BYTES, get(ENV_MAX_BATCH_BYTES))? {
            config.max_batch_size_bytes = bytes;
        }
        if let Some(secs) =
            parse_var::<u64>(ENV_SUBMIT_TIMEOUT_SECS, get(ENV_SUBMIT_TIMEOUT_SECS))?
        {
            config.submit_timeout = Duration::from_secs(secs);
        }
        if let Some(retry) = get(ENV_RETRY) {
            config.retry = retry.parse()?;
        }
        config.https_proxy = get(ENV_HTTPS_PROXY).map(str::to_string);

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.port == 0 {
            return Err(RelayError::InvalidConfig(
                "Relay port must be greater than 0".to_string(),
            ));
        }

        if self.host.trim().is_empty() {
            return Err(RelayError::InvalidConfig(format!(
                "{} cannot be empty",
                ENV_HOST
            )));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(RelayError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        if self.idle_interval.is_zero() {
            return Err(RelayError::InvalidConfig(
                "Idle interval must be greater than 0".to_string(),
            ));
        }

        if self.submit_timeout.is_zero() {
            return Err(RelayError::InvalidConfig(
                "Submit timeout must be greater than 0".to_string(),
            ));
        }

        if self.max_batch_size_bytes < 2 {
            return Err(RelayError::InvalidConfig(format!(
                "Maximum batch size of {} bytes is too small",
                self.max_batch_size_bytes
            )));
        }

        self.connection_string
            .resolve_hub(self.hub_name.as_deref())
            .map(|_| ())
    }

    pub fn event_hub_config(&self) -> Result<EventHubConfig, RelayError> {
        Ok(EventHubConfig {
            connection_string: self.connection_string.clone(),
            hub_name: self
                .connection_string
                .resolve_hub(self.hub_name.as_deref())?,
            max_batch_size_bytes: self.max_batch_size_bytes,
            timeout: self.submit_timeout,
            https_proxy: self.https_proxy.clone(),
            endpoint_override: None,
        })
    }

    #[must_use]
    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            batching: self.batching,
            channel_capacity: self.channel_capacity,
            idle_interval: self.idle_interval,
            linger: Some(self.idle_interval),
            retry: self.retry.clone(),
        }
    }
}

/// Blank values count as unset.
fn lookup<'a>(map: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    map.get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn parse_var<T: FromStr>(key: &str, value: Option<&str>) -> Result<Option<T>, RelayError> {
    value
        .map(|raw| {
            raw.parse::<T>().map_err(|_| {
                RelayError::InvalidConfig(format!("Invalid value '{}' for {}", raw, key))
            })
        })
        .transpose()
}
