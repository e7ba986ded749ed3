// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Connection Configuration
//!
//! Credentials and startup settings for the integration. Configs can be read
//! from a YAML file (`rabbitmq.yaml` by convention) or from `RABBITMQ_*`
//! environment variables, optionally seeded from a `.env` file.

use crate::errors::AmqpError;
use serde::Deserialize;
use std::{fs, path::Path, time::Duration};
use tracing::{debug, error};
use url::Url;

/// Conventional name of the configuration file.
pub const CONFIG_FILE: &str = "rabbitmq.yaml";
/// Directory scanned for topology descriptor files when none is configured.
pub const DEFAULT_MIGRATIONS_DIR: &str = "./migrations/rabbitmq";

pub const ENV_HOST: &str = "RABBITMQ_HOST";
pub const ENV_PORT: &str = "RABBITMQ_PORT";
pub const ENV_USER: &str = "RABBITMQ_USER";
pub const ENV_PASSWORD: &str = "RABBITMQ_PASSWORD";
pub const ENV_VHOST: &str = "RABBITMQ_VHOST";
pub const ENV_MIGRATIONS_DIR: &str = "RABBITMQ_MIGRATIONS_DIR";
pub const ENV_APP_NAME: &str = "APP_NAME";

/// How many times a broker connection is dialed before giving up.
///
/// `Never` keeps the first dial failure fatal. `Fixed` retries a bounded
/// number of times with a constant pause between attempts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReconnectPolicy {
    #[default]
    Never,
    Fixed { max_attempts: u32, interval_ms: u64 },
}

impl ReconnectPolicy {
    /// Total number of dial attempts, the first one included.
    pub fn attempts(&self) -> u32 {
        match self {
            ReconnectPolicy::Never => 1,
            ReconnectPolicy::Fixed { max_attempts, .. } => (*max_attempts).max(1),
        }
    }

    pub fn interval(&self) -> Duration {
        match self {
            ReconnectPolicy::Never => Duration::ZERO,
            ReconnectPolicy::Fixed { interval_ms, .. } => Duration::from_millis(*interval_ms),
        }
    }
}

/// Broker credentials plus the settings the service needs at start.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Announced to the broker as the connection name.
    pub app_name: String,
    pub migrations_dir: String,
    pub reconnect: ReconnectPolicy,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            app_name: "rabbitmq-infra".to_owned(),
            migrations_dir: DEFAULT_MIGRATIONS_DIR.to_owned(),
            reconnect: ReconnectPolicy::Never,
        }
    }
}

impl RabbitMQConfigs {
    /// Reads the configs from a YAML file. Missing keys keep their defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<RabbitMQConfigs, AmqpError> {
        let path = path.as_ref();
        debug!("loading rabbitmq configs from {}", path.display());

        let raw = fs::read_to_string(path).map_err(|err| {
            error!(error = err.to_string(), "failure to read config file");
            AmqpError::ConfigLoadError(path.display().to_string(), err.to_string())
        })?;

        Self::from_yaml_str(&raw)
            .map_err(|err| AmqpError::ConfigLoadError(path.display().to_string(), err))
    }

    pub fn from_yaml_str(raw: &str) -> Result<RabbitMQConfigs, String> {
        serde_yaml::from_str(raw).map_err(|err| {
            error!(error = err.to_string(), "failure to decode config file");
            err.to_string()
        })
    }

    /// Reads the configs from the process environment after loading `.env`.
    pub fn from_env() -> Result<RabbitMQConfigs, AmqpError> {
        if let Err(err) = dotenvy::dotenv() {
            debug!(error = err.to_string(), "no .env file loaded");
        }

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds configs from an arbitrary variable source, keeping defaults
    /// for every variable the source does not provide.
    pub fn from_lookup<F>(lookup: F) -> Result<RabbitMQConfigs, AmqpError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = RabbitMQConfigs::default();

        if let Some(host) = lookup(ENV_HOST) {
            cfg.host = host;
        }
        if let Some(port) = lookup(ENV_PORT) {
            cfg.port = port.parse().map_err(|_| {
                AmqpError::ConfigLoadError(ENV_PORT.to_owned(), format!("invalid port `{port}`"))
            })?;
        }
        if let Some(user) = lookup(ENV_USER) {
            cfg.user = user;
        }
        if let Some(password) = lookup(ENV_PASSWORD) {
            cfg.password = password;
        }
        if let Some(vhost) = lookup(ENV_VHOST) {
            cfg.vhost = vhost;
        }
        if let Some(dir) = lookup(ENV_MIGRATIONS_DIR) {
            cfg.migrations_dir = dir;
        }
        if let Some(name) = lookup(ENV_APP_NAME) {
            cfg.app_name = name;
        }

        Ok(cfg)
    }

    /// Builds the `amqp://` URI used to dial the broker.
    ///
    /// Credentials and the virtual host are percent-encoded, so the default
    /// vhost `/` becomes `%2F`.
    pub fn amqp_uri(&self) -> Result<String, AmqpError> {
        let invalid = |err: String| AmqpError::ConfigLoadError("amqp uri".to_owned(), err);

        let mut uri = Url::parse(&format!("amqp://{}:{}/", self.host, self.port))
            .map_err(|err| invalid(err.to_string()))?;
        uri.set_username(&self.user)
            .map_err(|_| invalid("invalid user".to_owned()))?;
        uri.set_password(Some(&self.password))
            .map_err(|_| invalid("invalid password".to_owned()))?;

        // a single path segment; `/` and spaces are percent-encoded
        uri.path_segments_mut()
            .map_err(|_| invalid("uri cannot carry a vhost".to_owned()))?
            .pop_if_empty()
            .push(&self.vhost);

        Ok(uri.to_string())
    }
}
