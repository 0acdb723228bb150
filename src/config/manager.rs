//! Configuration Manager

use super::{Config, TransportConfig};
use crate::Result;
use anyhow::{bail, Context};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "LINEWIRE_";

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!(
                "Configuration file not found at {}, using defaults",
                path.display()
            );
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn load_from_env() -> Result<Config> {
        Self::load_from_vars(|name| std::env::var(format!("{}{}", ENV_PREFIX, name)).ok())
    }

    /// Apply overrides from a lookup keyed by the variable name without prefix
    pub fn load_from_vars<F>(lookup: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(value) = lookup("USE_WORKER_THREAD_GROUP") {
            config.transport.use_worker_thread_group = value
                .parse::<bool>()
                .with_context(|| format!("Invalid {}USE_WORKER_THREAD_GROUP: {}", ENV_PREFIX, value))?;
        }

        if let Some(value) = lookup("CONNECT_TIMEOUT") {
            config.transport.connect_timeout = humantime::parse_duration(&value)
                .with_context(|| format!("Invalid {}CONNECT_TIMEOUT: {}", ENV_PREFIX, value))?;
        }

        if let Some(value) = lookup("REUSE_ADDRESS") {
            config.transport.reuse_address = value
                .parse::<bool>()
                .with_context(|| format!("Invalid {}REUSE_ADDRESS: {}", ENV_PREFIX, value))?;
        }

        if let Some(value) = lookup("KEEP_ALIVE") {
            config.transport.keep_alive = value
                .parse::<bool>()
                .with_context(|| format!("Invalid {}KEEP_ALIVE: {}", ENV_PREFIX, value))?;
        }

        if let Some(value) = lookup("LINGER") {
            config.transport.linger = if value == "disabled" {
                None
            } else {
                Some(
                    humantime::parse_duration(&value)
                        .with_context(|| format!("Invalid {}LINGER: {}", ENV_PREFIX, value))?,
                )
            };
        }

        if let Some(value) = lookup("RECEIVE_BUFFER_SIZE") {
            config.transport.receive_buffer_size = value
                .parse::<usize>()
                .with_context(|| format!("Invalid {}RECEIVE_BUFFER_SIZE: {}", ENV_PREFIX, value))?;
        }

        if let Some(value) = lookup("SEND_BUFFER_SIZE") {
            config.transport.send_buffer_size = value
                .parse::<usize>()
                .with_context(|| format!("Invalid {}SEND_BUFFER_SIZE: {}", ENV_PREFIX, value))?;
        }

        if let Some(value) = lookup("TCP_NO_DELAY") {
            config.transport.tcp_no_delay = value
                .parse::<bool>()
                .with_context(|| format!("Invalid {}TCP_NO_DELAY: {}", ENV_PREFIX, value))?;
        }

        if let Some(value) = lookup("BIND_ADDR") {
            config.server.bind_addr = value
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid {}BIND_ADDR: {}", ENV_PREFIX, value))?;
        }

        if let Some(value) = lookup("HOST") {
            config.client.host = value;
        }

        if let Some(value) = lookup("PORT") {
            config.client.port = value
                .parse::<u16>()
                .with_context(|| format!("Invalid {}PORT: {}", ENV_PREFIX, value))?;
        }

        if let Some(value) = lookup("LOG_LEVEL") {
            config.logging.log_level = value;
        }

        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.transport
            .validate()
            .with_context(|| "Transport configuration validation failed")?;

        if self.server.heartbeat_interval.is_zero() {
            bail!("server.heartbeat_interval must be greater than 0");
        }

        if self.client.host.is_empty() {
            bail!("client.host must not be empty");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.log_level.as_str()) {
            bail!(
                "logging.log_level must be one of: {}",
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(
        &mut self,
        host: Option<&str>,
        port: Option<u16>,
        connect_timeout: Option<u64>,
        inline: bool,
    ) {
        if let Some(host) = host {
            self.client.host = host.to_string();
            tracing::info!("CLI override: host set to {}", host);
        }

        if let Some(port) = port {
            self.server.bind_addr.set_port(port);
            self.client.port = port;
            tracing::info!("CLI override: port set to {}", port);
        }

        if let Some(timeout_secs) = connect_timeout {
            self.transport.connect_timeout = Duration::from_secs(timeout_secs);
            tracing::info!("CLI override: connect timeout set to {}s", timeout_secs);
        }

        if inline {
            self.transport.use_worker_thread_group = false;
            tracing::info!("CLI override: dedicated thread groups disabled");
        }
    }
}

impl TransportConfig {
    /// Checks run when a socket is about to be bound or connected.
    ///
    /// Builders never call this; a bad value only surfaces once the transport
    /// is actually used.
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout.is_zero() {
            bail!("connect_timeout must be greater than 0");
        }

        if self.receive_buffer_size == 0 {
            bail!("receive_buffer_size must be greater than 0");
        }

        if self.send_buffer_size == 0 {
            bail!("send_buffer_size must be greater than 0");
        }

        if let Some(linger) = self.linger {
            if linger.as_secs() > u64::from(u16::MAX) {
                bail!("linger cannot exceed {} seconds", u16::MAX);
            }
        }

        Ok(())
    }
}
