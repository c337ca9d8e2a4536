// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use span_processor::capture::{CaptureConfig, DEFAULT_CAPTURE_FILE_PREFIX};
use span_processor::processor::SpanProcessorConfig;
use span_processor::udp_server::UdpServerConfig;

use crate::error::ConfigError;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 6831;
const DEFAULT_NUM_PROCESSORS: usize = 50;
const DEFAULT_QUEUE_SIZE: usize = 1_000;
const DEFAULT_MAX_PACKET_SIZE: usize = 65_000;
const DEFAULT_BATCH_CHANNEL_SIZE: usize = 100;
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MAX_PENDING_CAPTURES: usize = 64;

/// Configuration for the span ingest agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Host to bind the UDP socket to
    pub host: String,
    /// UDP port span emitters send to
    pub port: u16,
    /// Number of workers draining the receive queue
    pub num_processors: usize,
    /// Maximum number of received buffers waiting for a worker
    pub max_queue_size: usize,
    /// Maximum datagram size
    pub max_packet_size: usize,
    /// Capacity of the channel between the handler and the batch consumer
    pub batch_channel_size: usize,
    /// Directory for rejected payloads, capture is disabled when unset
    pub capture_dir: Option<PathBuf>,
    pub capture_file_prefix: String,
    /// Captures written concurrently before further rejected payloads are skipped
    pub max_pending_captures: usize,
    /// Upper bound on graceful shutdown
    pub shutdown_timeout: Duration,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            num_processors: DEFAULT_NUM_PROCESSORS,
            max_queue_size: DEFAULT_QUEUE_SIZE,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            batch_channel_size: DEFAULT_BATCH_CHANNEL_SIZE,
            capture_dir: None,
            capture_file_prefix: DEFAULT_CAPTURE_FILE_PREFIX.to_string(),
            max_pending_captures: DEFAULT_MAX_PENDING_CAPTURES,
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Create configuration from `SPAN_INGEST_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            host: env::var("SPAN_INGEST_HOST").unwrap_or(defaults.host),
            port: parse_env("SPAN_INGEST_PORT", defaults.port)?,
            num_processors: parse_env("SPAN_INGEST_NUM_PROCESSORS", defaults.num_processors)?,
            max_queue_size: parse_env("SPAN_INGEST_QUEUE_SIZE", defaults.max_queue_size)?,
            max_packet_size: parse_env("SPAN_INGEST_MAX_PACKET_SIZE", defaults.max_packet_size)?,
            batch_channel_size: parse_env(
                "SPAN_INGEST_BATCH_CHANNEL_SIZE",
                defaults.batch_channel_size,
            )?,
            capture_dir: env::var("SPAN_INGEST_CAPTURE_DIR")
                .ok()
                .filter(|dir| !dir.trim().is_empty())
                .map(PathBuf::from),
            capture_file_prefix: env::var("SPAN_INGEST_CAPTURE_PREFIX")
                .unwrap_or(defaults.capture_file_prefix),
            max_pending_captures: parse_env(
                "SPAN_INGEST_MAX_PENDING_CAPTURES",
                defaults.max_pending_captures,
            )?,
            shutdown_timeout: Duration::from_secs(parse_env(
                "SPAN_INGEST_SHUTDOWN_TIMEOUT_SECS",
                DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            )?),
            log_level: env::var("SPAN_INGEST_LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or(defaults.log_level),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_processors == 0 {
            return Err(ConfigError::InvalidConfig(
                "number of processors must be greater than 0".to_string(),
            ));
        }
        if self.max_queue_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "queue size must be greater than 0".to_string(),
            ));
        }
        if self.max_packet_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "max packet size must be greater than 0".to_string(),
            ));
        }
        if self.batch_channel_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "batch channel size must be greater than 0".to_string(),
            ));
        }
        if self.capture_dir.is_some() && self.capture_file_prefix.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "capture file prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn udp_server_config(&self) -> UdpServerConfig {
        UdpServerConfig {
            host: self.host.clone(),
            port: self.port,
            max_packet_size: self.max_packet_size,
            max_queue_size: self.max_queue_size,
        }
    }

    pub fn processor_config(&self) -> SpanProcessorConfig {
        SpanProcessorConfig {
            name: "udp".to_string(),
            num_processors: self.num_processors,
            max_idle_codecs: None,
            capture: self.capture_dir.as_ref().map(|dir| {
                CaptureConfig::new(dir).with_file_prefix(self.capture_file_prefix.clone())
            }),
            max_pending_captures: self.max_pending_captures,
        }
    }
}

fn parse_env<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { var, value }),
        Err(_) => Ok(default),
    }
}
