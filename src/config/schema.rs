//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the transport server.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transport::flow::{WatermarkError, Watermarks, DEFAULT_HIGH_WATERMARK, DEFAULT_LOW_WATERMARK};
use crate::transport::protocol::CLOSE_GOING_AWAY;
use crate::transport::stream::{TransportOptions, DEFAULT_READ_BUFFER_SIZE};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TransportConfig {
    /// Listener configuration (bind address, TLS).
    pub listener: ListenerConfig,

    /// Write-side backpressure thresholds.
    pub flow_control: FlowControlConfig,

    /// Graceful shutdown behavior.
    pub shutdown: ShutdownConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl TransportConfig {
    /// Per-connection options derived from this config.
    pub fn transport_options(&self) -> Result<TransportOptions, WatermarkError> {
        Ok(TransportOptions {
            watermarks: self.flow_control.watermarks()?,
            read_buffer_size: self.listener.read_buffer_size,
        })
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,

    /// Disable Nagle's algorithm on accepted sockets.
    pub nodelay: bool,

    /// Bytes requested per socket read.
    pub read_buffer_size: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
            tls: None,
            max_connections: 10_000,
            nodelay: true,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate chain file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,

    /// ALPN protocols offered, in preference order.
    #[serde(default)]
    pub alpn_protocols: Vec<String>,

    /// Handshake deadline in milliseconds.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

impl TlsConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

/// Write-side flow control thresholds, in bytes.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FlowControlConfig {
    /// Pause the producer when pending bytes exceed this.
    pub high_watermark: usize,

    /// Resume the producer when pending bytes drop to this.
    pub low_watermark: usize,
}

impl FlowControlConfig {
    pub fn watermarks(&self) -> Result<Watermarks, WatermarkError> {
        Watermarks::new(self.high_watermark, self.low_watermark)
    }
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            high_watermark: DEFAULT_HIGH_WATERMARK,
            low_watermark: DEFAULT_LOW_WATERMARK,
        }
    }
}

/// Graceful shutdown configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Time connections get to finish after the shutdown notice, in milliseconds.
    pub grace_period_ms: u64,

    /// Status code carried by the shutdown notice.
    pub close_status: u16,

    /// Human-readable reason carried by the shutdown notice.
    pub close_reason: String,
}

impl ShutdownConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 100,
            close_status: CLOSE_GOING_AWAY,
            close_reason: "Server shutdown".to_string(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output for development.
    #[default]
    Pretty,
    /// One JSON object per event, for log shippers.
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive.
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
