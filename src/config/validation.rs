//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (watermarks ordered, grace period > 0, addresses parse)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: TransportConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::TransportConfig;

/// A single semantic problem, tagged with the offending field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Check every semantic constraint and collect all violations.
pub fn validate_config(config: &TransportConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let listener = &config.listener;
    if listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", listener.bind_address),
        ));
    }
    if listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be greater than 0"));
    }
    if listener.read_buffer_size == 0 {
        errors.push(ValidationError::new("listener.read_buffer_size", "must be greater than 0"));
    }
    if let Some(tls) = &listener.tls {
        if tls.cert_path.trim().is_empty() {
            errors.push(ValidationError::new("listener.tls.cert_path", "must not be empty"));
        }
        if tls.key_path.trim().is_empty() {
            errors.push(ValidationError::new("listener.tls.key_path", "must not be empty"));
        }
        if tls.handshake_timeout_ms == 0 {
            errors.push(ValidationError::new(
                "listener.tls.handshake_timeout_ms",
                "must be greater than 0",
            ));
        }
    }

    if let Err(err) = config.flow_control.watermarks() {
        errors.push(ValidationError::new("flow_control.low_watermark", err.to_string()));
    }

    let shutdown = &config.shutdown;
    if shutdown.grace_period_ms == 0 {
        errors.push(ValidationError::new("shutdown.grace_period_ms", "must be greater than 0"));
    }
    if !(1000..=4999).contains(&shutdown.close_status) {
        errors.push(ValidationError::new(
            "shutdown.close_status",
            format!("{} is outside 1000..=4999", shutdown.close_status),
        ));
    }

    let observability = &config.observability;
    if observability.metrics_enabled && observability.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", observability.metrics_address),
        ));
    }
    if observability.log_level.trim().is_empty() {
        errors.push(ValidationError::new("observability.log_level", "must not be empty"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::TlsConfig;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(validate_config(&TransportConfig::default()), Ok(()));
    }

    #[test]
    fn reports_every_violation() {
        let mut config = TransportConfig::default();
        config.listener.bind_address = "not an address".into();
        config.flow_control.high_watermark = 1024;
        config.flow_control.low_watermark = 4096;
        config.shutdown.grace_period_ms = 0;
        config.shutdown.close_status = 999;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec![
                "listener.bind_address",
                "flow_control.low_watermark",
                "shutdown.grace_period_ms",
                "shutdown.close_status",
            ]
        );
    }

    #[test]
    fn equal_watermarks_are_rejected() {
        let mut config = TransportConfig::default();
        config.flow_control.high_watermark = 100;
        config.flow_control.low_watermark = 100;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn tls_section_is_checked_when_present() {
        let mut config = TransportConfig::default();
        config.listener.tls = Some(TlsConfig {
            cert_path: String::new(),
            key_path: "key.pem".into(),
            alpn_protocols: Vec::new(),
            handshake_timeout_ms: 0,
        });
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].to_string(), "listener.tls.cert_path: must not be empty");
    }

    #[test]
    fn metrics_address_only_matters_when_enabled() {
        let mut config = TransportConfig::default();
        config.observability.metrics_address = "nope".into();
        assert!(validate_config(&config).is_ok());
        config.observability.metrics_enabled = true;
        assert!(validate_config(&config).is_err());
    }
}
