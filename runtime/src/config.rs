//! Environment-based configuration for the outbox runtime.
//!
//! # Variables
//!
//! | Variable | Default | Meaning |
//! |---|---|---|
//! | `OUTBOX_POLL_INTERVAL_MS` | `1000` | time between batches |
//! | `OUTBOX_BATCH_SIZE` | `100` | messages per batch |
//! | `OUTBOX_MAX_RETRIES` | `5` | failed attempts before dead-lettering (`0` = first failure) |
//! | `OUTBOX_RETRY_BASE_MS` | `1000` | backoff after the first failure |
//! | `OUTBOX_RETRY_MAX_MS` | `60000` | backoff ceiling |
//! | `OUTBOX_CLAIM_LEASE_SECS` | `300` | claim lease |
//! | `OUTBOX_RETENTION_DAYS` | `7` | age at which published messages are purged |
//! | `OUTBOX_SWEEP_INTERVAL_SECS` | `3600` | time between retention sweeps |
//! | `OUTBOX_TRANSPORT` | `rabbitmq` | `rabbitmq`, `noop` or `in-process` |
//!
//! # Example
//!
//! ```no_run
//! use outbox_runtime::config::OutboxConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = OutboxConfig::from_env()?;
//! println!("Transport: {}", config.transport);
//! # Ok(())
//! # }
//! ```

use crate::processor::ProcessorConfig;
use crate::retention::{DEFAULT_RETENTION_DAYS, DEFAULT_SWEEP_INTERVAL};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable is set but cannot be parsed.
    #[error("Invalid value for {var}: {value:?} ({reason})")]
    InvalidValue {
        /// Variable name.
        var: String,
        /// Raw value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Unknown transport name.
    #[error("Invalid transport: {0} (expected rabbitmq, noop or in-process)")]
    InvalidTransport(String),

    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Which [`Publisher`](outbox_core::publisher::Publisher) the composition root builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// RabbitMQ topic exchange.
    #[default]
    RabbitMq,
    /// Accept and discard. Provides no delivery.
    Noop,
    /// Dispatch into the local consumer registry.
    InProcess,
}

impl FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "rabbitmq" | "amqp" | "broker" => Ok(Self::RabbitMq),
            "noop" | "none" => Ok(Self::Noop),
            "in-process" | "inprocess" | "local" => Ok(Self::InProcess),
            _ => Err(ConfigError::InvalidTransport(s.to_string())),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RabbitMq => write!(f, "rabbitmq"),
            Self::Noop => write!(f, "noop"),
            Self::InProcess => write!(f, "in-process"),
        }
    }
}

/// Runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxConfig {
    /// Processor settings.
    pub processor: ProcessorConfig,
    /// Retention window in days.
    pub retention_days: u32,
    /// Time between retention sweeps.
    pub sweep_interval: Duration,
    /// Transport selection.
    pub transport: TransportKind,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            processor: ProcessorConfig::default(),
            retention_days: DEFAULT_RETENTION_DAYS,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            transport: TransportKind::default(),
        }
    }
}

impl OutboxConfig {
    /// Load from the process environment.
    ///
    /// # Errors
    ///
    /// Returns error if a variable cannot be parsed or the result fails validation
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load using `lookup` in place of the process environment.
    ///
    /// # Errors
    ///
    /// Returns error if a variable cannot be parsed or the result fails validation
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let p = defaults.processor;

        let processor = ProcessorConfig {
            poll_interval: millis(&lookup, "OUTBOX_POLL_INTERVAL_MS", p.poll_interval)?,
            batch_size: parse(&lookup, "OUTBOX_BATCH_SIZE", p.batch_size)?,
            max_retries: parse(&lookup, "OUTBOX_MAX_RETRIES", p.max_retries)?,
            retry_base: millis(&lookup, "OUTBOX_RETRY_BASE_MS", p.retry_base)?,
            retry_max: millis(&lookup, "OUTBOX_RETRY_MAX_MS", p.retry_max)?,
            claim_lease: secs(&lookup, "OUTBOX_CLAIM_LEASE_SECS", p.claim_lease)?,
        };

        let transport = match lookup("OUTBOX_TRANSPORT") {
            Some(raw) => raw.parse()?,
            None => defaults.transport,
        };

        let config = Self {
            processor,
            retention_days: parse(&lookup, "OUTBOX_RETENTION_DAYS", defaults.retention_days)?,
            sweep_interval: secs(&lookup, "OUTBOX_SWEEP_INTERVAL_SECS", defaults.sweep_interval)?,
            transport,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.processor.poll_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "poll_interval must be > 0".to_string(),
            ));
        }
        if self.processor.batch_size == 0 {
            return Err(ConfigError::ValidationError("batch_size must be > 0".to_string()));
        }
        if self.processor.claim_lease.is_zero() {
            return Err(ConfigError::ValidationError("claim_lease must be > 0".to_string()));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "sweep_interval must be > 0".to_string(),
            ));
        }
        if self.processor.max_retries == 0 {
            tracing::warn!("OUTBOX_MAX_RETRIES=0: every failed message is dead-lettered immediately");
        }
        if self.transport == TransportKind::Noop {
            tracing::warn!("Noop transport selected: outbox messages will be discarded");
        }
        Ok(())
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, var: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(var) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            var: var.to_string(),
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let ms = parse(lookup, var, u64::try_from(default.as_millis()).unwrap_or(u64::MAX))?;
    Ok(Duration::from_millis(ms))
}

fn secs(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(parse(lookup, var, default.as_secs())?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = OutboxConfig::from_lookup(lookup(&[]));
        assert_eq!(config, Ok(OutboxConfig::default()));
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn test_reads_every_variable() {
        let config = OutboxConfig::from_lookup(lookup(&[
            ("OUTBOX_POLL_INTERVAL_MS", "250"),
            ("OUTBOX_BATCH_SIZE", "20"),
            ("OUTBOX_MAX_RETRIES", "0"),
            ("OUTBOX_RETRY_BASE_MS", "500"),
            ("OUTBOX_RETRY_MAX_MS", "8000"),
            ("OUTBOX_CLAIM_LEASE_SECS", "30"),
            ("OUTBOX_RETENTION_DAYS", "14"),
            ("OUTBOX_SWEEP_INTERVAL_SECS", "60"),
            ("OUTBOX_TRANSPORT", "in-process"),
        ]));

        let config = config.expect("configuration should parse");
        assert_eq!(config.processor.poll_interval, Duration::from_millis(250));
        assert_eq!(config.processor.batch_size, 20);
        assert_eq!(config.processor.max_retries, 0);
        assert_eq!(config.processor.backoff().base(), Duration::from_millis(500));
        assert_eq!(config.processor.backoff().ceiling(), Duration::from_secs(8));
        assert_eq!(config.processor.claim_lease, Duration::from_secs(30));
        assert_eq!(config.retention_days, 14);
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.transport, TransportKind::InProcess);
    }

    #[test]
    fn test_rejects_garbage() {
        let result = OutboxConfig::from_lookup(lookup(&[("OUTBOX_BATCH_SIZE", "lots")]));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref var, .. }) if var == "OUTBOX_BATCH_SIZE"
        ));

        let result = OutboxConfig::from_lookup(lookup(&[("OUTBOX_TRANSPORT", "carrier-pigeon")]));
        assert_eq!(
            result,
            Err(ConfigError::InvalidTransport("carrier-pigeon".to_string()))
        );
    }

    #[test]
    fn test_validation_rejects_zero_batch() {
        let result = OutboxConfig::from_lookup(lookup(&[("OUTBOX_BATCH_SIZE", "0")]));
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_transport_names() {
        assert_eq!("RabbitMQ".parse(), Ok(TransportKind::RabbitMq));
        assert_eq!("noop".parse(), Ok(TransportKind::Noop));
        assert_eq!(TransportKind::InProcess.to_string(), "in-process");
    }
}
