//! Configuration management for the messaging worker.
//!
//! Loads configuration from environment variables with sensible defaults.
//! Everything is read once at startup; nothing below looks at the process
//! environment afterwards.

use marketplace_events_core::routing::{DEFAULT_DESTINATION, RoutingOptions, TopicStrategy};
use marketplace_events_runtime::dead_letter::DEFAULT_DEAD_LETTER_SUFFIX;
use marketplace_events_runtime::policy::DeadLetterPolicyOptions;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while reading configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable is set to a value that cannot be used.
    #[error("Invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        /// Variable name
        key: &'static str,
        /// Offending value
        value: String,
        /// What is wrong with it
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, value: &str, reason: impl fmt::Display) -> Self {
        Self::Invalid {
            key,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Deployment environment the process runs in.
///
/// Parsing never fails: unknown names are kept as [`HostEnvironment::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum HostEnvironment {
    /// Automated tests
    Testing,
    /// Local development
    #[default]
    Development,
    /// Pre-production
    Staging,
    /// Production
    Production,
    /// Any other named environment
    Other(String),
}

impl HostEnvironment {
    /// Canonical name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Testing => "testing",
            Self::Development => "development",
            Self::Staging => "staging",
            Self::Production => "production",
            Self::Other(name) => name,
        }
    }
}

impl FromStr for HostEnvironment {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        Ok(match name.to_ascii_lowercase().as_str() {
            "test" | "testing" => Self::Testing,
            "dev" | "development" => Self::Development,
            "staging" => Self::Staging,
            "prod" | "production" => Self::Production,
            _ => Self::Other(name.to_string()),
        })
    }
}

impl From<String> for HostEnvironment {
    fn from(name: String) -> Self {
        match name.parse() {
            Ok(env) => env,
            Err(never) => match never {},
        }
    }
}

impl From<HostEnvironment> for String {
    fn from(env: HostEnvironment) -> Self {
        env.as_str().to_string()
    }
}

impl fmt::Display for HostEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Redis configuration (development broker)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,
}

/// Redpanda configuration (production broker)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedpandaConfig {
    /// Broker addresses (comma-separated)
    pub brokers: String,
    /// Consumer group shared by this service's instances
    pub consumer_group: Option<String>,
}

/// Messaging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagingConfig {
    /// Where the process runs; decides the transport
    pub environment: HostEnvironment,
    /// Topic routing
    pub routing: RoutingOptions,
    /// Retry and dead-letter policy
    pub retry: DeadLetterPolicyOptions,
    /// Suffix naming a queue's dead-letter destination
    pub dead_letter_suffix: String,
    /// Redis settings
    pub redis: RedisConfig,
    /// Redpanda settings
    pub redpanda: RedpandaConfig,
    /// `PostgreSQL` URL of the durable dead letter store, if any
    pub database_url: Option<String>,
    /// Prometheus scrape port
    pub metrics_port: u16,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            environment: HostEnvironment::default(),
            routing: RoutingOptions::default(),
            retry: DeadLetterPolicyOptions::default(),
            dead_letter_suffix: DEFAULT_DEAD_LETTER_SUFFIX.to_string(),
            redis: RedisConfig {
                url: "redis://127.0.0.1:6379".to_string(),
            },
            redpanda: RedpandaConfig {
                brokers: "localhost:9092".to_string(),
                consumer_group: None,
            },
            database_url: None,
            metrics_port: 9090,
        }
    }
}

impl MessagingConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable is set to an unusable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key/value source. Unset or blank keys
    /// take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a value is set but unusable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let defaults = Self::default();

        let environment = get("MARKETPLACE_ENVIRONMENT")
            .map_or(defaults.environment, HostEnvironment::from);

        let strategy = match get("MESSAGING_ROUTING_STRATEGY") {
            Some(value) => value
                .parse::<TopicStrategy>()
                .map_err(|e| ConfigError::invalid("MESSAGING_ROUTING_STRATEGY", &value, e))?,
            None => TopicStrategy::default(),
        };
        let routing = RoutingOptions {
            strategy,
            default_destination: get("MESSAGING_DEFAULT_DESTINATION")
                .map_or_else(|| DEFAULT_DESTINATION.to_string(), |value| value.trim().to_string()),
            domain_destinations: match get("MESSAGING_DOMAIN_DESTINATIONS") {
                Some(value) => parse_map(&value).map_err(|reason| {
                    ConfigError::invalid("MESSAGING_DOMAIN_DESTINATIONS", &value, reason)
                })?,
                None => BTreeMap::new(),
            },
        };

        let mut retry = DeadLetterPolicyOptions::builder();
        if let Some(value) = get("MESSAGING_RETRY_MAX_ATTEMPTS") {
            retry = retry.max_attempts(parse_number("MESSAGING_RETRY_MAX_ATTEMPTS", &value)?);
        }
        if let Some(value) = get("MESSAGING_RETRY_INITIAL_DELAY_MS") {
            retry = retry.initial_delay(parse_millis("MESSAGING_RETRY_INITIAL_DELAY_MS", &value)?);
        }
        if let Some(value) = get("MESSAGING_RETRY_MAX_DELAY_MS") {
            retry = retry.max_delay(parse_millis("MESSAGING_RETRY_MAX_DELAY_MS", &value)?);
        }
        if let Some(value) = get("MESSAGING_RETRY_MULTIPLIER") {
            let multiplier: f64 = parse_number("MESSAGING_RETRY_MULTIPLIER", &value)?;
            if !multiplier.is_finite() || multiplier < 1.0 {
                return Err(ConfigError::invalid(
                    "MESSAGING_RETRY_MULTIPLIER",
                    &value,
                    "must be a finite number >= 1",
                ));
            }
            retry = retry.multiplier(multiplier);
        }
        // Set-but-blank lists are kept as "empty", not "default".
        if let Some(value) = lookup("MESSAGING_NON_RETRYABLE_KINDS") {
            retry = retry.non_retryable_kinds(parse_list(&value));
        }
        if let Some(value) = lookup("MESSAGING_RETRYABLE_KINDS") {
            retry = retry.retryable_kinds(parse_list(&value));
        }

        let metrics_port = match get("METRICS_PORT") {
            Some(value) => parse_number("METRICS_PORT", &value)?,
            None => defaults.metrics_port,
        };

        Ok(Self {
            environment,
            routing,
            retry: retry.build(),
            dead_letter_suffix: get("MESSAGING_DEAD_LETTER_SUFFIX")
                .unwrap_or(defaults.dead_letter_suffix),
            redis: RedisConfig {
                url: get("REDIS_URL").unwrap_or(defaults.redis.url),
            },
            redpanda: RedpandaConfig {
                brokers: get("REDPANDA_BROKERS").unwrap_or(defaults.redpanda.brokers),
                consumer_group: get("REDPANDA_CONSUMER_GROUP"),
            },
            database_url: get("DATABASE_URL"),
            metrics_port,
        })
    }

    /// Every destination the routing can produce, default first.
    #[must_use]
    pub fn destinations(&self) -> Vec<String> {
        let mut destinations = vec![self.routing.default_destination.clone()];
        for destination in self.routing.domain_destinations.values() {
            if !destinations.contains(destination) {
                destinations.push(destination.clone());
            }
        }
        destinations
    }
}

/// Parse `a, b ,c` into a set. Blank items are skipped.
#[must_use]
pub fn parse_list(value: &str) -> BTreeSet<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(String::from)
        .collect()
}

/// Parse `users=users-events, jobs=jobs-events` into a map.
///
/// # Errors
///
/// Returns a description of the first malformed pair.
pub fn parse_map(value: &str) -> Result<BTreeMap<String, String>, String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, destination) = pair
                .split_once('=')
                .ok_or_else(|| format!("expected key=value, got '{pair}'"))?;
            let (key, destination) = (key.trim(), destination.trim());
            if key.is_empty() || destination.is_empty() {
                return Err(format!("empty key or value in '{pair}'"));
            }
            Ok((key.to_string(), destination.to_string()))
        })
        .collect()
}

/// Parse a millisecond count.
///
/// # Errors
///
/// Returns [`ConfigError::Invalid`] if `value` is not a non-negative integer.
pub fn parse_millis(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_number::<u64>(key, value).map(Duration::from_millis)
}

fn parse_number<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ConfigError::invalid(key, value, e))
}
