//! # Sampler Configuration
//!
//! Every option a sampler understands lives in [`SamplerConfig`]. A config is
//! built either from the flat key/value parameters a test host hands over
//! (`HOST`, `TOPIC`, `AGGREGATE`, ...) via [`SamplerConfig::from_params`], or
//! deserialized from the `[sampler]` table of a TOML test plan, where the same
//! upper-case keys are used. Both paths end in [`SamplerConfig::validate`].

use crate::error::LoadTestError;
use serde::de::{self, Deserializer};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "tcp://localhost:1883";
pub const DEFAULT_TOPIC: &str = "TEST.MQTT";
pub const DEFAULT_AGGREGATE: u64 = 100;
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_SAMPLER_TIMEOUT_MS: u64 = 30000;
pub const DEFAULT_SUFFIX_LENGTH: usize = 6;
pub const DEFAULT_PUBLISHER_THROTTLE_MS: u64 = 100;

/// Target message count of a subscribe sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Limited(u64),
    Unlimited,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AggregateRepr {
    Count(i64),
    Text(String),
}

impl<'de> Deserialize<'de> for Aggregate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match AggregateRepr::deserialize(deserializer)? {
            AggregateRepr::Count(n) if n <= 0 => Ok(Aggregate::Unlimited),
            AggregateRepr::Count(n) => Ok(Aggregate::Limited(n as u64)),
            AggregateRepr::Text(s) => Aggregate::parse(&s).map_err(de::Error::custom),
        }
    }
}

impl Aggregate {
    /// Parses `""`, `"unlimited"` or a non-positive number as unlimited
    pub fn parse(value: &str) -> Result<Self, LoadTestError> {
        let value = value.trim();
        if value.is_empty() || value.eq_ignore_ascii_case("unlimited") {
            return Ok(Aggregate::Unlimited);
        }
        let n: i64 = value
            .parse()
            .map_err(|_| LoadTestError::Config(format!("invalid AGGREGATE: {}", value)))?;
        if n <= 0 {
            Ok(Aggregate::Unlimited)
        } else {
            Ok(Aggregate::Limited(n as u64))
        }
    }

    pub fn target(&self) -> Option<u64> {
        match self {
            Aggregate::Limited(n) => Some(*n),
            Aggregate::Unlimited => None,
        }
    }
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregate::Limited(n) => write!(f, "{}", n),
            Aggregate::Unlimited => write!(f, "unlimited"),
        }
    }
}

/// MQTT delivery guarantee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "u8")]
pub enum QosLevel {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for QosLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QosLevel::AtMostOnce),
            1 => Ok(QosLevel::AtLeastOnce),
            2 => Ok(QosLevel::ExactlyOnce),
            other => Err(format!("invalid MAXQOS: {}", other)),
        }
    }
}

impl QosLevel {
    pub fn as_u8(&self) -> u8 {
        match self {
            QosLevel::AtMostOnce => 0,
            QosLevel::AtLeastOnce => 1,
            QosLevel::ExactlyOnce => 2,
        }
    }
}

/// Distribution of publishes over several topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Strategy {
    #[default]
    RoundRobin,
    Random,
}

impl Strategy {
    pub fn parse(value: &str) -> Result<Self, LoadTestError> {
        match value.trim().to_ascii_uppercase().as_str() {
            "" | "ROUND_ROBIN" => Ok(Strategy::RoundRobin),
            "RANDOM" => Ok(Strategy::Random),
            other => Err(LoadTestError::Config(format!("invalid STRATEGY: {}", other))),
        }
    }
}

/// Complete configuration of one sampler
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    #[serde(rename = "SAMPLER_NAME")]
    pub label: String,
    #[serde(rename = "HOST")]
    pub host: String,
    #[serde(rename = "CLIENT_ID")]
    pub client_id: String,
    /// Comma separated topic list as configured
    #[serde(rename = "TOPIC")]
    pub topic: String,
    #[serde(rename = "AGGREGATE")]
    pub aggregate: Aggregate,
    #[serde(rename = "CLEAN_SESSION")]
    pub clean_session: bool,
    /// Keep-alive interval in seconds
    #[serde(rename = "KEEPALIVE")]
    pub keep_alive_secs: u64,
    #[serde(rename = "CONNECTION_TIMEOUT")]
    pub connection_timeout_ms: u64,
    #[serde(rename = "SAMPLER_TIMEOUT")]
    pub sampler_timeout_ms: u64,
    #[serde(rename = "MAXQOS")]
    pub qos: QosLevel,
    /// Send `USER`/`PASSWORD` with the CONNECT; off ignores both
    #[serde(rename = "AUTH")]
    pub auth: bool,
    #[serde(rename = "USER")]
    pub user: Option<String>,
    #[serde(rename = "PASSWORD")]
    pub password: Option<String>,
    #[serde(rename = "RANDOM_SUFFIX")]
    pub random_suffix: bool,
    #[serde(rename = "SUFFIX_LENGTH")]
    pub suffix_length: usize,
    #[serde(rename = "STRATEGY")]
    pub strategy: Strategy,
    #[serde(rename = "MESSAGE")]
    pub message: String,
    /// Number of messages a publish sample sends
    #[serde(rename = "ITERATIONS")]
    pub iterations: u64,
    #[serde(rename = "PUBLISHER_THROTTLE")]
    pub publisher_throttle_ms: u64,
    #[serde(rename = "RETAIN")]
    pub retain: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            label: "MQTT Sampler".to_string(),
            host: DEFAULT_HOST.to_string(),
            client_id: "mqtt-loadtest".to_string(),
            topic: DEFAULT_TOPIC.to_string(),
            aggregate: Aggregate::Limited(DEFAULT_AGGREGATE),
            clean_session: false,
            keep_alive_secs: 0,
            connection_timeout_ms: DEFAULT_CONNECTION_TIMEOUT_MS,
            sampler_timeout_ms: DEFAULT_SAMPLER_TIMEOUT_MS,
            qos: QosLevel::AtMostOnce,
            auth: true,
            user: None,
            password: None,
            random_suffix: false,
            suffix_length: DEFAULT_SUFFIX_LENGTH,
            strategy: Strategy::RoundRobin,
            message: "test message".to_string(),
            iterations: 1,
            publisher_throttle_ms: DEFAULT_PUBLISHER_THROTTLE_MS,
            retain: false,
        }
    }
}

impl SamplerConfig {
    /// Builds a config from flat host parameters; unknown keys are ignored
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self, LoadTestError> {
        let mut config = Self::default();
        config.apply_params(params)?;
        Ok(config)
    }

    /// Overlays flat parameters on top of the current values
    pub fn apply_params(&mut self, params: &HashMap<String, String>) -> Result<(), LoadTestError> {
        for (key, value) in params {
            match key.as_str() {
                "SAMPLER_NAME" => self.label = value.clone(),
                "HOST" => self.host = value.trim().to_string(),
                "CLIENT_ID" => self.client_id = value.clone(),
                "TOPIC" => self.topic = value.clone(),
                "AGGREGATE" => self.aggregate = Aggregate::parse(value)?,
                "CLEAN_SESSION" => self.clean_session = parse_bool(value),
                "KEEPALIVE" => self.keep_alive_secs = parse_number(key, value)?,
                "CONNECTION_TIMEOUT" => self.connection_timeout_ms = parse_number(key, value)?,
                "SAMPLER_TIMEOUT" => self.sampler_timeout_ms = parse_number(key, value)?,
                "MAXQOS" => {
                    let level: u8 = parse_number(key, value)?;
                    self.qos = QosLevel::try_from(level).map_err(LoadTestError::Config)?;
                }
                "AUTH" => self.auth = parse_bool(value),
                "USER" => self.user = non_empty(value),
                "PASSWORD" => self.password = non_empty(value),
                "RANDOM_SUFFIX" => self.random_suffix = parse_bool(value),
                "SUFFIX_LENGTH" => self.suffix_length = parse_number(key, value)?,
                "STRATEGY" => self.strategy = Strategy::parse(value)?,
                "MESSAGE" => self.message = value.clone(),
                "ITERATIONS" => self.iterations = parse_number(key, value)?,
                "PUBLISHER_THROTTLE" => self.publisher_throttle_ms = parse_number(key, value)?,
                "RETAIN" => self.retain = parse_bool(value),
                _ => {}
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), LoadTestError> {
        if self.host.trim().is_empty() {
            return Err(LoadTestError::Config("HOST must not be empty".to_string()));
        }
        if self.client_id.is_empty() && !(self.random_suffix && self.suffix_length > 0) {
            return Err(LoadTestError::Config(
                "CLIENT_ID must not be empty without a RANDOM_SUFFIX of positive SUFFIX_LENGTH"
                    .to_string(),
            ));
        }
        if self.client_id.starts_with(' ') {
            return Err(LoadTestError::Config(
                "CLIENT_ID must not start with a space".to_string(),
            ));
        }
        if self.topics().is_empty() {
            return Err(LoadTestError::Config(
                "TOPIC must name at least one topic".to_string(),
            ));
        }
        if self.connection_timeout_ms == 0 {
            return Err(LoadTestError::Config(
                "CONNECTION_TIMEOUT must be positive".to_string(),
            ));
        }
        if self.sampler_timeout_ms == 0 {
            return Err(LoadTestError::Config(
                "SAMPLER_TIMEOUT must be positive".to_string(),
            ));
        }
        if self.password.is_some() && self.user.is_none() {
            return Err(LoadTestError::Config(
                "PASSWORD given without USER".to_string(),
            ));
        }
        Ok(())
    }

    /// Topic list split on commas with surrounding whitespace removed
    pub fn topics(&self) -> Vec<String> {
        self.topic
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn sampler_timeout(&self) -> Duration {
        Duration::from_millis(self.sampler_timeout_ms)
    }

    pub fn publisher_throttle(&self) -> Duration {
        Duration::from_millis(self.publisher_throttle_ms)
    }
}

fn parse_bool(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, LoadTestError> {
    value
        .trim()
        .parse()
        .map_err(|_| LoadTestError::Config(format!("invalid {}: {}", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_are_valid() {
        let config = SamplerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.aggregate, Aggregate::Limited(100));
        assert_eq!(config.sampler_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn flat_params_override_defaults() {
        let config = SamplerConfig::from_params(&params(&[
            ("HOST", "tcp://broker:1884"),
            ("TOPIC", "a/b , c/d,,"),
            ("AGGREGATE", "5"),
            ("CLEAN_SESSION", "TRUE"),
            ("MAXQOS", "2"),
            ("STRATEGY", "random"),
            ("USER", "alice"),
            ("PASSWORD", "secret"),
            ("UNRELATED", "ignored"),
        ]))
        .unwrap();

        assert_eq!(config.host, "tcp://broker:1884");
        assert_eq!(config.topics(), vec!["a/b".to_string(), "c/d".to_string()]);
        assert_eq!(config.aggregate.target(), Some(5));
        assert!(config.clean_session);
        assert_eq!(config.qos, QosLevel::ExactlyOnce);
        assert_eq!(config.strategy, Strategy::Random);
        assert_eq!(config.user.as_deref(), Some("alice"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn aggregate_accepts_unlimited_forms() {
        assert_eq!(Aggregate::parse("").unwrap(), Aggregate::Unlimited);
        assert_eq!(Aggregate::parse("Unlimited").unwrap(), Aggregate::Unlimited);
        assert_eq!(Aggregate::parse("-1").unwrap(), Aggregate::Unlimited);
        assert!(Aggregate::parse("many").is_err());
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(SamplerConfig::from_params(&params(&[("MAXQOS", "3")])).is_err());
        assert!(SamplerConfig::from_params(&params(&[("KEEPALIVE", "ten")])).is_err());

        let empty_topic = SamplerConfig::from_params(&params(&[("TOPIC", " , ")])).unwrap();
        assert!(matches!(
            empty_topic.validate(),
            Err(LoadTestError::Config(_))
        ));

        let no_timeout =
            SamplerConfig::from_params(&params(&[("SAMPLER_TIMEOUT", "0")])).unwrap();
        assert!(no_timeout.validate().is_err());
    }

    #[test]
    fn client_id_must_resolve_to_something() {
        let empty_suffix = SamplerConfig::from_params(&params(&[
            ("CLIENT_ID", ""),
            ("RANDOM_SUFFIX", "true"),
            ("SUFFIX_LENGTH", "0"),
        ]))
        .unwrap();
        assert!(matches!(
            empty_suffix.validate(),
            Err(LoadTestError::Config(_))
        ));

        let suffix_only = SamplerConfig::from_params(&params(&[
            ("CLIENT_ID", ""),
            ("RANDOM_SUFFIX", "true"),
            ("SUFFIX_LENGTH", "4"),
        ]))
        .unwrap();
        assert!(suffix_only.validate().is_ok());

        let padded = SamplerConfig::from_params(&params(&[("CLIENT_ID", " sub")])).unwrap();
        assert!(padded.validate().is_err());
    }

    #[test]
    fn auth_off_drops_credentials() {
        let config = SamplerConfig::from_params(&params(&[
            ("AUTH", "FALSE"),
            ("USER", "alice"),
            ("PASSWORD", "secret"),
        ]))
        .unwrap();
        assert!(!config.auth);
        assert!(config.validate().is_ok());

        let options = crate::mqtt::options::ConnectOptions::from_config(&config, "c1");
        assert!(options.credentials.is_none());

        let with_auth = SamplerConfig {
            auth: true,
            ..config
        };
        let options = crate::mqtt::options::ConnectOptions::from_config(&with_auth, "c1");
        assert_eq!(
            options.credentials,
            Some(("alice".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn toml_uses_the_same_keys() {
        let config: SamplerConfig = toml::from_str(
            r#"
            HOST = "ws://localhost:8080/mqtt"
            TOPIC = "sensors/+"
            AGGREGATE = "unlimited"
            MAXQOS = 1
            STRATEGY = "RANDOM"
            "#,
        )
        .unwrap();

        assert_eq!(config.host, "ws://localhost:8080/mqtt");
        assert_eq!(config.aggregate, Aggregate::Unlimited);
        assert_eq!(config.qos, QosLevel::AtLeastOnce);
        assert_eq!(config.strategy, Strategy::Random);
        assert_eq!(config.connection_timeout_ms, DEFAULT_CONNECTION_TIMEOUT_MS);
    }
}
