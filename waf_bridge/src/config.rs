//! Bridge configuration.
//!
//! Sources, lowest precedence first:
//! 1. `BridgeConfig::default()` (engine limits, 4ms timeout, default obfuscation patterns)
//! 2. A JSON document (`BridgeConfig::from_json`), missing fields keep their defaults
//! 3. Environment variables (`BridgeConfig::from_env` / `apply_env`)

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::encoder::EncoderLimits;

pub const ENV_WAF_TIMEOUT: &str = "APPSEC_WAF_TIMEOUT";
pub const ENV_OBFUSCATION_KEY_REGEXP: &str = "APPSEC_OBFUSCATION_PARAMETER_KEY_REGEXP";
pub const ENV_OBFUSCATION_VALUE_REGEXP: &str = "APPSEC_OBFUSCATION_PARAMETER_VALUE_REGEXP";

pub const DEFAULT_WAF_TIMEOUT: Duration = Duration::from_millis(4);

pub const DEFAULT_KEY_REGEX: &str = r"(?i)(?:p(?:ass)?w(?:or)?d|pass(?:_?phrase)?|secret|(?:api_?|private_?|public_?)key)|token|consumer_?(?:id|key|secret)|sign(?:ed|ature)|bearer|authorization";

pub const DEFAULT_VALUE_REGEX: &str = r#"(?i)(?:p(?:ass)?w(?:or)?d|pass(?:_?phrase)?|secret|(?:api_?|private_?|public_?|access_?|secret_?)key(?:_?id)?|token|consumer_?(?:id|key|secret)|sign(?:ed|ature)?|auth(?:entication|orization)?)(?:\s*=[^;]|"\s*:\s*"[^"]+")|bearer\s+[a-z0-9\._\-]+|token:[a-z0-9]{13}|gh[opsu]_[0-9a-zA-Z]{36}|ey[I-L][\w=-]+\.ey[I-L][\w=-]+(?:\.[\w.+\/=-]+)?|[\-]{5}BEGIN[a-z\s]+PRIVATE\sKEY[\-]{5}[^\-]+[\-]{5}END[a-z\s]+PRIVATE\sKEY|ssh-rsa\s*[a-z0-9\/\.+]{100,}"#;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration document: {0}")]
    Parse(String),

    #[error("invalid duration '{value}' for {name}")]
    InvalidDuration { name: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Obfuscation patterns handed to the engine. An empty pattern disables
/// that side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObfuscatorConfig {
    pub key_regex: String,
    pub value_regex: String,
}

impl Default for ObfuscatorConfig {
    fn default() -> Self {
        Self {
            key_regex: DEFAULT_KEY_REGEX.to_string(),
            value_regex: DEFAULT_VALUE_REGEX.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Budgets for run-time encoding. Rulesets are always encoded unbounded.
    pub limits: EncoderLimits,

    /// Default per-run timeout, in microseconds when serialized.
    #[serde(with = "duration_micros")]
    pub timeout: Duration,

    pub obfuscator: ObfuscatorConfig,

    /// Render integers and floats as decimal strings.
    pub numbers_as_strings: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            limits: EncoderLimits::default(),
            timeout: DEFAULT_WAF_TIMEOUT,
            obfuscator: ObfuscatorConfig::default(),
            numbers_as_strings: true,
        }
    }
}

impl BridgeConfig {
    pub fn from_json(document: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig =
            serde_json::from_str(document).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Applies overrides looked up through `lookup`. Unset or empty
    /// variables leave the current value.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_WAF_TIMEOUT).filter(|v| !v.trim().is_empty()) {
            let Some(timeout) = parse_duration(&value) else {
                log::warn!("{} has invalid duration '{}'", ENV_WAF_TIMEOUT, value);
                return Err(ConfigError::InvalidDuration {
                    name: ENV_WAF_TIMEOUT,
                    value,
                });
            };
            self.timeout = timeout;
        }
        if let Some(value) = lookup(ENV_OBFUSCATION_KEY_REGEXP) {
            self.obfuscator.key_regex = value;
        }
        if let Some(value) = lookup(ENV_OBFUSCATION_VALUE_REGEXP) {
            self.obfuscator.value_regex = value;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout.is_zero() {
            return Err(ConfigError::Invalid("timeout must be positive".to_string()));
        }
        let limits = &self.limits;
        if limits.max_string_length == 0 || limits.max_array_length == 0 || limits.max_map_length == 0 {
            return Err(ConfigError::Invalid(
                "string, array and map limits must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parses `"5ms"`, `"250us"`, `"1.5s"` or a bare integer number of
/// microseconds.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim();
    if let Ok(micros) = input.parse::<u64>() {
        return Some(Duration::from_micros(micros));
    }

    let split = input.find(|c: char| c.is_ascii_alphabetic() || c == 'µ')?;
    let (number, unit) = input.split_at(split);
    let number: f64 = number.trim().parse().ok()?;
    if !number.is_finite() || number < 0.0 {
        return None;
    }

    let nanos_per_unit = match unit {
        "ns" => 1.0,
        "us" | "µs" => 1e3,
        "ms" => 1e6,
        "s" => 1e9,
        "m" => 6e10,
        _ => return None,
    };
    let nanos = (number * nanos_per_unit).round();
    if nanos >= u64::MAX as f64 {
        return None;
    }
    Some(Duration::from_nanos(nanos as u64))
}

mod duration_micros {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_micros())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let micros = u64::deserialize(deserializer)?;
        Ok(Duration::from_micros(micros))
    }
}
