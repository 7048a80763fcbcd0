//! Redaction of sensitive values in match events.

use regex::{Regex, RegexBuilder};

use crate::error::InitError;

/// Replacement for redacted values and highlights.
pub const REDACTED: &str = "<Redacted>";

/// Key and value patterns deciding which matched parameters are redacted.
/// An empty pattern disables that side.
#[derive(Debug, Clone, Default)]
pub struct Obfuscator {
    key_regex: Option<Regex>,
    value_regex: Option<Regex>,
}

impl Obfuscator {
    pub fn new(key_pattern: &str, value_pattern: &str) -> Result<Self, InitError> {
        Ok(Self {
            key_regex: compile("key", key_pattern)?,
            value_regex: compile("value", value_pattern)?,
        })
    }

    /// True when any key along the path to the matched value is sensitive.
    pub fn is_sensitive_key_path(&self, key_path: &[String]) -> bool {
        self.key_regex
            .as_ref()
            .is_some_and(|regex| key_path.iter().any(|key| regex.is_match(key)))
    }

    pub fn is_sensitive_value(&self, value: &str) -> bool {
        self.value_regex
            .as_ref()
            .is_some_and(|regex| regex.is_match(value))
    }

    pub fn is_enabled(&self) -> bool {
        self.key_regex.is_some() || self.value_regex.is_some()
    }
}

fn compile(which: &'static str, pattern: &str) -> Result<Option<Regex>, InitError> {
    if pattern.is_empty() {
        return Ok(None);
    }
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map(Some)
        .map_err(|err| InitError::InvalidObfuscator {
            which,
            reason: err.to_string(),
        })
}
