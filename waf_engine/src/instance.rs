//! A loaded ruleset ready to evaluate requests.

use std::collections::{BTreeMap, HashSet};

use crate::error::InitError;
use crate::obfuscator::Obfuscator;
use crate::object::{ObjectTree, MAX_CONTAINER_DEPTH, MAX_CONTAINER_SIZE, MAX_STRING_LENGTH};
use crate::ruleset::{self, Rule};
use crate::tracker::AllocationTracker;

/// Bounds applied while walking request data during evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_container_depth: usize,
    pub max_container_size: usize,
    pub max_string_length: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_container_depth: MAX_CONTAINER_DEPTH,
            max_container_size: MAX_CONTAINER_SIZE,
            max_string_length: MAX_STRING_LENGTH,
        }
    }
}

/// Instance configuration: evaluation limits and obfuscation patterns.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub limits: Limits,
    pub key_regex: String,
    pub value_regex: String,
}

/// Outcome of loading a ruleset.
#[derive(Debug)]
pub struct RulesetInfo {
    pub loaded: u16,
    pub failed: u16,
    /// Map of error message to the ids of the rules that failed with it.
    pub errors: ObjectTree,
    /// `metadata.rules_version` of the ruleset, empty when absent.
    pub version: String,
}

#[derive(Debug)]
pub struct Instance {
    rules: Vec<Rule>,
    addresses: Vec<String>,
    limits: Limits,
    obfuscator: Obfuscator,
}

impl Instance {
    /// Builds an instance from an encoded ruleset.
    ///
    /// Invalid rules are skipped and reported in [`RulesetInfo::errors`]. The
    /// ruleset tree is only read; the caller keeps ownership of it.
    pub fn init(
        ruleset: &ObjectTree,
        config: &Config,
        tracker: &AllocationTracker,
    ) -> Result<(Instance, RulesetInfo), InitError> {
        let root = ruleset.view().ok_or(InitError::NotAMap)?;
        let obfuscator = Obfuscator::new(&config.key_regex, &config.value_regex)?;
        let parsed = ruleset::parse(root)?;

        if parsed.rules.is_empty() && !parsed.failed.is_empty() {
            return Err(InitError::NoValidRules(parsed.failed.len()));
        }

        let mut errors: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (id, err) in &parsed.failed {
            log::warn!("rule '{}' skipped: {}", id, err);
            errors.entry(err.to_string()).or_default().push(id.clone());
        }
        let errors = serde_json::Value::Object(
            errors
                .into_iter()
                .map(|(message, ids)| (message, serde_json::Value::from(ids)))
                .collect(),
        );
        let errors = ObjectTree::from_json(&errors, tracker.clone())?;

        let mut seen = HashSet::new();
        let addresses = parsed
            .rules
            .iter()
            .flat_map(|rule| rule.conditions.iter())
            .flat_map(|condition| condition.inputs.iter())
            .filter(|target| seen.insert(target.address.as_str()))
            .map(|target| target.address.clone())
            .collect();

        let info = RulesetInfo {
            loaded: saturate(parsed.rules.len()),
            failed: saturate(parsed.failed.len()),
            errors,
            version: parsed.rules_version,
        };

        log::debug!(
            "engine instance ready: {} rules loaded, {} failed",
            info.loaded,
            info.failed
        );

        let instance = Instance {
            rules: parsed.rules,
            addresses,
            limits: config.limits,
            obfuscator,
        };
        Ok((instance, info))
    }

    /// Addresses referenced by at least one rule, in first-use order.
    pub fn required_addresses(&self) -> &[String] {
        &self.addresses
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn obfuscator(&self) -> &Obfuscator {
        &self.obfuscator
    }
}

fn saturate(count: usize) -> u16 {
    u16::try_from(count).unwrap_or(u16::MAX)
}
