//! Ruleset parsing.
//!
//! The ruleset arrives as an object tree (the bridge encodes the JSON document
//! without limits). Document-level problems fail the whole parse. Problems in
//! an individual rule only skip that rule and are collected for diagnostics.
//!
//! ```text
//! {
//!   "version": "2.1",
//!   "metadata": { "rules_version": "1.4.2" },
//!   "rules": [{
//!     "id": "crs-942-100",
//!     "name": "SQL injection",
//!     "tags": { "type": "sql_injection", "category": "attack_attempt" },
//!     "conditions": [{
//!       "operator": "match_regex",
//!       "parameters": {
//!         "inputs": [{ "address": "server.request.query", "key_path": ["id"] }],
//!         "regex": "union\\s+select",
//!         "options": { "case_sensitive": false }
//!       }
//!     }],
//!     "transformers": ["lowercase"]
//!   }]
//! }
//! ```

use std::collections::{BTreeMap, HashSet};

use crate::error::{InitError, RuleError};
use crate::object::{ObjectKind, ObjectRef};
use crate::operator::{Operator, Transformer};

#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub tags: BTreeMap<String, String>,
    /// All conditions must match for the rule to match.
    pub conditions: Vec<Condition>,
    pub transformers: Vec<Transformer>,
}

#[derive(Debug, Clone)]
pub struct Condition {
    pub operator: Operator,
    /// The condition matches when any input yields a matching value.
    pub inputs: Vec<Target>,
}

/// An address, optionally narrowed to a nested key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub address: String,
    pub key_path: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Ruleset {
    pub rules: Vec<Rule>,
    /// Skipped rules as (rule id, reason). Rules without an id are named
    /// `index:<position>`.
    pub failed: Vec<(String, RuleError)>,
    pub rules_version: String,
}

pub fn parse(root: ObjectRef<'_>) -> Result<Ruleset, InitError> {
    if root.kind() != ObjectKind::Map {
        return Err(InitError::NotAMap);
    }

    let version = root
        .get("version")
        .and_then(|v| v.scalar_text())
        .ok_or(InitError::MissingVersion)?;
    if version != "2" && !version.starts_with("2.") {
        return Err(InitError::UnsupportedVersion(version.into_owned()));
    }

    let rules_version = root
        .get("metadata")
        .and_then(|metadata| metadata.get("rules_version"))
        .and_then(|v| v.scalar_text())
        .map(|v| v.into_owned())
        .unwrap_or_default();

    let rules = root
        .get("rules")
        .filter(|rules| rules.kind() == ObjectKind::Array)
        .ok_or(InitError::MissingRules)?;

    let mut ruleset = Ruleset {
        rules_version,
        ..Ruleset::default()
    };
    let mut seen = HashSet::new();

    for (index, entry) in rules.children().enumerate() {
        let id = entry.get("id").and_then(|v| v.as_str()).map(str::to_string);
        let parsed = match &id {
            None => Err(RuleError::MissingKey("id")),
            Some(id) if !seen.insert(id.clone()) => Err(RuleError::Duplicate),
            Some(id) => parse_rule(id, entry),
        };

        match parsed {
            Ok(rule) => ruleset.rules.push(rule),
            Err(err) => {
                let id = id.unwrap_or_else(|| format!("index:{index}"));
                ruleset.failed.push((id, err));
            }
        }
    }

    Ok(ruleset)
}

fn parse_rule(id: &str, entry: ObjectRef<'_>) -> Result<Rule, RuleError> {
    let name = optional_str(entry, "name")?.unwrap_or(id).to_string();

    let tags = match entry.get("tags") {
        None => BTreeMap::new(),
        Some(tags) if tags.kind() == ObjectKind::Map => tags
            .children()
            .filter_map(|tag| Some((tag.key()?.to_string(), tag.scalar_text()?.into_owned())))
            .collect(),
        Some(_) => return Err(RuleError::InvalidType("tags")),
    };

    let conditions = required_array(entry, "conditions")?;
    if conditions.is_empty() {
        return Err(RuleError::EmptyConditions);
    }
    let conditions = conditions
        .children()
        .map(parse_condition)
        .collect::<Result<Vec<_>, _>>()?;

    let transformers = match entry.get("transformers") {
        None => Vec::new(),
        Some(list) if list.kind() == ObjectKind::Array => list
            .children()
            .map(|item| {
                let name = item.as_str().ok_or(RuleError::InvalidType("transformers"))?;
                Transformer::from_name(name)
                    .ok_or_else(|| RuleError::UnknownTransformer(name.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => return Err(RuleError::InvalidType("transformers")),
    };

    Ok(Rule {
        id: id.to_string(),
        name,
        tags,
        conditions,
        transformers,
    })
}

fn parse_condition(condition: ObjectRef<'_>) -> Result<Condition, RuleError> {
    let operator_name = required_str(condition, "operator")?;
    let parameters = condition
        .get("parameters")
        .ok_or(RuleError::MissingKey("parameters"))?;
    if parameters.kind() != ObjectKind::Map {
        return Err(RuleError::InvalidType("parameters"));
    }

    let inputs = required_array(parameters, "inputs")?;
    if inputs.is_empty() {
        return Err(RuleError::EmptyInputs);
    }
    let inputs = inputs
        .children()
        .map(parse_target)
        .collect::<Result<Vec<_>, _>>()?;

    let operator = match operator_name {
        "match_regex" => {
            let pattern = required_str(parameters, "regex")?;
            let case_sensitive = match parameters
                .get("options")
                .and_then(|options| options.get("case_sensitive"))
            {
                Some(flag) => parse_flag(flag, "case_sensitive")?,
                None => false,
            };
            Operator::match_regex(pattern, case_sensitive)
                .map_err(|err| RuleError::InvalidRegex(err.to_string()))?
        }
        "phrase_match" => Operator::PhraseMatch {
            phrases: string_list(parameters, "list")?,
        },
        "exact_match" => Operator::ExactMatch {
            values: string_list(parameters, "list")?,
        },
        other => return Err(RuleError::UnknownOperator(other.to_string())),
    };

    Ok(Condition { operator, inputs })
}

fn parse_target(input: ObjectRef<'_>) -> Result<Target, RuleError> {
    let address = required_str(input, "address")?.to_string();
    let key_path = match input.get("key_path") {
        None => Vec::new(),
        Some(_) => string_list(input, "key_path")?,
    };
    Ok(Target { address, key_path })
}

fn required_str<'a>(object: ObjectRef<'a>, key: &'static str) -> Result<&'a str, RuleError> {
    optional_str(object, key)?.ok_or(RuleError::MissingKey(key))
}

fn optional_str<'a>(
    object: ObjectRef<'a>,
    key: &'static str,
) -> Result<Option<&'a str>, RuleError> {
    match object.get(key) {
        None => Ok(None),
        Some(value) => value.as_str().map(Some).ok_or(RuleError::InvalidType(key)),
    }
}

fn required_array<'a>(
    object: ObjectRef<'a>,
    key: &'static str,
) -> Result<ObjectRef<'a>, RuleError> {
    let value = object.get(key).ok_or(RuleError::MissingKey(key))?;
    if value.kind() != ObjectKind::Array {
        return Err(RuleError::InvalidType(key));
    }
    Ok(value)
}

fn string_list(object: ObjectRef<'_>, key: &'static str) -> Result<Vec<String>, RuleError> {
    required_array(object, key)?
        .children()
        .map(|item| {
            item.scalar_text()
                .map(|text| text.into_owned())
                .ok_or(RuleError::InvalidType(key))
        })
        .collect()
}

/// Booleans reach the engine as `"true"`/`"false"` strings; integers 0 and 1
/// are accepted as well.
fn parse_flag(flag: ObjectRef<'_>, key: &'static str) -> Result<bool, RuleError> {
    match flag.scalar_text().as_deref() {
        Some("true") | Some("1") => Ok(true),
        Some("false") | Some("0") => Ok(false),
        _ => Err(RuleError::InvalidType(key)),
    }
}
