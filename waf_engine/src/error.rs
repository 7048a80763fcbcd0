use thiserror::Error;

use crate::object::ObjectError;

/// Reasons the engine refuses to build an instance from a ruleset.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InitError {
    #[error("ruleset must be a map")]
    NotAMap,

    #[error("ruleset has no version")]
    MissingVersion,

    #[error("unsupported ruleset version '{0}'")]
    UnsupportedVersion(String),

    #[error("ruleset has no rules array")]
    MissingRules,

    #[error("none of the {0} rules could be loaded")]
    NoValidRules(usize),

    #[error("invalid obfuscator {which} regex: {reason}")]
    InvalidObfuscator { which: &'static str, reason: String },

    #[error("failed to build ruleset diagnostics: {0}")]
    Diagnostics(#[from] ObjectError),
}

/// Why a single rule was skipped. The display text is the key under which
/// the rule id is reported in the ruleset diagnostics.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuleError {
    #[error("missing key '{0}'")]
    MissingKey(&'static str),

    #[error("invalid type for key '{0}'")]
    InvalidType(&'static str),

    #[error("unknown operator '{0}'")]
    UnknownOperator(String),

    #[error("invalid regular expression: {0}")]
    InvalidRegex(String),

    #[error("unknown transformer '{0}'")]
    UnknownTransformer(String),

    #[error("empty conditions")]
    EmptyConditions,

    #[error("empty inputs")]
    EmptyInputs,

    #[error("duplicate rule")]
    Duplicate,
}
