//! Error types surfaced by the bridge.

use thiserror::Error;
use waf_engine::{InitError, ObjectError, ObjectKind};

/// Failure that aborts an encode. Values that are merely unsupported or too
/// deep are skipped inside the encoder and never reported here.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("object allocation failed: {0}")]
    Object(#[from] ObjectError),

    #[error("cannot encode a top-level {0} value")]
    UnsupportedRoot(&'static str),

    #[error("encoder panic: {0}")]
    Panic(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("nil object")]
    NilObject,

    #[error("invalid map key")]
    InvalidMapKey,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unsupported object of kind {0:?}")]
    Unsupported(ObjectKind),
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("could not parse the ruleset: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("could not encode the ruleset: {0}")]
    Encode(#[from] EncodeError),

    #[error("could not instantiate the waf rule: {0}")]
    EngineInit(#[from] InitError),

    #[error("could not decode the ruleset diagnostics: {0}")]
    Decode(#[from] DecodeError),

    #[error("empty rule addresses")]
    EmptyRuleAddresses,

    #[error("invalid configuration: {0}")]
    Config(#[from] crate::config::ConfigError),
}

/// Structural failure of a run. Timeouts are not errors; see
/// [`RunOutcome::timed_out`](crate::RunOutcome::timed_out).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RunError {
    #[error("internal waf error")]
    Internal,

    #[error("invalid waf object")]
    InvalidObject,

    #[error("invalid waf argument")]
    InvalidArgument,

    #[error("unknown waf return code {0}")]
    UnknownReturnCode(i32),

    #[error("could not encode the run inputs: {0}")]
    Encode(#[from] EncodeError),
}

/// Failure of the engine self-test run by [`health`](crate::health).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HealthError {
    #[error("self-test ruleset did not load: {0}")]
    Load(String),

    #[error("self-test handle refused a context")]
    Closed,

    #[error("self-test run failed: {0}")]
    Run(String),

    #[error("self-test sample was not detected")]
    MissedSample,

    #[error("self-test left {0} engine allocations alive")]
    Leak(i64),
}
