//! # WAF Engine
//!
//! In-process rule engine evaluating request addresses against a WAF ruleset.
//!
//! The engine exposes a narrow contract:
//! 1. An object model ([`ObjectTree`]) for rulesets, inputs and diagnostics
//! 2. [`Instance::init`] to load an encoded ruleset with limits and obfuscation
//! 3. [`Session::run`] to evaluate inputs under a soft deadline
//! 4. An [`AllocationTracker`] counting every live engine allocation

pub mod error;
pub mod instance;
pub mod obfuscator;
pub mod object;
pub mod operator;
pub mod ruleset;
pub mod session;
pub mod tracker;

pub use error::{InitError, RuleError};
pub use instance::{Config, Instance, Limits, RulesetInfo};
pub use obfuscator::{Obfuscator, REDACTED};
pub use object::{
    ContainerKind, Object, ObjectArena, ObjectError, ObjectId, ObjectKind, ObjectRef, ObjectTree,
    MAX_CONTAINER_DEPTH, MAX_CONTAINER_SIZE, MAX_STRING_LENGTH,
};
pub use session::{ReturnCode, RunResult, Session};
pub use tracker::AllocationTracker;

/// Engine version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}
