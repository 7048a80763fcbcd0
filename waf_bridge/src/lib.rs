//! # WAF Bridge
//!
//! Host-side bridge to the in-process WAF rule engine.
//!
//! The bridge is responsible for:
//! 1. Encoding host [`Value`]s into engine objects under configurable budgets
//! 2. Decoding engine objects (load diagnostics) back into host values
//! 3. Loading a ruleset into a [`Handle`] and opening per-request [`Context`]s
//! 4. Keeping the ruleset alive while any context still uses it
//! 5. Counting every live engine allocation through an [`AllocationTracker`]
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::time::Duration;
//! use waf_bridge::{Handle, Value};
//!
//! let ruleset = std::fs::read("rules.json").unwrap();
//! let handle = Handle::load(&ruleset, "", "").unwrap();
//! let context = handle.new_context().unwrap();
//!
//! let values = HashMap::from([("server.request.query".to_string(), Value::from("id=1"))]);
//! let outcome = context.run(&values, Duration::from_millis(2)).unwrap();
//! if let Some(events) = outcome.matches {
//!     println!("{}", String::from_utf8_lossy(&events));
//! }
//!
//! context.close();
//! handle.close();
//! ```

pub mod config;
pub mod context;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod handle;
pub mod health;
pub mod lease;
pub mod value;

#[cfg(test)]
mod testing;

pub use config::{BridgeConfig, ConfigError, ObfuscatorConfig};
pub use context::{Context, ContextStats, RunOutcome};
pub use decoder::{decode, decode_diagnostics, decode_map, decode_tree};
pub use encoder::{Encoder, EncoderLimits};
pub use error::{DecodeError, EncodeError, HealthError, LoadError, RunError};
pub use handle::{Diagnostics, Handle};
pub use health::{health, version};
pub use value::{Field, Value};

pub use waf_engine::AllocationTracker;
