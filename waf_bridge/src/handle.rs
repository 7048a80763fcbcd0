//! # Engine Handle
//!
//! One loaded ruleset instance shared by every [`Context`](crate::Context)
//! opened from it.
//!
//! Lifecycle:
//! 1. `load` parses the ruleset JSON, encodes it without budgets, initializes
//!    the engine and decodes the load diagnostics.
//! 2. Contexts take a lease on the handle for their whole lifetime.
//! 3. `close` refuses new leases, waits for the outstanding ones, then
//!    destroys the instance exactly once.
//!
//! Dropping a handle without `close` does not block: the instance is
//! destroyed as soon as the last context lets go of it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use waf_engine::{AllocationTracker, Instance, Limits};

use crate::config::{BridgeConfig, ObfuscatorConfig};
use crate::decoder::decode_diagnostics;
use crate::encoder::{Encoder, EncoderLimits};
use crate::error::LoadError;
use crate::lease::LeaseFence;
use crate::value::Value;

/// Snapshot of what happened when the ruleset was loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostics {
    pub loaded: u16,
    pub failed: u16,
    /// Error message to the list of rule ids that failed with it. `None`
    /// when every rule loaded.
    pub errors: Option<BTreeMap<String, Value>>,
    /// Version declared by the ruleset metadata, empty when absent.
    pub version: String,
    pub engine_version: String,
}

impl Diagnostics {
    /// Rule id to error message.
    pub fn errors_by_rule(&self) -> BTreeMap<String, String> {
        let mut by_rule = BTreeMap::new();
        for (message, ids) in self.errors.iter().flatten() {
            if let Value::Array(ids) = ids {
                for id in ids.iter().filter_map(Value::as_str) {
                    by_rule.insert(id.to_string(), message.clone());
                }
            }
        }
        by_rule
    }
}

/// State shared between a handle and its contexts.
pub(crate) struct Shared {
    pub(crate) fence: LeaseFence,
    instance: Mutex<Option<Arc<Instance>>>,
    pub(crate) encoder: Encoder,
    pub(crate) timeout: Duration,
    pub(crate) tracker: AllocationTracker,
}

impl Shared {
    pub(crate) fn instance(&self) -> Option<Arc<Instance>> {
        self.instance.lock().clone()
    }

    /// Destroys the instance if it is still alive. Returns true for the call
    /// that did it.
    fn teardown(&self) -> bool {
        let Some(instance) = self.instance.lock().take() else {
            return false;
        };
        drop(instance);
        self.tracker.release();
        log::info!("waf ruleset instance destroyed");
        true
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if self.teardown() {
            log::debug!("waf ruleset released by its last context");
        }
    }
}

/// A lease on the handle's instance, returned on drop.
pub(crate) struct Lease {
    shared: Arc<Shared>,
}

impl Lease {
    fn acquire(shared: &Arc<Shared>) -> Option<Self> {
        if !shared.fence.try_acquire() {
            return None;
        }
        Some(Self {
            shared: Arc::clone(shared),
        })
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.shared.fence.release();
    }
}

pub struct Handle {
    shared: Arc<Shared>,
    addresses: Vec<String>,
    diagnostics: Diagnostics,
}

impl Handle {
    /// Loads a ruleset with default limits and the process-wide tracker.
    pub fn load(ruleset: &[u8], key_regex: &str, value_regex: &str) -> Result<Self, LoadError> {
        let config = BridgeConfig {
            obfuscator: ObfuscatorConfig {
                key_regex: key_regex.to_string(),
                value_regex: value_regex.to_string(),
            },
            ..BridgeConfig::default()
        };
        Self::load_with(ruleset, &config, AllocationTracker::global())
    }

    pub fn load_with(
        ruleset: &[u8],
        config: &BridgeConfig,
        tracker: AllocationTracker,
    ) -> Result<Self, LoadError> {
        if let Err(err) = config.validate() {
            log::warn!("waf bridge configuration rejected: {}", err);
            return Err(err.into());
        }

        let document: serde_json::Value = serde_json::from_slice(ruleset)?;
        let encoded = Encoder::unbounded(tracker.clone()).encode(&Value::from(document))?;

        let engine_config = waf_engine::Config {
            limits: Limits {
                max_container_depth: config.limits.max_depth,
                max_container_size: config.limits.max_array_length.max(config.limits.max_map_length),
                max_string_length: config.limits.max_string_length,
            },
            key_regex: config.obfuscator.key_regex.clone(),
            value_regex: config.obfuscator.value_regex.clone(),
        };
        let initialized = Instance::init(&encoded, &engine_config, &tracker);
        drop(encoded);

        let (instance, info) = initialized.map_err(|err| {
            log::error!("waf ruleset initialization failed: {}", err);
            err
        })?;
        tracker.acquire();
        let instance = Arc::new(instance);
        let destroy = |instance: Arc<Instance>| {
            drop(instance);
            tracker.release();
        };

        let errors = match decode_diagnostics(&info.errors) {
            Ok(errors) => errors,
            Err(err) => {
                destroy(instance);
                return Err(err.into());
            }
        };

        let addresses = instance.required_addresses().to_vec();
        if addresses.is_empty() {
            destroy(instance);
            return Err(LoadError::EmptyRuleAddresses);
        }

        let diagnostics = Diagnostics {
            loaded: info.loaded,
            failed: info.failed,
            errors,
            version: info.version,
            engine_version: waf_engine::version().to_string(),
        };

        log::info!(
            "waf ruleset {} loaded: {} rules, {} failed, {} addresses",
            diagnostics.version,
            diagnostics.loaded,
            diagnostics.failed,
            addresses.len()
        );
        if diagnostics.failed > 0 {
            log::warn!("waf rules failed to load: {:?}", diagnostics.errors_by_rule());
        }

        let encoder = Encoder::new(config.limits, tracker.clone())
            .with_numbers_as_strings(config.numbers_as_strings);

        Ok(Self {
            shared: Arc::new(Shared {
                fence: LeaseFence::new(),
                instance: Mutex::new(Some(instance)),
                encoder,
                timeout: config.timeout,
                tracker,
            }),
            addresses,
            diagnostics,
        })
    }

    /// Addresses the ruleset needs, in first-use order.
    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn encoder_limits(&self) -> &EncoderLimits {
        self.shared.encoder.limits()
    }

    /// Timeout used by [`Context::run_default`](crate::Context::run_default).
    pub fn default_timeout(&self) -> Duration {
        self.shared.timeout
    }

    pub fn tracker(&self) -> &AllocationTracker {
        &self.shared.tracker
    }

    /// Opens a context; `None` once the handle is closing.
    pub fn new_context(&self) -> Option<crate::Context> {
        crate::Context::new(self)
    }

    /// Blocks until every context is closed, then destroys the ruleset
    /// instance. Later calls return immediately.
    pub fn close(&self) {
        let first = self.shared.fence.close();
        if !self.shared.teardown() && !first {
            log::debug!("waf handle already closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.fence.is_closing()
    }

    pub fn active_contexts(&self) -> usize {
        self.shared.fence.active()
    }

    pub(crate) fn lease(&self) -> Option<Lease> {
        Lease::acquire(&self.shared)
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if self.shared.fence.mark_closing() {
            self.shared.teardown();
        } else {
            log::debug!(
                "waf handle dropped with {} open contexts, teardown deferred",
                self.shared.fence.active()
            );
        }
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("addresses", &self.addresses)
            .field("diagnostics", &self.diagnostics)
            .field("closed", &self.is_closed())
            .field("active_contexts", &self.active_contexts())
            .finish()
    }
}
