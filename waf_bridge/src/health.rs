//! Engine version and a cached self-test.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use serde_json::json;
use waf_engine::AllocationTracker;

use crate::config::BridgeConfig;
use crate::error::HealthError;
use crate::handle::Handle;
use crate::value::Value;

const SAMPLE_ADDRESS: &str = "server.request.query";
const SAMPLE_QUERY: &str = "health-check";

static HEALTH: OnceLock<Result<(), HealthError>> = OnceLock::new();

/// Version of the linked rule engine.
pub fn version() -> &'static str {
    waf_engine::version()
}

/// Whether the engine can load a ruleset and detect a known sample.
///
/// The self-test runs once per process with its own tracker; later calls
/// return the cached result.
pub fn health() -> Result<(), HealthError> {
    HEALTH.get_or_init(self_test).clone()
}

fn self_test() -> Result<(), HealthError> {
    let tracker = AllocationTracker::new();
    let result = run_sample(&tracker);

    if !tracker.is_balanced() {
        return Err(HealthError::Leak(tracker.live()));
    }
    match &result {
        Ok(()) => log::debug!("waf engine {} self-test passed", version()),
        Err(err) => log::error!("waf engine {} self-test failed: {}", version(), err),
    }
    result
}

fn run_sample(tracker: &AllocationTracker) -> Result<(), HealthError> {
    let ruleset = json!({
        "version": "2.1",
        "rules": [{
            "id": "health",
            "conditions": [{
                "operator": "exact_match",
                "parameters": {"inputs": [{"address": SAMPLE_ADDRESS}], "list": [SAMPLE_QUERY]}
            }]
        }]
    });
    let config = BridgeConfig {
        timeout: Duration::from_secs(1),
        ..BridgeConfig::default()
    };
    let handle = Handle::load_with(ruleset.to_string().as_bytes(), &config, tracker.clone())
        .map_err(|err| HealthError::Load(err.to_string()))?;

    let outcome = {
        let context = handle.new_context().ok_or(HealthError::Closed)?;
        let values = HashMap::from([(SAMPLE_ADDRESS.to_string(), Value::from(SAMPLE_QUERY))]);
        context.run_default(&values)
    };
    handle.close();

    let outcome = outcome.map_err(|err| HealthError::Run(err.to_string()))?;
    if !outcome.has_matches() {
        return Err(HealthError::MissedSample);
    }
    Ok(())
}
