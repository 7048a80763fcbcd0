//! Shared fixtures for unit tests.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::json;

use crate::config::BridgeConfig;
use crate::value::Value;

/// One rule flagging a query that is exactly `attack`.
pub fn attack_ruleset() -> Vec<u8> {
    json!({
        "version": "2.1",
        "metadata": {"rules_version": "1.0.0"},
        "rules": [{
            "id": "attack-query",
            "name": "Attack query",
            "tags": {"type": "test", "category": "attack_attempt"},
            "conditions": [{
                "operator": "match_regex",
                "parameters": {
                    "inputs": [{"address": "server.request.query"}],
                    "regex": "^attack$"
                }
            }]
        }]
    })
    .to_string()
    .into_bytes()
}

/// One rule that only matches once both the query and the user agent header
/// have been seen.
pub fn two_address_ruleset() -> Vec<u8> {
    json!({
        "version": "2.1",
        "rules": [{
            "id": "scanner-attack",
            "name": "Scanner sending an attack",
            "tags": {"type": "security_scanner"},
            "conditions": [
                {
                    "operator": "match_regex",
                    "parameters": {
                        "inputs": [{"address": "server.request.query"}],
                        "regex": "^attack$"
                    }
                },
                {
                    "operator": "match_regex",
                    "parameters": {
                        "inputs": [{"address": "server.request.headers.no_cookies"}],
                        "regex": "scanner"
                    }
                }
            ]
        }]
    })
    .to_string()
    .into_bytes()
}

/// Defaults with a timeout generous enough for slow CI machines.
pub fn config() -> BridgeConfig {
    BridgeConfig {
        timeout: Duration::from_secs(1),
        ..BridgeConfig::default()
    }
}

pub fn values(address: &str, value: impl Into<Value>) -> HashMap<String, Value> {
    HashMap::from([(address.to_string(), value.into())])
}
