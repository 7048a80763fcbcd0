// examples/handle_usage.rs
//
// Loads a small ruleset, evaluates a few requests and shuts down cleanly.
// Run with: cargo run --example handle_usage

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use waf_bridge::{AllocationTracker, BridgeConfig, Field, Handle, Value};

const RULESET: &str = r#"{
    "version": "2.1",
    "metadata": {"rules_version": "0.1.0"},
    "rules": [
        {
            "id": "sqli-001",
            "name": "SQL injection probe",
            "tags": {"type": "sql_injection", "category": "attack_attempt"},
            "conditions": [{
                "operator": "match_regex",
                "parameters": {
                    "inputs": [{"address": "server.request.query"}, {"address": "server.request.body"}],
                    "regex": "union\\s+select"
                }
            }],
            "transformers": ["lowercase"]
        },
        {
            "id": "broken",
            "conditions": [{"operator": "no_such_operator", "parameters": {}}]
        }
    ]
}"#;

fn request(query: &str) -> HashMap<String, Value> {
    let body = Value::Record(vec![
        Field::public("user", "alice"),
        Field::public("comment", query),
        Field::private("session_secret", "hidden"),
    ]);
    HashMap::from([
        ("server.request.query".to_string(), Value::from(query)),
        ("server.request.body".to_string(), body),
    ])
}

/// Example 1: load a ruleset and look at the diagnostics
fn example_load(tracker: &AllocationTracker) -> Handle {
    println!("\n=== Example 1: Loading ===");

    let handle = Handle::load_with(RULESET.as_bytes(), &BridgeConfig::default(), tracker.clone())
        .expect("ruleset should load");
    let diagnostics = handle.diagnostics();
    println!("Rules version: {}", diagnostics.version);
    println!("Loaded: {}, failed: {}", diagnostics.loaded, diagnostics.failed);
    for (rule, error) in diagnostics.errors_by_rule() {
        println!("  {} -> {}", rule, error);
    }
    println!("Addresses: {:?}", handle.addresses());
    handle
}

/// Example 2: one context per request
fn example_requests(handle: &Handle) {
    println!("\n=== Example 2: Requests ===");

    for query in ["id=1", "1 UNION SELECT password FROM users"] {
        let context = handle.new_context().expect("handle is open");
        match context.run(&request(query), Duration::from_millis(5)) {
            Ok(outcome) => match outcome.matches {
                Some(events) => println!("✗ Blocked {:?}: {}", query, String::from_utf8_lossy(&events)),
                None => println!("✓ Allowed {:?}", query),
            },
            Err(e) => println!("Run failed: {}", e),
        }
        println!("  Stats: {:?}", context.stats());
    }
}

/// Example 3: closing waits for contexts still in flight
fn example_shutdown(handle: Handle, tracker: &AllocationTracker) {
    println!("\n=== Example 3: Shutdown ===");

    let handle = Arc::new(handle);
    let context = handle.new_context().expect("handle is open");

    let worker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        let outcome = context.run(&request("id=2"), Duration::from_millis(5));
        println!("Late request finished: {:?}", outcome.map(|o| o.has_matches()));
    });

    handle.close();
    println!("Handle closed, new contexts refused: {}", handle.new_context().is_none());
    worker.join().expect("worker thread");
    println!("Live engine allocations: {}", tracker.live());
}

fn main() {
    println!("WAF engine {}", waf_bridge::version());
    println!("Health: {:?}", waf_bridge::health());

    let tracker = AllocationTracker::new();
    let handle = example_load(&tracker);
    example_requests(&handle);
    example_shutdown(handle, &tracker);
}
