//! # Execution Context
//!
//! One engine session bound to one request. Inputs from successive runs
//! accumulate in the session, so a rule needing several addresses can match
//! once the last of them has been supplied.
//!
//! Concurrency:
//! - Runs on one context are serialized by the session mutex.
//! - Runtime and timeout counters are atomics readable at any time.
//! - The context holds a lease on its handle until it is closed, which keeps
//!   the ruleset instance alive.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use waf_engine::{ReturnCode, RunResult, Session};

use crate::error::RunError;
use crate::handle::{Handle, Lease};
use crate::value::Value;

/// Result of a run that reached the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutcome {
    /// Serialized match events as produced by the engine, when any rule matched.
    pub matches: Option<Vec<u8>>,
    /// The run stopped at its deadline. Any matches found before that are
    /// still valid.
    pub timed_out: bool,
}

impl RunOutcome {
    pub fn has_matches(&self) -> bool {
        self.matches.is_some()
    }
}

/// Counter snapshot of a context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ContextStats {
    /// Time spent inside the engine, in nanoseconds.
    pub total_runtime_ns: u64,
    /// Wall time of every run call including encoding, in nanoseconds.
    pub total_overall_runtime_ns: u64,
    pub timeouts: u64,
}

pub struct Context {
    session: Mutex<Option<Session>>,
    total_runtime_ns: AtomicU64,
    total_overall_runtime_ns: AtomicU64,
    timeouts: AtomicU64,
    lease: Lease,
}

impl Context {
    /// Opens a context on `handle`, or returns `None` if the handle is
    /// closing.
    pub fn new(handle: &Handle) -> Option<Self> {
        let Some(lease) = handle.lease() else {
            log::debug!("waf handle is closing, no new context");
            return None;
        };
        let instance = lease.shared().instance()?;
        lease.shared().tracker.acquire();

        Some(Self {
            session: Mutex::new(Some(Session::new(instance))),
            total_runtime_ns: AtomicU64::new(0),
            total_overall_runtime_ns: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            lease,
        })
    }

    /// Evaluates `values` (address name to value) against the ruleset.
    ///
    /// An empty map returns no matches without calling the engine.
    pub fn run(&self, values: &HashMap<String, Value>, timeout: Duration) -> Result<RunOutcome, RunError> {
        let start = Instant::now();
        let result = self.run_engine(values, timeout);
        self.total_overall_runtime_ns
            .fetch_add(elapsed_ns(start), Ordering::Relaxed);
        result
    }

    /// [`run`](Self::run) with the handle's configured timeout.
    pub fn run_default(&self, values: &HashMap<String, Value>) -> Result<RunOutcome, RunError> {
        self.run(values, self.lease.shared().timeout)
    }

    fn run_engine(&self, values: &HashMap<String, Value>, timeout: Duration) -> Result<RunOutcome, RunError> {
        if values.is_empty() {
            return Ok(RunOutcome::default());
        }

        let data = self
            .lease
            .shared()
            .encoder
            .encode_addresses(values.iter().map(|(address, value)| (address.as_str(), value)))?;

        let timeout_us = u64::try_from(timeout.as_micros()).unwrap_or(u64::MAX);
        let mut session = self.session.lock();
        let session = session.as_mut().ok_or(RunError::InvalidObject)?;
        let (code, result) = session.run(data, timeout_us);
        self.total_runtime_ns
            .fetch_add(result.total_runtime_ns, Ordering::Relaxed);

        let outcome = outcome_from(code, result)?;
        if outcome.timed_out {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
            log::debug!("waf run reached its {:?} timeout", timeout);
        }
        Ok(outcome)
    }

    /// Overall and engine-internal runtime, in nanoseconds.
    pub fn total_runtime(&self) -> (u64, u64) {
        (
            self.total_overall_runtime_ns.load(Ordering::Relaxed),
            self.total_runtime_ns.load(Ordering::Relaxed),
        )
    }

    pub fn total_timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> ContextStats {
        let (total_overall_runtime_ns, total_runtime_ns) = self.total_runtime();
        ContextStats {
            total_runtime_ns,
            total_overall_runtime_ns,
            timeouts: self.total_timeouts(),
        }
    }

    /// Destroys the session, then releases the lease on the handle.
    pub fn close(self) {}
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            drop(session);
            self.lease.shared().tracker.release();
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").field("stats", &self.stats()).finish()
    }
}

fn outcome_from(code: ReturnCode, result: RunResult) -> Result<RunOutcome, RunError> {
    match code {
        ReturnCode::OK => Ok(RunOutcome {
            matches: None,
            timed_out: result.timeout,
        }),
        ReturnCode::MATCH => Ok(RunOutcome {
            matches: result.data.map(String::into_bytes),
            timed_out: result.timeout,
        }),
        ReturnCode::ERR_INTERNAL => Err(RunError::Internal),
        ReturnCode::ERR_INVALID_OBJECT => Err(RunError::InvalidObject),
        ReturnCode::ERR_INVALID_ARGUMENT => Err(RunError::InvalidArgument),
        other => Err(RunError::UnknownReturnCode(other.code())),
    }
}

fn elapsed_ns(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{attack_ruleset, config, two_address_ruleset, values};
    use std::sync::atomic::AtomicBool;
    use std::sync::{mpsc, Arc};
    use std::thread;
    use waf_engine::AllocationTracker;

    fn load(ruleset: &[u8], tracker: &AllocationTracker) -> Handle {
        Handle::load_with(ruleset, &config(), tracker.clone()).unwrap()
    }

    #[test]
    fn test_attack_query_matches() {
        let tracker = AllocationTracker::new();
        let handle = load(&attack_ruleset(), &tracker);
        let context = Context::new(&handle).unwrap();

        let outcome = context
            .run(&values("server.request.query", "attack"), Duration::from_millis(100))
            .unwrap();
        assert!(!outcome.timed_out);
        let events: serde_json::Value = serde_json::from_slice(&outcome.matches.unwrap()).unwrap();
        assert_eq!(events[0]["rule"]["id"], "attack-query");
    }

    #[test]
    fn test_safe_query_does_not_match() {
        let tracker = AllocationTracker::new();
        let handle = load(&attack_ruleset(), &tracker);
        let context = Context::new(&handle).unwrap();

        let outcome = context
            .run(&values("server.request.query", "safe"), Duration::from_millis(100))
            .unwrap();
        assert_eq!(outcome, RunOutcome::default());
    }

    #[test]
    fn test_empty_input_skips_engine() {
        let tracker = AllocationTracker::new();
        let handle = load(&attack_ruleset(), &tracker);
        let context = Context::new(&handle).unwrap();

        let outcome = context.run(&HashMap::new(), Duration::ZERO).unwrap();
        assert_eq!(outcome, RunOutcome::default());
        assert_eq!(context.total_timeouts(), 0);
        assert_eq!(context.total_runtime().1, 0);
    }

    #[test]
    fn test_zero_timeout_reports_timeout() {
        let tracker = AllocationTracker::new();
        let handle = load(&attack_ruleset(), &tracker);
        let context = Context::new(&handle).unwrap();

        let outcome = context
            .run(&values("server.request.query", "attack"), Duration::ZERO)
            .unwrap();
        assert!(outcome.timed_out);
        assert_eq!(context.total_timeouts(), 1);
        assert_eq!(context.stats().timeouts, 1);
    }

    #[test]
    fn test_addresses_accumulate_across_runs() {
        let tracker = AllocationTracker::new();
        let handle = load(&two_address_ruleset(), &tracker);
        let context = Context::new(&handle).unwrap();
        let timeout = Duration::from_secs(1);

        let first = context
            .run(&values("server.request.query", "attack"), timeout)
            .unwrap();
        assert!(!first.has_matches());

        let second = context
            .run(&values("server.request.headers.no_cookies", "scanner/1.0"), timeout)
            .unwrap();
        assert!(second.has_matches());

        let (overall, engine) = context.total_runtime();
        assert!(overall >= engine);
    }

    #[test]
    fn test_close_waits_for_open_context() {
        let tracker = AllocationTracker::new();
        let handle = Arc::new(load(&attack_ruleset(), &tracker));
        let context = Context::new(&handle).unwrap();
        assert_eq!(handle.active_contexts(), 1);

        let closer = {
            let handle = Arc::clone(&handle);
            thread::spawn(move || handle.close())
        };
        while !handle.is_closed() {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(20));
        assert!(!closer.is_finished());
        assert!(Context::new(&handle).is_none());

        // The ruleset is still alive for the open context.
        let outcome = context
            .run(&values("server.request.query", "attack"), Duration::from_secs(1))
            .unwrap();
        assert!(outcome.has_matches());

        context.close();
        closer.join().unwrap();
        assert!(tracker.is_balanced());
    }

    #[test]
    fn test_close_during_runs_keeps_results_intact() {
        let tracker = AllocationTracker::new();
        let handle = Arc::new(load(&attack_ruleset(), &tracker));
        let context = Context::new(&handle).unwrap();
        let close_returned = Arc::new(AtomicBool::new(false));
        let (started, first_run) = mpsc::channel();

        let worker = {
            let handle = Arc::clone(&handle);
            let close_returned = Arc::clone(&close_returned);
            thread::spawn(move || {
                let noise = Value::from((0..256).map(|i| format!("safe-{i}")).collect::<Vec<_>>());
                let timeout = Duration::from_secs(5);
                let mut runs = 0;
                while runs == 0 || !handle.is_closed() {
                    let outcome = context
                        .run(&values("server.request.query", noise.clone()), timeout)
                        .unwrap();
                    assert_eq!(outcome, RunOutcome::default());
                    runs += 1;
                    if runs == 1 {
                        started.send(()).unwrap();
                    }
                }

                // Close has started but must wait for this context.
                let outcome = context
                    .run(&values("server.request.query", "attack"), timeout)
                    .unwrap();
                assert!(outcome.has_matches());
                assert!(!outcome.timed_out);
                assert!(!close_returned.load(Ordering::SeqCst));
                context.close();
                runs
            })
        };

        first_run.recv().unwrap();
        handle.close();
        close_returned.store(true, Ordering::SeqCst);

        assert!(worker.join().unwrap() >= 1);
        assert!(tracker.is_balanced());
    }

    #[test]
    fn test_concurrent_contexts_balance_tracker() {
        let tracker = AllocationTracker::new();
        let handle = Arc::new(load(&attack_ruleset(), &tracker));

        let workers: Vec<_> = (0..8)
            .map(|i| {
                let handle = Arc::clone(&handle);
                thread::spawn(move || {
                    let context = Context::new(&handle).unwrap();
                    let query = if i % 2 == 0 { "attack" } else { "safe" };
                    let outcome = context
                        .run(&values("server.request.query", query), Duration::from_secs(1))
                        .unwrap();
                    assert_eq!(outcome.has_matches(), i % 2 == 0);
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        handle.close();
        assert!(tracker.is_balanced());
    }

    #[test]
    fn test_return_codes_map_to_errors() {
        let result = RunResult::default();
        assert_eq!(
            outcome_from(ReturnCode::ERR_INTERNAL, result.clone()),
            Err(RunError::Internal)
        );
        assert_eq!(
            outcome_from(ReturnCode::ERR_INVALID_OBJECT, result.clone()),
            Err(RunError::InvalidObject)
        );
        assert_eq!(
            outcome_from(ReturnCode::ERR_INVALID_ARGUMENT, result.clone()),
            Err(RunError::InvalidArgument)
        );
        assert_eq!(
            outcome_from(ReturnCode::from_raw(42), result),
            Err(RunError::UnknownReturnCode(42))
        );
    }

    #[test]
    fn test_timeout_can_carry_matches() {
        let result = RunResult {
            data: Some("[]".to_string()),
            timeout: true,
            total_runtime_ns: 10,
        };
        let outcome = outcome_from(ReturnCode::MATCH, result).unwrap();
        assert!(outcome.timed_out);
        assert_eq!(outcome.matches.as_deref(), Some(&b"[]"[..]));
    }
}
