//! Per-request evaluation session.
//!
//! A session keeps the input trees it was given so that addresses supplied
//! by earlier runs stay visible to later ones. A tree is released once later
//! runs have rebound all of its addresses. A rule is reported at most
//! once per session. The deadline is soft: it is checked before each rule
//! and each inspected value, never in the middle of an operator.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::instance::Instance;
use crate::object::{ObjectId, ObjectKind, ObjectRef, ObjectTree};
use crate::obfuscator::REDACTED;
use crate::operator::transform;
use crate::ruleset::{Condition, Rule, Target};

/// Status of a run, in the engine's numeric convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReturnCode(i32);

impl ReturnCode {
    pub const OK: ReturnCode = ReturnCode(0);
    pub const MATCH: ReturnCode = ReturnCode(1);
    pub const ERR_INVALID_ARGUMENT: ReturnCode = ReturnCode(-1);
    pub const ERR_INVALID_OBJECT: ReturnCode = ReturnCode(-2);
    pub const ERR_INTERNAL: ReturnCode = ReturnCode(-3);

    pub fn from_raw(code: i32) -> Self {
        ReturnCode(code)
    }

    pub fn code(self) -> i32 {
        self.0
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunResult {
    /// JSON array of match events, present with [`ReturnCode::MATCH`].
    pub data: Option<String>,
    /// The deadline passed before every rule was evaluated.
    pub timeout: bool,
    pub total_runtime_ns: u64,
}

pub struct Session {
    instance: Arc<Instance>,
    inputs: HashMap<u64, ObjectTree>,
    next_input: u64,
    bindings: HashMap<String, (u64, ObjectId)>,
    matched: HashSet<usize>,
}

impl Session {
    pub fn new(instance: Arc<Instance>) -> Self {
        Self {
            instance,
            inputs: HashMap::new(),
            next_input: 0,
            bindings: HashMap::new(),
            matched: HashSet::new(),
        }
    }

    /// Binds the top-level entries of `data` as addresses and evaluates every
    /// rule not yet matched in this session.
    ///
    /// `data` must be a map. It is retained while any of its entries is the
    /// latest binding of an address.
    pub fn run(&mut self, data: ObjectTree, timeout_us: u64) -> (ReturnCode, RunResult) {
        let start = Instant::now();
        let deadline = Deadline::new(start, timeout_us);
        let mut result = RunResult::default();

        let code = match self.bind(data) {
            Err(code) => code,
            Ok(()) => {
                let (found, timed_out) = self.evaluate(&deadline);
                result.timeout = timed_out;
                if timed_out {
                    log::trace!("session deadline of {}us reached", timeout_us);
                }
                if found.is_empty() {
                    ReturnCode::OK
                } else {
                    match self.record(found) {
                        Ok(events) => {
                            result.data = Some(events);
                            ReturnCode::MATCH
                        }
                        Err(err) => {
                            log::error!("failed to serialize match events: {}", err);
                            ReturnCode::ERR_INTERNAL
                        }
                    }
                }
            }
        };

        result.total_runtime_ns = u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX);
        (code, result)
    }

    /// Addresses bound so far.
    pub fn bound_addresses(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }

    /// Number of input trees still held by the session.
    pub fn retained_inputs(&self) -> usize {
        self.inputs.len()
    }

    fn bind(&mut self, data: ObjectTree) -> Result<(), ReturnCode> {
        let root = data.view().ok_or(ReturnCode::ERR_INVALID_OBJECT)?;
        if root.kind() != ObjectKind::Map {
            return Err(ReturnCode::ERR_INVALID_OBJECT);
        }

        let entries: Vec<(String, ObjectId)> = root
            .children()
            .filter_map(|entry| Some((entry.key()?.to_string(), entry.id())))
            .collect();

        let input = self.next_input;
        self.next_input += 1;
        self.inputs.insert(input, data);
        for (address, id) in entries {
            self.bindings.insert(address, (input, id));
        }

        let bindings = &self.bindings;
        self.inputs
            .retain(|input, _| bindings.values().any(|(bound, _)| bound == input));
        Ok(())
    }

    fn evaluate(&self, deadline: &Deadline) -> (Vec<(usize, Vec<RuleMatch>)>, bool) {
        let mut found = Vec::new();
        for (index, rule) in self.instance.rules().iter().enumerate() {
            if self.matched.contains(&index) {
                continue;
            }
            if deadline.expired() {
                return (found, true);
            }
            match self.eval_rule(rule, deadline) {
                Ok(Some(matches)) => found.push((index, matches)),
                Ok(None) => {}
                Err(Expired) => return (found, true),
            }
        }
        (found, false)
    }

    fn eval_rule(&self, rule: &Rule, deadline: &Deadline) -> Result<Option<Vec<RuleMatch>>, Expired> {
        let mut matches = Vec::with_capacity(rule.conditions.len());
        for condition in &rule.conditions {
            let probe = Probe {
                rule,
                condition,
                deadline,
            };
            match self.eval_condition(&probe)? {
                Some(parameter) => matches.push(RuleMatch {
                    operator: condition.operator.name(),
                    operator_value: condition.operator.operator_value(),
                    parameters: vec![parameter],
                }),
                None => return Ok(None),
            }
        }
        Ok(Some(matches))
    }

    fn eval_condition(&self, probe: &Probe<'_>) -> Result<Option<MatchParameter>, Expired> {
        for target in &probe.condition.inputs {
            let Some(value) = self.resolve(target) else {
                continue;
            };
            let mut path = target.key_path.clone();
            if let Some(found) = self.search(probe, &target.address, value, &mut path, 0)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    fn resolve(&self, target: &Target) -> Option<ObjectRef<'_>> {
        let (input, id) = *self.bindings.get(&target.address)?;
        let mut value = self.inputs.get(&input)?.arena().view(id)?;
        for key in &target.key_path {
            value = value.get(key)?;
        }
        Some(value)
    }

    fn search(
        &self,
        probe: &Probe<'_>,
        address: &str,
        value: ObjectRef<'_>,
        path: &mut Vec<String>,
        depth: usize,
    ) -> Result<Option<MatchParameter>, Expired> {
        if probe.deadline.expired() {
            return Err(Expired);
        }
        let limits = self.instance.limits();

        if value.kind().is_container() {
            if depth >= limits.max_container_depth {
                return Ok(None);
            }
            let is_map = value.kind() == ObjectKind::Map;
            for (index, child) in value.children().take(limits.max_container_size).enumerate() {
                let segment = if is_map {
                    child.key().unwrap_or_default().to_string()
                } else {
                    index.to_string()
                };
                path.push(segment);
                let found = self.search(probe, address, child, path, depth + 1);
                path.pop();
                if let Some(found) = found? {
                    return Ok(Some(found));
                }
            }
            return Ok(None);
        }

        let Some(text) = value.scalar_text() else {
            return Ok(None);
        };
        let text = clamp(text, limits.max_string_length);
        let transformed = transform(&probe.rule.transformers, text.clone());

        Ok(probe.condition.operator.find(&transformed).map(|highlight| MatchParameter {
            address: address.to_string(),
            key_path: path.clone(),
            value: text.into_owned(),
            highlight: vec![highlight],
        }))
    }

    /// Marks matched rules and renders their events.
    fn record(&mut self, found: Vec<(usize, Vec<RuleMatch>)>) -> Result<String, serde_json::Error> {
        let instance = Arc::clone(&self.instance);
        let obfuscator = instance.obfuscator();
        let mut events = Vec::with_capacity(found.len());

        for (index, mut rule_matches) in found {
            self.matched.insert(index);
            let Some(rule) = instance.rules().get(index) else {
                continue;
            };
            for parameter in rule_matches.iter_mut().flat_map(|m| m.parameters.iter_mut()) {
                if obfuscator.is_sensitive_key_path(&parameter.key_path)
                    || obfuscator.is_sensitive_value(&parameter.value)
                {
                    parameter.value = REDACTED.to_string();
                    parameter.highlight = vec![REDACTED.to_string()];
                }
            }
            events.push(Event {
                rule: RuleSummary {
                    id: &rule.id,
                    name: &rule.name,
                    tags: &rule.tags,
                },
                rule_matches,
            });
        }

        serde_json::to_string(&events)
    }
}

struct Probe<'r> {
    rule: &'r Rule,
    condition: &'r Condition,
    deadline: &'r Deadline,
}

struct Expired;

struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    fn new(start: Instant, timeout_us: u64) -> Self {
        Self {
            at: start.checked_add(Duration::from_micros(timeout_us)),
        }
    }

    fn expired(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }
}

fn clamp(text: Cow<'_, str>, max: usize) -> Cow<'_, str> {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    match text {
        Cow::Borrowed(text) => Cow::Borrowed(&text[..end]),
        Cow::Owned(mut text) => {
            text.truncate(end);
            Cow::Owned(text)
        }
    }
}

// ============================================================================
// Match Events
// ============================================================================

#[derive(Debug, Serialize)]
struct Event<'r> {
    rule: RuleSummary<'r>,
    rule_matches: Vec<RuleMatch>,
}

#[derive(Debug, Serialize)]
struct RuleSummary<'r> {
    id: &'r str,
    name: &'r str,
    tags: &'r BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct RuleMatch {
    operator: &'static str,
    operator_value: String,
    parameters: Vec<MatchParameter>,
}

#[derive(Debug, Serialize)]
struct MatchParameter {
    address: String,
    key_path: Vec<String>,
    value: String,
    highlight: Vec<String>,
}
