//! # Bounded Encoder
//!
//! Converts host [`Value`]s into engine object trees under four budgets:
//! container depth, string length, array length and map length.
//!
//! Design overview:
//! - Oversized strings, arrays and maps are truncated to their budget.
//! - Values the engine cannot hold (unsupported kinds, containers nested past
//!   the depth budget, non-string or null map keys) are skipped and the
//!   parent's declared length shrinks to the entries actually written.
//! - Any other failure aborts the encode and releases the partial tree.
//! - References are followed without consuming depth.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use serde::{Deserialize, Serialize};
use waf_engine::{
    AllocationTracker, ContainerKind, ObjectArena, ObjectError, ObjectId, ObjectTree,
    MAX_CONTAINER_DEPTH, MAX_CONTAINER_SIZE, MAX_STRING_LENGTH,
};

use crate::error::EncodeError;
use crate::value::{Field, Value};

/// Encoding budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderLimits {
    /// Container levels allowed below the top-level value.
    pub max_depth: usize,
    /// Longest string or key, in bytes.
    pub max_string_length: usize,
    pub max_array_length: usize,
    pub max_map_length: usize,
}

impl EncoderLimits {
    /// The limits the engine itself applies during evaluation.
    pub fn engine_defaults() -> Self {
        Self {
            max_depth: MAX_CONTAINER_DEPTH,
            max_string_length: MAX_STRING_LENGTH,
            max_array_length: MAX_CONTAINER_SIZE,
            max_map_length: MAX_CONTAINER_SIZE,
        }
    }

    pub fn unbounded() -> Self {
        Self {
            max_depth: usize::MAX,
            max_string_length: usize::MAX,
            max_array_length: usize::MAX,
            max_map_length: usize::MAX,
        }
    }
}

impl Default for EncoderLimits {
    fn default() -> Self {
        Self::engine_defaults()
    }
}

#[derive(Debug, Clone)]
pub struct Encoder {
    limits: EncoderLimits,
    numbers_as_strings: bool,
    tracker: AllocationTracker,
}

/// Why an encode step did not produce a value.
enum Failure {
    Ignored(Ignored),
    Fatal(EncodeError),
}

#[derive(Debug)]
enum Ignored {
    MaxDepth,
    Unsupported(&'static str),
    NullKey,
}

impl From<ObjectError> for Failure {
    fn from(err: ObjectError) -> Self {
        Failure::Fatal(EncodeError::Object(err))
    }
}

#[derive(Clone, Copy)]
enum EntryKey<'v> {
    Value(&'v Value),
    Text(&'v str),
}

impl Encoder {
    pub fn new(limits: EncoderLimits, tracker: AllocationTracker) -> Self {
        Self {
            limits,
            numbers_as_strings: true,
            tracker,
        }
    }

    /// Encoder without budgets, used for rulesets.
    pub fn unbounded(tracker: AllocationTracker) -> Self {
        Self::new(EncoderLimits::unbounded(), tracker)
    }

    /// Whether integers and floats are rendered as decimal strings (the
    /// default) or written as native integer objects.
    pub fn with_numbers_as_strings(mut self, enabled: bool) -> Self {
        self.numbers_as_strings = enabled;
        self
    }

    pub fn limits(&self) -> &EncoderLimits {
        &self.limits
    }

    pub fn numbers_as_strings(&self) -> bool {
        self.numbers_as_strings
    }

    pub fn tracker(&self) -> &AllocationTracker {
        &self.tracker
    }

    pub fn encode(&self, value: &Value) -> Result<ObjectTree, EncodeError> {
        self.guarded(|tree| {
            let root = tree.root();
            self.encode_value(tree.arena_mut(), value, root, self.root_depth())
                .map_err(|failure| match failure {
                    Failure::Fatal(err) => err,
                    Failure::Ignored(_) => EncodeError::UnsupportedRoot(value.kind_name()),
                })
        })
    }

    /// Encodes address/value pairs as one top-level map.
    pub fn encode_addresses<'v, I>(&self, entries: I) -> Result<ObjectTree, EncodeError>
    where
        I: IntoIterator<Item = (&'v str, &'v Value)>,
        I::IntoIter: ExactSizeIterator,
    {
        let entries = entries.into_iter();
        self.guarded(|tree| {
            let root = tree.root();
            let count = entries.len();
            let entries = entries.map(|(address, value)| (EntryKey::Text(address), value));
            self.encode_map(tree.arena_mut(), root, entries, count, self.root_depth())
                .map_err(|failure| match failure {
                    Failure::Fatal(err) => err,
                    Failure::Ignored(_) => EncodeError::UnsupportedRoot("map"),
                })
        })
    }

    /// Runs `fill` on a fresh tree. The tree is dropped, releasing everything
    /// written so far, if `fill` fails or panics.
    fn guarded<F>(&self, fill: F) -> Result<ObjectTree, EncodeError>
    where
        F: FnOnce(&mut ObjectTree) -> Result<(), EncodeError>,
    {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> Result<ObjectTree, EncodeError> {
            let mut tree = ObjectTree::new(self.tracker.clone())?;
            fill(&mut tree)?;
            Ok(tree)
        }));

        match outcome {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log::error!("recovered from a panic while encoding: {}", message);
                Err(EncodeError::Panic(message))
            }
        }
    }

    fn root_depth(&self) -> usize {
        self.limits.max_depth.saturating_add(1)
    }

    /// `depth` counts the container levels still allowed, this one included.
    fn encode_value(
        &self,
        arena: &mut ObjectArena,
        value: &Value,
        id: ObjectId,
        depth: usize,
    ) -> Result<(), Failure> {
        match value {
            Value::Ref(Some(inner)) => self.encode_value(arena, inner, id, depth),
            Value::Ref(None) => Err(Failure::Ignored(Ignored::Unsupported("null"))),
            Value::Unsupported(kind) => Err(Failure::Ignored(Ignored::Unsupported(*kind))),
            Value::Bool(flag) => self.write_text(arena, id, if *flag { "true" } else { "false" }),
            Value::Unsigned(number) => {
                if self.numbers_as_strings {
                    self.write_text(arena, id, &number.to_string())
                } else {
                    Ok(arena.set_unsigned(id, *number)?)
                }
            }
            Value::Signed(number) => {
                if self.numbers_as_strings {
                    self.write_text(arena, id, &number.to_string())
                } else {
                    Ok(arena.set_signed(id, *number)?)
                }
            }
            Value::Float(number) => {
                let rounded = number.round() as i64;
                if self.numbers_as_strings {
                    self.write_text(arena, id, &rounded.to_string())
                } else {
                    Ok(arena.set_signed(id, rounded)?)
                }
            }
            Value::String(text) => self.write_text(arena, id, text),
            Value::Bytes(bytes) => {
                let end = bytes.len().min(self.limits.max_string_length);
                Ok(arena.set_string(id, &bytes[..end])?)
            }
            Value::Array(items) => self.encode_array(arena, id, items, depth),
            Value::Map(entries) => {
                let pairs = entries.iter().map(|(key, value)| (EntryKey::Value(key), value));
                self.encode_map(arena, id, pairs, entries.len(), depth)
            }
            Value::Record(fields) => self.encode_record(arena, id, fields, depth),
        }
    }

    fn write_text(&self, arena: &mut ObjectArena, id: ObjectId, text: &str) -> Result<(), Failure> {
        let text = truncate(text, self.limits.max_string_length);
        Ok(arena.set_string(id, text.as_bytes())?)
    }

    fn encode_array(
        &self,
        arena: &mut ObjectArena,
        id: ObjectId,
        items: &[Value],
        depth: usize,
    ) -> Result<(), Failure> {
        if depth == 0 {
            return Err(Failure::Ignored(Ignored::MaxDepth));
        }

        let capacity = items.len().min(self.limits.max_array_length);
        arena.set_container(id, ContainerKind::Array, capacity)?;

        let mut length = 0;
        for item in items {
            if length == capacity {
                break;
            }
            let slot = arena.child(id, length as u64)?;
            match self.encode_value(arena, item, slot, depth - 1) {
                Ok(()) => length += 1,
                Err(Failure::Ignored(reason)) => {
                    arena.free(slot);
                    log::trace!("skipped array element: {:?}", reason);
                }
                Err(fatal) => return Err(fatal),
            }
        }

        arena.set_length(id, length as u64)?;
        Ok(())
    }

    fn encode_record(
        &self,
        arena: &mut ObjectArena,
        id: ObjectId,
        fields: &[Field],
        depth: usize,
    ) -> Result<(), Failure> {
        let public = fields.iter().filter(|field| field.public);
        let count = public.clone().count();
        let entries = public.map(|field| (EntryKey::Text(&field.name), &field.value));
        self.encode_map(arena, id, entries, count, depth)
    }

    fn encode_map<'v, I>(
        &self,
        arena: &mut ObjectArena,
        id: ObjectId,
        entries: I,
        count: usize,
        depth: usize,
    ) -> Result<(), Failure>
    where
        I: Iterator<Item = (EntryKey<'v>, &'v Value)>,
    {
        if depth == 0 {
            return Err(Failure::Ignored(Ignored::MaxDepth));
        }

        let capacity = count.min(self.limits.max_map_length);
        arena.set_container(id, ContainerKind::Map, capacity)?;

        let mut length = 0;
        for (key, value) in entries {
            if length == capacity {
                break;
            }
            let slot = arena.child(id, length as u64)?;

            match self.encode_key(arena, slot, key) {
                Ok(()) => {}
                Err(Failure::Ignored(reason)) => {
                    log::trace!("skipped map entry with unusable key: {:?}", reason);
                    continue;
                }
                Err(fatal) => return Err(fatal),
            }

            match self.encode_value(arena, value, slot, depth - 1) {
                Ok(()) => length += 1,
                Err(Failure::Ignored(reason)) => {
                    arena.free(slot);
                    log::trace!("skipped map value: {:?}", reason);
                }
                Err(fatal) => return Err(fatal),
            }
        }

        arena.set_length(id, length as u64)?;
        Ok(())
    }

    fn encode_key(&self, arena: &mut ObjectArena, slot: ObjectId, key: EntryKey<'_>) -> Result<(), Failure> {
        let text = match key {
            EntryKey::Text(text) => text,
            EntryKey::Value(value) => key_text(value)?,
        };
        let text = truncate(text, self.limits.max_string_length);
        Ok(arena.set_key(slot, text.as_bytes())?)
    }
}

fn key_text(value: &Value) -> Result<&str, Failure> {
    match value {
        Value::String(text) => Ok(text),
        Value::Ref(Some(inner)) => key_text(inner),
        Value::Ref(None) => Err(Failure::Ignored(Ignored::NullKey)),
        other => Err(Failure::Ignored(Ignored::Unsupported(other.kind_name()))),
    }
}

/// Longest prefix of `text` that fits in `max` bytes and ends on a
/// character boundary.
fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
