//! # Engine Object Model
//!
//! Values handed to the engine (rulesets, run inputs, diagnostics) are stored
//! in an [`ObjectArena`] and addressed by [`ObjectId`].
//!
//! - A container owns one contiguous block of child slots sized to its
//!   capacity. Its declared length never exceeds that capacity.
//! - Strings and map keys own their byte buffers. Strings are length-bounded
//!   and carry no terminator.
//! - Every buffer and block is counted by the arena's [`AllocationTracker`]
//!   from allocation until [`ObjectArena::free`] (or arena drop) releases it.
//!
//! An [`ObjectTree`] (arena plus root) is the unit of ownership moved across
//! the bridge/engine boundary. Dropping it frees the root recursively.

use std::borrow::Cow;
use std::ops::Range;

use thiserror::Error;

use crate::tracker::AllocationTracker;

/// Deepest container nesting the engine inspects.
pub const MAX_CONTAINER_DEPTH: usize = 20;
/// Most entries the engine inspects per container.
pub const MAX_CONTAINER_SIZE: usize = 256;
/// Longest string the engine inspects, in bytes.
pub const MAX_STRING_LENGTH: usize = 4096;

// ============================================================================
// Core Types
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ObjectError {
    #[error("out of memory")]
    OutOfMemory,

    #[error("unknown or released object {0:?}")]
    UnknownObject(ObjectId),

    #[error("index {index} out of bounds for container of length {length}")]
    OutOfBounds { index: u64, length: u64 },

    #[error("object {0:?} is not a container")]
    NotAContainer(ObjectId),

    #[error("length {length} exceeds container capacity {capacity}")]
    LengthExceedsCapacity { length: u64, capacity: u64 },
}

/// Index of an object slot inside its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u32);

impl ObjectId {
    fn slot(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Invalid,
    Unsigned,
    Signed,
    String,
    Array,
    Map,
}

impl ObjectKind {
    pub fn is_container(self) -> bool {
        matches!(self, ObjectKind::Array | ObjectKind::Map)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Array,
    Map,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Block {
    start: u32,
    capacity: u32,
}

impl Block {
    fn slots(&self) -> Range<usize> {
        let start = self.start as usize;
        start..start + self.capacity as usize
    }
}

#[derive(Debug, Default)]
enum Payload {
    #[default]
    Invalid,
    Unsigned(u64),
    Signed(i64),
    String(Box<[u8]>),
    Array(Option<Block>),
    Map(Option<Block>),
}

/// One node of the object model.
#[derive(Debug, Default)]
pub struct Object {
    key: Option<Box<[u8]>>,
    payload: Payload,
    /// Byte length for strings, entry count for containers.
    length: u64,
}

impl Object {
    pub fn kind(&self) -> ObjectKind {
        match self.payload {
            Payload::Invalid => ObjectKind::Invalid,
            Payload::Unsigned(_) => ObjectKind::Unsigned,
            Payload::Signed(_) => ObjectKind::Signed,
            Payload::String(_) => ObjectKind::String,
            Payload::Array(_) => ObjectKind::Array,
            Payload::Map(_) => ObjectKind::Map,
        }
    }

    /// Map key of this entry, if it was given one.
    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn as_unsigned(&self) -> Option<u64> {
        match self.payload {
            Payload::Unsigned(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_signed(&self) -> Option<i64> {
        match self.payload {
            Payload::Signed(value) => Some(value),
            _ => None,
        }
    }

    /// The whole string buffer. The declared [`length`](Self::length) is not
    /// applied here and may disagree with the buffer size.
    pub fn string_buffer(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::String(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Number of child slots owned by a container, zero otherwise.
    pub fn capacity(&self) -> u64 {
        self.block().map_or(0, |block| u64::from(block.capacity))
    }

    fn block(&self) -> Option<Block> {
        match self.payload {
            Payload::Array(block) | Payload::Map(block) => block,
            _ => None,
        }
    }
}

// ============================================================================
// Arena
// ============================================================================

/// Storage for objects and the blocks of child slots they own.
#[derive(Debug)]
pub struct ObjectArena {
    slots: Vec<Option<Object>>,
    free_blocks: Vec<Block>,
    tracker: AllocationTracker,
    live: usize,
}

impl ObjectArena {
    pub fn new(tracker: AllocationTracker) -> Self {
        Self {
            slots: Vec::new(),
            free_blocks: Vec::new(),
            tracker,
            live: 0,
        }
    }

    pub fn tracker(&self) -> &AllocationTracker {
        &self.tracker
    }

    /// Allocations made through this arena and not yet released.
    pub fn live_allocations(&self) -> usize {
        self.live
    }

    pub fn get(&self, id: ObjectId) -> Option<&Object> {
        self.slots.get(id.slot())?.as_ref()
    }

    pub fn view(&self, id: ObjectId) -> Option<ObjectRef<'_>> {
        self.get(id).map(|object| ObjectRef {
            arena: self,
            id,
            object,
        })
    }

    pub fn set_unsigned(&mut self, id: ObjectId, value: u64) -> Result<(), ObjectError> {
        self.clear_payload(id)?;
        let object = self.get_mut(id)?;
        object.payload = Payload::Unsigned(value);
        object.length = 0;
        Ok(())
    }

    pub fn set_signed(&mut self, id: ObjectId, value: i64) -> Result<(), ObjectError> {
        self.clear_payload(id)?;
        let object = self.get_mut(id)?;
        object.payload = Payload::Signed(value);
        object.length = 0;
        Ok(())
    }

    /// Copies `bytes` into a new string buffer owned by `id`.
    pub fn set_string(&mut self, id: ObjectId, bytes: &[u8]) -> Result<(), ObjectError> {
        self.clear_payload(id)?;
        let buffer = copy_buffer(bytes)?;
        let object = self.get_mut(id)?;
        object.length = buffer.len() as u64;
        object.payload = Payload::String(buffer);
        self.acquire();
        Ok(())
    }

    /// Copies `bytes` into a new key buffer owned by `id`, replacing any
    /// previous key.
    pub fn set_key(&mut self, id: ObjectId, bytes: &[u8]) -> Result<(), ObjectError> {
        let buffer = copy_buffer(bytes)?;
        let object = self.get_mut(id)?;
        let previous = object.key.replace(buffer);
        self.acquire();
        if previous.is_some() {
            self.release();
        }
        Ok(())
    }

    /// Turns `id` into an empty-slotted container of the given capacity. The
    /// declared length starts equal to the capacity.
    pub fn set_container(
        &mut self,
        id: ObjectId,
        kind: ContainerKind,
        capacity: usize,
    ) -> Result<(), ObjectError> {
        self.clear_payload(id)?;
        let block = if capacity == 0 {
            None
        } else {
            Some(self.alloc_block(capacity)?)
        };

        let object = match self.get_mut(id) {
            Ok(object) => object,
            Err(err) => {
                if let Some(block) = block {
                    self.release_block(block);
                }
                return Err(err);
            }
        };
        object.payload = match kind {
            ContainerKind::Array => Payload::Array(block),
            ContainerKind::Map => Payload::Map(block),
        };
        object.length = capacity as u64;
        Ok(())
    }

    /// Overwrites the declared length. Containers may not claim more entries
    /// than their capacity; other objects take the value as-is.
    pub fn set_length(&mut self, id: ObjectId, length: u64) -> Result<(), ObjectError> {
        let object = self.get_mut(id)?;
        if object.kind().is_container() && length > object.capacity() {
            return Err(ObjectError::LengthExceedsCapacity {
                length,
                capacity: object.capacity(),
            });
        }
        object.length = length;
        Ok(())
    }

    /// Child slot `index` of container `id`, checked against the declared length.
    pub fn child(&self, id: ObjectId, index: u64) -> Result<ObjectId, ObjectError> {
        let object = self.get(id).ok_or(ObjectError::UnknownObject(id))?;
        if !object.kind().is_container() {
            return Err(ObjectError::NotAContainer(id));
        }
        let out_of_bounds = ObjectError::OutOfBounds {
            index,
            length: object.length,
        };
        if index >= object.length {
            return Err(out_of_bounds);
        }
        let block = object.block().ok_or_else(|| out_of_bounds.clone())?;
        if index >= u64::from(block.capacity) {
            return Err(out_of_bounds);
        }
        Ok(ObjectId(block.start + index as u32))
    }

    /// Releases the key, string buffer or child block of `id` (recursively)
    /// and leaves the object invalid. Unknown ids are ignored.
    pub fn free(&mut self, id: ObjectId) {
        let Some(slot) = self.slots.get_mut(id.slot()).and_then(Option::as_mut) else {
            return;
        };
        let object = std::mem::take(slot);
        if object.key.is_some() {
            self.release();
        }
        self.release_payload(object.payload);
    }

    fn get_mut(&mut self, id: ObjectId) -> Result<&mut Object, ObjectError> {
        self.slots
            .get_mut(id.slot())
            .and_then(Option::as_mut)
            .ok_or(ObjectError::UnknownObject(id))
    }

    fn clear_payload(&mut self, id: ObjectId) -> Result<(), ObjectError> {
        let object = self.get_mut(id)?;
        let payload = std::mem::take(&mut object.payload);
        object.length = 0;
        self.release_payload(payload);
        Ok(())
    }

    fn release_payload(&mut self, payload: Payload) {
        match payload {
            Payload::String(_) => self.release(),
            Payload::Array(Some(block)) | Payload::Map(Some(block)) => {
                for slot in block.slots() {
                    self.free(ObjectId(slot as u32));
                }
                self.release_block(block);
            }
            _ => {}
        }
    }

    fn alloc_root(&mut self) -> Result<ObjectId, ObjectError> {
        let block = self.alloc_block(1)?;
        Ok(ObjectId(block.start))
    }

    fn release_root(&mut self, root: ObjectId) {
        if self.get(root).is_none() {
            return;
        }
        self.free(root);
        self.release_block(Block {
            start: root.0,
            capacity: 1,
        });
    }

    fn alloc_block(&mut self, capacity: usize) -> Result<Block, ObjectError> {
        let reusable = self
            .free_blocks
            .iter()
            .position(|block| block.capacity as usize == capacity);

        let block = match reusable {
            Some(position) => self.free_blocks.swap_remove(position),
            None => {
                let start = self.slots.len();
                let end = start
                    .checked_add(capacity)
                    .filter(|end| *end <= u32::MAX as usize)
                    .ok_or(ObjectError::OutOfMemory)?;
                self.slots
                    .try_reserve(capacity)
                    .map_err(|_| ObjectError::OutOfMemory)?;
                self.slots.resize_with(end, || None);
                Block {
                    start: start as u32,
                    capacity: capacity as u32,
                }
            }
        };

        for slot in &mut self.slots[block.slots()] {
            *slot = Some(Object::default());
        }
        self.acquire();
        Ok(block)
    }

    fn release_block(&mut self, block: Block) {
        for slot in &mut self.slots[block.slots()] {
            *slot = None;
        }
        self.free_blocks.push(block);
        self.release();
    }

    fn acquire(&mut self) {
        self.live += 1;
        self.tracker.acquire();
    }

    fn release(&mut self) {
        self.live = self.live.saturating_sub(1);
        self.tracker.release();
    }
}

/// Every allocation must have been released through [`ObjectArena::free`]
/// or the owning tree before the arena goes away. Leftovers stay counted by
/// the tracker.
impl Drop for ObjectArena {
    fn drop(&mut self) {
        if self.live == 0 {
            return;
        }
        log::error!("object arena dropped with {} live allocations", self.live);
        if !std::thread::panicking() {
            debug_assert_eq!(self.live, 0, "object arena leaked allocations");
        }
    }
}

fn copy_buffer(bytes: &[u8]) -> Result<Box<[u8]>, ObjectError> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(bytes.len())
        .map_err(|_| ObjectError::OutOfMemory)?;
    buffer.extend_from_slice(bytes);
    Ok(buffer.into_boxed_slice())
}

// ============================================================================
// Read-only Views
// ============================================================================

/// Borrowed view of one object that can walk into its children.
#[derive(Debug, Clone, Copy)]
pub struct ObjectRef<'a> {
    arena: &'a ObjectArena,
    id: ObjectId,
    object: &'a Object,
}

impl<'a> ObjectRef<'a> {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn kind(&self) -> ObjectKind {
        self.object.kind()
    }

    pub fn object(&self) -> &'a Object {
        self.object
    }

    /// The entry key when it is valid UTF-8.
    pub fn key(&self) -> Option<&'a str> {
        std::str::from_utf8(self.object.key()?).ok()
    }

    /// Declared number of entries for containers.
    pub fn len(&self) -> usize {
        if self.kind().is_container() {
            usize::try_from(self.object.length).unwrap_or(usize::MAX)
        } else {
            0
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// String bytes within the declared length.
    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        let buffer = self.object.string_buffer()?;
        let length = usize::try_from(self.object.length).ok()?;
        buffer.get(..length)
    }

    pub fn as_str(&self) -> Option<&'a str> {
        std::str::from_utf8(self.as_bytes()?).ok()
    }

    /// Strings and integers rendered as text.
    pub fn scalar_text(&self) -> Option<Cow<'a, str>> {
        match self.kind() {
            ObjectKind::String => self.as_bytes().map(String::from_utf8_lossy),
            ObjectKind::Unsigned => self.object.as_unsigned().map(|v| Cow::Owned(v.to_string())),
            ObjectKind::Signed => self.object.as_signed().map(|v| Cow::Owned(v.to_string())),
            _ => None,
        }
    }

    pub fn children(&self) -> impl Iterator<Item = ObjectRef<'a>> + 'a {
        let arena = self.arena;
        let id = self.id;
        (0..self.len() as u64).filter_map(move |index| {
            arena
                .child(id, index)
                .ok()
                .and_then(|child| arena.view(child))
        })
    }

    /// First map entry whose key equals `key`.
    pub fn get(&self, key: &str) -> Option<ObjectRef<'a>> {
        if self.kind() != ObjectKind::Map {
            return None;
        }
        self.children().find(|child| child.key() == Some(key))
    }
}

// ============================================================================
// Owned Trees
// ============================================================================

/// An arena together with the root object it was built for.
#[derive(Debug)]
pub struct ObjectTree {
    arena: ObjectArena,
    root: ObjectId,
}

impl ObjectTree {
    /// Creates an arena with a single invalid root object.
    pub fn new(tracker: AllocationTracker) -> Result<Self, ObjectError> {
        let mut arena = ObjectArena::new(tracker);
        let root = arena.alloc_root()?;
        Ok(Self { arena, root })
    }

    /// Builds a tree from JSON without any size limits. Booleans become
    /// `"true"`/`"false"`, `null` stays invalid.
    pub fn from_json(
        value: &serde_json::Value,
        tracker: AllocationTracker,
    ) -> Result<Self, ObjectError> {
        let mut tree = Self::new(tracker)?;
        let root = tree.root;
        fill_json(&mut tree.arena, root, value)?;
        Ok(tree)
    }

    pub fn root(&self) -> ObjectId {
        self.root
    }

    pub fn arena(&self) -> &ObjectArena {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut ObjectArena {
        &mut self.arena
    }

    pub fn view(&self) -> Option<ObjectRef<'_>> {
        self.arena.view(self.root)
    }
}

impl Drop for ObjectTree {
    fn drop(&mut self) {
        self.arena.release_root(self.root);
    }
}

fn fill_json(
    arena: &mut ObjectArena,
    id: ObjectId,
    value: &serde_json::Value,
) -> Result<(), ObjectError> {
    use serde_json::Value;

    match value {
        Value::Null => Ok(()),
        Value::Bool(flag) => {
            let text: &[u8] = if *flag { b"true" } else { b"false" };
            arena.set_string(id, text)
        }
        Value::Number(number) => {
            if let Some(unsigned) = number.as_u64() {
                arena.set_unsigned(id, unsigned)
            } else if let Some(signed) = number.as_i64() {
                arena.set_signed(id, signed)
            } else {
                arena.set_string(id, number.to_string().as_bytes())
            }
        }
        Value::String(text) => arena.set_string(id, text.as_bytes()),
        Value::Array(items) => {
            arena.set_container(id, ContainerKind::Array, items.len())?;
            for (index, item) in items.iter().enumerate() {
                let child = arena.child(id, index as u64)?;
                fill_json(arena, child, item)?;
            }
            Ok(())
        }
        Value::Object(entries) => {
            arena.set_container(id, ContainerKind::Map, entries.len())?;
            for (index, (key, item)) in entries.iter().enumerate() {
                let child = arena.child(id, index as u64)?;
                arena.set_key(child, key.as_bytes())?;
                fill_json(arena, child, item)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_string_and_key_are_tracked() {
        let tracker = AllocationTracker::new();
        {
            let mut tree = ObjectTree::new(tracker.clone()).unwrap();
            let root = tree.root();
            tree.arena_mut().set_key(root, b"name").unwrap();
            tree.arena_mut().set_string(root, b"value").unwrap();
            // root block, key, string
            assert_eq!(tracker.live(), 3);
            assert_eq!(tree.arena().live_allocations(), 3);
        }
        assert!(tracker.is_balanced());
    }

    #[test]
    fn test_free_releases_children_recursively() {
        let tracker = AllocationTracker::new();
        let mut tree = ObjectTree::from_json(
            &json!({"a": ["x", "y", {"b": "z"}], "c": 1}),
            tracker.clone(),
        )
        .unwrap();
        assert!(tracker.live() > 1);

        let root = tree.root();
        tree.arena_mut().free(root);
        assert_eq!(tree.arena().get(root).unwrap().kind(), ObjectKind::Invalid);
        // Only the root slot block remains.
        assert_eq!(tracker.live(), 1);

        drop(tree);
        assert!(tracker.is_balanced());
    }

    #[test]
    fn test_child_is_bounds_checked() {
        let mut tree = ObjectTree::new(AllocationTracker::new()).unwrap();
        let root = tree.root();
        tree.arena_mut()
            .set_container(root, ContainerKind::Array, 2)
            .unwrap();

        assert!(tree.arena().child(root, 1).is_ok());
        assert_eq!(
            tree.arena().child(root, 2),
            Err(ObjectError::OutOfBounds { index: 2, length: 2 })
        );

        tree.arena_mut().set_length(root, 1).unwrap();
        assert!(tree.arena().child(root, 1).is_err());
    }

    #[test]
    fn test_set_length_rejects_growth_past_capacity() {
        let mut tree = ObjectTree::new(AllocationTracker::new()).unwrap();
        let root = tree.root();
        tree.arena_mut()
            .set_container(root, ContainerKind::Map, 3)
            .unwrap();
        assert_eq!(
            tree.arena_mut().set_length(root, 4),
            Err(ObjectError::LengthExceedsCapacity { length: 4, capacity: 3 })
        );
    }

    #[test]
    fn test_child_of_scalar_is_rejected() {
        let mut tree = ObjectTree::new(AllocationTracker::new()).unwrap();
        let root = tree.root();
        tree.arena_mut().set_unsigned(root, 7).unwrap();
        assert_eq!(tree.arena().child(root, 0), Err(ObjectError::NotAContainer(root)));
    }

    #[test]
    fn test_released_blocks_are_reused() {
        let tracker = AllocationTracker::new();
        let mut tree = ObjectTree::new(tracker.clone()).unwrap();
        let root = tree.root();
        tree.arena_mut()
            .set_container(root, ContainerKind::Array, 4)
            .unwrap();
        let first = tree.arena().child(root, 0).unwrap();

        tree.arena_mut().free(root);
        tree.arena_mut()
            .set_container(root, ContainerKind::Array, 4)
            .unwrap();
        assert_eq!(tree.arena().child(root, 0).unwrap(), first);
        assert_eq!(tracker.live(), 2);
    }

    #[test]
    fn test_view_walks_maps() {
        let tree = ObjectTree::from_json(
            &json!({"headers": {"user-agent": "curl", "x-count": 3}}),
            AllocationTracker::new(),
        )
        .unwrap();

        let root = tree.view().unwrap();
        let headers = root.get("headers").unwrap();
        assert_eq!(headers.kind(), ObjectKind::Map);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers.get("user-agent").unwrap().as_str(), Some("curl"));
        assert_eq!(
            headers.get("x-count").unwrap().scalar_text().as_deref(),
            Some("3")
        );
        assert!(headers.get("missing").is_none());
    }

    #[test]
    fn test_as_bytes_respects_declared_length() {
        let mut tree = ObjectTree::new(AllocationTracker::new()).unwrap();
        let root = tree.root();
        tree.arena_mut().set_string(root, b"abcdef").unwrap();
        tree.arena_mut().set_length(root, 3).unwrap();
        assert_eq!(tree.view().unwrap().as_str(), Some("abc"));

        tree.arena_mut().set_length(root, 64).unwrap();
        assert_eq!(tree.view().unwrap().as_bytes(), None);
    }

    #[test]
    fn test_arena_drop_keeps_leaks_counted() {
        let tracker = AllocationTracker::new();
        let mut tree = ObjectTree::from_json(&json!({"a": ["x", "y"], "b": "z"}), tracker.clone())
            .unwrap();
        let live = tracker.live();
        assert!(live > 0);

        // Detach the populated arena so nothing frees it.
        let leaked = std::mem::replace(tree.arena_mut(), ObjectArena::new(tracker.clone()));
        let dropped = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| drop(leaked)));
        assert_eq!(dropped.is_err(), cfg!(debug_assertions));
        assert_eq!(tracker.live(), live);
        assert!(!tracker.is_balanced());
    }

    #[test]
    fn test_tree_drop_balances_tracker() {
        let tracker = AllocationTracker::new();
        let tree = ObjectTree::from_json(
            &json!({"a": ["x", {"b": "z"}], "c": [1, 2, 3], "d": null}),
            tracker.clone(),
        )
        .unwrap();
        assert!(tracker.live() > 1);
        drop(tree);
        assert!(tracker.is_balanced());
    }
}
