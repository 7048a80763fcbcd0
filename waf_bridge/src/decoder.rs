//! Engine objects back into host values.
//!
//! Used for the ruleset diagnostics returned at load time. Decoding fails
//! fast on the first malformed object.

use std::collections::BTreeMap;

use waf_engine::{Object, ObjectArena, ObjectId, ObjectKind, ObjectTree};

use crate::error::DecodeError;
use crate::value::Value;

pub fn decode_tree(tree: Option<&ObjectTree>) -> Result<Value, DecodeError> {
    let tree = tree.ok_or(DecodeError::NilObject)?;
    decode(tree.arena(), tree.root())
}

pub fn decode(arena: &ObjectArena, id: ObjectId) -> Result<Value, DecodeError> {
    let object = arena.get(id).ok_or(DecodeError::NilObject)?;
    let kind = object.kind();

    match kind {
        ObjectKind::Unsigned => object
            .as_unsigned()
            .map(Value::Unsigned)
            .ok_or(DecodeError::Unsupported(kind)),
        ObjectKind::Signed => object
            .as_signed()
            .map(Value::Signed)
            .ok_or(DecodeError::Unsupported(kind)),
        ObjectKind::String => decode_string(object),
        ObjectKind::Array => {
            let mut items = Vec::with_capacity(declared_length(object)?);
            for index in 0..object.length() {
                items.push(decode(arena, child(arena, id, index)?)?);
            }
            Ok(Value::Array(items))
        }
        ObjectKind::Map => {
            let entries = decode_map(arena, id)?;
            Ok(Value::Map(
                entries
                    .into_iter()
                    .map(|(key, value)| (Value::String(key), value))
                    .collect(),
            ))
        }
        ObjectKind::Invalid => Err(DecodeError::Unsupported(kind)),
    }
}

/// Decodes a map into its (key, value) entries in order.
pub fn decode_map(arena: &ObjectArena, id: ObjectId) -> Result<Vec<(String, Value)>, DecodeError> {
    let object = arena.get(id).ok_or(DecodeError::NilObject)?;
    if object.kind() != ObjectKind::Map {
        return Err(DecodeError::Unsupported(object.kind()));
    }

    let mut entries = Vec::with_capacity(declared_length(object)?);
    for index in 0..object.length() {
        let entry = child(arena, id, index)?;
        let key = arena
            .get(entry)
            .ok_or(DecodeError::NilObject)?
            .key()
            .filter(|key| !key.is_empty())
            .ok_or(DecodeError::InvalidMapKey)?;
        let key = String::from_utf8_lossy(key).into_owned();
        entries.push((key, decode(arena, entry)?));
    }
    Ok(entries)
}

/// Decodes the per-rule error map of a ruleset load. An empty map means
/// there is nothing to report.
pub fn decode_diagnostics(tree: &ObjectTree) -> Result<Option<BTreeMap<String, Value>>, DecodeError> {
    let entries = decode_map(tree.arena(), tree.root())?;
    if entries.is_empty() {
        return Ok(None);
    }
    Ok(Some(entries.into_iter().collect()))
}

fn decode_string(object: &Object) -> Result<Value, DecodeError> {
    let buffer = object.string_buffer().ok_or(DecodeError::NilObject)?;
    let length = declared_length(object)?;
    let bytes = buffer.get(..length).ok_or_else(|| {
        DecodeError::InvalidArgument(format!(
            "string length {} exceeds its {}-byte buffer",
            length,
            buffer.len()
        ))
    })?;

    Ok(match std::str::from_utf8(bytes) {
        Ok(text) => Value::String(text.to_string()),
        Err(_) => Value::Bytes(bytes.to_vec()),
    })
}

fn declared_length(object: &Object) -> Result<usize, DecodeError> {
    usize::try_from(object.length()).map_err(|_| {
        DecodeError::InvalidArgument(format!("length {} is not representable", object.length()))
    })
}

fn child(arena: &ObjectArena, id: ObjectId, index: u64) -> Result<ObjectId, DecodeError> {
    arena
        .child(id, index)
        .map_err(|err| DecodeError::InvalidArgument(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{Encoder, EncoderLimits};
    use rand::distributions::Alphanumeric;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use serde_json::json;
    use waf_engine::{AllocationTracker, ContainerKind};

    fn native_encoder() -> Encoder {
        Encoder::new(EncoderLimits::default(), AllocationTracker::new()).with_numbers_as_strings(false)
    }

    fn random_value(rng: &mut StdRng, depth: usize) -> Value {
        let choice = if depth == 0 { rng.gen_range(0..3) } else { rng.gen_range(0..5) };
        match choice {
            0 => Value::Unsigned(rng.gen()),
            1 => Value::Signed(rng.gen_range(i64::MIN..0)),
            2 => {
                let length = rng.gen_range(0..64);
                Value::String((&mut *rng).sample_iter(Alphanumeric).take(length).map(char::from).collect())
            }
            3 => {
                let length = rng.gen_range(0..8);
                Value::Array((0..length).map(|_| random_value(rng, depth - 1)).collect())
            }
            _ => {
                let length = rng.gen_range(0..8);
                Value::map((0..length).map(|i| (format!("key{i}"), random_value(rng, depth - 1))))
            }
        }
    }

    #[test]
    fn test_round_trip_within_budgets() {
        let encoder = native_encoder();
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..64 {
            let value = Value::map([("root", random_value(&mut rng, 4))]);
            let tree = encoder.encode(&value).unwrap();
            assert_eq!(decode_tree(Some(&tree)).unwrap(), value);
        }
    }

    #[test]
    fn test_round_trip_preserves_map_order() {
        let value = Value::map([("z", 1u8), ("a", 2u8), ("m", 3u8)]);
        let tree = native_encoder().encode(&value).unwrap();
        let entries = decode_map(tree.arena(), tree.root()).unwrap();
        let keys: Vec<_> = entries.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["z", "a", "m"]);
    }

    #[test]
    fn test_missing_tree_is_nil_object() {
        assert_eq!(decode_tree(None), Err(DecodeError::NilObject));
    }

    #[test]
    fn test_stale_id_is_nil_object() {
        let large = native_encoder().encode(&Value::from(vec![1u8, 2, 3, 4])).unwrap();
        let foreign = large.arena().child(large.root(), 3).unwrap();
        let small = ObjectTree::new(AllocationTracker::new()).unwrap();
        assert_eq!(decode(small.arena(), foreign), Err(DecodeError::NilObject));
    }

    #[test]
    fn test_map_entry_without_key_is_rejected() {
        for key in [None, Some(&b""[..])] {
            let mut tree = ObjectTree::new(AllocationTracker::new()).unwrap();
            let root = tree.root();
            let arena = tree.arena_mut();
            arena.set_container(root, ContainerKind::Map, 1).unwrap();
            let entry = arena.child(root, 0).unwrap();
            if let Some(key) = key {
                arena.set_key(entry, key).unwrap();
            }
            arena.set_string(entry, b"value").unwrap();

            assert_eq!(decode_tree(Some(&tree)), Err(DecodeError::InvalidMapKey));
        }
    }

    #[test]
    fn test_string_length_past_buffer_is_invalid_argument() {
        let mut tree = ObjectTree::new(AllocationTracker::new()).unwrap();
        let root = tree.root();
        tree.arena_mut().set_string(root, b"abc").unwrap();
        tree.arena_mut().set_length(root, 10).unwrap();

        assert!(matches!(
            decode_tree(Some(&tree)),
            Err(DecodeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_invalid_object_is_unsupported() {
        let tree = ObjectTree::new(AllocationTracker::new()).unwrap();
        assert_eq!(
            decode_tree(Some(&tree)),
            Err(DecodeError::Unsupported(ObjectKind::Invalid))
        );
    }

    #[test]
    fn test_non_utf8_string_decodes_to_bytes() {
        let tree = native_encoder().encode(&Value::bytes(vec![0xff, 0xfe])).unwrap();
        assert_eq!(decode_tree(Some(&tree)).unwrap(), Value::bytes(vec![0xff, 0xfe]));
    }

    #[test]
    fn test_empty_diagnostics_become_none() {
        let tracker = AllocationTracker::new();
        let empty = ObjectTree::from_json(&json!({}), tracker.clone()).unwrap();
        assert_eq!(decode_diagnostics(&empty).unwrap(), None);

        let errors = ObjectTree::from_json(&json!({"missing key 'id'": ["index:0"]}), tracker).unwrap();
        let decoded = decode_diagnostics(&errors).unwrap().unwrap();
        assert_eq!(
            decoded["missing key 'id'"],
            Value::Array(vec![Value::from("index:0")])
        );
    }
}
