//! Content identity of a simulation.
//!
//! The canonical settings are serialized to JSON with all object keys
//! sorted (recursively, so the identity cannot depend on the key
//! order of the user's input), wrapped in URL-safe base64, and the
//! archive name is the MD5 digest of that string, URL-safe base64
//! encoded without padding: 22 characters.

use base64::{
    engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD},
    Engine,
};
use md5::{Digest, Md5};
use serde_json::Value;

use crate::serde::archive_name::ArchiveName;

/// Rebuild `value` with every object's keys in sorted order. Arrays
/// keep their element order.
fn with_sorted_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by_key(|(k, _)| k.as_str());
            let mut out = serde_json::Map::new();
            for (k, v) in entries {
                out.insert(k.clone(), with_sorted_keys(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(with_sorted_keys).collect()),
        other => other.clone(),
    }
}

/// The base64 form of an object, as stored in `simulations.list`.
pub fn object_to_base64(value: &Value) -> String {
    let json = serde_json::to_string(&with_sorted_keys(value)).expect("serializing Value");
    URL_SAFE.encode(json.as_bytes())
}

/// Decode a catalog entry back into its settings object.
pub fn object_from_base64(s: &str) -> anyhow::Result<Value> {
    let bytes = URL_SAFE
        .decode(s.as_bytes())
        .map_err(crate::ctx!("decoding base64 settings"))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Hash an identity string into an archive name.
pub fn hash_to_archive_name(s: &str) -> ArchiveName {
    let digest = Md5::digest(s.as_bytes());
    ArchiveName::from_encoded(URL_SAFE_NO_PAD.encode(digest))
}

/// The archive name of a settings object: hash of its base64 form.
pub fn archive_name(settings: &Value) -> ArchiveName {
    hash_to_archive_name(&object_to_base64(settings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn t_name_length_and_charset() {
        let name = archive_name(&json!([{"a": 1, "b": 2.5}]));
        assert_eq!(name.as_str().len(), 22);
        assert!(name.as_str().parse::<ArchiveName>().is_ok());
    }

    #[test]
    fn t_key_order_does_not_matter() {
        let a: Value = serde_json::from_str(r#"[{"n": 2, "x": [1, 2], "name": "run"}]"#).unwrap();
        let b: Value = serde_json::from_str(r#"[{"name": "run", "x": [1, 2], "n": 2}]"#).unwrap();
        assert_eq!(archive_name(&a), archive_name(&b));
    }

    #[test]
    fn t_value_differences_matter() {
        assert_ne!(
            archive_name(&json!([{"n": 2}])),
            archive_name(&json!([{"n": 3}]))
        );
        // 2 and 2.0 are distinct here; collapsing them is the job of
        // the `intFloats` fixer, upstream of hashing.
        assert_ne!(
            archive_name(&json!([{"n": 2}])),
            archive_name(&json!([{"n": 2.0}]))
        );
    }

    #[test]
    fn t_base64_round_trip() {
        let v = json!([{"n": 2, "s": "π"}]);
        let b = object_to_base64(&v);
        let back = object_from_base64(&b).unwrap();
        assert_eq!(back, with_sorted_keys(&v));
    }
}
