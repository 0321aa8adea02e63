//! Helpers over untyped cluster objects.
//!
//! Objects are carried as `serde_json::Value` in the Kubernetes resource
//! shape: `apiVersion`, `kind`, `metadata{name, namespace, annotations}`,
//! and kind-specific payload (`data` for secrets, `spec`/`status` for
//! certificates).

use serde_json::{json, Map, Value};

/// Build a bare object of the given kind and name.
pub fn new_object(api_version: &str, kind: &str, name: &str) -> Value {
    json!({
        "apiVersion": api_version,
        "kind": kind,
        "metadata": {
            "name": name,
            "annotations": {}
        }
    })
}

/// The object's `metadata.name`, if present.
pub fn object_name(obj: &Value) -> Option<&str> {
    obj.pointer("/metadata/name").and_then(Value::as_str)
}

/// The object's `kind`, if present.
pub fn object_kind(obj: &Value) -> Option<&str> {
    obj.get("kind").and_then(Value::as_str)
}

/// Read one annotation.
pub fn annotation<'a>(obj: &'a Value, key: &str) -> Option<&'a str> {
    obj.pointer("/metadata/annotations")
        .and_then(|a| a.get(key))
        .and_then(Value::as_str)
}

/// Write one annotation, creating the annotation map if needed.
pub fn set_annotation(obj: &mut Value, key: &str, value: &str) {
    let metadata = obj
        .as_object_mut()
        .expect("cluster object must be a JSON object")
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    let annotations = metadata
        .as_object_mut()
        .expect("metadata must be a JSON object")
        .entry("annotations")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Some(map) = annotations.as_object_mut() {
        map.insert(key.to_string(), Value::String(value.to_string()));
    }
}

/// Set `metadata.namespace`.
pub fn set_namespace(obj: &mut Value, namespace: &str) {
    if let Some(metadata) = obj.pointer_mut("/metadata").and_then(Value::as_object_mut) {
        metadata.insert("namespace".into(), Value::String(namespace.into()));
    }
}

/// A secret's `data` map, if present.
pub fn secret_data(obj: &Value) -> Option<&Map<String, Value>> {
    obj.get("data").and_then(Value::as_object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::ANNOTATION_CONTROLLED;

    #[test]
    fn annotations_survive_a_round_trip() {
        let mut obj = new_object("v1", "Secret", "skx-site-abc");
        set_annotation(&mut obj, ANNOTATION_CONTROLLED, "true");
        set_namespace(&mut obj, "van-fabric");
        assert_eq!(object_name(&obj), Some("skx-site-abc"));
        assert_eq!(object_kind(&obj), Some("Secret"));
        assert_eq!(annotation(&obj, ANNOTATION_CONTROLLED), Some("true"));
        assert_eq!(obj.pointer("/metadata/namespace").unwrap(), "van-fabric");
    }

    #[test]
    fn missing_annotation_is_none() {
        let obj = new_object("v1", "Secret", "s");
        assert_eq!(annotation(&obj, "absent"), None);
    }
}
