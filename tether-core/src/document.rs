//! Local documents: the last-known server state of one entity.
//!
//! A [`Document`] is a partial bag of wire fields. Merging an incoming
//! document only ever touches the fields it carries, so a partial response
//! can never clear a value that is already known locally.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Mutable bag of named field values keyed by wire key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document {
    fields: Map<String, Value>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a document from a JSON value. Returns `None` unless the value is an object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self { fields }),
            _ => None,
        }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Decode a field into a typed value. Absent and null fields decode to `Ok(None)`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, serde_json::Error> {
        match self.fields.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone()).map(Some),
        }
    }

    /// The remote id carried by the document, if any.
    pub fn id(&self) -> Option<&str> {
        self.fields.get("id").and_then(Value::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.fields.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Assign every field of `incoming` that `skip` does not reject.
    ///
    /// Returns the keys that were assigned, in `incoming` order. Keys absent
    /// from `incoming` are left untouched.
    pub fn merge_from<F>(&mut self, incoming: &Document, mut skip: F) -> Vec<String>
    where
        F: FnMut(&str) -> bool,
    {
        let mut assigned = Vec::new();
        for (key, value) in incoming.fields.iter() {
            if skip(key) {
                continue;
            }
            self.fields.insert(key.clone(), value.clone());
            assigned.push(key.clone());
        }
        assigned
    }
}

impl From<Map<String, Value>> for Document {
    fn from(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        Document::from_value(value).unwrap()
    }

    #[test]
    fn test_from_value_rejects_non_objects() {
        assert!(Document::from_value(json!([1, 2])).is_none());
        assert!(Document::from_value(json!("x")).is_none());
        assert!(Document::from_value(json!({})).is_some());
    }

    #[test]
    fn test_merge_leaves_absent_fields() {
        let mut local = doc(json!({"name": "A", "desc": "keep me"}));
        let incoming = doc(json!({"name": "B"}));

        let assigned = local.merge_from(&incoming, |_| false);

        assert_eq!(assigned, vec!["name".to_string()]);
        assert_eq!(local.get("name"), Some(&json!("B")));
        assert_eq!(local.get("desc"), Some(&json!("keep me")));
    }

    #[test]
    fn test_merge_respects_skip() {
        let mut local = doc(json!({"name": "local"}));
        let incoming = doc(json!({"name": "remote", "pos": 3}));

        let assigned = local.merge_from(&incoming, |k| k == "name");

        assert_eq!(assigned, vec!["pos".to_string()]);
        assert_eq!(local.get("name"), Some(&json!("local")));
    }

    #[test]
    fn test_explicit_null_is_assigned() {
        let mut local = doc(json!({"due": "2024-01-01"}));
        local.merge_from(&doc(json!({"due": null})), |_| false);
        assert_eq!(local.get("due"), Some(&Value::Null));
    }

    #[test]
    fn test_get_as_and_id() {
        let d = doc(json!({"id": "abc", "pos": 16384.5}));
        assert_eq!(d.id(), Some("abc"));
        assert_eq!(d.get_as::<f64>("pos").unwrap(), Some(16384.5));
        assert_eq!(d.get_as::<f64>("missing").unwrap(), None);
        assert!(d.get_as::<u32>("id").is_err());
    }
}
