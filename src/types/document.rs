use indexmap::IndexMap;

use super::Value;

/// An ordered mapping from string keys to values.
///
/// Keys are unique; insertion order is preserved and `set` on an existing key
/// replaces the value in place without moving it. A document may also carry an
/// auxiliary record id used by capped collections; it is `None` when unused.
#[derive(Debug, Clone, Default)]
pub struct Document {
    fields: IndexMap<String, Value>,
    record_id: Option<i64>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
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

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.fields.values()
    }

    /// Iterates (key, value) pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.fields.get_mut(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Appends a new key or replaces an existing one in place, preserving its
    /// original position.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    /// Removes a key, preserving the order of the remaining keys.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.shift_remove(key)
    }

    /// The capped-collection record id, or `None` when unset.
    pub fn record_id(&self) -> Option<i64> {
        self.record_id
    }

    pub fn set_record_id(&mut self, record_id: Option<i64>) {
        self.record_id = record_id;
    }
}

// IndexMap equality ignores order, so spell out ordered comparison.
impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        self.record_id == other.record_id
            && self.fields.len() == other.fields.len()
            && self
                .fields
                .iter()
                .zip(other.fields.iter())
                .all(|((ka, va), (kb, vb))| ka == kb && va == vb)
    }
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut doc = Document::new();
        for (k, v) in iter {
            doc.set(k, v);
        }
        doc
    }
}

/// Builds a [`Document`] from `key => value` pairs in order.
#[macro_export]
macro_rules! document {
    () => { $crate::types::Document::new() };
    ($($k:expr => $v:expr),+ $(,)?) => {{
        let mut doc = $crate::types::Document::new();
        $( doc.set($k, $crate::types::Value::from($v)); )+
        doc
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_preserves_insertion_order() {
        let mut doc = Document::new();
        doc.set("b", Value::Int32(1));
        doc.set("a", Value::Int32(2));
        doc.set("c", Value::Int32(3));

        let keys: Vec<_> = doc.keys().collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
    }

    #[test]
    fn set_replaces_in_place() {
        let mut doc = document!("x" => 1, "y" => 2, "z" => 3);
        doc.set("y", Value::String("replaced".into()));

        let keys: Vec<_> = doc.keys().collect();
        assert_eq!(keys, vec!["x", "y", "z"]);
        assert_eq!(doc.get("y"), Some(&Value::String("replaced".into())));
    }

    #[test]
    fn equality_is_order_sensitive() {
        let a = document!("x" => 1, "y" => 2);
        let b = document!("y" => 2, "x" => 1);
        assert_ne!(a, b);
        assert_eq!(a, document!("x" => 1, "y" => 2));
    }

    #[test]
    fn record_id_defaults_to_unset() {
        let mut doc = Document::new();
        assert_eq!(doc.record_id(), None);
        doc.set_record_id(Some(42));
        assert_eq!(doc.record_id(), Some(42));
    }
}
