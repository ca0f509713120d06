//! Contains the ordered `Document` type.

use std::fmt;

use super::{oid::ObjectId, Array, Bson};

/// An ordered sequence of named elements.
///
/// Insertion order is preserved and is the order in which elements are
/// encoded. Keys are unique when a document is built through [`insert`];
/// decoding tolerates duplicate keys in the incoming byte stream, in which
/// case lookups return the first occurrence.
///
/// [`insert`]: Document::insert
#[derive(Clone, Default, PartialEq)]
pub struct Document {
    entries: Vec<(String, Bson)>,
}

impl Document {
    /// Creates a new empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of elements.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts a value under `key`, replacing and returning any element
    /// already stored under that key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Bson>) -> Option<Bson> {
        let key = key.into();
        let value = value.into();
        debug_assert!(
            !key.contains('\0'),
            "document keys are encoded as cstrings and cannot contain NUL"
        );
        for (existing, slot) in self.entries.iter_mut() {
            if *existing == key {
                return Some(std::mem::replace(slot, value));
            }
        }
        self.entries.push((key, value));
        None
    }

    /// Appends an element without checking for duplicates. Used by the
    /// decoder, which must accept duplicate keys from the wire.
    pub(crate) fn push_unchecked(&mut self, key: String, value: Bson) {
        self.entries.push((key, value));
    }

    /// Removes and returns the first element stored under `key`.
    pub fn remove(&mut self, key: &str) -> Option<Bson> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    /// Returns the first value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&Bson> {
        self.entries
            .iter()
            .find_map(|(k, v)| (k == key).then_some(v))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.get(key) {
            Some(&Bson::Double(d)) => Some(d),
            _ => None,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(Bson::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_document(&self, key: &str) -> Option<&Document> {
        match self.get(key) {
            Some(Bson::Document(doc)) => Some(doc),
            _ => None,
        }
    }

    pub fn get_array(&self, key: &str) -> Option<&Array> {
        match self.get(key) {
            Some(Bson::Array(array)) => Some(array),
            _ => None,
        }
    }

    pub fn get_object_id(&self, key: &str) -> Option<ObjectId> {
        match self.get(key) {
            Some(&Bson::ObjectId(id)) => Some(id),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key) {
            Some(&Bson::Boolean(b)) => Some(b),
            _ => None,
        }
    }

    pub fn get_i32(&self, key: &str) -> Option<i32> {
        match self.get(key) {
            Some(&Bson::Int32(i)) => Some(i),
            _ => None,
        }
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.get(key) {
            Some(&Bson::Int64(i)) => Some(i),
            _ => None,
        }
    }

    /// Reads a numeric element of any width as an `i64`.
    pub fn get_numeric(&self, key: &str) -> Option<i64> {
        match self.get(key) {
            Some(&Bson::Int32(i)) => Some(i64::from(i)),
            Some(&Bson::Int64(i)) => Some(i),
            Some(&Bson::Double(d)) => Some(d as i64),
            _ => None,
        }
    }

    /// Iterates over `(key, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bson)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ ")?;
        let mut first = true;
        for (key, value) in self.iter() {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "\"{}\": {}", key, value)?;
        }
        write!(f, " }}")
    }
}

impl FromIterator<(String, Bson)> for Document {
    fn from_iter<T: IntoIterator<Item = (String, Bson)>>(iter: T) -> Self {
        let mut doc = Document::new();
        for (key, value) in iter {
            doc.insert(key, value);
        }
        doc
    }
}

impl IntoIterator for Document {
    type Item = (String, Bson);
    type IntoIter = std::vec::IntoIter<(String, Bson)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
