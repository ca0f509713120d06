//! A value deserializer so typed structs can be read out of decoded
//! documents with `#[derive(Deserialize)]`, the way command replies are
//! mapped throughout the crate.

use std::fmt;

use serde::de::{
    self, DeserializeOwned, DeserializeSeed, Deserializer, IntoDeserializer, MapAccess, SeqAccess,
    Visitor,
};

use super::{Bson, Document};
use crate::error::{Error, Result};

/// Deserializes a `T` from a document.
pub fn from_document<T: DeserializeOwned>(document: Document) -> Result<T> {
    from_bson(Bson::Document(document))
}

/// Deserializes a `T` from any value.
pub fn from_bson<T: DeserializeOwned>(value: Bson) -> Result<T> {
    T::deserialize(BsonDeserializer { value })
        .map_err(|e: DeserializationError| Error::reply_validation(e.message))
}

#[derive(Debug)]
struct DeserializationError {
    message: String,
}

impl fmt::Display for DeserializationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for DeserializationError {}

impl de::Error for DeserializationError {
    fn custom<T: fmt::Display>(message: T) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

struct BsonDeserializer {
    value: Bson,
}

impl<'de> Deserializer<'de> for BsonDeserializer {
    type Error = DeserializationError;

    fn deserialize_any<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> std::result::Result<V::Value, Self::Error> {
        match self.value {
            Bson::Double(d) => visitor.visit_f64(d),
            Bson::String(s) | Bson::Symbol(s) | Bson::JavaScriptCode(s) => visitor.visit_string(s),
            Bson::Document(doc) => visitor.visit_map(DocumentAccess {
                entries: doc.into_iter(),
                value: None,
            }),
            Bson::Array(array) => visitor.visit_seq(ArrayAccess {
                items: array.into_iter(),
            }),
            Bson::Boolean(b) => visitor.visit_bool(b),
            Bson::DateTime(ms) => visitor.visit_i64(ms),
            Bson::Null | Bson::Undefined => visitor.visit_unit(),
            Bson::Int32(i) => visitor.visit_i32(i),
            Bson::Int64(i) => visitor.visit_i64(i),
            Bson::ObjectId(id) => visitor.visit_string(id.to_hex()),
            other => Err(de::Error::custom(format!(
                "cannot extract a typed value from {:?}",
                other.element_type()
            ))),
        }
    }

    fn deserialize_option<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> std::result::Result<V::Value, Self::Error> {
        match self.value {
            Bson::Null | Bson::Undefined => visitor.visit_none(),
            _ => visitor.visit_some(self),
        }
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> std::result::Result<V::Value, Self::Error> {
        visitor.visit_newtype_struct(self)
    }

    serde::forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf unit unit_struct seq tuple tuple_struct map struct
        enum identifier ignored_any
    }
}

struct DocumentAccess {
    entries: std::vec::IntoIter<(String, Bson)>,
    value: Option<Bson>,
}

impl<'de> MapAccess<'de> for DocumentAccess {
    type Error = DeserializationError;

    fn next_key_seed<K: DeserializeSeed<'de>>(
        &mut self,
        seed: K,
    ) -> std::result::Result<Option<K::Value>, Self::Error> {
        match self.entries.next() {
            Some((key, value)) => {
                self.value = Some(value);
                seed.deserialize(key.into_deserializer()).map(Some)
            }
            None => Ok(None),
        }
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(
        &mut self,
        seed: V,
    ) -> std::result::Result<V::Value, Self::Error> {
        let value = self.value.take().expect("value read before key");
        seed.deserialize(BsonDeserializer { value })
    }
}

struct ArrayAccess {
    items: std::vec::IntoIter<Bson>,
}

impl<'de> SeqAccess<'de> for ArrayAccess {
    type Error = DeserializationError;

    fn next_element_seed<T: DeserializeSeed<'de>>(
        &mut self,
        seed: T,
    ) -> std::result::Result<Option<T::Value>, Self::Error> {
        match self.items.next() {
            Some(value) => seed.deserialize(BsonDeserializer { value }).map(Some),
            None => Ok(None),
        }
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.items.len())
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use serde::Deserialize;

    use crate::bson::{doc, from_document};

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct Status {
        ok: f64,
        set_name: Option<String>,
        hosts: Option<Vec<String>>,
        tags: Option<HashMap<String, String>>,
        max_bson_object_size: Option<i64>,
    }

    #[test]
    fn typed_extraction_from_reply_shape() {
        let doc = doc! {
            "ok": 1.0,
            "setName": "rs0",
            "hosts": ["a:27017", "b:27017"],
            "tags": { "dc": "east" },
            "maxBsonObjectSize": 16777216,
        };

        let status: Status = from_document(doc).unwrap();
        assert_eq!(status.ok, 1.0);
        assert_eq!(status.set_name.as_deref(), Some("rs0"));
        assert_eq!(
            status.hosts,
            Some(vec!["a:27017".to_string(), "b:27017".to_string()])
        );
        assert_eq!(status.tags.unwrap()["dc"], "east");
        assert_eq!(status.max_bson_object_size, Some(16_777_216));
    }

    #[test]
    fn missing_optional_fields_are_none() {
        let status: Status = from_document(doc! { "ok": 1.0 }).unwrap();
        assert_eq!(status.set_name, None);
        assert_eq!(status.hosts, None);
    }

    #[test]
    fn shape_mismatch_is_a_validation_error() {
        let err = from_document::<Status>(doc! { "ok": "nope" }).unwrap_err();
        assert!(matches!(
            *err.kind,
            crate::error::ErrorKind::ReplyValidation { .. }
        ));
    }
}
