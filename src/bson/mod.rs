//! The binary document format: values, the ordered [`Document`] container,
//! object-id generation, and the wire codec.
//!
//! Every value is one variant of the closed [`Bson`] set; operations over
//! values are plain `match` expressions.

mod decode;
mod document;
mod encode;
#[macro_use]
mod macros;
pub mod oid;
mod serde;
pub mod spec;

use std::fmt;

pub use crate::{bson, doc};

pub use self::{
    decode::{decode_document, decode_document_from_slice},
    document::Document,
    encode::{encode_document, encoded_document_size},
    oid::ObjectId,
    serde::{from_bson, from_document},
    spec::{BinarySubtype, ElementType, DEFAULT_MAX_DOCUMENT_SIZE},
};

/// An array is a document whose keys are the decimal indices "0", "1", ...;
/// in memory it is just a sequence of values.
pub type Array = Vec<Bson>;

/// A value of any of the types an element can carry.
#[derive(Clone, Debug, PartialEq)]
pub enum Bson {
    /// 64-bit floating point.
    Double(f64),
    /// UTF-8 string.
    String(String),
    /// Embedded document.
    Document(Document),
    /// Array.
    Array(Array),
    /// Binary data with a subtype byte.
    Binary(Binary),
    /// Deprecated undefined value.
    Undefined,
    /// 12-byte object id.
    ObjectId(ObjectId),
    /// Boolean.
    Boolean(bool),
    /// Milliseconds since the Unix epoch, UTC.
    DateTime(i64),
    /// Null.
    Null,
    /// Regular expression pattern and options.
    RegularExpression(Regex),
    /// Deprecated database pointer.
    DbPointer(DbPointer),
    /// JavaScript code.
    JavaScriptCode(String),
    /// Deprecated symbol.
    Symbol(String),
    /// JavaScript code with a scope document.
    JavaScriptCodeWithScope(JavaScriptCodeWithScope),
    /// 32-bit signed integer.
    Int32(i32),
    /// Internal replication timestamp.
    Timestamp(Timestamp),
    /// 64-bit signed integer.
    Int64(i64),
    /// Smaller than any other value.
    MinKey,
    /// Larger than any other value.
    MaxKey,
}

impl Bson {
    /// The tag this value is encoded with.
    pub fn element_type(&self) -> ElementType {
        match self {
            Bson::Double(..) => ElementType::Double,
            Bson::String(..) => ElementType::String,
            Bson::Document(..) => ElementType::EmbeddedDocument,
            Bson::Array(..) => ElementType::Array,
            Bson::Binary(..) => ElementType::Binary,
            Bson::Undefined => ElementType::Undefined,
            Bson::ObjectId(..) => ElementType::ObjectId,
            Bson::Boolean(..) => ElementType::Boolean,
            Bson::DateTime(..) => ElementType::DateTime,
            Bson::Null => ElementType::Null,
            Bson::RegularExpression(..) => ElementType::RegularExpression,
            Bson::DbPointer(..) => ElementType::DbPointer,
            Bson::JavaScriptCode(..) => ElementType::JavaScriptCode,
            Bson::Symbol(..) => ElementType::Symbol,
            Bson::JavaScriptCodeWithScope(..) => ElementType::JavaScriptCodeWithScope,
            Bson::Int32(..) => ElementType::Int32,
            Bson::Timestamp(..) => ElementType::Timestamp,
            Bson::Int64(..) => ElementType::Int64,
            Bson::MinKey => ElementType::MinKey,
            Bson::MaxKey => ElementType::MaxKey,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Bson::Document(doc) => Some(doc),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Bson::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Bson {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bson::Double(d) => write!(f, "{}", d),
            Bson::String(s) => write!(f, "\"{}\"", s),
            Bson::Document(doc) => write!(f, "{}", doc),
            Bson::Array(array) => {
                write!(f, "[")?;
                for (i, item) in array.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Bson::Binary(b) => write!(f, "BinData({}, {})", u8::from(b.subtype), hex::encode(&b.bytes)),
            Bson::Undefined => write!(f, "undefined"),
            Bson::ObjectId(id) => write!(f, "ObjectId(\"{}\")", id),
            Bson::Boolean(b) => write!(f, "{}", b),
            Bson::DateTime(ms) => write!(f, "Date({})", ms),
            Bson::Null => write!(f, "null"),
            Bson::RegularExpression(regex) => write!(f, "/{}/{}", regex.pattern, regex.options),
            Bson::DbPointer(p) => write!(f, "DbPointer(\"{}\", {})", p.namespace, p.id),
            Bson::JavaScriptCode(code) => write!(f, "{}", code),
            Bson::Symbol(s) => write!(f, "Symbol(\"{}\")", s),
            Bson::JavaScriptCodeWithScope(c) => write!(f, "{}", c.code),
            Bson::Int32(i) => write!(f, "{}", i),
            Bson::Timestamp(t) => write!(f, "Timestamp({}, {})", t.time, t.increment),
            Bson::Int64(i) => write!(f, "{}", i),
            Bson::MinKey => write!(f, "MinKey"),
            Bson::MaxKey => write!(f, "MaxKey"),
        }
    }
}

/// Binary data together with its subtype byte.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binary {
    pub subtype: BinarySubtype,
    pub bytes: Vec<u8>,
}

/// A regular expression pattern and its options string. Options are stored
/// sorted, as the encoded form requires.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Regex {
    pub pattern: String,
    pub options: String,
}

impl Regex {
    pub fn new(pattern: impl Into<String>, options: impl Into<String>) -> Self {
        let mut options: Vec<char> = options.into().chars().collect();
        options.sort_unstable();
        Self {
            pattern: pattern.into(),
            options: options.into_iter().collect(),
        }
    }
}

/// An internal MongoDB timestamp: seconds and an ordinal within the second.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub time: u32,
    pub increment: u32,
}

/// A deprecated pointer into another namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DbPointer {
    pub namespace: String,
    pub id: ObjectId,
}

/// JavaScript code bundled with a scope document.
#[derive(Clone, Debug, PartialEq)]
pub struct JavaScriptCodeWithScope {
    pub code: String,
    pub scope: Document,
}

impl From<f64> for Bson {
    fn from(value: f64) -> Self {
        Bson::Double(value)
    }
}

impl From<&str> for Bson {
    fn from(value: &str) -> Self {
        Bson::String(value.to_string())
    }
}

impl From<String> for Bson {
    fn from(value: String) -> Self {
        Bson::String(value)
    }
}

impl From<Document> for Bson {
    fn from(value: Document) -> Self {
        Bson::Document(value)
    }
}

impl From<Binary> for Bson {
    fn from(value: Binary) -> Self {
        Bson::Binary(value)
    }
}

impl From<ObjectId> for Bson {
    fn from(value: ObjectId) -> Self {
        Bson::ObjectId(value)
    }
}

impl From<bool> for Bson {
    fn from(value: bool) -> Self {
        Bson::Boolean(value)
    }
}

impl From<i32> for Bson {
    fn from(value: i32) -> Self {
        Bson::Int32(value)
    }
}

impl From<i64> for Bson {
    fn from(value: i64) -> Self {
        Bson::Int64(value)
    }
}

impl From<u32> for Bson {
    fn from(value: u32) -> Self {
        Bson::Int64(i64::from(value))
    }
}

impl From<Regex> for Bson {
    fn from(value: Regex) -> Self {
        Bson::RegularExpression(value)
    }
}

impl From<Timestamp> for Bson {
    fn from(value: Timestamp) -> Self {
        Bson::Timestamp(value)
    }
}

impl<T: Into<Bson>> From<Option<T>> for Bson {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => value.into(),
            None => Bson::Null,
        }
    }
}

impl<T: Into<Bson>> From<Vec<T>> for Bson {
    fn from(value: Vec<T>) -> Self {
        Bson::Array(value.into_iter().map(Into::into).collect())
    }
}
