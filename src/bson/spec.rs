//! Constants of the binary document format.

/// The type tag that prefixes every element in an encoded document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ElementType {
    Double = 0x01,
    String = 0x02,
    EmbeddedDocument = 0x03,
    Array = 0x04,
    Binary = 0x05,
    Undefined = 0x06,
    ObjectId = 0x07,
    Boolean = 0x08,
    DateTime = 0x09,
    Null = 0x0A,
    RegularExpression = 0x0B,
    DbPointer = 0x0C,
    JavaScriptCode = 0x0D,
    Symbol = 0x0E,
    JavaScriptCodeWithScope = 0x0F,
    Int32 = 0x10,
    Timestamp = 0x11,
    Int64 = 0x12,
    MinKey = 0xFF,
    MaxKey = 0x7F,
}

impl ElementType {
    pub fn from_u8(tag: u8) -> Option<Self> {
        use ElementType::*;

        Some(match tag {
            0x01 => Double,
            0x02 => String,
            0x03 => EmbeddedDocument,
            0x04 => Array,
            0x05 => Binary,
            0x06 => Undefined,
            0x07 => ObjectId,
            0x08 => Boolean,
            0x09 => DateTime,
            0x0A => Null,
            0x0B => RegularExpression,
            0x0C => DbPointer,
            0x0D => JavaScriptCode,
            0x0E => Symbol,
            0x0F => JavaScriptCodeWithScope,
            0x10 => Int32,
            0x11 => Timestamp,
            0x12 => Int64,
            0xFF => MinKey,
            0x7F => MaxKey,
            _ => return None,
        })
    }
}

/// The subtype byte carried by binary elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinarySubtype {
    Generic,
    Function,
    BinaryOld,
    UuidOld,
    Uuid,
    Md5,
    UserDefined(u8),
}

impl From<BinarySubtype> for u8 {
    fn from(subtype: BinarySubtype) -> Self {
        match subtype {
            BinarySubtype::Generic => 0x00,
            BinarySubtype::Function => 0x01,
            BinarySubtype::BinaryOld => 0x02,
            BinarySubtype::UuidOld => 0x03,
            BinarySubtype::Uuid => 0x04,
            BinarySubtype::Md5 => 0x05,
            BinarySubtype::UserDefined(b) => b,
        }
    }
}

impl From<u8> for BinarySubtype {
    fn from(byte: u8) -> Self {
        match byte {
            0x00 => BinarySubtype::Generic,
            0x01 => BinarySubtype::Function,
            0x02 => BinarySubtype::BinaryOld,
            0x03 => BinarySubtype::UuidOld,
            0x04 => BinarySubtype::Uuid,
            0x05 => BinarySubtype::Md5,
            b => BinarySubtype::UserDefined(b),
        }
    }
}

/// The default maximum size in bytes of a document the decoder will accept.
/// Matches the server's 16 MiB document limit plus slack for message
/// envelopes built around a maximum-size document.
pub const DEFAULT_MAX_DOCUMENT_SIZE: i32 = 16 * 1024 * 1024 + 16 * 1024;

/// The smallest legal encoded document: a length prefix and a terminator.
pub(crate) const MIN_DOCUMENT_SIZE: i32 = 5;
