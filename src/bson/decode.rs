//! Reads documents from their framed binary form.

use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt};

use super::{
    spec::{ElementType, MIN_DOCUMENT_SIZE},
    Binary, Bson, DbPointer, Document, JavaScriptCodeWithScope, ObjectId, Regex, Timestamp,
    DEFAULT_MAX_DOCUMENT_SIZE,
};
use crate::error::{Error, Result};

/// Reads one length-prefixed document from `reader`, rejecting documents
/// whose declared length exceeds `max_size` with a framing error.
pub fn decode_document<R: Read>(reader: &mut R, max_size: i32) -> Result<Document> {
    let length = reader
        .read_i32::<LittleEndian>()
        .map_err(|e| Error::framing(format!("unreadable document length: {}", e)))?;

    if length < MIN_DOCUMENT_SIZE {
        return Err(Error::framing(format!(
            "document length {} below the minimum of {}",
            length, MIN_DOCUMENT_SIZE
        )));
    }
    if length > max_size {
        return Err(Error::framing(format!(
            "document length {} over the maximum of {}",
            length, max_size
        )));
    }

    let mut body = vec![0u8; length as usize - 4];
    reader
        .read_exact(&mut body)
        .map_err(|e| Error::framing(format!("truncated document: {}", e)))?;

    let mut slice = body.as_slice();
    let doc = parse_body(&mut slice)?;
    if !slice.is_empty() {
        return Err(Error::framing(format!(
            "{} trailing bytes after document terminator",
            slice.len()
        )));
    }
    Ok(doc)
}

/// Decodes a document from a complete byte buffer.
pub fn decode_document_from_slice(mut bytes: &[u8]) -> Result<Document> {
    decode_document(&mut bytes, DEFAULT_MAX_DOCUMENT_SIZE)
}

impl Document {
    /// Decodes a document from `bytes`, enforcing the default size limit.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        decode_document_from_slice(bytes)
    }
}

/// Parses the element list and trailing terminator, consuming from `slice`.
/// The length prefix has already been removed.
fn parse_body(slice: &mut &[u8]) -> Result<Document> {
    let mut doc = Document::new();

    loop {
        let tag = read_u8(slice)?;
        if tag == 0 {
            return Ok(doc);
        }
        let element_type = ElementType::from_u8(tag)
            .ok_or_else(|| Error::framing(format!("unknown element type {:#04x}", tag)))?;
        let key = read_cstring(slice)?;
        let value = parse_value(element_type, slice)?;
        // The wire may carry duplicate keys; lookups are first-wins.
        doc.push_unchecked(key, value);
    }
}

fn parse_nested_document(slice: &mut &[u8]) -> Result<Document> {
    let length = read_i32(slice)?;
    if length < MIN_DOCUMENT_SIZE || length as usize - 4 > slice.len() {
        return Err(Error::framing(format!(
            "nested document length {} exceeds enclosing value",
            length
        )));
    }
    let (mut body, rest) = slice.split_at(length as usize - 4);
    *slice = rest;
    let doc = parse_body(&mut body)?;
    if !body.is_empty() {
        return Err(Error::framing(
            "nested document shorter than its length prefix".to_string(),
        ));
    }
    Ok(doc)
}

fn parse_value(element_type: ElementType, slice: &mut &[u8]) -> Result<Bson> {
    Ok(match element_type {
        ElementType::Double => Bson::Double(f64::from_le_bytes(read_n::<8>(slice)?)),
        ElementType::String => Bson::String(read_string(slice)?),
        ElementType::EmbeddedDocument => Bson::Document(parse_nested_document(slice)?),
        ElementType::Array => {
            let doc = parse_nested_document(slice)?;
            Bson::Array(doc.into_iter().map(|(_, v)| v).collect())
        }
        ElementType::Binary => {
            let len = read_i32(slice)?;
            let subtype = read_u8(slice)?;
            if len < 0 || len as usize > slice.len() {
                return Err(Error::framing(format!("binary length {} out of range", len)));
            }
            let (bytes, rest) = slice.split_at(len as usize);
            *slice = rest;
            Bson::Binary(Binary {
                subtype: subtype.into(),
                bytes: bytes.to_vec(),
            })
        }
        ElementType::Undefined => Bson::Undefined,
        ElementType::ObjectId => Bson::ObjectId(ObjectId::from_bytes(read_n::<12>(slice)?)),
        ElementType::Boolean => match read_u8(slice)? {
            0 => Bson::Boolean(false),
            1 => Bson::Boolean(true),
            other => {
                return Err(Error::framing(format!("invalid boolean byte {:#04x}", other)));
            }
        },
        ElementType::DateTime => Bson::DateTime(i64::from_le_bytes(read_n::<8>(slice)?)),
        ElementType::Null => Bson::Null,
        ElementType::RegularExpression => {
            let pattern = read_cstring(slice)?;
            let options = read_cstring(slice)?;
            Bson::RegularExpression(Regex { pattern, options })
        }
        ElementType::DbPointer => {
            let namespace = read_string(slice)?;
            let id = ObjectId::from_bytes(read_n::<12>(slice)?);
            Bson::DbPointer(DbPointer { namespace, id })
        }
        ElementType::JavaScriptCode => Bson::JavaScriptCode(read_string(slice)?),
        ElementType::Symbol => Bson::Symbol(read_string(slice)?),
        ElementType::JavaScriptCodeWithScope => {
            let total = read_i32(slice)?;
            if total < 4 + 4 + 1 + MIN_DOCUMENT_SIZE {
                return Err(Error::framing(format!(
                    "code-with-scope length {} too small",
                    total
                )));
            }
            let code = read_string(slice)?;
            let scope = parse_nested_document(slice)?;
            Bson::JavaScriptCodeWithScope(JavaScriptCodeWithScope { code, scope })
        }
        ElementType::Int32 => Bson::Int32(read_i32(slice)?),
        ElementType::Timestamp => {
            let increment = u32::from_le_bytes(read_n::<4>(slice)?);
            let time = u32::from_le_bytes(read_n::<4>(slice)?);
            Bson::Timestamp(Timestamp { time, increment })
        }
        ElementType::Int64 => Bson::Int64(i64::from_le_bytes(read_n::<8>(slice)?)),
        ElementType::MinKey => Bson::MinKey,
        ElementType::MaxKey => Bson::MaxKey,
    })
}

fn read_n<const N: usize>(slice: &mut &[u8]) -> Result<[u8; N]> {
    if slice.len() < N {
        return Err(Error::framing("value extends past end of document".to_string()));
    }
    let (head, rest) = slice.split_at(N);
    *slice = rest;
    Ok(head.try_into().unwrap())
}

fn read_u8(slice: &mut &[u8]) -> Result<u8> {
    Ok(read_n::<1>(slice)?[0])
}

fn read_i32(slice: &mut &[u8]) -> Result<i32> {
    Ok(i32::from_le_bytes(read_n::<4>(slice)?))
}

fn read_cstring(slice: &mut &[u8]) -> Result<String> {
    let nul = slice
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::framing("unterminated cstring".to_string()))?;
    let (bytes, rest) = slice.split_at(nul);
    *slice = &rest[1..];
    String::from_utf8(bytes.to_vec())
        .map_err(|_| Error::framing("cstring is not valid UTF-8".to_string()))
}

fn read_string(slice: &mut &[u8]) -> Result<String> {
    let len = read_i32(slice)?;
    if len < 1 || len as usize > slice.len() {
        return Err(Error::framing(format!("string length {} out of range", len)));
    }
    let (bytes, rest) = slice.split_at(len as usize);
    *slice = rest;
    if bytes[len as usize - 1] != 0 {
        return Err(Error::framing("string missing NUL terminator".to_string()));
    }
    String::from_utf8(bytes[..len as usize - 1].to_vec())
        .map_err(|_| Error::framing("string is not valid UTF-8".to_string()))
}
