//! Writes documents to their framed binary form.
//!
//! Two write paths are provided. The buffered path materializes the document
//! into a byte buffer and back-patches each length prefix once the enclosed
//! bytes are known; it is the default and benefits from buffer reuse. The
//! size-visitor path walks the value tree to compute every length first and
//! then writes straight through, never revisiting a byte. Both produce
//! identical output.

use std::io::Write;

use byteorder::{LittleEndian, WriteBytesExt};

use super::{Bson, Document};
use crate::error::Result;

/// Encodes `document` to `writer` using the size-visitor path.
pub fn encode_document<W: Write>(document: &Document, writer: &mut W) -> Result<()> {
    write_document(document, writer)?;
    Ok(())
}

/// The number of bytes `document` occupies when encoded, including the
/// length prefix and trailing terminator.
pub fn encoded_document_size(document: &Document) -> i32 {
    document_size(document)
}

/// Encodes `document` into `buf` using the buffered back-patch path.
pub(crate) fn encode_document_buffered(document: &Document, buf: &mut Vec<u8>) {
    let start = buf.len();
    buf.extend_from_slice(&[0u8; 4]);
    for (key, value) in document.iter() {
        buf.push(value.element_type() as u8);
        write_cstring_buf(key, buf);
        write_value_buffered(value, buf);
    }
    buf.push(0);
    let len = (buf.len() - start) as i32;
    buf[start..start + 4].copy_from_slice(&len.to_le_bytes());
}

fn write_value_buffered(value: &Bson, buf: &mut Vec<u8>) {
    match value {
        Bson::Double(d) => buf.extend_from_slice(&d.to_le_bytes()),
        Bson::String(s) | Bson::JavaScriptCode(s) | Bson::Symbol(s) => write_string_buf(s, buf),
        Bson::Document(doc) => encode_document_buffered(doc, buf),
        Bson::Array(array) => {
            let start = buf.len();
            buf.extend_from_slice(&[0u8; 4]);
            for (index, item) in array.iter().enumerate() {
                buf.push(item.element_type() as u8);
                write_cstring_buf(&index.to_string(), buf);
                write_value_buffered(item, buf);
            }
            buf.push(0);
            let len = (buf.len() - start) as i32;
            buf[start..start + 4].copy_from_slice(&len.to_le_bytes());
        }
        Bson::Binary(b) => {
            buf.extend_from_slice(&(b.bytes.len() as i32).to_le_bytes());
            buf.push(u8::from(b.subtype));
            buf.extend_from_slice(&b.bytes);
        }
        Bson::Undefined | Bson::Null | Bson::MinKey | Bson::MaxKey => {}
        Bson::ObjectId(id) => buf.extend_from_slice(&id.bytes()),
        Bson::Boolean(b) => buf.push(u8::from(*b)),
        Bson::DateTime(ms) => buf.extend_from_slice(&ms.to_le_bytes()),
        Bson::RegularExpression(regex) => {
            write_cstring_buf(&regex.pattern, buf);
            write_cstring_buf(&regex.options, buf);
        }
        Bson::DbPointer(p) => {
            write_string_buf(&p.namespace, buf);
            buf.extend_from_slice(&p.id.bytes());
        }
        Bson::JavaScriptCodeWithScope(c) => {
            let total = 4 + string_size(&c.code) + document_size(&c.scope);
            buf.extend_from_slice(&total.to_le_bytes());
            write_string_buf(&c.code, buf);
            encode_document_buffered(&c.scope, buf);
        }
        Bson::Int32(i) => buf.extend_from_slice(&i.to_le_bytes()),
        Bson::Timestamp(t) => {
            buf.extend_from_slice(&t.increment.to_le_bytes());
            buf.extend_from_slice(&t.time.to_le_bytes());
        }
        Bson::Int64(i) => buf.extend_from_slice(&i.to_le_bytes()),
    }
}

fn write_cstring_buf(s: &str, buf: &mut Vec<u8>) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

fn write_string_buf(s: &str, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&(s.len() as i32 + 1).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

fn document_size(document: &Document) -> i32 {
    let mut size = 4 + 1;
    for (key, value) in document.iter() {
        size += 1 + key.len() as i32 + 1 + value_size(value);
    }
    size
}

fn array_size(array: &[Bson]) -> i32 {
    let mut size = 4 + 1;
    for (index, item) in array.iter().enumerate() {
        size += 1 + index.to_string().len() as i32 + 1 + value_size(item);
    }
    size
}

fn string_size(s: &str) -> i32 {
    4 + s.len() as i32 + 1
}

fn value_size(value: &Bson) -> i32 {
    match value {
        Bson::Double(..) | Bson::DateTime(..) | Bson::Int64(..) | Bson::Timestamp(..) => 8,
        Bson::String(s) | Bson::JavaScriptCode(s) | Bson::Symbol(s) => string_size(s),
        Bson::Document(doc) => document_size(doc),
        Bson::Array(array) => array_size(array),
        Bson::Binary(b) => 4 + 1 + b.bytes.len() as i32,
        Bson::Undefined | Bson::Null | Bson::MinKey | Bson::MaxKey => 0,
        Bson::ObjectId(..) => 12,
        Bson::Boolean(..) => 1,
        Bson::RegularExpression(regex) => {
            regex.pattern.len() as i32 + 1 + regex.options.len() as i32 + 1
        }
        Bson::DbPointer(p) => string_size(&p.namespace) + 12,
        Bson::JavaScriptCodeWithScope(c) => 4 + string_size(&c.code) + document_size(&c.scope),
        Bson::Int32(..) => 4,
    }
}

fn write_document<W: Write>(document: &Document, writer: &mut W) -> std::io::Result<()> {
    writer.write_i32::<LittleEndian>(document_size(document))?;
    for (key, value) in document.iter() {
        writer.write_u8(value.element_type() as u8)?;
        write_cstring(key, writer)?;
        write_value(value, writer)?;
    }
    writer.write_u8(0)
}

fn write_array<W: Write>(array: &[Bson], writer: &mut W) -> std::io::Result<()> {
    writer.write_i32::<LittleEndian>(array_size(array))?;
    for (index, item) in array.iter().enumerate() {
        writer.write_u8(item.element_type() as u8)?;
        write_cstring(&index.to_string(), writer)?;
        write_value(item, writer)?;
    }
    writer.write_u8(0)
}

fn write_value<W: Write>(value: &Bson, writer: &mut W) -> std::io::Result<()> {
    match value {
        Bson::Double(d) => writer.write_f64::<LittleEndian>(*d)?,
        Bson::String(s) | Bson::JavaScriptCode(s) | Bson::Symbol(s) => write_string(s, writer)?,
        Bson::Document(doc) => write_document(doc, writer)?,
        Bson::Array(array) => write_array(array, writer)?,
        Bson::Binary(b) => {
            writer.write_i32::<LittleEndian>(b.bytes.len() as i32)?;
            writer.write_u8(u8::from(b.subtype))?;
            writer.write_all(&b.bytes)?;
        }
        Bson::Undefined | Bson::Null | Bson::MinKey | Bson::MaxKey => {}
        Bson::ObjectId(id) => writer.write_all(&id.bytes())?,
        Bson::Boolean(b) => writer.write_u8(u8::from(*b))?,
        Bson::DateTime(ms) => writer.write_i64::<LittleEndian>(*ms)?,
        Bson::RegularExpression(regex) => {
            write_cstring(&regex.pattern, writer)?;
            write_cstring(&regex.options, writer)?;
        }
        Bson::DbPointer(p) => {
            write_string(&p.namespace, writer)?;
            writer.write_all(&p.id.bytes())?;
        }
        Bson::JavaScriptCodeWithScope(c) => {
            let total = 4 + string_size(&c.code) + document_size(&c.scope);
            writer.write_i32::<LittleEndian>(total)?;
            write_string(&c.code, writer)?;
            write_document(&c.scope, writer)?;
        }
        Bson::Int32(i) => writer.write_i32::<LittleEndian>(*i)?,
        Bson::Timestamp(t) => {
            writer.write_u32::<LittleEndian>(t.increment)?;
            writer.write_u32::<LittleEndian>(t.time)?;
        }
        Bson::Int64(i) => writer.write_i64::<LittleEndian>(*i)?,
    }

    Ok(())
}

fn write_cstring<W: Write>(s: &str, writer: &mut W) -> std::io::Result<()> {
    writer.write_all(s.as_bytes())?;
    writer.write_u8(0)
}

fn write_string<W: Write>(s: &str, writer: &mut W) -> std::io::Result<()> {
    writer.write_i32::<LittleEndian>(s.len() as i32 + 1)?;
    writer.write_all(s.as_bytes())?;
    writer.write_u8(0)
}

impl Document {
    /// Encodes this document to a freshly allocated buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(encoded_document_size(self) as usize);
        encode_document_buffered(self, &mut buf);
        buf
    }

    /// Encodes this document onto the end of `buf`, reusing its capacity.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        encode_document_buffered(self, buf);
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use crate::bson::{
        doc, encoded_document_size, Binary, BinarySubtype, Bson, JavaScriptCodeWithScope,
        ObjectId, Regex, Timestamp,
    };

    fn sample() -> crate::bson::Document {
        doc! {
            "double": 3.5,
            "string": "value",
            "doc": { "nested": true },
            "array": [1, "two", { "three": 3 }],
            "binary": (Binary { subtype: BinarySubtype::Generic, bytes: vec![1, 2, 3] }),
            "oid": (ObjectId::from_bytes([7; 12])),
            "bool": false,
            "date": (Bson::DateTime(1_700_000_000_000)),
            "null": null,
            "regex": (Regex::new("^a.*z$", "im")),
            "code": (Bson::JavaScriptCode("function() {}".to_string())),
            "code_w_s": (Bson::JavaScriptCodeWithScope(JavaScriptCodeWithScope {
                code: "f(x)".to_string(),
                scope: doc! { "x": 1 },
            })),
            "int": 42,
            "ts": (Timestamp { time: 10, increment: 2 }),
            "long": 42i64,
            "min": (Bson::MinKey),
            "max": (Bson::MaxKey),
        }
    }

    #[test]
    fn both_write_paths_agree() {
        let doc = sample();

        let buffered = doc.to_vec();

        let mut visited = Vec::new();
        crate::bson::encode_document(&doc, &mut visited).unwrap();

        assert_eq!(buffered, visited);
    }

    #[test]
    fn length_prefix_matches_output_size() {
        let doc = sample();
        let bytes = doc.to_vec();

        assert_eq!(bytes.len() as i32, encoded_document_size(&doc));

        let prefix = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(prefix as usize, bytes.len());
        assert_eq!(*bytes.last().unwrap(), 0);
    }

    #[test]
    fn empty_document_is_five_bytes() {
        let bytes = doc! {}.to_vec();
        assert_eq!(bytes, vec![5, 0, 0, 0, 0]);
    }

    #[test]
    fn timestamp_encodes_increment_first() {
        let bytes = doc! { "ts": (Timestamp { time: 1, increment: 2 }) }.to_vec();
        // tag(1) + "ts\0"(3) follows the 4-byte prefix; increment leads the payload.
        let payload = &bytes[8..16];
        assert_eq!(&payload[..4], &2i32.to_le_bytes());
        assert_eq!(&payload[4..], &1i32.to_le_bytes());
    }
}
