//! The 16-byte header shared by every wire message.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

/// The wire protocol op codes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OpCode {
    Reply = 1,
    Update = 2001,
    Insert = 2002,
    Query = 2004,
    GetMore = 2005,
    Delete = 2006,
    KillCursors = 2007,
}

impl OpCode {
    /// Attempt to infer the op code based on the numeric value.
    pub(crate) fn from_i32(i: i32) -> Result<Self> {
        match i {
            1 => Ok(OpCode::Reply),
            2001 => Ok(OpCode::Update),
            2002 => Ok(OpCode::Insert),
            2004 => Ok(OpCode::Query),
            2005 => Ok(OpCode::GetMore),
            2006 => Ok(OpCode::Delete),
            2007 => Ok(OpCode::KillCursors),
            other => Err(Error::framing(format!("invalid wire protocol opcode: {}", other))),
        }
    }
}

/// The header for any wire protocol message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Header {
    pub(crate) length: i32,
    pub(crate) request_id: i32,
    pub(crate) response_to: i32,
    pub(crate) op_code: OpCode,
}

impl Header {
    pub(crate) const LENGTH: usize = 4 * std::mem::size_of::<i32>();

    /// Serializes the header and writes the bytes to `writer`.
    pub(crate) fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_i32::<LittleEndian>(self.length)?;
        writer.write_i32::<LittleEndian>(self.request_id)?;
        writer.write_i32::<LittleEndian>(self.response_to)?;
        writer.write_i32::<LittleEndian>(self.op_code as i32)?;

        Ok(())
    }

    /// Reads bytes from `reader` and deserializes them into a header.
    pub(crate) fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            length: reader.read_i32::<LittleEndian>()?,
            request_id: reader.read_i32::<LittleEndian>()?,
            response_to: reader.read_i32::<LittleEndian>()?,
            op_code: OpCode::from_i32(reader.read_i32::<LittleEndian>()?)?,
        })
    }
}
