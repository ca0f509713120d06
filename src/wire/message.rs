//! The opcode-specific message bodies and their codecs.
//!
//! Requests are framed into contiguous byte buffers before they are handed
//! to a session's sender; replies are read asynchronously off the socket.

use bitflags::bitflags;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{
    header::{Header, OpCode},
    util::{read_cstring, write_cstring_buf},
    Namespace,
};
use crate::{
    bson::{decode_document, Document, DEFAULT_MAX_DOCUMENT_SIZE},
    error::{Error, Result},
};

/// The largest incoming frame the receiver will accept. Sized for a reply
/// batch of maximum-size documents.
pub(crate) const DEFAULT_MAX_MESSAGE_SIZE: i32 = 48 * 1024 * 1024;

bitflags! {
    /// The flag bits carried by a QUERY message.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct QueryFlags: u32 {
        /// Leave the cursor open once the initial data is exhausted.
        const TAILABLE_CURSOR   = 0b0000_0010;
        /// Permit a non-primary server to answer.
        const SLAVE_OK          = 0b0000_0100;
        /// Do not reap the cursor on the server-side idle timeout.
        const NO_CURSOR_TIMEOUT = 0b0001_0000;
        /// Block briefly at the end of a tailable cursor for new data.
        const AWAIT_DATA        = 0b0010_0000;
        /// Stream results in multiple reply messages without GET_MOREs.
        const EXHAUST           = 0b0100_0000;
        /// Accept partial results when a shard is down.
        const PARTIAL           = 0b1000_0000;
    }
}

bitflags! {
    /// The flag bits carried by a REPLY message.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ReplyFlags: u32 {
        /// The GET_MORE referenced a cursor the server no longer has.
        const CURSOR_NOT_FOUND  = 0b0000_0001;
        /// The query failed; the single reply document describes why.
        const QUERY_FAILURE     = 0b0000_0010;
        /// The mongos routing table is out of date.
        const SHARD_CONFIG_STALE = 0b0000_0100;
        /// The server supports AWAIT_DATA.
        const AWAIT_CAPABLE     = 0b0000_1000;
    }
}

/// A QUERY request.
#[derive(Clone, Debug)]
pub struct Query {
    pub namespace: Namespace,
    pub flags: QueryFlags,
    pub skip: i32,
    /// The `numberToReturn` field: a batch size, or negative to close the
    /// cursor after one batch (commands use -1).
    pub limit: i32,
    pub query: Document,
    pub projection: Option<Document>,
}

impl Query {
    /// A single-batch command query against `db.$cmd`.
    pub fn command(db: impl Into<String>, command: Document) -> Self {
        Self {
            namespace: Namespace {
                db: db.into(),
                coll: "$cmd".to_string(),
            },
            flags: QueryFlags::SLAVE_OK,
            skip: 0,
            limit: -1,
            query: command,
            projection: None,
        }
    }
}

/// A REPLY from the server.
#[derive(Clone, Debug, Default)]
pub struct Reply {
    pub flags: ReplyFlags,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub documents: Vec<Document>,
}

impl Reply {
    /// The single document of a command reply.
    pub fn command_document(&self) -> Result<&Document> {
        self.documents
            .first()
            .ok_or_else(|| Error::reply_validation("command reply carried no document"))
    }
}

/// An INSERT request.
#[derive(Clone, Debug)]
pub struct Insert {
    pub namespace: Namespace,
    pub documents: Vec<Document>,
    /// Keep inserting remaining documents after an error.
    pub continue_on_error: bool,
}

/// An UPDATE request.
#[derive(Clone, Debug)]
pub struct Update {
    pub namespace: Namespace,
    pub selector: Document,
    pub update: Document,
    pub upsert: bool,
    pub multi_update: bool,
}

/// A DELETE request.
#[derive(Clone, Debug)]
pub struct Delete {
    pub namespace: Namespace,
    pub selector: Document,
    pub single_remove: bool,
}

/// A GET_MORE request advancing a server-side cursor.
#[derive(Clone, Debug)]
pub struct GetMore {
    pub namespace: Namespace,
    pub number_to_return: i32,
    pub cursor_id: i64,
}

/// A KILL_CURSORS request releasing server-side cursors.
#[derive(Clone, Debug)]
pub struct KillCursors {
    pub cursor_ids: Vec<i64>,
}

/// Any wire protocol message.
#[derive(Clone, Debug)]
pub enum Message {
    Query(Query),
    Reply(Reply),
    Insert(Insert),
    Update(Update),
    Delete(Delete),
    GetMore(GetMore),
    KillCursors(KillCursors),
}

impl Message {
    pub(crate) fn op_code(&self) -> OpCode {
        match self {
            Message::Query(..) => OpCode::Query,
            Message::Reply(..) => OpCode::Reply,
            Message::Insert(..) => OpCode::Insert,
            Message::Update(..) => OpCode::Update,
            Message::Delete(..) => OpCode::Delete,
            Message::GetMore(..) => OpCode::GetMore,
            Message::KillCursors(..) => OpCode::KillCursors,
        }
    }

    /// Whether the server sends a REPLY for this message. Fire-and-forget
    /// opcodes are not registered in the pending table.
    pub(crate) fn expects_reply(&self) -> bool {
        matches!(self, Message::Query(..) | Message::GetMore(..))
    }

    /// The namespace this message operates on, when it carries one.
    pub fn namespace(&self) -> Option<&Namespace> {
        match self {
            Message::Query(m) => Some(&m.namespace),
            Message::Insert(m) => Some(&m.namespace),
            Message::Update(m) => Some(&m.namespace),
            Message::Delete(m) => Some(&m.namespace),
            Message::GetMore(m) => Some(&m.namespace),
            Message::Reply(..) | Message::KillCursors(..) => None,
        }
    }

    /// Frames this message into a complete buffer: header plus body.
    pub(crate) fn encode(&self, request_id: i32, response_to: i32) -> Vec<u8> {
        let mut buf = vec![0u8; Header::LENGTH];
        self.encode_body(&mut buf);

        let header = Header {
            length: buf.len() as i32,
            request_id,
            response_to,
            op_code: self.op_code(),
        };
        let mut head = Vec::with_capacity(Header::LENGTH);
        header
            .write_to(&mut head)
            .expect("writing a header to a buffer cannot fail");
        buf[..Header::LENGTH].copy_from_slice(&head);
        buf
    }

    fn encode_body(&self, buf: &mut Vec<u8>) {
        match self {
            Message::Query(query) => {
                buf.extend_from_slice(&query.flags.bits().to_le_bytes());
                write_cstring_buf(buf, &query.namespace.full_name());
                buf.extend_from_slice(&query.skip.to_le_bytes());
                buf.extend_from_slice(&query.limit.to_le_bytes());
                query.query.encode_into(buf);
                if let Some(ref projection) = query.projection {
                    projection.encode_into(buf);
                }
            }
            Message::Reply(reply) => {
                buf.extend_from_slice(&reply.flags.bits().to_le_bytes());
                buf.extend_from_slice(&reply.cursor_id.to_le_bytes());
                buf.extend_from_slice(&reply.starting_from.to_le_bytes());
                buf.extend_from_slice(&(reply.documents.len() as i32).to_le_bytes());
                for doc in &reply.documents {
                    doc.encode_into(buf);
                }
            }
            Message::Insert(insert) => {
                buf.extend_from_slice(&u32::from(insert.continue_on_error).to_le_bytes());
                write_cstring_buf(buf, &insert.namespace.full_name());
                for doc in &insert.documents {
                    doc.encode_into(buf);
                }
            }
            Message::Update(update) => {
                buf.extend_from_slice(&0i32.to_le_bytes());
                write_cstring_buf(buf, &update.namespace.full_name());
                let flags =
                    u32::from(update.upsert) | (u32::from(update.multi_update) << 1);
                buf.extend_from_slice(&flags.to_le_bytes());
                update.selector.encode_into(buf);
                update.update.encode_into(buf);
            }
            Message::Delete(delete) => {
                buf.extend_from_slice(&0i32.to_le_bytes());
                write_cstring_buf(buf, &delete.namespace.full_name());
                buf.extend_from_slice(&u32::from(delete.single_remove).to_le_bytes());
                delete.selector.encode_into(buf);
            }
            Message::GetMore(get_more) => {
                buf.extend_from_slice(&0i32.to_le_bytes());
                write_cstring_buf(buf, &get_more.namespace.full_name());
                buf.extend_from_slice(&get_more.number_to_return.to_le_bytes());
                buf.extend_from_slice(&get_more.cursor_id.to_le_bytes());
            }
            Message::KillCursors(kill) => {
                buf.extend_from_slice(&0i32.to_le_bytes());
                buf.extend_from_slice(&(kill.cursor_ids.len() as i32).to_le_bytes());
                for id in &kill.cursor_ids {
                    buf.extend_from_slice(&id.to_le_bytes());
                }
            }
        }
    }

    /// Reads one framed message from `reader`. Returns the header alongside
    /// the decoded body so callers can correlate by `response_to`.
    pub(crate) async fn read_from<R: AsyncRead + Unpin + Send>(
        reader: &mut R,
    ) -> Result<(Header, Message)> {
        let mut header_bytes = [0u8; Header::LENGTH];
        reader.read_exact(&mut header_bytes).await?;
        let header = Header::read_from(&mut header_bytes.as_slice())?;

        if header.length < Header::LENGTH as i32 {
            return Err(Error::framing(format!(
                "message length {} below the header size",
                header.length
            )));
        }
        if header.length > DEFAULT_MAX_MESSAGE_SIZE {
            return Err(Error::framing(format!(
                "message length {} over the maximum of {}",
                header.length, DEFAULT_MAX_MESSAGE_SIZE
            )));
        }

        let mut body = vec![0u8; header.length as usize - Header::LENGTH];
        reader.read_exact(&mut body).await?;

        let message = Self::decode_body(header.op_code, &body)?;
        Ok((header, message))
    }

    fn decode_body(op_code: OpCode, body: &[u8]) -> Result<Message> {
        let mut slice = body;
        let message = match op_code {
            OpCode::Reply => {
                let flags = ReplyFlags::from_bits_truncate(read_u32(&mut slice)?);
                let cursor_id = read_i64(&mut slice)?;
                let starting_from = read_i32(&mut slice)?;
                let number_returned = read_i32(&mut slice)?;
                let mut documents = Vec::with_capacity(number_returned.max(0) as usize);
                for _ in 0..number_returned {
                    documents.push(decode_document(&mut slice, DEFAULT_MAX_DOCUMENT_SIZE)?);
                }
                Message::Reply(Reply {
                    flags,
                    cursor_id,
                    starting_from,
                    documents,
                })
            }
            OpCode::Query => {
                let flags = QueryFlags::from_bits_truncate(read_u32(&mut slice)?);
                let namespace = read_namespace(&mut slice)?;
                let skip = read_i32(&mut slice)?;
                let limit = read_i32(&mut slice)?;
                let query = decode_document(&mut slice, DEFAULT_MAX_DOCUMENT_SIZE)?;
                let projection = if slice.is_empty() {
                    None
                } else {
                    Some(decode_document(&mut slice, DEFAULT_MAX_DOCUMENT_SIZE)?)
                };
                Message::Query(Query {
                    namespace,
                    flags,
                    skip,
                    limit,
                    query,
                    projection,
                })
            }
            OpCode::Insert => {
                let flags = read_u32(&mut slice)?;
                let namespace = read_namespace(&mut slice)?;
                let mut documents = Vec::new();
                while !slice.is_empty() {
                    documents.push(decode_document(&mut slice, DEFAULT_MAX_DOCUMENT_SIZE)?);
                }
                Message::Insert(Insert {
                    namespace,
                    documents,
                    continue_on_error: flags & 1 != 0,
                })
            }
            OpCode::Update => {
                read_i32(&mut slice)?;
                let namespace = read_namespace(&mut slice)?;
                let flags = read_u32(&mut slice)?;
                let selector = decode_document(&mut slice, DEFAULT_MAX_DOCUMENT_SIZE)?;
                let update = decode_document(&mut slice, DEFAULT_MAX_DOCUMENT_SIZE)?;
                Message::Update(Update {
                    namespace,
                    selector,
                    update,
                    upsert: flags & 1 != 0,
                    multi_update: flags & 2 != 0,
                })
            }
            OpCode::Delete => {
                read_i32(&mut slice)?;
                let namespace = read_namespace(&mut slice)?;
                let flags = read_u32(&mut slice)?;
                let selector = decode_document(&mut slice, DEFAULT_MAX_DOCUMENT_SIZE)?;
                Message::Delete(Delete {
                    namespace,
                    selector,
                    single_remove: flags & 1 != 0,
                })
            }
            OpCode::GetMore => {
                read_i32(&mut slice)?;
                let namespace = read_namespace(&mut slice)?;
                let number_to_return = read_i32(&mut slice)?;
                let cursor_id = read_i64(&mut slice)?;
                Message::GetMore(GetMore {
                    namespace,
                    number_to_return,
                    cursor_id,
                })
            }
            OpCode::KillCursors => {
                read_i32(&mut slice)?;
                let count = read_i32(&mut slice)?;
                let mut cursor_ids = Vec::with_capacity(count.max(0) as usize);
                for _ in 0..count {
                    cursor_ids.push(read_i64(&mut slice)?);
                }
                Message::KillCursors(KillCursors { cursor_ids })
            }
        };

        if !slice.is_empty() {
            return Err(Error::framing(format!(
                "{} trailing bytes after {:?} body",
                slice.len(),
                op_code
            )));
        }

        Ok(message)
    }
}

fn read_namespace(slice: &mut &[u8]) -> Result<Namespace> {
    let raw = read_cstring(slice)
        .ok_or_else(|| Error::framing("unterminated namespace string".to_string()))?;
    Namespace::parse(&raw)
}

fn read_u32(slice: &mut &[u8]) -> Result<u32> {
    read_i32(slice).map(|i| i as u32)
}

fn read_i32(slice: &mut &[u8]) -> Result<i32> {
    if slice.len() < 4 {
        return Err(Error::framing("message body truncated".to_string()));
    }
    let (head, rest) = slice.split_at(4);
    *slice = rest;
    Ok(i32::from_le_bytes(head.try_into().unwrap()))
}

fn read_i64(slice: &mut &[u8]) -> Result<i64> {
    if slice.len() < 8 {
        return Err(Error::framing("message body truncated".to_string()));
    }
    let (head, rest) = slice.split_at(8);
    *slice = rest;
    Ok(i64::from_le_bytes(head.try_into().unwrap()))
}
