//! Framing for the wire protocol: the 16-byte header, the opcode bodies,
//! and the process-wide request-id counter.

mod header;
mod message;
mod util;

use std::fmt;

pub(crate) use self::header::{Header, OpCode};
pub use self::message::{
    Delete, GetMore, Insert, KillCursors, Message, Query, QueryFlags, Reply, ReplyFlags, Update,
};
pub(crate) use self::{message::DEFAULT_MAX_MESSAGE_SIZE, util::next_request_id};

use crate::error::{Error, Result};

/// A `database.collection` pair identifying where an operation applies.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }

    /// Parses a `database.collection` string. The collection part may itself
    /// contain dots.
    pub fn parse(s: &str) -> Result<Self> {
        match s.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self {
                db: db.to_string(),
                coll: coll.to_string(),
            }),
            _ => Err(Error::invalid_argument(format!("invalid namespace: {:?}", s))),
        }
    }

    /// The wire form, `db.collection`.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.db, self.coll)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}
