//! An asynchronous client for the MongoDB wire protocol.
//!
//! `mongowire` owns the hard parts of talking to a deployment: the binary
//! document codec, message framing, single-connection request multiplexing,
//! cluster topology tracking, and read-preference-aware routing across
//! standalone servers, replica sets, and sharded clusters.
//!
//! ```no_run
//! use mongowire::{bson::doc, Client};
//!
//! # async fn run() -> mongowire::error::Result<()> {
//! let client = Client::with_uri_str("mongodb://a:27017,b:27017/?replicaSet=rs0").await?;
//! let stats = client.run_command("admin", doc! { "serverStatus": 1 }, None).await?;
//! println!("uptime: {:?}", stats.get_numeric("uptime"));
//! # Ok(())
//! # }
//! ```
//!
//! Higher-level concerns — collection facades, query builders, credential
//! storage — live outside this crate and talk to it through [`Request`],
//! [`Client::execute`], and the [`wire`] message types.

#![warn(missing_debug_implementations)]

#[macro_use]
pub mod bson;

mod callback;
mod client;
pub mod cluster;
pub mod concern;
mod conn;
mod cursor;
mod dispatch;
pub mod error;
mod event;
mod is_master;
pub mod options;
pub mod selection_criteria;
pub mod wire;

#[cfg(test)]
mod test;

pub use crate::{
    callback::{LockType, ReplyFuture},
    client::Client,
    concern::{Durability, WriteConcern},
    conn::SessionState,
    cursor::Cursor,
    dispatch::{Request, TopologyType},
    error::{Error, ErrorKind, Result},
    event::{ServerMembershipChanged, SessionOpenStateChanged},
    options::{ClientOptions, ServerAddress},
    selection_criteria::{ReadPreference, TagSet},
    wire::Namespace,
};
