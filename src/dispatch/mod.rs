//! Topology dispatchers: turning a logical request into a choice of
//! session, per deployment shape.

mod reconnect;
mod replica_set;
mod sharded;
mod standalone;

pub(crate) use self::{
    replica_set::ReplicaSetDispatcher, sharded::ShardedDispatcher,
    standalone::StandaloneDispatcher,
};

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    callback::BoxedCallback,
    cluster::{Cluster, ServerRole},
    concern::WriteConcern,
    conn::{SendError, SocketSession},
    error::{Error, Result},
    options::ClientOptions,
    selection_criteria::ReadPreference,
    wire::{Message, Query},
};

/// The deployment shapes a dispatcher can serve.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopologyType {
    Standalone,
    ReplicaSet,
    Sharded,
}

/// A logical operation: one message, an optional paired confirmation, and
/// the routing constraints.
#[derive(Clone, Debug)]
pub struct Request {
    pub(crate) message: Message,
    pub(crate) companion: Option<Message>,
    pub(crate) read_preference: Option<ReadPreference>,
    pub(crate) timeout: Option<Duration>,
}

impl Request {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            companion: None,
            read_preference: None,
            timeout: None,
        }
    }

    /// A write paired with the `getLastError` its write concern demands.
    /// Unacknowledged concerns produce an unpaired request.
    pub fn write(message: Message, concern: &WriteConcern) -> Self {
        let companion = concern.gle_command().and_then(|command| {
            let db = match message.namespace() {
                Some(ns) => ns.db.clone(),
                None => return None,
            };
            Some(Message::Query(Query::command(db, command)))
        });
        Self {
            message,
            companion,
            read_preference: None,
            timeout: None,
        }
    }

    pub fn with_read_preference(mut self, read_preference: ReadPreference) -> Self {
        self.read_preference = Some(read_preference);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The preference this request routes under. A paired send is the
    /// intersection of both messages' constraints, which collapses to
    /// `Primary` for anything but identical preferences.
    pub(crate) fn effective_read_preference(
        &self,
        default: Option<&ReadPreference>,
    ) -> ReadPreference {
        let base = self
            .read_preference
            .clone()
            .or_else(|| default.cloned())
            .unwrap_or_default();
        if self.companion.is_some() {
            base.intersect(ReadPreference::Primary)
        } else {
            base
        }
    }
}

/// What a successful dispatch hands back: the id assigned on the wire and
/// the session the message went out on, for cursor affinity.
pub(crate) struct Dispatched {
    pub(crate) request_id: i32,
    pub(crate) session: SocketSession,
}

/// The shared contract of every topology dispatcher.
#[async_trait]
pub(crate) trait Dispatcher: Send + Sync {
    /// Routes `request` to a suitable server and registers `callback` for
    /// its completion.
    async fn send(&self, request: Request, callback: BoxedCallback) -> Result<Dispatched>;

    /// Closes every session this dispatcher opened. Idempotent.
    async fn close(&self);

    fn is_open(&self) -> bool;

    fn topology(&self) -> TopologyType;
}

/// Sends a request (paired or not) on one session.
pub(crate) async fn send_on_session(
    session: &SocketSession,
    request: &Request,
    callback: BoxedCallback,
) -> std::result::Result<i32, SendError> {
    match request.companion {
        Some(ref companion) => {
            session
                .send_pair(&request.message, companion, callback, request.timeout)
                .await
        }
        None => {
            session
                .send(&request.message, callback, request.timeout)
                .await
        }
    }
}

/// Picks the dispatcher variant implied by the first successful topology
/// sweep.
pub(crate) fn detect_topology(cluster: &Cluster, options: &ClientOptions) -> Result<TopologyType> {
    let servers = cluster.servers();

    if servers
        .iter()
        .any(|server| server.role() == ServerRole::Mongos)
    {
        return Ok(TopologyType::Sharded);
    }

    let replica_member = servers.iter().any(|server| {
        matches!(
            server.role(),
            ServerRole::Primary | ServerRole::Secondary
        )
    });
    if replica_member || options.repl_set_name.is_some() {
        return Ok(TopologyType::ReplicaSet);
    }

    if servers
        .iter()
        .any(|server| server.role() == ServerRole::Standalone)
    {
        return Ok(TopologyType::Standalone);
    }

    Err(Error::no_suitable_server(
        "no configured server answered the bootstrap sweep".to_string(),
    ))
}

/// Builds the dispatcher for a detected topology.
pub(crate) fn build_dispatcher(
    topology: TopologyType,
    cluster: Arc<Cluster>,
    options: ClientOptions,
) -> Result<Arc<dyn Dispatcher>> {
    Ok(match topology {
        TopologyType::Standalone => {
            let address = options
                .hosts
                .first()
                .cloned()
                .ok_or_else(|| Error::invalid_argument("no hosts configured".to_string()))?;
            Arc::new(StandaloneDispatcher::new(address, options))
        }
        TopologyType::ReplicaSet => ReplicaSetDispatcher::new(cluster, options),
        TopologyType::Sharded => ShardedDispatcher::new(cluster, options),
    })
}
