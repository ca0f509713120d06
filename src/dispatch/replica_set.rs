//! The dispatcher for replica-set deployments: read-preference routing,
//! per-server session caching, and primary failover.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{reconnect, send_on_session, Dispatched, Dispatcher, Request, TopologyType};
use crate::{
    callback::BoxedCallback,
    cluster::Cluster,
    conn::{SendError, SocketSession},
    error::{Error, ErrorKind, Result},
    event::{ServerMembershipChanged, WatchToken},
    options::{ClientOptions, ServerAddress},
    selection_criteria::ReadPreference,
};

const SELECTION_TRACING_EVENT_TARGET: &str = "mongowire::server_selection";

struct RsState {
    sessions: HashMap<ServerAddress, SocketSession>,
    primary: Option<ServerAddress>,
}

/// Routes requests across replica-set members according to their read
/// preference, keeping one cached session per member.
pub(crate) struct ReplicaSetDispatcher {
    cluster: Arc<Cluster>,
    options: ClientOptions,
    state: tokio::sync::Mutex<RsState>,
    open: AtomicBool,
    /// Set while a background primary hunt is running.
    reconnecting: AtomicBool,
    membership_token: Mutex<Option<WatchToken>>,
    membership_listener: Mutex<Option<JoinHandle<()>>>,
    weak: Weak<Self>,
}

impl ReplicaSetDispatcher {
    pub(crate) fn new(cluster: Arc<Cluster>, options: ClientOptions) -> Arc<Self> {
        let primary = cluster.primary().map(|server| server.address().clone());
        let (token, mut membership) = cluster.watch();

        let dispatcher = Arc::new_cyclic(|weak: &Weak<Self>| Self {
            cluster,
            options,
            state: tokio::sync::Mutex::new(RsState {
                sessions: HashMap::new(),
                primary,
            }),
            open: AtomicBool::new(true),
            reconnecting: AtomicBool::new(false),
            membership_token: Mutex::new(Some(token)),
            membership_listener: Mutex::new(None),
            weak: weak.clone(),
        });

        let weak = Arc::downgrade(&dispatcher);
        let listener = tokio::spawn(async move {
            while let Some(event) = membership.recv().await {
                let dispatcher = match weak.upgrade() {
                    Some(dispatcher) => dispatcher,
                    None => return,
                };
                if let ServerMembershipChanged::Removed { address } = event {
                    dispatcher.handle_server_removed(&address).await;
                }
            }
        });
        *dispatcher.membership_listener.lock().unwrap() = Some(listener);

        dispatcher
    }

    /// The cached session for `address`, or a freshly opened one.
    async fn session_for(&self, address: &ServerAddress) -> Result<SocketSession> {
        let mut state = self.state.lock().await;
        if let Some(session) = state.sessions.get(address) {
            if session.is_open() {
                return Ok(session.clone());
            }
            state.sessions.remove(address);
        }

        let session = SocketSession::connect(address.clone(), &self.options).await?;
        state.sessions.insert(address.clone(), session.clone());
        drop(state);

        self.track_session(&session);
        Ok(session)
    }

    /// Watches a session so its open->closed transition evicts it and, for
    /// the primary, triggers failover handling.
    fn track_session(&self, session: &SocketSession) {
        let mut events = session.watch();
        let weak = self.weak.clone();
        tokio::spawn(async move {
            if let Some(event) = events.recv().await {
                if let Some(dispatcher) = weak.upgrade() {
                    dispatcher.handle_session_closed(&event.address).await;
                }
            }
        });
    }

    async fn handle_session_closed(&self, address: &ServerAddress) {
        if !self.is_open() {
            return;
        }

        let was_primary = {
            let mut state = self.state.lock().await;
            if let Some(session) = state.sessions.get(address) {
                if !session.is_open() {
                    state.sessions.remove(address);
                }
            }
            if state.primary.as_ref() == Some(address) {
                state.primary = None;
                true
            } else {
                false
            }
        };

        if was_primary {
            warn!(
                target: SELECTION_TRACING_EVENT_TARGET,
                address = %address,
                "primary session closed"
            );
            self.cluster.mark_not_writable(address);
            self.spawn_reconnect();
        }
    }

    async fn handle_server_removed(&self, address: &ServerAddress) {
        let session = {
            let mut state = self.state.lock().await;
            if state.primary.as_ref() == Some(address) {
                state.primary = None;
            }
            state.sessions.remove(address)
        };
        if let Some(session) = session {
            debug!(
                target: SELECTION_TRACING_EVENT_TARGET,
                address = %address,
                "closing session to removed member"
            );
            session.close();
        }
    }

    /// Hunts for a new primary in the background; user sends keep serving
    /// secondary-preference reads meanwhile.
    fn spawn_reconnect(&self) {
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let weak = self.weak.clone();
        tokio::spawn(async move {
            let dispatcher = match weak.upgrade() {
                Some(dispatcher) => dispatcher,
                None => return,
            };
            if let Some((session, server)) =
                reconnect::replica_set(&dispatcher.cluster, &dispatcher.options).await
            {
                dispatcher
                    .adopt_primary(session, server.address().clone())
                    .await;
            }
            dispatcher.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    async fn adopt_primary(&self, session: SocketSession, address: ServerAddress) {
        if !self.is_open() {
            session.close();
            return;
        }
        let replaced = {
            let mut state = self.state.lock().await;
            let replaced = state.sessions.insert(address.clone(), session.clone());
            state.primary = Some(address);
            replaced
        };
        // A raced reconnect can leave a second session to the same member.
        if let Some(replaced) = replaced {
            replaced.close();
        }
        self.track_session(&session);
    }

    async fn primary_missing(&self) -> bool {
        self.state.lock().await.primary.is_none()
    }

    fn empty_candidates_error(read_preference: &ReadPreference) -> Error {
        if read_preference.requires_primary() {
            ErrorKind::NoPrimary.into()
        } else {
            Error::no_suitable_server(format!(
                "no server satisfies {}",
                read_preference
            ))
        }
    }
}

#[async_trait]
impl Dispatcher for ReplicaSetDispatcher {
    async fn send(&self, request: Request, callback: BoxedCallback) -> Result<Dispatched> {
        if !self.is_open() {
            callback.fail(ErrorKind::ShutdownInProgress.into());
            return Err(ErrorKind::ShutdownInProgress.into());
        }

        let read_preference =
            request.effective_read_preference(self.options.read_preference.as_ref());

        let mut callback = callback;
        let mut reconnected = false;
        loop {
            let candidates = self.cluster.candidate_servers(&read_preference);
            debug!(
                target: SELECTION_TRACING_EVENT_TARGET,
                read_preference = %read_preference,
                candidates = candidates.len(),
                "selecting server"
            );

            if candidates.is_empty() {
                if !reconnected && self.primary_missing().await {
                    reconnected = true;
                    if let Some((session, server)) =
                        reconnect::replica_set(&self.cluster, &self.options).await
                    {
                        self.adopt_primary(session, server.address().clone()).await;
                        continue;
                    }
                }
                let error = Self::empty_candidates_error(&read_preference);
                callback.fail(error.clone());
                return Err(error);
            }

            for server in candidates {
                let session = match self.session_for(server.address()).await {
                    Ok(session) => session,
                    Err(error) => {
                        debug!(
                            target: SELECTION_TRACING_EVENT_TARGET,
                            address = %server.address(),
                            error = %error,
                            "candidate unreachable"
                        );
                        continue;
                    }
                };

                match send_on_session(&session, &request, callback).await {
                    Ok(request_id) => {
                        return Ok(Dispatched {
                            request_id,
                            session,
                        });
                    }
                    Err(SendError::Rejected {
                        error,
                        callback: returned,
                    }) if error.is_retryable() => {
                        callback = returned;
                        self.handle_session_closed(server.address()).await;
                    }
                    Err(send_error) => {
                        let error = send_error.error().clone();
                        send_error.fail();
                        return Err(error);
                    }
                }
            }

            // Every candidate refused the send. One reconnection pass may
            // rebuild the candidate set; after that, give up.
            if reconnected {
                let error = Self::empty_candidates_error(&read_preference);
                callback.fail(error.clone());
                return Err(error);
            }
            reconnected = true;
            if let Some((session, server)) =
                reconnect::replica_set(&self.cluster, &self.options).await
            {
                self.adopt_primary(session, server.address().clone()).await;
            }
        }
    }

    async fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }

        // Deregister the membership observer before touching the cache so a
        // concurrent removal event cannot race the teardown below.
        if let Some(token) = self.membership_token.lock().unwrap().take() {
            self.cluster.unwatch(token);
        }
        if let Some(listener) = self.membership_listener.lock().unwrap().take() {
            listener.abort();
        }

        let sessions: Vec<_> = {
            let mut state = self.state.lock().await;
            state.primary = None;
            state.sessions.drain().map(|(_, session)| session).collect()
        };
        for session in sessions {
            session.shutdown(false).await;
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn topology(&self) -> TopologyType {
        TopologyType::ReplicaSet
    }
}
