//! The dispatcher for sharded deployments: every known mongos router is a
//! candidate; dead routers are evicted and the next one tried.

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

use super::{send_on_session, Dispatched, Dispatcher, Request, TopologyType};
use crate::{
    callback::{BoxedCallback, ReplyCallback},
    cluster::Cluster,
    conn::{SendError, SocketSession},
    error::{Error, ErrorKind, Result},
    event::{ServerMembershipChanged, WatchToken},
    options::{ClientOptions, ServerAddress},
    wire::{Reply, ReplyFlags},
};

const SELECTION_TRACING_EVENT_TARGET: &str = "mongowire::server_selection";

/// Routes requests across mongos routers, nearest first. There is no
/// primary and no failover workflow beyond evict-and-reselect.
pub(crate) struct ShardedDispatcher {
    cluster: Arc<Cluster>,
    options: ClientOptions,
    sessions: tokio::sync::Mutex<HashMap<ServerAddress, SocketSession>>,
    open: AtomicBool,
    membership_token: Mutex<Option<WatchToken>>,
    membership_listener: Mutex<Option<JoinHandle<()>>>,
    weak: Weak<Self>,
}

impl ShardedDispatcher {
    pub(crate) fn new(cluster: Arc<Cluster>, options: ClientOptions) -> Arc<Self> {
        let (token, mut membership) = cluster.watch();

        let dispatcher = Arc::new_cyclic(|weak: &Weak<Self>| Self {
            cluster,
            options,
            sessions: tokio::sync::Mutex::new(HashMap::new()),
            open: AtomicBool::new(true),
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
                    dispatcher.evict(&address).await;
                }
            }
        });
        *dispatcher.membership_listener.lock().unwrap() = Some(listener);

        dispatcher
    }

    async fn session_for(&self, address: &ServerAddress) -> Result<SocketSession> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(address) {
            if session.is_open() {
                return Ok(session.clone());
            }
            sessions.remove(address);
        }

        let session = SocketSession::connect(address.clone(), &self.options).await?;
        sessions.insert(address.clone(), session.clone());
        Ok(session)
    }

    async fn evict(&self, address: &ServerAddress) {
        if let Some(session) = self.sessions.lock().await.remove(address) {
            debug!(
                target: SELECTION_TRACING_EVENT_TARGET,
                address = %address,
                "evicting router session"
            );
            session.close();
        }
    }

    /// One pass over the routers, nearest first, skipping `exclude`.
    async fn dispatch(
        &self,
        request: &Request,
        callback: BoxedCallback,
        exclude: Option<&ServerAddress>,
    ) -> Result<Dispatched> {
        let routers = self.cluster.mongos_servers();
        if routers.is_empty() {
            let error = Error::no_suitable_server("no mongos router is known".to_string());
            callback.fail(error.clone());
            return Err(error);
        }

        let mut callback = callback;
        let mut last_error: Option<Error> = None;
        for router in routers {
            if Some(router.address()) == exclude {
                continue;
            }

            let session = match self.session_for(router.address()).await {
                Ok(session) => session,
                Err(error) => {
                    router.mark_unknown();
                    last_error = Some(error);
                    continue;
                }
            };

            match send_on_session(&session, request, callback).await {
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
                    last_error = Some(error);
                    self.evict(router.address()).await;
                }
                Err(send_error) => {
                    let error = send_error.error().clone();
                    send_error.fail();
                    return Err(error);
                }
            }
        }

        let error = last_error
            .unwrap_or_else(|| Error::no_suitable_server("every router refused".to_string()));
        callback.fail(error.clone());
        Err(error)
    }
}

#[async_trait]
impl Dispatcher for ShardedDispatcher {
    async fn send(&self, request: Request, callback: BoxedCallback) -> Result<Dispatched> {
        if !self.is_open() {
            callback.fail(ErrorKind::ShutdownInProgress.into());
            return Err(ErrorKind::ShutdownInProgress.into());
        }

        // The interceptor retries exactly once when the router answers with
        // a stale-config flag, after invalidating that router's session.
        let served_by = Arc::new(Mutex::new(None));
        let wrapped = Box::new(StaleConfigRetry {
            dispatcher: self.weak.clone(),
            request: request.clone(),
            served_by: Arc::clone(&served_by),
            inner: callback,
        });

        let dispatched = self.dispatch(&request, wrapped, None).await?;
        *served_by.lock().unwrap() = Some(dispatched.session.address().clone());
        Ok(dispatched)
    }

    async fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }

        // Observer first, then children: a membership event arriving during
        // teardown must not resurrect a session.
        if let Some(token) = self.membership_token.lock().unwrap().take() {
            self.cluster.unwatch(token);
        }
        if let Some(listener) = self.membership_listener.lock().unwrap().take() {
            listener.abort();
        }

        let sessions: Vec<_> = {
            let mut guard = self.sessions.lock().await;
            guard.drain().map(|(_, session)| session).collect()
        };
        for session in sessions {
            session.shutdown(false).await;
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn topology(&self) -> TopologyType {
        TopologyType::Sharded
    }
}

/// Retries a request once on a stale shard configuration, routing it away
/// from the router that reported staleness.
struct StaleConfigRetry {
    dispatcher: Weak<ShardedDispatcher>,
    request: Request,
    served_by: Arc<Mutex<Option<ServerAddress>>>,
    inner: BoxedCallback,
}

impl ReplyCallback for StaleConfigRetry {
    fn deliver(self: Box<Self>, reply: Reply) {
        if !reply.flags.contains(ReplyFlags::SHARD_CONFIG_STALE) {
            self.inner.deliver(reply);
            return;
        }

        let dispatcher = match self.dispatcher.upgrade() {
            Some(dispatcher) => dispatcher,
            None => {
                self.inner.deliver(reply);
                return;
            }
        };

        warn!(
            target: SELECTION_TRACING_EVENT_TARGET,
            "router reported stale shard configuration; retrying once"
        );

        let request = self.request;
        let inner = self.inner;
        let stale_router = self.served_by.lock().unwrap().take();
        tokio::spawn(async move {
            if let Some(ref address) = stale_router {
                dispatcher.evict(address).await;
            }
            // The retry delivers straight to the user's sink; a second
            // stale reply surfaces as an error there.
            let _ = dispatcher
                .dispatch(&request, inner, stale_router.as_ref())
                .await;
        });
    }

    fn fail(self: Box<Self>, error: Error) {
        self.inner.fail(error);
    }
}
