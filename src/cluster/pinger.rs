//! The background task keeping the cluster model fresh.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, warn};

use super::{Cluster, Server, ServerRole};
use crate::{
    conn::SocketSession,
    is_master::run_is_master,
    options::{ClientOptions, ServerAddress},
};

const TOPOLOGY_TRACING_EVENT_TARGET: &str = "mongowire::topology";

/// Periodically pings every member of the cluster, updating each record's
/// role, tags, and latency, and discovering new members from hosts lists.
pub(crate) struct Pinger {
    cluster: Arc<Cluster>,
    options: ClientOptions,
    /// One cached monitoring connection per server, replaced on failure.
    sessions: AsyncMutex<HashMap<ServerAddress, SocketSession>>,
    shutdown: watch::Sender<bool>,
}

impl Pinger {
    pub(crate) fn new(cluster: Arc<Cluster>, options: ClientOptions) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            cluster,
            options,
            sessions: AsyncMutex::new(HashMap::new()),
            shutdown,
        })
    }

    /// Sweeps every known server once. Awaited during bootstrap so the
    /// first server selection sees a populated cluster.
    pub(crate) async fn initial_sweep(&self) {
        self.sweep().await;
    }

    /// Starts the periodic sweep task.
    pub(crate) fn start(self: &Arc<Self>) {
        let pinger = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            if *shutdown.borrow() {
                return;
            }
            let frequency = pinger.options.effective_heartbeat_freq();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(frequency) => pinger.sweep().await,
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    /// Stops the sweep task and closes the monitoring connections.
    pub(crate) async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let mut sessions = self.sessions.lock().await;
        for (_, session) in sessions.drain() {
            session.close();
        }
    }

    async fn sweep(&self) {
        for server in self.cluster.servers() {
            self.check_server(&server).await;
        }
    }

    /// Pings one server and folds the outcome into the cluster model.
    async fn check_server(&self, server: &Arc<Server>) {
        let address = server.address().clone();

        let session = match self.monitoring_session(&address).await {
            Some(session) => session,
            None => {
                server.mark_unknown();
                return;
            }
        };

        let reply = match run_is_master(&session, self.options.app_name.as_deref()).await {
            Ok(reply) => reply,
            Err(error) => {
                debug!(
                    target: TOPOLOGY_TRACING_EVENT_TARGET,
                    address = %address,
                    error = %error,
                    "ping failed"
                );
                server.mark_unknown();
                self.evict_session(&address).await;
                return;
            }
        };

        if let (Some(expected), Some(actual)) = (
            self.options.repl_set_name.as_deref(),
            reply.command_response.set_name.as_deref(),
        ) {
            if expected != actual {
                warn!(
                    target: TOPOLOGY_TRACING_EVENT_TARGET,
                    address = %address,
                    expected,
                    actual,
                    "server belongs to a different replica set"
                );
                server.mark_unknown();
                return;
            }
        }

        server.apply_reply(&reply);

        // Routing the writable invariant through the cluster demotes any
        // member that was primary a moment ago.
        if server.role() == ServerRole::Primary {
            self.cluster.mark_writable(&address);
        }

        if self.options.auto_discover_servers {
            for host in reply.command_response.known_hosts() {
                match ServerAddress::parse(host) {
                    Ok(discovered) => {
                        self.cluster.add(discovered);
                    }
                    Err(_) => warn!(
                        target: TOPOLOGY_TRACING_EVENT_TARGET,
                        address = %address,
                        host = %host,
                        "ignoring unparseable host in topology reply"
                    ),
                }
            }
        }
    }

    async fn monitoring_session(&self, address: &ServerAddress) -> Option<SocketSession> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(address) {
            if session.is_open() {
                return Some(session.clone());
            }
            sessions.remove(address);
        }

        match SocketSession::connect(address.clone(), &self.options).await {
            Ok(session) => {
                sessions.insert(address.clone(), session.clone());
                Some(session)
            }
            Err(error) => {
                debug!(
                    target: TOPOLOGY_TRACING_EVENT_TARGET,
                    address = %address,
                    error = %error,
                    "monitoring connection failed"
                );
                None
            }
        }
    }

    async fn evict_session(&self, address: &ServerAddress) {
        if let Some(session) = self.sessions.lock().await.remove(address) {
            session.close();
        }
    }
}
