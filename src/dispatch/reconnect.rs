//! Recovery procedures invoked when a dispatcher loses its server.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::{debug, warn};

use crate::{
    cluster::{Cluster, Server},
    conn::SocketSession,
    is_master::run_is_master,
    options::{ClientOptions, ServerAddress},
};

const TOPOLOGY_TRACING_EVENT_TARGET: &str = "mongowire::topology";

/// How long to wait between polling rounds while hunting for a primary.
const PRIMARY_POLL_PAUSE: Duration = Duration::from_millis(500);

/// Reconnects to a lost standalone endpoint with exponential backoff,
/// within the server-selection deadline.
pub(crate) async fn standalone(
    address: &ServerAddress,
    options: &ClientOptions,
) -> Option<SocketSession> {
    let deadline = Instant::now() + options.effective_server_selection_timeout();
    let mut backoff = Duration::from_millis(100);

    loop {
        match SocketSession::connect(address.clone(), options).await {
            Ok(session) => return Some(session),
            Err(error) => {
                debug!(
                    target: TOPOLOGY_TRACING_EVENT_TARGET,
                    address = %address,
                    error = %error,
                    "reconnect attempt failed"
                );
            }
        }

        if Instant::now() + backoff > deadline {
            warn!(
                target: TOPOLOGY_TRACING_EVENT_TARGET,
                address = %address,
                "giving up reconnecting to standalone server"
            );
            return None;
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(Duration::from_secs(5));
    }
}

/// Polls every configured and discovered member until one reports itself
/// primary under its own name, within the server-selection deadline. On
/// success the probing session is kept as the new primary session.
pub(crate) async fn replica_set(
    cluster: &Cluster,
    options: &ClientOptions,
) -> Option<(SocketSession, Arc<Server>)> {
    let deadline = Instant::now() + options.effective_server_selection_timeout();

    loop {
        for server in cluster.servers() {
            if Instant::now() > deadline {
                break;
            }
            let address = server.address().clone();

            let session = match SocketSession::connect(address.clone(), options).await {
                Ok(session) => session,
                Err(_) => {
                    server.mark_unknown();
                    continue;
                }
            };

            match run_is_master(&session, options.app_name.as_deref()).await {
                Ok(reply) => {
                    server.apply_reply(&reply);
                    if reply.command_response.confirms_primacy(&address) {
                        cluster.mark_writable(&address);
                        debug!(
                            target: TOPOLOGY_TRACING_EVENT_TARGET,
                            address = %address,
                            "found new primary"
                        );
                        return Some((session, server));
                    }
                }
                Err(_) => server.mark_unknown(),
            }

            session.close();
        }

        if Instant::now() + PRIMARY_POLL_PAUSE > deadline {
            warn!(
                target: TOPOLOGY_TRACING_EVENT_TARGET,
                "no member reported itself primary before the deadline"
            );
            return None;
        }
        tokio::time::sleep(PRIMARY_POLL_PAUSE).await;
    }
}
