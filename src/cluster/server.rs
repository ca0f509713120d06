//! The mutable record a cluster keeps for one server.

use std::{
    sync::RwLock,
    time::{Duration, Instant},
};

use crate::{
    is_master::IsMasterReply,
    options::ServerAddress,
    selection_criteria::TagSet,
};

/// The weight a new latency sample carries in the running average.
const RTT_SAMPLE_WEIGHT: f64 = 0.2;

/// What a server is within its deployment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ServerRole {
    Primary,
    Secondary,
    Mongos,
    Standalone,
    Unknown,
}

impl ServerRole {
    /// Whether a server in this role accepts writes.
    pub fn is_writable(self) -> bool {
        matches!(
            self,
            ServerRole::Primary | ServerRole::Mongos | ServerRole::Standalone
        )
    }
}

#[derive(Debug)]
struct ServerState {
    role: ServerRole,
    tags: TagSet,
    /// Exponentially weighted mean round-trip time. `None` until the first
    /// successful ping, and again after a failed one: an unreachable server
    /// is infinitely far away.
    average_rtt: Option<Duration>,
    last_reply_at: Option<Instant>,
    max_bson_object_size: i64,
    max_wire_version: Option<i32>,
}

/// One server within a cluster model: its canonical address and everything
/// the pinger has learned about it. Role and tags are mutated only through
/// topology replies; latency on every measured round trip.
#[derive(Debug)]
pub struct Server {
    address: ServerAddress,
    state: RwLock<ServerState>,
}

impl Server {
    pub(crate) fn new(address: ServerAddress) -> Self {
        Self {
            address,
            state: RwLock::new(ServerState {
                role: ServerRole::Unknown,
                tags: TagSet::new(),
                average_rtt: None,
                last_reply_at: None,
                max_bson_object_size: 16 * 1024 * 1024,
                max_wire_version: None,
            }),
        }
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn role(&self) -> ServerRole {
        self.state.read().unwrap().role
    }

    pub fn is_writable(&self) -> bool {
        self.role().is_writable()
    }

    pub fn tags(&self) -> TagSet {
        self.state.read().unwrap().tags.clone()
    }

    pub fn average_rtt(&self) -> Option<Duration> {
        self.state.read().unwrap().average_rtt
    }

    pub fn last_reply_at(&self) -> Option<Instant> {
        self.state.read().unwrap().last_reply_at
    }

    pub fn max_bson_object_size(&self) -> i64 {
        self.state.read().unwrap().max_bson_object_size
    }

    pub(crate) fn set_role(&self, role: ServerRole) {
        self.state.write().unwrap().role = role;
    }

    /// Folds a topology reply into the record.
    pub(crate) fn apply_reply(&self, reply: &IsMasterReply) {
        let mut state = self.state.write().unwrap();
        state.role = reply.command_response.server_role();
        state.tags = reply.command_response.tags.clone().unwrap_or_default();
        state.last_reply_at = Some(Instant::now());
        if let Some(size) = reply.command_response.max_bson_object_size {
            state.max_bson_object_size = size;
        }
        state.max_wire_version = reply.command_response.max_wire_version;
        Self::fold_rtt(&mut state, reply.round_trip_time);
    }

    /// Folds one measured round trip into the average.
    pub(crate) fn record_latency(&self, sample: Duration) {
        let mut state = self.state.write().unwrap();
        Self::fold_rtt(&mut state, sample);
    }

    fn fold_rtt(state: &mut ServerState, sample: Duration) {
        state.average_rtt = Some(match state.average_rtt {
            Some(average) => Duration::from_secs_f64(
                RTT_SAMPLE_WEIGHT * sample.as_secs_f64()
                    + (1.0 - RTT_SAMPLE_WEIGHT) * average.as_secs_f64(),
            ),
            None => sample,
        });
    }

    /// Marks the server unreachable: role unknown, latency infinite.
    pub(crate) fn mark_unknown(&self) {
        let mut state = self.state.write().unwrap();
        state.role = ServerRole::Unknown;
        state.average_rtt = None;
    }

    /// Latency for candidate ordering; unreachable servers sort last.
    pub(crate) fn sort_rtt(&self) -> Duration {
        self.average_rtt().unwrap_or(Duration::MAX)
    }

    /// Pins the average directly, bypassing the fold. Test-only.
    #[cfg(test)]
    pub(crate) fn set_average_rtt(&self, rtt: Duration) {
        self.state.write().unwrap().average_rtt = Some(rtt);
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::{Server, ServerRole};
    use crate::options::ServerAddress;

    #[test]
    fn latency_is_exponentially_weighted() {
        let server = Server::new(ServerAddress::parse("a:27017").unwrap());
        server.record_latency(Duration::from_millis(100));
        assert_eq!(server.average_rtt(), Some(Duration::from_millis(100)));

        server.record_latency(Duration::from_millis(200));
        // 0.2 * 200 + 0.8 * 100
        assert_eq!(server.average_rtt(), Some(Duration::from_millis(120)));
    }

    #[test]
    fn unknown_servers_sort_last() {
        let server = Server::new(ServerAddress::parse("a:27017").unwrap());
        server.record_latency(Duration::from_millis(5));
        server.mark_unknown();
        assert_eq!(server.role(), ServerRole::Unknown);
        assert_eq!(server.average_rtt(), None);
        assert_eq!(server.sort_rtt(), Duration::MAX);
    }
}
