//! The cluster model: every known server, membership observers, and
//! read-preference candidate selection.

mod pinger;
mod server;

pub(crate) use self::pinger::Pinger;
pub use self::server::{Server, ServerRole};

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;

use crate::{
    event::{ServerMembershipChanged, WatchToken, WatcherSet},
    options::ServerAddress,
    selection_criteria::ReadPreference,
};

const TOPOLOGY_TRACING_EVENT_TARGET: &str = "mongowire::topology";

/// The set of server records for one deployment.
///
/// Lookups take a read lock only; structural mutation and the
/// at-most-one-writable invariant are serialized on the write lock.
pub struct Cluster {
    servers: RwLock<HashMap<ServerAddress, Arc<Server>>>,
    watchers: Mutex<WatcherSet<ServerMembershipChanged>>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(
                self.servers()
                    .iter()
                    .map(|server| (server.address().to_string(), server.role())),
            )
            .finish()
    }
}

impl Cluster {
    pub(crate) fn new() -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            watchers: Mutex::new(WatcherSet::new()),
        }
    }

    /// Adds a record for `address`, returning the existing one on collision.
    pub(crate) fn add(&self, address: ServerAddress) -> Arc<Server> {
        {
            let servers = self.servers.read().unwrap();
            if let Some(server) = servers.get(&address) {
                return Arc::clone(server);
            }
        }

        let mut servers = self.servers.write().unwrap();
        if let Some(server) = servers.get(&address) {
            return Arc::clone(server);
        }
        let server = Arc::new(Server::new(address.clone()));
        servers.insert(address.clone(), Arc::clone(&server));
        drop(servers);

        debug!(
            target: TOPOLOGY_TRACING_EVENT_TARGET,
            address = %address,
            "server added to cluster"
        );
        self.watchers
            .lock()
            .unwrap()
            .broadcast(&ServerMembershipChanged::Added { address });
        server
    }

    /// Removes the record for `address`, notifying observers.
    pub(crate) fn remove(&self, address: &ServerAddress) -> Option<Arc<Server>> {
        let removed = self.servers.write().unwrap().remove(address);
        if let Some(ref server) = removed {
            debug!(
                target: TOPOLOGY_TRACING_EVENT_TARGET,
                address = %server.address(),
                "server removed from cluster"
            );
            self.watchers
                .lock()
                .unwrap()
                .broadcast(&ServerMembershipChanged::Removed {
                    address: address.clone(),
                });
        }
        removed
    }

    /// Fetches the record for `address`.
    pub fn get(&self, address: &ServerAddress) -> Option<Arc<Server>> {
        self.servers.read().unwrap().get(address).map(Arc::clone)
    }

    /// A point-in-time snapshot of every record.
    pub fn servers(&self) -> Vec<Arc<Server>> {
        self.servers.read().unwrap().values().map(Arc::clone).collect()
    }

    pub fn len(&self) -> usize {
        self.servers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.read().unwrap().is_empty()
    }

    /// Marks `address` as the writable member, demoting any other member
    /// currently writable. Holding the write lock across both steps keeps
    /// the at-most-one-writable invariant observable at every instant.
    pub(crate) fn mark_writable(&self, address: &ServerAddress) {
        let servers = self.servers.write().unwrap();
        for (other_address, server) in servers.iter() {
            if other_address != address && server.role() == ServerRole::Primary {
                server.set_role(ServerRole::Secondary);
            }
        }
        if let Some(server) = servers.get(address) {
            server.set_role(ServerRole::Primary);
        }
    }

    /// Demotes `address` if it is currently the writable member.
    pub(crate) fn mark_not_writable(&self, address: &ServerAddress) {
        let servers = self.servers.write().unwrap();
        if let Some(server) = servers.get(address) {
            if server.role() == ServerRole::Primary {
                server.set_role(ServerRole::Secondary);
            }
        }
    }

    /// The current writable member of a replica-set deployment.
    pub fn primary(&self) -> Option<Arc<Server>> {
        self.servers
            .read()
            .unwrap()
            .values()
            .find(|server| server.role() == ServerRole::Primary)
            .map(Arc::clone)
    }

    /// Every known mongos router, nearest first.
    pub(crate) fn mongos_servers(&self) -> Vec<Arc<Server>> {
        let mut routers: Vec<_> = self
            .servers()
            .into_iter()
            .filter(|server| server.role() == ServerRole::Mongos)
            .collect();
        routers.sort_by_key(|server| server.sort_rtt());
        routers
    }

    /// The servers that may answer a request under `read_preference`,
    /// best candidate first: the acceptable set, ordered by ascending mean
    /// latency, with earlier tag sets preferred over later ones.
    pub(crate) fn candidate_servers(&self, read_preference: &ReadPreference) -> Vec<Arc<Server>> {
        let servers = self.servers();

        let primary = servers
            .iter()
            .find(|server| server.role() == ServerRole::Primary)
            .map(Arc::clone);
        let secondaries = || {
            servers
                .iter()
                .filter(|server| server.role() == ServerRole::Secondary)
                .map(Arc::clone)
                .collect::<Vec<_>>()
        };

        match read_preference {
            ReadPreference::Primary => primary.into_iter().collect(),
            ReadPreference::Server { address } => {
                self.get(address).into_iter().collect()
            }
            ReadPreference::PrimaryPreferred { .. } => match primary {
                Some(primary) => vec![primary],
                None => Self::filter_and_order(secondaries(), read_preference),
            },
            ReadPreference::Secondary { .. } => {
                Self::filter_and_order(secondaries(), read_preference)
            }
            ReadPreference::SecondaryPreferred { .. } => {
                let mut candidates = Self::filter_and_order(secondaries(), read_preference);
                if candidates.is_empty() {
                    candidates.extend(primary);
                }
                candidates
            }
            ReadPreference::Nearest { .. } => {
                let eligible = servers
                    .iter()
                    .filter(|server| {
                        matches!(
                            server.role(),
                            ServerRole::Primary | ServerRole::Secondary
                        )
                    })
                    .map(Arc::clone)
                    .collect();
                Self::filter_and_order(eligible, read_preference)
            }
        }
    }

    /// Applies the preference's tag sets in order (the first set with any
    /// match defines the eligible servers), then sorts by mean latency.
    fn filter_and_order(
        eligible: Vec<Arc<Server>>,
        read_preference: &ReadPreference,
    ) -> Vec<Arc<Server>> {
        let tag_sets = read_preference.tag_sets();

        let mut matched = if tag_sets.is_empty() {
            eligible
        } else {
            let mut matched = Vec::new();
            for set in tag_sets {
                matched = eligible
                    .iter()
                    .filter(|server| {
                        let tags = server.tags();
                        set.iter().all(|(k, v)| tags.get(k) == Some(v))
                    })
                    .map(Arc::clone)
                    .collect();
                if !matched.is_empty() {
                    break;
                }
            }
            matched
        };

        matched.sort_by_key(|server| server.sort_rtt());
        matched
    }

    /// Registers a membership observer.
    pub(crate) fn watch(
        &self,
    ) -> (WatchToken, UnboundedReceiver<ServerMembershipChanged>) {
        self.watchers.lock().unwrap().watch()
    }

    /// Deregisters a membership observer. Stale tokens are no-ops.
    pub(crate) fn unwatch(&self, token: WatchToken) {
        self.watchers.lock().unwrap().remove(token);
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::event::ServerMembershipChanged;

    fn address(s: &str) -> ServerAddress {
        ServerAddress::parse(s).unwrap()
    }

    fn seeded() -> Cluster {
        let cluster = Cluster::new();
        for (host, role, rtt_ms) in [
            ("p:27017", ServerRole::Primary, 10),
            ("s1:27017", ServerRole::Secondary, 5),
            ("s2:27017", ServerRole::Secondary, 50),
        ] {
            let server = cluster.add(address(host));
            server.set_role(role);
            server.record_latency(Duration::from_millis(rtt_ms));
        }
        cluster
    }

    #[test]
    fn add_is_idempotent() {
        let cluster = Cluster::new();
        let first = cluster.add(address("a:27017"));
        let second = cluster.add(address("a:27017"));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cluster.len(), 1);
    }

    #[test]
    fn membership_changes_reach_watchers() {
        let cluster = Cluster::new();
        let (_token, mut events) = cluster.watch();

        cluster.add(address("a:27017"));
        assert_eq!(
            events.try_recv().unwrap(),
            ServerMembershipChanged::Added {
                address: address("a:27017")
            }
        );

        cluster.remove(&address("a:27017"));
        assert_eq!(
            events.try_recv().unwrap(),
            ServerMembershipChanged::Removed {
                address: address("a:27017")
            }
        );
    }

    #[test]
    fn at_most_one_writable() {
        let cluster = seeded();
        cluster.mark_writable(&address("s1:27017"));

        let writable: Vec<_> = cluster
            .servers()
            .into_iter()
            .filter(|s| s.is_writable())
            .collect();
        assert_eq!(writable.len(), 1);
        assert_eq!(writable[0].address(), &address("s1:27017"));
    }

    #[test]
    fn secondary_candidates_are_latency_ordered() {
        let cluster = seeded();
        let candidates =
            cluster.candidate_servers(&ReadPreference::Secondary { tag_sets: Vec::new() });
        let names: Vec<_> = candidates.iter().map(|s| s.address().to_string()).collect();
        assert_eq!(names, vec!["s1:27017", "s2:27017"]);
    }

    #[test]
    fn secondary_preferred_falls_back_to_primary() {
        let cluster = seeded();
        cluster.get(&address("s1:27017")).unwrap().mark_unknown();
        cluster.get(&address("s2:27017")).unwrap().mark_unknown();

        let candidates = cluster
            .candidate_servers(&ReadPreference::SecondaryPreferred { tag_sets: Vec::new() });
        let names: Vec<_> = candidates.iter().map(|s| s.address().to_string()).collect();
        assert_eq!(names, vec!["p:27017"]);
    }

    #[test]
    fn earlier_tag_sets_win() {
        let cluster = seeded();
        let s2 = cluster.get(&address("s2:27017")).unwrap();
        {
            // Only the slow secondary is in the east.
            let server = s2;
            server.apply_reply(&crate::is_master::IsMasterReply {
                server_address: address("s2:27017"),
                command_response: crate::bson::from_document(crate::bson::doc! {
                    "ok": 1.0,
                    "secondary": true,
                    "setName": "rs0",
                    "tags": { "dc": "east" },
                })
                .unwrap(),
                round_trip_time: Duration::from_millis(50),
            });
        }

        let mut east = crate::selection_criteria::TagSet::new();
        east.insert("dc".to_string(), "east".to_string());
        let mut west = crate::selection_criteria::TagSet::new();
        west.insert("dc".to_string(), "west".to_string());

        let pref = ReadPreference::Secondary {
            tag_sets: vec![west, east],
        };
        let candidates = cluster.candidate_servers(&pref);
        // No server matches "west", so the second set decides.
        let names: Vec<_> = candidates.iter().map(|s| s.address().to_string()).collect();
        assert_eq!(names, vec!["s2:27017"]);
    }

    #[test]
    fn nearest_spans_both_roles() {
        let cluster = seeded();
        let candidates =
            cluster.candidate_servers(&ReadPreference::Nearest { tag_sets: Vec::new() });
        let names: Vec<_> = candidates.iter().map(|s| s.address().to_string()).collect();
        assert_eq!(names, vec!["s1:27017", "p:27017", "s2:27017"]);
    }

    #[test]
    fn pinned_server_preference() {
        let cluster = seeded();
        let pref = ReadPreference::Server {
            address: address("s2:27017"),
        };
        let candidates = cluster.candidate_servers(&pref);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].address(), &address("s2:27017"));
    }
}
