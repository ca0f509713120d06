//! The `isMaster` command: how a server describes its own role.

use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::{
    bson::{doc, from_document, Document},
    callback::ConvertingCallback,
    cluster::ServerRole,
    conn::{SendError, SocketSession},
    error::{Error, Result},
    options::ServerAddress,
    selection_criteria::TagSet,
    wire::{Message, Query},
};

/// Builds the `isMaster` command document, including the application name
/// the deployment should display for this client.
pub(crate) fn is_master_command(app_name: Option<&str>) -> Document {
    let mut command = doc! { "isMaster": 1 };
    if let Some(name) = app_name {
        command.insert("client", doc! { "application": { "name": name } });
    }
    command
}

/// Runs `isMaster` on `session`, measuring the round trip.
pub(crate) async fn run_is_master(
    session: &SocketSession,
    app_name: Option<&str>,
) -> Result<IsMasterReply> {
    let address = session.address().clone();
    let message = Message::Query(Query::command("admin", is_master_command(app_name)));

    let start = Instant::now();
    let (callback, rx) = ConvertingCallback::channel(move |reply| {
        let document = reply.command_document()?.clone();
        IsMasterReply::parse(address, document, start.elapsed())
    });
    session
        .send(&message, callback, None)
        .await
        .map_err(SendError::fail)?;

    match rx.await {
        Ok(result) => result,
        Err(_) => Err(Error::connection_lost(session.server_name())),
    }
}

/// A parsed `isMaster` reply plus the measured round-trip time.
#[derive(Clone, Debug)]
pub(crate) struct IsMasterReply {
    pub(crate) server_address: ServerAddress,
    pub(crate) command_response: IsMasterCommandResponse,
    pub(crate) round_trip_time: Duration,
}

impl IsMasterReply {
    pub(crate) fn parse(
        server_address: ServerAddress,
        document: Document,
        round_trip_time: Duration,
    ) -> Result<Self> {
        let command_response: IsMasterCommandResponse = from_document(document)?;
        Ok(Self {
            server_address,
            command_response,
            round_trip_time,
        })
    }
}

/// The response to an `isMaster` command.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct IsMasterCommandResponse {
    /// Whether the server can accept writes.
    #[serde(rename = "ismaster")]
    pub(crate) is_master: Option<bool>,

    /// Whether the server is a replica set secondary.
    pub(crate) secondary: Option<bool>,

    /// Contains the value "isdbgrid" when returned by a mongos.
    pub(crate) msg: Option<String>,

    /// The name of the replica set, when the server is a member of one.
    pub(crate) set_name: Option<String>,

    /// All non-hidden members of the replica set.
    pub(crate) hosts: Option<Vec<String>>,

    /// Passive (non-electable) members.
    pub(crate) passives: Option<Vec<String>>,

    /// The address of the member currently primary, as the set sees it.
    pub(crate) primary: Option<String>,

    /// The address the server knows itself by.
    pub(crate) me: Option<String>,

    /// User-defined tags for the member.
    pub(crate) tags: Option<TagSet>,

    /// Whether the member is hidden from routing.
    pub(crate) hidden: Option<bool>,

    /// Whether the member is an arbiter.
    pub(crate) arbiter_only: Option<bool>,

    /// The largest document the server accepts.
    pub(crate) max_bson_object_size: Option<i64>,

    pub(crate) max_wire_version: Option<i32>,
    pub(crate) min_wire_version: Option<i32>,

    pub(crate) ok: Option<f64>,
}

impl IsMasterCommandResponse {
    /// The role implied by this reply.
    pub(crate) fn server_role(&self) -> ServerRole {
        if self.ok != Some(1.0) {
            return ServerRole::Unknown;
        }
        if self.msg.as_deref() == Some("isdbgrid") {
            return ServerRole::Mongos;
        }
        if self.set_name.is_some() {
            if self.hidden == Some(true) || self.arbiter_only == Some(true) {
                return ServerRole::Unknown;
            }
            if self.is_master == Some(true) {
                return ServerRole::Primary;
            }
            if self.secondary == Some(true) {
                return ServerRole::Secondary;
            }
            return ServerRole::Unknown;
        }
        ServerRole::Standalone
    }

    /// Whether this server reports itself as the primary under its own
    /// canonical name. A true primary must agree about its identity.
    pub(crate) fn confirms_primacy(&self, address: &ServerAddress) -> bool {
        if self.is_master != Some(true) {
            return false;
        }
        match self.me.as_deref() {
            Some(me) => ServerAddress::parse(me)
                .map(|me| me == *address)
                .unwrap_or(false),
            None => true,
        }
    }

    /// Every member address this reply names.
    pub(crate) fn known_hosts(&self) -> impl Iterator<Item = &String> {
        self.hosts
            .iter()
            .flatten()
            .chain(self.passives.iter().flatten())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(document: Document) -> IsMasterCommandResponse {
        from_document(document).unwrap()
    }

    #[test]
    fn role_inference() {
        let primary = parse(doc! { "ok": 1.0, "ismaster": true, "setName": "rs0" });
        assert_eq!(primary.server_role(), ServerRole::Primary);

        let secondary = parse(doc! { "ok": 1.0, "ismaster": false, "secondary": true, "setName": "rs0" });
        assert_eq!(secondary.server_role(), ServerRole::Secondary);

        let mongos = parse(doc! { "ok": 1.0, "ismaster": true, "msg": "isdbgrid" });
        assert_eq!(mongos.server_role(), ServerRole::Mongos);

        let standalone = parse(doc! { "ok": 1.0, "ismaster": true });
        assert_eq!(standalone.server_role(), ServerRole::Standalone);

        let hidden = parse(doc! { "ok": 1.0, "secondary": true, "hidden": true, "setName": "rs0" });
        assert_eq!(hidden.server_role(), ServerRole::Unknown);

        let failed = parse(doc! { "ok": 0, "errmsg": "shutting down" });
        assert_eq!(failed.server_role(), ServerRole::Unknown);
    }

    #[test]
    fn primacy_requires_matching_identity() {
        let address = ServerAddress::parse("a:27017").unwrap();

        let claims = parse(doc! { "ok": 1.0, "ismaster": true, "me": "a:27017" });
        assert!(claims.confirms_primacy(&address));

        let someone_else = parse(doc! { "ok": 1.0, "ismaster": true, "me": "b:27017" });
        assert!(!someone_else.confirms_primacy(&address));

        let not_primary = parse(doc! { "ok": 1.0, "ismaster": false, "me": "a:27017" });
        assert!(!not_primary.confirms_primacy(&address));
    }

    #[test]
    fn known_hosts_include_passives() {
        let reply = parse(doc! {
            "ok": 1.0,
            "hosts": ["a:27017", "b:27017"],
            "passives": ["c:27017"],
        });
        let hosts: Vec<_> = reply.known_hosts().cloned().collect();
        assert_eq!(hosts, vec!["a:27017", "b:27017", "c:27017"]);
    }
}
