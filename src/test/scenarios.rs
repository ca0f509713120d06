//! End-to-end scenarios: bootstrap discovery, failover, read-preference
//! routing, and the cursor lifecycle.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use super::{
    mock_server::{is_command, MockServer, ScriptedResponse},
    test_options, wait_until,
};
use crate::{
    bson::doc,
    client::Client,
    cluster::ServerRole,
    dispatch::Request,
    error::ErrorKind,
    options::ServerAddress,
    wire::{Message, Namespace, Query, QueryFlags, Reply},
    TopologyType,
};

fn find(namespace: &str) -> Query {
    Query {
        namespace: Namespace::parse(namespace).unwrap(),
        flags: QueryFlags::empty(),
        skip: 0,
        limit: 0,
        query: doc! {},
        projection: None,
    }
}

// S1: a configuration naming one server learns the rest of the replica set
// from the hosts list in its topology reply.
#[tokio::test]
async fn bootstrap_discovers_members_from_hosts_list() {
    let me = Arc::new(Mutex::new(String::new()));
    let script_me = Arc::clone(&me);
    let server = MockServer::start(move |message| {
        if is_command(message, "isMaster") {
            let me = script_me.lock().unwrap().clone();
            ScriptedResponse::command(doc! {
                "ok": 1.0,
                "ismaster": true,
                "setName": "rs0",
                "me": (me.clone()),
                "primary": (me.clone()),
                "hosts": [(me), "b:1234"],
            })
        } else {
            ScriptedResponse::Ignore
        }
    })
    .await;
    *me.lock().unwrap() = server.address().to_string();

    let client = Client::connect(test_options(vec![server.address().clone()]))
        .await
        .unwrap();

    assert_eq!(client.topology(), TopologyType::ReplicaSet);
    assert_eq!(client.cluster().len(), 2);

    let seed = client.cluster().get(server.address()).unwrap();
    assert!(seed.is_writable());

    let discovered = client
        .cluster()
        .get(&ServerAddress::parse("b:1234").unwrap())
        .expect("host from the topology reply joins the cluster");
    assert!(!discovered.is_writable());
    assert_eq!(discovered.role(), ServerRole::Unknown);

    client.shutdown().await;
}

// S2: the primary drops mid-query; the in-flight operation fails with
// CONNECTION_LOST, the dispatcher hunts down the newly-promoted member,
// and subsequent primary operations land there.
#[tokio::test]
async fn primary_failover() {
    let promoted = Arc::new(AtomicBool::new(false));

    let a_name = Arc::new(Mutex::new(String::new()));
    let a_script_name = Arc::clone(&a_name);
    let a_promoted = Arc::clone(&promoted);
    let server_a = MockServer::start(move |message| {
        if is_command(message, "isMaster") {
            let me = a_script_name.lock().unwrap().clone();
            let primary = !a_promoted.load(Ordering::SeqCst);
            ScriptedResponse::command(doc! {
                "ok": 1.0,
                "ismaster": (primary),
                "secondary": (!primary),
                "setName": "rs0",
                "me": (me),
            })
        } else {
            // The crash: promote the peer and sever this connection with
            // the query still unanswered.
            a_promoted.store(true, Ordering::SeqCst);
            ScriptedResponse::Hangup
        }
    })
    .await;
    *a_name.lock().unwrap() = server_a.address().to_string();

    let b_name = Arc::new(Mutex::new(String::new()));
    let b_script_name = Arc::clone(&b_name);
    let b_promoted = Arc::clone(&promoted);
    let server_b = MockServer::start(move |message| {
        if is_command(message, "isMaster") {
            let me = b_script_name.lock().unwrap().clone();
            let primary = b_promoted.load(Ordering::SeqCst);
            ScriptedResponse::command(doc! {
                "ok": 1.0,
                "ismaster": (primary),
                "secondary": (!primary),
                "setName": "rs0",
                "me": (me),
            })
        } else if is_command(message, "whatsmyuri") {
            ScriptedResponse::command(doc! { "ok": 1.0, "you": "here" })
        } else {
            ScriptedResponse::Reply(Reply {
                documents: vec![doc! { "served_by": "b" }],
                ..Default::default()
            })
        }
    })
    .await;
    *b_name.lock().unwrap() = server_b.address().to_string();

    let client = Client::connect(test_options(vec![
        server_a.address().clone(),
        server_b.address().clone(),
    ]))
    .await
    .unwrap();
    assert_eq!(client.topology(), TopologyType::ReplicaSet);

    // The in-flight query dies with the connection.
    let err = client
        .execute(Request::new(Message::Query(find("db.coll"))))
        .await
        .await_reply()
        .await
        .unwrap_err();
    assert!(
        matches!(*err.kind, ErrorKind::ConnectionLost { .. }),
        "expected CONNECTION_LOST, got {:?}",
        err
    );

    // The reconnect strategy polls the members until the promoted one
    // reports itself primary.
    assert!(
        wait_until(Duration::from_secs(3), || {
            client
                .cluster()
                .primary()
                .map(|primary| primary.address() == server_b.address())
                .unwrap_or(false)
        })
        .await
    );

    // The next primary operation is rerouted to the promoted member.
    let reply = client
        .run_command("admin", doc! { "whatsmyuri": 1 }, None)
        .await
        .unwrap();
    assert_eq!(reply.get_str("you"), Some("here"));
    assert!(server_b
        .received()
        .iter()
        .any(|message| is_command(message, "whatsmyuri")));

    client.shutdown().await;
}

// S3: secondary reads go to the lowest-latency eligible member, and fail
// over to the next one when it becomes unreachable.
#[tokio::test]
async fn read_preference_routing_prefers_low_latency() {
    async fn secondary(tag: &'static str) -> MockServer {
        let name = Arc::new(Mutex::new(String::new()));
        let script_name = Arc::clone(&name);
        let server = MockServer::start(move |message| {
            if is_command(message, "isMaster") {
                let me = script_name.lock().unwrap().clone();
                ScriptedResponse::command(doc! {
                    "ok": 1.0,
                    "ismaster": false,
                    "secondary": true,
                    "setName": "rs0",
                    "me": (me),
                })
            } else {
                ScriptedResponse::Reply(Reply {
                    documents: vec![doc! { "served_by": tag }],
                    ..Default::default()
                })
            }
        })
        .await;
        *name.lock().unwrap() = server.address().to_string();
        server
    }

    let p_name = Arc::new(Mutex::new(String::new()));
    let p_script_name = Arc::clone(&p_name);
    let primary = MockServer::start(move |message| {
        if is_command(message, "isMaster") {
            let me = p_script_name.lock().unwrap().clone();
            ScriptedResponse::command(doc! {
                "ok": 1.0,
                "ismaster": true,
                "setName": "rs0",
                "me": (me),
            })
        } else {
            ScriptedResponse::Ignore
        }
    })
    .await;
    *p_name.lock().unwrap() = primary.address().to_string();

    let s1 = secondary("s1").await;
    let s2 = secondary("s2").await;

    let mut options = test_options(vec![
        primary.address().clone(),
        s1.address().clone(),
        s2.address().clone(),
    ]);
    options.read_preference = Some(crate::ReadPreference::Secondary {
        tag_sets: Vec::new(),
    });

    let client = Client::connect(options).await.unwrap();

    // Pin the measured latencies so the ordering is deterministic.
    client
        .cluster()
        .get(s1.address())
        .unwrap()
        .set_average_rtt(Duration::from_millis(5));
    client
        .cluster()
        .get(s2.address())
        .unwrap()
        .set_average_rtt(Duration::from_millis(50));

    let mut cursor = client.query(find("db.coll")).await.unwrap();
    let first = cursor.next().await.unwrap().unwrap();
    assert_eq!(first.get_str("served_by"), Some("s1"));
    assert!(s2.received().is_empty());

    // The near secondary goes away; the next read lands on the far one.
    s1.stop();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut cursor = client.query(find("db.coll")).await.unwrap();
    let next = cursor.next().await.unwrap().unwrap();
    assert_eq!(next.get_str("served_by"), Some("s2"));

    client.shutdown().await;
}

// S5: a cursor drains its first batch, fetches the rest with a GET_MORE on
// the same server, and never kills an exhausted cursor.
#[tokio::test]
async fn cursor_lifecycle() {
    let server = MockServer::start(|message| match message {
        message if is_command(message, "isMaster") => {
            ScriptedResponse::command(doc! { "ok": 1.0, "ismaster": true })
        }
        Message::Query(..) => ScriptedResponse::Reply(Reply {
            cursor_id: 42,
            documents: (0..10).map(|i| doc! { "i": i }).collect(),
            ..Default::default()
        }),
        Message::GetMore(get_more) => {
            assert_eq!(get_more.cursor_id, 42);
            ScriptedResponse::Reply(Reply {
                cursor_id: 0,
                documents: (10..15).map(|i| doc! { "i": i }).collect(),
                ..Default::default()
            })
        }
        _ => ScriptedResponse::Ignore,
    })
    .await;

    let client = Client::connect(test_options(vec![server.address().clone()]))
        .await
        .unwrap();
    assert_eq!(client.topology(), TopologyType::Standalone);

    let mut query = find("db.coll");
    query.limit = 10;
    let mut cursor = client.query(query).await.unwrap();
    let documents = cursor.collect_remaining().await.unwrap();

    assert_eq!(documents.len(), 15);
    let indices: Vec<i32> = documents
        .iter()
        .map(|d| d.get_i32("i").unwrap())
        .collect();
    assert_eq!(indices, (0..15).collect::<Vec<_>>());

    assert!(!server
        .received()
        .iter()
        .any(|message| matches!(message, Message::KillCursors(..))));

    client.shutdown().await;
}

// S5 variant: closing early sends exactly one KILL_CURSORS for the live id
// to the server that owns the cursor.
#[tokio::test]
async fn closing_a_live_cursor_kills_it() {
    let server = MockServer::start(|message| match message {
        message if is_command(message, "isMaster") => {
            ScriptedResponse::command(doc! { "ok": 1.0, "ismaster": true })
        }
        Message::Query(..) => ScriptedResponse::Reply(Reply {
            cursor_id: 42,
            documents: (0..10).map(|i| doc! { "i": i }).collect(),
            ..Default::default()
        }),
        _ => ScriptedResponse::Ignore,
    })
    .await;

    let client = Client::connect(test_options(vec![server.address().clone()]))
        .await
        .unwrap();

    let mut query = find("db.coll");
    query.limit = 10;
    let mut cursor = client.query(query).await.unwrap();
    let first = cursor.next().await.unwrap().unwrap();
    assert_eq!(first.get_i32("i"), Some(0));

    cursor.close().await;

    assert!(
        wait_until(Duration::from_secs(2), || {
            server
                .received()
                .iter()
                .any(|message| matches!(
                    message,
                    Message::KillCursors(kill) if kill.cursor_ids == vec![42]
                ))
        })
        .await
    );
    let kills = server
        .received()
        .iter()
        .filter(|message| matches!(message, Message::KillCursors(..)))
        .count();
    assert_eq!(kills, 1);

    client.shutdown().await;
}

// S5 drop-guard variant: a cursor dropped without close still releases the
// server-side cursor.
#[tokio::test]
async fn dropping_a_live_cursor_kills_it() {
    let server = MockServer::start(|message| match message {
        message if is_command(message, "isMaster") => {
            ScriptedResponse::command(doc! { "ok": 1.0, "ismaster": true })
        }
        Message::Query(..) => ScriptedResponse::Reply(Reply {
            cursor_id: 77,
            documents: vec![doc! { "i": 0 }],
            ..Default::default()
        }),
        _ => ScriptedResponse::Ignore,
    })
    .await;

    let client = Client::connect(test_options(vec![server.address().clone()]))
        .await
        .unwrap();

    let cursor = client.query(find("db.coll")).await.unwrap();
    assert_eq!(cursor.cursor_id(), 77);
    drop(cursor);

    assert!(
        wait_until(Duration::from_secs(2), || {
            server
                .received()
                .iter()
                .any(|message| matches!(
                    message,
                    Message::KillCursors(kill) if kill.cursor_ids == vec![77]
                ))
        })
        .await
    );

    client.shutdown().await;
}

// A deployment fronted by mongos routers: requests go to the nearest
// router, and a stale-config reply is retried once against another one.
#[tokio::test]
async fn sharded_routing_retries_stale_config_on_another_router() {
    let r1 = MockServer::start(|message| {
        if is_command(message, "isMaster") {
            ScriptedResponse::command(doc! { "ok": 1.0, "ismaster": true, "msg": "isdbgrid" })
        } else {
            ScriptedResponse::Reply(Reply {
                flags: crate::wire::ReplyFlags::SHARD_CONFIG_STALE,
                documents: vec![doc! { "$err": "stale config" }],
                ..Default::default()
            })
        }
    })
    .await;

    let r2 = MockServer::start(|message| {
        if is_command(message, "isMaster") {
            ScriptedResponse::command(doc! { "ok": 1.0, "ismaster": true, "msg": "isdbgrid" })
        } else {
            ScriptedResponse::Reply(Reply {
                documents: vec![doc! { "served_by": "r2" }],
                ..Default::default()
            })
        }
    })
    .await;

    let client = Client::connect(test_options(vec![
        r1.address().clone(),
        r2.address().clone(),
    ]))
    .await
    .unwrap();
    assert_eq!(client.topology(), TopologyType::Sharded);

    // Make the stale router the preferred one.
    client
        .cluster()
        .get(r1.address())
        .unwrap()
        .set_average_rtt(Duration::from_millis(1));
    client
        .cluster()
        .get(r2.address())
        .unwrap()
        .set_average_rtt(Duration::from_millis(10));

    let mut cursor = client.query(find("db.coll")).await.unwrap();
    let document = cursor.next().await.unwrap().unwrap();
    assert_eq!(document.get_str("served_by"), Some("r2"));

    assert!(r1
        .received()
        .iter()
        .any(|message| matches!(message, Message::Query(q) if q.namespace.coll == "coll")));
    assert!(r2
        .received()
        .iter()
        .any(|message| matches!(message, Message::Query(q) if q.namespace.coll == "coll")));

    client.shutdown().await;
}

// The persistence document round-trips and resumes against the same
// server.
#[tokio::test]
async fn cursor_state_survives_persistence() {
    let server = MockServer::start(|message| match message {
        message if is_command(message, "isMaster") => {
            ScriptedResponse::command(doc! { "ok": 1.0, "ismaster": true })
        }
        message if is_command(message, "ping") => {
            ScriptedResponse::command(doc! { "ok": 1.0 })
        }
        Message::Query(..) => ScriptedResponse::Reply(Reply {
            cursor_id: 99,
            documents: vec![doc! { "i": 0 }],
            ..Default::default()
        }),
        Message::GetMore(..) => ScriptedResponse::Reply(Reply {
            cursor_id: 0,
            documents: vec![doc! { "i": 1 }],
            ..Default::default()
        }),
        _ => ScriptedResponse::Ignore,
    })
    .await;

    let client = Client::connect(test_options(vec![server.address().clone()]))
        .await
        .unwrap();

    let mut query = find("db.coll");
    query.limit = 1;
    let mut cursor = client.query(query).await.unwrap();
    assert!(cursor.next().await.unwrap().is_ok());

    let state = cursor.state_document();
    assert_eq!(state.get_i64("cursorId"), Some(99));
    assert_eq!(state.get_str("namespace"), Some("db.coll"));
    assert_eq!(state.get_str("address").unwrap(), server.address().to_string());

    // Forget the original iterator without killing the server cursor.
    std::mem::forget(cursor);

    let mut resumed = client.resume_cursor(&state).await.unwrap();
    let rest = resumed.collect_remaining().await.unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].get_i32("i"), Some(1));

    client.shutdown().await;
}
