//! Session-level tests: reply correlation, write ordering, paired sends,
//! lifecycle, and deadline enforcement.

use std::{sync::Arc, time::Duration};

use tokio::{io::AsyncWriteExt, net::TcpListener, sync::Mutex};

use super::{mock_server::MockServer, test_options, wait_until};
use crate::{
    bson::doc,
    callback::{reply_future, LockType},
    conn::{SendError, SocketSession},
    error::ErrorKind,
    options::ServerAddress,
    wire::{next_request_id, Message, Namespace, Query, QueryFlags, Reply},
};

fn query(marker: i32) -> Message {
    Message::Query(Query {
        namespace: Namespace::parse("db.coll").unwrap(),
        flags: QueryFlags::empty(),
        skip: 0,
        limit: 0,
        query: doc! { "marker": marker },
        projection: None,
    })
}

async fn connect(address: &ServerAddress) -> SocketSession {
    SocketSession::connect(address.clone(), &test_options(vec![address.clone()]))
        .await
        .unwrap()
}

// S4: replies arriving in reverse order still complete the matching sinks,
// and writes reach the server in registration order.
#[tokio::test]
async fn replies_correlate_by_request_id_not_arrival_order() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = ServerAddress::new("127.0.0.1", listener.local_addr().unwrap().port());

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        let mut inbound = Vec::new();
        for _ in 0..3 {
            let (header, message) = Message::read_from(&mut stream).await.unwrap();
            let marker = match message {
                Message::Query(query) => query.query.get_i32("marker").unwrap(),
                other => panic!("expected a query, got {:?}", other),
            };
            inbound.push((header.request_id, marker));
        }

        // Arrival order must match registration order.
        let markers: Vec<i32> = inbound.iter().map(|(_, marker)| *marker).collect();
        assert_eq!(markers, vec![0, 1, 2]);

        // Answer in reverse.
        for (request_id, marker) in inbound.into_iter().rev() {
            let reply = Message::Reply(Reply {
                documents: vec![doc! { "marker": marker }],
                ..Default::default()
            });
            stream
                .write_all(&reply.encode(next_request_id(), request_id))
                .await
                .unwrap();
        }
    });

    let session = connect(&address).await;

    let mut futures = Vec::new();
    for marker in 0..3 {
        let (callback, future) = reply_future(LockType::Mutex);
        let id = session.send(&query(marker), callback, None).await;
        assert!(id.is_ok());
        futures.push((marker, future));
    }

    for (marker, future) in futures {
        let reply = future.await_reply().await.unwrap();
        assert_eq!(reply.documents[0].get_i32("marker"), Some(marker));
    }

    server.await.unwrap();
    session.close();
}

#[tokio::test]
async fn request_ids_increase_across_sends() {
    let server = MockServer::standalone().await;
    let session = connect(server.address()).await;

    let mut previous = None;
    for marker in 0..5 {
        let (callback, _future) = reply_future(LockType::Mutex);
        let id = session.send(&query(marker), callback, None).await.unwrap();
        if let Some(previous) = previous {
            assert!(id > previous, "{} should exceed {}", id, previous);
        }
        previous = Some(id);
    }

    session.close();
}

// A paired send shares one critical section; only the trailing message is
// correlated.
#[tokio::test]
async fn paired_sends_track_only_the_confirmation() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = ServerAddress::new("127.0.0.1", listener.local_addr().unwrap().port());

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        let (_, first) = Message::read_from(&mut stream).await.unwrap();
        assert!(matches!(first, Message::Insert(..)));

        let (header, second) = Message::read_from(&mut stream).await.unwrap();
        match second {
            Message::Query(gle) => assert!(gle.query.contains_key("getlasterror")),
            other => panic!("expected getLastError, got {:?}", other),
        }

        let reply = Message::Reply(Reply {
            documents: vec![doc! { "ok": 1.0, "err": null, "n": 1 }],
            ..Default::default()
        });
        stream
            .write_all(&reply.encode(next_request_id(), header.request_id))
            .await
            .unwrap();
    });

    let session = connect(&address).await;

    let insert = Message::Insert(crate::wire::Insert {
        namespace: Namespace::parse("db.coll").unwrap(),
        documents: vec![doc! { "_id": 1 }],
        continue_on_error: false,
    });
    let gle = Message::Query(Query::command("db", doc! { "getlasterror": 1 }));

    let (callback, future) = reply_future(LockType::Mutex);
    session
        .send_pair(&insert, &gle, callback, None)
        .await
        .unwrap_or_else(|e| panic!("{}", e.error()));
    assert_eq!(session.pending_count(), 1);

    let reply = future.await_reply().await.unwrap();
    assert_eq!(reply.documents[0].get_numeric("n"), Some(1));
    assert!(session.is_idle());

    server.await.unwrap();
    session.close();
}

// Property 4: sinks complete exactly once even when the peer vanishes.
#[tokio::test]
async fn peer_hangup_fails_every_pending_entry() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = ServerAddress::new("127.0.0.1", listener.local_addr().unwrap().port());

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        // Take one message, then slam the connection shut.
        let _ = Message::read_from(&mut stream).await;
        drop(stream);
    });

    let session = connect(&address).await;
    let events = Arc::new(Mutex::new(session.watch()));

    let (callback, future) = reply_future(LockType::Mutex);
    session.send(&query(0), callback, None).await.unwrap();

    let err = future.await_reply().await.unwrap_err();
    assert!(matches!(*err.kind, ErrorKind::ConnectionLost { .. }));
    assert!(session.is_idle());

    // The open->closed transition reaches observers.
    let notified = wait_until(Duration::from_secs(2), || {
        events.try_lock().map(|mut e| e.try_recv().is_ok()).unwrap_or(false)
    })
    .await;
    assert!(notified);

    // Sends after the close are refused without consuming the sink twice.
    let (callback, future) = reply_future(LockType::Mutex);
    match session.send(&query(1), callback, None).await {
        Err(SendError::Rejected { error, callback }) => {
            assert!(error.is_network_error());
            callback.fail(error);
        }
        other => panic!(
            "send on a closed session should be rejected, got {:?}",
            other.map(|_| ()).map_err(|e| e.error().clone())
        ),
    }
    assert!(matches!(
        *future.await_reply().await.unwrap_err().kind,
        ErrorKind::ConnectionLost { .. } | ErrorKind::ConnectionNotAvailable { .. }
    ));
}

#[tokio::test]
async fn cancellation_discards_the_late_reply() {
    let server = MockServer::standalone().await;
    let session = connect(server.address()).await;

    let (callback, future) = reply_future(LockType::Mutex);
    let id = session.send(&query(0), callback, None).await.unwrap();
    session.cancel(id);

    let err = future.await_reply().await.unwrap_err();
    assert!(matches!(*err.kind, ErrorKind::Cancelled));
    assert!(session.is_idle());

    session.close();
}

#[tokio::test]
async fn deadline_expiry_times_out_the_entry() {
    // The standalone script ignores plain queries, so the reply never comes.
    let server = MockServer::standalone().await;
    let session = connect(server.address()).await;

    let (callback, future) = reply_future(LockType::Mutex);
    session
        .send(&query(0), callback, Some(Duration::from_millis(50)))
        .await
        .unwrap();

    let err = future.await_reply().await.unwrap_err();
    assert!(matches!(*err.kind, ErrorKind::OperationTimedOut));
    assert!(session.is_idle());

    session.close();
}

#[tokio::test]
async fn graceful_shutdown_flushes_then_fails_leftovers() {
    let server = MockServer::standalone().await;
    let session = connect(server.address()).await;

    let (callback, future) = reply_future(LockType::Mutex);
    session.send(&query(0), callback, None).await.unwrap();

    session.shutdown(false).await;
    assert!(!session.is_open());

    // The query was flushed to the wire, but its reply can never arrive.
    let err = future.await_reply().await.unwrap_err();
    assert!(matches!(*err.kind, ErrorKind::ShutdownInProgress));

    // The frame did reach the server before the close.
    assert!(
        wait_until(Duration::from_secs(2), || {
            server
                .received()
                .iter()
                .any(|message| matches!(message, Message::Query(q) if q.namespace.coll == "coll"))
        })
        .await
    );
}

#[tokio::test]
async fn unacknowledged_sends_complete_on_enqueue() {
    let server = MockServer::standalone().await;
    let session = connect(server.address()).await;

    let insert = Message::Insert(crate::wire::Insert {
        namespace: Namespace::parse("db.coll").unwrap(),
        documents: vec![doc! { "_id": 1 }],
        continue_on_error: false,
    });

    let (callback, future) = reply_future(LockType::Mutex);
    session.send(&insert, callback, None).await.unwrap();

    // No pending entry: fire-and-forget opcodes are not correlated.
    assert!(session.is_idle());
    assert!(future.await_reply().await.is_ok());

    session.close();
}
