use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reliq::broker::headers::Headers;
use reliq::broker::manager::QueueManager;
use reliq::client::{ClientOptions, Session};
use reliq::error::Error;
use reliq::server::acl::Acl;
use reliq::server::serve_listener;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;

mod helpers;
use helpers::setup_manager;

fn body(text: &str) -> Bytes {
    Bytes::copy_from_slice(text.as_bytes())
}

/// Bind an ephemeral port, serve in the background, return the
/// runtime (kept alive) and the endpoint address.
fn spawn_server(manager: Arc<QueueManager>, acl: Option<Acl>) -> (Runtime, String) {
    let rt = Runtime::new().unwrap();
    let listener = rt.block_on(async { TcpListener::bind("127.0.0.1:0").await.unwrap() });
    let addr = listener.local_addr().unwrap().to_string();
    rt.spawn(async move {
        let _ = serve_listener(listener, manager, acl).await;
    });
    (rt, addr)
}

#[test]
fn remote_put_get_round_trip() {
    let (manager, _tmp) = setup_manager();
    let (_rt, addr) = spawn_server(manager, None);

    let session = Session::connect(&addr, ClientOptions::default()).unwrap();
    let queue = session.queue("remote.jobs");

    let mut headers = Headers::new();
    headers.insert("region", "eu");
    let id = queue.put(body("hello over tcp"), headers).unwrap();

    let listed = queue.list().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id(), Some(id.as_str()));

    let message = queue.get().unwrap().expect("message should round trip");
    assert_eq!(message.id, id);
    assert_eq!(message.body, body("hello over tcp"));
    assert_eq!(
        message.headers.get("region").and_then(|v| v.as_text()),
        Some("eu")
    );

    assert!(queue.get().unwrap().is_none());
}

#[test]
fn remote_topics_track_seen_ids() {
    let (manager, _tmp) = setup_manager();
    let (_rt, addr) = spawn_server(manager, None);

    let session = Session::connect(&addr, ClientOptions::default()).unwrap();
    let ticker = session.topic("remote.ticker");

    ticker.publish(body("M1"), Headers::new()).unwrap();
    assert_eq!(ticker.retrieve().unwrap().unwrap().body, body("M1"));
    assert!(ticker.retrieve().unwrap().is_none());

    ticker.publish(body("M2"), Headers::new()).unwrap();
    assert_eq!(ticker.retrieve().unwrap().unwrap().body, body("M2"));
}

#[test]
fn remote_transactions_commit_and_abort() {
    let (manager, _tmp) = setup_manager();
    let (_rt, addr) = spawn_server(manager.clone(), None);

    let session = Session::connect(&addr, ClientOptions::default()).unwrap();

    session
        .transaction(|tx| {
            tx.put("remote.orders", body("committed"), Headers::new())?;
            Ok(())
        })
        .unwrap();

    let result: reliq::Result<()> = session.transaction(|tx| {
        tx.put("remote.orders", body("discarded"), Headers::new())?;
        Err(Error::InvalidArgument("induced failure".into()))
    });
    assert!(result.is_err());

    let queue = session.queue("remote.orders");
    assert_eq!(queue.get().unwrap().unwrap().body, body("committed"));
    assert!(queue.get().unwrap().is_none());
}

#[test]
fn server_errors_travel_back_with_their_kind() {
    let (manager, _tmp) = setup_manager();
    let (_rt, addr) = spawn_server(manager, None);

    let session = Session::connect(&addr, ClientOptions::default()).unwrap();
    match session.queue("  ").put(body("x"), Headers::new()) {
        Err(Error::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {:?}", other.map(|_| ())),
    }

    match session.transaction(|tx| tx.get("remote.q")) {
        Ok(None) => {}
        other => panic!("empty queue should yield None, got {:?}", other),
    }
}

#[test]
fn denied_peers_cannot_issue_requests() {
    let (manager, _tmp) = setup_manager();
    let acl = Acl::parse("deny all").unwrap();
    let (_rt, addr) = spawn_server(manager, Some(acl));

    let options = ClientOptions {
        connect_count: 2,
        ..ClientOptions::default()
    };
    // The TCP handshake may succeed, but the server drops the
    // connection before serving a single frame.
    let outcome = Session::connect(&addr, options)
        .and_then(|session| session.queue("blocked").list());
    match outcome {
        Err(Error::RemoteUnavailable(_)) => {}
        other => panic!("expected RemoteUnavailable, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn connect_surfaces_remote_unavailable_after_retries() {
    // Nothing listens here.
    let options = ClientOptions {
        connect_count: 2,
        ..ClientOptions::default()
    };
    match Session::connect("127.0.0.1:1", options) {
        Err(Error::RemoteUnavailable(_)) => {}
        other => panic!("expected RemoteUnavailable, got {:?}", other.map(|_| ())),
    }
}
