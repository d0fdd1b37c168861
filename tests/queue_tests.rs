use std::thread;
use std::time::Duration;

use bytes::Bytes;
use reliq::broker::headers::{
    HeaderValue, Headers, H_DELIVERY, H_EXPIRES, H_MAX_DELIVERIES, H_PRIORITY,
};
use reliq::broker::selector::Selector;
use reliq::client::Session;
use reliq::error::Error;
use reliq::store::DLQ;

mod helpers;
use helpers::{headers, setup_manager, setup_sql_manager};

fn body(text: &str) -> Bytes {
    Bytes::copy_from_slice(text.as_bytes())
}

// =========================================================================================
// 1. ORDERING
// =========================================================================================

#[test]
fn priority_wins_over_insertion_order() {
    let (manager, _tmp) = setup_manager();

    manager
        .put("jobs", body("A"), headers(&[(H_PRIORITY, 1i64.into())]), None)
        .unwrap();
    manager
        .put("jobs", body("B"), headers(&[(H_PRIORITY, 3i64.into())]), None)
        .unwrap();
    manager
        .put("jobs", body("C"), headers(&[(H_PRIORITY, 2i64.into())]), None)
        .unwrap();

    let order: Vec<Bytes> = (0..3)
        .map(|_| manager.dequeue("jobs", &Selector::Any, None).unwrap().unwrap().body)
        .collect();
    assert_eq!(order, vec![body("B"), body("C"), body("A")]);
    assert!(manager.dequeue("jobs", &Selector::Any, None).unwrap().is_none());
}

#[test]
fn equal_priorities_dequeue_in_insertion_order() {
    let (manager, _tmp) = setup_manager();

    for text in ["first", "second", "third"] {
        manager
            .put("fifo", body(text), headers(&[(H_PRIORITY, 4i64.into())]), None)
            .unwrap();
    }

    assert_eq!(
        manager.dequeue("fifo", &Selector::Any, None).unwrap().unwrap().body,
        body("first")
    );
    assert_eq!(
        manager.dequeue("fifo", &Selector::Any, None).unwrap().unwrap().body,
        body("second")
    );
    assert_eq!(
        manager.dequeue("fifo", &Selector::Any, None).unwrap().unwrap().body,
        body("third")
    );
}

// =========================================================================================
// 2. EXPIRATION & DLQ ROUTING
// =========================================================================================

#[test]
fn expired_best_effort_messages_vanish() {
    let (manager, _tmp) = setup_manager();

    manager
        .put("mail", body("X"), headers(&[(H_EXPIRES, 1i64.into())]), None)
        .unwrap();
    thread::sleep(Duration::from_millis(2100));

    assert!(manager.dequeue("mail", &Selector::Any, None).unwrap().is_none());
    assert!(manager.dequeue(DLQ, &Selector::Any, None).unwrap().is_none());
}

#[test]
fn expired_repeated_messages_land_in_the_dlq() {
    let (manager, _tmp) = setup_manager();

    manager
        .put(
            "mail",
            body("X"),
            headers(&[
                (H_EXPIRES, 1i64.into()),
                (H_DELIVERY, HeaderValue::sym("repeated")),
            ]),
            None,
        )
        .unwrap();
    thread::sleep(Duration::from_millis(2100));

    assert!(manager.dequeue("mail", &Selector::Any, None).unwrap().is_none());
    let dead = manager.dequeue(DLQ, &Selector::Any, None).unwrap().unwrap();
    assert_eq!(dead.body, body("X"));
}

#[test]
fn list_routes_dead_messages_as_a_side_effect() {
    let (manager, _tmp) = setup_manager();

    manager
        .put(
            "batch",
            body("dead"),
            headers(&[
                (H_EXPIRES, 1i64.into()),
                (H_DELIVERY, HeaderValue::sym("repeated")),
            ]),
            None,
        )
        .unwrap();
    manager.put("batch", body("live"), Headers::new(), None).unwrap();
    thread::sleep(Duration::from_millis(2100));

    let visible = manager.list("batch").unwrap();
    assert_eq!(visible.len(), 1);

    // The expired entry was moved while we were only looking.
    let dead = manager.dequeue(DLQ, &Selector::Any, None).unwrap().unwrap();
    assert_eq!(dead.body, body("dead"));
}

// =========================================================================================
// 3. TRANSACTIONS
// =========================================================================================

#[test]
fn aborted_get_returns_the_message_with_a_retry_count() {
    let (manager, _tmp) = setup_manager();
    let session = Session::local(manager.clone());

    manager
        .put(
            "work",
            body("X"),
            headers(&[(H_DELIVERY, HeaderValue::sym("repeated"))]),
            None,
        )
        .unwrap();

    let result: reliq::Result<()> = session.transaction(|tx| {
        let taken = tx.get("work")?.expect("message should be available");
        assert_eq!(taken.body, body("X"));
        Err(Error::InvalidArgument("induced failure".into()))
    });
    assert!(result.is_err());

    let retried = manager.dequeue("work", &Selector::Any, None).unwrap().unwrap();
    assert_eq!(retried.body, body("X"));
    assert_eq!(retried.headers.redelivery(), 1);
}

#[test]
fn repeated_delivery_exhausts_into_the_dlq() {
    let (manager, _tmp) = setup_manager();
    let session = Session::local(manager.clone());

    manager
        .put(
            "work",
            body("X"),
            headers(&[
                (H_DELIVERY, HeaderValue::sym("repeated")),
                (H_MAX_DELIVERIES, 2i64.into()),
            ]),
            None,
        )
        .unwrap();

    for _ in 0..2 {
        let result: reliq::Result<()> = session.transaction(|tx| {
            assert!(tx.get("work")?.is_some());
            Err(Error::InvalidArgument("induced failure".into()))
        });
        assert!(result.is_err());
    }

    // Third attempt: the message is exhausted, so the origin queue is
    // empty and the DLQ holds it with the full retry count.
    assert!(manager.dequeue("work", &Selector::Any, None).unwrap().is_none());
    let dead = manager.dequeue(DLQ, &Selector::Any, None).unwrap().unwrap();
    assert_eq!(dead.body, body("X"));
    assert_eq!(dead.headers.redelivery(), 2);
}

#[test]
fn once_delivery_aborts_into_the_dlq_not_the_origin_queue() {
    let (manager, _tmp) = setup_manager();
    let session = Session::local(manager.clone());

    manager
        .put(
            "payments",
            body("X"),
            headers(&[(H_DELIVERY, HeaderValue::sym("once"))]),
            None,
        )
        .unwrap();

    let result: reliq::Result<()> = session.transaction(|tx| {
        assert!(tx.get("payments")?.is_some());
        Err(Error::InvalidArgument("induced failure".into()))
    });
    assert!(result.is_err());

    assert!(manager.dequeue("payments", &Selector::Any, None).unwrap().is_none());
    let dead = manager.dequeue(DLQ, &Selector::Any, None).unwrap().unwrap();
    assert_eq!(dead.body, body("X"));
}

#[test]
fn once_delivery_disappears_entirely_on_commit() {
    let (manager, _tmp) = setup_manager();
    let session = Session::local(manager.clone());

    manager
        .put(
            "payments",
            body("X"),
            headers(&[(H_DELIVERY, HeaderValue::sym("once"))]),
            None,
        )
        .unwrap();

    session
        .transaction(|tx| {
            assert!(tx.get("payments")?.is_some());
            Ok(())
        })
        .unwrap();

    assert!(manager.dequeue("payments", &Selector::Any, None).unwrap().is_none());
    assert!(manager.dequeue(DLQ, &Selector::Any, None).unwrap().is_none());
}

#[test]
fn staged_puts_are_invisible_until_commit() {
    let (manager, _tmp) = setup_manager();

    let tid = manager.begin(Duration::from_secs(30)).unwrap();
    manager.put("orders", body("pending"), Headers::new(), Some(&tid)).unwrap();

    assert!(manager.dequeue("orders", &Selector::Any, None).unwrap().is_none());
    assert!(manager.list("orders").unwrap().is_empty());

    manager.commit(&tid).unwrap();
    let committed = manager.dequeue("orders", &Selector::Any, None).unwrap().unwrap();
    assert_eq!(committed.body, body("pending"));
}

#[test]
fn closed_transactions_report_no_such_transaction() {
    let (manager, _tmp) = setup_manager();

    let tid = manager.begin(Duration::from_secs(30)).unwrap();
    manager.commit(&tid).unwrap();

    assert!(matches!(manager.commit(&tid), Err(Error::NoSuchTransaction(_))));
    assert!(matches!(manager.abort(&tid), Err(Error::NoSuchTransaction(_))));
    assert!(matches!(
        manager.put("q", body("x"), Headers::new(), Some(&tid)),
        Err(Error::NoSuchTransaction(_))
    ));
}

#[test]
fn the_reaper_aborts_transactions_past_their_deadline() {
    let (manager, _tmp) = setup_manager();

    manager.put("slow", body("X"), Headers::new(), None).unwrap();

    let tid = manager.begin(Duration::from_millis(300)).unwrap();
    assert!(manager.dequeue("slow", &Selector::Any, Some(&tid)).unwrap().is_some());

    // Reaper cadence in tests is 100ms; give it time to fire.
    thread::sleep(Duration::from_millis(1000));

    assert!(matches!(manager.commit(&tid), Err(Error::NoSuchTransaction(_))));
    let retried = manager.dequeue("slow", &Selector::Any, None).unwrap().unwrap();
    assert_eq!(retried.headers.redelivery(), 1);
}

// =========================================================================================
// 4. CONCURRENCY
// =========================================================================================

#[test]
fn concurrent_getters_never_share_a_message() {
    let (manager, _tmp) = setup_manager();

    manager.put("contended", body("only"), Headers::new(), None).unwrap();

    let mut workers = Vec::new();
    for _ in 0..2 {
        let manager = manager.clone();
        workers.push(thread::spawn(move || {
            let tid = manager.begin(Duration::from_secs(30)).unwrap();
            let won = manager
                .dequeue("contended", &Selector::Any, Some(&tid))
                .unwrap()
                .is_some();
            (tid, won)
        }));
    }
    let outcomes: Vec<(String, bool)> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    let winners: Vec<&(String, bool)> = outcomes.iter().filter(|(_, won)| *won).collect();
    assert_eq!(winners.len(), 1, "exactly one getter may hold the message");

    // After the winner aborts, the loser can pick it up.
    for (tid, _) in &outcomes {
        manager.abort(tid).unwrap();
    }
    let retried = manager.dequeue("contended", &Selector::Any, None).unwrap().unwrap();
    assert_eq!(retried.body, body("only"));
    assert_eq!(retried.headers.redelivery(), 1);
}

// =========================================================================================
// 5. SELECTORS & VALIDATION
// =========================================================================================

#[test]
fn equality_selectors_pick_matching_messages_only() {
    let (manager, _tmp) = setup_manager();

    manager
        .put("events", body("eu"), headers(&[("region", "eu".into())]), None)
        .unwrap();
    manager
        .put("events", body("us"), headers(&[("region", "us".into())]), None)
        .unwrap();

    let selector = Selector::matching([("region", "us")]);
    let picked = manager.dequeue("events", &selector, None).unwrap().unwrap();
    assert_eq!(picked.body, body("us"));

    // Nothing matches anymore; the eu message is untouched.
    assert!(manager.dequeue("events", &selector, None).unwrap().is_none());
    assert_eq!(manager.list("events").unwrap().len(), 1);
}

#[test]
fn client_side_predicates_resolve_to_an_id_selector() {
    let (manager, _tmp) = setup_manager();
    let session = Session::local(manager.clone());
    let queue = session.queue("metrics");

    queue.put(body("low"), headers(&[("score", 3i64.into())])).unwrap();
    queue.put(body("high"), headers(&[("score", 9i64.into())])).unwrap();

    let picked = queue
        .get_where(|h, _now| h.get("score").and_then(|v| v.as_int()).unwrap_or(0) > 5)
        .unwrap()
        .expect("a message should match");
    assert_eq!(picked.body, body("high"));
}

#[test]
fn invalid_arguments_are_rejected_without_side_effects() {
    let (manager, _tmp) = setup_manager();

    assert!(matches!(
        manager.put("", body("x"), Headers::new(), None),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        manager.put("q", body("x"), headers(&[("not a symbol", 1i64.into())]), None),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        manager.put("q", body("x"), headers(&[(H_EXPIRES, "soon".into())]), None),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        manager.put(
            "q",
            body("x"),
            headers(&[(H_DELIVERY, HeaderValue::sym("sometimes"))]),
            None
        ),
        Err(Error::InvalidArgument(_))
    ));

    assert!(manager.list("q").unwrap().is_empty());
}

#[test]
fn destination_names_are_lowercased() {
    let (manager, _tmp) = setup_manager();

    manager.put("Mixed.Case", body("x"), Headers::new(), None).unwrap();
    let picked = manager.dequeue("mixed.case", &Selector::Any, None).unwrap().unwrap();
    assert_eq!(picked.body, body("x"));
}

// =========================================================================================
// 6. SQL BACKEND PARITY
// =========================================================================================

#[test]
fn sql_backend_runs_the_same_transaction_flow() {
    let (manager, _tmp) = setup_sql_manager();
    let session = Session::local(manager.clone());

    manager
        .put(
            "work",
            body("X"),
            headers(&[(H_DELIVERY, HeaderValue::sym("repeated"))]),
            None,
        )
        .unwrap();

    let result: reliq::Result<()> = session.transaction(|tx| {
        assert!(tx.get("work")?.is_some());
        Err(Error::InvalidArgument("induced failure".into()))
    });
    assert!(result.is_err());

    let retried = manager.dequeue("work", &Selector::Any, None).unwrap().unwrap();
    assert_eq!(retried.headers.redelivery(), 1);
    assert_eq!(retried.body, body("X"));
}
