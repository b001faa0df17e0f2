use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use pretty_assertions::assert_eq;
use tokio::sync::{mpsc, Notify};

use super::*;
use crate::protocol::{Packet, Publish, QoS};

fn publish(topic: &str, qos: QoS, payload: &'static str) -> Publish {
    Publish {
        qos,
        topic: Arc::from(topic),
        payload: Bytes::from_static(payload.as_bytes()),
        ..Default::default()
    }
}

fn outlet(conn_id: u64, capacity: usize) -> (Outlet, mpsc::Receiver<Packet>) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        Outlet {
            conn_id,
            tx,
            kick: Arc::new(Notify::new()),
        },
        rx,
    )
}

fn payloads(messages: &[Publish]) -> Vec<&[u8]> {
    messages.iter().map(|p| p.payload.as_ref()).collect()
}

#[test]
fn test_create_and_resume() {
    let store = SessionStore::default();

    let (_, resumed) = store.create_or_resume_session("a", false);
    assert!(!resumed);

    let (_, resumed) = store.create_or_resume_session("a", false);
    assert!(resumed);

    // Clean start discards prior state
    store.add_subscription("a", "x/y", QoS::AtLeastOnce).unwrap();
    let (session, resumed) = store.create_or_resume_session("a", true);
    assert!(!resumed);
    assert!(session.read().subscriptions.is_empty());
    assert!(store.find_subscribers("x/y").is_empty());
}

#[test]
fn test_clean_session_is_not_resumed() {
    let store = SessionStore::default();
    store.create_or_resume_session("a", true);
    let (_, resumed) = store.create_or_resume_session("a", false);
    assert!(!resumed);
}

#[test]
fn test_destroy_session_removes_subscriptions() {
    let store = SessionStore::default();
    store.create_or_resume_session("a", false);
    store.add_subscription("a", "x/#", QoS::AtMostOnce).unwrap();

    assert!(store.destroy_session("a").is_some());
    assert!(store.get("a").is_none());
    assert!(store.find_subscribers("x/y").is_empty());
    assert!(store.destroy_session("a").is_none());
}

#[test]
fn test_subscription_replaces_qos() {
    let store = SessionStore::default();
    store.create_or_resume_session("a", true);

    assert!(!store.add_subscription("a", "x/y", QoS::AtMostOnce).unwrap());
    assert!(store.add_subscription("a", "x/y", QoS::ExactlyOnce).unwrap());

    let session = store.get("a").unwrap();
    assert_eq!(session.read().subscriptions.len(), 1);
    assert_eq!(
        store.find_subscribers("x/y"),
        vec![(Arc::from("a"), QoS::ExactlyOnce)]
    );
}

#[test]
fn test_remove_subscription() {
    let store = SessionStore::default();
    store.create_or_resume_session("a", true);
    store.add_subscription("a", "x/+", QoS::AtLeastOnce).unwrap();

    assert!(store.remove_subscription("a", "x/+").unwrap());
    assert!(!store.remove_subscription("a", "x/+").unwrap());
    assert!(store.find_subscribers("x/y").is_empty());
}

#[test]
fn test_owned_subscription_ignored_after_takeover() {
    let store = SessionStore::default();
    let (old, _) = store.create_or_resume_session("a", true);
    let (out, _rx1) = outlet(1, 4);
    old.write().attach(out);

    // A clean takeover detaches the old connection, then replaces the session
    assert!(old.write().detach(1, Instant::now()));
    let (current, resumed) = store.create_or_resume_session("a", true);
    assert!(!resumed);
    let (out, _rx2) = outlet(2, 4);
    current.write().attach(out);

    assert_eq!(store.add_owned_subscription(&old, 1, "x/y", QoS::AtLeastOnce), None);
    assert!(store.find_subscribers("x/y").is_empty());
    assert!(current.read().subscriptions.is_empty());

    assert_eq!(
        store.add_owned_subscription(&current, 2, "x/y", QoS::AtLeastOnce),
        Some(false)
    );
    assert_eq!(store.remove_owned_subscription(&old, 1, "x/y"), None);
    assert_eq!(
        store.find_subscribers("x/y"),
        vec![(Arc::from("a"), QoS::AtLeastOnce)]
    );
    assert_eq!(store.remove_owned_subscription(&current, 2, "x/y"), Some(true));
    assert!(store.find_subscribers("x/y").is_empty());
}

#[test]
fn test_unknown_client_errors() {
    let store = SessionStore::default();
    assert_eq!(
        store.add_subscription("ghost", "a", QoS::AtMostOnce),
        Err(SessionError::NotFound(Arc::from("ghost")))
    );
    assert!(store.drain_queue("ghost").is_err());
}

#[test]
fn test_find_subscribers_dedups_to_highest_qos() {
    let store = SessionStore::default();
    store.create_or_resume_session("a", true);
    store.create_or_resume_session("b", true);
    store.add_subscription("a", "sport/#", QoS::AtMostOnce).unwrap();
    store.add_subscription("a", "sport/+/score", QoS::ExactlyOnce).unwrap();
    store.add_subscription("b", "sport/tennis/score", QoS::AtLeastOnce).unwrap();
    store.add_subscription("b", "other", QoS::ExactlyOnce).unwrap();

    assert_eq!(
        store.find_subscribers("sport/tennis/score"),
        vec![
            (Arc::from("a"), QoS::ExactlyOnce),
            (Arc::from("b"), QoS::AtLeastOnce),
        ]
    );
    assert_eq!(
        store.find_subscribers("sport"),
        vec![(Arc::from("a"), QoS::AtMostOnce)]
    );
}

#[test]
fn test_offline_queue_order_and_bound() {
    let store = SessionStore::new(SessionLimits {
        max_queued_messages: 2,
        max_inflight: 32,
    });
    store.create_or_resume_session("a", false);

    assert!(store
        .enqueue_for_offline("a", publish("t", QoS::AtLeastOnce, "1"))
        .unwrap()
        .is_none());
    store
        .enqueue_for_offline("a", publish("t", QoS::AtLeastOnce, "2"))
        .unwrap();
    let dropped = store
        .enqueue_for_offline("a", publish("t", QoS::AtLeastOnce, "3"))
        .unwrap();
    assert_eq!(dropped.unwrap().payload, Bytes::from_static(b"1"));

    let drained = store.drain_queue("a").unwrap();
    assert_eq!(payloads(&drained), vec![b"2".as_ref(), b"3".as_ref()]);
    assert!(store.drain_queue("a").unwrap().is_empty());
}

#[test]
fn test_deliver_offline_durable_queues() {
    let mut session = Session::new(Arc::from("a"), false, SessionLimits::default());
    let outcome = session
        .deliver(publish("t", QoS::AtLeastOnce, "hello"), Instant::now())
        .unwrap();
    assert!(matches!(outcome, DeliveryOutcome::Queued));
    assert_eq!(session.queue_len(), 1);
}

#[test]
fn test_deliver_offline_clean_drops() {
    let mut session = Session::new(Arc::from("a"), true, SessionLimits::default());
    let outcome = session
        .deliver(publish("t", QoS::AtLeastOnce, "hello"), Instant::now())
        .unwrap();
    assert!(matches!(outcome, DeliveryOutcome::Dropped));
    assert_eq!(session.queue_len(), 0);
}

#[test]
fn test_deliver_online_tracks_inflight() {
    let mut session = Session::new(Arc::from("a"), true, SessionLimits::default());
    let (out, mut rx) = outlet(1, 8);
    session.attach(out);

    let outcome = session
        .deliver(publish("t", QoS::AtLeastOnce, "hello"), Instant::now())
        .unwrap();
    assert!(matches!(outcome, DeliveryOutcome::Sent));
    assert_eq!(session.inflight.outbound_len(), 1);

    match rx.try_recv().unwrap() {
        Packet::Publish(p) => assert!(p.packet_id.is_some()),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_queued_messages_go_before_new_ones() {
    let mut session = Session::new(Arc::from("a"), false, SessionLimits::default());
    let now = Instant::now();
    session
        .deliver(publish("x/y", QoS::AtLeastOnce, "hello"), now)
        .unwrap();

    let (out, mut rx) = outlet(1, 8);
    session.attach(out);
    // Not yet released, a new message must wait behind the queue
    let outcome = session
        .deliver(publish("x/y", QoS::AtLeastOnce, "later"), now)
        .unwrap();
    assert!(matches!(outcome, DeliveryOutcome::Queued));

    assert_eq!(session.release_queued(now).unwrap(), 2);
    let mut received = Vec::new();
    while let Ok(Packet::Publish(p)) = rx.try_recv() {
        received.push(p);
    }
    assert_eq!(payloads(&received), vec![b"hello".as_ref(), b"later".as_ref()]);
}

#[test]
fn test_release_stops_at_window() {
    let mut session = Session::new(
        Arc::from("a"),
        false,
        SessionLimits {
            max_queued_messages: 0,
            max_inflight: 1,
        },
    );
    let now = Instant::now();
    for payload in ["1", "2", "3"] {
        session
            .deliver(publish("t", QoS::AtLeastOnce, payload), now)
            .unwrap();
    }

    let (out, _rx) = outlet(1, 8);
    session.attach(out);
    assert_eq!(session.release_queued(now).unwrap(), 1);
    assert_eq!(session.queue_len(), 2);
}

#[test]
fn test_detach_only_by_owner() {
    let mut session = Session::new(Arc::from("a"), false, SessionLimits::default());
    let (first, _rx1) = outlet(1, 1);
    let (second, _rx2) = outlet(2, 1);
    session.attach(first);
    session.attach(second);

    let now = Instant::now();
    assert!(!session.detach(1, now));
    assert!(session.is_online());
    assert!(session.detach(2, now));
    assert!(!session.is_online());
    assert_eq!(session.disconnected_at, Some(now));
}

#[test]
fn test_expire_sessions() {
    let store = SessionStore::default();
    let (offline, _) = store.create_or_resume_session("offline", false);
    let (online, _) = store.create_or_resume_session("online", false);

    let start = Instant::now();
    offline.write().disconnected_at = Some(start);
    let (out, _rx) = outlet(1, 1);
    online.write().attach(out);

    let expiry = Duration::from_secs(60);
    assert!(store
        .expire_sessions(start + Duration::from_secs(30), expiry)
        .is_empty());

    let expired = store.expire_sessions(start + expiry, expiry);
    assert_eq!(expired, vec![Arc::<str>::from("offline")]);
    assert!(store.get("offline").is_none());
    assert!(store.get("online").is_some());
}

#[test]
fn test_destroy_if_current_ignores_replaced_session() {
    let store = SessionStore::default();
    let (old, _) = store.create_or_resume_session("a", true);
    let (new, _) = store.create_or_resume_session("a", true);

    assert!(!store.destroy_if_current(&old));
    assert!(store.get("a").is_some());
    assert!(store.destroy_if_current(&new));
    assert!(store.get("a").is_none());
}

#[test]
fn test_full_outlet_sheds_qos0_and_queues_qos1() {
    let mut session = Session::new(Arc::from("a"), false, SessionLimits::default());
    let (out, mut rx) = outlet(1, 1);
    session.attach(out);
    let now = Instant::now();

    let first = session.deliver(publish("t", QoS::AtMostOnce, "1"), now).unwrap();
    assert!(matches!(first, DeliveryOutcome::Sent));

    let shed = session.deliver(publish("t", QoS::AtMostOnce, "2"), now).unwrap();
    assert!(matches!(shed, DeliveryOutcome::Dropped));

    let waiting = session.deliver(publish("t", QoS::AtLeastOnce, "3"), now).unwrap();
    assert!(matches!(waiting, DeliveryOutcome::Queued));
    assert_eq!(session.queue_len(), 1);

    // Draining the channel makes room for the queued message
    assert!(matches!(rx.try_recv(), Ok(Packet::Publish(p)) if p.payload == Bytes::from_static(b"1")));
    assert_eq!(session.release_queued(now).unwrap(), 1);
    assert_eq!(session.queue_len(), 0);
    match rx.try_recv() {
        Ok(Packet::Publish(p)) => {
            assert_eq!(p.payload, Bytes::from_static(b"3"));
            assert_eq!(p.qos, QoS::AtLeastOnce);
            assert!(p.packet_id.is_some());
        }
        other => panic!("expected queued publish, got {:?}", other),
    }
}
