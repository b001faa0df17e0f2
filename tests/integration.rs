//! Integration Tests for HarborMQ
//!
//! These tests start a broker on an ephemeral port and drive it with raw MQTT
//! clients over TCP.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use harbormq::broker::{Broker, BrokerConfig, BrokerEvent};
use harbormq::codec::{Decoder, Encoder};
use harbormq::hooks::{ClientInfo, HookResult, Hooks};
use harbormq::protocol::{
    ConnAck, Connect, ConnectReturnCode, Packet, PubAck, PubComp, PubRec, PubRel, Publish, QoS,
    SubAck, Subscribe, Subscription, Will,
};
use harbormq::Origin;

fn test_config() -> BrokerConfig {
    BrokerConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        max_connections: 100,
        retry_interval: Duration::from_secs(30),
        ..Default::default()
    }
}

async fn start(config: BrokerConfig) -> (Broker, SocketAddr) {
    let broker = Broker::new(config);
    let addr = broker.start().await.expect("broker failed to start");
    (broker, addr)
}

/// Helper struct for MQTT client operations in tests
struct TestClient {
    stream: TcpStream,
    buf: BytesMut,
    encoder: Encoder,
    decoder: Decoder,
}

impl TestClient {
    async fn open(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("Failed to connect");
        Self {
            stream,
            buf: BytesMut::new(),
            encoder: Encoder::new(),
            decoder: Decoder::new(),
        }
    }

    /// Open a connection and complete the CONNECT exchange
    async fn connected(addr: SocketAddr, client_id: &str, clean_start: bool) -> (Self, ConnAck) {
        let mut client = Self::open(addr).await;
        let ack = client
            .mqtt_connect(Connect {
                client_id: client_id.to_string(),
                clean_start,
                keep_alive: 0,
                ..Default::default()
            })
            .await;
        assert_eq!(ack.return_code, ConnectReturnCode::Accepted);
        (client, ack)
    }

    async fn send(&mut self, packet: &Packet) {
        let mut buf = BytesMut::new();
        self.encoder
            .encode(packet, &mut buf)
            .expect("Failed to encode");
        self.stream.write_all(&buf).await.expect("Failed to write");
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("Failed to write");
    }

    /// Next packet, or `None` on timeout or close
    async fn recv_within(&mut self, wait: Duration) -> Option<Packet> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Ok(Some((packet, consumed))) = self.decoder.decode(&self.buf) {
                self.buf.advance(consumed);
                return Some(packet);
            }
            match tokio::time::timeout_at(deadline, self.stream.read_buf(&mut self.buf)).await {
                Ok(Ok(n)) if n > 0 => continue,
                _ => return None,
            }
        }
    }

    async fn recv(&mut self) -> Packet {
        self.recv_within(Duration::from_secs(5))
            .await
            .expect("expected a packet")
    }

    async fn recv_publish(&mut self) -> Publish {
        match self.recv().await {
            Packet::Publish(publish) => publish,
            other => panic!("Expected PUBLISH, got {:?}", other),
        }
    }

    /// True once the broker closed the connection
    async fn is_closed(&mut self) -> bool {
        let mut scratch = [0u8; 256];
        loop {
            match timeout(Duration::from_secs(5), self.stream.read(&mut scratch)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return true,
                Ok(Ok(_)) => continue,
                Err(_) => return false,
            }
        }
    }

    async fn mqtt_connect(&mut self, connect: Connect) -> ConnAck {
        self.send(&Packet::Connect(Box::new(connect))).await;
        match self.recv().await {
            Packet::ConnAck(ack) => ack,
            other => panic!("Expected CONNACK, got {:?}", other),
        }
    }

    async fn subscribe(&mut self, packet_id: u16, filter: &str, qos: QoS) -> SubAck {
        self.send(&Packet::Subscribe(Subscribe {
            packet_id,
            subscriptions: vec![Subscription {
                filter: filter.to_string(),
                qos,
            }],
        }))
        .await;
        match self.recv().await {
            Packet::SubAck(ack) => ack,
            other => panic!("Expected SUBACK, got {:?}", other),
        }
    }

    async fn publish(&mut self, topic: &str, payload: &'static [u8], qos: QoS, retain: bool) {
        let packet_id = (qos != QoS::AtMostOnce).then_some(1);
        self.send(&Packet::Publish(Publish {
            qos,
            retain,
            topic: Arc::from(topic),
            packet_id,
            payload: Bytes::from_static(payload),
            ..Default::default()
        }))
        .await;
        if qos == QoS::AtLeastOnce {
            assert_eq!(self.recv().await, Packet::PubAck(PubAck::new(1)));
        }
    }

    async fn disconnect(mut self) {
        self.send(&Packet::Disconnect).await;
        assert!(self.is_closed().await);
    }
}

#[tokio::test]
async fn test_durable_session_receives_queued_messages_in_order() {
    let (broker, addr) = start(test_config()).await;

    let (mut sub, ack) = TestClient::connected(addr, "durable-sub", false).await;
    assert!(!ack.session_present);
    sub.subscribe(1, "q/#", QoS::AtLeastOnce).await;
    sub.disconnect().await;

    let (mut publisher, _) = TestClient::connected(addr, "pub-queue", true).await;
    publisher.publish("q/1", b"hello", QoS::AtLeastOnce, false).await;
    publisher.publish("q/2", b"world", QoS::AtLeastOnce, false).await;
    publisher.publish("q/3", b"again", QoS::AtMostOnce, false).await;

    let (mut sub, ack) = TestClient::connected(addr, "durable-sub", false).await;
    assert!(ack.session_present);

    let mut payloads = Vec::new();
    for _ in 0..3 {
        let publish = sub.recv_publish().await;
        if let Some(id) = publish.packet_id {
            sub.send(&Packet::PubAck(PubAck::new(id))).await;
        }
        payloads.push(publish.payload);
    }
    assert_eq!(
        payloads,
        vec![
            Bytes::from_static(b"hello"),
            Bytes::from_static(b"world"),
            Bytes::from_static(b"again"),
        ]
    );

    broker.stop().await.unwrap();
}

#[tokio::test]
async fn test_clean_session_is_not_resumed() {
    let (broker, addr) = start(test_config()).await;

    let (mut first, _) = TestClient::connected(addr, "fresh", true).await;
    first.subscribe(1, "x", QoS::AtMostOnce).await;
    first.disconnect().await;

    let (_second, ack) = TestClient::connected(addr, "fresh", true).await;
    assert!(!ack.session_present);

    broker.stop().await.unwrap();
}

#[tokio::test]
async fn test_retained_message_delivered_on_subscribe_and_cleared() {
    let (broker, addr) = start(test_config()).await;

    let (mut publisher, _) = TestClient::connected(addr, "retain-pub", true).await;
    publisher
        .publish("sensor/temp", b"temp=20", QoS::AtLeastOnce, true)
        .await;

    let (mut sub, _) = TestClient::connected(addr, "retain-sub", true).await;
    let ack = sub.subscribe(1, "sensor/+", QoS::AtMostOnce).await;
    assert_eq!(ack.return_codes, vec![0]);

    let publish = sub.recv_publish().await;
    assert!(publish.retain);
    assert_eq!(&*publish.topic, "sensor/temp");
    assert_eq!(publish.qos, QoS::AtMostOnce);
    assert_eq!(publish.payload, Bytes::from_static(b"temp=20"));

    publisher
        .publish("sensor/temp", b"", QoS::AtMostOnce, true)
        .await;
    // Live delivery of the clearing publish carries retain=false
    let live = sub.recv_publish().await;
    assert!(!live.retain);
    assert!(live.payload.is_empty());

    let (mut late, _) = TestClient::connected(addr, "retain-late", true).await;
    late.subscribe(1, "sensor/+", QoS::AtMostOnce).await;
    assert_eq!(late.recv_within(Duration::from_millis(300)).await, None);
    assert_eq!(broker.retained_count(), 0);

    broker.stop().await.unwrap();
}

#[tokio::test]
async fn test_keep_alive_expiry_publishes_will_once() {
    let (broker, addr) = start(test_config()).await;

    let (mut watcher, _) = TestClient::connected(addr, "watcher", true).await;
    watcher.subscribe(1, "status/device", QoS::AtLeastOnce).await;

    let mut device = TestClient::open(addr).await;
    let ack = device
        .mqtt_connect(Connect {
            client_id: "device".to_string(),
            keep_alive: 1,
            will: Some(Will {
                topic: "status/device".to_string(),
                payload: Bytes::from_static(b"offline"),
                qos: QoS::AtLeastOnce,
                retain: false,
            }),
            ..Default::default()
        })
        .await;
    assert_eq!(ack.return_code, ConnectReturnCode::Accepted);

    let started = Instant::now();
    assert!(device.is_closed().await);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(1400), "closed after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(3), "closed after {:?}", elapsed);

    let will = watcher.recv_publish().await;
    assert_eq!(&*will.topic, "status/device");
    assert_eq!(will.payload, Bytes::from_static(b"offline"));
    if let Some(id) = will.packet_id {
        watcher.send(&Packet::PubAck(PubAck::new(id))).await;
    }
    assert_eq!(watcher.recv_within(Duration::from_millis(300)).await, None);

    broker.stop().await.unwrap();
}

#[tokio::test]
async fn test_pingreq_keeps_connection_alive() {
    let (broker, addr) = start(test_config()).await;

    let mut client = TestClient::open(addr).await;
    client
        .mqtt_connect(Connect {
            client_id: "pinger".to_string(),
            keep_alive: 1,
            ..Default::default()
        })
        .await;

    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(700)).await;
        client.send(&Packet::PingReq).await;
        assert_eq!(client.recv().await, Packet::PingResp);
    }

    client.disconnect().await;
    broker.stop().await.unwrap();
}

#[tokio::test]
async fn test_graceful_disconnect_discards_will() {
    let (broker, addr) = start(test_config()).await;

    let (mut watcher, _) = TestClient::connected(addr, "watcher-2", true).await;
    watcher.subscribe(1, "last/words", QoS::AtMostOnce).await;

    let mut client = TestClient::open(addr).await;
    client
        .mqtt_connect(Connect {
            client_id: "polite".to_string(),
            will: Some(Will {
                topic: "last/words".to_string(),
                payload: Bytes::from_static(b"bye"),
                qos: QoS::AtMostOnce,
                retain: false,
            }),
            ..Default::default()
        })
        .await;
    client.disconnect().await;

    assert_eq!(watcher.recv_within(Duration::from_millis(300)).await, None);
    broker.stop().await.unwrap();
}

#[tokio::test]
async fn test_qos2_inbound_exactly_once_across_reconnect() {
    let (broker, addr) = start(test_config()).await;

    let (mut sub, _) = TestClient::connected(addr, "qos2-sub", true).await;
    sub.subscribe(1, "exact/once", QoS::AtMostOnce).await;

    let (mut publisher, _) = TestClient::connected(addr, "qos2-pub", false).await;
    let publish = Publish {
        qos: QoS::ExactlyOnce,
        topic: Arc::from("exact/once"),
        packet_id: Some(5),
        payload: Bytes::from_static(b"one"),
        ..Default::default()
    };
    publisher.send(&Packet::Publish(publish.clone())).await;
    assert_eq!(publisher.recv().await, Packet::PubRec(PubRec::new(5)));
    // Drop the connection before PUBREL
    drop(publisher);

    assert_eq!(sub.recv_publish().await.payload, Bytes::from_static(b"one"));

    let (mut publisher, ack) = TestClient::connected(addr, "qos2-pub", false).await;
    assert!(ack.session_present);
    publisher
        .send(&Packet::Publish(Publish { dup: true, ..publish }))
        .await;
    assert_eq!(publisher.recv().await, Packet::PubRec(PubRec::new(5)));
    publisher.send(&Packet::PubRel(PubRel::new(5))).await;
    assert_eq!(publisher.recv().await, Packet::PubComp(PubComp::new(5)));

    assert_eq!(sub.recv_within(Duration::from_millis(300)).await, None);
    broker.stop().await.unwrap();
}

#[tokio::test]
async fn test_qos2_outbound_flow() {
    let (broker, addr) = start(test_config()).await;

    let (mut sub, _) = TestClient::connected(addr, "qos2-out", true).await;
    sub.subscribe(1, "q2", QoS::ExactlyOnce).await;
    broker
        .inject("q2", Bytes::from_static(b"x"), QoS::ExactlyOnce, false)
        .unwrap();

    let publish = sub.recv_publish().await;
    assert_eq!(publish.qos, QoS::ExactlyOnce);
    let id = publish.packet_id.expect("QoS 2 delivery carries a packet id");
    sub.send(&Packet::PubRec(PubRec::new(id))).await;
    assert_eq!(sub.recv().await, Packet::PubRel(PubRel::new(id)));
    sub.send(&Packet::PubComp(PubComp::new(id))).await;
    assert_eq!(sub.recv_within(Duration::from_millis(300)).await, None);

    broker.stop().await.unwrap();
}

#[tokio::test]
async fn test_unacknowledged_qos1_redelivered_with_dup_on_reconnect() {
    let (broker, addr) = start(test_config()).await;

    let (mut sub, _) = TestClient::connected(addr, "redeliver", false).await;
    sub.subscribe(1, "jobs", QoS::AtLeastOnce).await;
    broker
        .inject("jobs", Bytes::from_static(b"job-1"), QoS::AtLeastOnce, false)
        .unwrap();

    let first = sub.recv_publish().await;
    assert!(!first.dup);
    let id = first.packet_id.expect("QoS 1 delivery carries a packet id");
    drop(sub);

    // Allow the broker to notice the dropped connection
    tokio::time::sleep(Duration::from_millis(100)).await;
    let (mut sub, ack) = TestClient::connected(addr, "redeliver", false).await;
    assert!(ack.session_present);

    let again = sub.recv_publish().await;
    assert!(again.dup);
    assert_eq!(again.packet_id, Some(id));
    assert_eq!(again.payload, Bytes::from_static(b"job-1"));
    sub.send(&Packet::PubAck(PubAck::new(id))).await;

    sub.disconnect().await;
    broker.stop().await.unwrap();
}

#[tokio::test]
async fn test_session_takeover_closes_previous_connection() {
    let (broker, addr) = start(test_config()).await;

    let (mut old, _) = TestClient::connected(addr, "roaming", false).await;
    old.subscribe(1, "roam/#", QoS::AtMostOnce).await;

    let (mut new, ack) = TestClient::connected(addr, "roaming", false).await;
    assert!(ack.session_present);
    assert!(old.is_closed().await);
    assert_eq!(broker.connection_count(), 1);

    broker
        .inject("roam/1", Bytes::from_static(b"here"), QoS::AtMostOnce, false)
        .unwrap();
    assert_eq!(new.recv_publish().await.payload, Bytes::from_static(b"here"));

    broker.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_closes_connected_clients() {
    let (broker, addr) = start(test_config()).await;

    let (mut a, _) = TestClient::connected(addr, "a", true).await;
    let (mut b, _) = TestClient::connected(addr, "b", false).await;

    timeout(Duration::from_secs(5), broker.stop())
        .await
        .expect("stop did not drain connections")
        .unwrap();
    assert!(a.is_closed().await);
    assert!(b.is_closed().await);
    assert_eq!(broker.connection_count(), 0);
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_bridge_inject_and_outbound_callback() {
    let (broker, addr) = start(test_config()).await;

    let relayed = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = relayed.clone();
    broker
        .register_outbound("device/#", move |message| {
            sink.lock()
                .push((message.topic.to_string(), message.origin.clone()));
        })
        .unwrap();

    let (mut sub, _) = TestClient::connected(addr, "bridge-sub", true).await;
    sub.subscribe(1, "device/+/cmd", QoS::AtMostOnce).await;

    let accepted = broker
        .inject("device/7/cmd", Bytes::from_static(b"on"), QoS::AtMostOnce, false)
        .unwrap();
    assert_eq!(accepted, 1);
    assert_eq!(sub.recv_publish().await.payload, Bytes::from_static(b"on"));

    let (mut publisher, _) = TestClient::connected(addr, "bridge-pub", true).await;
    publisher
        .publish("device/7/state", b"ready", QoS::AtLeastOnce, false)
        .await;

    let relayed = relayed.lock().clone();
    assert_eq!(
        relayed,
        vec![
            ("device/7/cmd".to_string(), Origin::Bridge),
            (
                "device/7/state".to_string(),
                Origin::Client(Arc::from("bridge-pub"))
            ),
        ]
    );

    broker.stop().await.unwrap();
}

#[tokio::test]
async fn test_unsupported_protocol_level_refused() {
    let (broker, addr) = start(test_config()).await;

    let mut client = TestClient::open(addr).await;
    #[rustfmt::skip]
    let connect_v5: [u8; 15] = [
        0x10, 13,
        0x00, 0x04, b'M', b'Q', b'T', b'T',
        0x05,
        0x02,
        0x00, 0x3C,
        0x00, 0x01, b'a',
    ];
    client.send_raw(&connect_v5).await;
    assert_eq!(
        client.recv().await,
        Packet::ConnAck(ConnAck::refused(
            ConnectReturnCode::UnacceptableProtocolVersion
        ))
    );
    assert!(client.is_closed().await);

    broker.stop().await.unwrap();
}

#[tokio::test]
async fn test_empty_client_id_with_durable_session_rejected() {
    let (broker, addr) = start(test_config()).await;

    let mut client = TestClient::open(addr).await;
    let ack = client
        .mqtt_connect(Connect {
            clean_start: false,
            ..Default::default()
        })
        .await;
    assert_eq!(ack.return_code, ConnectReturnCode::IdentifierRejected);
    assert!(client.is_closed().await);

    broker.stop().await.unwrap();
}

struct PasswordCheck {
    attempts: AtomicUsize,
}

#[async_trait]
impl Hooks for PasswordCheck {
    async fn authenticate(
        &self,
        client: ClientInfo<'_>,
        password: Option<&[u8]>,
    ) -> HookResult<bool> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Ok(client.username == Some("admin") && password == Some(b"secret".as_slice()))
    }
}

#[tokio::test]
async fn test_bad_credentials_refused() {
    let hooks = Arc::new(PasswordCheck {
        attempts: AtomicUsize::new(0),
    });
    let broker = Broker::with_hooks(test_config(), hooks.clone());
    let addr = broker.start().await.unwrap();

    let mut client = TestClient::open(addr).await;
    let ack = client
        .mqtt_connect(Connect {
            client_id: "intruder".to_string(),
            username: Some("admin".to_string()),
            password: Some(Bytes::from_static(b"guess")),
            ..Default::default()
        })
        .await;
    assert_eq!(ack.return_code, ConnectReturnCode::BadUsernameOrPassword);
    assert!(client.is_closed().await);

    let mut client = TestClient::open(addr).await;
    let ack = client
        .mqtt_connect(Connect {
            client_id: "operator".to_string(),
            username: Some("admin".to_string()),
            password: Some(Bytes::from_static(b"secret")),
            ..Default::default()
        })
        .await;
    assert_eq!(ack.return_code, ConnectReturnCode::Accepted);
    assert_eq!(hooks.attempts.load(Ordering::SeqCst), 2);

    client.disconnect().await;
    broker.stop().await.unwrap();
}

#[tokio::test]
async fn test_invalid_subscription_filter_gets_failure_code() {
    let (broker, addr) = start(test_config()).await;

    let (mut client, _) = TestClient::connected(addr, "filters", true).await;
    client
        .send(&Packet::Subscribe(Subscribe {
            packet_id: 3,
            subscriptions: vec![
                Subscription {
                    filter: "good/+".to_string(),
                    qos: QoS::ExactlyOnce,
                },
                Subscription {
                    filter: "bad/#/more".to_string(),
                    qos: QoS::AtMostOnce,
                },
            ],
        }))
        .await;
    assert_eq!(
        client.recv().await,
        Packet::SubAck(SubAck {
            packet_id: 3,
            return_codes: vec![2, 0x80],
        })
    );

    broker.stop().await.unwrap();
}

#[tokio::test]
async fn test_saturated_outlet_releases_queued_messages() {
    let (broker, addr) = start(BrokerConfig {
        outbound_channel_capacity: 1,
        ..test_config()
    })
    .await;

    let (mut sub, _) = TestClient::connected(addr, "narrow", true).await;
    sub.subscribe(1, "t", QoS::AtLeastOnce).await;

    // The second message finds the one-slot channel occupied and waits
    broker
        .inject("t", Bytes::from_static(b"zero"), QoS::AtMostOnce, false)
        .unwrap();
    broker
        .inject("t", Bytes::from_static(b"one"), QoS::AtLeastOnce, false)
        .unwrap();

    let zero = sub.recv_publish().await;
    assert_eq!(zero.payload, Bytes::from_static(b"zero"));

    let one = sub.recv_publish().await;
    assert_eq!(one.payload, Bytes::from_static(b"one"));
    let id = one.packet_id.expect("QoS 1 delivery carries a packet id");
    sub.send(&Packet::PubAck(PubAck::new(id))).await;

    broker
        .inject("t", Bytes::from_static(b"later"), QoS::AtMostOnce, false)
        .unwrap();
    let later = sub.recv_publish().await;
    assert_eq!(later.payload, Bytes::from_static(b"later"));

    broker.stop().await.unwrap();
}

#[tokio::test]
async fn test_unacknowledged_qos1_retried_then_abandoned() {
    let (broker, addr) = start(BrokerConfig {
        retry_interval: Duration::from_millis(200),
        max_retries: 2,
        ..test_config()
    })
    .await;
    let mut events = broker.subscribe_events();

    let (mut sub, _) = TestClient::connected(addr, "silent", true).await;
    sub.subscribe(1, "jobs", QoS::AtLeastOnce).await;
    broker
        .inject("jobs", Bytes::from_static(b"job"), QoS::AtLeastOnce, false)
        .unwrap();

    let first = sub.recv_publish().await;
    assert!(!first.dup);
    let id = first.packet_id.expect("QoS 1 delivery carries a packet id");

    // Resends arrive within a fraction of the interval past their due time
    for _ in 0..2 {
        let sent_at = Instant::now();
        let again = sub.recv_publish().await;
        assert!(again.dup);
        assert_eq!(again.packet_id, Some(id));
        assert_eq!(again.payload, Bytes::from_static(b"job"));
        assert!(sent_at.elapsed() < Duration::from_millis(400));
    }

    let failed = timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(BrokerEvent::DeliveryFailed {
                    client_id,
                    packet_id,
                    topic,
                }) => return (client_id, packet_id, topic),
                Ok(_) => continue,
                Err(e) => panic!("event stream ended: {:?}", e),
            }
        }
    })
    .await
    .expect("expected a DeliveryFailed event");
    assert_eq!(failed, (Arc::from("silent"), id, Some(Arc::from("jobs"))));

    // No further resends, and the session keeps working
    assert_eq!(sub.recv_within(Duration::from_millis(400)).await, None);
    broker
        .inject("jobs", Bytes::from_static(b"next"), QoS::AtLeastOnce, false)
        .unwrap();
    let next = sub.recv_publish().await;
    assert_eq!(next.payload, Bytes::from_static(b"next"));
    assert!(!next.dup);
    let next_id = next.packet_id.expect("QoS 1 delivery carries a packet id");
    sub.send(&Packet::PubAck(PubAck::new(next_id))).await;
    assert_eq!(sub.recv_within(Duration::from_millis(300)).await, None);

    broker.stop().await.unwrap();
}

#[tokio::test]
async fn test_qos2_pubrel_resent_after_reconnect() {
    let (broker, addr) = start(test_config()).await;

    let (mut sub, _) = TestClient::connected(addr, "q2-resume", false).await;
    sub.subscribe(1, "q2", QoS::ExactlyOnce).await;
    broker
        .inject("q2", Bytes::from_static(b"x"), QoS::ExactlyOnce, false)
        .unwrap();

    let publish = sub.recv_publish().await;
    let id = publish.packet_id.expect("QoS 2 delivery carries a packet id");
    sub.send(&Packet::PubRec(PubRec::new(id))).await;
    assert_eq!(sub.recv().await, Packet::PubRel(PubRel::new(id)));
    drop(sub);

    // Allow the broker to notice the dropped connection
    tokio::time::sleep(Duration::from_millis(100)).await;
    let (mut sub, ack) = TestClient::connected(addr, "q2-resume", false).await;
    assert!(ack.session_present);

    // The message was received, so only the release step is repeated
    assert_eq!(sub.recv().await, Packet::PubRel(PubRel::new(id)));
    sub.send(&Packet::PubComp(PubComp::new(id))).await;
    assert_eq!(sub.recv_within(Duration::from_millis(300)).await, None);

    sub.disconnect().await;
    broker.stop().await.unwrap();
}
