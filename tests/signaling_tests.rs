// Signaling transport tests against the in-memory broker
mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{settle, setup_logging, wait_until, MemoryBroker, Recorder};
use peerchat::retry::RetryConfig;
use peerchat::signaling::{BrokerConnector, BrokerSession, SignalingMessage, SignalingTransport, TransportConfig};
use peerchat::ConnectionState;
use tokio::sync::mpsc;

fn transport(broker: &MemoryBroker, user_id: &str) -> SignalingTransport {
    SignalingTransport::new(user_id, broker.connector(), TransportConfig::default())
}

fn presence(from: &str, to: &str) -> SignalingMessage {
    SignalingMessage::ChatPresence { from: from.into(), to: to.into(), is_opened: true }
}

fn request(from: &str, to: &str, name: &str) -> SignalingMessage {
    SignalingMessage::ContactRequest { from: from.into(), to: to.into(), name: name.into() }
}

#[tokio::test(start_paused = true)]
async fn messages_reach_only_the_addressed_user() {
    setup_logging();
    let broker = MemoryBroker::new();
    let alice = transport(&broker, "ABC-123");
    let bob = transport(&broker, "XYZ-999");
    let carol = transport(&broker, "QRS-555");
    assert!(alice.connect().await);
    assert!(bob.connect().await);
    assert!(carol.connect().await);

    let at_bob = Recorder::new();
    let at_carol = Recorder::new();
    bob.messages().subscribe(at_bob.sink());
    carol.messages().subscribe(at_carol.sink());

    alice.send(request("ABC-123", "XYZ-999", "Alice"), "XYZ-999").await;
    assert!(wait_until(Duration::from_secs(1), || at_bob.len() == 1).await);
    settle().await;

    assert_eq!(at_bob.snapshot(), vec![request("ABC-123", "XYZ-999", "Alice")]);
    assert_eq!(at_carol.len(), 0);
    assert_eq!(broker.kinds_sent_to("p2p-chat/signaling/XYZ-999"), vec!["contactRequest"]);
    assert!(broker.opened_sessions().contains(&"peerchat_ABC-123".to_string()));
}

#[tokio::test(start_paused = true)]
async fn namespace_prefixes_every_topic() {
    setup_logging();
    let broker = MemoryBroker::new();
    let config = TransportConfig { namespace: "test-net".into(), ..TransportConfig::default() };
    let alice = SignalingTransport::new("ABC-123", broker.connector(), config.clone());
    let bob = SignalingTransport::new("XYZ-999", broker.connector(), config);
    assert!(alice.connect().await);
    assert!(bob.connect().await);
    let at_bob = Recorder::new();
    bob.messages().subscribe(at_bob.sink());

    alice.send(presence("ABC-123", "XYZ-999"), "XYZ-999").await;
    assert!(wait_until(Duration::from_secs(1), || at_bob.len() == 1).await);
    assert_eq!(broker.kinds_sent_to("test-net/XYZ-999"), vec!["chatPresence"]);
    assert!(broker.kinds_sent_to("p2p-chat/signaling/XYZ-999").is_empty());
}

#[tokio::test(start_paused = true)]
async fn queued_messages_are_delivered_on_reconnect() {
    setup_logging();
    let broker = MemoryBroker::new();
    let alice = transport(&broker, "ABC-123");
    let bob = transport(&broker, "XYZ-999");
    assert!(bob.connect().await);
    let at_bob = Recorder::new();
    bob.messages().subscribe(at_bob.sink());

    // Offline by choice: messages wait, nothing reconnects on its own
    alice.disconnect().await;
    alice.send(request("ABC-123", "XYZ-999", "Alice"), "XYZ-999").await;
    alice.send(presence("ABC-123", "XYZ-999"), "XYZ-999").await;
    assert_eq!(alice.pending_message_count(), 2);
    assert!(!alice.is_reconnecting());

    assert!(alice.connect().await);
    assert_eq!(alice.pending_message_count(), 0);
    assert!(wait_until(Duration::from_secs(1), || at_bob.len() == 2).await);
    assert_eq!(
        at_bob.snapshot(),
        vec![request("ABC-123", "XYZ-999", "Alice"), presence("ABC-123", "XYZ-999")]
    );
}

#[tokio::test(start_paused = true)]
async fn broker_outage_heals_and_flushes_the_queue() {
    setup_logging();
    let broker = MemoryBroker::new();
    let alice = transport(&broker, "ABC-123");
    let states = Recorder::new();
    alice.state_changes().subscribe(states.sink());
    assert!(alice.connect().await);

    broker.set_online(false);
    assert!(wait_until(Duration::from_secs(1), || alice.is_reconnecting()).await);
    alice.send(presence("ABC-123", "XYZ-999"), "XYZ-999").await;
    assert_eq!(alice.pending_message_count(), 1);

    broker.set_online(true);
    assert!(
        wait_until(Duration::from_secs(120), || alice.is_connected() && alice.pending_message_count() == 0).await
    );
    assert_eq!(broker.kinds_sent_to("p2p-chat/signaling/XYZ-999"), vec!["chatPresence"]);
    assert_eq!(alice.connection_state(), ConnectionState::Connected);
    assert!(!alice.is_reconnecting());

    let seen = states.snapshot();
    assert!(seen.contains(&ConnectionState::Reconnecting));
    assert_eq!(seen.last(), Some(&ConnectionState::Connected));
    assert_eq!(broker.opened_sessions().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn unreachable_broker_ends_in_failed() {
    setup_logging();
    let broker = MemoryBroker::offline();
    let config = TransportConfig {
        reconnect: RetryConfig { max_attempts: 3, ..RetryConfig::BROKER }.without_jitter(),
        ..TransportConfig::default()
    };
    let alice = SignalingTransport::new("ABC-123", broker.connector(), config);

    assert!(!alice.connect().await);
    assert_eq!(alice.connection_state(), ConnectionState::Disconnected);

    alice.send(presence("ABC-123", "XYZ-999"), "XYZ-999").await;
    assert_eq!(alice.connection_state(), ConnectionState::Reconnecting);
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(alice.connection_state(), ConnectionState::Failed);
    assert!(!alice.is_reconnecting());
    assert_eq!(alice.pending_message_count(), 1, "queued message is kept for a later connect");
    assert!(broker.opened_sessions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn malformed_payloads_are_dropped() {
    setup_logging();
    let broker = MemoryBroker::new();
    let bob = transport(&broker, "XYZ-999");
    assert!(bob.connect().await);
    let at_bob = Recorder::new();
    bob.messages().subscribe(at_bob.sink());

    // A raw client publishing straight onto bob's topic
    let connector: Arc<dyn BrokerConnector> = broker.connector();
    let (tx, _rx) = mpsc::unbounded_channel();
    let raw: Arc<dyn BrokerSession> = connector.open("raw-client", tx).await.unwrap();
    let topic = "p2p-chat/signaling/XYZ-999";
    raw.publish(topic, b"not json at all".to_vec()).await.unwrap();
    raw.publish(topic, br#"{"runtimeType":"wave","from":"ABC-123","to":"XYZ-999"}"#.to_vec())
        .await
        .unwrap();
    raw.publish(topic, presence("ABC-123", "XYZ-999").encode().unwrap()).await.unwrap();

    assert!(wait_until(Duration::from_secs(1), || at_bob.len() == 1).await);
    settle().await;
    assert_eq!(at_bob.snapshot(), vec![presence("ABC-123", "XYZ-999")]);
    assert!(bob.is_connected());
}
