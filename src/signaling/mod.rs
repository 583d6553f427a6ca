// Signaling: control messages relayed through a publish/subscribe broker.
//
// The broker itself sits behind `BrokerConnector`/`BrokerSession` so the
// transport logic (queueing, reconnection, addressing) does not depend on a
// particular client library.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod message;
pub mod mqtt;
pub mod transport;

pub use message::{IceCandidate, ProtocolError, SdpKind, SessionDescription, SignalingMessage};
pub use mqtt::MqttConnector;
pub use transport::{SignalingTransport, TransportConfig};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BrokerError {
    #[error("Broker unreachable: {0}")]
    Unreachable(String),
    #[error("Subscribe failed: {0}")]
    Subscribe(String),
    #[error("Publish failed: {0}")]
    Publish(String),
    #[error("Broker session closed")]
    Closed,
}

/// Events produced by a live broker session.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    Message { topic: String, payload: Vec<u8> },
    /// The session was lost. No further events follow.
    Closed,
}

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Open a new session. Inbound traffic and session loss are reported on `events`.
    async fn open(
        &self,
        client_id: &str,
        events: mpsc::UnboundedSender<BrokerEvent>,
    ) -> Result<Arc<dyn BrokerSession>, BrokerError>;
}

#[async_trait]
pub trait BrokerSession: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError>;
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError>;
    fn is_connected(&self) -> bool;
    async fn close(&self);
}
