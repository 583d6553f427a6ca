// Direct peer connections: the backend seam, its states and events, and the
// negotiation engine built on top of it.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::signaling::{IceCandidate, SessionDescription};

pub mod negotiation;
pub mod webrtc_backend;

pub use negotiation::{NegotiationConfig, NegotiationEngine, NegotiationError};
pub use webrtc_backend::WebRtcFactory;

pub const DATA_CHANNEL_LABEL: &str = "chat";

pub const DEFAULT_STUN_SERVERS: [&str; 3] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PeerConnectionState::New => "new",
            PeerConnectionState::Connecting => "connecting",
            PeerConnectionState::Connected => "connected",
            PeerConnectionState::Disconnected => "disconnected",
            PeerConnectionState::Failed => "failed",
            PeerConnectionState::Closed => "closed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Everything a backend reports asynchronously about one connection.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    ConnectionState(PeerConnectionState),
    IceConnectionState(IceConnectionState),
    LocalCandidate(IceCandidate),
    DataChannelOpen,
    DataChannelMessage(String),
    DataChannelClosed,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RtcError {
    #[error("Peer connection is closed")]
    Closed,
    #[error("Data channel is not open")]
    ChannelNotOpen,
    #[error("Invalid signaling state: {0}")]
    InvalidState(String),
    #[error("{0}")]
    Backend(String),
}

impl RtcError {
    /// Errors caused by a connection whose signaling state no longer matches
    /// the description being applied (m-line order mismatch and the like).
    /// Rebuilding the connection and re-applying usually clears them.
    pub fn is_stale_state(&self) -> bool {
        match self {
            RtcError::InvalidState(_) => true,
            RtcError::Backend(message) => {
                let message = message.to_ascii_lowercase();
                message.contains("m-line") || message.contains("mline") || message.contains("signaling state")
            }
            _ => false,
        }
    }
}

/// One direct connection to a peer, with at most one data channel.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Create the outbound data channel if the connection has none yet.
    async fn open_data_channel(&self, label: &str) -> Result<(), RtcError>;
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, RtcError>;
    async fn create_answer(&self) -> Result<SessionDescription, RtcError>;
    async fn set_local_description(&self, description: SessionDescription) -> Result<(), RtcError>;
    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), RtcError>;
    async fn has_remote_description(&self) -> bool;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError>;
    async fn send_text(&self, text: &str) -> Result<(), RtcError>;
    fn connection_state(&self) -> PeerConnectionState;
    fn signaling_state(&self) -> SignalingState;
    fn ice_connection_state(&self) -> IceConnectionState;
    /// Close the data channel, then the connection.
    async fn close(&self) -> Result<(), RtcError>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self, events: mpsc::UnboundedSender<PeerEvent>) -> Result<Arc<dyn PeerConnection>, RtcError>;
}
