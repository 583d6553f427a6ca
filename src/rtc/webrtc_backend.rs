// webrtc-rs backend for the peer connection seam.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::{mpsc, Mutex as TokioMutex};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

use crate::signaling::{IceCandidate, SdpKind, SessionDescription};

use super::{
    IceConnectionState, PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent, RtcError,
    SignalingState, DATA_CHANNEL_LABEL, DEFAULT_STUN_SERVERS,
};

impl From<webrtc::Error> for RtcError {
    fn from(e: webrtc::Error) -> Self {
        RtcError::Backend(e.to_string())
    }
}

/// Builds webrtc-rs peer connections using STUN only.
#[derive(Debug, Clone)]
pub struct WebRtcFactory {
    stun_servers: Vec<String>,
}

impl WebRtcFactory {
    pub fn new(stun_servers: Vec<String>) -> Self {
        WebRtcFactory { stun_servers }
    }
}

impl Default for WebRtcFactory {
    fn default() -> Self {
        WebRtcFactory::new(DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect())
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcFactory {
    async fn create(&self, events: mpsc::UnboundedSender<PeerEvent>) -> Result<Arc<dyn PeerConnection>, RtcError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.stun_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);
        let connection = Arc::new(WebRtcConnection {
            pc,
            channel: Arc::new(TokioMutex::new(None)),
            events,
        });
        connection.install_handlers();
        Ok(connection)
    }
}

struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    channel: Arc<TokioMutex<Option<Arc<RTCDataChannel>>>>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl WebRtcConnection {
    fn install_handlers(&self) {
        let events = self.events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let _ = events.send(PeerEvent::ConnectionState(map_connection_state(s)));
                Box::pin(async {})
            }));

        let events = self.events.clone();
        self.pc
            .on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
                let _ = events.send(PeerEvent::IceConnectionState(map_ice_state(s)));
                Box::pin(async {})
            }));

        let events = self.events.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => warn!("Failed to serialize local ICE candidate: {}", e),
                }
            })
        }));

        // Answering side receives the channel from the offerer
        let events = self.events.clone();
        let channel = self.channel.clone();
        self.pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let events = events.clone();
            let channel = channel.clone();
            Box::pin(async move {
                if dc.label() != DATA_CHANNEL_LABEL {
                    debug!("Ignoring unexpected data channel '{}'", dc.label());
                    return;
                }
                wire_channel(&dc, &events);
                *channel.lock().await = Some(dc);
            })
        }));
    }
}

fn wire_channel(dc: &Arc<RTCDataChannel>, events: &mpsc::UnboundedSender<PeerEvent>) {
    let open_events = events.clone();
    dc.on_open(Box::new(move || {
        let _ = open_events.send(PeerEvent::DataChannelOpen);
        Box::pin(async {})
    }));

    let message_events = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        match String::from_utf8(msg.data.to_vec()) {
            Ok(text) => {
                let _ = message_events.send(PeerEvent::DataChannelMessage(text));
            }
            Err(_) => warn!("Dropping non-UTF-8 data channel message"),
        }
        Box::pin(async {})
    }));

    let close_events = events.clone();
    dc.on_close(Box::new(move || {
        let _ = close_events.send(PeerEvent::DataChannelClosed);
        Box::pin(async {})
    }));
}

#[async_trait]
impl PeerConnection for WebRtcConnection {
    async fn open_data_channel(&self, label: &str) -> Result<(), RtcError> {
        let mut channel = self.channel.lock().await;
        if channel.is_some() {
            return Ok(());
        }
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self.pc.create_data_channel(label, Some(init)).await?;
        wire_channel(&dc, &self.events);
        *channel = Some(dc);
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, RtcError> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self.pc.create_offer(Some(options)).await?;
        Ok(from_rtc(&offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, RtcError> {
        let answer = self.pc.create_answer(None).await?;
        Ok(from_rtc(&answer))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), RtcError> {
        self.pc.set_local_description(to_rtc(description)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), RtcError> {
        self.pc.set_remote_description(to_rtc(description)?).await?;
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<(), RtcError> {
        let channel = self.channel.lock().await;
        let dc = channel.as_ref().ok_or(RtcError::ChannelNotOpen)?;
        if dc.ready_state() != RTCDataChannelState::Open {
            return Err(RtcError::ChannelNotOpen);
        }
        dc.send_text(text.to_string()).await?;
        Ok(())
    }

    fn connection_state(&self) -> PeerConnectionState {
        map_connection_state(self.pc.connection_state())
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        map_ice_state(self.pc.ice_connection_state())
    }

    async fn close(&self) -> Result<(), RtcError> {
        if let Some(dc) = self.channel.lock().await.take() {
            if let Err(e) = dc.close().await {
                debug!("Error closing data channel: {}", e);
            }
        }
        self.pc.close().await?;
        Ok(())
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
        _ => PeerConnectionState::New,
    }
}

fn map_ice_state(state: RTCIceConnectionState) -> IceConnectionState {
    match state {
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => IceConnectionState::New,
    }
}

fn from_rtc(description: &RTCSessionDescription) -> SessionDescription {
    let kind = match description.sdp_type {
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        _ => SdpKind::Offer,
    };
    SessionDescription {
        kind,
        sdp: description.sdp.clone(),
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, RtcError> {
    let converted = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp)?,
        SdpKind::Pranswer => RTCSessionDescription::pranswer(description.sdp)?,
        // No constructor for rollback; the wire form deserializes directly
        SdpKind::Rollback => serde_json::from_value(serde_json::json!({"type": "rollback", "sdp": ""}))
            .map_err(|e| RtcError::Backend(e.to_string()))?,
    };
    Ok(converted)
}
