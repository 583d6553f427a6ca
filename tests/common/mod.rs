// Common test utilities for integration tests
// In-memory broker and WebRTC fakes, plus helpers to wait on async state.
#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once, Weak};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, LevelFilter};
use tokio::sync::mpsc;

use peerchat::rtc::{
    IceConnectionState, PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent, RtcError,
    SignalingState,
};
use peerchat::signaling::{
    BrokerConnector, BrokerError, BrokerEvent, BrokerSession, IceCandidate, SdpKind, SessionDescription,
    SignalingMessage,
};

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .init();
    });
}

/// Poll `condition` every 10ms of (virtual) time until it holds or `limit` passes.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Let spawned tasks run without advancing much time.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Shared, clonable event log for collecting observer output.
#[derive(Clone)]
pub struct Recorder<T> {
    events: Arc<Mutex<Vec<T>>>,
}

impl<T: Clone + Send + 'static> Recorder<T> {
    pub fn new() -> Self {
        Recorder { events: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn push(&self, event: T) {
        self.events.lock().unwrap().push(event);
    }

    pub fn sink(&self) -> impl Fn(&T) + Send + Sync + 'static {
        let events = self.events.clone();
        move |event: &T| events.lock().unwrap().push(event.clone())
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

pub async fn with_deadline<F: Future>(limit: Duration, future: F) -> F::Output {
    tokio::time::timeout(limit, future).await.expect("operation timed out")
}

// ---------------------------------------------------------------------------
// Broker

struct BrokerSessionEntry {
    connected: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<BrokerEvent>,
}

#[derive(Default)]
struct BrokerShared {
    online: bool,
    next_session: u64,
    sessions: HashMap<u64, BrokerSessionEntry>,
    subscriptions: Vec<(String, u64)>,
    published: Vec<(String, Vec<u8>)>,
    opened: Vec<String>,
}

/// A broker living in the test process. Sessions of every client share it.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Mutex<BrokerShared>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        MemoryBroker {
            shared: Arc::new(Mutex::new(BrokerShared { online: true, ..BrokerShared::default() })),
        }
    }

    pub fn offline() -> Self {
        let broker = MemoryBroker::new();
        broker.shared.lock().unwrap().online = false;
        broker
    }

    pub fn connector(&self) -> Arc<dyn BrokerConnector> {
        Arc::new(self.clone())
    }

    /// Going offline drops every live session, as a broker restart would.
    pub fn set_online(&self, online: bool) {
        let mut shared = self.shared.lock().unwrap();
        shared.online = online;
        if !online {
            for (_, entry) in shared.sessions.drain() {
                entry.connected.store(false, Ordering::SeqCst);
                let _ = entry.events.send(BrokerEvent::Closed);
            }
            shared.subscriptions.clear();
        }
    }

    pub fn published(&self) -> Vec<(String, SignalingMessage)> {
        self.shared
            .lock()
            .unwrap()
            .published
            .iter()
            .filter_map(|(topic, payload)| SignalingMessage::decode(payload).ok().map(|m| (topic.clone(), m)))
            .collect()
    }

    /// Kinds of the messages published to `topic`, in order.
    pub fn kinds_sent_to(&self, topic: &str) -> Vec<&'static str> {
        self.published()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, m)| m.kind())
            .collect()
    }

    /// Client ids of every session opened so far.
    pub fn opened_sessions(&self) -> Vec<String> {
        self.shared.lock().unwrap().opened.clone()
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn open(
        &self,
        client_id: &str,
        events: mpsc::UnboundedSender<BrokerEvent>,
    ) -> Result<Arc<dyn BrokerSession>, BrokerError> {
        let mut shared = self.shared.lock().unwrap();
        if !shared.online {
            return Err(BrokerError::Unreachable("memory broker offline".into()));
        }
        shared.next_session += 1;
        let id = shared.next_session;
        let connected = Arc::new(AtomicBool::new(true));
        shared.sessions.insert(
            id,
            BrokerSessionEntry { connected: connected.clone(), events },
        );
        shared.opened.push(client_id.to_string());
        Ok(Arc::new(MemorySession { id, connected, shared: self.shared.clone() }))
    }
}

struct MemorySession {
    id: u64,
    connected: Arc<AtomicBool>,
    shared: Arc<Mutex<BrokerShared>>,
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::Closed);
        }
        self.shared.lock().unwrap().subscriptions.push((topic.to_string(), self.id));
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::Publish("session closed".into()));
        }
        let mut shared = self.shared.lock().unwrap();
        shared.published.push((topic.to_string(), payload.clone()));
        let targets: Vec<u64> = shared
            .subscriptions
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, id)| *id)
            .collect();
        for id in targets {
            if let Some(entry) = shared.sessions.get(&id) {
                let _ = entry.events.send(BrokerEvent::Message {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                });
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let mut shared = self.shared.lock().unwrap();
        shared.sessions.remove(&self.id);
        shared.subscriptions.retain(|(_, id)| *id != self.id);
    }
}

// ---------------------------------------------------------------------------
// WebRTC

#[derive(Default)]
struct Faults {
    fail_offers: HashMap<String, u32>,
    fail_remote_offers: HashMap<String, u32>,
    fail_sends: HashMap<String, u32>,
}

#[derive(Default)]
struct NetworkShared {
    next_id: u64,
    connections: HashMap<u64, Weak<FakeConnection>>,
    faults: Faults,
    created: HashMap<String, u32>,
}

impl NetworkShared {
    fn take_fault(counter: &mut HashMap<String, u32>, owner: &str) -> bool {
        match counter.get_mut(owner) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }
}

/// A pretend network in which fake peer connections of different owners find
/// each other through the SDP strings they exchange.
#[derive(Clone, Default)]
pub struct FakeRtcNetwork {
    shared: Arc<Mutex<NetworkShared>>,
}

impl FakeRtcNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Peer connection factory for the user `owner`.
    pub fn factory(&self, owner: &str) -> Arc<dyn PeerConnectionFactory> {
        Arc::new(FakeFactory { owner: owner.to_string(), network: self.clone() })
    }

    /// Make the next `count` offer creations of `owner` fail.
    pub fn fail_offers(&self, owner: &str, count: u32) {
        self.shared.lock().unwrap().faults.fail_offers.insert(owner.to_string(), count);
    }

    /// Make the next `count` remote offers applied by `owner` fail with a
    /// stale signaling state error.
    pub fn fail_remote_offers(&self, owner: &str, count: u32) {
        self.shared.lock().unwrap().faults.fail_remote_offers.insert(owner.to_string(), count);
    }

    /// Make the next `count` data channel sends of `owner` fail.
    pub fn fail_sends(&self, owner: &str, count: u32) {
        self.shared.lock().unwrap().faults.fail_sends.insert(owner.to_string(), count);
    }

    /// Number of peer connections `owner` has created.
    pub fn connections_created(&self, owner: &str) -> u32 {
        self.shared.lock().unwrap().created.get(owner).copied().unwrap_or(0)
    }

    /// Number of live, linked connection pairs.
    pub fn live_links(&self) -> usize {
        let shared = self.shared.lock().unwrap();
        let linked = shared
            .connections
            .values()
            .filter_map(|c| c.upgrade())
            .filter(|c| c.inner().link.is_some() && c.inner().state == PeerConnectionState::Connected)
            .count();
        linked / 2
    }

    /// Drop the link of `owner`'s connection: both ends see ICE disconnect
    /// and the connection fail.
    pub fn sever(&self, owner: &str) {
        let connections: Vec<Arc<FakeConnection>> = {
            let shared = self.shared.lock().unwrap();
            shared.connections.values().filter_map(|c| c.upgrade()).collect()
        };
        for connection in connections.iter().filter(|c| c.owner == owner) {
            let partner = connection.inner().link;
            connection.fail();
            if let Some(partner) = partner.and_then(|id| self.lookup(id)) {
                partner.fail();
            }
        }
    }

    /// ICE of `owner`'s connections drops out while the connection itself
    /// still reports connected.
    pub fn interrupt_ice(&self, owner: &str) {
        for connection in self.owned_by(owner) {
            connection.set_ice(IceConnectionState::Disconnected);
        }
    }

    /// Undo `interrupt_ice`.
    pub fn restore_ice(&self, owner: &str) {
        for connection in self.owned_by(owner) {
            connection.set_ice(IceConnectionState::Connected);
        }
    }

    fn owned_by(&self, owner: &str) -> Vec<Arc<FakeConnection>> {
        let shared = self.shared.lock().unwrap();
        shared
            .connections
            .values()
            .filter_map(|c| c.upgrade())
            .filter(|c| c.owner == owner)
            .collect()
    }

    fn lookup(&self, id: u64) -> Option<Arc<FakeConnection>> {
        self.shared.lock().unwrap().connections.get(&id).and_then(|c| c.upgrade())
    }

    fn take_fault(&self, owner: &str, pick: impl FnOnce(&mut Faults) -> &mut HashMap<String, u32>) -> bool {
        let mut shared = self.shared.lock().unwrap();
        NetworkShared::take_fault(pick(&mut shared.faults), owner)
    }
}

struct FakeFactory {
    owner: String,
    network: FakeRtcNetwork,
}

#[async_trait]
impl PeerConnectionFactory for FakeFactory {
    async fn create(&self, events: mpsc::UnboundedSender<PeerEvent>) -> Result<Arc<dyn PeerConnection>, RtcError> {
        let mut shared = self.network.shared.lock().unwrap();
        shared.next_id += 1;
        let id = shared.next_id;
        let connection = Arc::new(FakeConnection {
            id,
            owner: self.owner.clone(),
            network: self.network.clone(),
            events,
            state: Mutex::new(FakeState::default()),
            candidates_seen: AtomicU64::new(0),
        });
        shared.connections.insert(id, Arc::downgrade(&connection));
        *shared.created.entry(self.owner.clone()).or_insert(0) += 1;
        debug!("Fake connection {} created for {}", id, self.owner);
        Ok(connection)
    }
}

#[derive(Clone)]
struct FakeState {
    state: PeerConnectionState,
    signaling: SignalingState,
    ice: IceConnectionState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    channel_requested: bool,
    channel_open: bool,
    link: Option<u64>,
}

impl Default for FakeState {
    fn default() -> Self {
        FakeState {
            state: PeerConnectionState::New,
            signaling: SignalingState::Stable,
            ice: IceConnectionState::New,
            local: None,
            remote: None,
            channel_requested: false,
            channel_open: false,
            link: None,
        }
    }
}

pub struct FakeConnection {
    id: u64,
    owner: String,
    network: FakeRtcNetwork,
    events: mpsc::UnboundedSender<PeerEvent>,
    state: Mutex<FakeState>,
    candidates_seen: AtomicU64,
}

impl FakeConnection {
    fn inner(&self) -> FakeState {
        self.state.lock().unwrap().clone()
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    fn connect_to(&self, partner: u64) {
        {
            let mut state = self.state.lock().unwrap();
            if state.state == PeerConnectionState::Closed {
                return;
            }
            state.link = Some(partner);
            state.state = PeerConnectionState::Connected;
            state.ice = IceConnectionState::Connected;
            state.channel_open = true;
        }
        self.emit(PeerEvent::ConnectionState(PeerConnectionState::Connecting));
        self.emit(PeerEvent::IceConnectionState(IceConnectionState::Connected));
        self.emit(PeerEvent::ConnectionState(PeerConnectionState::Connected));
        self.emit(PeerEvent::DataChannelOpen);
    }

    fn fail(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.state == PeerConnectionState::Closed {
                return;
            }
            state.state = PeerConnectionState::Failed;
            state.ice = IceConnectionState::Failed;
            state.channel_open = false;
            state.link = None;
        }
        self.emit(PeerEvent::IceConnectionState(IceConnectionState::Disconnected));
        self.emit(PeerEvent::ConnectionState(PeerConnectionState::Failed));
    }

    fn set_ice(&self, ice: IceConnectionState) {
        {
            let mut state = self.state.lock().unwrap();
            if state.state != PeerConnectionState::Connected {
                return;
            }
            state.ice = ice;
        }
        self.emit(PeerEvent::IceConnectionState(ice));
    }

    fn remote_disconnected(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.state == PeerConnectionState::Closed {
                return;
            }
            state.state = PeerConnectionState::Disconnected;
            state.ice = IceConnectionState::Disconnected;
            state.channel_open = false;
            state.link = None;
        }
        self.emit(PeerEvent::DataChannelClosed);
    }

    /// Connection id encoded in a fake SDP string `fake-<kind>:<owner>:<id>`.
    fn sdp_connection(description: &SessionDescription) -> Option<u64> {
        description.sdp.rsplit(':').next().and_then(|id| id.parse().ok())
    }
}

#[async_trait]
impl PeerConnection for FakeConnection {
    async fn open_data_channel(&self, _label: &str) -> Result<(), RtcError> {
        self.state.lock().unwrap().channel_requested = true;
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, RtcError> {
        if self.network.take_fault(&self.owner, |f| &mut f.fail_offers) {
            return Err(RtcError::Backend("offer creation failed: no usable network".into()));
        }
        if self.inner().state == PeerConnectionState::Closed {
            return Err(RtcError::Closed);
        }
        let kind = if ice_restart { "restart" } else { "offer" };
        Ok(SessionDescription::offer(format!("fake-{}:{}:{}", kind, self.owner, self.id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, RtcError> {
        let state = self.inner();
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(RtcError::InvalidState(format!("{:?}", state.signaling)));
        }
        Ok(SessionDescription::answer(format!("fake-answer:{}:{}", self.owner, self.id)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), RtcError> {
        let is_offer = {
            let mut state = self.state.lock().unwrap();
            match description.kind {
                SdpKind::Offer => {
                    state.signaling = SignalingState::HaveLocalOffer;
                    state.local = Some(description.clone());
                    true
                }
                SdpKind::Answer | SdpKind::Pranswer => {
                    state.signaling = SignalingState::Stable;
                    state.local = Some(description.clone());
                    false
                }
                SdpKind::Rollback => {
                    state.signaling = SignalingState::Stable;
                    state.local = None;
                    false
                }
            }
        };
        if is_offer {
            self.emit(PeerEvent::LocalCandidate(IceCandidate {
                candidate: format!("candidate:{} 1 udp 2122260223 10.0.0.{} 50000 typ host", self.id, self.id % 250),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            }));
        }
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), RtcError> {
        match description.kind {
            SdpKind::Offer => {
                if self.network.take_fault(&self.owner, |f| &mut f.fail_remote_offers) {
                    return Err(RtcError::Backend(
                        "Failed to set remote offer sdp: The order of m-lines in subsequent offer doesn't match"
                            .into(),
                    ));
                }
                let mut state = self.state.lock().unwrap();
                if state.signaling == SignalingState::HaveLocalOffer {
                    return Err(RtcError::InvalidState("have-local-offer".into()));
                }
                state.remote = Some(description);
                state.signaling = SignalingState::HaveRemoteOffer;
                Ok(())
            }
            SdpKind::Answer | SdpKind::Pranswer => {
                let partner = {
                    let mut state = self.state.lock().unwrap();
                    if state.signaling != SignalingState::HaveLocalOffer {
                        return Err(RtcError::InvalidState(format!("{:?}", state.signaling)));
                    }
                    state.remote = Some(description.clone());
                    state.signaling = SignalingState::Stable;
                    Self::sdp_connection(&description)
                };
                // The answering connection must still hold our offer
                let partner = partner.and_then(|id| self.network.lookup(id)).filter(|p| {
                    p.inner()
                        .remote
                        .as_ref()
                        .and_then(Self::sdp_connection)
                        .map(|id| id == self.id)
                        .unwrap_or(false)
                });
                if let Some(partner) = partner {
                    partner.connect_to(self.id);
                    self.connect_to(partner.id);
                }
                Ok(())
            }
            SdpKind::Rollback => {
                let mut state = self.state.lock().unwrap();
                state.remote = None;
                state.signaling = SignalingState::Stable;
                Ok(())
            }
        }
    }

    async fn has_remote_description(&self) -> bool {
        self.inner().remote.is_some()
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), RtcError> {
        if self.inner().remote.is_none() {
            return Err(RtcError::InvalidState("no remote description".into()));
        }
        self.candidates_seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<(), RtcError> {
        let state = self.inner();
        if state.state != PeerConnectionState::Connected || !state.channel_open {
            return Err(RtcError::ChannelNotOpen);
        }
        if self.network.take_fault(&self.owner, |f| &mut f.fail_sends) {
            return Err(RtcError::Backend("data channel send failed".into()));
        }
        if let Some(partner) = state.link.and_then(|id| self.network.lookup(id)) {
            partner.emit(PeerEvent::DataChannelMessage(text.to_string()));
        }
        Ok(())
    }

    fn connection_state(&self) -> PeerConnectionState {
        self.inner().state
    }

    fn signaling_state(&self) -> SignalingState {
        self.inner().signaling
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        self.inner().ice
    }

    async fn close(&self) -> Result<(), RtcError> {
        let partner = {
            let mut state = self.state.lock().unwrap();
            state.state = PeerConnectionState::Closed;
            state.signaling = SignalingState::Closed;
            state.ice = IceConnectionState::Closed;
            state.channel_open = false;
            state.link.take()
        };
        if let Some(partner) = partner.and_then(|id| self.network.lookup(id)) {
            partner.remote_disconnected();
        }
        Ok(())
    }
}
