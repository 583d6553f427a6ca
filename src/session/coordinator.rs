// Chat coordinator: the public face of the library. Wires the signaling
// transport, negotiation engine, lifecycle, delivery pipeline and contact
// service together and processes inbound control messages one at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::events::{EventBus, SubscriptionId};
use crate::identity::IdentityProvider;
use crate::models::{Contact, LinkStatus, Message};
use crate::retry::{with_timeout, WaitError};
use crate::rtc::{NegotiationConfig, NegotiationEngine, PeerConnectionFactory, WebRtcFactory};
use crate::signaling::{
    BrokerConnector, IceCandidate, MqttConnector, SessionDescription, SignalingMessage, SignalingTransport,
    TransportConfig,
};
use crate::storage::{ContactRepository, MemoryStore, MessageRepository};

use super::contacts::ContactService;
use super::delivery::{DeliveryConfig, DeliveryError, MessagePipeline};
use super::lifecycle::{ConnectionLifecycle, LifecycleConfig};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Could not connect to the signaling broker")]
    SignalingUnavailable,
    #[error("Coordinator has been disposed")]
    Disposed,
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    #[error(transparent)]
    Wait(#[from] WaitError),
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub initialize_timeout: Duration,
    pub send_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            initialize_timeout: Duration::from_secs(15),
            send_timeout: Duration::from_secs(30),
        }
    }
}

/// An unknown peer introduced itself; it is now a pending contact.
#[derive(Debug, Clone, PartialEq)]
pub struct ContactRequest {
    pub peer_id: String,
    pub name: String,
}

/// A peer answered our contact request.
#[derive(Debug, Clone, PartialEq)]
pub struct ContactResponse {
    pub peer_id: String,
    pub accepted: bool,
    pub name: Option<String>,
}

/// Outward event streams. Subscribe with a callback or take a channel.
#[derive(Default)]
pub struct CoordinatorEvents {
    pub messages: Arc<EventBus<Message>>,
    pub connection_states: Arc<EventBus<LinkStatus>>,
    pub contact_requests: Arc<EventBus<ContactRequest>>,
    pub contact_responses: Arc<EventBus<ContactResponse>>,
    pub errors: Arc<EventBus<String>>,
}

type Outbound = (SignalingMessage, String);

struct CoordinatorInner {
    user_id: String,
    config: CoordinatorConfig,
    signaling: SignalingTransport,
    engine: NegotiationEngine,
    lifecycle: ConnectionLifecycle,
    pipeline: MessagePipeline,
    contacts: ContactService,
    events: CoordinatorEvents,
    current_peer: Mutex<Option<String>>,
    initialized: AtomicBool,
    disposed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct ChatCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl ChatCoordinator {
    pub fn builder(identity: &dyn IdentityProvider) -> CoordinatorBuilder {
        CoordinatorBuilder::new(identity.user_id())
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    pub fn events(&self) -> &CoordinatorEvents {
        &self.inner.events
    }

    pub fn on_message(&self, handler: impl Fn(&Message) + Send + Sync + 'static) -> SubscriptionId {
        self.inner.events.messages.subscribe(handler)
    }

    pub fn on_connection_state(&self, handler: impl Fn(&LinkStatus) + Send + Sync + 'static) -> SubscriptionId {
        self.inner.events.connection_states.subscribe(handler)
    }

    pub fn on_contact_request(&self, handler: impl Fn(&ContactRequest) + Send + Sync + 'static) -> SubscriptionId {
        self.inner.events.contact_requests.subscribe(handler)
    }

    pub fn on_contact_response(&self, handler: impl Fn(&ContactResponse) + Send + Sync + 'static) -> SubscriptionId {
        self.inner.events.contact_responses.subscribe(handler)
    }

    pub fn on_error(&self, handler: impl Fn(&String) + Send + Sync + 'static) -> SubscriptionId {
        self.inner.events.errors.subscribe(handler)
    }

    pub fn connection_status(&self) -> LinkStatus {
        self.inner.lifecycle.status()
    }

    pub fn current_peer(&self) -> Option<String> {
        self.inner.current_peer.lock().ok().and_then(|p| p.clone())
    }

    pub fn is_signaling_connected(&self) -> bool {
        self.inner.signaling.is_connected()
    }

    /// Wire internal observers, start the inbound loop and connect to the
    /// broker. Can be called again after a failed connect.
    pub async fn initialize(&self) -> Result<(), CoordinatorError> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(CoordinatorError::Disposed);
        }
        if !self.inner.initialized.swap(true, Ordering::SeqCst) {
            self.wire();
        }

        let signaling = self.inner.signaling.clone();
        let connected = match with_timeout(
            async move { signaling.connect().await },
            self.inner.config.initialize_timeout,
            "Signaling connect",
        )
        .await
        {
            Ok(connected) => connected,
            Err(e) => {
                warn!("{}", e);
                false
            }
        };
        if !connected {
            self.report_error("Could not connect to the signaling broker".to_string());
            return Err(CoordinatorError::SignalingUnavailable);
        }
        info!("Chat coordinator ready as {}", self.inner.user_id);
        Ok(())
    }

    fn wire(&self) {
        let mut tasks = Vec::new();

        // Inbound control messages, strictly in arrival order
        let mut inbound = self.inner.signaling.messages().channel();
        let weak = Arc::downgrade(&self.inner);
        tasks.push(tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                ChatCoordinator { inner }.handle_signaling_message(message).await;
            }
            debug!("Inbound signaling loop finished");
        }));

        // Relays produced by the engine, sent in the order they were produced
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
        let signaling = self.inner.signaling.clone();
        tasks.push(tokio::spawn(async move {
            while let Some((message, peer)) = outbound_rx.recv().await {
                signaling.send(message, &peer).await;
            }
        }));

        let user_id = self.inner.user_id.clone();
        let candidates_tx = outbound_tx.clone();
        self.inner
            .engine
            .local_candidates()
            .subscribe(move |(peer, candidate): &(String, IceCandidate)| {
                let message = SignalingMessage::IceCandidate {
                    from: user_id.clone(),
                    to: peer.clone(),
                    candidate: candidate.clone(),
                };
                let _ = candidates_tx.send((message, peer.clone()));
            });

        let user_id = self.inner.user_id.clone();
        self.inner
            .engine
            .renegotiations()
            .subscribe(move |(peer, offer): &(String, SessionDescription)| {
                debug!("Relaying renegotiation offer to {}", peer);
                let message = SignalingMessage::Offer {
                    from: user_id.clone(),
                    to: peer.clone(),
                    sdp: offer.clone(),
                };
                let _ = outbound_tx.send((message, peer.clone()));
            });

        let states = self.inner.events.connection_states.clone();
        let pipeline = self.inner.pipeline.clone();
        self.inner.lifecycle.status_changes().subscribe(move |status: &LinkStatus| {
            states.emit(status);
            if *status == LinkStatus::Connected {
                let pipeline = pipeline.clone();
                tokio::spawn(async move { pipeline.flush_pending_messages().await });
            }
        });

        let messages = self.inner.events.messages.clone();
        self.inner
            .pipeline
            .updates()
            .subscribe(move |message: &Message| messages.emit(message));

        if let Ok(mut slot) = self.inner.tasks.lock() {
            slot.extend(tasks);
        }
    }

    async fn handle_signaling_message(&self, message: SignalingMessage) {
        let from = message.from().to_string();
        debug!("Handling {} from {}", message.kind(), from);

        let introduces_sender = !matches!(
            message,
            SignalingMessage::ContactDeleted { .. } | SignalingMessage::ContactResponse { .. }
        );
        if introduces_sender {
            if let Some(contact) = self.inner.contacts.ensure_contact_exists(&from, message.display_name()) {
                self.inner.events.contact_requests.emit(&ContactRequest {
                    peer_id: contact.peer_id,
                    name: contact.name,
                });
            }
        }

        let negotiates = matches!(
            message,
            SignalingMessage::Offer { .. } | SignalingMessage::Answer { .. } | SignalingMessage::IceCandidate { .. }
        );
        if negotiates && self.chatting_with_someone_else(&from) {
            debug!("Ignoring {} from {} while chatting with someone else", message.kind(), from);
            return;
        }

        match message {
            SignalingMessage::Offer { sdp, .. } => self.handle_offer(&from, sdp).await,
            SignalingMessage::Answer { sdp, .. } => {
                if let Err(e) = self.inner.engine.handle_remote_answer(sdp).await {
                    self.report_error(format!("Failed to apply answer from {}: {}", from, e));
                }
            }
            SignalingMessage::IceCandidate { candidate, .. } => {
                self.inner.engine.add_ice_candidate(candidate).await;
            }
            SignalingMessage::ContactRequest { name, .. } => {
                debug!("Contact request from {} ({})", from, name);
            }
            SignalingMessage::ContactResponse { accepted, name, .. } => {
                self.inner.contacts.apply_contact_response(&from, accepted, name.as_deref());
                self.inner.events.contact_responses.emit(&ContactResponse {
                    peer_id: from,
                    accepted,
                    name,
                });
            }
            SignalingMessage::ChatPresence { is_opened, .. } => {
                if is_opened {
                    if self.chatting_with_someone_else(&from) {
                        debug!("Ignoring presence from {} while chatting with someone else", from);
                        return;
                    }
                    let lifecycle = self.inner.lifecycle.clone();
                    tokio::spawn(async move { lifecycle.connect_to_peer(&from).await });
                } else {
                    debug!("{} closed the chat", from);
                }
            }
            SignalingMessage::ContactDeleted { .. } => {
                self.inner.contacts.mark_remotely_deleted(&from);
            }
        }
    }

    fn chatting_with_someone_else(&self, peer: &str) -> bool {
        self.current_peer().is_some_and(|current| current != peer)
    }

    async fn handle_offer(&self, from: &str, offer: SessionDescription) {
        match self.inner.engine.handle_remote_offer(from, offer).await {
            Ok(Some(answer)) => {
                self.inner.pipeline.set_current_peer(from);
                let message = SignalingMessage::Answer {
                    from: self.inner.user_id.clone(),
                    to: from.to_string(),
                    sdp: answer,
                };
                self.inner.signaling.send(message, from).await;
            }
            Ok(None) => debug!("Discarded colliding offer from {}", from),
            Err(e) => self.report_error(format!("Failed to handle offer from {}: {}", from, e)),
        }
    }

    /// Make `peer` the active chat and start connecting to it.
    pub async fn open_chat(&self, peer: &str) {
        let previous = self.current_peer();
        if let Some(previous) = previous.filter(|p| p != peer) {
            info!("Switching chat from {} to {}", previous, peer);
            self.inner.lifecycle.set_chat_opened(&previous, false).await;
        }
        if let Ok(mut current) = self.inner.current_peer.lock() {
            *current = Some(peer.to_string());
        }
        self.inner.lifecycle.set_chat_opened(peer, true).await;
        self.inner.pipeline.set_current_peer(peer);
        self.inner.lifecycle.connect_to_peer(peer).await;
    }

    pub async fn close_chat(&self) {
        let peer = self.inner.current_peer.lock().ok().and_then(|mut p| p.take());
        if let Some(peer) = peer {
            self.inner.lifecycle.set_chat_opened(&peer, false).await;
        }
    }

    /// Send `content` to the open chat. The message is stored even when the
    /// peer is unreachable and goes out once the link comes up.
    pub async fn send_message(&self, content: &str) -> Result<Message, CoordinatorError> {
        let pipeline = self.inner.pipeline.clone();
        let content = content.to_string();
        let result = with_timeout(
            async move { pipeline.send_message(&content).await },
            self.inner.config.send_timeout,
            "Send message",
        )
        .await;
        match result {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(e)) => {
                self.report_error(format!("Failed to send message: {}", e));
                Err(e.into())
            }
            Err(e) => {
                self.report_error(format!("Failed to send message: {}", e));
                Err(e.into())
            }
        }
    }

    pub fn get_messages(&self, peer: &str) -> Vec<Message> {
        self.inner.pipeline.get_messages(peer)
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.inner.contacts.contacts()
    }

    pub fn contact(&self, peer: &str) -> Option<Contact> {
        self.inner.contacts.contact(peer)
    }

    /// Add `peer` and send it a contact request. Returns false when the peer
    /// is already a live contact or is ourselves.
    pub async fn add_contact(&self, peer: &str, name: &str) -> bool {
        if !self.inner.contacts.add_contact(peer, name) {
            return false;
        }
        self.inner.contacts.send_contact_request(peer).await;
        true
    }

    pub async fn accept_contact(&self, peer: &str, name: &str) -> bool {
        self.inner.contacts.accept_contact(peer, name).await
    }

    pub async fn decline_contact(&self, peer: &str) -> bool {
        self.inner.contacts.decline_contact(peer).await
    }

    pub fn remove_contact(&self, peer: &str) -> bool {
        self.inner.contacts.remove_contact(peer)
    }

    /// Tear everything down. Only the first call does anything.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Disposing chat coordinator");
        self.inner.lifecycle.dispose();
        self.inner.pipeline.dispose();
        self.inner.engine.close().await;
        self.inner.signaling.disconnect().await;
        let tasks = self
            .inner
            .tasks
            .lock()
            .map(|mut t| std::mem::take(&mut *t))
            .unwrap_or_default();
        for task in tasks {
            task.abort();
        }
    }

    fn report_error(&self, message: String) {
        error!("{}", message);
        self.inner.events.errors.emit(&message);
    }
}

/// Assembles a [`ChatCoordinator`]. Collaborators that are not given fall
/// back to the MQTT broker, the webrtc-rs backend and in-memory storage.
pub struct CoordinatorBuilder {
    user_id: String,
    display_name: Option<String>,
    broker: Option<Arc<dyn BrokerConnector>>,
    peer_factory: Option<Arc<dyn PeerConnectionFactory>>,
    contacts: Option<Arc<dyn ContactRepository>>,
    messages: Option<Arc<dyn MessageRepository>>,
    transport: TransportConfig,
    negotiation: NegotiationConfig,
    lifecycle: LifecycleConfig,
    delivery: DeliveryConfig,
    coordinator: CoordinatorConfig,
}

impl CoordinatorBuilder {
    pub fn new(user_id: impl Into<String>) -> Self {
        CoordinatorBuilder {
            user_id: user_id.into(),
            display_name: None,
            broker: None,
            peer_factory: None,
            contacts: None,
            messages: None,
            transport: TransportConfig::default(),
            negotiation: NegotiationConfig::default(),
            lifecycle: LifecycleConfig::default(),
            delivery: DeliveryConfig::default(),
            coordinator: CoordinatorConfig::default(),
        }
    }

    /// Name sent to peers with contact requests and acceptances.
    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn broker(mut self, broker: Arc<dyn BrokerConnector>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn peer_factory(mut self, factory: Arc<dyn PeerConnectionFactory>) -> Self {
        self.peer_factory = Some(factory);
        self
    }

    /// Use one store for both contacts and messages.
    pub fn store<S>(mut self, store: Arc<S>) -> Self
    where
        S: ContactRepository + MessageRepository + 'static,
    {
        self.contacts = Some(store.clone());
        self.messages = Some(store);
        self
    }

    pub fn contact_repository(mut self, repository: Arc<dyn ContactRepository>) -> Self {
        self.contacts = Some(repository);
        self
    }

    pub fn message_repository(mut self, repository: Arc<dyn MessageRepository>) -> Self {
        self.messages = Some(repository);
        self
    }

    pub fn transport_config(mut self, config: TransportConfig) -> Self {
        self.transport = config;
        self
    }

    pub fn negotiation_config(mut self, config: NegotiationConfig) -> Self {
        self.negotiation = config;
        self
    }

    pub fn lifecycle_config(mut self, config: LifecycleConfig) -> Self {
        self.lifecycle = config;
        self
    }

    pub fn delivery_config(mut self, config: DeliveryConfig) -> Self {
        self.delivery = config;
        self
    }

    pub fn coordinator_config(mut self, config: CoordinatorConfig) -> Self {
        self.coordinator = config;
        self
    }

    pub fn build(self) -> ChatCoordinator {
        let user_id = self.user_id;
        let broker = self
            .broker
            .unwrap_or_else(|| Arc::new(MqttConnector::default()) as Arc<dyn BrokerConnector>);
        let factory = self
            .peer_factory
            .unwrap_or_else(|| Arc::new(WebRtcFactory::default()) as Arc<dyn PeerConnectionFactory>);
        let (contacts_repo, messages_repo) = match (self.contacts, self.messages) {
            (Some(contacts), Some(messages)) => (contacts, messages),
            (contacts, messages) => {
                let memory = Arc::new(MemoryStore::new());
                (
                    contacts.unwrap_or_else(|| memory.clone() as Arc<dyn ContactRepository>),
                    messages.unwrap_or_else(|| memory as Arc<dyn MessageRepository>),
                )
            }
        };
        let display_name = self.display_name.unwrap_or_else(|| user_id.clone());

        let signaling = SignalingTransport::new(user_id.clone(), broker, self.transport);
        let engine = NegotiationEngine::new(user_id.clone(), factory, self.negotiation);
        let lifecycle = ConnectionLifecycle::new(user_id.clone(), signaling.clone(), engine.clone(), self.lifecycle);
        let pipeline = MessagePipeline::new(user_id.clone(), engine.clone(), messages_repo, self.delivery);
        let contacts = ContactService::new(user_id.clone(), display_name, contacts_repo, signaling.clone());

        ChatCoordinator {
            inner: Arc::new(CoordinatorInner {
                user_id,
                config: self.coordinator,
                signaling,
                engine,
                lifecycle,
                pipeline,
                contacts,
                events: CoordinatorEvents::default(),
                current_peer: Mutex::new(None),
                initialized: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }
}
