// Signaling transport: one broker session addressed by our identity, an
// offline queue, and a self-healing reconnection loop.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::events::EventBus;
use crate::models::ConnectionState;
use crate::retry::{ReconnectHooks, ReconnectionManager, RetryConfig};

use super::{BrokerConnector, BrokerError, BrokerEvent, BrokerSession, SignalingMessage};

pub const DEFAULT_NAMESPACE: &str = "p2p-chat/signaling";

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Topic prefix; each user listens on `<namespace>/<user id>`.
    pub namespace: String,
    pub connect_timeout: Duration,
    pub max_queue: usize,
    /// Queued messages older than this are dropped on flush.
    pub stale_after: Duration,
    pub reconnect: RetryConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            namespace: DEFAULT_NAMESPACE.to_string(),
            connect_timeout: Duration::from_secs(10),
            max_queue: 100,
            stale_after: Duration::from_secs(5 * 60),
            reconnect: RetryConfig::BROKER,
        }
    }
}

struct QueuedMessage {
    message: SignalingMessage,
    target: String,
    queued_at: Instant,
}

struct TransportState {
    session: Option<Arc<dyn BrokerSession>>,
    generation: u64,
    state: ConnectionState,
    manual_disconnect: bool,
    queue: VecDeque<QueuedMessage>,
    pump: Option<JoinHandle<()>>,
}

struct TransportInner {
    user_id: String,
    connector: Arc<dyn BrokerConnector>,
    config: TransportConfig,
    state: Mutex<TransportState>,
    connect_lock: TokioMutex<()>,
    reconnection: ReconnectionManager,
    messages: Arc<EventBus<SignalingMessage>>,
    states: Arc<EventBus<ConnectionState>>,
}

#[derive(Clone)]
pub struct SignalingTransport {
    inner: Arc<TransportInner>,
}

impl SignalingTransport {
    pub fn new(user_id: impl Into<String>, connector: Arc<dyn BrokerConnector>, config: TransportConfig) -> Self {
        SignalingTransport {
            inner: Arc::new(TransportInner {
                user_id: user_id.into(),
                connector,
                config,
                state: Mutex::new(TransportState {
                    session: None,
                    generation: 0,
                    state: ConnectionState::Disconnected,
                    manual_disconnect: false,
                    queue: VecDeque::new(),
                    pump: None,
                }),
                connect_lock: TokioMutex::new(()),
                reconnection: ReconnectionManager::new(),
                messages: Arc::new(EventBus::new()),
                states: Arc::new(EventBus::new()),
            }),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    pub fn topic_for(&self, user_id: &str) -> String {
        format!("{}/{}", self.inner.config.namespace, user_id)
    }

    /// Decoded inbound control messages.
    pub fn messages(&self) -> &Arc<EventBus<SignalingMessage>> {
        &self.inner.messages
    }

    pub fn state_changes(&self) -> &Arc<EventBus<ConnectionState>> {
        &self.inner.states
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.lock_state().map(|s| s.state).unwrap_or(ConnectionState::Disconnected)
    }

    pub fn is_connected(&self) -> bool {
        self.current_session().map(|s| s.is_connected()).unwrap_or(false)
    }

    pub fn pending_message_count(&self) -> usize {
        self.lock_state().map(|s| s.queue.len()).unwrap_or(0)
    }

    pub fn is_reconnecting(&self) -> bool {
        self.inner.reconnection.is_reconnecting()
    }

    /// Open the broker session and subscribe to our own topic.
    /// Never fails: returns whether the transport ended up connected.
    pub async fn connect(&self) -> bool {
        if let Some(mut state) = self.lock_state() {
            state.manual_disconnect = false;
        }
        self.establish().await
    }

    /// Publish now if the session is live, otherwise queue and make sure a
    /// reconnection is under way.
    pub async fn send(&self, message: SignalingMessage, target: &str) {
        match self.current_session() {
            Some(session) if session.is_connected() => {
                if let Err(e) = self.publish(&session, &message, target).await {
                    warn!("Failed to publish {} to {}: {}, queueing", message.kind(), target, e);
                    self.enqueue(QueuedMessage {
                        message,
                        target: target.to_string(),
                        queued_at: Instant::now(),
                    });
                }
            }
            _ => {
                debug!("Broker not connected, queueing {} for {}", message.kind(), target);
                self.enqueue(QueuedMessage {
                    message,
                    target: target.to_string(),
                    queued_at: Instant::now(),
                });
                self.start_reconnection();
            }
        }
    }

    /// Close the session and stay offline until the next `connect()`. Idempotent.
    pub async fn disconnect(&self) {
        let (session, pump) = match self.lock_state() {
            Some(mut state) => {
                if state.manual_disconnect && state.session.is_none() {
                    return;
                }
                state.manual_disconnect = true;
                state.generation += 1;
                (state.session.take(), state.pump.take())
            }
            None => return,
        };
        self.inner.reconnection.cancel();
        if let Some(pump) = pump {
            pump.abort();
        }
        if let Some(session) = session {
            session.close().await;
        }
        self.set_state(ConnectionState::Disconnected);
        info!("Signaling transport disconnected");
    }

    async fn establish(&self) -> bool {
        let _guard = self.inner.connect_lock.lock().await;
        if self.is_connected() {
            return true;
        }
        let reconnecting = self.inner.reconnection.is_reconnecting();
        if !reconnecting {
            self.set_state(ConnectionState::Connecting);
        }

        let client_id = format!("peerchat_{}", self.inner.user_id);
        let (tx, rx) = mpsc::unbounded_channel();
        let opened = tokio::time::timeout(
            self.inner.config.connect_timeout,
            self.inner.connector.open(&client_id, tx),
        )
        .await;
        let session = match opened {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                warn!("Failed to open broker session: {}", e);
                self.connect_failed();
                return false;
            }
            Err(_) => {
                warn!(
                    "Broker connection timed out after {}ms",
                    self.inner.config.connect_timeout.as_millis()
                );
                self.connect_failed();
                return false;
            }
        };

        let topic = self.topic_for(&self.inner.user_id);
        if let Err(e) = session.subscribe(&topic).await {
            warn!("Failed to subscribe to {}: {}", topic, e);
            session.close().await;
            self.connect_failed();
            return false;
        }

        let installed = match self.lock_state() {
            Some(mut state) if !state.manual_disconnect => {
                state.generation += 1;
                let old = state.session.replace(session.clone());
                if let Some(pump) = state.pump.take() {
                    pump.abort();
                }
                state.pump = Some(tokio::spawn(pump_events(
                    Arc::downgrade(&self.inner),
                    state.generation,
                    rx,
                )));
                Some(old)
            }
            _ => None,
        };
        let Some(old) = installed else {
            debug!("Disconnect requested while connecting, dropping new session");
            session.close().await;
            return false;
        };
        if let Some(old) = old {
            old.close().await;
        }

        info!("Connected to signaling broker, listening on {}", topic);
        self.set_state(ConnectionState::Connected);
        self.inner.reconnection.reset();
        self.flush_queue().await;
        true
    }

    fn connect_failed(&self) {
        if self.inner.reconnection.is_reconnecting() {
            self.set_state(ConnectionState::Reconnecting);
        } else {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    fn start_reconnection(&self) {
        let manual = self.lock_state().map(|s| s.manual_disconnect).unwrap_or(true);
        if manual || self.inner.reconnection.is_reconnecting() {
            return;
        }
        self.set_state(ConnectionState::Reconnecting);

        let transport = self.clone();
        tokio::spawn(async move {
            let connect = transport.clone();
            let give_up = transport.clone();
            let reconnected = transport
                .inner
                .reconnection
                .reconnect_with_backoff(
                    transport.inner.config.reconnect,
                    move || {
                        let connect = connect.clone();
                        async move { connect.establish().await }
                    },
                    ReconnectHooks::new()
                        .on_attempt(|attempt, delay| {
                            debug!("Broker reconnection attempt {} (next wait {}ms)", attempt, delay.as_millis());
                        })
                        .on_give_up(move |attempts| {
                            error!("Broker unreachable after {} attempts", attempts);
                            give_up.set_state(ConnectionState::Failed);
                        }),
                )
                .await;
            debug!("Broker reconnection loop finished (connected: {})", reconnected);
        });
    }

    fn handle_session_lost(&self, generation: u64) {
        let manual = match self.lock_state() {
            Some(mut state) => {
                if state.generation != generation {
                    return;
                }
                state.session = None;
                state.pump = None;
                state.manual_disconnect
            }
            None => return,
        };
        if manual {
            return;
        }
        warn!("Broker session lost, reconnecting");
        self.set_state(ConnectionState::Disconnected);
        self.start_reconnection();
    }

    async fn publish(
        &self,
        session: &Arc<dyn BrokerSession>,
        message: &SignalingMessage,
        target: &str,
    ) -> Result<(), BrokerError> {
        let payload = message.encode().map_err(|e| BrokerError::Publish(e.to_string()))?;
        session.publish(&self.topic_for(target), payload).await?;
        debug!("Published {} to {}", message.kind(), target);
        Ok(())
    }

    fn enqueue(&self, queued: QueuedMessage) {
        let Some(mut state) = self.lock_state() else { return };
        if state.queue.len() >= self.inner.config.max_queue {
            if let Some(dropped) = state.queue.pop_front() {
                warn!(
                    "Signaling queue full, dropping oldest {} for {}",
                    dropped.message.kind(),
                    dropped.target
                );
            }
        }
        state.queue.push_back(queued);
    }

    async fn flush_queue(&self) {
        let drained: Vec<QueuedMessage> = match self.lock_state() {
            Some(mut state) => state.queue.drain(..).collect(),
            None => return,
        };
        if drained.is_empty() {
            return;
        }
        info!("Flushing {} queued signaling messages", drained.len());

        for queued in drained {
            if queued.queued_at.elapsed() > self.inner.config.stale_after {
                debug!("Dropping stale {} for {}", queued.message.kind(), queued.target);
                continue;
            }
            let session = self.current_session().filter(|s| s.is_connected());
            let result = match &session {
                Some(session) => self.publish(session, &queued.message, &queued.target).await,
                None => Err(BrokerError::Closed),
            };
            if let Err(e) = result {
                debug!("Re-queueing {} for {}: {}", queued.message.kind(), queued.target, e);
                self.enqueue(queued);
            }
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = match self.lock_state() {
            Some(mut state) if state.state != next => {
                state.state = next;
                true
            }
            _ => false,
        };
        if changed {
            debug!("Signaling state -> {}", next);
            self.inner.states.emit(&next);
        }
    }

    fn current_session(&self) -> Option<Arc<dyn BrokerSession>> {
        self.lock_state().and_then(|s| s.session.clone())
    }

    fn lock_state(&self) -> Option<std::sync::MutexGuard<'_, TransportState>> {
        match self.inner.state.lock() {
            Ok(guard) => Some(guard),
            Err(e) => {
                error!("Signaling state lock poisoned: {}", e);
                None
            }
        }
    }
}

async fn pump_events(inner: Weak<TransportInner>, generation: u64, mut events: mpsc::UnboundedReceiver<BrokerEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        let transport = SignalingTransport { inner };
        match event {
            BrokerEvent::Message { topic, payload } => match SignalingMessage::decode(&payload) {
                Ok(message) => {
                    debug!("Received {} from {}", message.kind(), message.from());
                    transport.inner.messages.emit(&message);
                }
                Err(e) => warn!("Rejected payload on {}: {}", topic, e),
            },
            BrokerEvent::Closed => {
                transport.handle_session_lost(generation);
                break;
            }
        }
    }
}
