// Connection lifecycle for the active chat peer: bounded connection attempts,
// presence heartbeat, health polling and reconnection, folded into one coarse
// outward status.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::task::JoinHandle;

use crate::events::{EventBus, SubscriptionId};
use crate::models::{ConnectionState, LinkStatus};
use crate::retry::{with_timeout, ReconnectHooks, ReconnectionManager, RetryConfig};
use crate::rtc::{NegotiationEngine, PeerConnectionState, SignalingState};
use crate::signaling::{SignalingMessage, SignalingTransport};

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub max_connection_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Limit on producing an offer for one attempt.
    pub offer_timeout: Duration,
    pub presence_interval: Duration,
    pub health_interval: Duration,
    /// Time a reconnection attempt waits before checking the outcome.
    pub settle_delay: Duration,
    pub reconnect: RetryConfig,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        LifecycleConfig {
            max_connection_attempts: 5,
            backoff_base: Duration::from_millis(1000),
            backoff_cap: Duration::from_millis(30_000),
            offer_timeout: Duration::from_secs(10),
            presence_interval: Duration::from_secs(10),
            health_interval: Duration::from_secs(5),
            settle_delay: Duration::from_secs(3),
            reconnect: RetryConfig::PEER,
        }
    }
}

impl LifecycleConfig {
    /// Wait after failed attempt `attempt`: `base * attempt^2`, capped.
    pub fn attempt_backoff(&self, attempt: u32) -> Duration {
        let factor = attempt.saturating_mul(attempt);
        self.backoff_base.saturating_mul(factor).min(self.backoff_cap)
    }
}

struct LifecycleState {
    current_peer: Option<String>,
    chat_open: bool,
    state: ConnectionState,
    status: LinkStatus,
    attempt: u32,
    attempt_in_flight: bool,
    presence_task: Option<JoinHandle<()>>,
    health_task: Option<JoinHandle<()>>,
}

struct LifecycleInner {
    user_id: String,
    signaling: SignalingTransport,
    engine: NegotiationEngine,
    config: LifecycleConfig,
    state: Mutex<LifecycleState>,
    reconnection: ReconnectionManager,
    statuses: Arc<EventBus<LinkStatus>>,
    engine_subscription: Mutex<Option<SubscriptionId>>,
}

#[derive(Clone)]
pub struct ConnectionLifecycle {
    inner: Arc<LifecycleInner>,
}

impl ConnectionLifecycle {
    pub fn new(
        user_id: impl Into<String>,
        signaling: SignalingTransport,
        engine: NegotiationEngine,
        config: LifecycleConfig,
    ) -> Self {
        let lifecycle = ConnectionLifecycle {
            inner: Arc::new(LifecycleInner {
                user_id: user_id.into(),
                signaling,
                engine,
                config,
                state: Mutex::new(LifecycleState {
                    current_peer: None,
                    chat_open: false,
                    state: ConnectionState::Disconnected,
                    status: LinkStatus::Disconnected,
                    attempt: 0,
                    attempt_in_flight: false,
                    presence_task: None,
                    health_task: None,
                }),
                reconnection: ReconnectionManager::new(),
                statuses: Arc::new(EventBus::new()),
                engine_subscription: Mutex::new(None),
            }),
        };

        let weak = Arc::downgrade(&lifecycle.inner);
        let id = lifecycle
            .inner
            .engine
            .state_changes()
            .subscribe(move |state: &PeerConnectionState| {
                if let Some(inner) = weak.upgrade() {
                    ConnectionLifecycle { inner }.on_engine_state(*state);
                }
            });
        if let Ok(mut slot) = lifecycle.inner.engine_subscription.lock() {
            *slot = Some(id);
        }
        lifecycle
    }

    /// Coarse status changes, emitted only when the status actually changes.
    pub fn status_changes(&self) -> &Arc<EventBus<LinkStatus>> {
        &self.inner.statuses
    }

    pub fn status(&self) -> LinkStatus {
        self.lock_state().map(|s| s.status).unwrap_or(LinkStatus::Disconnected)
    }

    pub fn state(&self) -> ConnectionState {
        self.lock_state().map(|s| s.state).unwrap_or(ConnectionState::Disconnected)
    }

    pub fn current_peer(&self) -> Option<String> {
        self.lock_state().and_then(|s| s.current_peer.clone())
    }

    pub fn is_chat_open(&self) -> bool {
        self.lock_state().map(|s| s.chat_open).unwrap_or(false)
    }

    pub fn is_reconnecting(&self) -> bool {
        self.inner.reconnection.is_reconnecting()
    }

    /// Try to establish a connection to `peer`, retrying offer creation with
    /// quadratic backoff. Does nothing if a connection to `peer` is up or
    /// under way, or if another negotiation is in progress.
    pub async fn connect_to_peer(&self, peer: &str) {
        let engine = &self.inner.engine;
        let engine_state = engine.connection_state();
        if engine.remote_peer().as_deref() == Some(peer)
            && matches!(engine_state, PeerConnectionState::Connected | PeerConnectionState::Connecting)
        {
            debug!("Already {} to {}, not connecting again", engine_state, peer);
            return;
        }
        let signaling_state = engine.signaling_state();
        if signaling_state != SignalingState::Stable {
            debug!("Negotiation in progress ({:?}), not starting another", signaling_state);
            return;
        }
        let reconnecting = {
            let Some(mut state) = self.lock_state() else { return };
            if state.attempt_in_flight {
                debug!("Connection attempt already running");
                return;
            }
            state.attempt_in_flight = true;
            state.current_peer = Some(peer.to_string());
            state.attempt = 0;
            state.state == ConnectionState::Reconnecting
        };
        if !reconnecting {
            self.set_state(ConnectionState::Connecting);
        }

        self.run_attempts(peer).await;

        if let Some(mut state) = self.lock_state() {
            state.attempt_in_flight = false;
        }
    }

    async fn run_attempts(&self, peer: &str) {
        let config = &self.inner.config;
        let max = config.max_connection_attempts;
        loop {
            // The peer's own offer may have connected us during the backoff
            if self.inner.engine.remote_peer().as_deref() == Some(peer)
                && self.inner.engine.connection_state() == PeerConnectionState::Connected
            {
                debug!("Connected to {} by the remote side, stopping attempts", peer);
                return;
            }
            let attempt = match self.lock_state() {
                Some(mut state) => {
                    state.attempt += 1;
                    state.attempt
                }
                None => return,
            };
            info!("Connecting to {} (attempt {}/{})", peer, attempt, max);

            let engine = self.inner.engine.clone();
            let target = peer.to_string();
            let created = with_timeout(
                async move { engine.create_offer(&target).await },
                config.offer_timeout,
                "Create offer",
            )
            .await;
            let failure = match created {
                Ok(Ok(offer)) => {
                    let message = SignalingMessage::Offer {
                        from: self.inner.user_id.clone(),
                        to: peer.to_string(),
                        sdp: offer,
                    };
                    self.inner.signaling.send(message, peer).await;
                    debug!("Offer sent to {}", peer);
                    return;
                }
                Ok(Err(e)) => e.to_string(),
                Err(e) => e.to_string(),
            };

            warn!("Connection attempt {}/{} to {} failed: {}", attempt, max, peer, failure);
            if attempt >= max {
                error!("Could not connect to {} after {} attempts", peer, attempt);
                self.set_state(ConnectionState::Failed);
                return;
            }
            self.set_state(ConnectionState::Reconnecting);
            tokio::time::sleep(config.attempt_backoff(attempt)).await;
            if !self.is_active_peer(peer) {
                info!("Chat with {} closed, abandoning connection attempts", peer);
                return;
            }
        }
    }

    /// Open or close the chat with `peer`. Opening starts the presence
    /// heartbeat and health check; closing stops everything, tells the peer
    /// and tears the connection down.
    pub async fn set_chat_opened(&self, peer: &str, opened: bool) {
        if opened {
            if let Some(mut state) = self.lock_state() {
                state.chat_open = true;
                state.current_peer = Some(peer.to_string());
            }
            info!("Chat with {} opened", peer);
            self.start_presence(peer.to_string());
            self.start_health_check();
            return;
        }

        let tasks = match self.lock_state() {
            Some(mut state) => {
                state.chat_open = false;
                [state.presence_task.take(), state.health_task.take()]
            }
            None => return,
        };
        for task in tasks.into_iter().flatten() {
            task.abort();
        }
        self.inner.reconnection.cancel();

        let presence = SignalingMessage::ChatPresence {
            from: self.inner.user_id.clone(),
            to: peer.to_string(),
            is_opened: false,
        };
        self.inner.signaling.send(presence, peer).await;
        self.inner.engine.close().await;

        if let Some(mut state) = self.lock_state() {
            state.current_peer = None;
            state.attempt = 0;
        }
        self.set_state(ConnectionState::Disconnected);
        info!("Chat with {} closed", peer);
    }

    /// Stop timers and any reconnection loop.
    pub fn dispose(&self) {
        let tasks = match self.lock_state() {
            Some(mut state) => {
                state.chat_open = false;
                [state.presence_task.take(), state.health_task.take()]
            }
            None => return,
        };
        for task in tasks.into_iter().flatten() {
            task.abort();
        }
        self.inner.reconnection.cancel();
        let subscription = self.inner.engine_subscription.lock().ok().and_then(|mut s| s.take());
        if let Some(id) = subscription {
            self.inner.engine.state_changes().unsubscribe(id);
        }
    }

    fn start_presence(&self, peer: String) {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.presence_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(lifecycle) = upgrade(&weak) else { break };
                if !lifecycle.is_active_peer(&peer) {
                    debug!("Stopping presence heartbeat for {}", peer);
                    break;
                }
                let presence = SignalingMessage::ChatPresence {
                    from: lifecycle.inner.user_id.clone(),
                    to: peer.clone(),
                    is_opened: true,
                };
                lifecycle.inner.signaling.send(presence, &peer).await;
            }
        });
        if let Some(mut state) = self.lock_state() {
            if let Some(old) = state.presence_task.replace(task) {
                old.abort();
            }
        }
    }

    fn start_health_check(&self) {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.health_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(lifecycle) = upgrade(&weak) else { break };
                if !lifecycle.is_chat_open() || lifecycle.current_peer().is_none() {
                    break;
                }
                let engine_state = lifecycle.inner.engine.connection_state();
                let unhealthy = matches!(
                    engine_state,
                    PeerConnectionState::Disconnected | PeerConnectionState::Failed
                );
                if unhealthy && lifecycle.state() != ConnectionState::Reconnecting && !lifecycle.is_reconnecting() {
                    warn!("Health check found connection {}, reconnecting", engine_state);
                    lifecycle.trigger_reconnection();
                }
            }
        });
        if let Some(mut state) = self.lock_state() {
            if let Some(old) = state.health_task.replace(task) {
                old.abort();
            }
        }
    }

    fn trigger_reconnection(&self) {
        let peer = match self.lock_state() {
            Some(state) if state.chat_open => state.current_peer.clone(),
            _ => None,
        };
        let Some(peer) = peer else { return };
        if self.inner.reconnection.is_reconnecting() {
            return;
        }
        self.set_state(ConnectionState::Reconnecting);

        let lifecycle = self.clone();
        tokio::spawn(async move {
            let connect = lifecycle.clone();
            let attempt_status = lifecycle.clone();
            let success_status = lifecycle.clone();
            let give_up_status = lifecycle.clone();
            let target = peer.clone();
            let reconnected = lifecycle
                .inner
                .reconnection
                .reconnect_with_backoff(
                    lifecycle.inner.config.reconnect,
                    move || {
                        let lifecycle = connect.clone();
                        let peer = target.clone();
                        async move { lifecycle.reconnect_once(&peer).await }
                    },
                    ReconnectHooks::new()
                        .on_attempt(move |attempt, _| attempt_status.emit_status(LinkStatus::Reconnecting(Some(attempt))))
                        .on_success(move || success_status.set_state(ConnectionState::Connected))
                        .on_give_up(move |_| give_up_status.set_state(ConnectionState::Failed)),
                )
                .await;
            debug!("Reconnection to {} finished (connected: {})", peer, reconnected);
        });
    }

    async fn reconnect_once(&self, peer: &str) -> bool {
        if !self.is_active_peer(peer) {
            return false;
        }
        self.inner.engine.close().await;
        self.connect_to_peer(peer).await;
        tokio::time::sleep(self.inner.config.settle_delay).await;
        self.inner.engine.connection_state() == PeerConnectionState::Connected
    }

    fn on_engine_state(&self, engine_state: PeerConnectionState) {
        let reconnecting = self.inner.reconnection.is_reconnecting() || self.state() == ConnectionState::Reconnecting;
        match engine_state {
            PeerConnectionState::Connected => {
                if let Some(mut state) = self.lock_state() {
                    state.attempt = 0;
                }
                self.set_state(ConnectionState::Connected);
            }
            PeerConnectionState::Connecting => {
                if self.state() == ConnectionState::Disconnected {
                    self.set_state(ConnectionState::Connecting);
                }
            }
            PeerConnectionState::Disconnected | PeerConnectionState::Closed => {
                if !reconnecting {
                    self.set_state(ConnectionState::Disconnected);
                }
            }
            PeerConnectionState::Failed => {
                if !reconnecting {
                    self.set_state(ConnectionState::Failed);
                }
                if self.is_chat_open() {
                    self.trigger_reconnection();
                }
            }
            PeerConnectionState::New => {}
        }
    }

    fn is_active_peer(&self, peer: &str) -> bool {
        self.lock_state()
            .map(|s| s.chat_open && s.current_peer.as_deref() == Some(peer))
            .unwrap_or(false)
    }

    fn set_state(&self, next: ConnectionState) {
        if let Some(mut state) = self.lock_state() {
            state.state = next;
        }
        self.emit_status(next.into());
    }

    fn emit_status(&self, status: LinkStatus) {
        let changed = match self.lock_state() {
            Some(mut state) if state.status != status => {
                state.status = status;
                true
            }
            _ => false,
        };
        if changed {
            info!("Connection status: {}", status);
            self.inner.statuses.emit(&status);
        }
    }

    fn lock_state(&self) -> Option<MutexGuard<'_, LifecycleState>> {
        match self.inner.state.lock() {
            Ok(guard) => Some(guard),
            Err(e) => {
                error!("Lifecycle state lock poisoned: {}", e);
                None
            }
        }
    }
}

fn upgrade(weak: &Weak<LifecycleInner>) -> Option<ConnectionLifecycle> {
    weak.upgrade().map(|inner| ConnectionLifecycle { inner })
}
