// Peer negotiation engine.
//
// Owns the single peer connection, drives offer/answer exchange, buffers
// remote ICE candidates until a remote description exists, resolves offer
// collisions (glare), retries remote descriptions that hit stale signaling
// state, and restarts ICE a bounded number of times.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::task::JoinHandle;

use crate::events::EventBus;
use crate::retry::{retry, RetryConfig, RetryHooks};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};

use super::{
    IceConnectionState, PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent, RtcError,
    SignalingState, DATA_CHANNEL_LABEL,
};

#[derive(Debug, Clone)]
pub struct NegotiationConfig {
    /// Time allowed from offer creation to `Connected`.
    pub connection_timeout: Duration,
    /// How long ICE may stay disconnected before a restart.
    pub disconnect_grace: Duration,
    pub max_ice_restarts: u32,
    pub remote_description_retry: RetryConfig,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        NegotiationConfig {
            connection_timeout: Duration::from_secs(30),
            disconnect_grace: Duration::from_secs(5),
            max_ice_restarts: 3,
            remote_description_retry: RetryConfig::PEER,
        }
    }
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("No active peer connection")]
    NoConnection,
    #[error("Peer connection is {0}, not connected")]
    NotConnected(PeerConnectionState),
    #[error("Failed to set remote {kind} after {attempts} attempt(s): {source}")]
    RemoteDescription {
        kind: &'static str,
        attempts: u32,
        #[source]
        source: RtcError,
    },
    #[error(transparent)]
    Rtc(#[from] RtcError),
}

#[derive(Default)]
struct EngineState {
    connection: Option<Arc<dyn PeerConnection>>,
    generation: u64,
    remote_peer: Option<String>,
    /// Whether our side sent the offer for the current connection.
    is_offerer: bool,
    pending_candidates: Vec<IceCandidate>,
    ice_restart_attempts: u32,
    restart_pending: bool,
    closing: bool,
    connection_timer: Option<JoinHandle<()>>,
    disconnect_timer: Option<JoinHandle<()>>,
}

struct EngineInner {
    local_id: String,
    factory: Arc<dyn PeerConnectionFactory>,
    config: NegotiationConfig,
    state: Mutex<EngineState>,
    // Serialises negotiation steps; never taken by close() or send()
    ops: TokioMutex<()>,
    states: Arc<EventBus<PeerConnectionState>>,
    messages: Arc<EventBus<String>>,
    candidates: Arc<EventBus<(String, IceCandidate)>>,
    renegotiations: Arc<EventBus<(String, SessionDescription)>>,
}

#[derive(Clone)]
pub struct NegotiationEngine {
    inner: Arc<EngineInner>,
}

impl NegotiationEngine {
    pub fn new(local_id: impl Into<String>, factory: Arc<dyn PeerConnectionFactory>, config: NegotiationConfig) -> Self {
        NegotiationEngine {
            inner: Arc::new(EngineInner {
                local_id: local_id.into(),
                factory,
                config,
                state: Mutex::new(EngineState::default()),
                ops: TokioMutex::new(()),
                states: Arc::new(EventBus::new()),
                messages: Arc::new(EventBus::new()),
                candidates: Arc::new(EventBus::new()),
                renegotiations: Arc::new(EventBus::new()),
            }),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.inner.local_id
    }

    pub fn state_changes(&self) -> &Arc<EventBus<PeerConnectionState>> {
        &self.inner.states
    }

    /// Text received on the data channel.
    pub fn messages(&self) -> &Arc<EventBus<String>> {
        &self.inner.messages
    }

    /// Local ICE candidates, paired with the peer they must be relayed to.
    pub fn local_candidates(&self) -> &Arc<EventBus<(String, IceCandidate)>> {
        &self.inner.candidates
    }

    /// Fresh offers produced by an ICE restart, paired with their peer.
    pub fn renegotiations(&self) -> &Arc<EventBus<(String, SessionDescription)>> {
        &self.inner.renegotiations
    }

    pub fn connection_state(&self) -> PeerConnectionState {
        self.connection()
            .map(|pc| pc.connection_state())
            .unwrap_or(PeerConnectionState::Closed)
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.connection()
            .map(|pc| pc.signaling_state())
            .unwrap_or(SignalingState::Stable)
    }

    pub fn remote_peer(&self) -> Option<String> {
        self.lock_state().and_then(|s| s.remote_peer.clone())
    }

    pub fn pending_candidate_count(&self) -> usize {
        self.lock_state().map(|s| s.pending_candidates.len()).unwrap_or(0)
    }

    pub fn ice_restart_attempts(&self) -> u32 {
        self.lock_state().map(|s| s.ice_restart_attempts).unwrap_or(0)
    }

    /// Create the peer connection if there is none.
    pub async fn initialize(&self) -> Result<(), NegotiationError> {
        let _ops = self.inner.ops.lock().await;
        self.ensure_connection().await?;
        Ok(())
    }

    /// Open the data channel and produce a local offer for `peer`.
    pub async fn create_offer(&self, peer: &str) -> Result<SessionDescription, NegotiationError> {
        let _ops = self.inner.ops.lock().await;
        self.cancel_connection_timer();
        let pc = self.ensure_connection().await?;
        let generation = self.generation();
        if let Some(mut state) = self.lock_state() {
            state.remote_peer = Some(peer.to_string());
            state.is_offerer = true;
        }

        pc.open_data_channel(DATA_CHANNEL_LABEL).await?;
        let offer = pc.create_offer(false).await?;
        pc.set_local_description(offer.clone()).await?;
        if !self.is_current(generation) {
            debug!("Connection replaced while creating offer for {}", peer);
            return Err(NegotiationError::NoConnection);
        }
        self.start_connection_timer();
        info!("Created offer for {}", peer);
        Ok(offer)
    }

    /// Answer the remote offer currently applied.
    pub async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let _ops = self.inner.ops.lock().await;
        self.answer().await
    }

    /// Handle an inbound offer, resolving glare. Returns the answer to send,
    /// or `None` when the offer was discarded in favour of our own.
    pub async fn handle_remote_offer(
        &self,
        from: &str,
        offer: SessionDescription,
    ) -> Result<Option<SessionDescription>, NegotiationError> {
        let _ops = self.inner.ops.lock().await;
        let pc = self.ensure_connection().await?;

        if pc.signaling_state() == SignalingState::HaveLocalOffer {
            if self.inner.local_id.as_str() > from {
                info!("Offer collision with {}: keeping our own offer", from);
                return Ok(None);
            }
            info!("Offer collision with {}: rolling back our offer", from);
            pc.set_local_description(SessionDescription::rollback()).await?;
        }
        if let Some(mut state) = self.lock_state() {
            state.remote_peer = Some(from.to_string());
            state.is_offerer = false;
        }

        self.apply_remote(offer).await?;
        let answer = self.answer().await?;
        info!("Answered offer from {}", from);
        Ok(Some(answer))
    }

    /// Apply a remote answer to our outstanding offer.
    pub async fn handle_remote_answer(&self, answer: SessionDescription) -> Result<(), NegotiationError> {
        let _ops = self.inner.ops.lock().await;
        let pc = self.connection().ok_or(NegotiationError::NoConnection)?;
        let signaling = pc.signaling_state();
        if signaling != SignalingState::HaveLocalOffer {
            warn!("Ignoring answer received in signaling state {:?}", signaling);
            return Ok(());
        }
        self.apply_remote(answer).await
    }

    /// Apply a remote description. Offers that fail on stale signaling state are
    /// retried on a rebuilt connection.
    pub async fn set_remote_description(&self, description: SessionDescription) -> Result<(), NegotiationError> {
        let _ops = self.inner.ops.lock().await;
        self.ensure_connection().await?;
        self.apply_remote(description).await
    }

    /// Apply a remote candidate, or buffer it until a remote description exists.
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) {
        let _ops = self.inner.ops.lock().await;
        let ready = match self.connection() {
            Some(pc) => {
                if pc.has_remote_description().await {
                    Some(pc)
                } else {
                    None
                }
            }
            None => None,
        };
        match ready {
            Some(pc) => {
                if let Err(e) = pc.add_ice_candidate(candidate.clone()).await {
                    warn!("Failed to add ICE candidate, buffering it: {}", e);
                    self.buffer_candidate(candidate);
                }
            }
            None => {
                debug!("No remote description yet, buffering ICE candidate");
                self.buffer_candidate(candidate);
            }
        }
    }

    pub async fn send(&self, text: &str) -> Result<(), NegotiationError> {
        let pc = self.connection().ok_or(NegotiationError::NoConnection)?;
        let state = pc.connection_state();
        if state != PeerConnectionState::Connected {
            return Err(NegotiationError::NotConnected(state));
        }
        pc.send_text(text).await?;
        Ok(())
    }

    /// Attempt an ICE restart, at most `max_ice_restarts` times per connection.
    pub async fn restart_ice(&self) {
        let _ops = self.inner.ops.lock().await;
        let Some(pc) = self.connection() else {
            warn!("ICE restart requested without a peer connection");
            return;
        };

        let max = self.inner.config.max_ice_restarts;
        let (attempt, offerer, peer) = {
            let Some(mut state) = self.lock_state() else { return };
            state.restart_pending = false;
            if state.ice_restart_attempts >= max {
                drop(state);
                error!("ICE restart limit ({}) reached, giving up", max);
                self.inner.states.emit(&PeerConnectionState::Failed);
                return;
            }
            state.ice_restart_attempts += 1;
            (state.ice_restart_attempts, state.is_offerer, state.remote_peer.clone())
        };
        info!("ICE restart attempt {}/{}", attempt, max);

        match peer {
            Some(peer) if offerer && pc.signaling_state() == SignalingState::Stable => {
                match self.restart_offer(&pc).await {
                    Ok(offer) => self.inner.renegotiations.emit(&(peer, offer)),
                    Err(e) => warn!("Failed to create ICE restart offer: {}", e),
                }
            }
            _ => debug!("ICE restart left to the offering side"),
        }
        self.start_connection_timer();
    }

    /// Close the data channel and the connection. Idempotent.
    pub async fn close(&self) {
        let (pc, timers) = {
            let Some(mut state) = self.lock_state() else { return };
            if state.closing {
                debug!("Close already in progress");
                return;
            }
            state.closing = true;
            state.generation += 1;
            state.ice_restart_attempts = 0;
            state.restart_pending = false;
            state.pending_candidates.clear();
            state.remote_peer = None;
            state.is_offerer = false;
            (
                state.connection.take(),
                [state.connection_timer.take(), state.disconnect_timer.take()],
            )
        };
        for timer in timers.into_iter().flatten() {
            timer.abort();
        }
        if let Some(pc) = pc {
            if let Err(e) = pc.close().await {
                warn!("Error closing peer connection: {}", e);
            }
            info!("Peer connection closed");
        }
        if let Some(mut state) = self.lock_state() {
            state.closing = false;
        }
    }

    async fn answer(&self) -> Result<SessionDescription, NegotiationError> {
        let pc = self.connection().ok_or(NegotiationError::NoConnection)?;
        let answer = pc.create_answer().await?;
        pc.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    async fn restart_offer(&self, pc: &Arc<dyn PeerConnection>) -> Result<SessionDescription, RtcError> {
        let offer = pc.create_offer(true).await?;
        pc.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    async fn apply_remote(&self, description: SessionDescription) -> Result<(), NegotiationError> {
        let kind = description.kind;
        let label = match kind {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
            SdpKind::Pranswer => "pranswer",
            SdpKind::Rollback => "rollback",
        };

        let engine = self.clone();
        let outcome = retry(
            |attempt| {
                let engine = engine.clone();
                let description = description.clone();
                async move {
                    if attempt > 1 {
                        // Fresh connection, buffered candidates survive
                        engine.teardown_connection().await;
                        engine.create_connection().await?;
                    }
                    let pc = engine.connection().ok_or(RtcError::Closed)?;
                    pc.set_remote_description(description).await
                }
            },
            &self.inner.config.remote_description_retry,
            RetryHooks::new()
                .retry_if(move |e: &RtcError| kind == SdpKind::Offer && e.is_stale_state())
                .on_retry(move |attempt, e: &RtcError, delay| {
                    warn!(
                        "Setting remote {} failed on attempt {} ({}), rebuilding connection in {}ms",
                        label,
                        attempt,
                        e,
                        delay.as_millis()
                    );
                }),
        )
        .await;

        let attempts = outcome.attempts;
        match outcome.result {
            Ok(()) => {
                debug!("Remote {} applied", label);
                self.drain_candidates().await;
                Ok(())
            }
            Err(source) => Err(NegotiationError::RemoteDescription { kind: label, attempts, source }),
        }
    }

    async fn drain_candidates(&self) {
        let Some(pc) = self.connection() else { return };
        let pending: Vec<IceCandidate> = match self.lock_state() {
            Some(mut state) => std::mem::take(&mut state.pending_candidates),
            None => return,
        };
        if pending.is_empty() {
            return;
        }
        debug!("Applying {} buffered ICE candidates", pending.len());
        for candidate in pending {
            if let Err(e) = pc.add_ice_candidate(candidate.clone()).await {
                warn!("Buffered ICE candidate rejected, keeping it: {}", e);
                self.buffer_candidate(candidate);
            }
        }
    }

    fn buffer_candidate(&self, candidate: IceCandidate) {
        if let Some(mut state) = self.lock_state() {
            state.pending_candidates.push(candidate);
        }
    }

    async fn ensure_connection(&self) -> Result<Arc<dyn PeerConnection>, RtcError> {
        if let Some(pc) = self.connection() {
            match pc.connection_state() {
                PeerConnectionState::Failed | PeerConnectionState::Closed => {
                    debug!("Replacing {} peer connection", pc.connection_state());
                    self.teardown_connection().await;
                }
                _ => return Ok(pc),
            }
        }
        self.create_connection().await
    }

    async fn create_connection(&self) -> Result<Arc<dyn PeerConnection>, RtcError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let pc = self.inner.factory.create(tx).await?;
        let generation = {
            let mut state = self.lock_state().ok_or(RtcError::Closed)?;
            state.generation += 1;
            state.connection = Some(pc.clone());
            state.ice_restart_attempts = 0;
            state.restart_pending = false;
            state.generation
        };
        tokio::spawn(pump_events(Arc::downgrade(&self.inner), generation, rx));
        debug!("Peer connection created (generation {})", generation);
        Ok(pc)
    }

    /// Drop the current connection without touching buffered candidates or the
    /// remote peer. Events from the old connection are ignored from here on.
    async fn teardown_connection(&self) {
        let (pc, timers) = {
            let Some(mut state) = self.lock_state() else { return };
            state.generation += 1;
            (
                state.connection.take(),
                [state.connection_timer.take(), state.disconnect_timer.take()],
            )
        };
        for timer in timers.into_iter().flatten() {
            timer.abort();
        }
        if let Some(pc) = pc {
            if let Err(e) = pc.close().await {
                debug!("Error closing replaced connection: {}", e);
            }
        }
    }

    fn start_connection_timer(&self) {
        let generation = self.generation();
        let timeout = self.inner.config.connection_timeout;
        let weak = Arc::downgrade(&self.inner);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else { return };
            let engine = NegotiationEngine { inner };
            if !engine.is_current(generation) || engine.connection().is_none() {
                return;
            }
            if let Some(mut state) = engine.lock_state() {
                // Restarting below replaces this handle; don't let it abort us
                state.connection_timer.take();
            }
            if engine.connection_state() == PeerConnectionState::Connected {
                return;
            }
            warn!("Peer connection not established within {}s", timeout.as_secs());
            engine.inner.states.emit(&PeerConnectionState::Failed);
            engine.restart_ice().await;
        });
        if let Some(mut state) = self.lock_state() {
            if let Some(old) = state.connection_timer.replace(timer) {
                old.abort();
            }
        }
    }

    fn cancel_connection_timer(&self) {
        if let Some(timer) = self.lock_state().and_then(|mut s| s.connection_timer.take()) {
            timer.abort();
        }
    }

    fn schedule_restart(&self) {
        let schedule = match self.lock_state() {
            Some(mut state) if !state.restart_pending && !state.closing => {
                state.restart_pending = true;
                true
            }
            _ => false,
        };
        if schedule {
            let engine = self.clone();
            tokio::spawn(async move { engine.restart_ice().await });
        }
    }

    fn watch_ice_disconnect(&self, generation: u64) {
        let grace = self.inner.config.disconnect_grace;
        let weak = Arc::downgrade(&self.inner);
        let watch = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(inner) = weak.upgrade() else { return };
            let engine = NegotiationEngine { inner };
            if !engine.is_current(generation) {
                return;
            }
            let still_down = engine
                .connection()
                .map(|pc| pc.ice_connection_state() == IceConnectionState::Disconnected)
                .unwrap_or(false);
            if still_down {
                warn!("ICE still disconnected after {}s, restarting", grace.as_secs());
                engine.schedule_restart();
            }
        });
        if let Some(mut state) = self.lock_state() {
            if let Some(old) = state.disconnect_timer.replace(watch) {
                old.abort();
            }
        }
    }

    fn cancel_disconnect_watch(&self) {
        if let Some(watch) = self.lock_state().and_then(|mut s| s.disconnect_timer.take()) {
            watch.abort();
        }
    }

    fn handle_event(&self, generation: u64, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => match self.remote_peer() {
                Some(peer) => self.inner.candidates.emit(&(peer, candidate)),
                None => debug!("Dropping local ICE candidate, no remote peer"),
            },
            PeerEvent::ConnectionState(state) => {
                info!("Peer connection state: {}", state);
                match state {
                    PeerConnectionState::Connected => {
                        self.cancel_connection_timer();
                        self.cancel_disconnect_watch();
                        if let Some(mut s) = self.lock_state() {
                            s.ice_restart_attempts = 0;
                        }
                    }
                    PeerConnectionState::Failed => {
                        self.cancel_connection_timer();
                        self.schedule_restart();
                    }
                    _ => {}
                }
                self.inner.states.emit(&state);
            }
            PeerEvent::IceConnectionState(state) => {
                debug!("ICE connection state: {:?}", state);
                match state {
                    IceConnectionState::Failed => self.schedule_restart(),
                    IceConnectionState::Disconnected => self.watch_ice_disconnect(generation),
                    IceConnectionState::Connected | IceConnectionState::Completed => self.cancel_disconnect_watch(),
                    _ => {}
                }
            }
            PeerEvent::DataChannelOpen => info!("Data channel '{}' open", DATA_CHANNEL_LABEL),
            PeerEvent::DataChannelMessage(text) => self.inner.messages.emit(&text),
            PeerEvent::DataChannelClosed => {
                info!("Data channel '{}' closed", DATA_CHANNEL_LABEL);
                self.inner.states.emit(&PeerConnectionState::Disconnected);
            }
        }
    }

    fn connection(&self) -> Option<Arc<dyn PeerConnection>> {
        self.lock_state().and_then(|s| s.connection.clone())
    }

    fn generation(&self) -> u64 {
        self.lock_state().map(|s| s.generation).unwrap_or(0)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }

    fn lock_state(&self) -> Option<MutexGuard<'_, EngineState>> {
        match self.inner.state.lock() {
            Ok(guard) => Some(guard),
            Err(e) => {
                error!("Negotiation state lock poisoned: {}", e);
                None
            }
        }
    }
}

async fn pump_events(inner: Weak<EngineInner>, generation: u64, mut events: mpsc::UnboundedReceiver<PeerEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        let engine = NegotiationEngine { inner };
        if !engine.is_current(generation) {
            debug!("Stopping event pump of replaced connection (generation {})", generation);
            break;
        }
        engine.handle_event(generation, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timings() {
        let config = NegotiationConfig::default();
        assert_eq!(config.connection_timeout, Duration::from_secs(30));
        assert_eq!(config.disconnect_grace, Duration::from_secs(5));
        assert_eq!(config.max_ice_restarts, 3);
        assert_eq!(config.remote_description_retry, RetryConfig::PEER);
    }

    #[test]
    fn remote_description_error_names_the_kind() {
        let e = NegotiationError::RemoteDescription {
            kind: "offer",
            attempts: 3,
            source: RtcError::InvalidState("have-local-offer".into()),
        };
        assert_eq!(
            e.to_string(),
            "Failed to set remote offer after 3 attempt(s): Invalid signaling state: have-local-offer"
        );
    }
}
