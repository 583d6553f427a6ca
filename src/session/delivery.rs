// Outbound message delivery over the data channel, with persistence,
// bounded retries and a flush of pending messages once the peer is reachable.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::events::{EventBus, SubscriptionId};
use crate::models::{DeliveryStatus, Message};
use crate::rtc::{NegotiationEngine, PeerConnectionState};
use crate::storage::MessageRepository;

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Send attempts per message before it is marked failed.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        DeliveryConfig {
            max_attempts: 3,
            backoff_base: Duration::from_millis(1000),
            backoff_cap: Duration::from_millis(15_000),
        }
    }
}

impl DeliveryConfig {
    /// Wait after the `failures`-th failed send: `base * failures^2`, capped.
    pub fn retry_delay(&self, failures: u32) -> Duration {
        self.backoff_base
            .saturating_mul(failures.saturating_mul(failures))
            .min(self.backoff_cap)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum DeliveryError {
    #[error("No chat peer selected")]
    NoActivePeer,
    #[error("Cannot send an empty message")]
    EmptyMessage,
}

#[derive(Default)]
struct PipelineState {
    peer_id: Option<String>,
    // Bumped on every peer switch; retry timers from older epochs do nothing
    epoch: u64,
    failures: HashMap<String, u32>,
    in_flight: HashSet<String>,
    retry_timers: HashMap<String, JoinHandle<()>>,
}

struct PipelineInner {
    user_id: String,
    engine: NegotiationEngine,
    repository: Arc<dyn MessageRepository>,
    config: DeliveryConfig,
    state: Mutex<PipelineState>,
    updates: Arc<EventBus<Message>>,
    statuses: Arc<EventBus<(String, DeliveryStatus)>>,
    inbound_subscription: Mutex<Option<SubscriptionId>>,
}

#[derive(Clone)]
pub struct MessagePipeline {
    inner: Arc<PipelineInner>,
}

impl MessagePipeline {
    pub fn new(
        user_id: impl Into<String>,
        engine: NegotiationEngine,
        repository: Arc<dyn MessageRepository>,
        config: DeliveryConfig,
    ) -> Self {
        let pipeline = MessagePipeline {
            inner: Arc::new(PipelineInner {
                user_id: user_id.into(),
                engine,
                repository,
                config,
                state: Mutex::new(PipelineState::default()),
                updates: Arc::new(EventBus::new()),
                statuses: Arc::new(EventBus::new()),
                inbound_subscription: Mutex::new(None),
            }),
        };

        let weak = Arc::downgrade(&pipeline.inner);
        let id = pipeline.inner.engine.messages().subscribe(move |text: &String| {
            if let Some(inner) = weak.upgrade() {
                MessagePipeline { inner }.handle_inbound(text);
            }
        });
        if let Ok(mut slot) = pipeline.inner.inbound_subscription.lock() {
            *slot = Some(id);
        }
        pipeline
    }

    /// New messages (both directions) and every status change of an outbound
    /// message, carrying the message as it now stands.
    pub fn updates(&self) -> &Arc<EventBus<Message>> {
        &self.inner.updates
    }

    /// `(message id, new status)` for outbound messages.
    pub fn status_changes(&self) -> &Arc<EventBus<(String, DeliveryStatus)>> {
        &self.inner.statuses
    }

    pub fn current_peer(&self) -> Option<String> {
        self.lock_state().and_then(|s| s.peer_id.clone())
    }

    /// Make `peer` the conversation outbound messages go to. Switching peers
    /// cancels retries scheduled for the previous one.
    pub fn set_current_peer(&self, peer: &str) {
        let timers = {
            let Some(mut state) = self.lock_state() else { return };
            if state.peer_id.as_deref() == Some(peer) {
                return;
            }
            state.peer_id = Some(peer.to_string());
            state.epoch += 1;
            state.failures.clear();
            state.in_flight.clear();
            std::mem::take(&mut state.retry_timers)
        };
        for (id, timer) in timers {
            debug!("Cancelling retry of message {}", id);
            timer.abort();
        }
        debug!("Delivery peer is now {}", peer);
    }

    pub fn get_messages(&self, peer: &str) -> Vec<Message> {
        self.inner.repository.get_messages(&self.inner.user_id, peer)
    }

    /// Persist a new message to the current peer as pending, then try to send
    /// it. The message is returned whether or not the first send worked.
    pub async fn send_message(&self, content: &str) -> Result<Message, DeliveryError> {
        if content.trim().is_empty() {
            return Err(DeliveryError::EmptyMessage);
        }
        let peer = self.current_peer().ok_or(DeliveryError::NoActivePeer)?;
        let message = Message {
            id: Uuid::new_v4().to_string(),
            sender_id: self.inner.user_id.clone(),
            receiver_id: peer.clone(),
            content: content.to_string(),
            timestamp: Utc::now(),
            status: DeliveryStatus::Pending,
        };
        self.inner.repository.save_message(&self.inner.user_id, &peer, &message);
        self.inner.updates.emit(&message);

        self.attempt_delivery(message.clone()).await;
        Ok(message)
    }

    /// Try every pending message of the current conversation once.
    pub async fn flush_pending_messages(&self) {
        let Some(peer) = self.current_peer() else { return };
        let pending = self.inner.repository.get_pending_messages(&self.inner.user_id, &peer);
        if pending.is_empty() {
            return;
        }
        info!("Flushing {} pending message(s) to {}", pending.len(), peer);
        for message in pending {
            self.attempt_delivery(message).await;
        }
    }

    /// Cancel retry timers and stop listening for inbound messages.
    pub fn dispose(&self) {
        let timers = match self.lock_state() {
            Some(mut state) => {
                state.epoch += 1;
                std::mem::take(&mut state.retry_timers)
            }
            None => return,
        };
        for timer in timers.into_values() {
            timer.abort();
        }
        let subscription = self.inner.inbound_subscription.lock().ok().and_then(|mut s| s.take());
        if let Some(id) = subscription {
            self.inner.engine.messages().unsubscribe(id);
        }
    }

    // Boxed because a failed attempt schedules a timer that re-enters here
    fn attempt_delivery(&self, message: Message) -> BoxFuture<'static, ()> {
        let pipeline = self.clone();
        async move {
            {
                let Some(mut state) = pipeline.lock_state() else { return };
                if state.retry_timers.contains_key(&message.id) || state.in_flight.contains(&message.id) {
                    debug!("Message {} already has a delivery under way", message.id);
                    return;
                }
                state.in_flight.insert(message.id.clone());
            }

            let engine_state = pipeline.inner.engine.connection_state();
            if engine_state != PeerConnectionState::Connected {
                debug!("Peer is {}, message {} stays pending", engine_state, message.id);
                // Not a failure: the count so far carries over to the next try
                if let Some(mut state) = pipeline.lock_state() {
                    state.in_flight.remove(&message.id);
                }
                return;
            }

            match pipeline.inner.engine.send(&message.content).await {
                Ok(()) => {
                    pipeline.finish(&message.id);
                    pipeline.mark(&message, DeliveryStatus::Sent);
                }
                Err(e) => {
                    warn!("Sending message {} failed: {}", message.id, e);
                    pipeline.handle_failure(message);
                }
            }
        }
        .boxed()
    }

    fn handle_failure(&self, message: Message) {
        let (failures, epoch) = {
            let Some(mut state) = self.lock_state() else { return };
            state.in_flight.remove(&message.id);
            let failures = state.failures.entry(message.id.clone()).or_insert(0);
            *failures += 1;
            (*failures, state.epoch)
        };

        if failures >= self.inner.config.max_attempts {
            error!("Giving up on message {} after {} attempts", message.id, failures);
            self.finish(&message.id);
            self.mark(&message, DeliveryStatus::Failed);
            return;
        }

        let delay = self.inner.config.retry_delay(failures);
        debug!("Retrying message {} in {}ms", message.id, delay.as_millis());
        let pipeline = self.clone();
        let id = message.id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let Some(mut state) = pipeline.lock_state() else { return };
                if state.epoch != epoch {
                    return;
                }
                state.retry_timers.remove(&message.id);
            }
            pipeline.attempt_delivery(message).await;
        });
        if let Some(mut state) = self.lock_state() {
            if state.epoch == epoch {
                if let Some(old) = state.retry_timers.insert(id, timer) {
                    old.abort();
                }
            } else {
                timer.abort();
            }
        }
    }

    fn finish(&self, message_id: &str) {
        if let Some(mut state) = self.lock_state() {
            state.in_flight.remove(message_id);
            state.failures.remove(message_id);
        }
    }

    fn mark(&self, message: &Message, status: DeliveryStatus) {
        let peer = message.peer_of(&self.inner.user_id);
        if !self
            .inner
            .repository
            .update_message_status(&self.inner.user_id, peer, &message.id, status)
        {
            return;
        }
        debug!("Message {} is now {:?}", message.id, status);
        let mut updated = message.clone();
        updated.status = status;
        self.inner.updates.emit(&updated);
        self.inner.statuses.emit(&(message.id.clone(), status));
    }

    fn handle_inbound(&self, text: &str) {
        let Some(peer) = self.inner.engine.remote_peer().or_else(|| self.current_peer()) else {
            warn!("Dropping data channel message with no known sender");
            return;
        };
        let message = Message {
            id: Uuid::new_v4().to_string(),
            sender_id: peer.clone(),
            receiver_id: self.inner.user_id.clone(),
            content: text.to_string(),
            timestamp: Utc::now(),
            status: DeliveryStatus::Delivered,
        };
        self.inner.repository.save_message(&self.inner.user_id, &peer, &message);
        debug!("Received message {} from {}", message.id, peer);
        self.inner.updates.emit(&message);
    }

    fn lock_state(&self) -> Option<MutexGuard<'_, PipelineState>> {
        match self.inner.state.lock() {
            Ok(guard) => Some(guard),
            Err(e) => {
                error!("Delivery state lock poisoned: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_is_quadratic_and_capped() {
        let config = DeliveryConfig::default();
        assert_eq!(config.retry_delay(1), Duration::from_millis(1000));
        assert_eq!(config.retry_delay(2), Duration::from_millis(4000));
        assert_eq!(config.retry_delay(3), Duration::from_millis(9000));
        assert_eq!(config.retry_delay(5), Duration::from_millis(15_000));
    }
}
