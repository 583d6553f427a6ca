// MQTT broker backend built on rumqttc.
//
// The event loop is polled on its own task. The library's own reconnect is
// never used: the first connection error ends the session and is reported as
// `BrokerEvent::Closed`, leaving reconnection to the transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{BrokerConnector, BrokerError, BrokerEvent, BrokerSession};

pub const DEFAULT_BROKER_HOST: &str = "broker.hivemq.com";
pub const DEFAULT_BROKER_PORT: u16 = 1883;

#[derive(Debug, Clone)]
pub struct MqttConnector {
    host: String,
    port: u16,
    keep_alive: Duration,
    connect_timeout: Duration,
}

impl MqttConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        MqttConnector {
            host: host.into(),
            port,
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }
}

impl Default for MqttConnector {
    fn default() -> Self {
        MqttConnector::new(DEFAULT_BROKER_HOST, DEFAULT_BROKER_PORT)
    }
}

#[async_trait]
impl BrokerConnector for MqttConnector {
    async fn open(
        &self,
        client_id: &str,
        events: mpsc::UnboundedSender<BrokerEvent>,
    ) -> Result<Arc<dyn BrokerSession>, BrokerError> {
        info!("Connecting to MQTT broker {}:{} as {}", self.host, self.port, client_id);
        let mut options = MqttOptions::new(client_id, self.host.clone(), self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(options, 64);
        let connected = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = oneshot::channel();
        let poller = tokio::spawn(poll_events(eventloop, events, connected.clone(), ready_tx));

        match tokio::time::timeout(self.connect_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {
                debug!("MQTT session established for {}", client_id);
                Ok(Arc::new(MqttSession {
                    client,
                    connected,
                    poller: Mutex::new(Some(poller)),
                }))
            }
            Ok(Ok(Err(reason))) => {
                poller.abort();
                Err(BrokerError::Unreachable(reason))
            }
            Ok(Err(_)) => {
                poller.abort();
                Err(BrokerError::Unreachable("event loop ended before connecting".to_string()))
            }
            Err(_) => {
                poller.abort();
                Err(BrokerError::Unreachable(format!(
                    "no CONNACK within {}ms",
                    self.connect_timeout.as_millis()
                )))
            }
        }
    }
}

async fn poll_events(
    mut eventloop: EventLoop,
    events: mpsc::UnboundedSender<BrokerEvent>,
    connected: Arc<AtomicBool>,
    ready: oneshot::Sender<Result<(), String>>,
) {
    let mut ready = Some(ready);
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                connected.store(true, Ordering::SeqCst);
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Ok(()));
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let event = BrokerEvent::Message {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                };
                if events.send(event).is_err() {
                    debug!("Broker event receiver dropped, stopping MQTT poller");
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => {
                connected.store(false, Ordering::SeqCst);
                match ready.take() {
                    Some(ready) => {
                        let _ = ready.send(Err(e.to_string()));
                    }
                    None => {
                        warn!("MQTT connection lost: {}", e);
                        let _ = events.send(BrokerEvent::Closed);
                    }
                }
                break;
            }
        }
    }
}

struct MqttSession {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl BrokerSession for MqttSession {
    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| BrokerError::Subscribe(e.to_string()))
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::Closed);
        }
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Err(e) = self.client.disconnect().await {
            debug!("MQTT disconnect: {}", e);
        }
        let poller = self.poller.lock().ok().and_then(|mut p| p.take());
        if let Some(poller) = poller {
            // Give the DISCONNECT packet a moment to leave before stopping the loop
            tokio::time::sleep(Duration::from_millis(50)).await;
            poller.abort();
        }
    }
}
