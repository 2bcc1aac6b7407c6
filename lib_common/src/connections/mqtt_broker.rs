//! # MQTT Broker Connection
//!
//! The bridge's only link to the displays. Built on `rumqttc`:
//!
//! - [`connect`] opens the session and waits for the broker's CONNACK. Failing
//!   that is fatal for the server.
//! - [`MqttPublisher`] implements the core [`Publisher`] over the client handle.
//! - [`MqttConnection::run`] drives the event loop: it feeds presence messages
//!   to the [`Coordinator`], re-establishes the session after errors and, on
//!   shutdown, leaves a retained `DEAD` status behind before disconnecting.
//!
//! Every CONNACK (the first one and each reconnect) publishes a retained
//! `ALIVE` status and re-subscribes to the presence filter. The broker holds a
//! retained `DEAD` last will for the case where the process dies without a
//! clean disconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::broadcast;
use url::Url;

use crate::core::coordinator::Coordinator;
use crate::core::error::{PublishError, TransportConnectError};
use crate::core::publisher::{DeliveryQos, Publisher};
use crate::core::topics::TopicScheme;

/// Status payload while the server is up.
pub const STATUS_ALIVE: &str = "ALIVE";
/// Status payload after shutdown, also registered as the last will.
pub const STATUS_DEAD: &str = "DEAD";

const DEFAULT_PORT: u16 = 1883;
const REQUEST_CAPACITY: usize = 64;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

/// Everything needed to open the broker session.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    /// `tcp://host:port` or `mqtt://host:port`.
    pub broker_url: String,
    pub client_id: String,
    pub connect_timeout: Duration,
    pub keep_alive: Duration,
    pub topics: TopicScheme,
}

impl MqttSettings {
    pub fn new(broker_url: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            broker_url: broker_url.into(),
            client_id: client_id.into(),
            connect_timeout: Duration::from_secs(10),
            keep_alive: Duration::from_secs(30),
            topics: TopicScheme::default(),
        }
    }
}

/// Splits a broker URL into host and port.
pub fn parse_broker_url(broker_url: &str) -> Result<(String, u16), TransportConnectError> {
    let invalid = |reason: &str| TransportConnectError::InvalidAddress {
        address: broker_url.to_string(),
        reason: reason.to_string(),
    };

    let url = Url::parse(broker_url).map_err(|e| invalid(&e.to_string()))?;
    match url.scheme() {
        "tcp" | "mqtt" => {}
        other => return Err(invalid(&format!("unsupported scheme '{other}'"))),
    }
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| invalid("missing host"))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    Ok((host, url.port().unwrap_or(DEFAULT_PORT)))
}

fn to_qos(qos: DeliveryQos) -> QoS {
    match qos {
        DeliveryQos::AtMostOnce => QoS::AtMostOnce,
        DeliveryQos::AtLeastOnce => QoS::AtLeastOnce,
        DeliveryQos::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// [`Publisher`] backed by the live broker session.
///
/// Publishes fail fast while the session is down instead of queueing behind a
/// reconnect.
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: DeliveryQos, retain: bool) -> Result<(), PublishError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(PublishError::new(topic, "not connected to broker"));
        }
        self.client
            .try_publish(topic, to_qos(qos), retain, payload)
            .map_err(|e| PublishError::new(topic, e))
    }
}

/// An established session. Hand its publisher to the coordinator, then
/// [`run`](MqttConnection::run) it on its own task.
pub struct MqttConnection {
    client: AsyncClient,
    eventloop: EventLoop,
    settings: MqttSettings,
    address: String,
    connected: Arc<AtomicBool>,
}

/// # Connect
///
/// Opens the broker session and waits up to `connect_timeout` for CONNACK.
/// On success the status is already `ALIVE` and presence is subscribed.
pub async fn connect(settings: MqttSettings) -> Result<MqttConnection, TransportConnectError> {
    let (host, port) = parse_broker_url(&settings.broker_url)?;
    let address = format!("{host}:{port}");

    let mut options = MqttOptions::new(settings.client_id.clone(), host, port);
    options.set_keep_alive(settings.keep_alive);
    options.set_clean_session(true);
    options.set_last_will(LastWill::new(
        settings.topics.status_topic.clone(),
        STATUS_DEAD,
        QoS::AtLeastOnce,
        true,
    ));

    let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
    tracing::info!(broker = %address, client_id = %settings.client_id, "connecting to MQTT broker");

    let handshake = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                Ok(_) => continue,
                Err(e) => {
                    return Err(TransportConnectError::Connection {
                        address: address.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    };
    match tokio::time::timeout(settings.connect_timeout, handshake).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(TransportConnectError::Timeout {
                address,
                seconds: settings.connect_timeout.as_secs(),
            });
        }
    }

    let connection = MqttConnection {
        client,
        eventloop,
        settings,
        address,
        connected: Arc::new(AtomicBool::new(true)),
    };
    connection.on_connected()?;
    tracing::info!(broker = %connection.address, "connected to MQTT broker");
    Ok(connection)
}

impl MqttConnection {
    pub fn publisher(&self) -> MqttPublisher {
        MqttPublisher {
            client: self.client.clone(),
            connected: Arc::clone(&self.connected),
        }
    }

    /// Shared flag that is set while a session is established.
    pub fn connected_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.connected)
    }

    /// Announces ALIVE and (re)subscribes to presence. Queued without
    /// awaiting; the event loop flushes both on its next poll.
    fn on_connected(&self) -> Result<(), TransportConnectError> {
        let topics = &self.settings.topics;
        if let Err(e) = self
            .client
            .try_publish(topics.status_topic.as_str(), QoS::AtLeastOnce, true, STATUS_ALIVE)
        {
            tracing::warn!(topic = %topics.status_topic, error = %e, "failed to queue ALIVE status");
        }

        let filter = topics.presence_filter();
        self.client
            .try_subscribe(filter.as_str(), QoS::AtLeastOnce)
            .map_err(|e| TransportConnectError::Subscribe {
                topic: filter.clone(),
                reason: e.to_string(),
            })?;
        tracing::info!(topic = %filter, "subscribed to presence");
        Ok(())
    }

    /// # Run
    ///
    /// Drives the session until `shutdown` fires. Connection errors clear the
    /// connected flag and are retried after a short delay; rumqttc reconnects
    /// on the next poll.
    pub async fn run(mut self, coordinator: Arc<Coordinator>, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("MQTT loop received shutdown signal");
                    self.disconnect().await;
                    break;
                }
                event = self.eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        self.connected.store(true, Ordering::SeqCst);
                        tracing::info!(broker = %self.address, "reconnected to MQTT broker");
                        if let Err(e) = self.on_connected() {
                            tracing::error!(error = %e, "failed to restore session after reconnect");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(message))) => {
                        if let Err(e) = coordinator.handle_presence_message(&message.topic, &message.payload) {
                            tracing::warn!(topic = %message.topic, error = %e, "ignoring presence message");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        self.connected.store(false, Ordering::SeqCst);
                        tracing::error!(broker = %self.address, error = %e, "MQTT connection lost");
                        tokio::select! {
                            _ = shutdown.recv() => {
                                tracing::info!("MQTT loop received shutdown signal while disconnected");
                                break;
                            }
                            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                        }
                    }
                }
            }
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Leaves a retained DEAD status and closes the session. A clean
    /// disconnect suppresses the last will, hence the explicit publish.
    async fn disconnect(&mut self) {
        if !self.connected.load(Ordering::SeqCst) {
            return;
        }
        let status_topic = self.settings.topics.status_topic.as_str();
        if let Err(e) = self.client.try_publish(status_topic, QoS::AtLeastOnce, true, STATUS_DEAD) {
            tracing::warn!(topic = status_topic, error = %e, "failed to queue DEAD status");
        }
        if let Err(e) = self.client.try_disconnect() {
            tracing::warn!(error = %e, "failed to queue MQTT disconnect");
            return;
        }

        let drain = async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
        };
        if tokio::time::timeout(DISCONNECT_GRACE, drain).await.is_err() {
            tracing::warn!("timed out flushing MQTT disconnect");
        } else {
            tracing::info!(broker = %self.address, "disconnected from MQTT broker");
        }
    }
}
