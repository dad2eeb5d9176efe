//! MQTT transport backed by rumqttc.

use super::{InboundMessage, Payload, Transport};
use crate::config::MqttConfig;
use crate::error::{HaMqttError, Result};
use crate::router::Router;
use log::{debug, error, info, warn};
use rumqttc::{
    AsyncClient, ConnAck, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions,
    Packet, QoS,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Delay before polling again after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Publishing half of the MQTT connection.
#[derive(Clone)]
pub struct MqttTransport {
    client: AsyncClient,
}

/// Event loop half of the MQTT connection.
///
/// Must be polled (see [`MqttEventLoop::run`]) for anything queued on the
/// [`MqttTransport`] to reach the broker.
pub struct MqttEventLoop {
    client: AsyncClient,
    event_loop: EventLoop,
    host: String,
}

impl MqttTransport {
    /// Create the client and its event loop from configuration.
    ///
    /// No network traffic happens until the event loop is polled.
    pub fn new(config: &MqttConfig) -> (Self, MqttEventLoop) {
        let mut options =
            MqttOptions::new(&config.client_id, &config.broker_host, config.broker_port);
        options.set_keep_alive(Duration::from_secs(30));

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            info!("[MQTT] Connecting with username and password");
            options.set_credentials(username, password);
        }

        let (client, event_loop) = AsyncClient::new(options, 100);

        (
            Self {
                client: client.clone(),
            },
            MqttEventLoop {
                client,
                event_loop,
                host: config.broker_host.clone(),
            },
        )
    }

    /// Request a clean disconnect from the broker.
    pub fn disconnect(&self) -> Result<()> {
        info!("[MQTT] Disconnecting");
        self.client.try_disconnect()?;
        Ok(())
    }
}

impl Transport for MqttTransport {
    fn publish(&self, topic: &str, payload: &Payload) -> Result<()> {
        debug!("[MQTT] Publishing to {}: {:?}", topic, payload);
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload.to_bytes())?;
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<()> {
        debug!("[MQTT] Subscribing to {}", topic);
        self.client.try_subscribe(topic, QoS::AtMostOnce)?;
        Ok(())
    }
}

impl MqttEventLoop {
    /// Poll until the broker acknowledges the connection.
    ///
    /// A refused connection, a network error or the timeout elapsing are all
    /// reported as [`HaMqttError::Connect`].
    pub async fn wait_connected(&mut self, timeout: Duration) -> Result<()> {
        info!("[MQTT] Connecting to host {}", self.host);

        let host = self.host.clone();
        let connect = async {
            loop {
                match self.event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ConnAck { code, .. }))) => {
                        return if code == ConnectReturnCode::Success {
                            Ok(())
                        } else {
                            Err(format!("connection refused: {:?}", code))
                        };
                    }
                    Ok(_) => continue,
                    Err(ConnectionError::ConnectionRefused(code)) => {
                        return Err(format!("connection refused: {:?}", code));
                    }
                    Err(e) => return Err(e.to_string()),
                }
            }
        };

        match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(())) => {
                info!("[MQTT] Successfully connected to host {}", host);
                Ok(())
            }
            Ok(Err(reason)) => Err(HaMqttError::Connect { host, reason }),
            Err(_) => Err(HaMqttError::Connect {
                host,
                reason: format!("timeout after {:?}", timeout),
            }),
        }
    }

    /// Run the event loop, forwarding incoming publishes to `tx`.
    ///
    /// Every topic known to `router` is subscribed again after each
    /// reconnect. Returns when the receiving side of `tx` is dropped.
    pub async fn run(mut self, router: Arc<Router>, tx: mpsc::Sender<InboundMessage>) {
        info!("[MQTT] Starting event loop");

        loop {
            match self.event_loop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let topic = publish.topic.clone();
                    let payload = match String::from_utf8(publish.payload.to_vec()) {
                        Ok(s) => s,
                        Err(e) => {
                            warn!("[MQTT] Invalid UTF-8 in payload on {}: {}", topic, e);
                            continue;
                        }
                    };

                    debug!("[MQTT] Received message on {}: {}", topic, payload);

                    if tx.send(InboundMessage { topic, payload }).await.is_err() {
                        info!("[MQTT] Message channel closed, stopping event loop");
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("[MQTT] Reconnected to host {}", self.host);
                    for topic in router.topics() {
                        if let Err(e) = self.client.try_subscribe(&topic, QoS::AtMostOnce) {
                            warn!("[MQTT] Failed to resubscribe to {}: {:?}", topic, e);
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("[MQTT] Connection error: {:?}", e);
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }
}
