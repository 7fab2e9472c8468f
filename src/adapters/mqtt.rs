//! MQTT Adapter
//!
//! Bridges the internal event bus to MQTT for Home Assistant integration:
//! zone state goes out as retained JSON, control commands come in on
//! `{prefix}/{zone}/control`.

use anyhow::{anyhow, Result};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::bus::{BusEvent, SharedBus, ZoneCommand};

const DEFAULT_PORT: u16 = 1883;
const DEFAULT_TOPIC_PREFIX: &str = "mzc66";
const CLIENT_ID: &str = "mzc66-bridge";

/// MQTT connection status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttStatus {
    pub connected: bool,
    pub host: Option<String>,
    pub port: u16,
    pub topic_prefix: String,
}

/// Outgoing MQTT message
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

struct MqttState {
    host: Option<String>,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    topic_prefix: String,
    connected: bool,
}

impl Default for MqttState {
    fn default() -> Self {
        Self {
            host: None,
            port: DEFAULT_PORT,
            username: None,
            password: None,
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            connected: false,
        }
    }
}

/// Map a bus event to the MQTT message it produces, if any.
pub fn event_message(prefix: &str, event: &BusEvent) -> Result<Option<OutgoingMessage>> {
    let (suffix, payload, retain) = match event {
        BusEvent::ZoneDiscovered { zone } | BusEvent::ZoneUpdated { zone } => (
            format!("zones/{}/state", zone.object_id),
            serde_json::to_value(zone)?,
            true,
        ),
        BusEvent::ZoneRemoved {
            unique_id,
            object_id,
        } => (
            format!("zones/{}/removed", object_id),
            serde_json::json!({ "unique_id": unique_id, "removed": true }),
            false,
        ),
        BusEvent::AmplifierConnected { port } => (
            "amplifiers/status".to_string(),
            serde_json::json!({ "port": port, "connected": true }),
            false,
        ),
        BusEvent::AmplifierUnavailable { port, reason } => (
            "amplifiers/status".to_string(),
            serde_json::json!({ "port": port, "connected": false, "reason": reason }),
            false,
        ),
        BusEvent::ShuttingDown { reason } => (
            "system/shutdown".to_string(),
            serde_json::json!({ "shutting_down": true, "reason": reason }),
            false,
        ),
        // Commands come from MQTT; don't echo them back
        BusEvent::ControlCommand { .. } | BusEvent::AdapterStopped { .. } => return Ok(None),
    };

    Ok(Some(OutgoingMessage {
        topic: format!("{}/{}", prefix, suffix),
        payload: serde_json::to_string(&payload)?,
        retain,
    }))
}

/// Parse `{prefix}/{zone_id}/control` with a JSON [`ZoneCommand`] payload.
pub fn parse_control(prefix: &str, topic: &str, payload: &[u8]) -> Option<(String, ZoneCommand)> {
    let zone_id = topic
        .strip_prefix(prefix)?
        .strip_prefix('/')?
        .strip_suffix("/control")?;
    if zone_id.is_empty() || zone_id.contains('/') {
        return None;
    }
    match serde_json::from_slice::<ZoneCommand>(payload) {
        Ok(command) => Some((zone_id.to_string(), command)),
        Err(e) => {
            tracing::warn!("Ignoring malformed control payload on {}: {}", topic, e);
            None
        }
    }
}

pub struct MqttAdapter {
    state: Arc<RwLock<MqttState>>,
    client: Arc<RwLock<Option<AsyncClient>>>,
    bus: SharedBus,
    shutdown: CancellationToken,
}

impl MqttAdapter {
    pub fn new(bus: SharedBus) -> Self {
        Self {
            state: Arc::new(RwLock::new(MqttState::default())),
            client: Arc::new(RwLock::new(None)),
            bus,
            shutdown: CancellationToken::new(),
        }
    }

    pub async fn configure(
        &self,
        host: String,
        port: Option<u16>,
        username: Option<String>,
        password: Option<String>,
        topic_prefix: Option<String>,
    ) {
        let mut state = self.state.write().await;
        state.host = Some(host);
        state.port = port.unwrap_or(DEFAULT_PORT);
        state.username = username;
        state.password = password;
        if let Some(prefix) = topic_prefix {
            state.topic_prefix = prefix;
        }
    }

    pub async fn is_configured(&self) -> bool {
        self.state.read().await.host.is_some()
    }

    pub async fn get_status(&self) -> MqttStatus {
        let state = self.state.read().await;
        MqttStatus {
            connected: state.connected,
            host: state.host.clone(),
            port: state.port,
            topic_prefix: state.topic_prefix.clone(),
        }
    }

    /// Connect and start bridging
    pub async fn start(&self) -> Result<()> {
        let (host, port, username, password, topic_prefix) = {
            let state = self.state.read().await;
            let host = state
                .host
                .clone()
                .ok_or_else(|| anyhow!("MQTT host not configured"))?;
            (
                host,
                state.port,
                state.username.clone(),
                state.password.clone(),
                state.topic_prefix.clone(),
            )
        };

        let mut options = MqttOptions::new(CLIENT_ID, &host, port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(user), Some(pass)) = (&username, &password) {
            options.set_credentials(user, pass);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 100);
        *self.client.write().await = Some(client.clone());

        let control_topic = format!("{}/+/control", topic_prefix);
        client.subscribe(&control_topic, QoS::AtMostOnce).await?;

        tracing::info!("MQTT connecting to {}:{}...", host, port);

        // Incoming: connection state and control commands
        let state = self.state.clone();
        let bus = self.bus.clone();
        let prefix = topic_prefix.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("MQTT event loop shutting down");
                        break;
                    }
                    result = eventloop.poll() => {
                        match result {
                            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                                if let Some((zone_id, command)) =
                                    parse_control(&prefix, &publish.topic, &publish.payload)
                                {
                                    tracing::debug!("MQTT control for {}: {:?}", zone_id, command);
                                    bus.publish(BusEvent::ControlCommand { zone_id, command });
                                }
                            }
                            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                                tracing::info!("MQTT connected (code: {:?})", ack.code);
                                state.write().await.connected = true;
                            }
                            Ok(Event::Incoming(Incoming::Disconnect)) => {
                                tracing::warn!("MQTT disconnected");
                                state.write().await.connected = false;
                            }
                            Err(e) => {
                                tracing::error!("MQTT error: {}", e);
                                state.write().await.connected = false;
                                tokio::select! {
                                    _ = shutdown.cancelled() => break,
                                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }
        });

        // Outgoing: bus events to MQTT
        let client_clone = self.client.clone();
        let bus_clone = self.bus.clone();
        let shutdown2 = self.shutdown.clone();

        tokio::spawn(async move {
            let mut rx = bus_clone.subscribe();

            loop {
                tokio::select! {
                    _ = shutdown2.cancelled() => {
                        tracing::info!("MQTT bus forwarder shutting down");
                        break;
                    }
                    result = rx.recv() => {
                        let Ok(event) = result else {
                            // Lagged or closed; keep going until shutdown
                            continue;
                        };
                        let message = match event_message(&topic_prefix, &event) {
                            Ok(Some(message)) => message,
                            Ok(None) => continue,
                            Err(e) => {
                                tracing::warn!("Failed to encode MQTT message: {}", e);
                                continue;
                            }
                        };
                        if let Some(client) = client_clone.read().await.as_ref() {
                            if let Err(e) = client
                                .publish(&message.topic, QoS::AtMostOnce, message.retain, message.payload)
                                .await
                            {
                                tracing::debug!("MQTT publish to {} failed: {}", message.topic, e);
                            }
                        }
                    }
                }
            }
        });

        Ok(())
    }

    /// Stop MQTT connection
    pub async fn stop(&self) {
        self.shutdown.cancel();

        if let Some(c) = self.client.write().await.take() {
            let _ = c.disconnect().await;
        }
        self.state.write().await.connected = false;

        tracing::info!("MQTT adapter stopped");
    }
}
