//! MQTT transport for sensors.
//!
//! Commands are published as JSON to `{command_prefix}/{device_id}`. The
//! sensor answers on `{command_prefix}/{device_id}/response` with the same
//! `request_id`, which is how the waiting caller is found again. Sensors also
//! publish unsolicited telemetry on `{telemetry_prefix}/{device_id}`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use citygate_core::{CommandKind, DeviceId, DeviceStatus};
use dashmap::DashMap;
use jiff::Timestamp;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use ulid::Ulid;

use super::{BridgeError, SensorBridge, SensorReply};
use crate::config::MqttConfig;
use crate::registry::{
    CURRENT, CUSTOM_CONFIG_STATUS, DeviceRegistry, FREQUENCY_MS, HUMIDITY, POWER, TEMPERATURE,
    Telemetry, VOLTAGE,
};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Command published to a sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttCommand {
    pub command_type: String,
    pub command_value: String,
    pub request_id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// Measurement fields shared by responses and telemetry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Measurements {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,
    #[serde(default)]
    pub current: Option<f64>,
    #[serde(default)]
    pub voltage: Option<f64>,
    #[serde(default)]
    pub power: Option<f64>,
    #[serde(default)]
    pub frequency_ms: Option<u32>,
    #[serde(default)]
    pub custom_config_status: Option<String>,
}

impl Measurements {
    /// An unknown status name is logged and left out.
    pub fn to_telemetry(&self, device: &str) -> Telemetry {
        let status = self.status.as_deref().and_then(|name| {
            name.parse::<DeviceStatus>()
                .map_err(|e| warn!(device_id = device, error = %e, "ignoring unknown status"))
                .ok()
        });

        let mut telemetry = Telemetry {
            status,
            readings: Vec::new(),
        };
        telemetry.push_number(TEMPERATURE, self.temperature);
        telemetry.push_number(HUMIDITY, self.humidity);
        telemetry.push_number(CURRENT, self.current);
        telemetry.push_number(VOLTAGE, self.voltage);
        telemetry.push_number(POWER, self.power);
        telemetry.push_number(FREQUENCY_MS, self.frequency_ms.map(f64::from));
        telemetry.push_text(CUSTOM_CONFIG_STATUS, self.custom_config_status.as_deref());
        telemetry
    }
}

/// A sensor's answer to an [`MqttCommand`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttResponse {
    pub request_id: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(flatten)]
    pub measurements: Measurements,
}

/// Telemetry a sensor publishes on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttTelemetry {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(flatten)]
    pub measurements: Measurements,
}

#[async_trait]
pub trait Publisher: Send + Sync + 'static {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BridgeError>;
}

#[async_trait]
impl Publisher for AsyncClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BridgeError> {
        AsyncClient::publish(self, topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| BridgeError::Transport(format!("mqtt publish failed: {e}")))
    }
}

/// Waiting commands, keyed by request id. Each slot resolves at most once.
#[derive(Default)]
pub struct Correlator {
    slots: DashMap<String, oneshot::Sender<MqttResponse>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, request_id: &str) -> oneshot::Receiver<MqttResponse> {
        let (tx, rx) = oneshot::channel();
        self.slots.insert(request_id.to_string(), tx);
        rx
    }

    /// Hand a response to its waiter. Returns false when nobody is waiting.
    pub fn resolve(&self, response: MqttResponse) -> bool {
        match self.slots.remove(&response.request_id) {
            Some((_, tx)) => tx.send(response).is_ok(),
            None => false,
        }
    }

    pub fn release(&self, request_id: &str) {
        self.slots.remove(request_id);
    }

    pub fn pending(&self) -> usize {
        self.slots.len()
    }
}

pub struct MqttSensorBridge<P> {
    publisher: P,
    correlator: Arc<Correlator>,
    timeout: Duration,
}

impl<P: Publisher> MqttSensorBridge<P> {
    pub fn new(publisher: P, correlator: Arc<Correlator>, timeout: Duration) -> Self {
        Self {
            publisher,
            correlator,
            timeout,
        }
    }
}

#[async_trait]
impl<P: Publisher> SensorBridge for MqttSensorBridge<P> {
    #[instrument(skip(self, device_id), fields(%device_id))]
    async fn send_command(
        &self,
        device_id: &DeviceId,
        command_topic: &str,
        command: CommandKind,
    ) -> Result<SensorReply, BridgeError> {
        let request_id = Ulid::new().to_string();
        let body = MqttCommand {
            command_type: command.wire_name().to_string(),
            command_value: command.wire_value(),
            request_id: request_id.clone(),
            timestamp: Timestamp::now().as_millisecond(),
        };
        let payload = serde_json::to_vec(&body)
            .map_err(|e| BridgeError::Transport(format!("failed to encode command: {e}")))?;

        let rx = self.correlator.register(&request_id);

        // Publishing blocks while the client's request queue is full, so it
        // shares the deadline with the wait for the response.
        let exchange = async {
            self.publisher.publish(command_topic, payload).await?;
            debug!(%request_id, topic = command_topic, "command published");
            rx.await
                .map_err(|_| BridgeError::Transport("response slot dropped".to_string()))
        };

        let response = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.correlator.release(&request_id);
                return Err(e);
            }
            Err(_) => {
                self.correlator.release(&request_id);
                warn!(%request_id, "no response from sensor");
                return Err(BridgeError::Timeout(self.timeout));
            }
        };

        if !response.success {
            return Err(BridgeError::Rejected(
                response
                    .message
                    .unwrap_or_else(|| "sensor reported failure".to_string()),
            ));
        }

        Ok(SensorReply {
            telemetry: response.measurements.to_telemetry(device_id.as_str()),
            message: response
                .message
                .unwrap_or_else(|| "command executed".to_string()),
        })
    }
}

/// Routes inbound publishes to the correlator or the registry.
#[derive(Clone)]
pub struct InboundRouter {
    pub registry: DeviceRegistry,
    pub correlator: Arc<Correlator>,
    pub command_prefix: String,
    pub telemetry_prefix: String,
}

impl InboundRouter {
    pub fn subscriptions(&self) -> [String; 2] {
        [
            format!("{}/+", self.telemetry_prefix),
            format!("{}/+/response", self.command_prefix),
        ]
    }

    #[instrument(skip(self, payload))]
    pub async fn handle(&self, topic: &str, payload: &[u8]) {
        if let Some(device) = topic
            .strip_prefix(self.command_prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .and_then(|rest| rest.strip_suffix("/response"))
        {
            self.handle_response(device, payload);
            return;
        }

        if let Some(device) = topic
            .strip_prefix(self.telemetry_prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
        {
            self.handle_telemetry(device, payload).await;
            return;
        }

        debug!("publish on unhandled topic");
    }

    fn handle_response(&self, device: &str, payload: &[u8]) {
        let response: MqttResponse = match serde_json::from_slice(payload) {
            Ok(r) => r,
            Err(e) => {
                warn!(device_id = device, error = %e, "malformed command response");
                return;
            }
        };

        let request_id = response.request_id.clone();
        if self.correlator.resolve(response) {
            debug!(device_id = device, %request_id, "command response delivered");
        } else {
            warn!(device_id = device, %request_id, "command response with no waiter dropped");
        }
    }

    async fn handle_telemetry(&self, topic_device: &str, payload: &[u8]) {
        let telemetry: MqttTelemetry = match serde_json::from_slice(payload) {
            Ok(t) => t,
            Err(e) => {
                warn!(device_id = topic_device, error = %e, "malformed telemetry");
                return;
            }
        };

        let device = telemetry.device_id.as_deref().unwrap_or(topic_device);
        let id = DeviceId::from(device);
        let update = telemetry.measurements.to_telemetry(device);

        if self
            .registry
            .apply_telemetry(&id, update, Timestamp::now())
            .await
            .is_ok()
        {
            debug!(device_id = device, "mqtt telemetry applied");
        }
    }
}

/// Build the MQTT client for `config`. The event loop must be driven by
/// [`run_event_loop`] for anything to be sent or received.
pub fn connect(config: &MqttConfig) -> (AsyncClient, EventLoop) {
    let client_id = format!("{}-{}", config.client_id_prefix, Ulid::new());
    let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        options.set_credentials(username.clone(), password.clone());
    }

    AsyncClient::new(options, 64)
}

/// Drive the MQTT connection until cancelled. Subscriptions are renewed on
/// every connection acknowledgement, and each inbound publish is handled on
/// its own task.
#[instrument(name = "mqtt", skip_all)]
pub async fn run_event_loop(
    client: AsyncClient,
    mut eventloop: EventLoop,
    inbound: InboundRouter,
    cancel: CancellationToken,
) {
    info!("mqtt event loop started");

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => {
                info!("mqtt event loop shutting down");
                let _ = client.try_disconnect();
                break;
            }
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("connected to mqtt broker");
                for topic in inbound.subscriptions() {
                    if let Err(e) = client.try_subscribe(topic.clone(), QoS::AtLeastOnce) {
                        warn!(%topic, error = %e, "mqtt subscribe failed");
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let inbound = inbound.clone();
                tokio::spawn(async move {
                    inbound.handle(&publish.topic, &publish.payload).await;
                });
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "mqtt event loop error, retrying");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}
