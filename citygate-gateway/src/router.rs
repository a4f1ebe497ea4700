//! Command routing.
//!
//! Every command, whichever interface it arrived on, goes through
//! [`CommandRouter::route`], which picks a bridge from the device's roles and
//! folds the bridge's result into a [`CommandOutcome`].

use std::sync::Arc;

use citygate_core::{CommandKind, CommandStatus, DeviceId, DeviceStatus};
use citygate_rpc::{ActuatorAction, ActuatorTarget};
use jiff::Timestamp;
use tracing::{info, instrument, warn};

use crate::bridge::{ActuatorBridge, BridgeError, SensorBridge};
use crate::registry::{DeviceRecord, DeviceRegistry, Telemetry, Transport};

/// Normalized result of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub status: CommandStatus,
    pub message: String,
    /// Status the device reported, when it reported one.
    pub device_status: Option<DeviceStatus>,
}

impl CommandOutcome {
    pub fn success(message: impl Into<String>, device_status: Option<DeviceStatus>) -> Self {
        Self {
            status: CommandStatus::Success,
            message: message.into(),
            device_status,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: CommandStatus::Failed,
            message: message.into(),
            device_status: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == CommandStatus::Success
    }
}

#[derive(Clone)]
pub struct CommandRouter {
    registry: DeviceRegistry,
    sensors: Option<Arc<dyn SensorBridge>>,
    actuators: Arc<dyn ActuatorBridge>,
}

impl CommandRouter {
    pub fn new(
        registry: DeviceRegistry,
        sensors: Option<Arc<dyn SensorBridge>>,
        actuators: Arc<dyn ActuatorBridge>,
    ) -> Self {
        Self {
            registry,
            sensors,
            actuators,
        }
    }

    #[instrument(skip(self, device_id), fields(%device_id))]
    pub async fn route(
        &self,
        device_id: &DeviceId,
        command_type: &str,
        command_value: &str,
    ) -> CommandOutcome {
        let Some(record) = self.registry.get(device_id).await else {
            return CommandOutcome::failed("device not found");
        };

        let command = match CommandKind::parse(command_type, command_value) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "rejected command");
                return CommandOutcome::failed(e.to_string());
            }
        };

        let outcome = if record.roles.is_sensor {
            self.route_to_sensor(&record, command).await
        } else if record.roles.is_actuator {
            self.route_to_actuator(&record, command).await
        } else {
            CommandOutcome::failed("unsupported device type")
        };

        info!(%command, status = %outcome.status, message = %outcome.message, "command routed");
        outcome
    }

    async fn route_to_sensor(&self, record: &DeviceRecord, command: CommandKind) -> CommandOutcome {
        let Transport::Mqtt { command_topic, .. } = &record.transport else {
            return CommandOutcome::failed("sensor has no command topic");
        };
        let Some(sensors) = &self.sensors else {
            return CommandOutcome::failed("mqtt bridge is not enabled");
        };

        match sensors.send_command(&record.id, command_topic, command).await {
            Ok(reply) => {
                let device_status = reply.status();
                // The device may have been evicted meanwhile; that is not a
                // command failure.
                let _ = self
                    .registry
                    .apply_telemetry(&record.id, reply.telemetry, Timestamp::now())
                    .await;
                CommandOutcome::success(reply.message, device_status)
            }
            Err(e) => failure(e),
        }
    }

    async fn route_to_actuator(
        &self,
        record: &DeviceRecord,
        command: CommandKind,
    ) -> CommandOutcome {
        let Some(action) = ActuatorAction::from_command(command) else {
            return CommandOutcome::failed(format!("{} is not supported by actuators", command.wire_name()));
        };
        let Some(address) = &record.address else {
            return CommandOutcome::failed("actuator has no registered address");
        };

        let target = ActuatorTarget {
            device_id: record.id.clone(),
            host: address.host.clone(),
            port: address.port,
        };

        match self.actuators.actuate(action, target).await {
            Ok(reply) => {
                let telemetry = Telemetry {
                    status: Some(reply.status),
                    readings: Vec::new(),
                };
                let _ = self
                    .registry
                    .apply_telemetry(&record.id, telemetry, Timestamp::now())
                    .await;
                CommandOutcome::success(reply.message, Some(reply.status))
            }
            Err(e) => failure(e),
        }
    }
}

fn failure(err: BridgeError) -> CommandOutcome {
    let message = match &err {
        BridgeError::Timeout(t) => format!("timeout after {}s waiting for device", t.as_secs_f32()),
        other => other.to_string(),
    };
    CommandOutcome::failed(message)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use citygate_core::{DeviceInfo, DeviceKind};
    use citygate_rpc::ActuatorReply;

    use super::*;
    use crate::bridge::SensorReply;
    use crate::registry::{SensorValue, TEMPERATURE, TransportPolicy};

    #[derive(Default)]
    struct CountingActuator {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ActuatorBridge for CountingActuator {
        async fn actuate(
            &self,
            action: ActuatorAction,
            target: ActuatorTarget,
        ) -> Result<ActuatorReply, BridgeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let status = match action {
                ActuatorAction::TurnOn => DeviceStatus::On,
                ActuatorAction::TurnOff => DeviceStatus::Off,
                ActuatorAction::QueryState => DeviceStatus::Off,
            };
            Ok(ActuatorReply {
                device_id: target.device_id,
                status,
                message: "ok".into(),
            })
        }
    }

    struct SilentSensor;

    #[async_trait]
    impl SensorBridge for SilentSensor {
        async fn send_command(
            &self,
            _: &DeviceId,
            _: &str,
            _: CommandKind,
        ) -> Result<SensorReply, BridgeError> {
            Err(BridgeError::Timeout(Duration::from_secs(10)))
        }
    }

    struct ReportingSensor;

    #[async_trait]
    impl SensorBridge for ReportingSensor {
        async fn send_command(
            &self,
            _: &DeviceId,
            _: &str,
            command: CommandKind,
        ) -> Result<SensorReply, BridgeError> {
            let mut telemetry = Telemetry {
                status: Some(DeviceStatus::Idle),
                readings: Vec::new(),
            };
            telemetry.push_number(TEMPERATURE, Some(19.0));
            Ok(SensorReply {
                message: format!("{command} done"),
                telemetry,
            })
        }
    }

    fn info(id: &str, is_sensor: bool, is_actuator: bool) -> DeviceInfo {
        DeviceInfo {
            device_id: id.into(),
            kind: if is_sensor {
                DeviceKind::TemperatureSensor
            } else {
                DeviceKind::Relay
            },
            ip: "127.0.0.1".into(),
            port: 7000,
            initial_state: DeviceStatus::Off,
            is_sensor,
            is_actuator,
            capabilities: BTreeMap::new(),
        }
    }

    async fn setup(
        sensors: Option<Arc<dyn SensorBridge>>,
    ) -> (CommandRouter, DeviceRegistry, Arc<CountingActuator>) {
        let registry = DeviceRegistry::new(TransportPolicy::default());
        let now = Timestamp::now();
        registry.register(info("relay_1", false, true), now).await;
        registry.register(info("temp_1", true, false), now).await;
        registry.register(info("orphan", false, false), now).await;

        let actuator = Arc::new(CountingActuator::default());
        let router = CommandRouter::new(registry.clone(), sensors, actuator.clone());
        (router, registry, actuator)
    }

    #[tokio::test]
    async fn unknown_device_fails_without_creating_a_record() {
        let (router, registry, _) = setup(None).await;

        let outcome = router.route(&"ghost".into(), "TURN_ON", "").await;

        assert_eq!(outcome, CommandOutcome::failed("device not found"));
        assert!(registry.get(&"ghost".into()).await.is_none());
    }

    #[tokio::test]
    async fn actuator_status_is_written_back() {
        let (router, registry, _) = setup(None).await;

        let outcome = router.route(&"relay_1".into(), "ligar", "").await;

        assert!(outcome.is_success());
        assert_eq!(outcome.device_status, Some(DeviceStatus::On));
        let record = registry.get(&"relay_1".into()).await.unwrap();
        assert_eq!(record.status, DeviceStatus::On);
    }

    #[tokio::test]
    async fn unsupported_actuator_commands_never_reach_the_bridge() {
        let (router, _, actuator) = setup(None).await;

        let freq = router.route(&"relay_1".into(), "SET_FREQ", "1000").await;
        let junk = router.route(&"relay_1".into(), "EXPLODE", "").await;

        assert_eq!(freq.status, CommandStatus::Failed);
        assert_eq!(junk.status, CommandStatus::Failed);
        assert_eq!(actuator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn device_with_no_role_is_unsupported() {
        let (router, _, _) = setup(None).await;

        let outcome = router.route(&"orphan".into(), "ON", "").await;

        assert_eq!(outcome, CommandOutcome::failed("unsupported device type"));
    }

    #[tokio::test]
    async fn sensor_timeout_fails_and_leaves_registry_alone() {
        let (router, registry, _) = setup(Some(Arc::new(SilentSensor))).await;
        let before = registry.get(&"temp_1".into()).await.unwrap();

        let outcome = router.route(&"temp_1".into(), "GET_STATUS", "").await;

        assert_eq!(outcome.status, CommandStatus::Failed);
        assert!(outcome.message.contains("timeout"));
        assert_eq!(registry.get(&"temp_1".into()).await.unwrap(), before);
    }

    #[tokio::test]
    async fn sensor_reply_updates_status_and_readings() {
        let (router, registry, _) = setup(Some(Arc::new(ReportingSensor))).await;

        let outcome = router.route(&"temp_1".into(), "TURN_IDLE", "").await;

        assert!(outcome.is_success());
        assert_eq!(outcome.message, "TURN_OFF done");
        let record = registry.get(&"temp_1".into()).await.unwrap();
        assert_eq!(record.status, DeviceStatus::Idle);
        assert_eq!(
            record.sensor_data.get(TEMPERATURE),
            SensorValue::number(19.0).as_ref()
        );
    }

    #[tokio::test]
    async fn sensor_without_mqtt_bridge_fails() {
        let (router, _, _) = setup(None).await;

        let outcome = router.route(&"temp_1".into(), "ON", "").await;

        assert_eq!(outcome.status, CommandStatus::Failed);
    }
}
