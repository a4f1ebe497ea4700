//! Downstream transports for device commands.

pub mod actuator;
pub mod mqtt;

use std::time::Duration;

use async_trait::async_trait;
use citygate_core::{CommandKind, DeviceId, DeviceStatus};
use citygate_rpc::{ActuatorAction, ActuatorReply, ActuatorTarget};

use crate::registry::Telemetry;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("timed out after {0:?} waiting for device response")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    /// The device answered and reported failure.
    #[error("{0}")]
    Rejected(String),
    #[error("bridge not available: {0}")]
    Unavailable(&'static str),
}

/// What a sensor reported back after a command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorReply {
    pub message: String,
    pub telemetry: Telemetry,
}

impl SensorReply {
    pub fn status(&self) -> Option<DeviceStatus> {
        self.telemetry.status
    }
}

/// Carries commands to sensors, which answer asynchronously.
#[async_trait]
pub trait SensorBridge: Send + Sync + 'static {
    async fn send_command(
        &self,
        device_id: &DeviceId,
        command_topic: &str,
        command: CommandKind,
    ) -> Result<SensorReply, BridgeError>;
}

/// Carries on/off/query actions to actuators.
#[async_trait]
pub trait ActuatorBridge: Send + Sync + 'static {
    async fn actuate(
        &self,
        action: ActuatorAction,
        target: ActuatorTarget,
    ) -> Result<ActuatorReply, BridgeError>;
}
