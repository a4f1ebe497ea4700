use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::registry::{DeviceRecord, SensorValue};
use crate::router::CommandOutcome;

#[derive(Debug, Serialize)]
pub struct DeviceResponse {
    pub id: String,
    pub kind: String,
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub status: String,
    pub is_sensor: bool,
    pub is_actuator: bool,
    pub capabilities: BTreeMap<String, String>,
    pub sensor_data: BTreeMap<String, SensorValue>,
    pub last_seen: String,
}

impl From<DeviceRecord> for DeviceResponse {
    fn from(record: DeviceRecord) -> Self {
        Self {
            id: record.id.to_string(),
            kind: record.kind.as_str().to_string(),
            ip: record.address.as_ref().map(|a| a.host.to_string()),
            port: record.address.as_ref().map(|a| a.port),
            status: record.status.as_str().to_string(),
            is_sensor: record.roles.is_sensor,
            is_actuator: record.roles.is_actuator,
            capabilities: record.capabilities,
            sensor_data: record.sensor_data,
            last_seen: record.last_seen.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub total: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command_type: String,
    #[serde(default)]
    pub command_value: String,
}

#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub success: bool,
    pub status: String,
    pub message: String,
    pub device_status: Option<String>,
}

impl From<CommandOutcome> for CommandResponse {
    fn from(outcome: CommandOutcome) -> Self {
        Self {
            success: outcome.is_success(),
            status: outcome.status.as_str().to_string(),
            message: outcome.message,
            device_status: outcome.device_status.map(|s| s.as_str().to_string()),
        }
    }
}
