pub mod command;
pub mod protocol;

pub use command::{CommandKind, UnknownCommand};

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// We use `Box<str>` and `Box<[T]>` for structures that don't need to be
// dynamically sized. This helps us keep allocations compact and avoid
// accidental cloning of large values.
type BoxStr = Box<str>;
type BoxList<T> = Box<[T]>;

/// Unique identifier of a device, as declared by the device itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub BoxStr);

impl DeviceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value.into_boxed_str())
    }
}

/// Device classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Combined temperature and humidity sensor.
    TemperatureSensor,
    /// Electrical current, voltage and power sensor.
    CurrentSensor,
    Relay,
    Alarm,
    Unknown,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::TemperatureSensor => "TEMPERATURE_SENSOR",
            DeviceKind::CurrentSensor => "CURRENT_SENSOR",
            DeviceKind::Relay => "RELAY",
            DeviceKind::Alarm => "ALARM",
            DeviceKind::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceStatus {
    Off,
    On,
    /// Sensor is sampling and publishing.
    Active,
    /// Sensor is powered but not sampling.
    Idle,
    Unknown,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Off => "OFF",
            DeviceStatus::On => "ON",
            DeviceStatus::Active => "ACTIVE",
            DeviceStatus::Idle => "IDLE",
            DeviceStatus::Unknown => "UNKNOWN_STATUS",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown device status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for DeviceStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OFF" => Ok(DeviceStatus::Off),
            "ON" => Ok(DeviceStatus::On),
            "ACTIVE" => Ok(DeviceStatus::Active),
            "IDLE" => Ok(DeviceStatus::Idle),
            "UNKNOWN" | "UNKNOWN_STATUS" => Ok(DeviceStatus::Unknown),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

/// Registration message a device sends to the gateway over TCP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: DeviceId,
    pub kind: DeviceKind,
    /// Host the device accepts direct TCP commands on. Empty for MQTT-only sensors.
    pub ip: BoxStr,
    pub port: u16,
    pub initial_state: DeviceStatus,
    pub is_sensor: bool,
    pub is_actuator: bool,
    pub capabilities: BTreeMap<String, String>,
}

/// A command addressed to one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCommand {
    pub device_id: DeviceId,
    pub command_type: BoxStr,
    pub command_value: BoxStr,
}

/// Request issued by a client application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientRequest {
    ListDevices,
    GetDeviceStatus {
        target: DeviceId,
    },
    SendDeviceCommand {
        target: DeviceId,
        command: DeviceCommand,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandStatus {
    Success,
    Failed,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Success => "SUCCESS",
            CommandStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The gateway's single reply to a [`ClientRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GatewayResponse {
    DeviceList {
        devices: BoxList<DeviceInfo>,
        message: BoxStr,
    },
    CommandAck {
        status: CommandStatus,
        message: BoxStr,
        /// Device status reported back by the device, when it sent one.
        device_status: Option<DeviceStatus>,
    },
    DeviceStatusUpdate {
        update: DeviceUpdate,
        message: BoxStr,
    },
    Error {
        message: BoxStr,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureHumidity {
    /// Degrees Celsius.
    pub temperature: f64,
    /// Relative humidity in percent.
    pub humidity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurrentReading {
    /// Amperes.
    pub current: f64,
    /// Volts.
    pub voltage: f64,
    /// Watts.
    pub power: f64,
}

/// Telemetry or command acknowledgement emitted by a device, and the
/// snapshot shape the gateway returns for status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceUpdate {
    pub device_id: DeviceId,
    pub kind: DeviceKind,
    pub current_status: DeviceStatus,
    pub temperature_humidity: Option<TemperatureHumidity>,
    pub current_sensor: Option<CurrentReading>,
    /// Sampling period in milliseconds.
    pub frequency_ms: Option<u32>,
    pub custom_config_status: Option<BoxStr>,
}

impl DeviceUpdate {
    /// An update carrying only a status.
    pub fn status_only(device_id: DeviceId, kind: DeviceKind, status: DeviceStatus) -> Self {
        Self {
            device_id,
            kind,
            current_status: status,
            temperature_humidity: None,
            current_sensor: None,
            frequency_ms: None,
            custom_config_status: None,
        }
    }
}

/// Periodic multicast announcement of where the gateway can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryAnnouncement {
    pub gateway_ip: IpAddr,
    pub tcp_port: u16,
    pub udp_port: u16,
    pub mqtt_broker_ip: Option<BoxStr>,
    pub mqtt_broker_port: Option<u16>,
}

/// The outermost wire message. Exactly one variant per message; the variant
/// index written by the serializer is the tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Envelope {
    ClientRequest(ClientRequest),
    GatewayResponse(GatewayResponse),
    DeviceInfo(DeviceInfo),
    DeviceUpdate(DeviceUpdate),
    DiscoveryAnnouncement(DiscoveryAnnouncement),
}

impl Envelope {
    /// Name of the populated variant, for logging.
    pub fn tag(&self) -> &'static str {
        match self {
            Envelope::ClientRequest(_) => "CLIENT_REQUEST",
            Envelope::GatewayResponse(_) => "GATEWAY_RESPONSE",
            Envelope::DeviceInfo(_) => "DEVICE_INFO",
            Envelope::DeviceUpdate(_) => "DEVICE_UPDATE",
            Envelope::DiscoveryAnnouncement(_) => "DISCOVERY_ANNOUNCEMENT",
        }
    }
}
