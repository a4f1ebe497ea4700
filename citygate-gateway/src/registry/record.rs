use std::collections::BTreeMap;

use citygate_core::{
    CurrentReading, DeviceId, DeviceInfo, DeviceKind, DeviceStatus, DeviceUpdate,
    TemperatureHumidity,
};
use jiff::Timestamp;
use ordered_float::NotNan;
use serde::Serialize;

pub const TEMPERATURE: &str = "temperature";
pub const HUMIDITY: &str = "humidity";
pub const CURRENT: &str = "current";
pub const VOLTAGE: &str = "voltage";
pub const POWER: &str = "power";
pub const FREQUENCY_MS: &str = "frequency_ms";
pub const CUSTOM_CONFIG_STATUS: &str = "custom_config_status";

/// Last known value of one measurement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum SensorValue {
    Number(NotNan<f64>),
    Text(String),
}

impl SensorValue {
    /// `None` for NaN, which is never stored.
    pub fn number(value: f64) -> Option<Self> {
        NotNan::new(value).ok().map(SensorValue::Number)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SensorValue::Number(n) => Some(n.into_inner()),
            SensorValue::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub host: Box<str>,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Roles {
    pub is_sensor: bool,
    pub is_actuator: bool,
}

/// Which bridge carries commands for a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Mqtt {
        command_topic: String,
        response_topic: String,
    },
    /// Through the RPC actuator bridge service.
    ActuatorBridge,
    /// In-process TCP exchange with the actuator.
    DirectTcp,
    Unsupported,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub id: DeviceId,
    pub kind: DeviceKind,
    pub address: Option<Address>,
    pub roles: Roles,
    pub status: DeviceStatus,
    /// Only ever populated when `roles.is_sensor`.
    pub sensor_data: BTreeMap<String, SensorValue>,
    pub capabilities: BTreeMap<String, String>,
    pub last_seen: Timestamp,
    pub transport: Transport,
}

impl DeviceRecord {
    /// Public registration fields, as reported in device listings.
    pub fn to_info(&self) -> DeviceInfo {
        let (ip, port) = match &self.address {
            Some(addr) => (addr.host.clone(), addr.port),
            None => ("".into(), 0),
        };

        DeviceInfo {
            device_id: self.id.clone(),
            kind: self.kind,
            ip,
            port,
            initial_state: self.status,
            is_sensor: self.roles.is_sensor,
            is_actuator: self.roles.is_actuator,
            capabilities: self.capabilities.clone(),
        }
    }

    /// Status snapshot. Sensor groups are present only when every value in
    /// the group is known.
    pub fn snapshot(&self) -> DeviceUpdate {
        let mut update = DeviceUpdate::status_only(self.id.clone(), self.kind, self.status);
        if !self.roles.is_sensor {
            return update;
        }

        let number = |key: &str| self.sensor_data.get(key).and_then(SensorValue::as_f64);

        if let (Some(temperature), Some(humidity)) = (number(TEMPERATURE), number(HUMIDITY)) {
            update.temperature_humidity = Some(TemperatureHumidity {
                temperature,
                humidity,
            });
        }

        if let (Some(current), Some(voltage), Some(power)) =
            (number(CURRENT), number(VOLTAGE), number(POWER))
        {
            update.current_sensor = Some(CurrentReading {
                current,
                voltage,
                power,
            });
        }

        update.frequency_ms = number(FREQUENCY_MS)
            .filter(|ms| *ms >= 0.0 && *ms <= u32::MAX as f64)
            .map(|ms| ms as u32);

        update.custom_config_status = match self.sensor_data.get(CUSTOM_CONFIG_STATUS) {
            Some(SensorValue::Text(text)) => Some(text.as_str().into()),
            _ => None,
        };

        update
    }
}

/// A status change and a batch of measurements observed together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Telemetry {
    pub status: Option<DeviceStatus>,
    pub readings: Vec<(String, SensorValue)>,
}

impl Telemetry {
    pub fn push_number(&mut self, key: &str, value: Option<f64>) {
        if let Some(value) = value.and_then(SensorValue::number) {
            self.readings.push((key.to_string(), value));
        }
    }

    pub fn push_text(&mut self, key: &str, value: Option<&str>) {
        if let Some(value) = value {
            self.readings
                .push((key.to_string(), SensorValue::Text(value.to_string())));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.readings.is_empty()
    }
}

impl From<&DeviceUpdate> for Telemetry {
    fn from(update: &DeviceUpdate) -> Self {
        let mut telemetry = Telemetry {
            status: Some(update.current_status),
            readings: Vec::new(),
        };

        if let Some(th) = &update.temperature_humidity {
            telemetry.push_number(TEMPERATURE, Some(th.temperature));
            telemetry.push_number(HUMIDITY, Some(th.humidity));
        }
        if let Some(cs) = &update.current_sensor {
            telemetry.push_number(CURRENT, Some(cs.current));
            telemetry.push_number(VOLTAGE, Some(cs.voltage));
            telemetry.push_number(POWER, Some(cs.power));
        }
        telemetry.push_number(FREQUENCY_MS, update.frequency_ms.map(f64::from));
        telemetry.push_text(CUSTOM_CONFIG_STATUS, update.custom_config_status.as_deref());

        telemetry
    }
}
