//! In-memory device registry.
//!
//! The registry is the only state shared between listeners, bridges and the
//! router. Every operation takes the lock once, does its work and releases
//! it; nothing awaits network I/O while holding it.

mod record;

pub use record::*;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use citygate_core::{DeviceId, DeviceInfo, DeviceStatus};
use jiff::{SignedDuration, Timestamp};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("device {0} is not registered")]
    NotFound(DeviceId),
    #[error("device {0} is not a sensor")]
    NotASensor(DeviceId),
}

/// Decides the command transport for newly registered devices.
#[derive(Debug, Clone)]
pub struct TransportPolicy {
    pub command_topic_prefix: String,
    /// Actuators go through the RPC bridge when set, direct TCP otherwise.
    pub actuator_bridge: bool,
}

impl Default for TransportPolicy {
    fn default() -> Self {
        Self {
            command_topic_prefix: "commands/sensors".to_string(),
            actuator_bridge: false,
        }
    }
}

impl TransportPolicy {
    pub fn transport_for(&self, info: &DeviceInfo) -> Transport {
        if info.is_sensor {
            Transport::Mqtt {
                command_topic: format!("{}/{}", self.command_topic_prefix, info.device_id),
                response_topic: format!("{}/{}/response", self.command_topic_prefix, info.device_id),
            }
        } else if info.is_actuator && self.actuator_bridge {
            Transport::ActuatorBridge
        } else if info.is_actuator {
            Transport::DirectTcp
        } else {
            Transport::Unsupported
        }
    }
}

#[derive(Clone)]
pub struct DeviceRegistry {
    devices: Arc<RwLock<HashMap<DeviceId, DeviceRecord>>>,
    policy: Arc<TransportPolicy>,
}

impl DeviceRegistry {
    pub fn new(policy: TransportPolicy) -> Self {
        Self {
            devices: Arc::new(RwLock::new(HashMap::new())),
            policy: Arc::new(policy),
        }
    }

    /// Build a record from a registration message and upsert it.
    pub async fn register(&self, info: DeviceInfo, now: Timestamp) -> DeviceRecord {
        let address = (!info.ip.is_empty() && info.port != 0).then(|| Address {
            host: info.ip.clone(),
            port: info.port,
        });

        let record = DeviceRecord {
            transport: self.policy.transport_for(&info),
            id: info.device_id,
            kind: info.kind,
            address,
            roles: Roles {
                is_sensor: info.is_sensor,
                is_actuator: info.is_actuator,
            },
            status: info.initial_state,
            sensor_data: Default::default(),
            capabilities: info.capabilities,
            last_seen: now,
        };

        self.upsert(record).await
    }

    /// Insert a record, or merge it into the existing one. A merge keeps the
    /// existing status and unions sensor data, incoming keys winning.
    pub async fn upsert(&self, mut record: DeviceRecord) -> DeviceRecord {
        let mut devices = self.devices.write().await;

        if let Some(previous) = devices.remove(&record.id) {
            record.status = previous.status;
            let mut merged = previous.sensor_data;
            merged.append(&mut record.sensor_data);
            record.sensor_data = merged;
        }

        if !record.roles.is_sensor {
            record.sensor_data.clear();
        }

        devices.insert(record.id.clone(), record.clone());
        record
    }

    pub async fn get(&self, id: &DeviceId) -> Option<DeviceRecord> {
        self.devices.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<DeviceRecord> {
        self.devices.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }

    pub async fn update_status(
        &self,
        id: &DeviceId,
        status: DeviceStatus,
        observed_at: Timestamp,
    ) -> Result<(), RegistryError> {
        let mut devices = self.devices.write().await;
        let Some(record) = devices.get_mut(id) else {
            warn!(device_id = %id, %status, "status update for unknown device ignored");
            return Err(RegistryError::NotFound(id.clone()));
        };

        record.status = status;
        record.last_seen = observed_at;
        Ok(())
    }

    pub async fn merge_sensor_data(
        &self,
        id: &DeviceId,
        key: &str,
        value: SensorValue,
        observed_at: Timestamp,
    ) -> Result<(), RegistryError> {
        let mut devices = self.devices.write().await;
        let Some(record) = devices.get_mut(id) else {
            warn!(device_id = %id, key, "sensor data for unknown device ignored");
            return Err(RegistryError::NotFound(id.clone()));
        };

        if !record.roles.is_sensor {
            return Err(RegistryError::NotASensor(id.clone()));
        }

        record.sensor_data.insert(key.to_string(), value);
        record.last_seen = observed_at;
        Ok(())
    }

    /// Apply a status and readings in one critical section. Readings for a
    /// device that is not a sensor are discarded.
    pub async fn apply_telemetry(
        &self,
        id: &DeviceId,
        telemetry: Telemetry,
        observed_at: Timestamp,
    ) -> Result<DeviceRecord, RegistryError> {
        let mut devices = self.devices.write().await;
        let Some(record) = devices.get_mut(id) else {
            warn!(device_id = %id, "telemetry for unknown device ignored");
            return Err(RegistryError::NotFound(id.clone()));
        };

        if let Some(status) = telemetry.status {
            record.status = status;
        }

        if record.roles.is_sensor {
            record.sensor_data.extend(telemetry.readings);
        } else if !telemetry.readings.is_empty() {
            debug!(device_id = %id, "readings for non-sensor device discarded");
        }

        record.last_seen = observed_at;
        Ok(record.clone())
    }

    /// Remove every record last seen more than `ttl` before `now`.
    pub async fn sweep(&self, now: Timestamp, ttl: Duration) -> Vec<DeviceId> {
        let ttl = SignedDuration::try_from(ttl).unwrap_or(SignedDuration::MAX);
        let mut devices = self.devices.write().await;

        let stale: Vec<DeviceId> = devices
            .values()
            .filter(|record| now.duration_since(record.last_seen) > ttl)
            .map(|record| record.id.clone())
            .collect();

        for id in &stale {
            devices.remove(id);
        }

        stale
    }
}

/// Periodically evict stale devices until cancelled.
pub async fn run_sweeper(
    registry: DeviceRegistry,
    interval: Duration,
    ttl: Duration,
    cancel: CancellationToken,
) {
    info!(
        interval_secs = interval.as_secs(),
        ttl_secs = ttl.as_secs(),
        "registry sweeper started"
    );

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("registry sweeper shutting down");
                break;
            }
            _ = ticker.tick() => {
                for id in registry.sweep(Timestamp::now(), ttl).await {
                    info!(device_id = %id, "evicted stale device");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use citygate_core::DeviceKind;

    use super::*;

    fn sensor_info(id: &str, initial: DeviceStatus) -> DeviceInfo {
        DeviceInfo {
            device_id: id.into(),
            kind: DeviceKind::TemperatureSensor,
            ip: "".into(),
            port: 0,
            initial_state: initial,
            is_sensor: true,
            is_actuator: false,
            capabilities: BTreeMap::new(),
        }
    }

    fn relay_info(id: &str) -> DeviceInfo {
        DeviceInfo {
            device_id: id.into(),
            kind: DeviceKind::Relay,
            ip: "10.0.0.9".into(),
            port: 7000,
            initial_state: DeviceStatus::Off,
            is_sensor: false,
            is_actuator: true,
            capabilities: BTreeMap::new(),
        }
    }

    fn value(v: f64) -> SensorValue {
        SensorValue::number(v).unwrap()
    }

    #[tokio::test]
    async fn re_registration_keeps_status_and_sensor_data() {
        let registry = DeviceRegistry::new(TransportPolicy::default());
        let now = Timestamp::now();

        registry.register(sensor_info("temp_1", DeviceStatus::Active), now).await;
        registry
            .merge_sensor_data(&"temp_1".into(), TEMPERATURE, value(20.0), now)
            .await
            .unwrap();
        registry
            .update_status(&"temp_1".into(), DeviceStatus::Idle, now)
            .await
            .unwrap();

        let record = registry
            .register(sensor_info("temp_1", DeviceStatus::Active), now)
            .await;

        assert_eq!(registry.len().await, 1);
        assert_eq!(record.status, DeviceStatus::Idle);
        assert_eq!(record.sensor_data.get(TEMPERATURE), Some(&value(20.0)));
    }

    #[tokio::test]
    async fn registering_twice_keeps_first_status() {
        let registry = DeviceRegistry::new(TransportPolicy::default());
        let now = Timestamp::now();

        registry.register(sensor_info("temp_1", DeviceStatus::Active), now).await;
        let record = registry
            .register(sensor_info("temp_1", DeviceStatus::Off), now)
            .await;

        assert_eq!(record.status, DeviceStatus::Active);
    }

    #[tokio::test]
    async fn upsert_unions_sensor_data_with_newer_keys_winning() {
        let registry = DeviceRegistry::new(TransportPolicy::default());
        let now = Timestamp::now();
        let first = registry.register(sensor_info("temp_1", DeviceStatus::Active), now).await;

        let mut older = first.clone();
        older.sensor_data.insert(TEMPERATURE.into(), value(19.0));
        older.sensor_data.insert(HUMIDITY.into(), value(50.0));
        registry.upsert(older).await;

        let mut newer = first;
        newer.sensor_data.insert(TEMPERATURE.into(), value(22.0));
        let record = registry.upsert(newer).await;

        assert_eq!(record.sensor_data.get(TEMPERATURE), Some(&value(22.0)));
        assert_eq!(record.sensor_data.get(HUMIDITY), Some(&value(50.0)));
    }

    #[tokio::test]
    async fn updates_never_create_records() {
        let registry = DeviceRegistry::new(TransportPolicy::default());
        let now = Timestamp::now();
        let ghost: DeviceId = "ghost".into();

        assert_eq!(
            registry.update_status(&ghost, DeviceStatus::On, now).await,
            Err(RegistryError::NotFound(ghost.clone()))
        );
        assert_eq!(
            registry
                .merge_sensor_data(&ghost, TEMPERATURE, value(1.0), now)
                .await,
            Err(RegistryError::NotFound(ghost.clone()))
        );
        assert!(
            registry
                .apply_telemetry(&ghost, Telemetry::default(), now)
                .await
                .is_err()
        );
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn actuators_never_hold_sensor_data() {
        let registry = DeviceRegistry::new(TransportPolicy::default());
        let now = Timestamp::now();
        let id: DeviceId = "relay_1".into();
        registry.register(relay_info("relay_1"), now).await;

        assert_eq!(
            registry.merge_sensor_data(&id, TEMPERATURE, value(1.0), now).await,
            Err(RegistryError::NotASensor(id.clone()))
        );

        let mut telemetry = Telemetry {
            status: Some(DeviceStatus::On),
            readings: Vec::new(),
        };
        telemetry.push_number(TEMPERATURE, Some(30.0));
        let record = registry.apply_telemetry(&id, telemetry, now).await.unwrap();

        assert_eq!(record.status, DeviceStatus::On);
        assert!(record.sensor_data.is_empty());
    }

    #[tokio::test]
    async fn sweep_evicts_only_stale_records() {
        let registry = DeviceRegistry::new(TransportPolicy::default());
        let now = Timestamp::now();
        let old = now - SignedDuration::from_secs(20);

        registry.register(sensor_info("stale", DeviceStatus::Active), old).await;
        registry.register(sensor_info("fresh", DeviceStatus::Active), now).await;

        let before: Vec<_> = registry.list().await.into_iter().map(|r| r.id).collect();
        assert!(before.contains(&"stale".into()));

        let evicted = registry.sweep(now, Duration::from_secs(15)).await;
        assert_eq!(evicted, vec![DeviceId::from("stale")]);

        let after: Vec<_> = registry.list().await.into_iter().map(|r| r.id).collect();
        assert_eq!(after, vec![DeviceId::from("fresh")]);
    }

    #[test]
    fn transport_follows_roles_and_bridge_setting() {
        let bridged = TransportPolicy {
            actuator_bridge: true,
            ..TransportPolicy::default()
        };
        let direct = TransportPolicy::default();

        assert_eq!(
            direct.transport_for(&sensor_info("temp_1", DeviceStatus::Active)),
            Transport::Mqtt {
                command_topic: "commands/sensors/temp_1".into(),
                response_topic: "commands/sensors/temp_1/response".into(),
            }
        );
        assert_eq!(bridged.transport_for(&relay_info("r")), Transport::ActuatorBridge);
        assert_eq!(direct.transport_for(&relay_info("r")), Transport::DirectTcp);

        let mut neither = relay_info("x");
        neither.is_actuator = false;
        assert_eq!(direct.transport_for(&neither), Transport::Unsupported);
    }
}
