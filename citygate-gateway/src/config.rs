use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub gateway: GatewayConfig,
    pub discovery: DiscoveryConfig,
    pub mqtt: MqttConfig,
    pub actuator: ActuatorConfig,
    pub registry: RegistryConfig,
    pub listener: ListenerConfig,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Device registration and command port.
    pub tcp_addr: SocketAddr,
    /// Telemetry datagram port.
    pub udp_addr: SocketAddr,
    /// Client-facing envelope port. Served by the same handler as `tcp_addr`.
    pub client_addr: Option<SocketAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tcp_addr: SocketAddr::from(([0, 0, 0, 0], 12345)),
            udp_addr: SocketAddr::from(([0, 0, 0, 0], 12346)),
            client_addr: Some(SocketAddr::from(([0, 0, 0, 0], 12347))),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address announced to devices. Detected from the default route when unset.
    pub advertise_ip: Option<IpAddr>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    pub group: SocketAddr,
    pub interval_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            group: SocketAddr::from(([224, 1, 1, 1], 5007)),
            interval_secs: 10,
        }
    }
}

impl DiscoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub client_id_prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    pub command_topic_prefix: String,
    pub telemetry_topic_prefix: String,
    /// How long a command waits for its correlated response.
    pub response_timeout_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "localhost".to_string(),
            port: 1883,
            client_id_prefix: "citygate".to_string(),
            username: None,
            password: None,
            keep_alive_secs: 30,
            command_topic_prefix: "commands/sensors".to_string(),
            telemetry_topic_prefix: "sensors".to_string(),
            response_timeout_secs: 10,
        }
    }
}

impl MqttConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ActuatorConfig {
    pub transport: ActuatorTransport,
    /// Bound on one actuator command, connect included.
    pub timeout_secs: u64,
}

/// How actuator commands leave the gateway.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ActuatorTransport {
    /// Through the RPC bridge service.
    Bridge { addr: SocketAddr },
    /// Straight to the actuator's registered address.
    Direct,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            transport: ActuatorTransport::Bridge {
                addr: SocketAddr::from(([127, 0, 0, 1], 50051)),
            },
            timeout_secs: 5,
        }
    }
}

impl ActuatorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn bridge_addr(&self) -> Option<SocketAddr> {
        match self.transport {
            ActuatorTransport::Bridge { addr } => Some(addr),
            ActuatorTransport::Direct => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Silence after which a device is evicted.
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 15,
            sweep_interval_secs: 1,
        }
    }
}

impl RegistryConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Connections silent for this long are closed.
    pub idle_timeout_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30,
        }
    }
}

impl ListenerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub addr: SocketAddr,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> color_eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}
