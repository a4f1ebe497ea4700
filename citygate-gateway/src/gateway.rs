//! Wiring of every gateway service around one registry.

use std::net::SocketAddr;
use std::sync::Arc;

use citygate_core::DiscoveryAnnouncement;
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::api::{self, AppState};
use crate::bridge::actuator::{DirectActuatorBridge, RpcActuatorBridge};
use crate::bridge::mqtt::{self, Correlator, InboundRouter, MqttSensorBridge};
use crate::bridge::{ActuatorBridge, SensorBridge};
use crate::config::Config;
use crate::discovery::{self, DiscoveryBroadcaster};
use crate::ingest;
use crate::listener::{self, ConnectionHandler};
use crate::registry::{self, DeviceRegistry, TransportPolicy};
use crate::router::CommandRouter;

/// A gateway whose sockets are bound but whose services are not yet running.
pub struct Gateway {
    config: Config,
    registry: DeviceRegistry,
    router: CommandRouter,
    tcp: TcpListener,
    client: Option<TcpListener>,
    udp: UdpSocket,
    http: Option<TcpListener>,
    mqtt: Option<(rumqttc::AsyncClient, rumqttc::EventLoop, InboundRouter)>,
}

impl Gateway {
    /// Bind every configured socket. Any bind failure is fatal.
    pub async fn bind(config: Config) -> color_eyre::Result<Self> {
        let tcp = TcpListener::bind(config.server.tcp_addr).await?;
        let client = match config.server.client_addr {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };
        let udp = UdpSocket::bind(config.server.udp_addr).await?;
        let http = if config.http.enabled {
            Some(TcpListener::bind(config.http.addr).await?)
        } else {
            None
        };

        let registry = DeviceRegistry::new(TransportPolicy {
            command_topic_prefix: config.mqtt.command_topic_prefix.clone(),
            actuator_bridge: config.actuator.bridge_addr().is_some(),
        });

        let actuators: Arc<dyn ActuatorBridge> = match config.actuator.bridge_addr() {
            Some(addr) => {
                info!(%addr, "actuator commands go through the rpc bridge");
                Arc::new(RpcActuatorBridge::new(addr, config.actuator.timeout()))
            }
            None => {
                info!("actuator commands go straight to devices");
                Arc::new(DirectActuatorBridge::new(config.actuator.timeout()))
            }
        };

        let (sensors, mqtt) = if config.mqtt.enabled {
            let (client, eventloop) = mqtt::connect(&config.mqtt);
            let correlator = Arc::new(Correlator::new());
            let inbound = InboundRouter {
                registry: registry.clone(),
                correlator: correlator.clone(),
                command_prefix: config.mqtt.command_topic_prefix.clone(),
                telemetry_prefix: config.mqtt.telemetry_topic_prefix.clone(),
            };
            let bridge: Arc<dyn SensorBridge> = Arc::new(MqttSensorBridge::new(
                client.clone(),
                correlator,
                config.mqtt.response_timeout(),
            ));
            (Some(bridge), Some((client, eventloop, inbound)))
        } else {
            info!("mqtt disabled, sensor commands will fail");
            (None, None)
        };

        let router = CommandRouter::new(registry.clone(), sensors, actuators);

        Ok(Self {
            config,
            registry,
            router,
            tcp,
            client,
            udp,
            http,
            mqtt,
        })
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn tcp_addr(&self) -> std::io::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.client.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn udp_addr(&self) -> std::io::Result<SocketAddr> {
        self.udp.local_addr()
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http.as_ref().and_then(|l| l.local_addr().ok())
    }

    async fn announcement(
        config: &Config,
        tcp: &TcpListener,
        udp: &UdpSocket,
    ) -> color_eyre::Result<DiscoveryAnnouncement> {
        let gateway_ip = match config.gateway.advertise_ip {
            Some(ip) => ip,
            None => discovery::detect_local_ip().await,
        };
        let mqtt = config.mqtt.enabled.then_some(&config.mqtt);

        Ok(DiscoveryAnnouncement {
            gateway_ip,
            tcp_port: tcp.local_addr()?.port(),
            udp_port: udp.local_addr()?.port(),
            mqtt_broker_ip: mqtt.map(|m| m.host.as_str().into()),
            mqtt_broker_port: mqtt.map(|m| m.port),
        })
    }

    /// Run every service until `cancel` fires, then wait for them to stop.
    pub async fn run(self, cancel: CancellationToken) -> color_eyre::Result<()> {
        let mut tasks: JoinSet<std::io::Result<()>> = JoinSet::new();

        let Self {
            config,
            registry,
            router,
            tcp,
            client,
            udp,
            http,
            mqtt,
        } = self;

        if config.discovery.enabled {
            let announcement = Self::announcement(&config, &tcp, &udp).await?;
            info!(
                gateway_ip = %announcement.gateway_ip,
                group = %config.discovery.group,
                "announcing gateway"
            );
            let broadcaster = DiscoveryBroadcaster::bind(
                config.discovery.group,
                config.discovery.interval(),
                &announcement,
            )
            .await?;
            let cancel = cancel.clone();
            tasks.spawn(async move {
                broadcaster.run(cancel).await;
                Ok(())
            });
        }

        let sweeper = registry::run_sweeper(
            registry.clone(),
            config.registry.sweep_interval(),
            config.registry.ttl(),
            cancel.clone(),
        );
        tasks.spawn(async move {
            sweeper.await;
            Ok(())
        });

        if let Some((client, eventloop, inbound)) = mqtt {
            let event_loop = mqtt::run_event_loop(client, eventloop, inbound, cancel.clone());
            tasks.spawn(async move {
                event_loop.await;
                Ok(())
            });
        }

        let handler = ConnectionHandler {
            registry: registry.clone(),
            router: router.clone(),
            idle_timeout: config.listener.idle_timeout(),
        };
        tasks.spawn(listener::run(tcp, handler.clone(), cancel.clone()));
        if let Some(client) = client {
            tasks.spawn(listener::run(client, handler, cancel.clone()));
        }

        let ingest = ingest::run(udp, registry.clone(), cancel.clone());
        tasks.spawn(async move {
            ingest.await;
            Ok(())
        });

        if let Some(http) = http {
            let app = api::router(AppState { registry, router });
            let cancel_for_http = cancel.clone();
            tasks.spawn(async move {
                info!(addr = ?http.local_addr().ok(), "http api listening");
                let result = axum::serve(http, app)
                    .with_graceful_shutdown(async move { cancel_for_http.cancelled().await })
                    .await;
                if let Err(e) = result {
                    error!(error = ?e, "http server error");
                }
                info!("http api shut down");
                Ok(())
            });
        }

        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failure.get_or_insert(e);
                }
                Err(e) => error!(error = %e, "gateway task panicked"),
            }
        }

        match failure {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}
