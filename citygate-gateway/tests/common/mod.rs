#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use citygate_core::{
    ClientRequest, DeviceId, DeviceInfo, DeviceKind, DeviceStatus, DeviceUpdate, Envelope,
    GatewayResponse,
};
use citygate_gateway::Config;
use citygate_gateway::Gateway;
use citygate_gateway::config::ActuatorTransport;
use citygate_rpc::{read_envelope, write_envelope};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

pub struct RunningGateway {
    pub tcp: SocketAddr,
    pub udp: SocketAddr,
    pub http: SocketAddr,
    pub cancel: CancellationToken,
}

impl Drop for RunningGateway {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Everything on loopback ephemeral ports, nothing external enabled.
pub fn local_config() -> Config {
    let mut config = Config::default();
    config.server.tcp_addr = "127.0.0.1:0".parse().unwrap();
    config.server.udp_addr = "127.0.0.1:0".parse().unwrap();
    config.server.client_addr = None;
    config.http.addr = "127.0.0.1:0".parse().unwrap();
    config.discovery.enabled = false;
    config.mqtt.enabled = false;
    config.actuator.transport = ActuatorTransport::Direct;
    config.actuator.timeout_secs = 2;
    config
}

pub async fn start(config: Config) -> RunningGateway {
    let gateway = Gateway::bind(config).await.unwrap();
    let running = RunningGateway {
        tcp: gateway.tcp_addr().unwrap(),
        udp: gateway.udp_addr().unwrap(),
        http: gateway.http_addr().unwrap(),
        cancel: CancellationToken::new(),
    };
    let cancel = running.cancel.clone();
    tokio::spawn(async move { gateway.run(cancel).await });
    running
}

pub fn sensor(id: &str, status: DeviceStatus) -> DeviceInfo {
    DeviceInfo {
        device_id: id.into(),
        kind: DeviceKind::TemperatureSensor,
        ip: "".into(),
        port: 0,
        initial_state: status,
        is_sensor: true,
        is_actuator: false,
        capabilities: BTreeMap::new(),
    }
}

pub fn relay(id: &str, port: u16) -> DeviceInfo {
    DeviceInfo {
        device_id: id.into(),
        kind: DeviceKind::Relay,
        ip: "127.0.0.1".into(),
        port,
        initial_state: DeviceStatus::Off,
        is_sensor: false,
        is_actuator: true,
        capabilities: BTreeMap::new(),
    }
}

pub async fn register(stream: &mut TcpStream, info: DeviceInfo) {
    write_envelope(stream, &Envelope::DeviceInfo(info))
        .await
        .unwrap();
}

pub async fn request(stream: &mut TcpStream, request: ClientRequest) -> GatewayResponse {
    write_envelope(stream, &Envelope::ClientRequest(request))
        .await
        .unwrap();
    match read_envelope(stream).await.unwrap() {
        Envelope::GatewayResponse(response) => response,
        other => panic!("expected a gateway response, got {}", other.tag()),
    }
}

pub async fn status_of(stream: &mut TcpStream, id: &str) -> DeviceUpdate {
    match request(
        stream,
        ClientRequest::GetDeviceStatus {
            target: DeviceId::from(id),
        },
    )
    .await
    {
        GatewayResponse::DeviceStatusUpdate { update, .. } => update,
        other => panic!("expected a status update, got {other:?}"),
    }
}

/// A relay that answers each command with `status`, up to `commands` times.
pub async fn fake_relay(status: DeviceStatus, commands: usize) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        for _ in 0..commands {
            let (mut stream, _) = listener.accept().await.unwrap();
            let Ok(Envelope::ClientRequest(ClientRequest::SendDeviceCommand { command, .. })) =
                read_envelope(&mut stream).await
            else {
                continue;
            };
            let reply = Envelope::DeviceUpdate(DeviceUpdate::status_only(
                command.device_id,
                DeviceKind::Relay,
                status,
            ));
            let _ = write_envelope(&mut stream, &reply).await;
        }
    });
    port
}

/// Poll until `check` holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..40 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not met in time");
}
