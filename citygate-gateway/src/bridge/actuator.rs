use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use citygate_rpc::device::{self, DeviceLinkError};
use citygate_rpc::{
    ActuatorAction, ActuatorReply, ActuatorTarget, Client, ClientError, RpcError, WireErrorCode,
};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{ActuatorBridge, BridgeError};

/// Added to the device bound for a call through the bridge, so that a silent
/// device is reported by the bridge before the call itself expires.
const BRIDGE_HEADROOM: Duration = Duration::from_secs(1);

/// Actuator commands through the RPC bridge service. The connection is made
/// on first use and kept until a call fails.
pub struct RpcActuatorBridge {
    addr: SocketAddr,
    timeout: Duration,
    client: Mutex<Option<Arc<Client>>>,
}

impl RpcActuatorBridge {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self {
            addr,
            timeout,
            client: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<Client, BridgeError> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| BridgeError::Timeout(self.timeout))?
            .map_err(|e| {
                BridgeError::Transport(format!("actuator bridge {} unreachable: {e}", self.addr))
            })?;

        info!(addr = %self.addr, "connected to actuator bridge");
        Ok(Client::new(stream).with_timeout(self.timeout + BRIDGE_HEADROOM))
    }

    async fn cached(&self) -> Option<Arc<Client>> {
        self.client
            .lock()
            .await
            .as_ref()
            .filter(|c| !c.is_closed())
            .cloned()
    }

    /// The cached connection, or a fresh one when there is none or it closed.
    /// The lock is not held while connecting; when two callers connect at
    /// once, the first to finish is kept.
    async fn client(&self) -> Result<Arc<Client>, BridgeError> {
        if let Some(client) = self.cached().await {
            return Ok(client);
        }

        let fresh = Arc::new(self.connect().await?);

        let mut slot = self.client.lock().await;
        if let Some(existing) = slot.as_ref().filter(|c| !c.is_closed()) {
            return Ok(existing.clone());
        }
        *slot = Some(fresh.clone());
        Ok(fresh)
    }

    /// Forget `failed` unless another caller already replaced it.
    async fn discard(&self, failed: &Arc<Client>) {
        let mut slot = self.client.lock().await;
        if slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, failed)) {
            debug!("dropping actuator bridge connection after failure");
            *slot = None;
        }
    }
}

#[async_trait]
impl ActuatorBridge for RpcActuatorBridge {
    async fn actuate(
        &self,
        action: ActuatorAction,
        target: ActuatorTarget,
    ) -> Result<ActuatorReply, BridgeError> {
        let client = self.client().await?;

        match client.actuate(action, target).await {
            Ok(reply) => Ok(reply),
            Err(err) => {
                if !matches!(err, ClientError::ErrorResponse(_)) {
                    self.discard(&client).await;
                }
                Err(map_client_error(err, self.timeout))
            }
        }
    }
}

fn map_client_error(err: ClientError, timeout: Duration) -> BridgeError {
    match err {
        ClientError::Rpc(RpcError::Timeout(_)) => BridgeError::Timeout(timeout + BRIDGE_HEADROOM),
        ClientError::ErrorResponse(wire) => match wire.code {
            WireErrorCode::DeviceTimeout => BridgeError::Timeout(timeout),
            _ => BridgeError::Transport(wire.message.into()),
        },
        other => BridgeError::Transport(other.to_string()),
    }
}

/// Actuator commands sent straight to the device.
pub struct DirectActuatorBridge {
    timeout: Duration,
}

impl DirectActuatorBridge {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ActuatorBridge for DirectActuatorBridge {
    async fn actuate(
        &self,
        action: ActuatorAction,
        target: ActuatorTarget,
    ) -> Result<ActuatorReply, BridgeError> {
        let device_id = target.device_id.clone();

        device::actuate(action, target, self.timeout)
            .await
            .map_err(|e| match e {
                DeviceLinkError::Timeout(t) => BridgeError::Timeout(t),
                other => {
                    warn!(%device_id, error = %other, "actuator command failed");
                    BridgeError::Transport(other.to_string())
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use citygate_core::{ClientRequest, DeviceKind, DeviceStatus, DeviceUpdate, Envelope};
    use citygate_rpc::{read_envelope, write_envelope};
    use tokio::net::TcpListener;

    use super::*;

    async fn fake_relay(status: DeviceStatus) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let Envelope::ClientRequest(ClientRequest::SendDeviceCommand { command, .. }) =
                read_envelope(&mut stream).await.unwrap()
            else {
                panic!("expected a command");
            };
            let reply = Envelope::DeviceUpdate(DeviceUpdate::status_only(
                command.device_id,
                DeviceKind::Relay,
                status,
            ));
            write_envelope(&mut stream, &reply).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn direct_bridge_returns_reported_status() {
        let port = fake_relay(DeviceStatus::On).await;
        let bridge = DirectActuatorBridge::new(Duration::from_secs(2));

        let reply = bridge
            .actuate(
                ActuatorAction::TurnOn,
                ActuatorTarget {
                    device_id: "relay_1".into(),
                    host: "127.0.0.1".into(),
                    port,
                },
            )
            .await
            .unwrap();

        assert_eq!(reply.status, DeviceStatus::On);
    }

    #[tokio::test]
    async fn unreachable_rpc_bridge_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let bridge = RpcActuatorBridge::new(addr, Duration::from_secs(1));
        let err = bridge
            .actuate(
                ActuatorAction::TurnOff,
                ActuatorTarget {
                    device_id: "relay_1".into(),
                    host: "127.0.0.1".into(),
                    port: 1,
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, BridgeError::Transport(_)));
    }

    fn relay_target() -> ActuatorTarget {
        ActuatorTarget {
            device_id: "relay_1".into(),
            host: "127.0.0.1".into(),
            port: 1,
        }
    }

    #[tokio::test]
    async fn concurrent_calls_to_silent_bridge_are_not_serialized() {
        // Accepts connections and never answers a call.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let timeout = Duration::from_millis(200);
        let bridge = Arc::new(RpcActuatorBridge::new(addr, timeout));
        let started = std::time::Instant::now();

        let calls: Vec<_> = (0..5)
            .map(|_| {
                let bridge = bridge.clone();
                tokio::spawn(async move { bridge.actuate(ActuatorAction::TurnOn, relay_target()).await })
            })
            .collect();
        for call in calls {
            assert!(matches!(call.await.unwrap(), Err(BridgeError::Timeout(_))));
        }

        // One call bound plus slack, not five of them back to back.
        assert!(started.elapsed() < (timeout + BRIDGE_HEADROOM) * 2);
    }

    #[tokio::test]
    async fn device_timeout_keeps_bridge_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let device_timeout = Duration::from_millis(200);
        let server = citygate_rpc::Server::new(listener, ()).on_actuate(move |_, _, _: &()| async move {
            tokio::time::sleep(device_timeout).await;
            Err(citygate_rpc::WireError {
                code: WireErrorCode::DeviceTimeout,
                message: "device did not answer".into(),
            })
        });
        let cancel = citygate_rpc::CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move { server.serve(token).await });

        // Same bound on both sides; the headroom lets the bridge answer first.
        let bridge = RpcActuatorBridge::new(addr, device_timeout);
        let err = bridge
            .actuate(ActuatorAction::TurnOff, relay_target())
            .await
            .unwrap_err();

        assert!(matches!(err, BridgeError::Timeout(t) if t == device_timeout));
        assert!(bridge.client.lock().await.is_some());
        cancel.cancel();
    }
}
