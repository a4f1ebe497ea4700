//! Envelope listener for device registrations and client requests.

use std::net::SocketAddr;
use std::time::Duration;

use citygate_core::{ClientRequest, DeviceId, Envelope, GatewayResponse};
use citygate_rpc::{FrameError, read_envelope, write_envelope};
use jiff::Timestamp;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::registry::DeviceRegistry;
use crate::router::CommandRouter;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),
    #[error("idle for {0:?}")]
    Idle(Duration),
    #[error("unexpected {0} envelope")]
    Unexpected(&'static str),
}

/// Shared by every connection on every listening port.
#[derive(Clone)]
pub struct ConnectionHandler {
    pub registry: DeviceRegistry,
    pub router: CommandRouter,
    pub idle_timeout: Duration,
}

impl ConnectionHandler {
    /// Serve envelopes in arrival order until the peer closes.
    #[instrument(name = "connection", skip(self, stream, cancel))]
    pub async fn serve(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<(), ConnectionError> {
        loop {
            let envelope = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                read = tokio::time::timeout(self.idle_timeout, read_envelope(&mut stream)) => {
                    match read {
                        Err(_) => return Err(ConnectionError::Idle(self.idle_timeout)),
                        Ok(Err(FrameError::ConnectionClosed)) => {
                            debug!("peer closed connection");
                            return Ok(());
                        }
                        Ok(Err(e)) => return Err(e.into()),
                        Ok(Ok(envelope)) => envelope,
                    }
                }
            };

            debug!(tag = envelope.tag(), "envelope received");

            if let Some(response) = self.dispatch(envelope).await? {
                write_envelope(&mut stream, &Envelope::GatewayResponse(response)).await?;
            }
        }
    }

    /// Handle one envelope, returning the reply to send, if any.
    pub async fn dispatch(
        &self,
        envelope: Envelope,
    ) -> Result<Option<GatewayResponse>, ConnectionError> {
        match envelope {
            Envelope::DeviceInfo(info) => {
                let record = self.registry.register(info, Timestamp::now()).await;
                info!(
                    device_id = %record.id,
                    kind = %record.kind,
                    status = %record.status,
                    "device registered"
                );
                Ok(None)
            }
            Envelope::ClientRequest(request) => Ok(Some(self.client_request(request).await)),
            other => Err(ConnectionError::Unexpected(other.tag())),
        }
    }

    async fn client_request(&self, request: ClientRequest) -> GatewayResponse {
        match request {
            ClientRequest::ListDevices => {
                let devices: Box<[_]> = self
                    .registry
                    .list()
                    .await
                    .iter()
                    .map(|record| record.to_info())
                    .collect();
                let message = format!("{} devices", devices.len()).into();
                GatewayResponse::DeviceList { devices, message }
            }
            ClientRequest::GetDeviceStatus { target } => self.device_status(&target).await,
            ClientRequest::SendDeviceCommand { target, command } => {
                let outcome = self
                    .router
                    .route(&target, &command.command_type, &command.command_value)
                    .await;
                GatewayResponse::CommandAck {
                    status: outcome.status,
                    message: outcome.message.into(),
                    device_status: outcome.device_status,
                }
            }
        }
    }

    async fn device_status(&self, target: &DeviceId) -> GatewayResponse {
        match self.registry.get(target).await {
            Some(record) => GatewayResponse::DeviceStatusUpdate {
                update: record.snapshot(),
                message: "status retrieved".into(),
            },
            None => GatewayResponse::Error {
                message: format!("device {target} not found").into(),
            },
        }
    }
}

/// Accept connections on `listener` until cancelled, one task per connection.
/// A non-transient accept failure cancels `cancel`, taking the rest of the
/// gateway down with it, and is returned.
#[instrument(name = "tcp_listener", skip_all, fields(addr = ?listener.local_addr().ok()))]
pub async fn run(
    listener: TcpListener,
    handler: ConnectionHandler,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    info!("tcp listener started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("tcp listener shutting down");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let handler = handler.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handler.serve(stream, peer, cancel).await {
                                warn!(%peer, error = %e, "connection closed with error");
                            }
                        });
                    }
                    Err(e) => accept_failed(e, &cancel).await?,
                }
            }
        }
    }

    Ok(())
}

/// Back off after a transient accept error. Any other error cancels
/// `cancel` and is handed back.
async fn accept_failed(e: std::io::Error, cancel: &CancellationToken) -> std::io::Result<()> {
    if is_transient_error(&e) {
        warn!(error = %e, "failed to accept connection");
        sleep(Duration::from_millis(100)).await;
        Ok(())
    } else {
        error!(error = %e, "tcp listener failed, shutting down");
        cancel.cancel();
        Err(e)
    }
}

fn is_transient_error(e: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        e.kind(),
        ConnectionRefused | ConnectionAborted | ConnectionReset | OutOfMemory | Other
    )
}
