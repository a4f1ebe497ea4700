//! One-shot command exchange with a device over its direct TCP port.

use std::time::Duration;

use citygate_core::{ClientRequest, DeviceCommand, DeviceUpdate, Envelope};
use thiserror::Error;
use tokio::net::TcpStream;

use crate::{ActuatorAction, ActuatorReply, ActuatorTarget, FrameError, read_envelope, write_envelope};

#[derive(Debug, Error)]
pub enum DeviceLinkError {
    #[error("device did not answer within {0:?}")]
    Timeout(Duration),
    #[error("failed to connect to device: {0}")]
    Connect(#[source] std::io::Error),
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),
    #[error("device replied with {0} instead of a status update")]
    UnexpectedReply(&'static str),
}

/// Connect to `host:port`, send `command`, and wait for the device's
/// status update. The whole exchange is bounded by `timeout`.
#[tracing::instrument(skip(command), fields(device_id = %command.device_id, command = %command.command_type))]
pub async fn send_command(
    host: &str,
    port: u16,
    command: DeviceCommand,
    timeout: Duration,
) -> Result<DeviceUpdate, DeviceLinkError> {
    let exchange = async {
        let mut stream = TcpStream::connect((host, port))
            .await
            .map_err(DeviceLinkError::Connect)?;

        let request = Envelope::ClientRequest(ClientRequest::SendDeviceCommand {
            target: command.device_id.clone(),
            command,
        });
        write_envelope(&mut stream, &request).await?;

        match read_envelope(&mut stream).await? {
            Envelope::DeviceUpdate(update) => Ok(update),
            other => Err(DeviceLinkError::UnexpectedReply(other.tag())),
        }
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => Err(DeviceLinkError::Timeout(timeout)),
    }
}

/// Perform `action` on the actuator at `target` and report the status it
/// settled in.
pub async fn actuate(
    action: ActuatorAction,
    target: ActuatorTarget,
    timeout: Duration,
) -> Result<ActuatorReply, DeviceLinkError> {
    let command = action.command();
    let request = DeviceCommand {
        device_id: target.device_id.clone(),
        command_type: command.wire_name().into(),
        command_value: command.wire_value().into(),
    };

    let update = send_command(&target.host, target.port, request, timeout).await?;

    Ok(ActuatorReply {
        device_id: target.device_id,
        status: update.current_status,
        message: format!("{} executed", command.wire_name()).into(),
    })
}
