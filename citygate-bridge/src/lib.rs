//! Actuator bridge service: RPC actuator calls in, envelope commands out.

pub mod config;

use std::time::Duration;

use citygate_rpc::device::{self, DeviceLinkError};
use citygate_rpc::{ActuatorCall, ActuatorReply, Server, WireError, WireErrorCode};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub struct BridgeState {
    pub device_timeout: Duration,
}

/// Build the RPC server that answers actuator calls on `listener`.
pub fn server(listener: TcpListener, device_timeout: Duration) -> Server<BridgeState> {
    Server::new(listener, BridgeState { device_timeout }).on_actuate(
        |call: ActuatorCall, _msg_id, state: &BridgeState| {
            let timeout = state.device_timeout;
            async move { actuate(call, timeout).await }
        },
    )
}

/// Perform one actuator call against the device itself.
pub async fn actuate(call: ActuatorCall, timeout: Duration) -> Result<ActuatorReply, WireError> {
    let device_id = call.target.device_id.clone();

    match device::actuate(call.action, call.target, timeout).await {
        Ok(reply) => {
            info!(
                %device_id,
                action = ?call.action,
                status = %reply.status,
                "actuator command executed"
            );
            Ok(reply)
        }
        Err(e) => {
            warn!(%device_id, error = %e, "actuator command failed");
            Err(to_wire_error(e))
        }
    }
}

fn to_wire_error(err: DeviceLinkError) -> WireError {
    let code = match &err {
        DeviceLinkError::Timeout(_) => WireErrorCode::DeviceTimeout,
        DeviceLinkError::Connect(_) => WireErrorCode::DeviceUnreachable,
        DeviceLinkError::Frame(_) | DeviceLinkError::UnexpectedReply(_) => {
            WireErrorCode::DeviceProtocol
        }
    };
    WireError {
        code,
        message: err.to_string().into(),
    }
}
