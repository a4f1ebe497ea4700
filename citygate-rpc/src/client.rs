use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    ActuatorAction, ActuatorCall, ActuatorReply, ActuatorTarget, RpcError, RpcTcp, WireError,
    WireMessage,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Client {
    rpc: RpcTcp,
    timeout: Duration,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),
    #[error("unexpected response type")]
    UnexpectedResponse,
    #[error("error response: {0:?}")]
    ErrorResponse(WireError),
}

impl Client {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::with_buffer(stream, 1024)
    }

    pub fn with_buffer<S>(stream: S, buffer: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            rpc: RpcTcp::new(stream, buffer),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The connection is unusable once either side has gone away.
    pub fn is_closed(&self) -> bool {
        self.rpc.is_closed()
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        let response = self.rpc.call(WireMessage::Ping, self.timeout).await?;

        match response.payload {
            WireMessage::Pong => Ok(()),
            WireMessage::Error(err) => Err(ClientError::ErrorResponse(err)),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn actuate(
        &self,
        action: ActuatorAction,
        target: ActuatorTarget,
    ) -> Result<ActuatorReply, ClientError> {
        let response = self
            .rpc
            .call(
                WireMessage::Actuate(ActuatorCall { action, target }),
                self.timeout,
            )
            .await?;

        match response.payload {
            WireMessage::ActuatorReply(reply) => Ok(reply),
            WireMessage::Error(err) => Err(ClientError::ErrorResponse(err)),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn turn_on(&self, target: ActuatorTarget) -> Result<ActuatorReply, ClientError> {
        self.actuate(ActuatorAction::TurnOn, target).await
    }

    pub async fn turn_off(&self, target: ActuatorTarget) -> Result<ActuatorReply, ClientError> {
        self.actuate(ActuatorAction::TurnOff, target).await
    }

    pub async fn query_state(
        &self,
        target: ActuatorTarget,
    ) -> Result<ActuatorReply, ClientError> {
        self.actuate(ActuatorAction::QueryState, target).await
    }
}
