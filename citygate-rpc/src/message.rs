use citygate_core::{CommandKind, DeviceId, DeviceStatus};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Correlates a reply with the call that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Ulid);

impl MessageId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

/// One unit on the RPC connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub msg_id: MessageId,
    /// Set on replies to the `msg_id` of the originating call.
    pub reply_to: Option<MessageId>,
    pub payload: WireMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    Ping,
    Pong,
    Actuate(ActuatorCall),
    ActuatorReply(ActuatorReply),
    Error(WireError),
}

/// The operations an actuator supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActuatorAction {
    TurnOn,
    TurnOff,
    QueryState,
}

impl ActuatorAction {
    /// Actuators only understand on/off/query; anything else has no action.
    pub fn from_command(command: CommandKind) -> Option<Self> {
        match command {
            CommandKind::TurnOn => Some(ActuatorAction::TurnOn),
            CommandKind::TurnOff => Some(ActuatorAction::TurnOff),
            CommandKind::GetStatus => Some(ActuatorAction::QueryState),
            CommandKind::SetFrequency(_) => None,
        }
    }

    /// The command sent to the device for this action.
    pub fn command(&self) -> CommandKind {
        match self {
            ActuatorAction::TurnOn => CommandKind::TurnOn,
            ActuatorAction::TurnOff => CommandKind::TurnOff,
            ActuatorAction::QueryState => CommandKind::GetStatus,
        }
    }
}

/// Where an actuator accepts direct TCP commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuatorTarget {
    pub device_id: DeviceId,
    pub host: Box<str>,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuatorCall {
    pub action: ActuatorAction,
    pub target: ActuatorTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuatorReply {
    pub device_id: DeviceId,
    /// Status the actuator reported after executing the action.
    pub status: DeviceStatus,
    pub message: Box<str>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: WireErrorCode,
    pub message: Box<str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireErrorCode {
    /// No handler is registered for the request.
    Unsupported,
    DeviceUnreachable,
    DeviceTimeout,
    /// The device answered with something other than a status update.
    DeviceProtocol,
    Internal,
}
