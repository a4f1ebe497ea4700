use std::fmt;

/// Canonical command set. Clients may name a command by any of several
/// synonyms; everything is normalized here before it reaches a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    TurnOn,
    TurnOff,
    GetStatus,
    /// New sampling period in milliseconds.
    SetFrequency(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnknownCommand {
    #[error("unrecognized command type: {0}")]
    Type(String),
    #[error("invalid value {value:?} for command {command}")]
    Value { command: &'static str, value: String },
}

impl CommandKind {
    pub fn parse(command_type: &str, command_value: &str) -> Result<Self, UnknownCommand> {
        match command_type.trim().to_ascii_uppercase().as_str() {
            "ON" | "TURN_ON" | "LIGAR" | "TURN_ACTIVE" => Ok(CommandKind::TurnOn),
            "OFF" | "TURN_OFF" | "DESLIGAR" | "TURN_IDLE" => Ok(CommandKind::TurnOff),
            "STATUS" | "GET_STATUS" | "CONSULTAR" => Ok(CommandKind::GetStatus),
            "SET_FREQ" | "SET_FREQUENCY" | "SET_SAMPLING_RATE" => {
                match command_value.trim().parse::<u32>() {
                    Ok(ms) if ms > 0 => Ok(CommandKind::SetFrequency(ms)),
                    _ => Err(UnknownCommand::Value {
                        command: "SET_FREQ",
                        value: command_value.to_string(),
                    }),
                }
            }
            _ => Err(UnknownCommand::Type(command_type.to_string())),
        }
    }

    /// Command name sent to devices.
    pub fn wire_name(&self) -> &'static str {
        match self {
            CommandKind::TurnOn => "TURN_ON",
            CommandKind::TurnOff => "TURN_OFF",
            CommandKind::GetStatus => "GET_STATUS",
            CommandKind::SetFrequency(_) => "SET_FREQ",
        }
    }

    /// Command value sent to devices.
    pub fn wire_value(&self) -> String {
        match self {
            CommandKind::SetFrequency(ms) => ms.to_string(),
            _ => String::new(),
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::SetFrequency(ms) => write!(f, "SET_FREQ({ms})"),
            other => f.write_str(other.wire_name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synonyms_normalize_to_one_kind() {
        for name in ["ON", "turn_on", "LIGAR", "TURN_ACTIVE"] {
            assert_eq!(CommandKind::parse(name, ""), Ok(CommandKind::TurnOn));
        }
        for name in ["OFF", "TURN_OFF", "desligar", "TURN_IDLE"] {
            assert_eq!(CommandKind::parse(name, ""), Ok(CommandKind::TurnOff));
        }
        for name in ["STATUS", "GET_STATUS", "CONSULTAR"] {
            assert_eq!(CommandKind::parse(name, ""), Ok(CommandKind::GetStatus));
        }
    }

    #[test]
    fn frequency_requires_positive_milliseconds() {
        assert_eq!(
            CommandKind::parse("SET_SAMPLING_RATE", "5000"),
            Ok(CommandKind::SetFrequency(5000))
        );
        assert!(CommandKind::parse("SET_FREQ", "0").is_err());
        assert!(CommandKind::parse("SET_FREQ", "fast").is_err());
    }

    #[test]
    fn unrecognized_types_are_rejected() {
        assert_eq!(
            CommandKind::parse("SELF_DESTRUCT", ""),
            Err(UnknownCommand::Type("SELF_DESTRUCT".into()))
        );
    }

    #[test]
    fn wire_form_uses_canonical_names() {
        let cmd = CommandKind::SetFrequency(2000);
        assert_eq!(cmd.wire_name(), "SET_FREQ");
        assert_eq!(cmd.wire_value(), "2000");
        assert_eq!(CommandKind::TurnOn.wire_value(), "");
    }
}
