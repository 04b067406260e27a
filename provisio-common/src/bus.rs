use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// -----------------------------------------------------------------------------
// Commands accepted by the orchestrator command surface
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "create_vm")]
    CreateVm,
    #[serde(rename = "reinstall_vm")]
    ReinstallVm,
    #[serde(rename = "statistics")]
    Statistics,
    #[serde(rename = "tasks")]
    Tasks,
}

impl CommandType {
    pub const ALL: [CommandType; 5] = [
        CommandType::Ping,
        CommandType::CreateVm,
        CommandType::ReinstallVm,
        CommandType::Statistics,
        CommandType::Tasks,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Ping => "ping",
            CommandType::CreateVm => "create_vm",
            CommandType::ReinstallVm => "reinstall_vm",
            CommandType::Statistics => "statistics",
            CommandType::Tasks => "tasks",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == raw)
    }
}

/// Envelope echoed back with every command response.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CommandEnvelope {
    pub command_id: Uuid,
    pub command: String,
    pub received_at: DateTime<Utc>,
    pub result: serde_json::Value,
}

impl CommandEnvelope {
    pub fn new(command: &str, result: serde_json::Value) -> Self {
        Self {
            command_id: Uuid::new_v4(),
            command: command.to_string(),
            received_at: Utc::now(),
            result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_names_roundtrip() {
        for c in CommandType::ALL {
            assert_eq!(CommandType::parse(c.as_str()), Some(c));
            let json = serde_json::to_value(c).unwrap();
            assert_eq!(json, serde_json::json!(c.as_str()));
        }
        assert_eq!(CommandType::parse("CreateVM"), None);
    }
}
