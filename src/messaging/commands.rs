//! Wire payloads exchanged with host agents

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::domain::{
    FileTemplate, GameConfig, ParameterDefinition, PortBinding, ServerGameConfig,
    SessionParameters,
};
use crate::services::config_resolver::{RenderedConfiguration, VolumeMount};

/// Session command understood by host agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostAction {
    Start,
    Stop,
    SendInput,
}

impl HostAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostAction::Start => "start",
            HostAction::Stop => "stop",
            HostAction::SendInput => "send_input",
        }
    }
}

impl fmt::Display for HostAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// `command.host.<server_id>.session.<action>`
pub fn routing_key(server_id: i64, action: HostAction) -> String {
    format!("command.host.{}.session.{}", server_id, action.as_str())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameConfigPayload {
    pub image: String,
    pub args_template: String,
    pub env_template: BTreeMap<String, String>,
    pub files: Vec<FileTemplate>,
    pub parameters: Vec<ParameterDefinition>,
    pub entrypoint: Vec<String>,
    pub command: Vec<String>,
    pub volumes: Vec<VolumeMount>,
}

impl GameConfigPayload {
    pub fn new(config: &GameConfig, volumes: Vec<VolumeMount>) -> Self {
        Self {
            image: config.image.clone(),
            args_template: config.args_template.clone(),
            env_template: config.env_template.clone(),
            files: config.files.clone(),
            parameters: config.parameters.clone(),
            entrypoint: config.entrypoint.clone(),
            command: config.command.clone(),
            volumes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerGameConfigPayload {
    pub port_bindings: Vec<PortBinding>,
    pub parameters: BTreeMap<String, String>,
}

impl From<&ServerGameConfig> for ServerGameConfigPayload {
    fn from(sgc: &ServerGameConfig) -> Self {
        Self {
            port_bindings: sgc.port_bindings.clone(),
            parameters: sgc.parameters.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartSessionCommand {
    pub session_id: i64,
    pub sgc_id: i64,
    pub game_config: GameConfigPayload,
    pub server_game_config: ServerGameConfigPayload,
    pub parameters: SessionParameters,
    pub force: bool,
    /// Rendered non-volume strategies, in apply order
    #[serde(default)]
    pub configurations: Vec<RenderedConfiguration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopSessionCommand {
    pub session_id: i64,
    pub sgc_id: i64,
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendInputCommand {
    pub session_id: i64,
    pub sgc_id: i64,
    #[serde(with = "base64_bytes")]
    pub input: Vec<u8>,
}

/// Host agent reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandReply {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub correlation_id: String,
}

impl CommandReply {
    pub fn ok(correlation_id: impl Into<String>) -> Self {
        Self {
            success: true,
            error: None,
            correlation_id: correlation_id.into(),
        }
    }

    pub fn failed(correlation_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            correlation_id: correlation_id.into(),
        }
    }

    /// Agent-supplied failure reason, if any
    pub fn error_message(&self) -> &str {
        match self.error.as_deref() {
            Some(e) if !e.is_empty() => e,
            _ => "unspecified error",
        }
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_keys() {
        assert_eq!(
            routing_key(1, HostAction::Start),
            "command.host.1.session.start"
        );
        assert_eq!(
            routing_key(42, HostAction::SendInput),
            "command.host.42.session.send_input"
        );
    }

    #[test]
    fn test_send_input_encodes_base64() {
        let cmd = SendInputCommand {
            session_id: 3,
            sgc_id: 9,
            input: b"say hi\n".to_vec(),
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["input"], "c2F5IGhpCg==");
    }

    #[test]
    fn test_reply_tolerates_missing_fields() {
        let reply: CommandReply = serde_json::from_str(r#"{"success": false, "error": ""}"#).unwrap();
        assert!(!reply.success);
        assert_eq!(reply.correlation_id, "");
        assert_eq!(reply.error_message(), "unspecified error");
    }
}
