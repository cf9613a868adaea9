use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::port::PortBinding;

/// File written into the container before start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTemplate {
    pub path: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

/// Parameter value type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    #[default]
    String,
    Int,
    Bool,
    Secret,
}

/// Parameter a GameConfig accepts at session start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterDefinition {
    pub key: String,
    #[serde(default)]
    pub param_type: ParameterType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

/// Named preset for running a Game
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameConfig {
    pub config_id: i64,
    pub game_id: i64,
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub args_template: String,
    #[serde(default)]
    pub env_template: BTreeMap<String, String>,
    #[serde(default)]
    pub files: Vec<FileTemplate>,
    #[serde(default)]
    pub parameters: Vec<ParameterDefinition>,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub command: Vec<String>,
}

/// A GameConfig deployed onto one server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerGameConfig {
    pub sgc_id: i64,
    pub server_id: i64,
    pub game_config_id: i64,
    #[serde(default)]
    pub port_bindings: Vec<PortBinding>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}
