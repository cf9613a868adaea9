use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of configuration surface a strategy declares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyType {
    FileProperties,
    FileJson,
    FileYaml,
    FileIni,
    FileXml,
    FileLua,
    FileCustom,
    CliArgs,
    EnvVars,
    Volume,
}

impl StrategyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyType::FileProperties => "file_properties",
            StrategyType::FileJson => "file_json",
            StrategyType::FileYaml => "file_yaml",
            StrategyType::FileIni => "file_ini",
            StrategyType::FileXml => "file_xml",
            StrategyType::FileLua => "file_lua",
            StrategyType::FileCustom => "file_custom",
            StrategyType::CliArgs => "cli_args",
            StrategyType::EnvVars => "env_vars",
            StrategyType::Volume => "volume",
        }
    }

    pub fn is_volume(&self) -> bool {
        matches!(self, StrategyType::Volume)
    }
}

impl fmt::Display for StrategyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for StrategyType {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "file_properties" => Ok(StrategyType::FileProperties),
            "file_json" => Ok(StrategyType::FileJson),
            "file_yaml" => Ok(StrategyType::FileYaml),
            "file_ini" => Ok(StrategyType::FileIni),
            "file_xml" => Ok(StrategyType::FileXml),
            "file_lua" => Ok(StrategyType::FileLua),
            "file_custom" => Ok(StrategyType::FileCustom),
            "cli_args" => Ok(StrategyType::CliArgs),
            "env_vars" => Ok(StrategyType::EnvVars),
            "volume" => Ok(StrategyType::Volume),
            _ => Err(format!("Unknown strategy type: {}", s)),
        }
    }
}

/// Strategy-specific rendering options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RenderOptions {
    /// Volume source below the session's data directory on the host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_subpath: Option<String>,
    /// Mount options passed through to the host agent
    #[serde(default)]
    pub mount_options: BTreeMap<String, String>,
}

/// A declared configuration surface of a Game
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationStrategy {
    pub strategy_id: i64,
    pub game_id: i64,
    pub name: String,
    pub strategy_type: StrategyType,
    /// File path for file strategies, container path for volumes
    #[serde(default)]
    pub target_path: String,
    /// Empty means merge into whatever exists on the host
    #[serde(default)]
    pub base_template: String,
    #[serde(default)]
    pub render_options: RenderOptions,
    pub apply_order: i32,
}

/// Granularity a patch applies at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchScope {
    GameConfig,
    ServerGameConfig,
    Session,
}

impl PatchScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchScope::GameConfig => "game_config",
            PatchScope::ServerGameConfig => "server_game_config",
            PatchScope::Session => "session",
        }
    }
}

impl fmt::Display for PatchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for PatchScope {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "game_config" => Ok(PatchScope::GameConfig),
            "server_game_config" => Ok(PatchScope::ServerGameConfig),
            "session" => Ok(PatchScope::Session),
            _ => Err(format!("Unknown patch scope: {}", s)),
        }
    }
}

/// Content override bound to a strategy at one scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationPatch {
    pub patch_id: i64,
    pub strategy_id: i64,
    pub scope: PatchScope,
    /// Id of the game config, server game config or session the patch is bound to
    pub entity_id: i64,
    pub content: String,
}
