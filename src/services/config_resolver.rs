//! Configuration cascade
//!
//! Each non-volume strategy of a game renders in apply order:
//! base template, replaced by the game-config patch, with the
//! server-game-config patch appended line-wise. Volume strategies are turned
//! into mount descriptors instead.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::domain::{ConfigurationPatch, ConfigurationStrategy, PatchScope, StrategyType};
use crate::error::Result;
use crate::persistence::CatalogRepository;

/// One rendered configuration surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedConfiguration {
    pub strategy_name: String,
    pub strategy_type: StrategyType,
    pub target_path: String,
    /// The strategy's base template, untouched. Empty means the host agent
    /// merges into the file already on disk instead of writing a new one.
    pub base_content: String,
    pub rendered_content: String,
}

impl RenderedConfiguration {
    pub fn merges_into_existing(&self) -> bool {
        self.base_content.is_empty()
    }
}

/// Volume the host agent mounts into the container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub name: String,
    pub container_path: String,
    pub host_subpath: String,
    pub options: BTreeMap<String, String>,
}

impl From<&ConfigurationStrategy> for VolumeMount {
    fn from(strategy: &ConfigurationStrategy) -> Self {
        Self {
            name: strategy.name.clone(),
            container_path: strategy.target_path.clone(),
            host_subpath: strategy
                .render_options
                .host_subpath
                .clone()
                .unwrap_or_else(|| strategy.name.clone()),
            options: strategy.render_options.mount_options.clone(),
        }
    }
}

/// Everything the cascade produces for one session start
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedConfiguration {
    pub configurations: Vec<RenderedConfiguration>,
    pub volumes: Vec<VolumeMount>,
}

/// Apply the cascade to a single strategy.
///
/// The server-game-config layer is joined with a newline. That is adequate for
/// line-oriented formats (properties, CLI args) and is not a structural merge.
pub fn render_strategy(
    strategy: &ConfigurationStrategy,
    game_config_patch: Option<&ConfigurationPatch>,
    server_game_config_patch: Option<&ConfigurationPatch>,
) -> RenderedConfiguration {
    let mut rendered = strategy.base_template.clone();

    if let Some(patch) = game_config_patch {
        rendered = patch.content.clone();
    }

    if let Some(patch) = server_game_config_patch {
        if rendered.is_empty() {
            rendered = patch.content.clone();
        } else {
            rendered.push('\n');
            rendered.push_str(&patch.content);
        }
    }

    RenderedConfiguration {
        strategy_name: strategy.name.clone(),
        strategy_type: strategy.strategy_type,
        target_path: strategy.target_path.clone(),
        base_content: strategy.base_template.clone(),
        rendered_content: rendered,
    }
}

/// Resolves rendered configuration from the catalog
#[derive(Clone)]
pub struct ConfigResolver {
    catalog: Arc<dyn CatalogRepository>,
}

impl ConfigResolver {
    pub fn new(catalog: Arc<dyn CatalogRepository>) -> Self {
        Self { catalog }
    }

    /// Volume strategies of a game as mount descriptors
    pub async fn volumes(&self, game_id: i64) -> Result<Vec<VolumeMount>> {
        let strategies = self.catalog.list_strategies(game_id).await?;
        Ok(strategies
            .iter()
            .filter(|s| s.strategy_type.is_volume())
            .map(VolumeMount::from)
            .collect())
    }

    /// Render every non-volume strategy of the game for one SGC
    #[instrument(skip(self))]
    pub async fn render(
        &self,
        game_id: i64,
        game_config_id: i64,
        sgc_id: i64,
    ) -> Result<Vec<RenderedConfiguration>> {
        let strategies = self.catalog.list_strategies(game_id).await?;
        let mut rendered = Vec::with_capacity(strategies.len());

        for strategy in strategies.iter().filter(|s| !s.strategy_type.is_volume()) {
            let gc_patch = self
                .catalog
                .find_patch(strategy.strategy_id, PatchScope::GameConfig, game_config_id)
                .await?;
            let sgc_patch = self
                .catalog
                .find_patch(strategy.strategy_id, PatchScope::ServerGameConfig, sgc_id)
                .await?;

            rendered.push(render_strategy(
                strategy,
                gc_patch.as_ref(),
                sgc_patch.as_ref(),
            ));
        }

        debug!(
            "Rendered {} configuration strategies for sgc {}",
            rendered.len(),
            sgc_id
        );
        Ok(rendered)
    }

    /// Rendered strategies plus volume mounts
    pub async fn resolve(
        &self,
        game_id: i64,
        game_config_id: i64,
        sgc_id: i64,
    ) -> Result<ResolvedConfiguration> {
        Ok(ResolvedConfiguration {
            volumes: self.volumes(game_id).await?,
            configurations: self.render(game_id, game_config_id, sgc_id).await?,
        })
    }
}
