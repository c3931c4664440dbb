use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::{debug, info};

use crate::definition::{AgentDefinition, SkillDefinition};
use crate::error::{Result, SkeinError};
use crate::traits::ResourceCatalog;

/// Definitions not found under the caller's project fall back to this
/// namespace.
pub const SHARED_PROJECT: &str = "shared";

/// One definitions file: any number of agents and skills.
#[derive(Debug, Default, Deserialize)]
struct DefinitionFile {
    #[serde(default)]
    agents: Vec<AgentDefinition>,
    #[serde(default)]
    skills: Vec<SkillDefinition>,
}

/// In-memory resource catalog, loadable from a directory of TOML files.
#[derive(Default)]
pub struct MemoryCatalog {
    agents: RwLock<HashMap<(String, String), AgentDefinition>>,
    skills: RwLock<HashMap<(String, String), SkillDefinition>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_agent(&self, mut def: AgentDefinition) {
        if def.project_id.is_empty() {
            def.project_id = SHARED_PROJECT.to_string();
        }
        let key = (def.project_id.clone(), def.name.clone());
        self.agents
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, def);
    }

    pub fn add_skill(&self, mut def: SkillDefinition) {
        if def.project_id.is_empty() {
            def.project_id = SHARED_PROJECT.to_string();
        }
        let key = (def.project_id.clone(), def.name.clone());
        self.skills
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, def);
    }

    /// Load every `.toml` file in a directory. Definitions without a
    /// project id land in the shared namespace.
    pub fn load_dir(&self, dir: &Path) -> Result<usize> {
        let mut loaded = 0;
        let entries = std::fs::read_dir(dir)
            .map_err(|e| SkeinError::Config(format!("{}: {}", dir.display(), e)))?;

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            let content = std::fs::read_to_string(&path)?;
            let file: DefinitionFile = toml::from_str(&content)
                .map_err(|e| SkeinError::Config(format!("{}: {}", path.display(), e)))?;

            debug!(
                path = %path.display(),
                agents = file.agents.len(),
                skills = file.skills.len(),
                "Definitions file loaded"
            );
            loaded += file.agents.len() + file.skills.len();
            for agent in file.agents {
                self.add_agent(agent);
            }
            for skill in file.skills {
                self.add_skill(skill);
            }
        }

        info!(dir = %dir.display(), count = loaded, "Catalog loaded");
        Ok(loaded)
    }
}

impl ResourceCatalog for MemoryCatalog {
    fn agent(
        &self,
        project_id: &str,
        name: &str,
    ) -> BoxFuture<'_, Result<Option<AgentDefinition>>> {
        let project_id = project_id.to_string();
        let name = name.to_string();
        Box::pin(async move {
            let agents = self.agents.read().unwrap_or_else(|e| e.into_inner());
            let hit = agents
                .get(&(project_id, name.clone()))
                .or_else(|| agents.get(&(SHARED_PROJECT.to_string(), name)))
                .cloned();
            Ok(hit)
        })
    }

    fn skill(
        &self,
        project_id: &str,
        name: &str,
    ) -> BoxFuture<'_, Result<Option<SkillDefinition>>> {
        let project_id = project_id.to_string();
        let name = name.to_string();
        Box::pin(async move {
            let skills = self.skills.read().unwrap_or_else(|e| e.into_inner());
            let hit = skills
                .get(&(project_id, name.clone()))
                .or_else(|| skills.get(&(SHARED_PROJECT.to_string(), name)))
                .cloned();
            Ok(hit)
        })
    }
}
