use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use skein_core::definition::AgentDefinition;
use skein_core::error::Result;
use skein_core::plan::Plan;
use skein_core::traits::ResourceCatalog;

use crate::compiler;

/// Compiled plans keyed by `(project, definition, entry point)`.
///
/// Compilation is deterministic, so a racing double-compile produces an
/// identical plan; last writer wins harmlessly. Running activations pin
/// their own copy and never read the cache again.
#[derive(Default)]
pub struct PlanCache {
    plans: RwLock<HashMap<(String, String, String), Arc<Plan>>>,
}

impl PlanCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, project_id: &str, definition: &str, entry_point: &str) -> Option<Arc<Plan>> {
        self.plans
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(
                project_id.to_string(),
                definition.to_string(),
                entry_point.to_string(),
            ))
            .cloned()
    }

    pub async fn get_or_compile(
        &self,
        catalog: &dyn ResourceCatalog,
        definition: &AgentDefinition,
        entry_point: &str,
    ) -> Result<Arc<Plan>> {
        if let Some(plan) = self.get(&definition.project_id, &definition.name, entry_point) {
            return Ok(plan);
        }

        let plan = Arc::new(compiler::compile(catalog, definition, entry_point).await?);
        self.plans
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                (
                    definition.project_id.clone(),
                    definition.name.clone(),
                    entry_point.to_string(),
                ),
                plan.clone(),
            );
        Ok(plan)
    }

    /// Drop cached plans for one definition (all entry points), e.g. after
    /// a definition edit.
    pub fn invalidate(&self, project_id: &str, definition: &str) {
        self.plans
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(p, d, _), _| !(p == project_id && d == definition));
    }
}
