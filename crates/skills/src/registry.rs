use std::collections::HashMap;
use std::path::Path;

use crate::loader::scan_skills;
use crate::types::SkillSpec;

/// Immutable name → skill lookup built at config apply time.
#[derive(Debug, Default, Clone)]
pub struct SkillRegistry {
    skills: HashMap<String, SkillSpec>,
}

impl SkillRegistry {
    /// Scan the given roots and keep the skills in `enabled` (all
    /// discovered skills when `enabled` is empty). First root wins on
    /// name collision.
    pub fn load(paths: &[impl AsRef<Path>], enabled: &[String]) -> Self {
        let mut skills = HashMap::new();
        for root in paths {
            for spec in scan_skills(root.as_ref()) {
                if !enabled.is_empty() && !enabled.iter().any(|n| n == &spec.name) {
                    continue;
                }
                skills.entry(spec.name.clone()).or_insert(spec);
            }
        }
        tracing::debug!(count = skills.len(), "skill registry loaded");
        Self { skills }
    }

    pub fn resolve(&self, name: &str) -> Option<&SkillSpec> {
        self.skills.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.skills.contains_key(name)
    }

    /// All skills, sorted by name for deterministic prompt rendering.
    pub fn list(&self) -> Vec<&SkillSpec> {
        let mut specs: Vec<&SkillSpec> = self.skills.values().collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }
}
