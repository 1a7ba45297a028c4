use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A skill definition synthesized from a `SKILL.md`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillSpec {
    pub name: String,
    pub description: String,
    /// Absolute path of the SKILL.md document.
    pub path: PathBuf,
    /// JSON Schema for invocation arguments. Defaults to a free-form
    /// object when the frontmatter declares none.
    pub input_schema: serde_json::Value,
    /// The YAML frontmatter, verbatim (without the `---` fences).
    pub frontmatter: String,
}

impl SkillSpec {
    /// Read the full SKILL.md body for execution.
    pub fn read_document(&self) -> std::io::Result<String> {
        std::fs::read_to_string(&self.path)
    }
}
