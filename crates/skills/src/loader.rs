use std::path::Path;

use serde::Deserialize;

use relay_domain::{Error, Result};

use crate::types::SkillSpec;

/// Frontmatter keys the loader understands; everything else rides along
/// verbatim in `SkillSpec::frontmatter`.
#[derive(Debug, Deserialize)]
struct Frontmatter {
    name: Option<String>,
    description: Option<String>,
    input_schema: Option<serde_yaml::Value>,
}

/// Split a SKILL.md into `(frontmatter_yaml, body)`. Returns `None` when
/// the document has no leading `---` fence.
pub fn parse_frontmatter(content: &str) -> Option<(&str, &str)> {
    let rest = content.strip_prefix("---")?;
    let rest = rest.strip_prefix('\n').or_else(|| rest.strip_prefix("\r\n"))?;
    let end = rest.find("\n---")?;
    let frontmatter = &rest[..end];
    let body = rest[end + 4..].trim_start_matches(['\r', '\n']);
    Some((frontmatter, body))
}

/// Load a skill from `<dir>/SKILL.md`. Returns `None` when the directory
/// has no SKILL.md or its frontmatter is unusable.
fn load_skill(skill_dir: &Path) -> Result<Option<SkillSpec>> {
    let md_path = skill_dir.join("SKILL.md");
    if !md_path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&md_path)?;
    let Some((raw_frontmatter, _body)) = parse_frontmatter(&content) else {
        return Ok(None);
    };
    let parsed: Frontmatter = serde_yaml::from_str(raw_frontmatter)
        .map_err(|e| Error::Config(format!("{}: {e}", md_path.display())))?;

    let name = match parsed.name {
        Some(name) if !name.trim().is_empty() => name.trim().to_string(),
        _ => skill_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
    };
    if name.is_empty() {
        return Ok(None);
    }

    let input_schema = match parsed.input_schema {
        Some(yaml) => serde_json::to_value(yaml)?,
        None => serde_json::json!({"type": "object", "additionalProperties": true}),
    };

    let path = md_path
        .canonicalize()
        .unwrap_or(md_path);

    Ok(Some(SkillSpec {
        name,
        description: parsed.description.unwrap_or_default(),
        path,
        input_schema,
        frontmatter: raw_frontmatter.to_string(),
    }))
}

/// Scan a skills root for `<skill>/SKILL.md` entries. Directories with
/// broken frontmatter are skipped with a warning.
pub fn scan_skills(skills_root: &Path) -> Vec<SkillSpec> {
    let mut specs = Vec::new();
    let Ok(read_dir) = std::fs::read_dir(skills_root) else {
        return specs;
    };
    let mut dirs: Vec<_> = read_dir
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    for dir in dirs {
        match load_skill(&dir) {
            Ok(Some(spec)) => specs.push(spec),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    skill_dir = %dir.display(),
                    error = %e,
                    "skipping skill with invalid SKILL.md"
                );
            }
        }
    }
    specs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_skill(root: &Path, dir: &str, content: &str) {
        let skill_dir = root.join(dir);
        std::fs::create_dir_all(&skill_dir).unwrap();
        std::fs::write(skill_dir.join("SKILL.md"), content).unwrap();
    }

    #[test]
    fn parse_frontmatter_splits_fences() {
        let content = "---\nname: demo\n---\nBody text";
        let (fm, body) = parse_frontmatter(content).unwrap();
        assert_eq!(fm, "name: demo");
        assert_eq!(body, "Body text");
    }

    #[test]
    fn parse_frontmatter_requires_fence() {
        assert!(parse_frontmatter("no fences here").is_none());
        assert!(parse_frontmatter("--- not a fence").is_none());
    }

    #[test]
    fn scan_collects_valid_skills() {
        let tmp = tempfile::tempdir().unwrap();
        write_skill(
            tmp.path(),
            "doc-writer",
            "---\nname: doc-writer\ndescription: writes docs\n---\nUse this skill to write docs.",
        );
        write_skill(tmp.path(), "broken", "no frontmatter at all");

        let specs = scan_skills(tmp.path());
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "doc-writer");
        assert_eq!(specs[0].description, "writes docs");
        assert!(specs[0].frontmatter.contains("name: doc-writer"));
        assert!(specs[0].path.ends_with("SKILL.md"));
    }

    #[test]
    fn name_falls_back_to_directory() {
        let tmp = tempfile::tempdir().unwrap();
        write_skill(tmp.path(), "implicit-name", "---\ndescription: d\n---\nbody");
        let specs = scan_skills(tmp.path());
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "implicit-name");
    }

    #[test]
    fn input_schema_from_frontmatter() {
        let tmp = tempfile::tempdir().unwrap();
        write_skill(
            tmp.path(),
            "typed",
            "---\nname: typed\ninput_schema:\n  type: object\n  properties:\n    topic:\n      type: string\n---\nbody",
        );
        let specs = scan_skills(tmp.path());
        assert_eq!(specs[0].input_schema["properties"]["topic"]["type"], "string");
    }
}
