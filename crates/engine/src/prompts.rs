//! Prompt template files with an mtime-keyed in-memory cache.
//!
//! Templates live as plain text next to the deployment; each has a
//! compiled-in fallback so a missing file never breaks a request.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::SystemTime;

use parking_lot::Mutex;

/// Fallback base system prompt.
pub const BASE_SYSTEM_FALLBACK: &str = include_str!("../prompts/base_system.txt");
/// Fallback compaction instruction.
pub const COMPACTION_FALLBACK: &str = include_str!("../prompts/compact_prompt.txt");
/// Fallback long-term-memory summary instruction.
pub const MEMORY_SUMMARY_FALLBACK: &str = include_str!("../prompts/memory_summary.txt");

struct CachedTemplate {
    mtime: SystemTime,
    text: String,
}

pub struct PromptTemplates {
    dir: PathBuf,
    cache: Mutex<HashMap<String, CachedTemplate>>,
}

impl PromptTemplates {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Load `<dir>/<name>.txt`, re-reading when the file's mtime moved.
    /// Returns `fallback` when the file is absent or unreadable.
    pub fn load(&self, name: &str, fallback: &str) -> String {
        let path = self.dir.join(format!("{name}.txt"));
        let mtime = match std::fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(mtime) => mtime,
            Err(_) => return fallback.trim().to_string(),
        };

        {
            let cache = self.cache.lock();
            if let Some(cached) = cache.get(name) {
                if cached.mtime == mtime {
                    return cached.text.clone();
                }
            }
        }

        match std::fs::read_to_string(&path) {
            Ok(raw) => {
                let text = raw.trim().to_string();
                self.cache.lock().insert(
                    name.to_string(),
                    CachedTemplate {
                        mtime,
                        text: text.clone(),
                    },
                );
                text
            }
            Err(_) => fallback.trim().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_uses_fallback() {
        let tmp = tempfile::tempdir().unwrap();
        let templates = PromptTemplates::new(tmp.path());
        assert_eq!(templates.load("nope", "fallback text"), "fallback text");
    }

    #[test]
    fn file_read_and_cached() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("base.txt"), "  from file  \n").unwrap();
        let templates = PromptTemplates::new(tmp.path());
        assert_eq!(templates.load("base", "fb"), "from file");
        // second load hits the cache
        assert_eq!(templates.load("base", "fb"), "from file");
    }

    #[test]
    fn mtime_change_invalidates() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("base.txt");
        std::fs::write(&path, "v1").unwrap();
        let templates = PromptTemplates::new(tmp.path());
        assert_eq!(templates.load("base", "fb"), "v1");

        std::fs::write(&path, "v2").unwrap();
        // nudge the mtime forward in case the writes landed in the same tick
        let future = SystemTime::now() + std::time::Duration::from_secs(2);
        let file = std::fs::File::open(&path).unwrap();
        let _ = file.set_modified(future);
        assert_eq!(templates.load("base", "fb"), "v2");
    }

    #[test]
    fn compiled_fallbacks_are_nonempty() {
        assert!(!BASE_SYSTEM_FALLBACK.trim().is_empty());
        assert!(!COMPACTION_FALLBACK.trim().is_empty());
        assert!(!MEMORY_SUMMARY_FALLBACK.trim().is_empty());
    }
}
