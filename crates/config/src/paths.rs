//! The `~/.ironcurtain/` home directory layout.

use std::path::{Path, PathBuf};

/// Resolved home directory with accessors for every well-known path.
#[derive(Debug, Clone)]
pub struct Home {
    base: PathBuf,
}

impl Home {
    /// Resolve the home directory: explicit override, `IRONCURTAIN_HOME`,
    /// then `~/.ironcurtain`.
    pub fn resolve(override_dir: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(dir) = override_dir {
            return Ok(Self { base: dir.to_path_buf() });
        }
        if let Ok(dir) = std::env::var("IRONCURTAIN_HOME") {
            return Ok(Self { base: PathBuf::from(dir) });
        }
        let base_dirs = directories::BaseDirs::new()
            .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
        Ok(Self {
            base: base_dirs.home_dir().join(".ironcurtain"),
        })
    }

    pub fn at(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Create every directory the runtime expects.
    pub fn ensure_layout(&self) -> std::io::Result<()> {
        for dir in [
            self.base.clone(),
            self.generated_dir(),
            self.ca_dir(),
            self.sandbox_dir(),
            self.escalations_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    /// User overrides appended to the base constitution.
    pub fn user_constitution(&self) -> PathBuf {
        self.base.join("constitution-user.md")
    }

    pub fn generated_dir(&self) -> PathBuf {
        self.base.join("generated")
    }

    pub fn compiled_policy(&self) -> PathBuf {
        self.generated_dir().join("compiled-policy.json")
    }

    pub fn tool_annotations(&self) -> PathBuf {
        self.generated_dir().join("tool-annotations.json")
    }

    pub fn test_scenarios(&self) -> PathBuf {
        self.generated_dir().join("test-scenarios.json")
    }

    pub fn dynamic_lists(&self) -> PathBuf {
        self.generated_dir().join("dynamic-lists.json")
    }

    pub fn llm_interactions(&self) -> PathBuf {
        self.generated_dir().join("llm-interactions.jsonl")
    }

    pub fn ca_dir(&self) -> PathBuf {
        self.base.join("ca")
    }

    /// Default agent-writable directory.
    pub fn sandbox_dir(&self) -> PathBuf {
        self.base.join("sandbox")
    }

    pub fn audit_log(&self) -> PathBuf {
        self.base.join("audit.jsonl")
    }

    /// Shared directory for escalation rendezvous files.
    pub fn escalations_dir(&self) -> PathBuf {
        self.base.join("escalations")
    }

    /// Captured user task context consumed by the auto-approver.
    pub fn user_context(&self) -> PathBuf {
        self.escalations_dir().join("user-context.json")
    }

    /// Paths no tool call may ever touch, regardless of policy.
    pub fn protected_paths(&self) -> Vec<PathBuf> {
        vec![
            self.config_file(),
            self.user_constitution(),
            self.generated_dir(),
            self.ca_dir(),
            self.audit_log(),
            self.escalations_dir(),
        ]
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_override_wins() {
        let home = Home::resolve(Some(Path::new("/tmp/ic-test"))).unwrap();
        assert_eq!(home.base(), Path::new("/tmp/ic-test"));
    }

    #[test]
    fn layout_paths_are_under_base() {
        let home = Home::at("/srv/ic");
        assert_eq!(home.config_file(), PathBuf::from("/srv/ic/config.json"));
        assert_eq!(
            home.compiled_policy(),
            PathBuf::from("/srv/ic/generated/compiled-policy.json")
        );
        assert_eq!(home.audit_log(), PathBuf::from("/srv/ic/audit.jsonl"));
    }

    #[test]
    fn protected_paths_cover_the_trusted_state() {
        let home = Home::at("/srv/ic");
        let protected = home.protected_paths();
        assert!(protected.contains(&home.audit_log()));
        assert!(protected.contains(&home.user_constitution()));
        assert!(protected.contains(&home.ca_dir()));
        // The sandbox itself is agent-writable, never protected.
        assert!(!protected.contains(&home.sandbox_dir()));
    }

    #[test]
    fn ensure_layout_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let home = Home::at(dir.path().join("home"));
        home.ensure_layout().unwrap();
        assert!(home.generated_dir().is_dir());
        assert!(home.ca_dir().is_dir());
        assert!(home.sandbox_dir().is_dir());
        assert!(home.escalations_dir().is_dir());
    }
}
