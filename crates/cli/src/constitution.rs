//! The base constitution and the user overlay.

use {anyhow::Result, ironcurtain_config::Home};

/// Principles compiled into the default policy. The user overlay in
/// `constitution-user.md` is appended verbatim and may refine or extend
/// these.
const BASE_CONSTITUTION: &str = "\
# IronCurtain Constitution

1. The agent owns its sandbox directory: reading, writing, and deleting
   files inside it needs no approval.
2. Reads outside the sandbox may expose private data; escalate them to
   the user unless a rule explicitly allows the location.
3. Writes outside the sandbox change the user's system; escalate them.
4. Deletions outside the sandbox are destructive; deny them.
5. Rewriting or discarding git history loses work even inside the
   sandbox; escalate it.
6. Network fetches may exfiltrate data; only allowlisted domains are
   acceptable without review.
7. Pushing to a git remote publishes data; only known remotes are
   acceptable without review.
8. Tools with no side effects and no resource arguments are harmless;
   allow them.
9. When no principle clearly applies, ask the user rather than guessing
   in either direction.
";

/// Load the effective constitution: base plus the user overlay.
pub fn load(home: &Home) -> Result<String> {
    let mut constitution = BASE_CONSTITUTION.to_string();
    let overlay = home.user_constitution();
    if overlay.exists() {
        let user = std::fs::read_to_string(&overlay)?;
        if !user.trim().is_empty() {
            constitution.push_str("\n# User overrides\n\n");
            constitution.push_str(&user);
        }
    }
    Ok(constitution)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_constitution_stands_alone() {
        let dir = tempfile::tempdir().unwrap();
        let home = Home::at(dir.path());
        let constitution = load(&home).unwrap();
        assert!(constitution.contains("owns its sandbox"));
        assert!(!constitution.contains("User overrides"));
    }

    #[test]
    fn user_overlay_is_appended() {
        let dir = tempfile::tempdir().unwrap();
        let home = Home::at(dir.path());
        std::fs::write(home.user_constitution(), "10. Never touch ~/finance.\n").unwrap();
        let constitution = load(&home).unwrap();
        assert!(constitution.contains("User overrides"));
        assert!(constitution.contains("Never touch ~/finance"));
    }
}
