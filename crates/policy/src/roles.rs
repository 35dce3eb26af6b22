//! The argument-role registry: a closed vocabulary of semantic tags for tool
//! arguments.
//!
//! The registry is the single source of truth for argument semantics. The
//! annotator embeds each role's guidance into its prompt, the normalizer
//! picks a strategy from the role's category, and the engine uses the
//! sandbox-safety flag to decide which roles the containment shortcut may
//! discharge.

use serde::{Deserialize, Serialize};

/// Semantic role of a tool argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArgumentRole {
    ReadPath,
    WritePath,
    DeletePath,
    WriteHistory,
    DeleteHistory,
    FetchUrl,
    GitRemoteUrl,
    BranchName,
    CommitMessage,
    None,
}

/// How the normalizer should treat values carrying a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleCategory {
    Path,
    Url,
    Opaque,
}

/// Registry entry for one role.
#[derive(Debug, Clone, Copy)]
pub struct RoleSpec {
    pub category: RoleCategory,
    /// Whether values with this role name a concrete resource (path, URL).
    pub is_resource_identifier: bool,
    /// Sandbox containment is sufficient to auto-allow this role.
    pub sandbox_safe: bool,
    /// Natural-language hint embedded in the annotator prompt.
    pub annotation_guidance: &'static str,
    /// When set, the annotator may only apply this role to these servers.
    pub server_scope: Option<&'static [&'static str]>,
}

impl ArgumentRole {
    /// All roles, in registry order.
    pub const ALL: &'static [ArgumentRole] = &[
        ArgumentRole::ReadPath,
        ArgumentRole::WritePath,
        ArgumentRole::DeletePath,
        ArgumentRole::WriteHistory,
        ArgumentRole::DeleteHistory,
        ArgumentRole::FetchUrl,
        ArgumentRole::GitRemoteUrl,
        ArgumentRole::BranchName,
        ArgumentRole::CommitMessage,
        ArgumentRole::None,
    ];

    /// Registry lookup. The exhaustive match forces every new role to supply
    /// a complete definition.
    pub fn spec(self) -> RoleSpec {
        match self {
            ArgumentRole::ReadPath => RoleSpec {
                category: RoleCategory::Path,
                is_resource_identifier: true,
                sandbox_safe: true,
                annotation_guidance: "a filesystem path the tool reads from \
                                      (file contents, directory listings, metadata)",
                server_scope: None,
            },
            ArgumentRole::WritePath => RoleSpec {
                category: RoleCategory::Path,
                is_resource_identifier: true,
                sandbox_safe: true,
                annotation_guidance: "a filesystem path the tool creates or overwrites",
                server_scope: None,
            },
            ArgumentRole::DeletePath => RoleSpec {
                category: RoleCategory::Path,
                is_resource_identifier: true,
                sandbox_safe: true,
                annotation_guidance: "a filesystem path the tool removes; a move's source \
                                      is both read-path and delete-path",
                server_scope: None,
            },
            ArgumentRole::WriteHistory => RoleSpec {
                category: RoleCategory::Path,
                is_resource_identifier: true,
                // Rewriting git history is escalation-worthy even inside the
                // sandbox, so containment never discharges it.
                sandbox_safe: false,
                annotation_guidance: "a repository path whose git history the tool rewrites \
                                      (reset, rebase, amend, filter-branch)",
                server_scope: Some(&["git"]),
            },
            ArgumentRole::DeleteHistory => RoleSpec {
                category: RoleCategory::Path,
                is_resource_identifier: true,
                sandbox_safe: false,
                annotation_guidance: "a repository path where the tool discards committed \
                                      history (branch -D, reflog expire, stash drop)",
                server_scope: Some(&["git"]),
            },
            ArgumentRole::FetchUrl => RoleSpec {
                category: RoleCategory::Url,
                is_resource_identifier: true,
                sandbox_safe: false,
                annotation_guidance: "a URL the tool fetches over the network",
                server_scope: None,
            },
            ArgumentRole::GitRemoteUrl => RoleSpec {
                category: RoleCategory::Url,
                is_resource_identifier: true,
                sandbox_safe: false,
                annotation_guidance: "a git remote: either a URL (https or ssh form) or a \
                                      named remote like 'origin' that must be resolved \
                                      against the repository",
                server_scope: Some(&["git"]),
            },
            ArgumentRole::BranchName => RoleSpec {
                category: RoleCategory::Opaque,
                is_resource_identifier: false,
                sandbox_safe: false,
                annotation_guidance: "a git branch name",
                server_scope: Some(&["git"]),
            },
            ArgumentRole::CommitMessage => RoleSpec {
                category: RoleCategory::Opaque,
                is_resource_identifier: false,
                sandbox_safe: false,
                annotation_guidance: "a git commit message",
                server_scope: Some(&["git"]),
            },
            ArgumentRole::None => RoleSpec {
                category: RoleCategory::Opaque,
                is_resource_identifier: false,
                sandbox_safe: false,
                annotation_guidance: "an argument with no resource semantics (flags, modes, \
                                      counts, free text); also the escape hatch for values \
                                      the path heuristic would misclassify",
                server_scope: None,
            },
        }
    }

    pub fn category(self) -> RoleCategory {
        self.spec().category
    }

    pub fn is_sandbox_safe(self) -> bool {
        self.spec().sandbox_safe
    }

    pub fn is_path(self) -> bool {
        self.category() == RoleCategory::Path
    }

    pub fn is_url(self) -> bool {
        self.category() == RoleCategory::Url
    }

    /// Kebab-case wire name, as used in artifacts and prompts.
    pub fn wire_name(self) -> &'static str {
        match self {
            ArgumentRole::ReadPath => "read-path",
            ArgumentRole::WritePath => "write-path",
            ArgumentRole::DeletePath => "delete-path",
            ArgumentRole::WriteHistory => "write-history",
            ArgumentRole::DeleteHistory => "delete-history",
            ArgumentRole::FetchUrl => "fetch-url",
            ArgumentRole::GitRemoteUrl => "git-remote-url",
            ArgumentRole::BranchName => "branch-name",
            ArgumentRole::CommitMessage => "commit-message",
            ArgumentRole::None => "none",
        }
    }
}
