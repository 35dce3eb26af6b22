//! Path and URL normalization.
//!
//! Every call gets two argument views. The transport view is what the real
//! tool server receives: relative paths pass through unchanged so the
//! server resolves them against its own working directory (the sandbox
//! root). The policy view is what the engine evaluates: every path is
//! absolute and canonical, and URL-category values are reduced to their
//! domain.

use std::{
    path::{Component, Path, PathBuf},
    time::Duration,
};

use {
    serde_json::{Map, Value},
    tracing::{debug, warn},
};

use crate::{
    annotations::ToolAnnotation,
    roles::{ArgumentRole, RoleCategory},
};

/// Timeout for `git remote get-url` subprocess resolution.
const GIT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// The two views of one call's arguments.
#[derive(Debug, Clone)]
pub struct NormalizedArguments {
    /// Sent to the real tool server.
    pub transport: Map<String, Value>,
    /// Evaluated by the policy engine.
    pub policy: Map<String, Value>,
}

/// Produce both argument views for a call.
///
/// Without an annotation every argument passes through untouched in both
/// views; Phase 1 still applies its heuristic extraction and will deny the
/// unknown tool.
pub async fn normalize_arguments(
    annotation: Option<&ToolAnnotation>,
    arguments: &Map<String, Value>,
    sandbox_dir: Option<&Path>,
) -> NormalizedArguments {
    let Some(annotation) = annotation else {
        return NormalizedArguments {
            transport: arguments.clone(),
            policy: arguments.clone(),
        };
    };

    let mut transport = Map::new();
    let mut policy = Map::new();

    for (name, value) in arguments {
        let roles = annotation.args.get(name).cloned().unwrap_or_default();
        let category = dominant_category(&roles);

        match category {
            Some(RoleCategory::Path) => {
                transport.insert(name.clone(), map_strings(value, transport_path));
                policy.insert(
                    name.clone(),
                    map_strings(value, |s| {
                        resolve_policy_path(s, sandbox_dir).display().to_string()
                    }),
                );
            }
            Some(RoleCategory::Url) => {
                transport.insert(name.clone(), value.clone());
                let prepared =
                    prepare_url_for_policy(value, &roles, arguments).await;
                policy.insert(name.clone(), prepared);
            }
            _ => {
                transport.insert(name.clone(), value.clone());
                policy.insert(name.clone(), value.clone());
            }
        }
    }

    NormalizedArguments { transport, policy }
}

fn dominant_category(roles: &[ArgumentRole]) -> Option<RoleCategory> {
    if roles.iter().any(|r| r.category() == RoleCategory::Path) {
        Some(RoleCategory::Path)
    } else if roles.iter().any(|r| r.category() == RoleCategory::Url) {
        Some(RoleCategory::Url)
    } else {
        None
    }
}

/// Apply `f` to a string value or to every string element of an array.
/// Non-string values are left untouched; the engine treats them as absent.
fn map_strings(value: &Value, f: impl Fn(&str) -> String) -> Value {
    match value {
        Value::String(s) => Value::String(f(s)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Value::String(f(s)),
                    other => other.clone(),
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

async fn prepare_url_for_policy(
    value: &Value,
    roles: &[ArgumentRole],
    siblings: &Map<String, Value>,
) -> Value {
    let is_git_remote = roles.contains(&ArgumentRole::GitRemoteUrl);
    match value {
        Value::String(s) => {
            Value::String(url_to_policy_value(s, is_git_remote, siblings).await)
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) => out.push(Value::String(
                        url_to_policy_value(s, is_git_remote, siblings).await,
                    )),
                    other => out.push(other.clone()),
                }
            }
            Value::Array(out)
        }
        other => other.clone(),
    }
}

async fn url_to_policy_value(
    raw: &str,
    is_git_remote: bool,
    siblings: &Map<String, Value>,
) -> String {
    if let Some(domain) = extract_domain(raw) {
        return domain;
    }
    if is_git_remote {
        // A named remote like `origin`: resolve it against the repository
        // named by a sibling path argument. Any failure keeps the original
        // opaque value — rules that need a domain will then escalate, which
        // is the right default when we cannot verify.
        if let Some(repo_dir) = sibling_repo_dir(siblings)
            && let Some(resolved) = resolve_git_remote(raw, &repo_dir).await
            && let Some(domain) = extract_domain(&resolved)
        {
            return domain;
        }
    }
    raw.to_string()
}

fn sibling_repo_dir(siblings: &Map<String, Value>) -> Option<PathBuf> {
    for key in ["path", "repo_path", "repoPath", "cwd"] {
        if let Some(Value::String(s)) = siblings.get(key) {
            return Some(resolve_policy_path(s, None));
        }
    }
    None
}

/// Resolve a named git remote to its URL via `git remote get-url <name>`.
///
/// Direct argv invocation, no shell, short timeout.
pub async fn resolve_git_remote(name: &str, repo_dir: &Path) -> Option<String> {
    let run = tokio::process::Command::new("git")
        .args(["remote", "get-url", name])
        .current_dir(repo_dir)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(GIT_RESOLVE_TIMEOUT, run).await {
        Ok(Ok(output)) if output.status.success() => {
            let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
            debug!(remote = %name, url = %url, "resolved git remote");
            (!url.is_empty()).then_some(url)
        }
        Ok(Ok(_)) | Ok(Err(_)) => None,
        Err(_) => {
            warn!(remote = %name, "git remote resolution timed out");
            None
        }
    }
}

// ── Paths ───────────────────────────────────────────────────────────────────

/// Transport form: relative paths unchanged, absolute and `~`-rooted paths
/// expanded and canonicalized.
pub fn transport_path(raw: &str) -> String {
    if raw.starts_with('/') || raw.starts_with('~') {
        canonicalize_lenient(&expand_tilde(raw)).display().to_string()
    } else {
        raw.to_string()
    }
}

/// Policy form: always an absolute canonical path. Relative paths resolve
/// against the sandbox directory (or the cwd when no sandbox is set).
pub fn resolve_policy_path(raw: &str, sandbox_dir: Option<&Path>) -> PathBuf {
    let expanded = expand_tilde(raw);
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        match sandbox_dir {
            Some(dir) => dir.join(expanded),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")).join(expanded),
        }
    };
    canonicalize_lenient(&absolute)
}

pub fn expand_tilde(raw: &str) -> PathBuf {
    if raw == "~" {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home);
        }
    } else if let Some(rest) = raw.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return PathBuf::from(home).join(rest);
    }
    PathBuf::from(raw)
}

/// Canonicalize with a three-strategy fallback so paths that do not exist
/// yet (new writes) still resolve, while symlink escapes on existing paths
/// are neutralized:
///
/// 1. resolve the full path;
/// 2. resolve the parent directory and re-append the base name;
/// 3. fall back to lexical resolution of the absolute path.
pub fn canonicalize_lenient(path: &Path) -> PathBuf {
    if let Ok(resolved) = std::fs::canonicalize(path) {
        return resolved;
    }
    if let (Some(parent), Some(name)) = (path.parent(), path.file_name())
        && let Ok(parent_resolved) = std::fs::canonicalize(parent)
    {
        return parent_resolved.join(name);
    }
    lexical_resolve(path)
}

/// Resolve `.` and `..` components textually, without touching the
/// filesystem.
pub fn lexical_resolve(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Containment check on canonical paths: equal to, or inside, `dir`.
pub fn is_within(path: &Path, dir: &Path) -> bool {
    path == dir || path.starts_with(dir)
}

// ── Domains ─────────────────────────────────────────────────────────────────

/// Extract the lowercase domain from a URL-ish value.
///
/// Accepts full URLs (any scheme), SSH-form git remotes
/// (`[user@]host:path`), bare domains, and IP literals. Returns `None` for
/// values with no recognizable host — notably named remotes like `origin`.
pub fn extract_domain(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
        return None;
    }

    if let Ok(parsed) = url::Url::parse(trimmed)
        && let Some(host) = parsed.host_str()
    {
        return Some(host.to_ascii_lowercase());
    }

    if let Some(host) = parse_ssh_remote(trimmed) {
        return Some(host);
    }

    // Bare domain or IP literal.
    let candidate = trimmed.to_ascii_lowercase();
    if candidate.parse::<std::net::IpAddr>().is_ok() {
        return Some(candidate);
    }
    let looks_like_domain = candidate.contains('.')
        && !candidate.contains('/')
        && !candidate.contains(':')
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    looks_like_domain.then_some(candidate)
}

/// Parse the SSH remote grammar `[user@]host:path` and return the host.
pub fn parse_ssh_remote(raw: &str) -> Option<String> {
    let (authority, path) = raw.split_once(':')?;
    if path.is_empty() || authority.is_empty() || authority.contains('/') {
        return None;
    }
    let host = match authority.rsplit_once('@') {
        Some((user, host)) if !user.is_empty() && !host.is_empty() => host,
        Some(_) => return None,
        None => authority,
    };
    // Single-letter hosts are rejected so `C:\temp`-style strings never
    // parse as remotes.
    let ok = host.len() > 1
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    ok.then(|| host.to_ascii_lowercase())
}

/// Match one domain against an allowlist entry: exact, `*.` wildcard
/// prefix, or explicit IP.
pub fn domain_matches(domain: &str, pattern: &str) -> bool {
    let domain = domain.to_ascii_lowercase();
    let pattern = pattern.to_ascii_lowercase();

    if let Some(suffix) = pattern.strip_prefix("*.") {
        return domain
            .strip_suffix(suffix)
            .is_some_and(|prefix| prefix.ends_with('.') && prefix.len() > 1);
    }
    domain == pattern
}

pub fn domain_allowed(domain: &str, allowlist: &[String]) -> bool {
    allowlist.iter().any(|p| domain_matches(domain, p))
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::roles::ArgumentRole,
        std::collections::HashMap,
    };

    #[test]
    fn lexical_resolve_handles_dotdot() {
        assert_eq!(
            lexical_resolve(Path::new("/tmp/sandbox/../etc/passwd")),
            PathBuf::from("/tmp/etc/passwd")
        );
        assert_eq!(
            lexical_resolve(Path::new("/a/./b/../c")),
            PathBuf::from("/a/c")
        );
    }

    #[test]
    fn canonicalize_resolves_nonexistent_leaf_via_parent() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("does-not-exist-yet.txt");
        let resolved = canonicalize_lenient(&target);
        assert!(resolved.is_absolute());
        assert_eq!(resolved.file_name().unwrap(), "does-not-exist-yet.txt");
    }

    #[test]
    fn canonicalize_neutralizes_symlink_escape() {
        let dir = tempfile::tempdir().unwrap();
        let outside = dir.path().join("outside");
        std::fs::create_dir(&outside).unwrap();
        let inside = dir.path().join("inside");
        std::fs::create_dir(&inside).unwrap();
        let link = inside.join("escape");
        std::os::unix::fs::symlink(&outside, &link).unwrap();

        let resolved = canonicalize_lenient(&link);
        assert_eq!(resolved, std::fs::canonicalize(&outside).unwrap());
    }

    #[test]
    fn normalization_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("sub/../file.txt");
        let once = canonicalize_lenient(&raw);
        let twice = canonicalize_lenient(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn dotdot_inside_sandbox_stays_inside() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = std::fs::canonicalize(dir.path()).unwrap();
        std::fs::create_dir(sandbox.join("sub")).unwrap();

        let inside = resolve_policy_path("sub/../a.txt", Some(&sandbox));
        assert!(is_within(&inside, &sandbox));

        let outside = resolve_policy_path("../outside.txt", Some(&sandbox));
        assert!(!is_within(&outside, &sandbox));
    }

    #[test]
    fn transport_keeps_relative_paths_verbatim() {
        assert_eq!(transport_path("notes/today.md"), "notes/today.md");
        assert_eq!(transport_path("./a.txt"), "./a.txt");
    }

    #[test]
    fn is_within_is_component_wise() {
        assert!(is_within(Path::new("/tmp/sandbox/a"), Path::new("/tmp/sandbox")));
        assert!(is_within(Path::new("/tmp/sandbox"), Path::new("/tmp/sandbox")));
        assert!(!is_within(Path::new("/tmp/sandbox-evil"), Path::new("/tmp/sandbox")));
    }

    // ── Domains ─────────────────────────────────────────────────────────

    #[test]
    fn extracts_domain_from_https_url() {
        assert_eq!(extract_domain("https://github.com/a/b"), Some("github.com".into()));
    }

    #[test]
    fn canonical_form_invariants() {
        // Port, userinfo, and case do not change the extracted domain.
        assert_eq!(extract_domain("https://GitHub.COM:8443/x"), Some("github.com".into()));
        assert_eq!(
            extract_domain("https://user:pw@example.org/path"),
            Some("example.org".into())
        );
        assert_eq!(extract_domain("example.org"), Some("example.org".into()));
    }

    #[test]
    fn extracts_domain_from_ssh_form() {
        assert_eq!(extract_domain("git@github.com:user/repo.git"), Some("github.com".into()));
        assert_eq!(extract_domain("github.com:user/repo.git"), Some("github.com".into()));
    }

    #[test]
    fn named_remotes_have_no_domain() {
        assert_eq!(extract_domain("origin"), None);
        assert_eq!(extract_domain("upstream"), None);
    }

    #[test]
    fn ip_literals_extract_as_themselves() {
        assert_eq!(extract_domain("192.168.1.10"), Some("192.168.1.10".into()));
        assert_eq!(
            extract_domain("http://192.168.1.10:8080/x"),
            Some("192.168.1.10".into())
        );
    }

    #[test]
    fn wildcard_patterns_match_subdomains_only() {
        assert!(domain_matches("api.github.com", "*.github.com"));
        assert!(domain_matches("a.b.github.com", "*.github.com"));
        assert!(!domain_matches("github.com", "*.github.com"));
        assert!(!domain_matches("evilgithub.com", "*.github.com"));
    }

    #[test]
    fn exact_match_is_case_insensitive() {
        assert!(domain_matches("GitHub.com", "github.com"));
        assert!(!domain_matches("api.github.com", "github.com"));
    }

    #[test]
    fn explicit_ip_patterns_match_exactly() {
        assert!(domain_matches("10.0.0.1", "10.0.0.1"));
        assert!(!domain_matches("10.0.0.2", "10.0.0.1"));
    }

    // ── Views ───────────────────────────────────────────────────────────

    fn annotation(args: HashMap<String, Vec<ArgumentRole>>) -> ToolAnnotation {
        ToolAnnotation {
            tool_name: "t".into(),
            server_name: "filesystem".into(),
            comment: String::new(),
            side_effects: true,
            args,
        }
    }

    #[tokio::test]
    async fn relative_path_differs_between_views() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = std::fs::canonicalize(dir.path()).unwrap();
        let annotation = annotation(HashMap::from([(
            "path".into(),
            vec![ArgumentRole::ReadPath],
        )]));

        let mut args = Map::new();
        args.insert("path".into(), serde_json::json!("notes.md"));

        let views = normalize_arguments(Some(&annotation), &args, Some(&sandbox)).await;
        assert_eq!(views.transport["path"], "notes.md");
        assert_eq!(
            views.policy["path"],
            sandbox.join("notes.md").display().to_string()
        );
    }

    #[tokio::test]
    async fn url_arguments_reduce_to_domains_in_policy_view() {
        let annotation = annotation(HashMap::from([(
            "url".into(),
            vec![ArgumentRole::FetchUrl],
        )]));
        let mut args = Map::new();
        args.insert("url".into(), serde_json::json!("https://evil.com/payload"));

        let views = normalize_arguments(Some(&annotation), &args, None).await;
        assert_eq!(views.transport["url"], "https://evil.com/payload");
        assert_eq!(views.policy["url"], "evil.com");
    }

    #[tokio::test]
    async fn unresolvable_remote_keeps_opaque_value() {
        let dir = tempfile::tempdir().unwrap();
        let annotation = annotation(HashMap::from([(
            "remote".into(),
            vec![ArgumentRole::GitRemoteUrl],
        )]));
        let mut args = Map::new();
        args.insert("remote".into(), serde_json::json!("origin"));
        args.insert(
            "path".into(),
            serde_json::json!(dir.path().display().to_string()),
        );

        // Not a git repository: resolution fails, the opaque value remains.
        let views = normalize_arguments(Some(&annotation), &args, None).await;
        assert_eq!(views.policy["remote"], "origin");
    }

    #[tokio::test]
    async fn path_arrays_normalize_element_wise() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = std::fs::canonicalize(dir.path()).unwrap();
        let annotation = annotation(HashMap::from([(
            "paths".into(),
            vec![ArgumentRole::ReadPath],
        )]));
        let mut args = Map::new();
        args.insert("paths".into(), serde_json::json!(["a.txt", "b/c.txt"]));

        let views = normalize_arguments(Some(&annotation), &args, Some(&sandbox)).await;
        let policy = views.policy["paths"].as_array().unwrap();
        assert!(policy[0].as_str().unwrap().starts_with(sandbox.to_str().unwrap()));
        assert!(policy[1].as_str().unwrap().ends_with("c.txt"));
    }

    #[tokio::test]
    async fn non_string_values_pass_through() {
        let annotation = annotation(HashMap::from([(
            "path".into(),
            vec![ArgumentRole::ReadPath],
        )]));
        let mut args = Map::new();
        args.insert("path".into(), serde_json::json!(42));

        let views = normalize_arguments(Some(&annotation), &args, None).await;
        assert_eq!(views.policy["path"], 42);
    }
}
