//! Artifact IO and content hashing.
//!
//! Artifacts are pretty-printed JSON so the user can audit them. Each one
//! carries the hash of the inputs that produced it; an unchanged hash means
//! the cached artifact is still valid.

use std::path::Path;

use {
    anyhow::{Context, Result},
    serde::{Serialize, de::DeserializeOwned},
    sha2::{Digest, Sha256},
    tracing::debug,
};

/// Hex SHA-256 over the concatenation of the given parts, each
/// length-prefixed so boundaries cannot collide.
pub fn content_hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Stable hash of a JSON value (serde_json serializes maps in a
/// deterministic order for `Map<String, Value>`).
pub fn json_hash(value: &serde_json::Value) -> String {
    content_hash(&[&value.to_string()])
}

/// ISO-8601 timestamp for `generatedAt` fields.
pub fn generated_at() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Write an artifact as pretty JSON with a trailing newline.
pub fn write_artifact<T: Serialize>(path: &Path, artifact: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_string_pretty(artifact)?;
    std::fs::write(path, body + "\n")
        .with_context(|| format!("failed to write artifact {}", path.display()))?;
    debug!(path = %path.display(), "artifact written");
    Ok(())
}

/// Read an artifact if it exists.
pub fn read_artifact<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read artifact {}", path.display()))?;
    let artifact = serde_json::from_str(&raw)
        .with_context(|| format!("invalid artifact {}", path.display()))?;
    Ok(Some(artifact))
}

/// Strip a markdown code fence from an LLM reply, if present, and return
/// the JSON payload.
pub fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        if let Some(end) = rest.rfind("```") {
            return rest[..end].trim();
        }
    }
    trimmed
}
