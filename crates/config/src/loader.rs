//! Strict `config.json` loading and credential-preserving saves.

use std::path::Path;

use {
    anyhow::{Context, Result},
    serde_json::Value,
    tracing::warn,
};

use crate::schema::UserConfig;

/// Load `config.json` from `path`.
///
/// Invalid JSON is a hard error. Unknown top-level fields are warned about
/// and preserved in the returned raw value so a later save round-trips them.
/// Missing fields are backfilled from defaults. A missing file yields the
/// default config.
pub fn load_config(path: &Path) -> Result<(UserConfig, Value)> {
    if !path.exists() {
        return Ok((UserConfig::default(), Value::Object(Default::default())));
    }

    check_permissions(path);

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("invalid JSON in {}", path.display()))?;
    let config: UserConfig = serde_json::from_value(value.clone())
        .with_context(|| format!("invalid config in {}", path.display()))?;

    warn_unknown_fields(&config, &value, path);
    Ok((config, value))
}

/// Save `config` to `path`, merging over `raw` so unknown fields survive.
///
/// Credential fields (`providers.*.apiKey`) are never written: whatever the
/// on-disk file already holds for them is left untouched. The file is
/// created with mode 0600.
pub fn save_config(path: &Path, config: &UserConfig, raw: &Value) -> Result<()> {
    let mut merged = raw.clone();
    if !merged.is_object() {
        merged = Value::Object(Default::default());
    }

    let serialized = serde_json::to_value(config).context("serialize config")?;
    let Some(obj) = merged.as_object_mut() else {
        anyhow::bail!("config root must be an object");
    };
    if let Value::Object(fields) = serialized {
        for (key, mut field) in fields {
            if key == "providers" {
                strip_credentials(&mut field);
                // Keep whatever credentials the raw file already carries.
                if let Some(existing) = obj.get("providers") {
                    merge_credentials(&mut field, existing);
                }
            }
            obj.insert(key, field);
        }
    }

    let pretty = serde_json::to_string_pretty(&merged)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, pretty + "\n")
        .with_context(|| format!("failed to write {}", path.display()))?;
    restrict_permissions(path);
    Ok(())
}

fn strip_credentials(providers: &mut Value) {
    if let Some(map) = providers.as_object_mut() {
        for entry in map.values_mut() {
            if let Some(provider) = entry.as_object_mut() {
                provider.remove("apiKey");
            }
        }
    }
}

fn merge_credentials(providers: &mut Value, existing: &Value) {
    let (Some(map), Some(existing_map)) = (providers.as_object_mut(), existing.as_object()) else {
        return;
    };
    for (name, entry) in existing_map {
        if let Some(key) = entry.get("apiKey")
            && let Some(provider) = map
                .entry(name.clone())
                .or_insert_with(|| Value::Object(Default::default()))
                .as_object_mut()
        {
            provider.insert("apiKey".into(), key.clone());
        }
    }
}

fn warn_unknown_fields(config: &UserConfig, value: &Value, path: &Path) {
    let Ok(known) = serde_json::to_value(config) else {
        return;
    };
    let (Some(known), Some(actual)) = (known.as_object(), value.as_object()) else {
        return;
    };
    for key in actual.keys() {
        if !known.contains_key(key) {
            warn!(path = %path.display(), field = %key, "unknown config field (preserved)");
        }
    }
}

#[cfg(unix)]
fn check_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = std::fs::metadata(path) {
        let mode = meta.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            warn!(
                path = %path.display(),
                mode = format!("{mode:o}"),
                "config file is readable by other users; chmod 600 recommended"
            );
        }
    }
}

#[cfg(not(unix))]
fn check_permissions(_path: &Path) {}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
        warn!(path = %path.display(), error = %e, "failed to restrict config permissions");
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}
