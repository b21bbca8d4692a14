//! Layered configuration store.
//!
//! Merges four sources into one dotted-path keyed view:
//! process environment > overrides > secrets > defaults. The store
//! exclusively owns the on-disk layer files; writes are atomic
//! (write-temp-then-rename) and secret-classified keys are routed to
//! secrets.yaml, never to the overrides file.

pub mod secrets;

use anyhow::{Context, Result};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

pub use secrets::{is_masked, is_secret_key, mask_json_secrets, mask_value};

const DEFAULTS_FILE: &str = "config.defaults.yaml";
const OVERRIDES_FILE: &str = "config.overrides.yaml";
const SECRETS_FILE: &str = "secrets.yaml";

/// Environment prefix aliases: env vars starting with the short prefix
/// map onto the dotted path prefix (KC_CLIENT_ID -> keycloak.client_id).
const ENV_PREFIX_ALIASES: &[(&str, &str)] = &[("KC_", "keycloak.")];

/// Interpolation recursion bound for `${a.b:-default}` references.
const MAX_INTERPOLATION_DEPTH: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Defaults,
    Secrets,
    Overrides,
}

pub struct SettingsStore {
    config_dir: PathBuf,
    cache: RwLock<Option<Value>>,
}

impl SettingsStore {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            cache: RwLock::new(None),
        }
    }

    fn layer_path(&self, layer: Layer) -> PathBuf {
        let name = match layer {
            Layer::Defaults => DEFAULTS_FILE,
            Layer::Secrets => SECRETS_FILE,
            Layer::Overrides => OVERRIDES_FILE,
        };
        self.config_dir.join(name)
    }

    /// Load one layer file. A missing overrides/secrets file is an empty
    /// layer; a missing defaults file or a malformed file is an error the
    /// caller decides how to handle.
    fn load_layer(&self, layer: Layer) -> Result<Value> {
        let path = self.layer_path(layer);
        if !path.exists() {
            if layer == Layer::Defaults {
                anyhow::bail!("defaults file not found: {}", path.display());
            }
            return Ok(Value::Object(serde_json::Map::new()));
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if raw.trim().is_empty() {
            return Ok(Value::Object(serde_json::Map::new()));
        }
        let yaml: serde_yaml::Value = serde_yaml::from_str(&raw)
            .with_context(|| format!("malformed YAML in {}", path.display()))?;
        let json = serde_json::to_value(yaml)
            .with_context(|| format!("non-JSON-representable YAML in {}", path.display()))?;
        Ok(json)
    }

    fn build_merged(&self) -> Result<Value> {
        let mut merged = self.load_layer(Layer::Defaults)?;
        deep_merge(&mut merged, &self.load_layer(Layer::Secrets)?);
        deep_merge(&mut merged, &self.load_layer(Layer::Overrides)?);
        Ok(merged)
    }

    /// The merged file-layer view (defaults < secrets < overrides).
    /// Process environment is consulted per-key in `get`, not merged here.
    pub fn merged(&self) -> Result<Value> {
        {
            let cache = self.cache.read().expect("settings cache lock poisoned");
            if let Some(merged) = cache.as_ref() {
                return Ok(merged.clone());
            }
        }
        let merged = self.build_merged()?;
        let mut cache = self.cache.write().expect("settings cache lock poisoned");
        *cache = Some(merged.clone());
        Ok(merged)
    }

    /// Rebuild the merge cache from disk. On failure the previous cache is
    /// kept so readers never observe a half-loaded view.
    pub fn reload(&self) -> Result<()> {
        let merged = self.build_merged()?;
        let mut cache = self.cache.write().expect("settings cache lock poisoned");
        *cache = Some(merged);
        Ok(())
    }

    pub fn invalidate(&self) {
        let mut cache = self.cache.write().expect("settings cache lock poisoned");
        *cache = None;
    }

    /// Resolve a dotted path across all layers, highest priority first.
    /// String values get `${a.b:-default}` interpolation applied; an
    /// unresolvable reference is kept as the literal text.
    pub fn get(&self, path: &str) -> Option<Value> {
        for candidate in env_candidates(path) {
            if let Ok(value) = std::env::var(&candidate) {
                if !value.is_empty() {
                    return Some(Value::String(value));
                }
            }
        }

        let merged = self.merged().ok()?;
        let value = get_path(&merged, path)?.clone();
        Some(match value {
            Value::String(s) => Value::String(interpolate(&s, &merged, 0)),
            other => other,
        })
    }

    pub fn get_string(&self, path: &str) -> Option<String> {
        match self.get(path)? {
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// A string value that is present and non-empty after trimming.
    pub fn get_nonempty(&self, path: &str) -> Option<String> {
        self.get_string(path).filter(|s| !s.trim().is_empty())
    }

    pub fn get_bool(&self, path: &str) -> Option<bool> {
        match self.get(path)? {
            Value::Bool(b) => Some(b),
            Value::String(s) => match s.to_lowercase().as_str() {
                "true" | "1" | "yes" => Some(true),
                "false" | "0" | "no" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn get_u64(&self, path: &str) -> Option<u64> {
        match self.get(path)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Deep-merge a patch into the store, routing each leaf to the layer
    /// its key classifies into: secret-flagged paths go to secrets.yaml,
    /// everything else to config.overrides.yaml. Values that are still in
    /// masked form are dropped so a masked read-back can never clobber the
    /// real secret.
    pub fn update(&self, patch: &Value) -> Result<()> {
        let mut secret_patch = Value::Object(serde_json::Map::new());
        let mut override_patch = Value::Object(serde_json::Map::new());
        split_by_secrecy(patch, "", &mut secret_patch, &mut override_patch);

        if !is_empty_object(&secret_patch) {
            self.update_layer(&secret_patch, Layer::Secrets)?;
        }
        if !is_empty_object(&override_patch) {
            self.update_layer(&override_patch, Layer::Overrides)?;
        }
        Ok(())
    }

    /// Deep-merge a patch into one explicit layer file.
    pub fn update_layer(&self, patch: &Value, layer: Layer) -> Result<()> {
        if layer == Layer::Defaults {
            anyhow::bail!("the defaults layer is read-only");
        }
        let mut current = self.load_layer(layer)?;
        deep_merge(&mut current, patch);
        self.write_layer(layer, &current)?;
        self.invalidate();
        Ok(())
    }

    fn write_layer(&self, layer: Layer, value: &Value) -> Result<()> {
        let path = self.layer_path(layer);
        let yaml: serde_yaml::Value =
            serde_json::from_value(value.clone()).context("failed to convert layer to YAML")?;
        let mut rendered = serde_yaml::to_string(&yaml).context("failed to serialise layer")?;
        if !rendered.ends_with('\n') {
            rendered.push('\n');
        }
        atomic_write(&path, rendered.as_bytes(), layer == Layer::Secrets)
            .with_context(|| format!("failed to write {}", path.display()))
    }

    /// Delete the overrides layer (and, if requested, the secrets layer),
    /// returning to shipped defaults. Returns the files deleted.
    pub fn reset(&self, include_secrets: bool) -> Result<Vec<String>> {
        let mut deleted = Vec::new();
        let mut targets = vec![Layer::Overrides];
        if include_secrets {
            targets.push(Layer::Secrets);
        }
        for layer in targets {
            let path = self.layer_path(layer);
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to delete {}", path.display()))?;
                deleted.push(path.display().to_string());
            }
        }
        self.invalidate();
        Ok(deleted)
    }

    /// Merged view with every sensitive value masked, for the settings API.
    pub fn merged_masked(&self) -> Result<Value> {
        Ok(mask_json_secrets(&self.merged()?))
    }

    /// Drop patch entries whose value is still in masked form.
    pub fn filter_masked(patch: &Value) -> Value {
        match patch {
            Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (key, value) in map {
                    match value {
                        Value::String(s) if is_masked(s) => continue,
                        Value::Object(_) => {
                            let filtered = Self::filter_masked(value);
                            if !is_empty_object(&filtered) {
                                out.insert(key.clone(), filtered);
                            }
                        }
                        other => {
                            out.insert(key.clone(), other.clone());
                        }
                    }
                }
                Value::Object(out)
            }
            other => other.clone(),
        }
    }
}

/// Candidate environment variable names for a dotted path, most specific
/// alias first. Underscores stand in for dots: `keycloak.client_id`
/// matches both `KC_CLIENT_ID` and `KEYCLOAK_CLIENT_ID`.
fn env_candidates(path: &str) -> Vec<String> {
    let mut candidates = Vec::new();
    for (env_prefix, path_prefix) in ENV_PREFIX_ALIASES {
        if let Some(rest) = path.strip_prefix(path_prefix) {
            candidates.push(format!(
                "{}{}",
                env_prefix,
                rest.replace('.', "_").to_uppercase()
            ));
        }
    }
    candidates.push(path.replace('.', "_").to_uppercase());
    candidates
}

/// Navigate a dotted path through nested objects.
pub fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Set a dotted path, creating intermediate objects as needed.
pub fn set_path(root: &mut Value, path: &str, value: Value) {
    let parts: Vec<&str> = path.split('.').collect();
    let mut current = root;
    for part in &parts[..parts.len() - 1] {
        if !current.is_object() {
            *current = Value::Object(serde_json::Map::new());
        }
        let map = current.as_object_mut().expect("just ensured object");
        current = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(serde_json::Map::new());
    }
    current
        .as_object_mut()
        .expect("just ensured object")
        .insert(parts[parts.len() - 1].to_string(), value);
}

/// Recursive merge: objects merge key-wise, everything else replaces.
pub fn deep_merge(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                match base_map.get_mut(key) {
                    Some(base_value) if base_value.is_object() && patch_value.is_object() => {
                        deep_merge(base_value, patch_value);
                    }
                    _ => {
                        base_map.insert(key.clone(), patch_value.clone());
                    }
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

fn is_empty_object(value: &Value) -> bool {
    value.as_object().map(|m| m.is_empty()).unwrap_or(false)
}

/// Walk a patch and route each leaf to the secret or non-secret output
/// tree based on its full dotted path.
fn split_by_secrecy(patch: &Value, prefix: &str, secret_out: &mut Value, plain_out: &mut Value) {
    if let Value::Object(map) = patch {
        for (key, value) in map {
            let path = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{}.{}", prefix, key)
            };
            match value {
                Value::Object(_) => split_by_secrecy(value, &path, secret_out, plain_out),
                leaf => {
                    if let Value::String(s) = leaf {
                        if is_masked(s) {
                            continue;
                        }
                    }
                    if is_secret_key(&path) {
                        set_path(secret_out, &path, leaf.clone());
                    } else {
                        set_path(plain_out, &path, leaf.clone());
                    }
                }
            }
        }
    }
}

/// Resolve `${a.b}` / `${a.b:-default}` references in a string against a
/// merged view. Unresolvable references stay literal; resolution nests up
/// to MAX_INTERPOLATION_DEPTH to cut cycles.
fn interpolate(input: &str, merged: &Value, depth: usize) -> String {
    if depth >= MAX_INTERPOLATION_DEPTH || !input.contains("${") {
        return input.to_string();
    }
    let re = regex::Regex::new(r"\$\{([A-Za-z0-9_.]+)(?::-([^}]*))?\}").expect("static regex");
    re.replace_all(input, |caps: &regex::Captures| {
        let path = &caps[1];
        let default_value = caps.get(2).map(|m| m.as_str());
        match get_path(merged, path) {
            Some(Value::String(s)) if !s.is_empty() => interpolate(s, merged, depth + 1),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            _ => match default_value {
                Some(d) => d.to_string(),
                None => caps[0].to_string(),
            },
        }
    })
    .to_string()
}

/// Write-temp-then-rename in the same directory so readers never observe a
/// partial file. Secrets get 0600 on unix.
fn atomic_write(path: &Path, contents: &[u8], restrict: bool) -> Result<()> {
    let dir = path.parent().context("layer path has no parent")?;
    fs::create_dir_all(dir)?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .context("layer path has no file name")?;
    let tmp = dir.join(format!(".{}.tmp", file_name));
    fs::write(&tmp, contents)?;
    #[cfg(unix)]
    if restrict {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    let _ = restrict;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_with_defaults(defaults: &str) -> (tempfile::TempDir, SettingsStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(DEFAULTS_FILE), defaults).expect("write defaults");
        let store = SettingsStore::new(dir.path());
        (dir, store)
    }

    const DEFAULTS: &str = r#"
environment:
  name: ushadow
api_keys:
  openai: ""
service_preferences: {}
urls:
  base: http://localhost
  api: ${urls.base}/api
  missing: ${urls.nope:-fallback}
"#;

    #[test]
    fn test_get_resolves_defaults() {
        let (_dir, store) = store_with_defaults(DEFAULTS);
        assert_eq!(
            store.get_string("environment.name").as_deref(),
            Some("ushadow")
        );
        assert!(store.get("environment.nope").is_none());
    }

    #[test]
    fn test_update_routes_secrets_and_overrides() {
        let (dir, store) = store_with_defaults(DEFAULTS);
        store
            .update(&json!({
                "api_keys": { "openai": "sk-SECRET" },
                "service_preferences": { "chronicle": { "model": "gpt-4" } },
            }))
            .expect("update");

        let secrets = fs::read_to_string(dir.path().join(SECRETS_FILE)).expect("secrets");
        assert!(secrets.contains("sk-SECRET"));
        assert!(!secrets.contains("gpt-4"));

        let overrides = fs::read_to_string(dir.path().join(OVERRIDES_FILE)).expect("overrides");
        assert!(overrides.contains("gpt-4"));
        assert!(!overrides.contains("openai"));
        assert!(overrides.ends_with('\n'));

        // Round-trip through the merged view.
        assert_eq!(
            store.get_string("api_keys.openai").as_deref(),
            Some("sk-SECRET")
        );
        assert_eq!(
            store.get_string("service_preferences.chronicle.model").as_deref(),
            Some("gpt-4")
        );
    }

    #[test]
    fn test_masked_values_are_never_written() {
        let (dir, store) = store_with_defaults(DEFAULTS);
        store
            .update(&json!({ "api_keys": { "openai": "sk-REALVALUE" } }))
            .expect("update");
        store
            .update(&json!({ "api_keys": { "openai": "****ALUE" } }))
            .expect("masked update");
        let secrets = fs::read_to_string(dir.path().join(SECRETS_FILE)).expect("secrets");
        assert!(secrets.contains("sk-REALVALUE"));
        assert!(!secrets.contains("****"));
    }

    #[test]
    fn test_masked_read_back() {
        let (_dir, store) = store_with_defaults(DEFAULTS);
        store
            .update(&json!({ "api_keys": { "openai": "sk-SECRET" } }))
            .expect("update");
        let masked = store.merged_masked().expect("masked");
        assert_eq!(masked["api_keys"]["openai"], "****CRET");
    }

    #[test]
    fn test_reset_restores_defaults() {
        let (_dir, store) = store_with_defaults(DEFAULTS);
        store
            .update(&json!({
                "environment": { "name": "custom" },
                "api_keys": { "openai": "sk-X12345" },
            }))
            .expect("update");
        assert_eq!(
            store.get_string("environment.name").as_deref(),
            Some("custom")
        );
        let deleted = store.reset(true).expect("reset");
        assert_eq!(deleted.len(), 2);
        assert_eq!(
            store.get_string("environment.name").as_deref(),
            Some("ushadow")
        );
        assert_eq!(store.get_string("api_keys.openai").as_deref(), Some(""));
    }

    #[test]
    fn test_interpolation_with_defaults_and_cycles() {
        let (_dir, store) = store_with_defaults(DEFAULTS);
        assert_eq!(
            store.get_string("urls.api").as_deref(),
            Some("http://localhost/api")
        );
        assert_eq!(store.get_string("urls.missing").as_deref(), Some("fallback"));

        // Cyclic references terminate at the depth bound instead of hanging.
        let (_dir2, cyclic) = store_with_defaults("a: ${b}\nb: ${a}\n");
        let value = cyclic.get_string("a").expect("value");
        assert!(value.contains("${"));
    }

    #[test]
    fn test_env_overrides_files() {
        // Distinct path so parallel tests reading common keys are unaffected.
        let (_dir, store) = store_with_defaults("env_probe:\n  value: file-value\n");
        std::env::set_var("ENV_PROBE_VALUE", "from-env");
        assert_eq!(
            store.get_string("env_probe.value").as_deref(),
            Some("from-env")
        );
        std::env::remove_var("ENV_PROBE_VALUE");
    }

    #[test]
    fn test_env_prefix_alias() {
        let (_dir, store) = store_with_defaults("keycloak:\n  client_id: file-value\n");
        std::env::set_var("KC_CLIENT_ID", "alias-value");
        assert_eq!(
            store.get_string("keycloak.client_id").as_deref(),
            Some("alias-value")
        );
        std::env::remove_var("KC_CLIENT_ID");
    }

    #[test]
    fn test_malformed_layer_fails_load_but_keeps_cache_on_reload() {
        let (dir, store) = store_with_defaults(DEFAULTS);
        assert!(store.merged().is_ok());
        fs::write(dir.path().join(OVERRIDES_FILE), "{not: [valid").expect("write");
        // reload fails but the previous cache stays readable
        assert!(store.reload().is_err());
        assert_eq!(
            store.get_string("environment.name").as_deref(),
            Some("ushadow")
        );
    }

    #[test]
    fn test_secrets_file_permissions() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let (dir, store) = store_with_defaults(DEFAULTS);
            store
                .update(&json!({ "api_keys": { "openai": "sk-PERMS" } }))
                .expect("update");
            let mode = fs::metadata(dir.path().join(SECRETS_FILE))
                .expect("metadata")
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
