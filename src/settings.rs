use config::{Config, ConfigError};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

/// Process-level bootstrap settings.
///
/// These cover everything the binary needs before the runtime
/// configuration store (config_store) is available: bind address,
/// database URL, directory layout, proxy hints. Runtime configuration
/// (API keys, provider choices, node secret) lives in the store.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    #[serde(default)]
    pub paths: PathSettings,
    #[serde(default)]
    pub nodes: NodeSettings,
    #[serde(default)]
    pub proxy: ProxySettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub public_url: String,

    /// Environment isolation tag. Becomes the Kubernetes namespace prefix
    /// and the overlay-hostname subdomain.
    #[serde(default = "default_env_name")]
    pub env_name: String,

    /// Additional allowed CORS origins (comma-separated via CORS_ORIGINS).
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_env_name() -> String {
    "ushadow".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseSettings {
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathSettings {
    /// Directory holding config.defaults.yaml, overrides, secrets,
    /// services/, providers/ and user-services/.
    #[serde(default = "default_config_dir")]
    pub config_dir: String,
    /// Directory holding imported compose files and their .env sidecars.
    #[serde(default = "default_compose_dir")]
    pub compose_dir: String,
}

fn default_config_dir() -> String {
    "config".to_string()
}

fn default_compose_dir() -> String {
    "compose".to_string()
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            compose_dir: default_compose_dir(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NodeSettings {
    /// Heartbeat cadence agreed with node agents. A node is stale after
    /// three missed intervals and lost after ten.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Port the per-node agent listens on.
    #[serde(default = "default_agent_port")]
    pub agent_port: u16,
}

fn default_heartbeat_interval() -> u64 {
    15
}

fn default_agent_port() -> u16 {
    8444
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            agent_port: default_agent_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxySettings {
    /// Whether the overlay proxy controller drives the overlay agent.
    /// Disabled in environments without the overlay client installed.
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_backend_port")]
    pub backend_port: u16,

    #[serde(default = "default_frontend_port")]
    pub frontend_port: u16,
}

fn default_backend_port() -> u16 {
    8010
}

fn default_frontend_port() -> u16 {
    3010
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            backend_port: default_backend_port(),
            frontend_port: default_frontend_port(),
        }
    }
}

/// Expand `${VAR}` / `${VAR:-fallback}` references against the process
/// environment. Unterminated references are kept as written.
fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let body = &rest[open + 2..];
        let Some(close) = body.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };
        let token = &body[..close];
        let (name, fallback) = match token.split_once(":-") {
            Some((name, fallback)) => (name, fallback),
            None => (token, ""),
        };
        match env::var(name) {
            Ok(value) if !value.is_empty() => out.push_str(&value),
            _ => out.push_str(fallback),
        }
        rest = &body[close + 1..];
    }
    out.push_str(rest);
    out
}

/// Walk a parsed configuration tree and expand environment references in
/// every string leaf. Non-string values pass through untouched.
fn expand_env_in_tree(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::String(s) => {
            if s.contains("${") {
                *s = expand_env(s);
            }
        }
        serde_json::Value::Object(map) => {
            for child in map.values_mut() {
                expand_env_in_tree(child);
            }
        }
        serde_json::Value::Array(items) => {
            for child in items {
                expand_env_in_tree(child);
            }
        }
        _ => {}
    }
}

/// First existing file for a layer name, probing extensions in precedence
/// order (TOML wins over YAML when both are present).
fn layer_file(dir: &Path, name: &str) -> Option<PathBuf> {
    ["toml", "yaml", "yml"]
        .iter()
        .map(|ext| dir.join(format!("{}.{}", name, ext)))
        .find(|candidate| candidate.is_file())
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("USHADOW_RUN_MODE").unwrap_or_else(|_| "development".into());
        let dir = PathBuf::from(
            env::var("USHADOW_CONFIG_DIR").unwrap_or_else(|_| "config".into()),
        );

        // Layer order: shipped default (required), then the run-mode
        // file, then an untracked local file.
        let default_path = layer_file(&dir, "default").ok_or_else(|| {
            ConfigError::Message(format!(
                "no default config under {} (looked for default.toml, default.yaml, default.yml)",
                dir.display()
            ))
        })?;

        let mut builder = Config::builder().add_source(config::File::from(default_path.clone()));
        tracing::info!("bootstrap config: {}", default_path.display());
        for layer in [run_mode.as_str(), "local"] {
            if let Some(path) = layer_file(&dir, layer) {
                tracing::info!("bootstrap config overlay: {}", path.display());
                builder = builder.add_source(config::File::from(path));
            }
        }

        // Deserialise the merged layers into a plain JSON tree so string
        // values can be expanded before they are typed into Settings.
        let mut tree: serde_json::Value = builder
            .build()?
            .try_deserialize()
            .map_err(|e| ConfigError::Message(format!("unreadable configuration: {}", e)))?;
        expand_env_in_tree(&mut tree);

        let mut settings: Settings = serde_json::from_value(tree)
            .map_err(|e| ConfigError::Message(format!("invalid configuration: {}", e)))?;

        // DATABASE_URL environment variable takes precedence over file config.
        if let Ok(database_url) = env::var("DATABASE_URL") {
            if !database_url.is_empty() {
                settings.database.url = database_url;
            }
        }

        if settings.database.url.is_empty() {
            return Err(ConfigError::Message(
                "Database URL not configured. Set DATABASE_URL environment variable or [database] url in config".to_string(),
            ));
        }

        // COMPOSE_PROJECT_NAME / ENV_NAME override the environment tag.
        for var in ["COMPOSE_PROJECT_NAME", "ENV_NAME"] {
            if let Ok(name) = env::var(var) {
                if !name.trim().is_empty() {
                    settings.server.env_name = name.trim().to_string();
                    break;
                }
            }
        }

        // CORS_ORIGINS is an additive comma-separated list.
        if let Ok(origins) = env::var("CORS_ORIGINS") {
            settings.server.cors_origins.extend(
                origins
                    .split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty()),
            );
        }

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_expand_env_set_and_fallback() {
        env::set_var("USHADOW_SETTINGS_PROBE", "from-env");
        assert_eq!(expand_env("${USHADOW_SETTINGS_PROBE}"), "from-env");
        assert_eq!(
            expand_env("${USHADOW_SETTINGS_PROBE:-fallback}"),
            "from-env"
        );
        env::remove_var("USHADOW_SETTINGS_PROBE");
        assert_eq!(expand_env("${USHADOW_SETTINGS_PROBE}"), "");
        assert_eq!(
            expand_env("${USHADOW_SETTINGS_PROBE:-fallback}"),
            "fallback"
        );
    }

    #[test]
    fn test_expand_env_mixed_text() {
        env::set_var("USHADOW_SETTINGS_HOST", "db");
        assert_eq!(
            expand_env("postgres://${USHADOW_SETTINGS_HOST}:5432/${USHADOW_SETTINGS_NAME:-ushadow}"),
            "postgres://db:5432/ushadow"
        );
        env::remove_var("USHADOW_SETTINGS_HOST");
    }

    #[test]
    fn test_expand_env_leaves_plain_and_unterminated_input() {
        assert_eq!(expand_env("plain_value"), "plain_value");
        assert_eq!(expand_env("broken ${REF"), "broken ${REF");
    }

    #[test]
    fn test_expand_env_in_tree_only_touches_strings() {
        env::set_var("USHADOW_SETTINGS_TREE", "expanded");
        let mut tree = json!({
            "a": "${USHADOW_SETTINGS_TREE}",
            "nested": { "port": 8010, "list": ["${USHADOW_SETTINGS_TREE:-x}", true] },
        });
        expand_env_in_tree(&mut tree);
        assert_eq!(tree["a"], "expanded");
        assert_eq!(tree["nested"]["port"], 8010);
        assert_eq!(tree["nested"]["list"][0], "expanded");
        assert_eq!(tree["nested"]["list"][1], true);
        env::remove_var("USHADOW_SETTINGS_TREE");
    }

    #[test]
    fn test_layer_file_prefers_toml() {
        let dir = tempfile::tempdir().unwrap();
        assert!(layer_file(dir.path(), "default").is_none());
        std::fs::write(dir.path().join("default.yaml"), "a: 1\n").unwrap();
        assert_eq!(
            layer_file(dir.path(), "default").unwrap(),
            dir.path().join("default.yaml")
        );
        std::fs::write(dir.path().join("default.toml"), "a = 1\n").unwrap();
        assert_eq!(
            layer_file(dir.path(), "default").unwrap(),
            dir.path().join("default.toml")
        );
    }
}
