//! Service and provider registry.
//!
//! Discovers deployable service definitions from compose-style YAML files
//! and capability providers from manifest files. Reload-on-demand only;
//! the registry never polls the filesystem. `reload` rebuilds both
//! indexes from scratch under a write lock so readers never observe
//! partial state.

pub mod models;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::config_store::SettingsStore;
pub use models::{
    EnvMapEntry, EnvVarDecl, EnvVarKind, GithubProvenance, Provider, ProviderMode,
    ServiceDefinition,
};

pub struct Registry {
    services_dir: PathBuf,
    infrastructure_dir: PathBuf,
    user_services_dir: PathBuf,
    compose_dir: PathBuf,
    providers_dir: PathBuf,
    env_mappings_path: PathBuf,
    index: RwLock<Arc<RegistryIndex>>,
}

#[derive(Default)]
pub struct RegistryIndex {
    services: BTreeMap<String, Arc<ServiceDefinition>>,
    providers_by_capability: BTreeMap<String, Vec<Arc<Provider>>>,
    global_env_mappings: BTreeMap<String, String>,
    infrastructure_images: BTreeMap<String, String>,
}

impl Registry {
    pub fn new(config_dir: impl AsRef<Path>, compose_dir: impl AsRef<Path>) -> Self {
        let config_dir = config_dir.as_ref();
        Self {
            services_dir: config_dir.join("services"),
            infrastructure_dir: config_dir.join("services").join("infrastructure"),
            user_services_dir: config_dir.join("user-services"),
            compose_dir: compose_dir.as_ref().to_path_buf(),
            providers_dir: config_dir.join("providers"),
            env_mappings_path: config_dir.join("env-mappings.yaml"),
            index: RwLock::new(Arc::new(RegistryIndex::default())),
        }
    }

    /// Discover everything and atomically swap the index.
    pub fn reload(&self) -> Result<()> {
        let fresh = self.build_index()?;
        let mut index = self.index.write().expect("registry lock poisoned");
        *index = Arc::new(fresh);
        Ok(())
    }

    fn snapshot(&self) -> Arc<RegistryIndex> {
        self.index.read().expect("registry lock poisoned").clone()
    }

    pub fn all_services(&self) -> Vec<Arc<ServiceDefinition>> {
        self.snapshot().services.values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<Arc<ServiceDefinition>> {
        self.snapshot().services.get(id).cloned()
    }

    pub fn service_count(&self) -> usize {
        self.snapshot().services.len()
    }

    pub fn provider_count(&self) -> usize {
        self.snapshot()
            .providers_by_capability
            .values()
            .map(|v| v.len())
            .sum()
    }

    pub fn infrastructure_services(&self) -> Vec<Arc<ServiceDefinition>> {
        self.snapshot()
            .services
            .values()
            .filter(|s| s.infrastructure)
            .cloned()
            .collect()
    }

    pub fn imported_services(&self) -> Vec<Arc<ServiceDefinition>> {
        self.snapshot()
            .services
            .values()
            .filter(|s| s.github.is_some())
            .cloned()
            .collect()
    }

    /// The infrastructure service backing an image, if any. Matching is by
    /// full image reference first, then by repository without the tag.
    pub fn infrastructure_service_for_image(&self, image: &str) -> Option<String> {
        let index = self.snapshot();
        if let Some(id) = index.infrastructure_images.get(image) {
            return Some(id.clone());
        }
        let repo = image.split(':').next().unwrap_or(image);
        index.infrastructure_images.get(repo).cloned()
    }

    pub fn providers_for(&self, capability: &str) -> Vec<Arc<Provider>> {
        self.snapshot()
            .providers_by_capability
            .get(capability)
            .cloned()
            .unwrap_or_default()
    }

    pub fn capabilities(&self) -> Vec<String> {
        self.snapshot()
            .providers_by_capability
            .keys()
            .cloned()
            .collect()
    }

    /// Providers for a capability in preference order: explicit defaults
    /// first, ties broken by configured-first, then cloud-first, then name.
    pub fn default_providers_for(
        &self,
        capability: &str,
        store: &SettingsStore,
    ) -> Vec<Arc<Provider>> {
        let mut providers = self.providers_for(capability);
        providers.sort_by_key(|p| {
            (
                !p.is_default,
                !provider_configured(p, store),
                p.mode != ProviderMode::Cloud,
                p.id.clone(),
            )
        });
        providers
    }

    /// Flattened env map entries across every provider of a capability.
    pub fn env_mappings_for(&self, capability: &str) -> Vec<EnvMapEntry> {
        self.providers_for(capability)
            .iter()
            .flat_map(|p| p.env_map.iter().cloned())
            .collect()
    }

    /// Global ENV_VAR -> settings path mapping from env-mappings.yaml.
    pub fn global_env_mapping(&self, var: &str) -> Option<String> {
        self.snapshot().global_env_mappings.get(var).cloned()
    }

    fn build_index(&self) -> Result<RegistryIndex> {
        let mut services = BTreeMap::new();
        let mut infrastructure_images = BTreeMap::new();

        for (dir, infrastructure, imported) in [
            (&self.services_dir, false, false),
            (&self.infrastructure_dir, true, false),
            (&self.user_services_dir, false, false),
            (&self.compose_dir, false, true),
        ] {
            if !dir.exists() {
                continue;
            }
            for entry in fs::read_dir(dir)
                .with_context(|| format!("failed to read {}", dir.display()))?
            {
                let path = entry?.path();
                if !path.is_file() || !is_yaml(&path) {
                    continue;
                }
                match parse_compose_file(&path, infrastructure, imported) {
                    Ok(parsed) => {
                        for service in parsed {
                            if services.contains_key(&service.id) {
                                tracing::warn!(
                                    "service '{}' from {} overrides an earlier definition",
                                    service.id,
                                    path.display()
                                );
                            }
                            if service.infrastructure {
                                infrastructure_images
                                    .insert(service.image.clone(), service.id.clone());
                                let repo =
                                    service.image.split(':').next().unwrap_or(&service.image);
                                infrastructure_images
                                    .insert(repo.to_string(), service.id.clone());
                            }
                            services.insert(service.id.clone(), Arc::new(service));
                        }
                    }
                    Err(e) => {
                        tracing::error!("skipping {}: {:#}", path.display(), e);
                    }
                }
            }
        }

        let mut providers_by_capability: BTreeMap<String, Vec<Arc<Provider>>> = BTreeMap::new();
        if self.providers_dir.exists() {
            for entry in fs::read_dir(&self.providers_dir)? {
                let path = entry?.path();
                if !path.is_file() || !is_yaml(&path) {
                    continue;
                }
                match parse_provider_file(&path) {
                    Ok(provider) => {
                        providers_by_capability
                            .entry(provider.capability.clone())
                            .or_default()
                            .push(Arc::new(provider));
                    }
                    Err(e) => {
                        tracing::error!("skipping provider {}: {:#}", path.display(), e);
                    }
                }
            }
        }

        let global_env_mappings = load_env_mappings(&self.env_mappings_path)?;

        tracing::info!(
            "registry loaded: {} services, {} providers",
            services.len(),
            providers_by_capability.values().map(|v| v.len()).sum::<usize>()
        );

        Ok(RegistryIndex {
            services,
            providers_by_capability,
            global_env_mappings,
            infrastructure_images,
        })
    }
}

/// Whether a provider's env map is fully satisfied by the store: every
/// required entry resolves to a non-empty value or ships a default.
pub fn provider_configured(provider: &Provider, store: &SettingsStore) -> bool {
    missing_provider_keys(provider, store).is_empty()
}

/// Required env map entries of a provider with no value and no default.
pub fn missing_provider_keys<'a>(
    provider: &'a Provider,
    store: &SettingsStore,
) -> Vec<&'a EnvMapEntry> {
    provider
        .env_map
        .iter()
        .filter(|entry| entry.required)
        .filter(|entry| entry.default.is_none())
        .filter(|entry| store.get_nonempty(&entry.settings_path).is_none())
        .collect()
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Strip the conventional "-compose" suffix off a compose file stem to get
/// the id prefix: chronicle-compose.yaml -> "chronicle".
fn compose_id_prefix(path: &Path) -> String {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    stem.strip_suffix("-compose").unwrap_or(stem).to_string()
}

#[derive(Debug, Deserialize)]
struct RawComposeFile {
    #[serde(default)]
    services: serde_yaml::Mapping,
}

#[derive(Debug, Default, Deserialize)]
struct RawComposeService {
    image: Option<String>,
    #[serde(default)]
    ports: Vec<serde_yaml::Value>,
    #[serde(default)]
    environment: Option<RawEnvironment>,
    #[serde(default)]
    volumes: Vec<String>,
    #[serde(default)]
    command: Option<RawCommand>,
    #[serde(default)]
    restart: Option<String>,
    #[serde(default)]
    networks: Option<Vec<String>>,
    #[serde(default)]
    depends_on: Option<serde_yaml::Value>,
    #[serde(default)]
    healthcheck: Option<RawHealthcheck>,
    #[serde(default, rename = "x-ushadow")]
    x_ushadow: Option<RawUshadowMeta>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawEnvironment {
    List(Vec<String>),
    Map(serde_yaml::Mapping),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCommand {
    Line(String),
    Argv(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct RawHealthcheck {
    #[serde(default)]
    test: Option<serde_yaml::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RawUshadowMeta {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    requires: Vec<String>,
    #[serde(default)]
    provides: Vec<String>,
    #[serde(default)]
    health_check_path: Option<String>,
    #[serde(default)]
    optional_depends_on: Vec<models::OptionalDependency>,
    #[serde(default)]
    github: Option<GithubProvenance>,
}

fn yaml_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn parse_environment(raw: Option<RawEnvironment>) -> Vec<EnvVarDecl> {
    match raw {
        None => Vec::new(),
        Some(RawEnvironment::List(entries)) => entries
            .iter()
            .filter_map(|e| EnvVarDecl::parse(e))
            .collect(),
        Some(RawEnvironment::Map(map)) => map
            .iter()
            .filter_map(|(key, value)| {
                let key = yaml_string(key)?;
                let value = yaml_string(value).unwrap_or_default();
                EnvVarDecl::parse(&format!("{}={}", key, value))
            })
            .collect(),
    }
}

fn parse_depends_on(raw: Option<serde_yaml::Value>) -> Vec<String> {
    match raw {
        Some(serde_yaml::Value::Sequence(items)) => {
            items.iter().filter_map(yaml_string).collect()
        }
        Some(serde_yaml::Value::Mapping(map)) => {
            map.iter().filter_map(|(k, _)| yaml_string(k)).collect()
        }
        _ => Vec::new(),
    }
}

/// Pull an HTTP path out of a curl-style healthcheck test when the service
/// does not declare one explicitly.
fn health_path_from_test(test: &serde_yaml::Value) -> Option<String> {
    let tokens: Vec<String> = match test {
        serde_yaml::Value::Sequence(items) => items.iter().filter_map(yaml_string).collect(),
        serde_yaml::Value::String(s) => s.split_whitespace().map(|t| t.to_string()).collect(),
        _ => return None,
    };
    for token in tokens {
        if let Some(rest) = token
            .strip_prefix("http://")
            .or_else(|| token.strip_prefix("https://"))
        {
            if let Some(slash) = rest.find('/') {
                return Some(rest[slash..].to_string());
            }
        }
    }
    None
}

fn parse_compose_file(
    path: &Path,
    infrastructure: bool,
    imported: bool,
) -> Result<Vec<ServiceDefinition>> {
    let raw = fs::read_to_string(path)?;
    let prefix = compose_id_prefix(path);

    // Imported files may ship a .env sidecar of literal overrides.
    let env_literals = if imported {
        let sidecar = path.with_extension("env");
        load_env_sidecar(&sidecar)
    } else {
        std::collections::BTreeMap::new()
    };

    parse_compose_document(&raw, &prefix, infrastructure, env_literals)
}

/// Parse a compose document held in memory (also used when previewing
/// files fetched from GitHub before they are registered on disk).
pub fn parse_compose_document(
    raw: &str,
    prefix: &str,
    infrastructure: bool,
    env_literals: std::collections::BTreeMap<String, String>,
) -> Result<Vec<ServiceDefinition>> {
    let file: RawComposeFile = serde_yaml::from_str(raw)
        .with_context(|| format!("malformed compose document '{}'", prefix))?;

    let mut definitions = Vec::new();
    for (name, value) in &file.services {
        let Some(service_name) = yaml_string(name) else {
            continue;
        };
        let service: RawComposeService = serde_yaml::from_value(value.clone())
            .with_context(|| format!("malformed service '{}' in '{}'", service_name, prefix))?;
        let Some(image) = service.image else {
            // Build-only entries are not deployable through the registry.
            tracing::debug!(
                "service '{}' in '{}' has no image, skipping",
                service_name,
                prefix
            );
            continue;
        };

        let meta = service.x_ushadow.unwrap_or_default();
        let health_check_path = meta.health_check_path.clone().or_else(|| {
            service
                .healthcheck
                .as_ref()
                .and_then(|h| h.test.as_ref())
                .and_then(health_path_from_test)
        });

        definitions.push(ServiceDefinition {
            id: format!("{}:{}", prefix, service_name),
            compose_file: prefix.to_string(),
            service_name: service_name.clone(),
            display_name: meta.display_name,
            description: meta.description,
            image,
            ports: service.ports.iter().filter_map(yaml_string).collect(),
            environment: parse_environment(service.environment),
            volumes: service.volumes,
            command: service.command.map(|c| match c {
                RawCommand::Line(line) => line,
                RawCommand::Argv(argv) => argv.join(" "),
            }),
            restart_policy: service.restart,
            network: service.networks.and_then(|n| n.into_iter().next()),
            health_check_path,
            requires: meta.requires,
            provides: meta.provides,
            depends_on: parse_depends_on(service.depends_on),
            optional_depends_on: meta.optional_depends_on,
            infrastructure,
            github: meta.github,
            env_literals: env_literals.clone(),
        });
    }
    Ok(definitions)
}

fn load_env_sidecar(path: &Path) -> std::collections::BTreeMap<String, String> {
    let mut literals = std::collections::BTreeMap::new();
    let Ok(raw) = fs::read_to_string(path) else {
        return literals;
    };
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            literals.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    literals
}

fn parse_provider_file(path: &Path) -> Result<Provider> {
    let raw = fs::read_to_string(path)?;
    let provider: Provider = serde_yaml::from_str(&raw)
        .with_context(|| format!("malformed provider manifest {}", path.display()))?;
    Ok(provider)
}

#[derive(Debug, Default, Deserialize)]
struct RawEnvMappings {
    #[serde(default)]
    mappings: BTreeMap<String, String>,
}

fn load_env_mappings(path: &Path) -> Result<BTreeMap<String, String>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let raw = fs::read_to_string(path)?;
    let parsed: RawEnvMappings = serde_yaml::from_str(&raw)
        .with_context(|| format!("malformed env mappings {}", path.display()))?;
    Ok(parsed.mappings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const CHRONICLE: &str = r#"
services:
  chronicle-backend:
    image: ghcr.io/ushadow-io/chronicle-backend:latest
    ports:
      - "8000:8000"
    environment:
      - OPENAI_API_KEY=${OPENAI_API_KEY}
      - CHRONICLE_MODEL=${CHRONICLE_MODEL:-gpt-4o-mini}
      - LOG_LEVEL=info
    restart: unless-stopped
    healthcheck:
      test: ["CMD", "curl", "-f", "http://localhost:8000/health"]
    depends_on:
      - mongo
    x-ushadow:
      display_name: Chronicle
      requires:
        - llm
"#;

    const MONGO: &str = r#"
services:
  mongo:
    image: mongo:8.0
    ports:
      - "27017:27017"
"#;

    const OPENAI_PROVIDER: &str = r#"
capability: llm
id: openai
mode: cloud
is_default: true
env_map:
  - env: OPENAI_API_KEY
    settings_path: api_keys.openai
    secret: true
    required: true
    label: OpenAI API key
"#;

    const OLLAMA_PROVIDER: &str = r#"
capability: llm
id: ollama
mode: local
image: ollama/ollama:latest
service_id: ollama-compose:ollama
env_map:
  - env: OLLAMA_BASE_URL
    settings_path: providers.ollama.base_url
    default: http://ollama:11434
"#;

    fn fixture() -> (tempfile::TempDir, Registry, SettingsStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = dir.path().join("config");
        fs::create_dir_all(config.join("services/infrastructure")).unwrap();
        fs::create_dir_all(config.join("providers")).unwrap();
        fs::create_dir_all(dir.path().join("compose")).unwrap();
        fs::write(config.join("services/chronicle-compose.yaml"), CHRONICLE).unwrap();
        fs::write(
            config.join("services/infrastructure/mongo-compose.yaml"),
            MONGO,
        )
        .unwrap();
        fs::write(config.join("providers/openai.yaml"), OPENAI_PROVIDER).unwrap();
        fs::write(config.join("providers/ollama.yaml"), OLLAMA_PROVIDER).unwrap();
        fs::write(
            config.join("config.defaults.yaml"),
            "api_keys:\n  openai: \"\"\n",
        )
        .unwrap();

        let registry = Registry::new(&config, dir.path().join("compose"));
        registry.reload().expect("reload");
        let store = SettingsStore::new(&config);
        (dir, registry, store)
    }

    #[test]
    fn test_discovery_and_ids() {
        let (_dir, registry, _store) = fixture();
        let chronicle = registry
            .get("chronicle:chronicle-backend")
            .expect("chronicle service");
        assert_eq!(chronicle.image, "ghcr.io/ushadow-io/chronicle-backend:latest");
        assert_eq!(chronicle.requires, vec!["llm".to_string()]);
        assert_eq!(chronicle.health_check_path.as_deref(), Some("/health"));
        assert_eq!(chronicle.depends_on, vec!["mongo".to_string()]);
        assert!(!chronicle.infrastructure);

        let mongo = registry.get("mongo:mongo").expect("mongo service");
        assert!(mongo.infrastructure);
        assert_eq!(
            registry.infrastructure_service_for_image("mongo:8.0").as_deref(),
            Some("mongo:mongo")
        );
        assert_eq!(
            registry.infrastructure_service_for_image("mongo:7.0").as_deref(),
            Some("mongo:mongo")
        );
    }

    #[test]
    fn test_env_classification_through_compose() {
        let (_dir, registry, _store) = fixture();
        let chronicle = registry.get("chronicle:chronicle-backend").unwrap();
        assert_eq!(chronicle.required_env_vars(), vec!["OPENAI_API_KEY"]);
        let model = chronicle
            .environment
            .iter()
            .find(|d| d.name == "CHRONICLE_MODEL")
            .unwrap();
        assert!(matches!(model.kind, EnvVarKind::Optional { .. }));
        let log = chronicle
            .environment
            .iter()
            .find(|d| d.name == "LOG_LEVEL")
            .unwrap();
        assert!(matches!(log.kind, EnvVarKind::Hardcoded { .. }));
    }

    #[test]
    fn test_provider_ordering_prefers_default_then_configured() {
        let (_dir, registry, store) = fixture();
        let ordered = registry.default_providers_for("llm", &store);
        assert_eq!(ordered[0].id, "openai");
        assert_eq!(ordered[1].id, "ollama");

        // openai is unconfigured (empty key) but still wins on is_default;
        // ollama is configured because its only entry has a default.
        assert!(!provider_configured(&ordered[0], &store));
        assert!(provider_configured(&ordered[1], &store));
    }

    #[test]
    fn test_missing_keys_resolve_after_update() {
        let (_dir, registry, store) = fixture();
        let openai = registry.providers_for("llm")[0].clone();
        assert_eq!(missing_provider_keys(&openai, &store).len(), 1);
        store
            .update(&json!({ "api_keys": { "openai": "sk-TEST" } }))
            .unwrap();
        assert!(missing_provider_keys(&openai, &store).is_empty());
    }

    #[test]
    fn test_reload_is_idempotent_without_changes() {
        let (_dir, registry, _store) = fixture();
        let before: Vec<String> = registry.all_services().iter().map(|s| s.id.clone()).collect();
        registry.reload().expect("reload");
        let after: Vec<String> = registry.all_services().iter().map(|s| s.id.clone()).collect();
        assert_eq!(before, after);
        assert_eq!(registry.provider_count(), 2);
    }

    #[test]
    fn test_imported_sidecar_literals() {
        let (dir, registry, _store) = fixture();
        fs::write(
            dir.path().join("compose/myapp-compose.yaml"),
            r#"
services:
  myapp:
    image: ghcr.io/acme/myapp:1.0
    ports:
      - "9000:9000"
    x-ushadow:
      github:
        repo: acme/myapp
        path: docker-compose.yml
"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("compose/myapp-compose.env"),
            "FEATURE_FLAG=on\n# comment\nDEBUG=false\n",
        )
        .unwrap();
        registry.reload().unwrap();

        let myapp = registry.get("myapp:myapp").expect("imported service");
        assert_eq!(myapp.github.as_ref().unwrap().repo, "acme/myapp");
        assert_eq!(myapp.env_literals.get("FEATURE_FLAG").map(String::as_str), Some("on"));
        assert_eq!(registry.imported_services().len(), 1);
    }
}
