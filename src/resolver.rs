//! Capability resolver.
//!
//! Given a set of enabled service ids, decides which provider satisfies
//! each required capability, reports the configuration keys still
//! missing, and expands the implied infrastructure set. The deployment
//! engine refuses to place a service while `all_configured` is false.

use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::config_store::SettingsStore;
use crate::registry::{missing_provider_keys, Provider, ProviderMode, Registry};

#[derive(Debug, Clone, Serialize)]
pub struct MissingKey {
    pub key: String,
    pub label: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CapabilityRequirement {
    pub id: String,
    pub provider_id: Option<String>,
    pub provider_mode: Option<ProviderMode>,
    pub configured: bool,
    pub missing_keys: Vec<MissingKey>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SetupRequirements {
    pub required_capabilities: Vec<CapabilityRequirement>,
    pub services: Vec<String>,
    pub all_configured: bool,
    pub implied_infrastructure: Vec<String>,
}

pub struct CapabilityResolver {
    registry: Arc<Registry>,
    store: Arc<SettingsStore>,
}

impl CapabilityResolver {
    pub fn new(registry: Arc<Registry>, store: Arc<SettingsStore>) -> Self {
        Self { registry, store }
    }

    /// Provider choice for one capability: the user's configured
    /// preference wins, then the first provider flagged is_default, then
    /// the first provider in preference order.
    pub fn selected_provider(&self, capability: &str) -> Option<Arc<Provider>> {
        let preference = self
            .store
            .get_nonempty(&format!("service_preferences.{}.provider", capability));
        let ordered = self.registry.default_providers_for(capability, &self.store);
        if let Some(preferred_id) = preference {
            if let Some(provider) = ordered.iter().find(|p| p.id == preferred_id) {
                return Some(provider.clone());
            }
            tracing::warn!(
                "preferred provider '{}' for capability '{}' not found, falling back",
                preferred_id,
                capability
            );
        }
        ordered.into_iter().next()
    }

    /// A depends_on entry names a compose service. Prefer a service in the
    /// same file; infrastructure dependencies commonly live in their own
    /// compose file, so fall back to a service-name match anywhere.
    fn resolve_dependency_id(&self, compose_file: &str, dep: &str) -> String {
        let same_file = format!("{}:{}", compose_file, dep);
        if self.registry.get(&same_file).is_some() {
            return same_file;
        }
        self.registry
            .all_services()
            .into_iter()
            .find(|s| s.service_name == dep)
            .map(|s| s.id.clone())
            .unwrap_or(same_file)
    }

    pub fn resolve(&self, service_ids: &[String]) -> SetupRequirements {
        let mut capabilities: BTreeSet<String> = BTreeSet::new();
        let mut known_services = Vec::new();

        for id in service_ids {
            let Some(service) = self.registry.get(id) else {
                tracing::warn!("unknown service id '{}' in resolve request", id);
                continue;
            };
            capabilities.extend(service.requires.iter().cloned());
            known_services.push(id.clone());
        }

        let mut required_capabilities = Vec::new();
        let mut implied: BTreeSet<String> = BTreeSet::new();

        for capability in &capabilities {
            match self.selected_provider(capability) {
                Some(provider) => {
                    let missing: Vec<MissingKey> = missing_provider_keys(&provider, &self.store)
                        .into_iter()
                        .map(|entry| MissingKey {
                            key: entry.settings_path.clone(),
                            label: entry
                                .label
                                .clone()
                                .unwrap_or_else(|| entry.env.clone()),
                            path: entry.settings_path.clone(),
                            kind: if entry.secret { "secret" } else { "text" },
                            link: entry.link.clone(),
                        })
                        .collect();

                    // Local providers whose image is infrastructure pull
                    // their backing service into the required-to-run set.
                    if provider.mode == ProviderMode::Local {
                        if let Some(service_id) = provider
                            .image
                            .as_deref()
                            .and_then(|image| {
                                self.registry.infrastructure_service_for_image(image)
                            })
                            .or_else(|| provider.service_id.clone())
                        {
                            implied.insert(service_id);
                        }
                    }

                    required_capabilities.push(CapabilityRequirement {
                        id: capability.clone(),
                        provider_id: Some(provider.id.clone()),
                        provider_mode: Some(provider.mode),
                        configured: missing.is_empty(),
                        missing_keys: missing,
                    });
                }
                None => {
                    required_capabilities.push(CapabilityRequirement {
                        id: capability.clone(),
                        provider_id: None,
                        provider_mode: None,
                        configured: false,
                        missing_keys: vec![MissingKey {
                            key: capability.clone(),
                            label: format!("No provider available for '{}'", capability),
                            path: format!("service_preferences.{}.provider", capability),
                            kind: "text",
                            link: None,
                        }],
                    });
                }
            }
        }

        // Declared hard dependencies, plus option-triggered optional ones.
        for id in &known_services {
            if let Some(service) = self.registry.get(id) {
                for dep in &service.depends_on {
                    implied.insert(self.resolve_dependency_id(&service.compose_file, dep));
                }
                for optional in &service.optional_depends_on {
                    let path = format!(
                        "service_preferences.{}.{}",
                        service.compose_file, optional.option
                    );
                    if self.store.get_bool(&path).unwrap_or(false) {
                        implied.insert(optional.service.clone());
                    }
                }
            }
        }

        // A service never implies itself.
        for id in &known_services {
            implied.remove(id);
        }

        let all_configured = required_capabilities.iter().all(|c| c.configured);

        SetupRequirements {
            required_capabilities,
            services: known_services,
            all_configured,
            implied_infrastructure: implied.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    fn fixture() -> (tempfile::TempDir, CapabilityResolver, Arc<SettingsStore>) {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config");
        fs::create_dir_all(config.join("services/infrastructure")).unwrap();
        fs::create_dir_all(config.join("providers")).unwrap();
        fs::write(
            config.join("services/chronicle-compose.yaml"),
            r#"
services:
  chronicle-backend:
    image: ghcr.io/ushadow-io/chronicle-backend:latest
    ports: ["8000:8000"]
    environment:
      - OPENAI_API_KEY=${OPENAI_API_KEY}
    depends_on: [mongo]
    x-ushadow:
      requires: [llm]
"#,
        )
        .unwrap();
        fs::write(
            config.join("services/infrastructure/mongo-compose.yaml"),
            "services:\n  mongo:\n    image: mongo:8.0\n    ports: [\"27017:27017\"]\n",
        )
        .unwrap();
        fs::write(
            config.join("providers/openai.yaml"),
            r#"
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
"#,
        )
        .unwrap();
        fs::write(
            config.join("providers/ollama.yaml"),
            r#"
capability: llm
id: ollama
mode: local
image: ollama/ollama:latest
service_id: ollama-compose:ollama
env_map: []
"#,
        )
        .unwrap();
        fs::write(config.join("config.defaults.yaml"), "api_keys:\n  openai: \"\"\n").unwrap();

        let registry = Arc::new(Registry::new(&config, dir.path().join("compose")));
        registry.reload().unwrap();
        let store = Arc::new(SettingsStore::new(&config));
        let resolver = CapabilityResolver::new(registry, store.clone());
        (dir, resolver, store)
    }

    #[test]
    fn test_unconfigured_capability_reports_missing_keys() {
        let (_dir, resolver, _store) = fixture();
        let result = resolver.resolve(&["chronicle:chronicle-backend".to_string()]);
        assert!(!result.all_configured);
        let llm = &result.required_capabilities[0];
        assert_eq!(llm.id, "llm");
        assert_eq!(llm.provider_id.as_deref(), Some("openai"));
        assert_eq!(llm.missing_keys.len(), 1);
        assert_eq!(llm.missing_keys[0].key, "api_keys.openai");
        assert_eq!(llm.missing_keys[0].kind, "secret");
    }

    #[test]
    fn test_configured_after_key_saved() {
        let (_dir, resolver, store) = fixture();
        store
            .update(&json!({ "api_keys": { "openai": "sk-TEST" } }))
            .unwrap();
        let result = resolver.resolve(&["chronicle:chronicle-backend".to_string()]);
        assert!(result.all_configured);
        assert!(result.required_capabilities[0].missing_keys.is_empty());
    }

    #[test]
    fn test_user_preference_overrides_default_provider() {
        let (_dir, resolver, store) = fixture();
        store
            .update_layer(
                &json!({ "service_preferences": { "llm": { "provider": "ollama" } } }),
                crate::config_store::Layer::Overrides,
            )
            .unwrap();
        let result = resolver.resolve(&["chronicle:chronicle-backend".to_string()]);
        let llm = &result.required_capabilities[0];
        assert_eq!(llm.provider_id.as_deref(), Some("ollama"));
        // Local provider with no required keys is configured outright.
        assert!(llm.configured);
        // The local provider's backing service joins the implied set.
        assert!(result
            .implied_infrastructure
            .contains(&"ollama-compose:ollama".to_string()));
    }

    #[test]
    fn test_depends_on_expands_infrastructure() {
        let (_dir, resolver, store) = fixture();
        store
            .update(&json!({ "api_keys": { "openai": "sk-TEST" } }))
            .unwrap();
        let result = resolver.resolve(&["chronicle:chronicle-backend".to_string()]);
        assert!(result
            .implied_infrastructure
            .contains(&"mongo:mongo".to_string()));
    }

    #[test]
    fn test_unknown_service_is_skipped() {
        let (_dir, resolver, _store) = fixture();
        let result = resolver.resolve(&["nope:nope".to_string()]);
        assert!(result.services.is_empty());
        assert!(result.required_capabilities.is_empty());
        assert!(result.all_configured);
    }
}
