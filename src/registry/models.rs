use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How one declared environment variable of a service gets its value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnvVarKind {
    /// `KEY=${VAR}` — must be bound at deploy time.
    Required { var: String },
    /// `KEY=${VAR:-default}` — bound if available, falls back otherwise.
    Optional { var: String, default: String },
    /// `KEY=literal` — fixed value from the compose file.
    Hardcoded { value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVarDecl {
    pub name: String,
    #[serde(flatten)]
    pub kind: EnvVarKind,
}

impl EnvVarDecl {
    /// Parse one compose environment entry: `KEY=${VAR:-default}`,
    /// `KEY=${VAR}`, `KEY=literal` or bare `KEY` (a required passthrough).
    pub fn parse(entry: &str) -> Option<Self> {
        let entry = entry.trim();
        if entry.is_empty() || entry.starts_with('#') {
            return None;
        }
        let (name, value) = match entry.split_once('=') {
            Some((name, value)) => (name.trim(), Some(value.trim())),
            None => (entry, None),
        };
        if name.is_empty() {
            return None;
        }
        let kind = match value {
            None => EnvVarKind::Required {
                var: name.to_string(),
            },
            Some(value) => match parse_substitution(value) {
                Some((var, Some(default))) => EnvVarKind::Optional {
                    var,
                    default: default.to_string(),
                },
                Some((var, None)) => EnvVarKind::Required { var },
                None => EnvVarKind::Hardcoded {
                    value: value.to_string(),
                },
            },
        };
        Some(Self {
            name: name.to_string(),
            kind,
        })
    }

    pub fn is_required(&self) -> bool {
        matches!(self.kind, EnvVarKind::Required { .. })
    }

    /// The substitution variable this declaration binds to, if any.
    pub fn var(&self) -> Option<&str> {
        match &self.kind {
            EnvVarKind::Required { var } => Some(var),
            EnvVarKind::Optional { var, .. } => Some(var),
            EnvVarKind::Hardcoded { .. } => None,
        }
    }
}

/// Parse a `${VAR}` / `${VAR:-default}` value. Returns None for literals.
fn parse_substitution(value: &str) -> Option<(String, Option<&str>)> {
    let inner = value.strip_prefix("${")?.strip_suffix('}')?;
    match inner.split_once(":-") {
        Some((var, default)) => Some((var.trim().to_string(), Some(default))),
        None => Some((inner.trim().to_string(), None)),
    }
}

/// A dependency pulled in only when its triggering option is enabled in
/// `service_preferences.<service>.<option>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionalDependency {
    pub option: String,
    pub service: String,
}

/// GitHub provenance for imported services (from the x-ushadow block).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GithubProvenance {
    pub repo: String,
    #[serde(default)]
    pub path: String,
    #[serde(default, rename = "ref")]
    pub git_ref: Option<String>,
    #[serde(default)]
    pub imported_at: Option<DateTime<Utc>>,
}

/// A deployable unit derived from one compose service entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDefinition {
    /// Composite id: `<compose file basename without "-compose">:<service name>`.
    pub id: String,
    pub compose_file: String,
    pub service_name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub image: String,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub environment: Vec<EnvVarDecl>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub restart_policy: Option<String>,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub health_check_path: Option<String>,
    /// Capabilities this service needs a provider for.
    #[serde(default)]
    pub requires: Vec<String>,
    /// Capabilities this service itself provides.
    #[serde(default)]
    pub provides: Vec<String>,
    /// Other compose services this one depends on (declaration order).
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Dependencies gated behind a service option.
    #[serde(default)]
    pub optional_depends_on: Vec<OptionalDependency>,
    /// True for services discovered under services/infrastructure/.
    #[serde(default)]
    pub infrastructure: bool,
    #[serde(default)]
    pub github: Option<GithubProvenance>,
    /// Literal overrides from an imported service's .env sidecar.
    #[serde(default)]
    pub env_literals: BTreeMap<String, String>,
}

impl ServiceDefinition {
    pub fn required_env_vars(&self) -> Vec<&str> {
        self.environment
            .iter()
            .filter(|decl| decl.is_required())
            .filter_map(|decl| decl.var())
            .collect()
    }

    /// A service with at least one declared port is user-facing and gets a
    /// proxy route once running.
    pub fn user_facing(&self) -> bool {
        !self.ports.is_empty()
    }

    /// First declared port, split into (host, container). The host side may
    /// be absent ("8080" exposes without a binding) or unparseable when it
    /// is itself a substitution; the container side falls back to the raw
    /// string's numeric tail.
    pub fn primary_port(&self) -> Option<(Option<u16>, u16)> {
        let raw = self.ports.first()?;
        let (host_part, container_part) = match raw.rsplit_once(':') {
            Some((host, container)) => (Some(host), container),
            None => (None, raw.as_str()),
        };
        let container = container_part
            .split('/')
            .next()
            .and_then(|p| p.trim().parse().ok())?;
        let host = host_part.and_then(|h| {
            let h = h.trim();
            // ${PORT:-8080} style host bindings: take the default if present.
            if let Some((_, Some(default))) = parse_substitution(h) {
                default.trim().parse().ok()
            } else {
                h.parse().ok()
            }
        });
        Some((host, container))
    }
}

/// Provider mode: cloud providers are configured by credentials alone,
/// local providers additionally need a running container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderMode {
    Cloud,
    Local,
}

/// One entry of a provider's environment map: how a config key feeds an
/// environment variable of services consuming the capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvMapEntry {
    pub env: String,
    pub settings_path: String,
    #[serde(default)]
    pub secret: bool,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
}

/// An implementation of one capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub capability: String,
    pub id: String,
    pub mode: ProviderMode,
    #[serde(default)]
    pub is_default: bool,
    /// Container image for local providers.
    #[serde(default)]
    pub image: Option<String>,
    /// Service definition backing a local provider.
    #[serde(default)]
    pub service_id: Option<String>,
    #[serde(default)]
    pub env_map: Vec<EnvMapEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_decl_classification() {
        let optional = EnvVarDecl::parse("CHRONICLE_MODEL=${CHRONICLE_MODEL:-gpt-4o-mini}").unwrap();
        assert_eq!(
            optional.kind,
            EnvVarKind::Optional {
                var: "CHRONICLE_MODEL".into(),
                default: "gpt-4o-mini".into()
            }
        );

        let required = EnvVarDecl::parse("OPENAI_API_KEY=${OPENAI_API_KEY}").unwrap();
        assert_eq!(
            required.kind,
            EnvVarKind::Required {
                var: "OPENAI_API_KEY".into()
            }
        );

        let hardcoded = EnvVarDecl::parse("LOG_LEVEL=info").unwrap();
        assert_eq!(
            hardcoded.kind,
            EnvVarKind::Hardcoded {
                value: "info".into()
            }
        );

        let bare = EnvVarDecl::parse("HOSTNAME").unwrap();
        assert_eq!(
            bare.kind,
            EnvVarKind::Required {
                var: "HOSTNAME".into()
            }
        );

        assert!(EnvVarDecl::parse("").is_none());
        assert!(EnvVarDecl::parse("# comment").is_none());
    }

    #[test]
    fn test_env_decl_empty_default() {
        let decl = EnvVarDecl::parse("FLAG=${FLAG:-}").unwrap();
        assert_eq!(
            decl.kind,
            EnvVarKind::Optional {
                var: "FLAG".into(),
                default: "".into()
            }
        );
    }

    fn service_with_ports(ports: &[&str]) -> ServiceDefinition {
        ServiceDefinition {
            id: "x:y".into(),
            compose_file: "x".into(),
            service_name: "y".into(),
            display_name: None,
            description: None,
            image: "img".into(),
            ports: ports.iter().map(|p| p.to_string()).collect(),
            environment: vec![],
            volumes: vec![],
            command: None,
            restart_policy: None,
            network: None,
            health_check_path: None,
            requires: vec![],
            provides: vec![],
            depends_on: vec![],
            optional_depends_on: vec![],
            infrastructure: false,
            github: None,
            env_literals: BTreeMap::new(),
        }
    }

    #[test]
    fn test_primary_port() {
        assert_eq!(
            service_with_ports(&["8000:8000"]).primary_port(),
            Some((Some(8000), 8000))
        );
        assert_eq!(
            service_with_ports(&["8080:80"]).primary_port(),
            Some((Some(8080), 80))
        );
        assert_eq!(
            service_with_ports(&["${WEB_PORT:-9090}:80"]).primary_port(),
            Some((Some(9090), 80))
        );
        assert_eq!(
            service_with_ports(&["6333"]).primary_port(),
            Some((None, 6333))
        );
        assert_eq!(
            service_with_ports(&["27017:27017/tcp"]).primary_port(),
            Some((Some(27017), 27017))
        );
        assert_eq!(service_with_ports(&[]).primary_port(), None);
        assert!(!service_with_ports(&[]).user_facing());
    }
}
