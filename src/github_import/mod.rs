//! GitHub compose import.
//!
//! Imported applications are stored as ordinary compose files under the
//! compose directory, carrying an `x-ushadow` provenance block plus an
//! optional `.env` sidecar of literal overrides. After registration they
//! are indistinguishable from built-in services.

pub mod handlers;
pub mod routes;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config_store::SettingsStore;
use crate::registry::{parse_compose_document, Registry, ServiceDefinition};

const GITHUB_API: &str = "https://api.github.com";
const RAW_BASE: &str = "https://raw.githubusercontent.com";
const USER_AGENT: &str = concat!("ushadow/", env!("CARGO_PKG_VERSION"));

/// Filenames that look like compose files when scanning a repository.
fn is_compose_path(path: &str) -> bool {
    let lower = path.to_lowercase();
    let name = lower.rsplit('/').next().unwrap_or(&lower);
    (name.ends_with(".yml") || name.ends_with(".yaml")) && name.contains("compose")
}

pub struct GithubImporter {
    http: reqwest::Client,
    store: Arc<SettingsStore>,
    registry: Arc<Registry>,
    compose_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct TreeResponse {
    #[serde(default)]
    tree: Vec<TreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

impl GithubImporter {
    pub fn new(
        store: Arc<SettingsStore>,
        registry: Arc<Registry>,
        compose_dir: impl Into<PathBuf>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client");
        Self {
            http,
            store,
            registry,
            compose_dir: compose_dir.into(),
        }
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.header(reqwest::header::USER_AGENT, USER_AGENT);
        match self.store.get_nonempty("github.token") {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn split_repo(repo: &str) -> Result<(&str, &str)> {
        repo.split_once('/')
            .filter(|(owner, name)| !owner.is_empty() && !name.is_empty())
            .ok_or_else(|| anyhow!("repository must be given as owner/name"))
    }

    /// List compose-like files in a repository tree.
    pub async fn scan(&self, repo: &str, git_ref: &str) -> Result<Vec<String>> {
        let (owner, name) = Self::split_repo(repo)?;
        let url = format!(
            "{}/repos/{}/{}/git/trees/{}?recursive=1",
            GITHUB_API,
            owner,
            name,
            urlencoding::encode(git_ref)
        );
        let response = self
            .authorized(self.http.get(&url))
            .send()
            .await
            .context("GitHub tree request failed")?;
        if !response.status().is_success() {
            let status = response.status();
            anyhow::bail!("GitHub returned {} for {}@{}", status, repo, git_ref);
        }
        let tree: TreeResponse = response
            .json()
            .await
            .context("GitHub tree response malformed")?;
        if tree.truncated {
            tracing::warn!("GitHub tree for {} was truncated; scan may be partial", repo);
        }
        Ok(tree
            .tree
            .into_iter()
            .filter(|entry| entry.kind == "blob" && is_compose_path(&entry.path))
            .map(|entry| entry.path)
            .collect())
    }

    async fn fetch_raw(&self, repo: &str, git_ref: &str, path: &str) -> Result<String> {
        let (owner, name) = Self::split_repo(repo)?;
        let url = format!("{}/{}/{}/{}/{}", RAW_BASE, owner, name, git_ref, path);
        let response = self
            .authorized(self.http.get(&url))
            .send()
            .await
            .context("GitHub raw fetch failed")?;
        if !response.status().is_success() {
            anyhow::bail!(
                "could not fetch {} from {}@{}: {}",
                path,
                repo,
                git_ref,
                response.status()
            );
        }
        response.text().await.context("GitHub raw body unreadable")
    }

    /// Fetch one compose file and parse it without registering anything.
    pub async fn parse(
        &self,
        repo: &str,
        git_ref: &str,
        path: &str,
    ) -> Result<Vec<ServiceDefinition>> {
        let raw = self.fetch_raw(repo, git_ref, path).await?;
        let prefix = import_name(repo, path);
        parse_compose_document(&raw, &prefix, false, BTreeMap::new())
    }

    /// Fetch, annotate with provenance, and write the compose file (plus
    /// an optional .env sidecar) into the compose directory, then reload
    /// the registry.
    pub async fn register(
        &self,
        repo: &str,
        git_ref: &str,
        path: &str,
        name_override: Option<&str>,
        env: BTreeMap<String, String>,
    ) -> Result<Vec<ServiceDefinition>> {
        let raw = self.fetch_raw(repo, git_ref, path).await?;
        let name = name_override
            .map(|n| n.to_string())
            .unwrap_or_else(|| import_name(repo, path));

        // Validate before writing anything.
        parse_compose_document(&raw, &name, false, BTreeMap::new())?;

        let annotated = annotate_with_provenance(&raw, repo, path, git_ref)?;

        fs::create_dir_all(&self.compose_dir)?;
        let compose_path = self.compose_dir.join(format!("{}-compose.yaml", name));
        fs::write(&compose_path, annotated)
            .with_context(|| format!("failed to write {}", compose_path.display()))?;

        if !env.is_empty() {
            write_sidecar(&self.compose_dir, &name, &env)?;
        }

        self.registry.reload()?;
        info!("registered imported service '{}' from {}", name, repo);

        Ok(self
            .registry
            .all_services()
            .into_iter()
            .filter(|s| s.compose_file == name)
            .map(|s| (*s).clone())
            .collect())
    }

    pub fn imported(&self) -> Vec<Arc<ServiceDefinition>> {
        self.registry.imported_services()
    }

    /// Replace the .env sidecar literals of an imported service.
    pub fn update_config(
        &self,
        service_id: &str,
        env: BTreeMap<String, String>,
    ) -> Result<()> {
        let service = self
            .registry
            .get(service_id)
            .filter(|s| s.github.is_some())
            .ok_or_else(|| anyhow!("imported service '{}' not found", service_id))?;
        write_sidecar(&self.compose_dir, &service.compose_file, &env)?;
        self.registry.reload()?;
        Ok(())
    }

    /// Delete an imported service's files and refresh the registry.
    pub fn delete(&self, service_id: &str) -> Result<()> {
        let service = self
            .registry
            .get(service_id)
            .filter(|s| s.github.is_some())
            .ok_or_else(|| anyhow!("imported service '{}' not found", service_id))?;
        let stem = self.compose_dir.join(format!("{}-compose", service.compose_file));
        for extension in ["yaml", "yml", "env"] {
            let file = stem.with_extension(extension);
            if file.exists() {
                fs::remove_file(&file)
                    .with_context(|| format!("failed to delete {}", file.display()))?;
            }
        }
        self.registry.reload()?;
        info!("deleted imported service '{}'", service_id);
        Ok(())
    }
}

/// Default registered name: repository name, qualified by the compose
/// file stem when it is not the repo's main compose file.
fn import_name(repo: &str, path: &str) -> String {
    let repo_name = repo.rsplit('/').next().unwrap_or(repo).to_lowercase();
    let file = path.rsplit('/').next().unwrap_or(path).to_lowercase();
    let stem = file
        .trim_end_matches(".yaml")
        .trim_end_matches(".yml")
        .trim_end_matches("-compose")
        .trim_start_matches("docker-compose")
        .trim_matches(['-', '.']);
    if stem.is_empty() || stem == "docker" || repo_name.contains(stem) {
        repo_name
    } else {
        format!("{}-{}", repo_name, stem)
    }
}

/// Inject the x-ushadow provenance block into every service entry.
fn annotate_with_provenance(raw: &str, repo: &str, path: &str, git_ref: &str) -> Result<String> {
    let mut document: serde_yaml::Value =
        serde_yaml::from_str(raw).context("compose document is not valid YAML")?;

    let provenance = serde_yaml::to_value(serde_json::json!({
        "github": {
            "repo": repo,
            "path": path,
            "ref": git_ref,
            "imported_at": Utc::now().to_rfc3339(),
        }
    }))
    .context("failed to build provenance block")?;

    if let Some(services) = document
        .as_mapping_mut()
        .and_then(|m| m.get_mut("services"))
        .and_then(|s| s.as_mapping_mut())
    {
        for (_, service) in services.iter_mut() {
            if let Some(service_map) = service.as_mapping_mut() {
                let key = serde_yaml::Value::String("x-ushadow".to_string());
                match service_map.get_mut(&key) {
                    Some(existing) if existing.is_mapping() => {
                        if let (Some(existing), Some(block)) =
                            (existing.as_mapping_mut(), provenance.as_mapping())
                        {
                            for (k, v) in block {
                                existing.insert(k.clone(), v.clone());
                            }
                        }
                    }
                    _ => {
                        service_map.insert(key, provenance.clone());
                    }
                }
            }
        }
    }

    let mut rendered = serde_yaml::to_string(&document).context("failed to render compose")?;
    if !rendered.ends_with('\n') {
        rendered.push('\n');
    }
    Ok(rendered)
}

fn write_sidecar(
    compose_dir: &std::path::Path,
    name: &str,
    env: &BTreeMap<String, String>,
) -> Result<()> {
    let sidecar = compose_dir.join(format!("{}-compose.env", name));
    if env.is_empty() {
        if sidecar.exists() {
            fs::remove_file(&sidecar)?;
        }
        return Ok(());
    }
    let mut body = String::new();
    for (key, value) in env {
        body.push_str(&format!("{}={}\n", key, value));
    }
    fs::write(&sidecar, body)
        .with_context(|| format!("failed to write {}", sidecar.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_compose_path() {
        assert!(is_compose_path("docker-compose.yml"));
        assert!(is_compose_path("deploy/docker-compose.prod.yaml"));
        assert!(is_compose_path("myapp-compose.yaml"));
        assert!(!is_compose_path("README.md"));
        assert!(!is_compose_path("config/settings.yaml"));
        assert!(!is_compose_path("compose.rs"));
    }

    #[test]
    fn test_import_name() {
        assert_eq!(import_name("acme/myapp", "docker-compose.yml"), "myapp");
        assert_eq!(
            import_name("acme/myapp", "deploy/docker-compose.prod.yaml"),
            "myapp-prod"
        );
        assert_eq!(import_name("acme/myapp", "myapp-compose.yaml"), "myapp");
    }

    #[test]
    fn test_annotate_with_provenance() {
        let raw = "services:\n  web:\n    image: nginx:latest\n    ports: [\"8080:80\"]\n";
        let annotated = annotate_with_provenance(raw, "acme/web", "docker-compose.yml", "main")
            .expect("annotate");
        assert!(annotated.contains("x-ushadow"));
        assert!(annotated.contains("acme/web"));

        // Round-trips through the registry parser with provenance intact.
        let parsed =
            parse_compose_document(&annotated, "web", false, BTreeMap::new()).expect("parse");
        assert_eq!(parsed.len(), 1);
        let github = parsed[0].github.as_ref().expect("github provenance");
        assert_eq!(github.repo, "acme/web");
        assert_eq!(github.git_ref.as_deref(), Some("main"));
    }

    #[test]
    fn test_write_and_clear_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = BTreeMap::new();
        env.insert("FEATURE".to_string(), "on".to_string());
        write_sidecar(dir.path(), "myapp", &env).unwrap();
        let contents = fs::read_to_string(dir.path().join("myapp-compose.env")).unwrap();
        assert_eq!(contents, "FEATURE=on\n");

        write_sidecar(dir.path(), "myapp", &BTreeMap::new()).unwrap();
        assert!(!dir.path().join("myapp-compose.env").exists());
    }
}
