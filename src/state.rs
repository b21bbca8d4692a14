use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::info;

use crate::auth::{resolve_auth_secret, JwtSigner, OidcClient, OidcValidator};
use crate::cloud::CloudNodeManager;
use crate::config_store::SettingsStore;
use crate::deployment::backend::{
    DockerRuntime, KubernetesBackend, LocalDockerBackend, RemoteDockerBackend,
};
use crate::deployment::DeploymentEngine;
use crate::github_import::GithubImporter;
use crate::nodes::NodeManager;
use crate::proxy::ProxyController;
use crate::registry::Registry;
use crate::resolver::CapabilityResolver;
use crate::settings::Settings;

/// Startup failures mapped to the process exit codes: configuration
/// errors exit 64, unavailable collaborators (database, runtime) 69,
/// anything else 70.
#[derive(Debug)]
pub enum StartupError {
    Config(anyhow::Error),
    Collaborator(anyhow::Error),
    Internal(anyhow::Error),
}

impl StartupError {
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::Config(_) => 64,
            StartupError::Collaborator(_) => 69,
            StartupError::Internal(_) => 70,
        }
    }

    pub fn error(&self) -> &anyhow::Error {
        match self {
            StartupError::Config(e) | StartupError::Collaborator(e) | StartupError::Internal(e) => e,
        }
    }
}

/// All long-lived components, constructed once at startup and passed as
/// dependencies. No module-global state.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub settings: Arc<Settings>,
    pub store: Arc<SettingsStore>,
    pub registry: Arc<Registry>,
    pub resolver: Arc<CapabilityResolver>,
    pub engine: Arc<DeploymentEngine>,
    pub nodes: Arc<NodeManager>,
    pub cloud: Arc<CloudNodeManager>,
    pub proxy: Arc<ProxyController>,
    pub github: Arc<GithubImporter>,
    pub jwt: Arc<JwtSigner>,
    pub oidc: Option<Arc<OidcClient>>,
    pub oidc_validator: Option<Arc<OidcValidator>>,
}

impl AppState {
    pub async fn new(settings: Settings) -> Result<Self, StartupError> {
        info!("Initializing control plane state");

        // rustls needs a process-wide crypto provider before any kube
        // client is built.
        rustls::crypto::ring::default_provider().install_default().ok();

        let db = PgPoolOptions::new()
            .max_connections(10)
            .connect(&settings.database.url)
            .await
            .map_err(|e| StartupError::Collaborator(anyhow::Error::new(e).context(
                "Failed to connect to PostgreSQL",
            )))?;
        info!("Connected to PostgreSQL");

        sqlx::migrate!("./migrations")
            .run(&db)
            .await
            .map_err(|e| {
                StartupError::Collaborator(anyhow::Error::new(e).context("Failed to run migrations"))
            })?;
        info!("Migrations complete");

        // Configuration store: a malformed layer file aborts startup.
        let store = Arc::new(SettingsStore::new(&settings.paths.config_dir));
        store
            .merged()
            .map_err(|e| StartupError::Config(e.context("Configuration store failed to load")))?;

        let registry = Arc::new(Registry::new(
            &settings.paths.config_dir,
            &settings.paths.compose_dir,
        ));
        registry
            .reload()
            .map_err(|e| StartupError::Config(e.context("Registry failed to load")))?;

        let resolver = Arc::new(CapabilityResolver::new(registry.clone(), store.clone()));

        let nodes = Arc::new(NodeManager::new(
            db.clone(),
            store.clone(),
            settings.nodes.heartbeat_interval_secs,
        ));

        let proxy = Arc::new(ProxyController::new(
            settings.proxy.enabled,
            settings.proxy.backend_port,
            settings.proxy.frontend_port,
        ));

        let docker = DockerRuntime::connect().map_err(|e| {
            StartupError::Collaborator(e.context("Failed to connect to the container runtime"))
        })?;
        let local = Arc::new(LocalDockerBackend::new(docker));
        let remote = Arc::new(RemoteDockerBackend::new(
            db.clone(),
            store.clone(),
            settings.nodes.agent_port,
        ));
        let kubernetes = Arc::new(KubernetesBackend::new(db.clone()));

        let engine = Arc::new(DeploymentEngine::new(
            db.clone(),
            registry.clone(),
            store.clone(),
            resolver.clone(),
            nodes.clone(),
            proxy.clone(),
            local,
            remote,
            kubernetes,
            settings.server.env_name.clone(),
        ));

        let cloud = Arc::new(CloudNodeManager::new(
            db.clone(),
            store.clone(),
            nodes.clone(),
            settings.server.public_url.clone(),
            settings.nodes.agent_port,
        ));

        let github = Arc::new(GithubImporter::new(
            store.clone(),
            registry.clone(),
            &settings.paths.compose_dir,
        ));

        // JWT secret bootstraps from AUTH_SECRET_KEY on first start.
        let auth_secret = resolve_auth_secret(&store)
            .map_err(|e| StartupError::Config(e.context("Auth secret unavailable")))?;
        let token_expiry = store
            .get_u64("security.token_expiry_seconds")
            .unwrap_or(86_400);
        let service_token_expiry = store
            .get_u64("security.service_token_expiry_seconds")
            .unwrap_or(900);
        let jwt = Arc::new(
            JwtSigner::new(&auth_secret, token_expiry, service_token_expiry)
                .map_err(|e| StartupError::Config(anyhow::Error::new(e)))?,
        );

        let oidc = OidcClient::from_store(&store).map(Arc::new);
        let oidc_validator = oidc
            .as_ref()
            .map(|client| Arc::new(OidcValidator::new(client.issuer().to_string())));
        if let Some(client) = &oidc {
            info!("Federated identity provider enabled: {}", client.issuer());
        }

        Ok(Self {
            db,
            settings: Arc::new(settings),
            store,
            registry,
            resolver,
            engine,
            nodes,
            cloud,
            proxy,
            github,
            jwt,
            oidc,
            oidc_validator,
        })
    }
}
