use serde_json::json;
use sqlx::PgPool;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config_store::{deep_merge, SettingsStore};
use crate::db::deployments;
use crate::db::models::{Deployment, DeploymentStatus, TargetType};
use crate::deployment::backend::{BackendError, DeploymentBackend};
use crate::deployment::models::{
    container_name, state_machine, DeployRequest, ResolvedServiceDefinition,
};
use crate::error::ApiError;
use crate::nodes::NodeManager;
use crate::proxy::ProxyController;
use crate::registry::{EnvVarKind, Registry, ServiceDefinition};
use crate::resolver::{CapabilityResolver, MissingKey};

/// Top-level state machine for placing services on targets.
///
/// One engine instance owns all deployment records. Lifecycle operations
/// per deployment id are serialised through a per-id mutex; a second
/// concurrent operation surfaces as a conflict instead of queueing.
pub struct DeploymentEngine {
    db: PgPool,
    registry: Arc<Registry>,
    store: Arc<SettingsStore>,
    resolver: Arc<CapabilityResolver>,
    nodes: Arc<NodeManager>,
    proxy: Arc<ProxyController>,
    local: Arc<dyn DeploymentBackend>,
    remote: Arc<dyn DeploymentBackend>,
    kubernetes: Arc<dyn DeploymentBackend>,
    env_name: String,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    /// Rate limit for backend status refreshes: at most one per second
    /// per deployment.
    status_cache: moka::future::Cache<Uuid, DeploymentStatus>,
}

/// Canonical test for "local deployment": no hostname requested, or the
/// requested hostname is the environment name itself.
pub fn is_local_target(hostname: Option<&str>, env_name: &str) -> bool {
    match hostname {
        None => true,
        Some(h) => h.trim().is_empty() || h == env_name || h == "localhost",
    }
}

/// Canonical placement identity for a deploy request. A docker_unode
/// request naming the local host is the same physical target as
/// local_docker, so both spellings must collapse to one identity before
/// the record is stored or the duplicate-deploy conflict check runs;
/// otherwise the same service could run twice on the same host under
/// two target spellings. Remote hostnames are normalised the same way
/// the join path stores them.
pub fn canonical_target(
    target_type: TargetType,
    unode_hostname: Option<String>,
    env_name: &str,
) -> (TargetType, Option<String>) {
    match target_type {
        TargetType::LocalDocker => (TargetType::LocalDocker, None),
        TargetType::DockerUnode => {
            if is_local_target(unode_hostname.as_deref(), env_name) {
                (TargetType::LocalDocker, None)
            } else {
                (
                    TargetType::DockerUnode,
                    unode_hostname.map(|h| h.trim().to_lowercase()),
                )
            }
        }
        TargetType::Kubernetes => (TargetType::Kubernetes, unode_hostname),
    }
}

#[allow(clippy::too_many_arguments)]
impl DeploymentEngine {
    pub fn new(
        db: PgPool,
        registry: Arc<Registry>,
        store: Arc<SettingsStore>,
        resolver: Arc<CapabilityResolver>,
        nodes: Arc<NodeManager>,
        proxy: Arc<ProxyController>,
        local: Arc<dyn DeploymentBackend>,
        remote: Arc<dyn DeploymentBackend>,
        kubernetes: Arc<dyn DeploymentBackend>,
        env_name: String,
    ) -> Self {
        Self {
            db,
            registry,
            store,
            resolver,
            nodes,
            proxy,
            local,
            remote,
            kubernetes,
            env_name,
            locks: Mutex::new(HashMap::new()),
            status_cache: moka::future::Cache::builder()
                .time_to_live(Duration::from_secs(1))
                .max_capacity(10_000)
                .build(),
        }
    }

    fn backend_for(&self, deployment: &Deployment) -> Arc<dyn DeploymentBackend> {
        match deployment.target_type {
            TargetType::LocalDocker => self.local.clone(),
            TargetType::DockerUnode => {
                if is_local_target(deployment.unode_hostname.as_deref(), &self.env_name) {
                    self.local.clone()
                } else {
                    self.remote.clone()
                }
            }
            TargetType::Kubernetes => self.kubernetes.clone(),
        }
    }

    async fn lock_handle(&self, id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Non-blocking lifecycle lock: a held lock means another operation
    /// is in flight, which is a conflict for the caller.
    async fn try_lock(&self, id: Uuid) -> Result<OwnedMutexGuard<()>, ApiError> {
        let handle = self.lock_handle(id).await;
        handle.try_lock_owned().map_err(|_| {
            ApiError::conflict("Another lifecycle operation is in flight for this deployment")
        })
    }

    async fn load(&self, id: Uuid) -> Result<Deployment, ApiError> {
        deployments::find_by_id(&self.db, id)
            .await?
            .ok_or_else(|| ApiError::not_found(format!("Deployment {} not found", id)))
    }

    /// Create a deployment record and kick off placement in the
    /// background. A client disconnect does not cancel the work.
    pub async fn deploy(
        self: Arc<Self>,
        request: DeployRequest,
        created_by: Option<String>,
    ) -> Result<Deployment, ApiError> {
        let service = self
            .registry
            .get(&request.service_id)
            .ok_or_else(|| {
                ApiError::not_found(format!("Service '{}' not found", request.service_id))
            })?;

        // Capability gate: refuse to place anything while required
        // provider keys are missing.
        let requirements = self.resolver.resolve(&[request.service_id.clone()]);
        if !requirements.all_configured {
            let missing: Vec<&MissingKey> = requirements
                .required_capabilities
                .iter()
                .flat_map(|c| c.missing_keys.iter())
                .collect();
            return Err(ApiError::unconfigured(
                format!("Service '{}' is not fully configured", request.service_id),
                serde_json::to_value(&missing).unwrap_or_default(),
            ));
        }

        // Normalise the requested placement to its canonical identity,
        // then validate it before any record exists.
        let (target_type, unode_hostname) = canonical_target(
            request.target_type,
            request.unode_hostname.clone(),
            &self.env_name,
        );
        match target_type {
            TargetType::LocalDocker => {}
            TargetType::DockerUnode => {
                let hostname = unode_hostname.as_deref().unwrap_or_default();
                self.nodes.require_available(hostname).await?;
            }
            TargetType::Kubernetes => {
                let cluster_id = request.cluster_id.as_deref().ok_or_else(|| {
                    ApiError::bad_request("cluster_id is required for kubernetes targets")
                })?;
                if crate::db::clusters::get(&self.db, cluster_id).await?.is_none() {
                    return Err(ApiError::not_found(format!(
                        "Cluster '{}' not registered",
                        cluster_id
                    )));
                }
            }
        }

        // Cluster and namespace only distinguish Kubernetes placements;
        // on Docker targets a stray value would split the identity the
        // conflict check depends on.
        let (cluster_id, namespace) = match target_type {
            TargetType::Kubernetes => (request.cluster_id.clone(), request.namespace.clone()),
            _ => (None, None),
        };

        if let Some(existing) = deployments::find_active_for_target(
            &self.db,
            &request.service_id,
            target_type,
            unode_hostname.as_deref(),
            cluster_id.as_deref(),
            namespace.as_deref(),
        )
        .await?
        {
            return Err(ApiError::conflict(format!(
                "Service '{}' already has deployment {} on this target",
                request.service_id, existing.id
            )));
        }

        let (environment, missing) = self.materialise_environment(&service);
        if !missing.is_empty() {
            return Err(ApiError::unconfigured(
                format!(
                    "Required environment variables of '{}' are unbound",
                    request.service_id
                ),
                serde_json::to_value(&missing).unwrap_or_default(),
            ));
        }

        let resolved = ResolvedServiceDefinition::from_definition(&service, environment);

        let target_metadata = json!({
            "replicas": request.replicas.unwrap_or(1),
            "service_type": request.service_type.clone().unwrap_or_else(|| "ClusterIP".into()),
            "ingress_host": request.ingress_host,
        });

        let row = deployments::create(
            &self.db,
            &request.service_id,
            target_type,
            unode_hostname.as_deref(),
            cluster_id.as_deref(),
            namespace.as_deref(),
            &serde_json::to_value(&resolved)
                .map_err(|e| ApiError::internal_anyhow(e.into(), "Failed to snapshot definition"))?,
            created_by.as_deref(),
        )
        .await?;

        let name = container_name(&resolved, row.id);
        let row = deployments::set_backend_result(
            &self.db,
            row.id,
            None,
            Some(&name),
            None,
            None,
            &target_metadata,
        )
        .await?;

        info!(
            "deployment {} created for {} on {} target",
            row.id, row.service_id, row.target_type
        );

        let engine = Arc::clone(&self);
        let deployment_id = row.id;
        tokio::spawn(async move {
            engine.execute_deploy(deployment_id).await;
        });

        Ok(row)
    }

    /// Background half of `deploy`: pull/create on the backend, then
    /// advance the record and the proxy route.
    async fn execute_deploy(&self, id: Uuid) {
        let handle = self.lock_handle(id).await;
        let _guard = handle.lock().await;

        let row = match deployments::transition(
            &self.db,
            id,
            &[DeploymentStatus::Pending],
            DeploymentStatus::Deploying,
        )
        .await
        {
            Ok(Some(row)) => row,
            Ok(None) => {
                warn!("deployment {} left pending state before placement", id);
                return;
            }
            Err(e) => {
                error!("failed to start deployment {}: {:#}", id, e);
                return;
            }
        };

        let resolved: ResolvedServiceDefinition =
            match serde_json::from_value(row.resolved_definition.clone()) {
                Ok(resolved) => resolved,
                Err(e) => {
                    let _ = deployments::mark_failed(
                        &self.db,
                        id,
                        &format!("corrupt resolved definition: {}", e),
                    )
                    .await;
                    return;
                }
            };

        let name = row
            .container_name
            .clone()
            .unwrap_or_else(|| container_name(&resolved, id));

        let backend = self.backend_for(&row);
        match backend.deploy(&row, &resolved, &name).await {
            Ok(outcome) => {
                let mut metadata = row.backend_metadata.clone();
                deep_merge(&mut metadata, &outcome.metadata);

                let result = deployments::set_backend_result(
                    &self.db,
                    id,
                    outcome.container_id.as_deref(),
                    Some(&name),
                    outcome.exposed_port.map(|p| p as i32),
                    outcome.access_url.as_deref(),
                    &metadata,
                )
                .await;
                if let Err(e) = result {
                    error!("failed to record backend result for {}: {:#}", id, e);
                }

                match deployments::transition(
                    &self.db,
                    id,
                    &[DeploymentStatus::Deploying],
                    DeploymentStatus::Running,
                )
                .await
                {
                    Ok(Some(updated)) => {
                        info!("deployment {} is running", id);
                        self.sync_route(&updated).await;
                    }
                    Ok(None) => warn!("deployment {} was mutated during placement", id),
                    Err(e) => error!("failed to mark {} running: {:#}", id, e),
                }
            }
            Err(BackendError::Failed(e)) => {
                error!("deployment {} failed: {:#}", id, e);
                let _ = deployments::mark_failed(&self.db, id, &format!("{:#}", e)).await;
            }
            Err(BackendError::Unavailable(e)) => {
                // Transient: leave the record pending so a retry can pick
                // it up; state must not move to failed.
                warn!("backend unavailable for deployment {}: {:#}", id, e);
                let _ = deployments::transition(
                    &self.db,
                    id,
                    &[DeploymentStatus::Deploying],
                    DeploymentStatus::Pending,
                )
                .await;
            }
        }
    }

    /// Refresh a deployment's status from its backend, at most once per
    /// second per deployment.
    pub async fn status(&self, id: Uuid) -> Result<Deployment, ApiError> {
        let row = self.load(id).await?;
        if state_machine::is_terminal(row.status)
            || matches!(row.status, DeploymentStatus::Pending)
        {
            return Ok(row);
        }

        if self.status_cache.get(&id).await.is_some() {
            return Ok(row);
        }

        let backend = self.backend_for(&row);
        let observed = match backend.status(&row).await {
            Ok(observed) => observed,
            Err(BackendError::Unavailable(e)) => {
                // Last-known state stands while the backend is unreachable.
                warn!("status refresh unavailable for {}: {:#}", id, e);
                return Ok(row);
            }
            Err(BackendError::Failed(e)) => {
                warn!("status refresh failed for {}: {:#}", id, e);
                DeploymentStatus::Failed
            }
        };
        self.status_cache.insert(id, observed).await;

        if observed == row.status || !state_machine::can_transition(row.status, observed) {
            return Ok(row);
        }

        let updated = deployments::update_status(&self.db, id, observed).await?;
        info!(
            "deployment {} observed {} -> {}",
            id, row.status, updated.status
        );
        self.sync_route(&updated).await;
        Ok(updated)
    }

    pub async fn get(&self, id: Uuid) -> Result<Deployment, ApiError> {
        self.load(id).await
    }

    pub async fn list(&self) -> Result<Vec<Deployment>, ApiError> {
        Ok(deployments::list(&self.db).await?)
    }

    pub async fn stop(&self, id: Uuid) -> Result<Deployment, ApiError> {
        let _guard = self.try_lock(id).await?;
        let row = self.load(id).await?;

        match row.status {
            DeploymentStatus::Stopped | DeploymentStatus::Removed => return Ok(row),
            DeploymentStatus::Running
            | DeploymentStatus::Deploying
            | DeploymentStatus::Pending => {}
            other => {
                return Err(ApiError::conflict(format!(
                    "Cannot stop deployment in state '{}'",
                    other
                )))
            }
        }

        let previous = row.status;
        let row = deployments::transition(
            &self.db,
            id,
            &[
                DeploymentStatus::Running,
                DeploymentStatus::Deploying,
                DeploymentStatus::Pending,
            ],
            DeploymentStatus::Stopping,
        )
        .await?
        .ok_or_else(|| ApiError::conflict("Deployment state changed concurrently"))?;

        let backend = self.backend_for(&row);
        match backend.stop(&row).await {
            Ok(()) => {
                self.proxy.remove_service_route(&row.service_id).await;
                let updated = deployments::transition(
                    &self.db,
                    id,
                    &[DeploymentStatus::Stopping],
                    DeploymentStatus::Stopped,
                )
                .await?
                .unwrap_or(row);
                Ok(updated)
            }
            Err(BackendError::Unavailable(e)) => {
                let _ = deployments::transition(
                    &self.db,
                    id,
                    &[DeploymentStatus::Stopping],
                    previous,
                )
                .await;
                Err(ApiError::from(BackendError::Unavailable(e)))
            }
            Err(BackendError::Failed(e)) => {
                self.proxy.remove_service_route(&row.service_id).await;
                let updated =
                    deployments::mark_failed(&self.db, id, &format!("{:#}", e)).await?;
                Ok(updated)
            }
        }
    }

    /// Delete backend resources and mark the record removed. Removing an
    /// already-removed deployment is a successful no-op.
    pub async fn remove(&self, id: Uuid) -> Result<Deployment, ApiError> {
        let _guard = self.try_lock(id).await?;
        let row = self.load(id).await?;

        if row.status == DeploymentStatus::Removed {
            return Ok(row);
        }

        let backend = self.backend_for(&row);

        // A still-running workload is stopped first; failures here are
        // tolerated because remove is forceful.
        if matches!(
            row.status,
            DeploymentStatus::Running | DeploymentStatus::Deploying
        ) {
            if let Err(e) = backend.stop(&row).await {
                warn!("pre-remove stop of {} failed: {}", id, e);
            }
        }

        let previous = row.status;
        let row = deployments::update_status(&self.db, id, DeploymentStatus::Removing).await?;

        match backend.remove(&row).await {
            Ok(()) => {
                self.proxy.remove_service_route(&row.service_id).await;
                let updated =
                    deployments::update_status(&self.db, id, DeploymentStatus::Removed).await?;
                info!("deployment {} removed", id);
                Ok(updated)
            }
            Err(BackendError::Unavailable(e)) => {
                let _ = deployments::update_status(&self.db, id, previous).await;
                Err(ApiError::from(BackendError::Unavailable(e)))
            }
            Err(BackendError::Failed(e)) => {
                let updated =
                    deployments::mark_failed(&self.db, id, &format!("{:#}", e)).await?;
                Ok(updated)
            }
        }
    }

    pub async fn logs(&self, id: Uuid, tail: i64) -> Result<Vec<String>, ApiError> {
        let row = self.load(id).await?;
        let backend = self.backend_for(&row);
        Ok(backend.logs(&row, tail).await?)
    }

    /// Batched deploy: implied infrastructure is placed on the local
    /// target before the requested services. Services that already have
    /// an active local deployment are skipped.
    pub async fn deploy_all(
        self: Arc<Self>,
        service_ids: Vec<String>,
        created_by: Option<String>,
    ) -> Result<Vec<Deployment>, ApiError> {
        let requirements = self.resolver.resolve(&service_ids);
        if !requirements.all_configured {
            let missing: Vec<&MissingKey> = requirements
                .required_capabilities
                .iter()
                .flat_map(|c| c.missing_keys.iter())
                .collect();
            return Err(ApiError::unconfigured(
                "Enabled services are not fully configured",
                serde_json::to_value(&missing).unwrap_or_default(),
            ));
        }

        let mut ordered = requirements.implied_infrastructure.clone();
        ordered.extend(requirements.services.clone());

        let mut results = Vec::new();
        for service_id in ordered {
            let active = deployments::find_active_for_service(&self.db, &service_id).await?;
            if !active.is_empty() {
                continue;
            }
            let request = DeployRequest {
                service_id: service_id.clone(),
                target_type: TargetType::LocalDocker,
                unode_hostname: None,
                cluster_id: None,
                namespace: None,
                replicas: None,
                service_type: None,
                ingress_host: None,
            };
            match self.clone().deploy(request, created_by.clone()).await {
                Ok(deployment) => {
                    // Batched placement is ordered: the next service only
                    // starts once this one reports running (or fails).
                    let settled = self.wait_until_settled(deployment.id).await;
                    results.push(settled.unwrap_or(deployment));
                }
                Err(e) if e.kind == crate::error::ErrorKind::Conflict => {
                    // Raced with another batch; the service is covered.
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(results)
    }

    /// Poll a deployment until it leaves the pending/deploying states,
    /// bounded by the local backend's pull-and-start horizon.
    async fn wait_until_settled(&self, id: Uuid) -> Option<Deployment> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(120);
        loop {
            match self.load(id).await {
                Ok(row) => {
                    if !matches!(
                        row.status,
                        DeploymentStatus::Pending | DeploymentStatus::Deploying
                    ) {
                        return Some(row);
                    }
                    if tokio::time::Instant::now() >= deadline {
                        warn!("deployment {} still settling after batch deadline", id);
                        return Some(row);
                    }
                }
                Err(_) => return None,
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    /// Proxy route invariant: a running user-facing deployment has a
    /// route, anything else does not.
    async fn sync_route(&self, deployment: &Deployment) {
        let user_facing = deployment.exposed_port.is_some();
        if deployment.status == DeploymentStatus::Running && user_facing {
            if let Some(upstream) = route_upstream(deployment) {
                self.proxy
                    .add_service_route(&deployment.service_id, &upstream)
                    .await;
            }
        } else {
            self.proxy.remove_service_route(&deployment.service_id).await;
        }
    }

    /// The authoritative desired route set, for proxy reconciliation.
    pub async fn desired_routes(&self) -> Result<Vec<(String, String)>, ApiError> {
        let running =
            deployments::list_by_status(&self.db, DeploymentStatus::Running).await?;
        Ok(running
            .iter()
            .filter_map(|d| route_upstream(d).map(|u| (d.service_id.clone(), u)))
            .collect())
    }

    /// Bind every declared environment variable of a service, highest
    /// priority source first: per-service override, chosen provider env
    /// map, explicit global mapping, hardcoded literal, declared default.
    /// Unresolvable required variables come back as missing keys.
    pub fn materialise_environment(
        &self,
        service: &ServiceDefinition,
    ) -> (BTreeMap<String, String>, Vec<MissingKey>) {
        materialise_environment(&self.registry, &self.store, &self.resolver, service)
    }
}

/// Upstream address for the proxy route of a running deployment.
fn route_upstream(deployment: &Deployment) -> Option<String> {
    let url = deployment.access_url.as_deref()?;
    Some(
        url.trim_start_matches("http://")
            .trim_start_matches("https://")
            .trim_end_matches('/')
            .to_string(),
    )
}

pub fn materialise_environment(
    registry: &Registry,
    store: &SettingsStore,
    resolver: &CapabilityResolver,
    service: &ServiceDefinition,
) -> (BTreeMap<String, String>, Vec<MissingKey>) {
    // Env maps of the providers actually chosen for this service's
    // capabilities, keyed by the consumer-visible variable name.
    let mut provider_entries: BTreeMap<String, crate::registry::EnvMapEntry> = BTreeMap::new();
    for capability in &service.requires {
        if let Some(provider) = resolver.selected_provider(capability) {
            for entry in &provider.env_map {
                provider_entries
                    .entry(entry.env.clone())
                    .or_insert_with(|| entry.clone());
            }
        }
    }

    let mut environment = BTreeMap::new();
    let mut missing = Vec::new();
    let mut bound_keys: Vec<String> = Vec::new();

    for decl in &service.environment {
        let override_path = format!(
            "service_preferences.{}.env.{}",
            service.compose_file, decl.name
        );
        if let Some(value) = store.get_nonempty(&override_path) {
            environment.insert(decl.name.clone(), value);
            bound_keys.push(format!("{} (override)", decl.name));
            continue;
        }
        if let Some(value) = service.env_literals.get(&decl.name) {
            environment.insert(decl.name.clone(), value.clone());
            bound_keys.push(format!("{} (sidecar)", decl.name));
            continue;
        }

        match &decl.kind {
            EnvVarKind::Hardcoded { value } => {
                environment.insert(decl.name.clone(), value.clone());
                bound_keys.push(format!("{} (literal)", decl.name));
            }
            EnvVarKind::Required { var } | EnvVarKind::Optional { var, .. } => {
                let provider_entry = provider_entries.get(&decl.name);
                let mut value = provider_entry
                    .and_then(|entry| {
                        store
                            .get_nonempty(&entry.settings_path)
                            .or_else(|| entry.default.clone())
                    });

                if value.is_none() {
                    if let Some(path) = registry.global_env_mapping(var) {
                        value = store.get_nonempty(&path);
                    }
                }

                match (value, &decl.kind) {
                    (Some(value), _) => {
                        environment.insert(decl.name.clone(), value);
                        bound_keys.push(decl.name.clone());
                    }
                    (None, EnvVarKind::Optional { default, .. }) => {
                        if !default.is_empty() {
                            environment.insert(decl.name.clone(), default.clone());
                        }
                        bound_keys.push(format!("{} (default)", decl.name));
                    }
                    (None, _) => {
                        let path = provider_entry
                            .map(|e| e.settings_path.clone())
                            .or_else(|| registry.global_env_mapping(var))
                            .unwrap_or_else(|| var.clone());
                        missing.push(MissingKey {
                            key: path.clone(),
                            label: decl.name.clone(),
                            path,
                            kind: if crate::config_store::is_secret_key(&decl.name) {
                                "secret"
                            } else {
                                "text"
                            },
                            link: None,
                        });
                    }
                }
            }
        }
    }

    // Values never reach logs; only the key names and their source do.
    tracing::debug!(
        "materialised env for {}: [{}], {} missing",
        service.id,
        bound_keys.join(", "),
        missing.len()
    );

    (environment, missing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json as j;
    use std::fs;

    #[test]
    fn test_is_local_target() {
        assert!(is_local_target(None, "ushadow"));
        assert!(is_local_target(Some(""), "ushadow"));
        assert!(is_local_target(Some("ushadow"), "ushadow"));
        assert!(is_local_target(Some("localhost"), "ushadow"));
        assert!(!is_local_target(Some("worker-1"), "ushadow"));
    }

    #[test]
    fn test_canonical_target_folds_local_spellings_together() {
        use TargetType::*;

        // The default docker_unode target with no hostname and the
        // explicit local_docker target used by /services/{id}/start are
        // the same physical host; both must produce one identity or the
        // duplicate-deploy conflict check cannot see across them.
        let via_default = canonical_target(DockerUnode, None, "ushadow");
        let via_start = canonical_target(LocalDocker, None, "ushadow");
        assert_eq!(via_default, via_start);
        assert_eq!(via_default, (LocalDocker, None));

        assert_eq!(
            canonical_target(DockerUnode, Some("".into()), "ushadow"),
            (LocalDocker, None)
        );
        assert_eq!(
            canonical_target(DockerUnode, Some("ushadow".into()), "ushadow"),
            (LocalDocker, None)
        );
        assert_eq!(
            canonical_target(DockerUnode, Some("localhost".into()), "ushadow"),
            (LocalDocker, None)
        );
        // A stray hostname on an explicit local_docker request is noise.
        assert_eq!(
            canonical_target(LocalDocker, Some("worker-1".into()), "ushadow"),
            (LocalDocker, None)
        );
    }

    #[test]
    fn test_canonical_target_normalises_remote_and_passes_k8s() {
        use TargetType::*;

        // Remote hostnames match the lowercase form the join path stores.
        assert_eq!(
            canonical_target(DockerUnode, Some(" Worker-1 ".into()), "ushadow"),
            (DockerUnode, Some("worker-1".into()))
        );
        assert_eq!(
            canonical_target(Kubernetes, None, "ushadow"),
            (Kubernetes, None)
        );
    }

    fn fixture() -> (
        tempfile::TempDir,
        Arc<Registry>,
        Arc<SettingsStore>,
        Arc<CapabilityResolver>,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config");
        fs::create_dir_all(config.join("services")).unwrap();
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
      - CHRONICLE_MODEL=${CHRONICLE_MODEL:-gpt-4o-mini}
      - LOG_LEVEL=info
      - MONGODB_URI=${MONGODB_URI}
    x-ushadow:
      requires: [llm]
"#,
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
"#,
        )
        .unwrap();
        fs::write(
            config.join("env-mappings.yaml"),
            "mappings:\n  MONGODB_URI: infrastructure.mongodb_url\n",
        )
        .unwrap();
        fs::write(
            config.join("config.defaults.yaml"),
            "api_keys:\n  openai: \"\"\ninfrastructure:\n  mongodb_url: mongodb://mongo:27017\n",
        )
        .unwrap();

        let registry = Arc::new(Registry::new(&config, dir.path().join("compose")));
        registry.reload().unwrap();
        let store = Arc::new(SettingsStore::new(&config));
        let resolver = Arc::new(CapabilityResolver::new(registry.clone(), store.clone()));
        (dir, registry, store, resolver)
    }

    #[test]
    fn test_materialise_environment_priorities() {
        let (_dir, registry, store, resolver) = fixture();
        store
            .update(&j!({ "api_keys": { "openai": "sk-BOUND" } }))
            .unwrap();

        let service = registry.get("chronicle:chronicle-backend").unwrap();
        let (env, missing) = materialise_environment(&registry, &store, &resolver, &service);

        assert!(missing.is_empty());
        // provider env map
        assert_eq!(env.get("OPENAI_API_KEY").map(String::as_str), Some("sk-BOUND"));
        // declared default
        assert_eq!(env.get("CHRONICLE_MODEL").map(String::as_str), Some("gpt-4o-mini"));
        // hardcoded literal
        assert_eq!(env.get("LOG_LEVEL").map(String::as_str), Some("info"));
        // global mapping
        assert_eq!(
            env.get("MONGODB_URI").map(String::as_str),
            Some("mongodb://mongo:27017")
        );
    }

    #[test]
    fn test_materialise_environment_reports_missing_required() {
        let (_dir, registry, store, resolver) = fixture();
        let service = registry.get("chronicle:chronicle-backend").unwrap();
        let (env, missing) = materialise_environment(&registry, &store, &resolver, &service);

        assert!(!env.contains_key("OPENAI_API_KEY"));
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].key, "api_keys.openai");
        assert_eq!(missing[0].kind, "secret");
    }

    #[test]
    fn test_service_override_beats_provider_binding() {
        let (_dir, registry, store, resolver) = fixture();
        store
            .update(&j!({ "api_keys": { "openai": "sk-PROVIDER" } }))
            .unwrap();
        store
            .update_layer(
                &j!({ "service_preferences": { "chronicle": { "env": { "CHRONICLE_MODEL": "gpt-4" } } } }),
                crate::config_store::Layer::Overrides,
            )
            .unwrap();

        let service = registry.get("chronicle:chronicle-backend").unwrap();
        let (env, _missing) = materialise_environment(&registry, &store, &resolver, &service);
        assert_eq!(env.get("CHRONICLE_MODEL").map(String::as_str), Some("gpt-4"));
    }

    #[test]
    fn test_route_upstream_strips_scheme() {
        let mut deployment = Deployment {
            id: Uuid::new_v4(),
            service_id: "nginx:nginx".into(),
            target_type: TargetType::LocalDocker,
            unode_hostname: None,
            cluster_id: None,
            namespace: None,
            status: DeploymentStatus::Running,
            container_id: None,
            container_name: Some("nginx-abc12345".into()),
            exposed_port: Some(8080),
            access_url: Some("http://localhost:8080/".into()),
            error_message: None,
            resolved_definition: j!({}),
            backend_metadata: j!({}),
            created_by: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            deployed_at: None,
            stopped_at: None,
        };
        assert_eq!(route_upstream(&deployment).as_deref(), Some("localhost:8080"));
        deployment.access_url = None;
        assert_eq!(route_upstream(&deployment), None);
    }
}
