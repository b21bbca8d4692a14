use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::digitalocean::DigitalOceanProvider;
use super::hetzner::HetznerProvider;
use super::{CloudProvider, CloudProviderKind, CreateInstance, DEFAULT_READY_TIMEOUT};
use crate::config_store::SettingsStore;
use crate::db::cloud_instances;
use crate::db::models::{CloudInstanceRow, NodeRole};
use crate::error::{ApiError, ErrorKind};
use crate::nodes::{JoinTokenRequest, NodeManager};

const SSH_KEY_NAME: &str = "ushadow-cloud-key";
const INSTANCE_LABEL: &str = "ushadow";

#[derive(Debug, Clone, Deserialize)]
pub struct ProvisionRequest {
    pub provider: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SaveCredentialsRequest {
    pub provider: String,
    pub api_token: String,
}

/// Bridges the cloud drivers and the u-node fleet: provisions VMs whose
/// user-data is the join script, tracks their lifecycle and cost, and
/// links them to the node that eventually calls home.
pub struct CloudNodeManager {
    db: PgPool,
    store: Arc<SettingsStore>,
    nodes: Arc<NodeManager>,
    public_url: String,
    agent_port: u16,
}

impl CloudNodeManager {
    pub fn new(
        db: PgPool,
        store: Arc<SettingsStore>,
        nodes: Arc<NodeManager>,
        public_url: String,
        agent_port: u16,
    ) -> Self {
        Self {
            db,
            store,
            nodes,
            public_url,
            agent_port,
        }
    }

    fn parse_kind(provider: &str) -> Result<CloudProviderKind, ApiError> {
        CloudProviderKind::from_str(provider)
            .map_err(|e| ApiError::bad_request(format!("{}", e)))
    }

    fn token_path(kind: CloudProviderKind) -> String {
        format!("cloud.{}.api_token", kind)
    }

    /// Build a driver for a provider from its stored API token. A missing
    /// token is an unconfigured condition carrying the key to fill in.
    pub fn provider_for(&self, kind: CloudProviderKind) -> Result<Box<dyn CloudProvider>, ApiError> {
        let path = Self::token_path(kind);
        let token = self.store.get_nonempty(&path).ok_or_else(|| {
            ApiError::unconfigured(
                format!("No API token configured for {}", kind),
                json!([{ "key": path, "label": format!("{} API token", kind), "path": path, "type": "secret" }]),
            )
        })?;
        Ok(match kind {
            CloudProviderKind::Hetzner => Box::new(HetznerProvider::new(token)),
            CloudProviderKind::Digitalocean => Box::new(DigitalOceanProvider::new(token)),
        })
    }

    pub async fn save_credentials(&self, request: SaveCredentialsRequest) -> Result<(), ApiError> {
        let kind = Self::parse_kind(&request.provider)?;
        let provider: Box<dyn CloudProvider> = match kind {
            CloudProviderKind::Hetzner => {
                Box::new(HetznerProvider::new(request.api_token.clone()))
            }
            CloudProviderKind::Digitalocean => {
                Box::new(DigitalOceanProvider::new(request.api_token.clone()))
            }
        };
        if !provider.validate_credentials().await {
            return Err(ApiError::bad_request(format!(
                "Credentials for {} were rejected by the provider API",
                kind
            )));
        }

        let mut patch = serde_json::Value::Object(serde_json::Map::new());
        crate::config_store::set_path(&mut patch, &Self::token_path(kind), json!(request.api_token));
        self.store
            .update(&patch)
            .map_err(|e| ApiError::internal_anyhow(e, "Failed to persist credentials"))?;
        info!("cloud credentials saved for {}", kind);
        Ok(())
    }

    pub fn configured_providers(&self) -> Vec<CloudProviderKind> {
        [CloudProviderKind::Hetzner, CloudProviderKind::Digitalocean]
            .into_iter()
            .filter(|kind| self.store.get_nonempty(&Self::token_path(*kind)).is_some())
            .collect()
    }

    pub fn remove_credentials(&self, provider: &str) -> Result<(), ApiError> {
        let kind = Self::parse_kind(provider)?;
        let mut patch = serde_json::Value::Object(serde_json::Map::new());
        crate::config_store::set_path(&mut patch, &Self::token_path(kind), json!(""));
        self.store
            .update(&patch)
            .map_err(|e| ApiError::internal_anyhow(e, "Failed to clear credentials"))?;
        Ok(())
    }

    /// Ensure the shared SSH key is registered, if a public key has been
    /// configured. Instances are reachable without it (via the overlay),
    /// so absence is not fatal.
    async fn ensure_ssh_key(&self, provider: &dyn CloudProvider) -> Vec<String> {
        let keys = match provider.list_ssh_keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("could not list SSH keys: {:#}", e);
                return Vec::new();
            }
        };
        if let Some(existing) = keys.iter().find(|k| k.name == SSH_KEY_NAME) {
            return vec![existing.id.clone()];
        }
        let Some(public_key) = self.store.get_nonempty("cloud.ssh_public_key") else {
            return Vec::new();
        };
        match provider.create_ssh_key(SSH_KEY_NAME, &public_key).await {
            Ok(key) => vec![key.id],
            Err(e) => {
                warn!("could not register SSH key: {:#}", e);
                Vec::new()
            }
        }
    }

    /// Provision a VM that bootstraps itself into the node fleet. The
    /// instance row exists before the VM is ready; a background task
    /// tracks it to running and records the usage transition.
    pub async fn provision_node(
        self: Arc<Self>,
        request: ProvisionRequest,
        owner_email: Option<String>,
    ) -> Result<CloudInstanceRow, ApiError> {
        let kind = Self::parse_kind(&request.provider)?;
        let provider = self.provider_for(kind)?;

        let size = match request.size {
            Some(size) => {
                let sizes = provider
                    .list_sizes()
                    .await
                    .map_err(|e| ApiError::new(ErrorKind::BackendUnavailable, format!("{:#}", e)))?;
                sizes
                    .into_iter()
                    .find(|s| s.id == size)
                    .ok_or_else(|| ApiError::bad_request(format!("Unknown size '{}'", size)))?
            }
            None => provider
                .get_recommended_size()
                .await
                .map_err(|e| ApiError::new(ErrorKind::BackendUnavailable, format!("{:#}", e)))?,
        };

        let region = match request.region {
            Some(region) => region,
            None => provider
                .list_regions()
                .await
                .map_err(|e| ApiError::new(ErrorKind::BackendUnavailable, format!("{:#}", e)))?
                .into_iter()
                .find(|r| r.available)
                .map(|r| r.id)
                .ok_or_else(|| {
                    ApiError::new(ErrorKind::BackendUnavailable, "No region available")
                })?,
        };

        let name = request.name.unwrap_or_else(|| {
            format!("ushadow-node-{}", &uuid::Uuid::new_v4().to_string()[..8])
        });

        // Single-use join token baked into the bootstrap script.
        let join_token = self
            .nodes
            .create_join_token(JoinTokenRequest {
                expires_in_hours: 2,
                max_uses: 1,
                role: NodeRole::Worker,
            })
            .await?;
        let user_data = crate::nodes::manager::join_script(
            &self.public_url,
            &join_token.token,
            self.agent_port,
        );

        let ssh_key_ids = self.ensure_ssh_key(provider.as_ref()).await;

        let mut labels = BTreeMap::new();
        labels.insert(INSTANCE_LABEL.to_string(), "unode".to_string());

        let vm = provider
            .create_instance(CreateInstance {
                name: name.clone(),
                region: region.clone(),
                size: size.id.clone(),
                ssh_key_ids,
                user_data: Some(user_data),
                labels,
            })
            .await
            .map_err(|e| ApiError::new(ErrorKind::BackendFailed, format!("{:#}", e)))?;

        let row = cloud_instances::insert(
            &self.db,
            &vm.id,
            &vm.name,
            &kind.to_string(),
            &vm.region,
            &vm.size,
            &vm.status.to_string(),
            vm.public_ipv4.as_deref(),
            size.price_hourly,
            owner_email.as_deref(),
        )
        .await?;
        cloud_instances::record_usage(
            &self.db,
            &vm.id,
            &kind.to_string(),
            "created",
            size.price_hourly,
        )
        .await?;

        info!(
            "provisioned {} instance {} ({}, {} in {})",
            kind, vm.id, vm.name, size.id, region
        );

        // Track readiness in the background; the caller sees the pending
        // row immediately.
        let manager = Arc::clone(&self);
        let instance_id = vm.id.clone();
        tokio::spawn(async move {
            manager.track_until_ready(kind, instance_id).await;
        });

        Ok(row)
    }

    async fn track_until_ready(&self, kind: CloudProviderKind, instance_id: String) {
        let provider = match self.provider_for(kind) {
            Ok(provider) => provider,
            Err(e) => {
                error!("readiness tracking aborted for {}: {}", instance_id, e.message);
                return;
            }
        };
        match provider
            .wait_for_ready(&instance_id, DEFAULT_READY_TIMEOUT)
            .await
        {
            Ok(vm) => {
                let _ = cloud_instances::update_status(
                    &self.db,
                    &instance_id,
                    &vm.status.to_string(),
                    vm.public_ipv4.as_deref(),
                )
                .await;
                let rate = self.hourly_rate_of(&instance_id).await;
                let _ = cloud_instances::record_usage(
                    &self.db,
                    &instance_id,
                    &kind.to_string(),
                    "running",
                    rate,
                )
                .await;
                info!("instance {} is ready at {:?}", instance_id, vm.public_ipv4);
            }
            Err(e) => {
                // The VM keeps running; the operator decides what to do.
                warn!("instance {} not ready in time: {:#}", instance_id, e);
            }
        }
    }

    async fn hourly_rate_of(&self, instance_id: &str) -> f64 {
        cloud_instances::get(&self.db, instance_id)
            .await
            .ok()
            .flatten()
            .map(|row| row.hourly_cost)
            .unwrap_or(0.0)
    }

    pub async fn list_instances(&self) -> Result<Vec<CloudInstanceRow>, ApiError> {
        Ok(cloud_instances::list(&self.db).await?)
    }

    /// Refresh one instance from the provider API and return the row.
    pub async fn get_instance(&self, instance_id: &str) -> Result<CloudInstanceRow, ApiError> {
        let row = cloud_instances::get(&self.db, instance_id)
            .await?
            .ok_or_else(|| ApiError::not_found(format!("Instance '{}' not found", instance_id)))?;
        let kind = Self::parse_kind(&row.provider)?;
        let provider = self.provider_for(kind)?;
        if let Ok(Some(vm)) = provider.get_instance(instance_id).await {
            cloud_instances::update_status(
                &self.db,
                instance_id,
                &vm.status.to_string(),
                vm.public_ipv4.as_deref(),
            )
            .await?;
        }
        cloud_instances::get(&self.db, instance_id)
            .await?
            .ok_or_else(|| ApiError::not_found(format!("Instance '{}' not found", instance_id)))
    }

    async fn lifecycle(
        &self,
        instance_id: &str,
        event: &str,
        op: impl FnOnce(
            Box<dyn CloudProvider>,
            String,
        ) -> futures::future::BoxFuture<'static, anyhow::Result<bool>>,
    ) -> Result<(), ApiError> {
        let row = cloud_instances::get(&self.db, instance_id)
            .await?
            .ok_or_else(|| ApiError::not_found(format!("Instance '{}' not found", instance_id)))?;
        let kind = Self::parse_kind(&row.provider)?;
        let provider = self.provider_for(kind)?;

        let changed = op(provider, instance_id.to_string())
            .await
            .map_err(|e| ApiError::new(ErrorKind::BackendUnavailable, format!("{:#}", e)))?;
        if !changed {
            return Err(ApiError::not_found(format!(
                "Instance '{}' no longer exists at {}",
                instance_id, kind
            )));
        }
        cloud_instances::record_usage(&self.db, instance_id, &row.provider, event, row.hourly_cost)
            .await?;
        Ok(())
    }

    pub async fn start_instance(&self, instance_id: &str) -> Result<(), ApiError> {
        self.lifecycle(instance_id, "started", |provider, id| {
            Box::pin(async move { provider.start_instance(&id).await })
        })
        .await
    }

    pub async fn stop_instance(&self, instance_id: &str) -> Result<(), ApiError> {
        self.lifecycle(instance_id, "stopped", |provider, id| {
            Box::pin(async move { provider.stop_instance(&id).await })
        })
        .await
    }

    pub async fn reboot_instance(&self, instance_id: &str) -> Result<(), ApiError> {
        self.lifecycle(instance_id, "rebooted", |provider, id| {
            Box::pin(async move { provider.reboot_instance(&id).await })
        })
        .await
    }

    /// Destroy the VM, record the transition, and cascade removal of the
    /// u-node it had become.
    pub async fn terminate_instance(&self, instance_id: &str) -> Result<(), ApiError> {
        let row = cloud_instances::get(&self.db, instance_id)
            .await?
            .ok_or_else(|| ApiError::not_found(format!("Instance '{}' not found", instance_id)))?;
        let kind = Self::parse_kind(&row.provider)?;
        let provider = self.provider_for(kind)?;

        provider
            .delete_instance(instance_id)
            .await
            .map_err(|e| ApiError::new(ErrorKind::BackendUnavailable, format!("{:#}", e)))?;

        cloud_instances::update_status(&self.db, instance_id, "deleted", None).await?;
        cloud_instances::record_usage(
            &self.db,
            instance_id,
            &row.provider,
            "deleted",
            row.hourly_cost,
        )
        .await?;

        if let Some(hostname) = row.unode_hostname {
            if let Err(e) = self.nodes.remove_node(&hostname).await {
                warn!("cascade removal of u-node '{}' failed: {}", hostname, e.message);
            }
        }
        info!("instance {} terminated", instance_id);
        Ok(())
    }

    /// Correlate a joining node's public IP with a pending instance.
    pub async fn link_instance_by_public_ip(
        &self,
        public_ip: &str,
        hostname: &str,
        overlay_ip: Option<&str>,
    ) -> Result<(), ApiError> {
        if public_ip.trim().is_empty() {
            return Ok(());
        }
        if let Some(instance) = cloud_instances::find_by_public_ip(&self.db, public_ip).await? {
            cloud_instances::link_unode(&self.db, &instance.id, hostname, overlay_ip).await?;
            info!(
                "linked cloud instance {} to u-node '{}'",
                instance.id, hostname
            );
        }
        Ok(())
    }

    /// Monthly cost summary from usage records: per-instance billed
    /// intervals (running periods) times the hourly rate.
    pub async fn usage_summary(&self) -> Result<serde_json::Value, ApiError> {
        let since = Utc::now() - ChronoDuration::days(30);
        let records = cloud_instances::usage_since(&self.db, since).await?;

        let mut per_instance: BTreeMap<String, (f64, f64)> = BTreeMap::new();
        let mut open: BTreeMap<String, (chrono::DateTime<Utc>, f64)> = BTreeMap::new();

        for record in &records {
            let billable = matches!(record.event.as_str(), "created" | "running" | "started" | "rebooted");
            match (billable, open.remove(&record.instance_id)) {
                (true, None) => {
                    open.insert(record.instance_id.clone(), (record.recorded_at, record.hourly_rate));
                }
                (true, Some(existing)) => {
                    // Still running; keep the earliest start of the interval.
                    open.insert(record.instance_id.clone(), existing);
                }
                (false, Some((start, rate))) => {
                    let hours =
                        (record.recorded_at - start).num_seconds().max(0) as f64 / 3600.0;
                    let entry = per_instance.entry(record.instance_id.clone()).or_default();
                    entry.0 += hours;
                    entry.1 += hours * rate;
                }
                (false, None) => {}
            }
        }

        // Open intervals accrue up to now.
        let now = Utc::now();
        for (instance_id, (start, rate)) in open {
            let hours = (now - start).num_seconds().max(0) as f64 / 3600.0;
            let entry = per_instance.entry(instance_id).or_default();
            entry.0 += hours;
            entry.1 += hours * rate;
        }

        let total: f64 = per_instance.values().map(|(_, cost)| cost).sum();
        let instances: Vec<serde_json::Value> = per_instance
            .into_iter()
            .map(|(id, (hours, cost))| {
                json!({ "instance_id": id, "hours": hours, "cost": cost })
            })
            .collect();

        Ok(json!({
            "since": since,
            "total_cost": total,
            "instances": instances,
        }))
    }

    /// Estimated monthly cost for running `count` instances of a size.
    pub async fn estimate_monthly_cost(
        &self,
        provider: &str,
        size: &str,
        count: u32,
    ) -> Result<f64, ApiError> {
        let kind = Self::parse_kind(provider)?;
        let provider = self.provider_for(kind)?;
        let sizes = provider
            .list_sizes()
            .await
            .map_err(|e| ApiError::new(ErrorKind::BackendUnavailable, format!("{:#}", e)))?;
        Ok(sizes
            .into_iter()
            .find(|s| s.id == size)
            .map(|s| s.price_monthly * count as f64)
            .unwrap_or(0.0))
    }
}
