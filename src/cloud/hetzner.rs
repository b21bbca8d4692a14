use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use super::{
    CloudProvider, CloudProviderKind, CloudRegion, CloudVm, CreateInstance, InstanceSize,
    InstanceStatus, SshKey, CLOUD_API_TIMEOUT,
};

const API_BASE: &str = "https://api.hetzner.cloud/v1";
const DEFAULT_IMAGE: &str = "ubuntu-24.04";

/// Hetzner Cloud driver over its public REST API.
pub struct HetznerProvider {
    api_token: String,
    base_url: String,
    client: reqwest::Client,
}

impl HetznerProvider {
    pub fn new(api_token: String) -> Self {
        Self::with_base_url(api_token, API_BASE.to_string())
    }

    pub fn with_base_url(api_token: String, base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(CLOUD_API_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            api_token,
            base_url,
            client,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_token)
    }

    async fn expect_success(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(anyhow!("Hetzner {} failed with {}: {}", what, status, body))
    }

    async fn action(&self, instance_id: &str, action: &str) -> Result<bool> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/servers/{}/actions/{}", instance_id, action),
            )
            .send()
            .await
            .with_context(|| format!("Hetzner {} request failed", action))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::expect_success(response, action).await?;
        Ok(true)
    }
}

#[derive(Debug, Deserialize)]
struct LocationsResponse {
    locations: Vec<HetznerLocation>,
}

#[derive(Debug, Deserialize)]
struct HetznerLocation {
    name: String,
    description: String,
    country: String,
}

#[derive(Debug, Deserialize)]
struct ServerTypesResponse {
    server_types: Vec<HetznerServerType>,
}

#[derive(Debug, Deserialize)]
struct HetznerServerType {
    name: String,
    description: String,
    cores: u32,
    /// GiB
    memory: f64,
    /// GB
    disk: u64,
    #[serde(default)]
    deprecated: Option<bool>,
    #[serde(default)]
    prices: Vec<HetznerPrice>,
}

#[derive(Debug, Deserialize)]
struct HetznerPrice {
    price_hourly: HetznerAmount,
    price_monthly: HetznerAmount,
}

#[derive(Debug, Deserialize)]
struct HetznerAmount {
    gross: String,
}

#[derive(Debug, Deserialize)]
struct SshKeysResponse {
    ssh_keys: Vec<HetznerSshKey>,
}

#[derive(Debug, Deserialize)]
struct SshKeyResponse {
    ssh_key: HetznerSshKey,
}

#[derive(Debug, Deserialize)]
struct HetznerSshKey {
    id: u64,
    name: String,
    fingerprint: String,
}

#[derive(Debug, Deserialize)]
struct ServersResponse {
    servers: Vec<HetznerServer>,
}

#[derive(Debug, Deserialize)]
struct ServerResponse {
    server: HetznerServer,
}

#[derive(Debug, Deserialize)]
struct HetznerServer {
    id: u64,
    name: String,
    status: String,
    created: Option<DateTime<Utc>>,
    public_net: HetznerPublicNet,
    server_type: HetznerServerTypeRef,
    datacenter: HetznerDatacenter,
}

#[derive(Debug, Deserialize)]
struct HetznerPublicNet {
    #[serde(default)]
    ipv4: Option<HetznerIp>,
    #[serde(default)]
    ipv6: Option<HetznerIp>,
}

#[derive(Debug, Deserialize)]
struct HetznerIp {
    ip: String,
}

#[derive(Debug, Deserialize)]
struct HetznerServerTypeRef {
    name: String,
}

#[derive(Debug, Deserialize)]
struct HetznerDatacenter {
    location: HetznerLocationRef,
}

#[derive(Debug, Deserialize)]
struct HetznerLocationRef {
    name: String,
}

fn normalise_status(status: &str) -> InstanceStatus {
    match status {
        "running" => InstanceStatus::Running,
        "initializing" | "starting" | "migrating" | "rebuilding" => InstanceStatus::Initializing,
        "stopping" => InstanceStatus::Stopping,
        "off" => InstanceStatus::Stopped,
        "deleting" => InstanceStatus::Deleting,
        _ => InstanceStatus::Pending,
    }
}

impl HetznerServer {
    fn into_vm(self, hourly_cost: f64) -> CloudVm {
        CloudVm {
            id: self.id.to_string(),
            name: self.name,
            provider: CloudProviderKind::Hetzner,
            region: self.datacenter.location.name,
            size: self.server_type.name,
            status: normalise_status(&self.status),
            public_ipv4: self.public_net.ipv4.map(|ip| ip.ip),
            public_ipv6: self.public_net.ipv6.map(|ip| ip.ip),
            private_ip: None,
            created_at: self.created,
            hourly_cost,
        }
    }
}

#[async_trait]
impl CloudProvider for HetznerProvider {
    fn kind(&self) -> CloudProviderKind {
        CloudProviderKind::Hetzner
    }

    async fn list_regions(&self) -> Result<Vec<CloudRegion>> {
        let response = self
            .request(reqwest::Method::GET, "/locations")
            .send()
            .await
            .context("Hetzner locations request failed")?;
        let parsed: LocationsResponse = Self::expect_success(response, "locations")
            .await?
            .json()
            .await
            .context("Hetzner locations response malformed")?;
        Ok(parsed
            .locations
            .into_iter()
            .map(|location| CloudRegion {
                id: location.name,
                name: location.description,
                country: location.country,
                available: true,
            })
            .collect())
    }

    async fn list_sizes(&self) -> Result<Vec<InstanceSize>> {
        let response = self
            .request(reqwest::Method::GET, "/server_types")
            .send()
            .await
            .context("Hetzner server_types request failed")?;
        let parsed: ServerTypesResponse = Self::expect_success(response, "server_types")
            .await?
            .json()
            .await
            .context("Hetzner server_types response malformed")?;
        Ok(parsed
            .server_types
            .into_iter()
            .filter(|t| !t.deprecated.unwrap_or(false))
            .filter_map(|t| {
                let price = t.prices.first()?;
                Some(InstanceSize {
                    id: t.name.clone(),
                    name: t.description.clone(),
                    vcpus: t.cores,
                    memory_mb: (t.memory * 1024.0) as u64,
                    disk_gb: t.disk,
                    price_hourly: price.price_hourly.gross.parse().ok()?,
                    price_monthly: price.price_monthly.gross.parse().ok()?,
                })
            })
            .collect())
    }

    async fn list_ssh_keys(&self) -> Result<Vec<SshKey>> {
        let response = self
            .request(reqwest::Method::GET, "/ssh_keys")
            .send()
            .await
            .context("Hetzner ssh_keys request failed")?;
        let parsed: SshKeysResponse = Self::expect_success(response, "ssh_keys")
            .await?
            .json()
            .await
            .context("Hetzner ssh_keys response malformed")?;
        Ok(parsed
            .ssh_keys
            .into_iter()
            .map(|key| SshKey {
                id: key.id.to_string(),
                name: key.name,
                fingerprint: Some(key.fingerprint),
            })
            .collect())
    }

    async fn create_ssh_key(&self, name: &str, public_key: &str) -> Result<SshKey> {
        let response = self
            .request(reqwest::Method::POST, "/ssh_keys")
            .json(&json!({ "name": name, "public_key": public_key }))
            .send()
            .await
            .context("Hetzner ssh key creation failed")?;
        let parsed: SshKeyResponse = Self::expect_success(response, "ssh key creation")
            .await?
            .json()
            .await
            .context("Hetzner ssh key response malformed")?;
        Ok(SshKey {
            id: parsed.ssh_key.id.to_string(),
            name: parsed.ssh_key.name,
            fingerprint: Some(parsed.ssh_key.fingerprint),
        })
    }

    async fn delete_ssh_key(&self, key_id: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::DELETE, &format!("/ssh_keys/{}", key_id))
            .send()
            .await
            .context("Hetzner ssh key deletion failed")?;
        Self::expect_success(response, "ssh key deletion").await?;
        Ok(())
    }

    async fn create_instance(&self, spec: CreateInstance) -> Result<CloudVm> {
        let body = json!({
            "name": spec.name,
            "server_type": spec.size,
            "image": DEFAULT_IMAGE,
            "location": spec.region,
            "ssh_keys": spec.ssh_key_ids,
            "user_data": spec.user_data,
            "labels": spec.labels,
        });
        let response = self
            .request(reqwest::Method::POST, "/servers")
            .json(&body)
            .send()
            .await
            .context("Hetzner server creation failed")?;
        let parsed: ServerResponse = Self::expect_success(response, "server creation")
            .await?
            .json()
            .await
            .context("Hetzner server response malformed")?;

        // Pull the hourly price for the chosen size so cost accounting
        // starts at creation.
        let hourly_cost = self
            .list_sizes()
            .await
            .ok()
            .and_then(|sizes| sizes.into_iter().find(|s| s.id == spec.size))
            .map(|s| s.price_hourly)
            .unwrap_or(0.0);

        Ok(parsed.server.into_vm(hourly_cost))
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<CloudVm>> {
        let response = self
            .request(reqwest::Method::GET, &format!("/servers/{}", instance_id))
            .send()
            .await
            .context("Hetzner server lookup failed")?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let parsed: ServerResponse = Self::expect_success(response, "server lookup")
            .await?
            .json()
            .await
            .context("Hetzner server response malformed")?;
        Ok(Some(parsed.server.into_vm(0.0)))
    }

    async fn list_instances(&self) -> Result<Vec<CloudVm>> {
        let response = self
            .request(reqwest::Method::GET, "/servers")
            .send()
            .await
            .context("Hetzner server listing failed")?;
        let parsed: ServersResponse = Self::expect_success(response, "server listing")
            .await?
            .json()
            .await
            .context("Hetzner servers response malformed")?;
        Ok(parsed
            .servers
            .into_iter()
            .map(|server| server.into_vm(0.0))
            .collect())
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<bool> {
        let response = self
            .request(reqwest::Method::DELETE, &format!("/servers/{}", instance_id))
            .send()
            .await
            .context("Hetzner server deletion failed")?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::expect_success(response, "server deletion").await?;
        Ok(true)
    }

    async fn start_instance(&self, instance_id: &str) -> Result<bool> {
        self.action(instance_id, "poweron").await
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<bool> {
        self.action(instance_id, "poweroff").await
    }

    async fn reboot_instance(&self, instance_id: &str) -> Result<bool> {
        self.action(instance_id, "reboot").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_normalisation() {
        assert_eq!(normalise_status("running"), InstanceStatus::Running);
        assert_eq!(normalise_status("initializing"), InstanceStatus::Initializing);
        assert_eq!(normalise_status("off"), InstanceStatus::Stopped);
        assert_eq!(normalise_status("deleting"), InstanceStatus::Deleting);
        assert_eq!(normalise_status("unknown"), InstanceStatus::Pending);
    }

    #[test]
    fn test_server_json_mapping() {
        let raw = serde_json::json!({
            "id": 42,
            "name": "ushadow-node-1",
            "status": "running",
            "created": "2026-01-01T00:00:00Z",
            "public_net": { "ipv4": { "ip": "203.0.113.7" }, "ipv6": null },
            "server_type": { "name": "cx22" },
            "datacenter": { "location": { "name": "nbg1" } }
        });
        let server: HetznerServer = serde_json::from_value(raw).unwrap();
        let vm = server.into_vm(0.008);
        assert_eq!(vm.id, "42");
        assert_eq!(vm.status, InstanceStatus::Running);
        assert_eq!(vm.public_ipv4.as_deref(), Some("203.0.113.7"));
        assert_eq!(vm.region, "nbg1");
        assert_eq!(vm.size, "cx22");
    }
}
