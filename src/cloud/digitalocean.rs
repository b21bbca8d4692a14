use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use super::{
    CloudProvider, CloudProviderKind, CloudRegion, CloudVm, CreateInstance, InstanceSize,
    InstanceStatus, SshKey, CLOUD_API_TIMEOUT,
};

const API_BASE: &str = "https://api.digitalocean.com/v2";
const DEFAULT_IMAGE: &str = "ubuntu-24-04-x64";

/// DigitalOcean driver over its public REST API.
pub struct DigitalOceanProvider {
    api_token: String,
    base_url: String,
    client: reqwest::Client,
}

impl DigitalOceanProvider {
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
        Err(anyhow!(
            "DigitalOcean {} failed with {}: {}",
            what,
            status,
            body
        ))
    }

    async fn action(&self, instance_id: &str, action_type: &str) -> Result<bool> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/droplets/{}/actions", instance_id),
            )
            .json(&json!({ "type": action_type }))
            .send()
            .await
            .with_context(|| format!("DigitalOcean {} request failed", action_type))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::expect_success(response, action_type).await?;
        Ok(true)
    }
}

#[derive(Debug, Deserialize)]
struct RegionsResponse {
    regions: Vec<DoRegion>,
}

#[derive(Debug, Deserialize)]
struct DoRegion {
    slug: String,
    name: String,
    available: bool,
}

#[derive(Debug, Deserialize)]
struct SizesResponse {
    sizes: Vec<DoSize>,
}

#[derive(Debug, Deserialize)]
struct DoSize {
    slug: String,
    vcpus: u32,
    /// MB
    memory: u64,
    /// GB
    disk: u64,
    price_hourly: f64,
    price_monthly: f64,
    available: bool,
}

#[derive(Debug, Deserialize)]
struct KeysResponse {
    ssh_keys: Vec<DoSshKey>,
}

#[derive(Debug, Deserialize)]
struct KeyResponse {
    ssh_key: DoSshKey,
}

#[derive(Debug, Deserialize)]
struct DoSshKey {
    id: u64,
    name: String,
    fingerprint: String,
}

#[derive(Debug, Deserialize)]
struct DropletsResponse {
    droplets: Vec<DoDroplet>,
}

#[derive(Debug, Deserialize)]
struct DropletResponse {
    droplet: DoDroplet,
}

#[derive(Debug, Deserialize)]
struct DoDroplet {
    id: u64,
    name: String,
    status: String,
    created_at: Option<DateTime<Utc>>,
    size_slug: String,
    region: DoRegionRef,
    networks: DoNetworks,
}

#[derive(Debug, Deserialize)]
struct DoRegionRef {
    slug: String,
}

#[derive(Debug, Default, Deserialize)]
struct DoNetworks {
    #[serde(default)]
    v4: Vec<DoNetworkV4>,
    #[serde(default)]
    v6: Vec<DoNetworkV6>,
}

#[derive(Debug, Deserialize)]
struct DoNetworkV4 {
    ip_address: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct DoNetworkV6 {
    ip_address: String,
}

fn normalise_status(status: &str) -> InstanceStatus {
    match status {
        "active" => InstanceStatus::Running,
        "new" => InstanceStatus::Initializing,
        "off" => InstanceStatus::Stopped,
        "archive" => InstanceStatus::Deleted,
        _ => InstanceStatus::Pending,
    }
}

impl DoDroplet {
    fn into_vm(self, hourly_cost: f64) -> CloudVm {
        let public_ipv4 = self
            .networks
            .v4
            .iter()
            .find(|n| n.kind == "public")
            .map(|n| n.ip_address.clone());
        let private_ip = self
            .networks
            .v4
            .iter()
            .find(|n| n.kind == "private")
            .map(|n| n.ip_address.clone());
        let public_ipv6 = self.networks.v6.first().map(|n| n.ip_address.clone());

        CloudVm {
            id: self.id.to_string(),
            name: self.name,
            provider: CloudProviderKind::Digitalocean,
            region: self.region.slug,
            size: self.size_slug,
            status: normalise_status(&self.status),
            public_ipv4,
            public_ipv6,
            private_ip,
            created_at: self.created_at,
            hourly_cost,
        }
    }
}

#[async_trait]
impl CloudProvider for DigitalOceanProvider {
    fn kind(&self) -> CloudProviderKind {
        CloudProviderKind::Digitalocean
    }

    async fn list_regions(&self) -> Result<Vec<CloudRegion>> {
        let response = self
            .request(reqwest::Method::GET, "/regions?per_page=200")
            .send()
            .await
            .context("DigitalOcean regions request failed")?;
        let parsed: RegionsResponse = Self::expect_success(response, "regions")
            .await?
            .json()
            .await
            .context("DigitalOcean regions response malformed")?;
        Ok(parsed
            .regions
            .into_iter()
            .map(|region| CloudRegion {
                id: region.slug.clone(),
                name: region.name,
                // DigitalOcean region slugs carry no country code.
                country: region.slug.chars().take(3).collect::<String>().to_uppercase(),
                available: region.available,
            })
            .collect())
    }

    async fn list_sizes(&self) -> Result<Vec<InstanceSize>> {
        let response = self
            .request(reqwest::Method::GET, "/sizes?per_page=200")
            .send()
            .await
            .context("DigitalOcean sizes request failed")?;
        let parsed: SizesResponse = Self::expect_success(response, "sizes")
            .await?
            .json()
            .await
            .context("DigitalOcean sizes response malformed")?;
        Ok(parsed
            .sizes
            .into_iter()
            .filter(|size| size.available)
            .map(|size| InstanceSize {
                id: size.slug.clone(),
                name: size.slug,
                vcpus: size.vcpus,
                memory_mb: size.memory,
                disk_gb: size.disk,
                price_hourly: size.price_hourly,
                price_monthly: size.price_monthly,
            })
            .collect())
    }

    async fn list_ssh_keys(&self) -> Result<Vec<SshKey>> {
        let response = self
            .request(reqwest::Method::GET, "/account/keys?per_page=200")
            .send()
            .await
            .context("DigitalOcean keys request failed")?;
        let parsed: KeysResponse = Self::expect_success(response, "keys")
            .await?
            .json()
            .await
            .context("DigitalOcean keys response malformed")?;
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
            .request(reqwest::Method::POST, "/account/keys")
            .json(&json!({ "name": name, "public_key": public_key }))
            .send()
            .await
            .context("DigitalOcean key creation failed")?;
        let parsed: KeyResponse = Self::expect_success(response, "key creation")
            .await?
            .json()
            .await
            .context("DigitalOcean key response malformed")?;
        Ok(SshKey {
            id: parsed.ssh_key.id.to_string(),
            name: parsed.ssh_key.name,
            fingerprint: Some(parsed.ssh_key.fingerprint),
        })
    }

    async fn delete_ssh_key(&self, key_id: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::DELETE, &format!("/account/keys/{}", key_id))
            .send()
            .await
            .context("DigitalOcean key deletion failed")?;
        Self::expect_success(response, "key deletion").await?;
        Ok(())
    }

    async fn create_instance(&self, spec: CreateInstance) -> Result<CloudVm> {
        let ssh_keys: Vec<u64> = spec
            .ssh_key_ids
            .iter()
            .filter_map(|id| id.parse().ok())
            .collect();
        let tags: Vec<String> = spec
            .labels
            .iter()
            .map(|(k, v)| format!("{}:{}", k, v))
            .collect();
        let body = json!({
            "name": spec.name,
            "region": spec.region,
            "size": spec.size,
            "image": DEFAULT_IMAGE,
            "ssh_keys": ssh_keys,
            "user_data": spec.user_data,
            "tags": tags,
        });
        let response = self
            .request(reqwest::Method::POST, "/droplets")
            .json(&body)
            .send()
            .await
            .context("DigitalOcean droplet creation failed")?;
        let parsed: DropletResponse = Self::expect_success(response, "droplet creation")
            .await?
            .json()
            .await
            .context("DigitalOcean droplet response malformed")?;

        let hourly_cost = self
            .list_sizes()
            .await
            .ok()
            .and_then(|sizes| sizes.into_iter().find(|s| s.id == spec.size))
            .map(|s| s.price_hourly)
            .unwrap_or(0.0);

        Ok(parsed.droplet.into_vm(hourly_cost))
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<CloudVm>> {
        let response = self
            .request(reqwest::Method::GET, &format!("/droplets/{}", instance_id))
            .send()
            .await
            .context("DigitalOcean droplet lookup failed")?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let parsed: DropletResponse = Self::expect_success(response, "droplet lookup")
            .await?
            .json()
            .await
            .context("DigitalOcean droplet response malformed")?;
        Ok(Some(parsed.droplet.into_vm(0.0)))
    }

    async fn list_instances(&self) -> Result<Vec<CloudVm>> {
        let response = self
            .request(reqwest::Method::GET, "/droplets?per_page=200")
            .send()
            .await
            .context("DigitalOcean droplet listing failed")?;
        let parsed: DropletsResponse = Self::expect_success(response, "droplet listing")
            .await?
            .json()
            .await
            .context("DigitalOcean droplets response malformed")?;
        Ok(parsed
            .droplets
            .into_iter()
            .map(|droplet| droplet.into_vm(0.0))
            .collect())
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<bool> {
        let response = self
            .request(reqwest::Method::DELETE, &format!("/droplets/{}", instance_id))
            .send()
            .await
            .context("DigitalOcean droplet deletion failed")?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::expect_success(response, "droplet deletion").await?;
        Ok(true)
    }

    async fn start_instance(&self, instance_id: &str) -> Result<bool> {
        self.action(instance_id, "power_on").await
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<bool> {
        self.action(instance_id, "power_off").await
    }

    async fn reboot_instance(&self, instance_id: &str) -> Result<bool> {
        self.action(instance_id, "reboot").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_droplet_json_mapping() {
        let raw = serde_json::json!({
            "id": 7001,
            "name": "ushadow-node-2",
            "status": "active",
            "created_at": "2026-02-01T12:00:00Z",
            "size_slug": "s-1vcpu-1gb",
            "region": { "slug": "nyc1" },
            "networks": {
                "v4": [
                    { "ip_address": "10.0.0.5", "type": "private" },
                    { "ip_address": "198.51.100.9", "type": "public" }
                ],
                "v6": []
            }
        });
        let droplet: DoDroplet = serde_json::from_value(raw).unwrap();
        let vm = droplet.into_vm(0.00744);
        assert_eq!(vm.status, InstanceStatus::Running);
        assert_eq!(vm.public_ipv4.as_deref(), Some("198.51.100.9"));
        assert_eq!(vm.private_ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(vm.size, "s-1vcpu-1gb");
    }

    #[test]
    fn test_status_normalisation() {
        assert_eq!(normalise_status("active"), InstanceStatus::Running);
        assert_eq!(normalise_status("new"), InstanceStatus::Initializing);
        assert_eq!(normalise_status("off"), InstanceStatus::Stopped);
    }
}
