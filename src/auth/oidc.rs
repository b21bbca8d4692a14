use anyhow::{anyhow, Context, Result};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::config_store::SettingsStore;

/// Deadline for calls to the provider's token endpoint.
const TOKEN_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Token set returned by the OIDC provider.
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct RawTokenResponse {
    access_token: String,
    token_type: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Client for the configured federated identity provider: exchanges
/// browser-delivered authorization codes (PKCE) using the backend-held
/// client secret, and proxies refresh-token exchanges.
pub struct OidcClient {
    issuer: String,
    client_id: String,
    client_secret: String,
    http_client: reqwest::Client,
}

impl OidcClient {
    pub fn new(issuer: String, client_id: String, client_secret: String) -> Self {
        Self {
            issuer: issuer.trim_end_matches('/').to_string(),
            client_id,
            client_secret,
            http_client: reqwest::Client::new(),
        }
    }

    /// Build from the store if federated auth is configured and enabled.
    pub fn from_store(store: &SettingsStore) -> Option<Self> {
        if !store.get_bool("keycloak.enabled").unwrap_or(false) {
            return None;
        }
        let issuer = store.get_nonempty("keycloak.issuer")?;
        let client_id = store.get_nonempty("keycloak.client_id")?;
        let client_secret = store.get_string("keycloak.client_secret").unwrap_or_default();
        Some(Self::new(issuer, client_id, client_secret))
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    fn token_url(&self) -> String {
        format!("{}/protocol/openid-connect/token", self.issuer)
    }

    async fn token_request(&self, params: HashMap<&str, &str>) -> Result<TokenSet> {
        let response = self
            .http_client
            .post(self.token_url())
            .timeout(TOKEN_EXCHANGE_TIMEOUT)
            .form(&params)
            .send()
            .await
            .context("Failed to reach OIDC token endpoint")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!(
                "Token request failed with status {}: {}",
                status,
                error_text
            ));
        }

        let raw: RawTokenResponse = response
            .json()
            .await
            .context("Failed to parse token response")?;
        Ok(TokenSet {
            access_token: raw.access_token,
            id_token: raw.id_token,
            refresh_token: raw.refresh_token,
            token_type: raw.token_type,
            expires_in: raw.expires_in.unwrap_or(3600),
        })
    }

    /// Exchange an authorization code for tokens (PKCE flow). The client
    /// secret never leaves the backend.
    pub async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
    ) -> Result<TokenSet> {
        let mut params = HashMap::new();
        params.insert("grant_type", "authorization_code");
        params.insert("code", code);
        params.insert("redirect_uri", redirect_uri);
        params.insert("code_verifier", code_verifier);
        params.insert("client_id", self.client_id.as_str());
        params.insert("client_secret", self.client_secret.as_str());
        self.token_request(params).await
    }

    /// Refresh-token exchange, proxied to the provider.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenSet> {
        let mut params = HashMap::new();
        params.insert("grant_type", "refresh_token");
        params.insert("refresh_token", refresh_token);
        params.insert("client_id", self.client_id.as_str());
        params.insert("client_secret", self.client_secret.as_str());
        self.token_request(params).await
    }
}

#[derive(Debug, Deserialize)]
struct OidcDiscovery {
    jwks_uri: String,
}

#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize, Clone)]
struct Jwk {
    #[serde(rename = "use", default)]
    key_use: Option<String>,
    kty: String,
    kid: String,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
}

/// Validator for bearer tokens issued by the federated provider. Signing
/// keys are discovered through the issuer's OIDC metadata and cached;
/// an unknown kid triggers one refresh before failing.
pub struct OidcValidator {
    issuer: String,
    keys: Arc<RwLock<HashMap<String, DecodingKey>>>,
    http_client: reqwest::Client,
}

impl OidcValidator {
    pub fn new(issuer: String) -> Self {
        Self {
            issuer: issuer.trim_end_matches('/').to_string(),
            keys: Arc::new(RwLock::new(HashMap::new())),
            http_client: reqwest::Client::new(),
        }
    }

    async fn fetch_jwks(&self) -> Result<()> {
        let discovery_url = format!("{}/.well-known/openid-configuration", self.issuer);
        let discovery: OidcDiscovery = self
            .http_client
            .get(&discovery_url)
            .send()
            .await
            .context("Failed to fetch OIDC discovery document")?
            .json()
            .await
            .context("Failed to parse OIDC discovery document")?;

        let jwks: JwksResponse = self
            .http_client
            .get(&discovery.jwks_uri)
            .send()
            .await
            .context("Failed to fetch JWKS")?
            .json()
            .await
            .context("Failed to parse JWKS response")?;

        let mut keys = self.keys.write().await;
        keys.clear();
        for jwk in jwks.keys {
            if jwk.kty != "RSA" || jwk.key_use.as_deref().unwrap_or("sig") != "sig" {
                continue;
            }
            let (Some(n), Some(e)) = (&jwk.n, &jwk.e) else {
                continue;
            };
            let decoding_key = DecodingKey::from_rsa_components(n, e)
                .context("Failed to build decoding key from JWK")?;
            keys.insert(jwk.kid.clone(), decoding_key);
        }
        tracing::info!("loaded {} signing keys from {}", keys.len(), self.issuer);
        Ok(())
    }

    async fn get_key(&self, kid: &str) -> Result<DecodingKey> {
        {
            let keys = self.keys.read().await;
            if let Some(key) = keys.get(kid) {
                return Ok(key.clone());
            }
        }
        self.fetch_jwks().await?;
        let keys = self.keys.read().await;
        keys.get(kid)
            .cloned()
            .ok_or_else(|| anyhow!("Key {} not found in JWKS", kid))
    }

    /// Validate an external token: signature against the issuer's JWKS,
    /// issuer pinned, audience left to the provider's configuration.
    pub async fn validate(&self, token: &str) -> Result<serde_json::Value> {
        let header = decode_header(token).context("Failed to decode JWT header")?;
        let kid = header
            .kid
            .ok_or_else(|| anyhow!("JWT header missing kid"))?;
        let key = self.get_key(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[&self.issuer]);
        validation.validate_aud = false;

        let data = decode::<serde_json::Value>(token, &key, &validation)
            .context("Failed to validate external token")?;
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_url_shape() {
        let client = OidcClient::new(
            "https://auth.example.com/realms/ushadow/".into(),
            "ushadow-backend".into(),
            "secret".into(),
        );
        assert_eq!(
            client.token_url(),
            "https://auth.example.com/realms/ushadow/protocol/openid-connect/token"
        );
    }

    #[test]
    fn test_from_store_respects_enabled_flag() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.defaults.yaml"),
            "keycloak:\n  enabled: false\n  issuer: https://kc.example.com\n  client_id: ushadow-backend\n  client_secret: s3cret\n",
        )
        .unwrap();
        let store = SettingsStore::new(dir.path());
        assert!(OidcClient::from_store(&store).is_none());

        std::fs::write(
            dir.path().join("config.defaults.yaml"),
            "keycloak:\n  enabled: true\n  issuer: https://kc.example.com\n  client_id: ushadow-backend\n  client_secret: s3cret\n",
        )
        .unwrap();
        store.invalidate();
        let client = OidcClient::from_store(&store).expect("client");
        assert_eq!(client.issuer(), "https://kc.example.com");
    }
}
