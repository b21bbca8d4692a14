pub mod handlers;
pub mod jwt;
pub mod middleware;
pub mod oidc;
pub mod password;
pub mod routes;

use anyhow::Result;
use serde_json::json;

use crate::config_store::SettingsStore;

pub use jwt::JwtSigner;
pub use oidc::{OidcClient, OidcValidator};

/// Resolve the JWT signing secret, migrating it from the AUTH_SECRET_KEY
/// environment variable into secrets.yaml on first boot so later
/// restarts do not need the variable.
pub fn resolve_auth_secret(store: &SettingsStore) -> Result<String> {
    if let Some(secret) = store.get_nonempty("security.auth_secret_key") {
        return Ok(secret);
    }
    let secret = std::env::var("AUTH_SECRET_KEY").unwrap_or_default();
    if secret.trim().is_empty() {
        anyhow::bail!(
            "AUTH_SECRET_KEY not found. Provide it via environment variable on first \
             start; it will be persisted to secrets.yaml for future restarts."
        );
    }
    store.update(&json!({ "security": { "auth_secret_key": secret } }))?;
    tracing::info!("AUTH_SECRET_KEY persisted to the secrets layer");
    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_secret_bootstrap_from_env() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.defaults.yaml"),
            "security:\n  auth_secret_key: \"\"\n",
        )
        .unwrap();
        let store = SettingsStore::new(dir.path());

        std::env::set_var("AUTH_SECRET_KEY", "bootstrap-secret-1234");
        let secret = resolve_auth_secret(&store).unwrap();
        assert_eq!(secret, "bootstrap-secret-1234");
        std::env::remove_var("AUTH_SECRET_KEY");

        // Persisted: a second resolve no longer needs the variable.
        let secret = resolve_auth_secret(&store).unwrap();
        assert_eq!(secret, "bootstrap-secret-1234");
        let secrets_file = std::fs::read_to_string(dir.path().join("secrets.yaml")).unwrap();
        assert!(secrets_file.contains("bootstrap-secret-1234"));
    }
}
