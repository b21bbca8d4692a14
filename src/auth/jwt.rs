use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::db::models::User;

/// Issuer claim on every token this control plane mints.
pub const ISSUER: &str = "ushadow";

/// Default audience for interactive user tokens.
pub const USER_AUDIENCE: &str = "ushadow-api";

/// Claims carried by ushadow-issued JWTs (user sessions and
/// service-to-service tokens alike).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub iat: u64,
    pub exp: u64,
    pub iss: String,
    pub aud: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("auth secret must not be empty")]
    EmptySecret,
    #[error("JWT signing failed: {0}")]
    SigningFailed(#[from] jsonwebtoken::errors::Error),
    #[error("system time error: {0}")]
    SystemTime(#[from] std::time::SystemTimeError),
}

/// HS256 signer/verifier for locally issued tokens. The symmetric secret
/// lives under `security.auth_secret_key` in the configuration store.
pub struct JwtSigner {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    token_expiry_seconds: u64,
    service_token_expiry_seconds: u64,
}

impl JwtSigner {
    pub fn new(
        secret: &str,
        token_expiry_seconds: u64,
        service_token_expiry_seconds: u64,
    ) -> Result<Self, JwtError> {
        if secret.trim().is_empty() {
            return Err(JwtError::EmptySecret);
        }
        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            token_expiry_seconds,
            service_token_expiry_seconds,
        })
    }

    fn now() -> Result<u64, JwtError> {
        Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
    }

    fn sign(&self, claims: &Claims) -> Result<String, JwtError> {
        let header = Header::new(Algorithm::HS256);
        Ok(encode(&header, claims, &self.encoding_key)?)
    }

    /// Session token for an authenticated user.
    pub fn sign_user_token(&self, user: &User) -> Result<(String, u64), JwtError> {
        let now = Self::now()?;
        let exp = now + self.token_expiry_seconds;
        let claims = Claims {
            sub: user.id.to_string(),
            email: user.email.clone(),
            roles: user.roles.clone(),
            iat: now,
            exp,
            iss: ISSUER.to_string(),
            aud: vec![USER_AUDIENCE.to_string()],
        };
        Ok((self.sign(&claims)?, exp))
    }

    /// Short-lived token carrying the caller's identity for onward calls
    /// to subsystems that only accept local tokens.
    pub fn sign_service_token(
        &self,
        subject: &str,
        email: &str,
        roles: &[String],
        audiences: Vec<String>,
    ) -> Result<(String, u64), JwtError> {
        let now = Self::now()?;
        let exp = now + self.service_token_expiry_seconds;
        let claims = Claims {
            sub: subject.to_string(),
            email: email.to_string(),
            roles: roles.to_vec(),
            iat: now,
            exp,
            iss: ISSUER.to_string(),
            aud: if audiences.is_empty() {
                vec![USER_AUDIENCE.to_string()]
            } else {
                audiences
            },
        };
        Ok((self.sign(&claims)?, exp))
    }

    /// Verify an ushadow-issued token. Audience is not pinned here; the
    /// consuming subsystem checks its own audience when it cares.
    pub fn verify(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[ISSUER]);
        validation.validate_aud = false;
        let data = decode::<Claims>(token, &self.decoding_key, &validation)?;
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn user() -> User {
        User {
            id: Uuid::new_v4(),
            email: "admin@example.com".into(),
            display_name: Some("Admin".into()),
            password_hash: None,
            roles: vec!["admin".into()],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn signer() -> JwtSigner {
        JwtSigner::new("test-secret-test-secret", 3600, 900).unwrap()
    }

    #[test]
    fn test_sign_and_verify_round_trip() {
        let signer = signer();
        let user = user();
        let (token, exp) = signer.sign_user_token(&user).unwrap();
        let claims = signer.verify(&token).unwrap();
        assert_eq!(claims.sub, user.id.to_string());
        assert_eq!(claims.email, user.email);
        assert_eq!(claims.roles, vec!["admin".to_string()]);
        assert_eq!(claims.iss, ISSUER);
        assert_eq!(claims.exp, exp);
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let signer = signer();
        let other = JwtSigner::new("another-secret-entirely", 3600, 900).unwrap();
        let (token, _) = signer.sign_user_token(&user()).unwrap();
        assert!(other.verify(&token).is_err());
    }

    #[test]
    fn test_service_token_audiences() {
        let signer = signer();
        let (token, _) = signer
            .sign_service_token(
                "user-1",
                "admin@example.com",
                &["admin".to_string()],
                vec!["chronicle".to_string(), "openmemory".to_string()],
            )
            .unwrap();
        let claims = signer.verify(&token).unwrap();
        assert_eq!(claims.aud, vec!["chronicle", "openmemory"]);
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(JwtSigner::new("  ", 3600, 900).is_err());
    }
}
