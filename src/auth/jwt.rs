use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{id_from_claim, AuthError, Identity, IdentitySource};

/// Lifetime of tokens issued by this server.
pub const TOKEN_TTL_SECS: i64 = 24 * 60 * 60;

/// Claims carried by locally issued tokens.
/// `sub` is usually the numeric user id but is kept loose so foreign tokens
/// signed with the same key still decode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Value,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub iat: Option<i64>,
    pub exp: i64,
}

/// Resolve the HS256 signing key.
///
/// A non-empty configured secret wins. Otherwise the key is stored as raw
/// bytes in data_dir/jwt_secret and generated on first boot.
pub fn load_or_generate_jwt_secret(
    configured: &str,
    data_dir: &str,
) -> Result<Vec<u8>, std::io::Error> {
    if !configured.is_empty() {
        return Ok(configured.as_bytes().to_vec());
    }

    std::fs::create_dir_all(data_dir)?;
    let key_path = Path::new(data_dir).join("jwt_secret");

    if key_path.exists() {
        let key = std::fs::read(&key_path)?;
        if key.len() == 32 {
            tracing::info!("JWT signing key loaded from {}", key_path.display());
            return Ok(key);
        }
        tracing::warn!("JWT key file has wrong size ({}), regenerating", key.len());
    }

    let key: [u8; 32] = rand::rng().random();
    std::fs::write(&key_path, key)?;
    tracing::info!("JWT signing key generated at {}", key_path.display());
    Ok(key.to_vec())
}

/// Issue a token for `identity` valid for `ttl_secs`.
pub fn issue_token(
    secret: &[u8],
    identity: &Identity,
    ttl_secs: i64,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: Value::from(identity.id),
        email: Some(identity.email.clone()),
        iat: Some(now),
        exp: now + ttl_secs,
    };

    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret))
}

/// Validate a token's signature and expiry and return its claims.
pub fn validate_token(secret: &[u8], token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let validation = Validation::new(Algorithm::HS256);
    let token_data = decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)?;
    Ok(token_data.claims)
}

/// Verifies self-issued tokens against the process signing key.
pub struct LocalVerifier {
    secret: Vec<u8>,
}

impl LocalVerifier {
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }
}

#[async_trait]
impl IdentitySource for LocalVerifier {
    async fn resolve(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let claims = validate_token(&self.secret, token)?;
        Ok(Identity {
            id: id_from_claim(&claims.sub),
            email: claims.email.unwrap_or_default(),
        })
    }
}
