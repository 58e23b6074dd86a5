pub mod jwt;
pub mod remote;
pub mod resolver;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use resolver::{IdentityResolver, Resolution, ResolvedBy};

/// The authenticated principal behind a connection or request.
///
/// `id` is 0 when the token came from a provider whose user ids do not fit the
/// local integer id space; such identities are matched by `email`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: i64,
    pub email: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,
    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("auth endpoint unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),
    #[error("auth endpoint rejected token with status {0}")]
    Rejected(u16),
    #[error("auth endpoint returned a malformed user: {0}")]
    MalformedUser(String),
}

/// Anything that can turn a bearer token into an [`Identity`].
#[async_trait]
pub trait IdentitySource: Send + Sync {
    async fn resolve(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Strip an optional `Bearer ` prefix and surrounding whitespace.
pub fn strip_bearer(token: &str) -> &str {
    let token = token.trim();
    token.strip_prefix("Bearer ").unwrap_or(token).trim()
}

/// Map a JSON id claim onto the local id space.
/// Numbers are truncated to i64; strings (provider UUIDs) map to 0.
pub(crate) fn id_from_claim(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strip_bearer() {
        assert_eq!(strip_bearer("Bearer abc.def"), "abc.def");
        assert_eq!(strip_bearer("  abc.def "), "abc.def");
        assert_eq!(strip_bearer("Bearer "), "");
    }

    #[test]
    fn test_id_from_claim_shapes() {
        assert_eq!(id_from_claim(&json!(42)), 42);
        assert_eq!(id_from_claim(&json!(7.0)), 7);
        assert_eq!(id_from_claim(&json!("0b6f3a52-8c1e-4b8e-9d7e-1f2a3b4c5d6e")), 0);
        assert_eq!(id_from_claim(&Value::Null), 0);
    }
}
