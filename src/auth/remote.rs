use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;

use super::{id_from_claim, AuthError, Identity, IdentitySource};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Validates tokens against a hosted auth provider's `GET /auth/v1/user`.
pub struct RemoteAuth {
    client: reqwest::Client,
    user_url: String,
    api_key: Option<String>,
}

impl RemoteAuth {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            user_url: format!("{}/auth/v1/user", base_url.trim_end_matches('/')),
            api_key: api_key.filter(|k| !k.is_empty()),
        })
    }
}

#[async_trait]
impl IdentitySource for RemoteAuth {
    async fn resolve(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        let mut request = self.client.get(&self.user_url).bearer_auth(token);
        if let Some(key) = &self.api_key {
            request = request.header("apikey", key);
        }

        let response = request.send().await?;
        if response.status() != StatusCode::OK {
            return Err(AuthError::Rejected(response.status().as_u16()));
        }

        let body: Value = response.json().await?;
        identity_from_user(&body)
    }
}

fn identity_from_user(user: &Value) -> Result<Identity, AuthError> {
    let object = user
        .as_object()
        .ok_or_else(|| AuthError::MalformedUser(format!("expected object, got {}", user)))?;

    Ok(Identity {
        id: object.get("id").map(id_from_claim).unwrap_or(0),
        email: object
            .get("email")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}
