use crate::auth::{AuthError, Identity, IdentityResolver};

/// Per-connection authentication state.
/// `Authenticated` is terminal: there is no downgrade and no re-authentication.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HandshakeState {
    #[default]
    Unauthenticated,
    Authenticated(Identity),
}

#[derive(Debug, Default)]
pub struct Handshake {
    state: HandshakeState,
}

impl Handshake {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    pub fn identity(&self) -> Option<&Identity> {
        match &self.state {
            HandshakeState::Authenticated(identity) => Some(identity),
            HandshakeState::Unauthenticated => None,
        }
    }

    /// Handle an `auth` event.
    ///
    /// On an already authenticated connection the held identity is returned
    /// without consulting the resolver. On failure the state is unchanged and
    /// the client may retry.
    pub async fn authenticate(
        &mut self,
        resolver: &IdentityResolver,
        token: Option<&str>,
    ) -> Result<Identity, AuthError> {
        if let HandshakeState::Authenticated(identity) = &self.state {
            return Ok(identity.clone());
        }

        let resolution = resolver.resolve(token.ok_or(AuthError::MissingToken)?).await?;
        if let Some(reason) = &resolution.fallback_reason {
            tracing::info!(
                user_id = resolution.identity.id,
                reason = %reason,
                "Remote auth unavailable, token accepted by local verification"
            );
        }

        self.state = HandshakeState::Authenticated(resolution.identity.clone());
        Ok(resolution.identity)
    }
}
