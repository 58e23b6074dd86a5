//! Two-step identity resolution: remote provider first (when configured),
//! local signature verification second.
//!
//! A remote failure never fails the handshake on its own. It is recorded on
//! the [`Resolution`] (or logged, when local verification also fails) so auth
//! problems can be traced to the step that rejected the token.

use std::sync::Arc;

use super::{strip_bearer, AuthError, Identity, IdentitySource};

/// Which strategy produced the identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedBy {
    Remote,
    Local,
}

#[derive(Debug)]
pub struct Resolution {
    pub identity: Identity,
    pub resolved_by: ResolvedBy,
    /// Why the remote step was skipped over, if it was attempted and failed.
    pub fallback_reason: Option<AuthError>,
}

#[derive(Clone)]
pub struct IdentityResolver {
    remote: Option<Arc<dyn IdentitySource>>,
    local: Arc<dyn IdentitySource>,
}

impl IdentityResolver {
    pub fn new(local: impl IdentitySource + 'static) -> Self {
        Self {
            remote: None,
            local: Arc::new(local),
        }
    }

    pub fn with_remote(mut self, remote: impl IdentitySource + 'static) -> Self {
        self.remote = Some(Arc::new(remote));
        self
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// Resolve a raw token (optionally `Bearer `-prefixed).
    /// On failure the returned error is the local verifier's.
    pub async fn resolve(&self, raw_token: &str) -> Result<Resolution, AuthError> {
        let token = strip_bearer(raw_token);
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        let mut fallback_reason = None;
        if let Some(remote) = &self.remote {
            match remote.resolve(token).await {
                Ok(identity) => {
                    return Ok(Resolution {
                        identity,
                        resolved_by: ResolvedBy::Remote,
                        fallback_reason: None,
                    });
                }
                Err(err) => {
                    tracing::debug!(reason = %err, "Remote auth failed, falling back to local verification");
                    fallback_reason = Some(err);
                }
            }
        }

        match self.local.resolve(token).await {
            Ok(identity) => Ok(Resolution {
                identity,
                resolved_by: ResolvedBy::Local,
                fallback_reason,
            }),
            Err(err) => {
                if let Some(remote_err) = &fallback_reason {
                    tracing::info!(
                        remote = %remote_err,
                        local = %err,
                        "Token rejected by both auth strategies"
                    );
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed(Option<Identity>, Arc<AtomicUsize>);

    #[async_trait]
    impl IdentitySource for Fixed {
        async fn resolve(&self, _token: &str) -> Result<Identity, AuthError> {
            self.1.fetch_add(1, Ordering::SeqCst);
            self.0.clone().ok_or(AuthError::Rejected(401))
        }
    }

    fn identity(id: i64) -> Identity {
        Identity {
            id,
            email: format!("u{}@x.com", id),
        }
    }

    #[test]
    fn test_has_remote_reflects_configuration() {
        let resolver = IdentityResolver::new(Fixed(None, Arc::new(AtomicUsize::new(0))));
        assert!(!resolver.has_remote());
        let resolver = resolver.with_remote(Fixed(None, Arc::new(AtomicUsize::new(0))));
        assert!(resolver.has_remote());
    }

    #[tokio::test]
    async fn test_remote_success_skips_local() {
        let local_calls = Arc::new(AtomicUsize::new(0));
        let resolver = IdentityResolver::new(Fixed(Some(identity(1)), local_calls.clone()))
            .with_remote(Fixed(Some(identity(2)), Arc::new(AtomicUsize::new(0))));

        let resolution = resolver.resolve("Bearer tok").await.unwrap();
        assert_eq!(resolution.identity, identity(2));
        assert_eq!(resolution.resolved_by, ResolvedBy::Remote);
        assert_eq!(local_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_remote_failure_falls_back_and_records_reason() {
        let resolver = IdentityResolver::new(Fixed(Some(identity(1)), Arc::new(AtomicUsize::new(0))))
            .with_remote(Fixed(None, Arc::new(AtomicUsize::new(0))));

        let resolution = resolver.resolve("tok").await.unwrap();
        assert_eq!(resolution.identity, identity(1));
        assert_eq!(resolution.resolved_by, ResolvedBy::Local);
        assert!(matches!(
            resolution.fallback_reason,
            Some(AuthError::Rejected(401))
        ));
    }

    #[tokio::test]
    async fn test_both_failing_returns_error() {
        let resolver = IdentityResolver::new(Fixed(None, Arc::new(AtomicUsize::new(0))))
            .with_remote(Fixed(None, Arc::new(AtomicUsize::new(0))));
        assert!(resolver.resolve("tok").await.is_err());
    }

    #[tokio::test]
    async fn test_empty_token_never_reaches_sources() {
        let calls = Arc::new(AtomicUsize::new(0));
        let resolver = IdentityResolver::new(Fixed(Some(identity(1)), calls.clone()));
        assert!(matches!(
            resolver.resolve("Bearer ").await,
            Err(AuthError::MissingToken)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
