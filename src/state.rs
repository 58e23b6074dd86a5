use std::sync::Arc;
use std::time::Duration;

use crate::auth::IdentityResolver;
use crate::chat::bridge::BrokerBridge;
use crate::cleanup::{CleanupPool, StorageTarget};
use crate::db::{DbPool, PersistenceGateway};
use crate::ws::actor::Keepalive;
use crate::ws::ConnectionRegistry;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// SQLite connection wrapped in Arc<Mutex>, used by the profile endpoint
    pub db: DbPool,
    /// Message/author storage used by the ingest path
    pub gateway: Arc<dyn PersistenceGateway>,
    /// Active WebSocket connections
    pub connections: ConnectionRegistry,
    /// Remote-then-local token verification
    pub identity: IdentityResolver,
    /// Shared broker publisher and the process's fan-out subscription
    pub bridge: BrokerBridge,
    /// Bounded pool for best-effort storage cleanup
    pub cleanup: CleanupPool,
    /// Storage API that avatar URLs point into, if configured
    pub storage: Option<StorageTarget>,
    /// Per-connection outbound queue depth
    pub outbound_queue: usize,
    /// Close connections silent for this long (None = never)
    pub idle_timeout: Option<Duration>,
    /// Ping interval and pong deadline for dead-peer detection
    pub keepalive: Keepalive,
}
