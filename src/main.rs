use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use turbo_server::auth::jwt::{load_or_generate_jwt_secret, LocalVerifier};
use turbo_server::auth::remote::RemoteAuth;
use turbo_server::auth::IdentityResolver;
use turbo_server::broker::{Broker, MemoryBroker, NsqBroker};
use turbo_server::chat::bridge::BrokerBridge;
use turbo_server::cleanup::{CleanupPool, StorageTarget};
use turbo_server::config::{generate_config_template, BrokerKind, Config};
use turbo_server::db::{self, SqliteGateway};
use turbo_server::routes;
use turbo_server::state::AppState;
use turbo_server::ws::actor::Keepalive;
use turbo_server::ws::ConnectionRegistry;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("turbo_server=info"))?;
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().pretty().with_env_filter(filter).init();
    }

    tracing::info!("Turbo server v{} starting", env!("CARGO_PKG_VERSION"));

    // Initialize SQLite database (schema is migrated on open)
    let db = db::init_db(&config.data_dir)?;
    let gateway = SqliteGateway::new(db.clone());

    let jwt_secret = load_or_generate_jwt_secret(&config.jwt_secret, &config.data_dir)?;
    let mut identity = IdentityResolver::new(LocalVerifier::new(jwt_secret));
    if let Some(base) = config.auth_base() {
        identity = identity.with_remote(RemoteAuth::new(base, config.auth_api_key.clone())?);
    }
    if identity.has_remote() {
        tracing::info!(auth_url = ?config.auth_base(), "Remote auth enabled, local verification as fallback");
    } else {
        tracing::info!("No auth provider configured, tokens are verified locally only");
    }

    let broker: Arc<dyn Broker> = match config.broker {
        BrokerKind::Memory => Arc::new(MemoryBroker::default()),
        BrokerKind::Nsq => Arc::new(NsqBroker::connect(&config.nsqd_address, &config.channel).await?),
    };

    // One subscription per process feeds every local connection.
    let connections = ConnectionRegistry::new();
    let bridge = BrokerBridge::new(broker, &config.topic);
    bridge.start_fanout(connections.clone()).await?;

    let storage = match (config.auth_base(), config.storage_service_key.as_deref()) {
        (Some(base), Some(key)) if !key.is_empty() => Some(StorageTarget {
            base_url: base.to_string(),
            service_key: key.to_string(),
        }),
        _ => None,
    };
    let cleanup = CleanupPool::spawn(config.cleanup_workers, config.cleanup_queue, storage.clone())?;

    let app_state = AppState {
        db,
        gateway: Arc::new(gateway),
        connections,
        identity,
        bridge,
        cleanup,
        storage,
        outbound_queue: config.outbound_queue,
        idle_timeout: config.idle_timeout_secs.map(Duration::from_secs),
        keepalive: Keepalive::default(),
    };

    let app = routes::build_router(app_state);

    // Bind and serve
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
