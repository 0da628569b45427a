//! TeamHub real-time delivery server

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use redis::aio::ConnectionManager as RedisConnection;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use teamhub_realtime::{
    auth::HttpTokenValidator,
    presence::{MemoryPresenceStore, PresenceStore, PresenceTracker, RedisPresenceStore},
    pubsub::{Broker, MemoryBroker, PubSubBridge, RedisBroker},
    routes::create_router,
    websocket::{ConnectionManager, ManagerSettings},
    AppState, Config,
};
use teamhub_shared::{create_pool, run_migrations, MessageStore, PgMessageStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = Config::from_env()?;

    // Database
    let pool = create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("failed to connect to database")?;
    if config.run_migrations {
        run_migrations(&pool).await.context("failed to run migrations")?;
        info!("Database migrations applied");
    }
    let store: Arc<dyn MessageStore> = Arc::new(PgMessageStore::new(pool));

    // Bus and presence backends
    let (broker, presence_store): (Arc<dyn Broker>, Arc<dyn PresenceStore>) =
        match &config.redis_url {
            Some(url) => {
                let client = redis::Client::open(url.as_str()).context("invalid REDIS_URL")?;
                let conn = RedisConnection::new(client.clone())
                    .await
                    .context("failed to connect to Redis")?;
                info!("Using Redis for pub/sub and presence");
                (
                    Arc::new(RedisBroker::new(client, conn.clone())),
                    Arc::new(RedisPresenceStore::new(conn)),
                )
            }
            None => {
                warn!("REDIS_URL not set, running single-node with in-memory bus and presence");
                (
                    Arc::new(MemoryBroker::new()),
                    Arc::new(MemoryPresenceStore::new()),
                )
            }
        };

    let validator = Arc::new(
        HttpTokenValidator::new(&config.auth_service_url, config.auth_timeout())
            .context("failed to build auth client")?,
    );

    let manager = ConnectionManager::new(
        Arc::clone(&store),
        PubSubBridge::new(broker),
        PresenceTracker::new(presence_store, config.presence_ttl()),
        validator.clone(),
        ManagerSettings {
            outbound_buffer: config.ws_outbound_buffer,
            shutdown_drain: config.shutdown_drain(),
            heartbeat_interval: config.presence_heartbeat(),
        },
    );
    manager.start_heartbeat();
    info!(instance_id = %manager.instance_id(), "Connection manager started");

    let state = AppState::new(store, validator, manager.clone());
    let app = create_router(state);

    let addr: SocketAddr = config
        .bind_address
        .parse()
        .with_context(|| format!("invalid BIND_ADDRESS: {}", config.bind_address))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("TeamHub realtime listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            manager.shutdown().await;
        })
        .await?;

    info!("Server stopped");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "teamhub_realtime=info,tower_http=info".into());

    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
