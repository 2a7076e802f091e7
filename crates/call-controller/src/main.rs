//! Call Controller
//!
//! Call lifecycle, presence and WebRTC signaling relay service.
//!
//! # Servers
//!
//! - WebSocket gateway for client call traffic (default: 0.0.0.0:8080)
//! - HTTP server for health endpoints and metrics (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Read `Config` from the environment
//! 2. Initialize tracing and the Prometheus metrics recorder
//! 3. Open the Call Registry (Postgres with migrations, or in-memory)
//! 4. Build the Session Cache, Lifecycle Engine and controller
//! 5. Start the sweeper task
//! 6. Start health and gateway servers, then report ready
//! 7. Wait for shutdown signal, drain, stop actors

#![warn(clippy::pedantic)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use call_controller::actors::{CallControllerHandle, ControllerSettings};
use call_controller::config::{Config, RegistryBackend, DEFAULT_LOG_FILTER};
use call_controller::gateway::{gateway_router, Gateway, GatewayHub};
use call_controller::lifecycle::LifecycleEngine;
use call_controller::notifications::NotificationSink;
use call_controller::observability::metrics::init_metrics_recorder;
use call_controller::observability::{health_router, HealthState};
use call_controller::repositories::{CallRegistry, InMemoryCallRegistry, PgCallRegistry};
use call_controller::session::SessionCache;
use call_controller::tasks::start_sweeper;
use common::secret::ExposeSecret;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Time allowed for in-flight call operations once shutdown begins.
const ACTOR_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Pause between closing listeners and stopping actors.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Configuration first: it decides the log format.
    let config = Config::from_env();
    let json_logs = config
        .as_ref()
        .is_ok_and(|config| config.observability.json_logs);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json_logs).then(tracing_subscriber::fmt::layer))
        .init();

    info!("Call Controller starting");

    let config = config.map_err(|e| {
        error!(error = %e, "Invalid configuration");
        e
    })?;

    info!(
        instance_id = %config.instance_id,
        registry_backend = ?config.registry_backend,
        bind_address = %config.bind_address,
        health_bind_address = %config.health_bind_address,
        invitation_ttl_seconds = config.invitation_ttl_seconds,
        default_max_participants = config.default_max_participants,
        sweep_interval_seconds = config.sweep_interval_seconds,
        stale_call_seconds = config.stale_call_seconds,
        "Configuration loaded"
    );

    // The recorder must be installed before anything records a metric.
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Could not install the Prometheus recorder");
        e
    })?;
    info!("Prometheus recorder installed");

    let health_state = Arc::new(HealthState::new());
    let registry = open_registry(&config).await?;

    let hub = Arc::new(GatewayHub::new());
    let engine = Arc::new(LifecycleEngine::new(
        Arc::clone(&registry),
        Arc::new(SessionCache::new(config.signal_queue_capacity)),
        Arc::clone(&hub) as Arc<dyn NotificationSink>,
        config.lifecycle_settings(),
    ));

    // Servers and tasks hang off a child of the controller's token, so
    // stopping the controller stops them too.
    let controller_token = CancellationToken::new();
    let shutdown_token = controller_token.child_token();
    let controller = CallControllerHandle::new(
        ControllerSettings::new(config.instance_id.clone()),
        engine,
        controller_token,
    );

    tokio::spawn(start_sweeper(
        controller.clone(),
        Arc::clone(&registry),
        config.sweeper_config(),
        shutdown_token.child_token(),
    ));

    // Both listeners are bound here so a taken port fails startup.
    let health_app = health_router(Arc::clone(&health_state), Some(prometheus_handle));
    let health_listener = bind("health", &config.health_bind_address).await?;
    spawn_server("health", health_listener, health_app, shutdown_token.child_token());

    let gateway_app = gateway_router(Arc::new(Gateway::new(controller.clone(), hub)));
    let gateway_listener = bind("gateway", &config.bind_address).await?;
    spawn_server("gateway", gateway_listener, gateway_app, shutdown_token.child_token());

    health_state.set_ready();
    info!("Call Controller ready");
    shutdown_signal().await;

    info!("Stopping: readiness withdrawn, draining connections");
    // New sockets go elsewhere from here on.
    health_state.set_not_ready();
    shutdown_token.cancel();
    tokio::time::sleep(DRAIN_GRACE).await;

    controller.shutdown(ACTOR_SHUTDOWN_DEADLINE).await;

    info!("Call Controller stopped");
    Ok(())
}

/// Open the configured Call Registry. Postgres gets its migrations applied
/// and a round trip before the service reports ready.
async fn open_registry(
    config: &Config,
) -> Result<Arc<dyn CallRegistry>, Box<dyn std::error::Error>> {
    match config.registry_backend {
        RegistryBackend::Postgres => {
            let database = config
                .database
                .as_ref()
                .ok_or("DATABASE_URL is required for the postgres registry")?;

            let pool = PgPoolOptions::new()
                .max_connections(database.max_connections)
                .min_connections(1)
                .acquire_timeout(Duration::from_secs(5))
                .idle_timeout(Duration::from_secs(600))
                .connect(database.url.expose_secret())
                .await
                .map_err(|e| {
                    error!(error = %e, "Postgres connection failed");
                    e
                })?;

            sqlx::migrate!("../../migrations")
                .run(&pool)
                .await
                .map_err(|e| {
                    error!(error = %e, "Call Registry migrations failed");
                    e
                })?;

            let registry = PgCallRegistry::new(pool);
            registry.ping().await?;
            info!(max_connections = database.max_connections, "Call Registry on Postgres");
            Ok(Arc::new(registry))
        }
        RegistryBackend::Memory => {
            warn!("Call Registry is in memory; call history is lost on restart");
            Ok(Arc::new(InMemoryCallRegistry::new()))
        }
    }
}

async fn bind(
    name: &'static str,
    address: &str,
) -> Result<tokio::net::TcpListener, Box<dyn std::error::Error>> {
    let addr: SocketAddr = address.parse().map_err(|e| {
        error!(server = name, error = %e, addr = %address, "Bind address does not parse");
        format!("{name}: bad bind address {address}: {e}")
    })?;
    tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!(server = name, error = %e, addr = %addr, "Listener bind failed");
        format!("{name}: cannot bind {addr}: {e}").into()
    })
}

/// Serve `app` until `stop` fires, then let in-flight requests finish.
fn spawn_server(
    name: &'static str,
    listener: tokio::net::TcpListener,
    app: axum::Router,
    stop: CancellationToken,
) {
    tokio::spawn(async move {
        if let Ok(addr) = listener.local_addr() {
            info!(server = name, addr = %addr, "Listening");
        }
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await;
        match served {
            Ok(()) => info!(server = name, "Server stopped"),
            Err(e) => error!(server = name, error = %e, "Server exited with an error"),
        }
    });
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
///
/// # Panics
///
/// If a signal handler cannot be installed.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "no graceful shutdown without the handler"
        )]
        signal::ctrl_c()
            .await
            .expect("install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "no graceful shutdown without the handler"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
