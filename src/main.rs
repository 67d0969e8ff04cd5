//! Courtside Back binary entrypoint wiring REST, SSE and the tracking store.

use std::{env, net::SocketAddr, sync::Arc};

use anyhow::{Context, bail};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use courtside_back::{
    config::AppConfig,
    dao::tracking_store::MemoryTrackingStore,
    routes,
    services::offline_queue::{FileOfflineQueue, MemoryOfflineQueue, OfflineQueue},
    state::{AppState, SharedState},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::load();
    let spool: Arc<dyn OfflineQueue> = match config.offline_queue_path.clone() {
        Some(path) => Arc::new(
            FileOfflineQueue::open(&path)
                .await
                .with_context(|| format!("opening sync spool {}", path.display()))?,
        ),
        None => Arc::new(MemoryOfflineQueue::new()),
    };
    let app_state = AppState::with_spool(config, spool);

    let backend = env::var("STORAGE_BACKEND").unwrap_or_else(|_| default_backend().into());
    start_storage(&app_state, &backend).await?;

    let app = build_router(app_state);

    let port = env::var("PORT")
        .or_else(|_| env::var("SERVER_PORT"))
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, %backend, "starting server");

    let listener = TcpListener::bind(addr).await.context("binding server")?;
    let service = app.into_make_service();
    axum::serve(listener, service)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving axum")?;

    Ok(())
}

fn default_backend() -> &'static str {
    if cfg!(feature = "mongo-store") {
        "mongo"
    } else if cfg!(feature = "couch-store") {
        "couch"
    } else {
        "memory"
    }
}

/// Install the selected tracking store, supervised in the background for remote backends.
async fn start_storage(state: &SharedState, backend: &str) -> anyhow::Result<()> {
    match backend {
        "memory" => {
            state.set_store(Arc::new(MemoryTrackingStore::new())).await;
            info!("using the in-memory tracking store; data is lost on restart");
        }
        #[cfg(feature = "mongo-store")]
        "mongo" => {
            use courtside_back::{
                dao::{
                    storage::StorageError,
                    tracking_store::{
                        TrackingStore,
                        mongodb::{MongoConfig, MongoTrackingStore},
                    },
                },
                services::storage_supervisor,
            };

            tokio::spawn(storage_supervisor::run(state.clone(), || async {
                let config = MongoConfig::from_env().await?;
                let store = MongoTrackingStore::connect(config).await?;
                Ok::<_, StorageError>(Arc::new(store) as Arc<dyn TrackingStore>)
            }));
        }
        #[cfg(feature = "couch-store")]
        "couch" => {
            use courtside_back::{
                dao::{
                    storage::StorageError,
                    tracking_store::{
                        TrackingStore,
                        couchdb::{CouchConfig, CouchTrackingStore},
                    },
                },
                services::storage_supervisor,
            };

            tokio::spawn(storage_supervisor::run(state.clone(), || async {
                let config = CouchConfig::from_env()?;
                let store = CouchTrackingStore::connect(config).await?;
                Ok::<_, StorageError>(Arc::new(store) as Arc<dyn TrackingStore>)
            }));
        }
        other => bail!("unsupported STORAGE_BACKEND `{other}`"),
    }
    Ok(())
}

/// Build the top-level router and attach cross-cutting middleware layers.
fn build_router(state: SharedState) -> Router<()> {
    routes::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM and shut the server down gracefully.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler; waiting for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
