use crate::handlers::{api_handler, health_check, SharedState};
use crate::middleware::{logging_middleware, rate_limit_middleware};
use axum::routing::get;
use axum::{middleware, Router};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::oneshot;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Build the router: `/api` behind admission control, `/health` open.
pub fn create_app(state: SharedState) -> Router {
    let limited = Router::new()
        .route("/api", get(api_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ));

    Router::new()
        .merge(limited)
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(logging_middleware)),
        )
}

pub struct Server {
    app: Router,
    bind_address: SocketAddr,
    shutdown_timeout: Duration,
}

impl Server {
    pub fn new(state: SharedState, bind_address: SocketAddr, shutdown_timeout: Duration) -> Self {
        Self {
            app: create_app(state),
            bind_address,
            shutdown_timeout,
        }
    }

    pub async fn run(self) -> io::Result<()> {
        let listener = TcpListener::bind(self.bind_address).await?;

        info!("Throttler server starting on {}", self.bind_address);
        info!("Rate limited endpoint available at /api");
        info!("Health check available at /health");

        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on `listener` until `shutdown` resolves, then drain in-flight
    /// requests for at most the shutdown timeout.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (draining_tx, draining_rx) = oneshot::channel::<()>();
        let signal = async move {
            shutdown.await;
            let _ = draining_tx.send(());
        };

        let app = self
            .app
            .into_make_service_with_connect_info::<SocketAddr>();
        let server = axum::serve(listener, app).with_graceful_shutdown(signal);
        let mut serving = tokio::spawn(async move { server.await });

        tokio::select! {
            finished = &mut serving => return flatten(finished),
            _ = draining_rx => {}
        }

        match tokio::time::timeout(self.shutdown_timeout, &mut serving).await {
            Ok(finished) => {
                info!("Server exited cleanly");
                flatten(finished)
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.shutdown_timeout.as_secs(),
                    "Server forced to shutdown with requests still in flight"
                );
                serving.abort();
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "graceful shutdown timed out",
                ))
            }
        }
    }
}

fn flatten(finished: Result<io::Result<()>, tokio::task::JoinError>) -> io::Result<()> {
    finished.map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
