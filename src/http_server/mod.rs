//! # HTTP Server
//!
//! Serves the admission API with axum and runs the lease-expiry sweep
//! alongside it. Both stop on Ctrl-C.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Json, Router};
use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub mod routes;

pub use routes::{admission_routes, AdmissionState};

use crate::admission::AdmissionService;

/// Admission API server
pub struct HttpServer {
    addr: SocketAddr,
    state: Arc<AdmissionState>,
    sweep_interval: Option<Duration>,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, service: AdmissionService) -> Self {
        Self {
            addr,
            state: Arc::new(AdmissionState::new(Arc::new(service))),
            sweep_interval: None,
        }
    }

    /// Release expired leases every `interval`.
    pub fn with_sweep_interval(mut self, interval: Option<Duration>) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health))
            .merge(admission_routes(self.state.clone()))
            .layer(TraceLayer::new_for_http())
    }

    /// Bind and serve until Ctrl-C.
    pub async fn start(self) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        info!(addr = %listener.local_addr()?, "labgate listening");

        let (stop_tx, stop_rx) = watch::channel(false);
        let sweeper = self
            .sweep_interval
            .map(|interval| tokio::spawn(sweep_expired(self.state.clone(), interval, stop_rx)));

        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "failed to listen for shutdown signal");
                    std::future::pending::<()>().await;
                }
                info!("Shutdown requested");
            })
            .await;

        let _ = stop_tx.send(true);
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }
        result
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn sweep_expired(state: Arc<AdmissionState>, interval: Duration, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => break,
        }

        let service = state.service().clone();
        match tokio::task::spawn_blocking(move || service.expire_leases(Utc::now())).await {
            Ok(Ok(committed)) if !committed.value.released.is_empty() => {
                info!(released = committed.value.released.len(), "Expired leases released");
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "lease sweep failed"),
            Err(e) => warn!(error = %e, "lease sweep task failed"),
        }
    }
}
