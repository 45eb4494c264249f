//! Service wiring: shared state, the router, and the listener.
//!
//! The two registries live behind a cloneable `Service` value threaded to
//! every handler through axum state, keeping tests isolated from process
//! globals.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::info;

use pinch_state::{ResultStore, WriterRegistry};

use crate::config::ServiceConfig;
use crate::error::{PinchError, Result};
use crate::{io, session, status};

/// Raw query string, parsed leniently; validation happens in [`crate::params`].
pub type RawQuery = HashMap<String, String>;

/// Shared per-process service state.
#[derive(Clone)]
pub struct Service {
    config: Arc<ServiceConfig>,
    writers: Arc<WriterRegistry>,
    results: Arc<ResultStore>,
}

impl Service {
    /// Create a service around a validated configuration.
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config: Arc::new(config),
            writers: Arc::new(WriterRegistry::new()),
            results: Arc::new(ResultStore::new()),
        }
    }

    /// Service configuration.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// The process-wide writer registry.
    pub fn writers(&self) -> &Arc<WriterRegistry> {
        &self.writers
    }

    /// The process-wide result store.
    pub fn results(&self) -> &Arc<ResultStore> {
        &self.results
    }

    /// Build the HTTP surface.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/pinch", get(session::pinch))
            .route("/unpinch", get(session::unpinch))
            .route("/io/{handle}", get(io::io_get).put(io::io_put))
            .route("/status/{handle}", get(status::status))
            .route("/health", get(health))
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    /// Sweep leftover entries out of both fifo directories (crash recovery).
    pub fn sweep(&self) -> Result<usize> {
        let mut removed = 0;
        for dir in [&self.config.input_dir, &self.config.output_dir] {
            removed += pinch_fifo::sweep_dir(dir)
                .map_err(|err| PinchError::Internal(err.to_string()))?;
        }
        Ok(removed)
    }

    /// Bind the listener and serve until `shutdown` resolves.
    pub async fn serve(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.config.listen).await?;
        info!(listen = %self.config.listen, "pinch service listening");

        let router = self.router();
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

#[derive(Serialize)]
struct HealthStatus {
    status: &'static str,
    version: &'static str,
    input_dir: String,
    output_dir: String,
}

async fn health(State(service): State<Service>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        input_dir: service.config().input_dir.display().to_string(),
        output_dir: service.config().output_dir.display().to_string(),
    })
}
