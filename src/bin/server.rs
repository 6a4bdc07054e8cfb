//! toolgate HTTP server binary.
//!
//! Starts an axum HTTP server exposing the tool-invocation runtime: task
//! submission with the 202-Accepted polling protocol, synchronous
//! invocation, capability discovery, and metrics.
//!
//! # Environment Variables
//!
//! - `PORT` — HTTP port (default: 8080)
//! - `RUST_LOG` — Tracing filter (default: "info,toolgate=debug")
//! - `TOOLGATE_*` — Runtime limits, see [`toolgate::RuntimeConfig`]
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin server
//! ```
//!
//! Capabilities are registered by the embedding application through
//! [`toolgate::CapabilityRegistry`]; a bare server starts with an empty
//! registry and rejects unknown tools with 404.

use std::sync::Arc;

use toolgate::server::{app_router, AppState};
use toolgate::{RuntimeConfig, ScopeAuthorizer, ToolRuntime};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,toolgate=debug".into()),
        )
        .init();

    let port = std::env::var("PORT").unwrap_or_else(|_| "8080".to_string());
    let bind_addr = format!("0.0.0.0:{}", port);

    let config = RuntimeConfig::from_env();
    tracing::info!(?config, "runtime configuration loaded");

    let runtime = Arc::new(ToolRuntime::new(config, ScopeAuthorizer::new()));
    let workers = runtime.start_workers();
    let sweeper = runtime.start_sweeper();

    let app = app_router(AppState::new(Arc::clone(&runtime)));

    tracing::info!("toolgate server starting on {}", bind_addr);
    tracing::info!("Endpoints:");
    tracing::info!("  GET    /health        — liveness probe");
    tracing::info!("  GET    /metrics       — metrics exposition");
    tracing::info!("  GET    /capabilities  — capability discovery");
    tracing::info!("  POST   /tasks         — submit a task (202-Accepted)");
    tracing::info!("  GET    /tasks/:id     — poll a task");
    tracing::info!("  DELETE /tasks/:id     — request cancellation");
    tracing::info!("  POST   /invoke        — synchronous invocation");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    runtime.shutdown();
    sweeper.abort();
    let _ = futures::future::join_all(workers).await;
    Ok(())
}
