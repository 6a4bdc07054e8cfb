//! HTTP boundary exposing the tool-invocation runtime.
//!
//! # Endpoints
//!
//! - `GET  /health`  — Liveness probe
//! - `GET  /metrics` — Metrics exposition
//! - `POST /tasks`   — 202-Accepted task submission; poll and cancel via `/tasks/:id`
//! - `POST /invoke`  — Synchronous invocation

pub mod routes;

pub use routes::{app_router, AppState};
