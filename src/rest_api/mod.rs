//! HTTP endpoints for health checks and scraping
//!
//! Serves `/health` and the Prometheus `/metrics` registry.

mod handlers;
mod server;

pub use handlers::HealthResponse;
pub use server::{router, run_server};
