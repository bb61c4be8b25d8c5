//! HTTP handlers for the REST API

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use prometheus_client::encoding::text::encode;
use serde::{Deserialize, Serialize};
use tracing::{error, instrument};

use crate::controller::metrics::REGISTRY;
use crate::controller::ControllerState;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Whether this replica currently holds the leader lease
    pub leader: bool,
}

/// Health check endpoint
#[instrument(skip(state))]
pub async fn health(State(state): State<Arc<ControllerState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        leader: state.is_leader.load(Ordering::Relaxed),
    })
}

/// Metrics endpoint in the OpenMetrics text format
pub async fn metrics() -> Result<String, StatusCode> {
    let mut buffer = String::new();
    encode(&mut buffer, &REGISTRY).map_err(|e| {
        error!("Failed to encode metrics: {:?}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::metrics::inc_reconcile_outcome;

    #[tokio::test]
    async fn test_metrics_exposes_reconcile_outcomes() {
        inc_reconcile_outcome("cassandradatacenter", "done");
        let body = metrics().await.unwrap();
        assert!(body.contains("cassandra_reconcile_outcomes_total"));
    }

    #[test]
    fn test_health_response_wire_format() {
        let body = serde_json::to_value(HealthResponse {
            status: "healthy".to_string(),
            version: "0.1.0".to_string(),
            leader: true,
        })
        .unwrap();
        assert_eq!(body["leader"], true);
        assert_eq!(body["status"], "healthy");
    }
}
