//! Process and store probes for the manager.
//!
//! `/livez` and `/healthz` only prove the HTTP listener is up. `/readyz`
//! also pings the world store, since no reconciliation job can make
//! progress without it.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthReport {
    /// "ok", or "degraded" when the store check failed.
    pub status: String,
    pub instance: String,
    pub version: String,
    pub checked_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreCheck>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct StoreCheck {
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthReport {
    fn new(instance: &str, store: Option<StoreCheck>) -> Self {
        let degraded = store.as_ref().is_some_and(|check| !check.reachable);
        Self {
            status: if degraded { "degraded" } else { "ok" }.to_string(),
            instance: instance.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            checked_at: Utc::now(),
            store,
        }
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
}

async fn healthz(State(state): State<AppState>) -> Json<HealthReport> {
    Json(HealthReport::new(state.instance_name(), None))
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let check = match state.store().health_check().await {
        Ok(()) => StoreCheck {
            reachable: true,
            error: None,
        },
        Err(e) => StoreCheck {
            reachable: false,
            error: Some(e.to_string()),
        },
    };
    let code = if check.reachable {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (code, Json(HealthReport::new(state.instance_name(), Some(check))))
}

async fn livez() -> StatusCode {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_livez_returns_ok() {
        assert_eq!(livez().await, StatusCode::OK);
    }

    #[test]
    fn test_failed_store_check_degrades_report() {
        let report = HealthReport::new(
            "manager-1",
            Some(StoreCheck {
                reachable: false,
                error: Some("connection refused".to_string()),
            }),
        );
        assert_eq!(report.status, "degraded");

        let report = HealthReport::new("manager-1", None);
        assert_eq!(report.status, "ok");
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["instance"], "manager-1");
        assert!(json.get("store").is_none());
    }
}
