/**
 * Health Routes
 * Liveness, readiness and dependency checks
 */
use axum::{http::StatusCode, response::IntoResponse, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::config;
use crate::db;

lazy_static::lazy_static! {
    static ref SERVER_START: Instant = Instant::now();
}

/// Start the uptime clock
pub fn init_start_time() {
    lazy_static::initialize(&SERVER_START);
}

const HEALTHY: &str = "healthy";
const UNHEALTHY: &str = "unhealthy";
const NOT_CONFIGURED: &str = "not_configured";

/// Single dependency check result
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCheck {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServiceCheck {
    fn status_only(status: &str) -> Self {
        Self {
            status: status.to_string(),
            response_time: None,
            error: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedHealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,
    pub checks: HealthChecks,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthChecks {
    pub database: ServiceCheck,
    /// Whether an LLM key is configured for AI generation
    pub ai: ServiceCheck,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,
    pub database: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SimpleHealthResponse {
    pub status: String,
}

async fn database_check() -> ServiceCheck {
    if db::get_pool().is_none() {
        return ServiceCheck::status_only(NOT_CONFIGURED);
    }
    match db::health_check().await {
        Ok(duration) => ServiceCheck {
            status: HEALTHY.to_string(),
            response_time: Some(duration.as_millis() as u64),
            error: None,
        },
        Err(e) => ServiceCheck {
            status: UNHEALTHY.to_string(),
            response_time: None,
            error: Some(e.to_string()),
        },
    }
}

fn ai_check() -> ServiceCheck {
    if config::get().anthropic_api_key.is_some() {
        ServiceCheck::status_only(HEALTHY)
    } else {
        ServiceCheck::status_only(NOT_CONFIGURED)
    }
}

/// GET /health
pub async fn health_ping() -> impl IntoResponse {
    Json(SimpleHealthResponse {
        status: "ok".to_string(),
    })
}

/// GET /health/detailed
pub async fn health_detailed() -> impl IntoResponse {
    let response = DetailedHealthResponse {
        // The process is up even when dependencies are not
        status: "ok".to_string(),
        timestamp: Utc::now(),
        uptime: Some(SERVER_START.elapsed().as_secs()),
        checks: HealthChecks {
            database: database_check().await,
            ai: ai_check(),
        },
    };

    (StatusCode::OK, Json(response))
}

/// GET /health/database
pub async fn health_database() -> impl IntoResponse {
    (StatusCode::OK, Json(database_check().await))
}

/// GET /health/ready
/// Ready when the database answers, or when none is configured.
pub async fn health_ready() -> impl IntoResponse {
    let database = database_check().await;
    let is_ready = database.status != UNHEALTHY;

    let response = ReadyResponse {
        status: if is_ready { "ready" } else { "not ready" }.to_string(),
        timestamp: Utc::now(),
        uptime: Some(SERVER_START.elapsed().as_secs()),
        reason: (!is_ready).then(|| {
            database
                .error
                .clone()
                .unwrap_or_else(|| "Database is not healthy".to_string())
        }),
        database: database.status,
    };

    let status = if is_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}
