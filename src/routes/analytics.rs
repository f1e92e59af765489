/**
 * Analytics Routes
 * Guest view counting, share tracking and per-guidebook stats
 */
use std::collections::BTreeMap;

use axum::{
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db;
use crate::error::ApiError;
use crate::routes::auth::require_user;
use crate::routes::extract::{ApiJson, ApiPath};
use crate::routes::guidebooks::load_owned;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShareEventType {
    LinkCopy,
    QrDownload,
    NativeShare,
    Kakao,
}

impl ShareEventType {
    pub const ALL: [ShareEventType; 4] = [
        Self::LinkCopy,
        Self::QrDownload,
        Self::NativeShare,
        Self::Kakao,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LinkCopy => "link_copy",
            Self::QrDownload => "qr_download",
            Self::NativeShare => "native_share",
            Self::Kakao => "kakao",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareEventRequest {
    pub event_type: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Accepted {
    pub accepted: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuidebookStats {
    pub total_views: i64,
    pub views_last_7_days: i64,
    pub views_last_30_days: i64,
    pub shares: BTreeMap<&'static str, i64>,
}

fn days_ago(days: i64) -> DateTime<Utc> {
    Utc::now() - Duration::days(days)
}

fn header_value(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.chars().take(500).collect())
}

fn parse_event_type(raw: &str) -> Result<ShareEventType, ApiError> {
    serde_json::from_value(serde_json::Value::String(raw.to_string())).map_err(|_| {
        ApiError::bad_request(
            "INVALID_EVENT_TYPE",
            format!("알 수 없는 공유 유형입니다: {}", raw),
        )
    })
}

/// POST /api/guidebooks/{id}/views
/// Counting is best effort: the guest page never fails because of it.
pub async fn record_view(
    headers: HeaderMap,
    ApiPath(raw_id): ApiPath<String>,
) -> impl IntoResponse {
    let accepted = (StatusCode::ACCEPTED, Json(Accepted { accepted: true }));

    let Ok(guidebook_id) = Uuid::parse_str(&raw_id) else {
        tracing::warn!(id = %raw_id, "Ignoring view for malformed guidebook id");
        return accepted;
    };
    let Some(pool) = db::get_pool() else {
        return accepted;
    };

    let referrer = header_value(&headers, header::REFERER);
    let user_agent = header_value(&headers, header::USER_AGENT);

    let result: Result<(), sqlx::Error> = async {
        let mut tx = pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE guidebooks SET view_count = view_count + 1 WHERE id = $1 AND status = 'published'",
        )
        .bind(guidebook_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() > 0 {
            sqlx::query(
                "INSERT INTO guidebook_views (guidebook_id, referrer, user_agent) VALUES ($1, $2, $3)",
            )
            .bind(guidebook_id)
            .bind(&referrer)
            .bind(&user_agent)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }
    .await;

    if let Err(e) = result {
        tracing::warn!(guidebook_id = %guidebook_id, "Failed to record view: {}", e);
    }

    accepted
}

/// POST /api/guidebooks/{id}/shares
pub async fn record_share(
    ApiPath(guidebook_id): ApiPath<Uuid>,
    ApiJson(payload): ApiJson<ShareEventRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let event_type = parse_event_type(&payload.event_type)?;

    if let Some(pool) = db::get_pool() {
        if let Err(e) = sqlx::query(
            r#"
            INSERT INTO share_events (guidebook_id, event_type)
            SELECT id, $2 FROM guidebooks WHERE id = $1
            "#,
        )
        .bind(guidebook_id)
        .bind(event_type.as_str())
        .execute(pool.as_ref())
        .await
        {
            tracing::warn!(guidebook_id = %guidebook_id, event_type = event_type.as_str(), "Failed to record share: {}", e);
        }
    }

    Ok((StatusCode::ACCEPTED, Json(Accepted { accepted: true })))
}

/// GET /api/guidebooks/{id}/stats
pub async fn guidebook_stats(
    headers: HeaderMap,
    ApiPath(guidebook_id): ApiPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let claims = require_user(&headers)?;
    let pool = db::require_pool()?;
    let guidebook = load_owned(&pool, guidebook_id, &claims).await?;

    let (last_7, last_30): (i64, i64) = sqlx::query_as(
        r#"
        SELECT
            COUNT(*) FILTER (WHERE created_at >= $2),
            COUNT(*) FILTER (WHERE created_at >= $3)
        FROM guidebook_views
        WHERE guidebook_id = $1
        "#,
    )
    .bind(guidebook_id)
    .bind(days_ago(7))
    .bind(days_ago(30))
    .fetch_one(pool.as_ref())
    .await?;

    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT event_type, COUNT(*) FROM share_events WHERE guidebook_id = $1 GROUP BY event_type",
    )
    .bind(guidebook_id)
    .fetch_all(pool.as_ref())
    .await?;

    let mut shares: BTreeMap<&'static str, i64> =
        ShareEventType::ALL.iter().map(|t| (t.as_str(), 0)).collect();
    for (event_type, count) in rows {
        if let Some(known) = ShareEventType::ALL.iter().find(|t| t.as_str() == event_type) {
            shares.insert(known.as_str(), count);
        }
    }

    Ok(Json(GuidebookStats {
        total_views: guidebook.view_count,
        views_last_7_days: last_7,
        views_last_30_days: last_30,
        shares,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::test_support::{empty_request, error_code, json_request, send};
    use axum::routing::post;
    use axum::Router;
    use serde_json::json;

    fn router() -> Router {
        Router::new()
            .route("/api/guidebooks/{id}/views", post(record_view))
            .route("/api/guidebooks/{id}/shares", post(record_share))
    }

    #[test]
    fn test_event_type_names() {
        for event in ShareEventType::ALL {
            assert_eq!(parse_event_type(event.as_str()).unwrap(), event);
        }
        assert!(parse_event_type("twitter").is_err());
    }

    #[test]
    fn test_days_ago_is_in_the_past() {
        assert!(days_ago(7) < Utc::now());
        assert!(days_ago(30) < days_ago(7));
    }

    #[tokio::test]
    async fn test_view_is_accepted_without_database() {
        let uri = format!("/api/guidebooks/{}/views", Uuid::new_v4());
        let (status, body) = send(router(), empty_request("POST", &uri, None)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["accepted"], true);
    }

    #[tokio::test]
    async fn test_view_with_malformed_id_is_still_accepted() {
        let req = empty_request("POST", "/api/guidebooks/not-a-uuid/views", None);
        let (status, body) = send(router(), req).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["accepted"], true);
    }

    #[tokio::test]
    async fn test_malformed_share_body_uses_error_envelope() {
        let uri = format!("/api/guidebooks/{}/shares", Uuid::new_v4());
        let req = json_request("POST", &uri, None, json!({ "wrong": 1 }));
        let (status, body) = send(router(), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_code(&body), "VALIDATION_ERROR");
        assert!(body["error"]["message"].is_string());
    }

    #[tokio::test]
    async fn test_malformed_share_id_uses_error_envelope() {
        let req = json_request(
            "POST",
            "/api/guidebooks/not-a-uuid/shares",
            None,
            json!({ "eventType": "kakao" }),
        );
        let (status, body) = send(router(), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_code(&body), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_share_accepted_without_database() {
        let uri = format!("/api/guidebooks/{}/shares", Uuid::new_v4());
        let req = json_request("POST", &uri, None, json!({ "eventType": "kakao" }));
        let (status, _) = send(router(), req).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_unknown_share_type_is_rejected() {
        let uri = format!("/api/guidebooks/{}/shares", Uuid::new_v4());
        let req = json_request("POST", &uri, None, json!({ "eventType": "fax" }));
        let (status, body) = send(router(), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_code(&body), "INVALID_EVENT_TYPE");
    }
}
