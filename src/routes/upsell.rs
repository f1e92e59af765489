/**
 * Upsell Routes
 * Paid extras offered to guests and the requests guests place for them
 */
use axum::{
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::{
    self,
    models::{UpsellItem, UpsellRequest, UPSELL_ITEM_COLUMNS, UPSELL_REQUEST_COLUMNS},
};
use crate::error::ApiError;
use crate::ordering::{self, Direction};
use crate::routes::auth::require_user;
use crate::routes::extract::{ApiJson, ApiPath, ApiQuery};
use crate::routes::guidebooks::{load_owned, not_found};
use crate::routes::{subscription, SuccessResponse};
use crate::slug;

const MAX_QUANTITY: i32 = 99;

// ============================================================================
// Request status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "confirmed" => Some(Self::Confirmed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Hosts confirm or cancel pending requests, and may still cancel a
    /// confirmed one. Cancelled is final.
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Confirmed)
                | (Self::Pending, Self::Cancelled)
                | (Self::Confirmed, Self::Cancelled)
        )
    }
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemPayload {
    pub name: String,
    pub description: Option<String>,
    pub price: i64,
    pub currency: Option<String>,
    pub image_url: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct MoveRequest {
    pub direction: Direction,
}

#[derive(Debug, Serialize)]
pub struct ItemListResponse {
    pub items: Vec<UpsellItem>,
}

#[derive(Debug, Deserialize)]
pub struct RequestFilter {
    pub status: Option<RequestStatus>,
}

#[derive(Debug, Default, Serialize, Deserialize, sqlx::FromRow)]
pub struct RequestStats {
    pub total: i64,
    pub pending: i64,
    pub confirmed: i64,
    pub cancelled: i64,
    /// Sum of price * quantity over confirmed requests
    pub revenue: i64,
}

#[derive(Debug, Serialize)]
pub struct RequestListResponse {
    pub items: Vec<UpsellRequest>,
    pub stats: RequestStats,
}

#[derive(Debug, Deserialize)]
pub struct StatusUpdate {
    pub status: RequestStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestRequestPayload {
    pub item_id: Uuid,
    pub guest_name: String,
    pub guest_contact: String,
    pub message: Option<String>,
    pub quantity: Option<i32>,
}

// ============================================================================
// Validation
// ============================================================================

fn validate_item(payload: &ItemPayload) -> Result<(), ApiError> {
    if payload.name.trim().is_empty() {
        return Err(ApiError::Validation("상품 이름을 입력해주세요".to_string()));
    }
    if payload.price < 0 {
        return Err(ApiError::Validation(
            "가격은 0 이상이어야 합니다".to_string(),
        ));
    }
    Ok(())
}

fn validate_guest_request(payload: &GuestRequestPayload) -> Result<i32, ApiError> {
    if payload.guest_name.trim().is_empty() {
        return Err(ApiError::Validation("이름을 입력해주세요".to_string()));
    }
    if payload.guest_contact.trim().is_empty() {
        return Err(ApiError::Validation("연락처를 입력해주세요".to_string()));
    }
    let quantity = payload.quantity.unwrap_or(1);
    if !(1..=MAX_QUANTITY).contains(&quantity) {
        return Err(ApiError::Validation(format!(
            "수량은 1에서 {}개 사이여야 합니다",
            MAX_QUANTITY
        )));
    }
    Ok(quantity)
}

fn item_not_found() -> ApiError {
    ApiError::NotFound("상품을 찾을 수 없습니다".to_string())
}

async fn load_items(pool: &PgPool, guidebook_id: Uuid, active_only: bool) -> Result<Vec<UpsellItem>, sqlx::Error> {
    let filter = if active_only { "AND is_active = true" } else { "" };
    sqlx::query_as::<_, UpsellItem>(&format!(
        "SELECT {} FROM upsell_items WHERE guidebook_id = $1 {} ORDER BY sort_order ASC, created_at ASC",
        UPSELL_ITEM_COLUMNS, filter
    ))
    .bind(guidebook_id)
    .fetch_all(pool)
    .await
}

// ============================================================================
// Host handlers: items
// ============================================================================

/// GET /api/guidebooks/{id}/upsell/items
pub async fn list_items(
    headers: HeaderMap,
    ApiPath(guidebook_id): ApiPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let claims = require_user(&headers)?;
    let pool = db::require_pool()?;
    load_owned(&pool, guidebook_id, &claims).await?;

    let items = load_items(&pool, guidebook_id, false).await?;
    Ok(Json(ItemListResponse { items }))
}

/// POST /api/guidebooks/{id}/upsell/items
pub async fn create_item(
    headers: HeaderMap,
    ApiPath(guidebook_id): ApiPath<Uuid>,
    ApiJson(payload): ApiJson<ItemPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let claims = require_user(&headers)?;
    validate_item(&payload)?;

    let pool = db::require_pool()?;
    load_owned(&pool, guidebook_id, &claims).await?;

    let plan = subscription::current_plan(&pool, claims.user_id()?).await?;
    if !plan.limits().upsell_enabled {
        return Err(ApiError::PlanLimit(
            "부가 상품 판매는 Pro 이상 플랜에서 사용할 수 있습니다".to_string(),
        ));
    }

    let item = sqlx::query_as::<_, UpsellItem>(&format!(
        r#"
        INSERT INTO upsell_items (guidebook_id, name, description, price, currency, image_url,
            is_active, sort_order)
        VALUES ($1, $2, $3, $4, COALESCE($5, 'KRW'), $6, $7,
            (SELECT COALESCE(MAX(sort_order) + 1, 0) FROM upsell_items WHERE guidebook_id = $1))
        RETURNING {}
        "#,
        UPSELL_ITEM_COLUMNS
    ))
    .bind(guidebook_id)
    .bind(payload.name.trim())
    .bind(&payload.description)
    .bind(payload.price)
    .bind(&payload.currency)
    .bind(&payload.image_url)
    .bind(payload.is_active.unwrap_or(true))
    .fetch_one(pool.as_ref())
    .await?;

    Ok((StatusCode::CREATED, Json(item)))
}

/// PUT /api/guidebooks/{id}/upsell/items/{itemId}
pub async fn update_item(
    headers: HeaderMap,
    ApiPath((guidebook_id, item_id)): ApiPath<(Uuid, Uuid)>,
    ApiJson(payload): ApiJson<ItemPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let claims = require_user(&headers)?;
    validate_item(&payload)?;

    let pool = db::require_pool()?;
    load_owned(&pool, guidebook_id, &claims).await?;

    let item = sqlx::query_as::<_, UpsellItem>(&format!(
        r#"
        UPDATE upsell_items
        SET name = $1, description = $2, price = $3, currency = COALESCE($4, currency),
            image_url = $5, is_active = COALESCE($6, is_active), updated_at = now()
        WHERE id = $7 AND guidebook_id = $8
        RETURNING {}
        "#,
        UPSELL_ITEM_COLUMNS
    ))
    .bind(payload.name.trim())
    .bind(&payload.description)
    .bind(payload.price)
    .bind(&payload.currency)
    .bind(&payload.image_url)
    .bind(payload.is_active)
    .bind(item_id)
    .bind(guidebook_id)
    .fetch_optional(pool.as_ref())
    .await?
    .ok_or_else(item_not_found)?;

    Ok(Json(item))
}

/// DELETE /api/guidebooks/{id}/upsell/items/{itemId}
pub async fn delete_item(
    headers: HeaderMap,
    ApiPath((guidebook_id, item_id)): ApiPath<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, ApiError> {
    let claims = require_user(&headers)?;
    let pool = db::require_pool()?;
    load_owned(&pool, guidebook_id, &claims).await?;

    let mut tx = pool.begin().await?;

    let deleted = sqlx::query("DELETE FROM upsell_items WHERE id = $1 AND guidebook_id = $2")
        .bind(item_id)
        .bind(guidebook_id)
        .execute(&mut *tx)
        .await?;
    if deleted.rows_affected() == 0 {
        return Err(item_not_found());
    }

    let ids: Vec<Uuid> = sqlx::query_scalar(
        "SELECT id FROM upsell_items WHERE guidebook_id = $1 ORDER BY sort_order ASC, created_at ASC",
    )
    .bind(guidebook_id)
    .fetch_all(&mut *tx)
    .await?;

    for (id, sort_order) in ordering::resequence(&ids) {
        sqlx::query("UPDATE upsell_items SET sort_order = $1 WHERE id = $2")
            .bind(sort_order)
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(Json(SuccessResponse::ok()))
}

/// POST /api/guidebooks/{id}/upsell/items/{itemId}/move
/// Moving past either end leaves the order unchanged.
pub async fn move_item(
    headers: HeaderMap,
    ApiPath((guidebook_id, item_id)): ApiPath<(Uuid, Uuid)>,
    ApiJson(payload): ApiJson<MoveRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let claims = require_user(&headers)?;
    let pool = db::require_pool()?;
    load_owned(&pool, guidebook_id, &claims).await?;

    let mut tx = pool.begin().await?;

    let ids: Vec<Uuid> = sqlx::query_scalar(
        r#"
        SELECT id FROM upsell_items WHERE guidebook_id = $1
        ORDER BY sort_order ASC, created_at ASC
        FOR UPDATE
        "#,
    )
    .bind(guidebook_id)
    .fetch_all(&mut *tx)
    .await?;

    let index = ids
        .iter()
        .position(|id| *id == item_id)
        .ok_or_else(item_not_found)?;

    for (id, sort_order) in ordering::move_adjacent(&ids, index, payload.direction) {
        sqlx::query("UPDATE upsell_items SET sort_order = $1, updated_at = now() WHERE id = $2")
            .bind(sort_order)
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;

    let items = load_items(&pool, guidebook_id, false).await?;
    Ok(Json(ItemListResponse { items }))
}

// ============================================================================
// Host handlers: requests
// ============================================================================

/// GET /api/guidebooks/{id}/upsell/requests?status=
pub async fn list_requests(
    headers: HeaderMap,
    ApiPath(guidebook_id): ApiPath<Uuid>,
    ApiQuery(filter): ApiQuery<RequestFilter>,
) -> Result<impl IntoResponse, ApiError> {
    let claims = require_user(&headers)?;
    let pool = db::require_pool()?;
    load_owned(&pool, guidebook_id, &claims).await?;

    let items = sqlx::query_as::<_, UpsellRequest>(&format!(
        r#"
        SELECT {} FROM upsell_requests
        WHERE guidebook_id = $1 AND ($2::text IS NULL OR status = $2)
        ORDER BY created_at DESC
        "#,
        UPSELL_REQUEST_COLUMNS
    ))
    .bind(guidebook_id)
    .bind(filter.status.map(|s| s.as_str()))
    .fetch_all(pool.as_ref())
    .await?;

    let stats = sqlx::query_as::<_, RequestStats>(
        r#"
        SELECT
            COUNT(*) AS total,
            COUNT(*) FILTER (WHERE r.status = 'pending') AS pending,
            COUNT(*) FILTER (WHERE r.status = 'confirmed') AS confirmed,
            COUNT(*) FILTER (WHERE r.status = 'cancelled') AS cancelled,
            COALESCE(SUM(i.price * r.quantity) FILTER (WHERE r.status = 'confirmed'), 0)::BIGINT
                AS revenue
        FROM upsell_requests r
        JOIN upsell_items i ON i.id = r.item_id
        WHERE r.guidebook_id = $1
        "#,
    )
    .bind(guidebook_id)
    .fetch_one(pool.as_ref())
    .await?;

    Ok(Json(RequestListResponse { items, stats }))
}

/// PATCH /api/guidebooks/{id}/upsell/requests/{requestId}
pub async fn update_request_status(
    headers: HeaderMap,
    ApiPath((guidebook_id, request_id)): ApiPath<(Uuid, Uuid)>,
    ApiJson(payload): ApiJson<StatusUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    let claims = require_user(&headers)?;
    let pool = db::require_pool()?;
    load_owned(&pool, guidebook_id, &claims).await?;

    let mut tx = pool.begin().await?;

    let current: Option<(String,)> = sqlx::query_as(
        "SELECT status FROM upsell_requests WHERE id = $1 AND guidebook_id = $2 FOR UPDATE",
    )
    .bind(request_id)
    .bind(guidebook_id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some((current,)) = current else {
        return Err(ApiError::NotFound("요청을 찾을 수 없습니다".to_string()));
    };
    let current = RequestStatus::parse(&current)
        .ok_or_else(|| ApiError::Internal(format!("unknown request status {}", current)))?;

    if !current.can_transition_to(payload.status) {
        return Err(ApiError::bad_request(
            "INVALID_STATUS_TRANSITION",
            format!(
                "{} 상태에서 {} 상태로 변경할 수 없습니다",
                current.as_str(),
                payload.status.as_str()
            ),
        ));
    }

    let request = sqlx::query_as::<_, UpsellRequest>(&format!(
        "UPDATE upsell_requests SET status = $1, updated_at = now() WHERE id = $2 RETURNING {}",
        UPSELL_REQUEST_COLUMNS
    ))
    .bind(payload.status.as_str())
    .bind(request_id)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    tracing::info!(request_id = %request_id, status = payload.status.as_str(), "Upsell request updated");
    Ok(Json(request))
}

// ============================================================================
// Guest handlers
// ============================================================================

/// GET /api/public/guidebooks/{slug}/upsell
pub async fn public_items(ApiPath(slug): ApiPath<String>) -> Result<impl IntoResponse, ApiError> {
    if !slug::is_valid_slug(&slug) {
        return Err(not_found());
    }
    let pool = db::require_pool()?;

    let guidebook_id: Uuid =
        sqlx::query_scalar("SELECT id FROM guidebooks WHERE slug = $1 AND status = 'published'")
            .bind(&slug)
            .fetch_optional(pool.as_ref())
            .await?
            .ok_or_else(not_found)?;

    let items = load_items(&pool, guidebook_id, true).await?;
    Ok(Json(ItemListResponse { items }))
}

/// POST /api/upsell/requests
pub async fn create_request(
    ApiJson(payload): ApiJson<GuestRequestPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let quantity = validate_guest_request(&payload)?;
    let pool = db::require_pool()?;

    let guidebook_id: Uuid = sqlx::query_scalar(
        r#"
        SELECT i.guidebook_id
        FROM upsell_items i
        JOIN guidebooks g ON g.id = i.guidebook_id
        WHERE i.id = $1 AND i.is_active = true AND g.status = 'published'
        "#,
    )
    .bind(payload.item_id)
    .fetch_optional(pool.as_ref())
    .await?
    .ok_or_else(item_not_found)?;

    let request = sqlx::query_as::<_, UpsellRequest>(&format!(
        r#"
        INSERT INTO upsell_requests (item_id, guidebook_id, guest_name, guest_contact, message, quantity)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING {}
        "#,
        UPSELL_REQUEST_COLUMNS
    ))
    .bind(payload.item_id)
    .bind(guidebook_id)
    .bind(payload.guest_name.trim())
    .bind(payload.guest_contact.trim())
    .bind(&payload.message)
    .bind(quantity)
    .fetch_one(pool.as_ref())
    .await?;

    tracing::info!(request_id = %request.id, guidebook_id = %guidebook_id, "Upsell request received");
    Ok((StatusCode::CREATED, Json(request)))
}
