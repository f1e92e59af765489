/**
 * Guidebook Routes
 * Host CRUD for guidebooks plus the public guest view by slug
 */
use axum::{
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::ai;
use crate::config;
use crate::db::{
    self,
    models::{Block, Guidebook, BLOCK_COLUMNS, GUIDEBOOK_COLUMNS},
};
use crate::error::{is_unique_violation, ApiError};
use crate::routes::auth::{require_user, Claims};
use crate::routes::extract::{ApiJson, ApiPath, ApiQuery};
use crate::routes::{subscription, SuccessResponse};
use crate::slug;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuidebookStatus {
    Draft,
    Published,
    Archived,
}

impl GuidebookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Published => "published",
            Self::Archived => "archived",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuidebookSummary {
    #[serde(flatten)]
    pub guidebook: Guidebook,
    pub block_count: i64,
}

#[derive(Debug, Serialize)]
pub struct GuidebookListResponse {
    pub items: Vec<GuidebookSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GuidebookWithBlocks {
    #[serde(flatten)]
    pub guidebook: Guidebook,
    pub blocks: Vec<Block>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGuidebookRequest {
    pub title: String,
    pub slug: Option<String>,
    pub description: Option<String>,
    pub theme: Option<String>,
    pub primary_color: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateGuidebookRequest {
    pub title: Option<String>,
    pub slug: Option<String>,
    pub description: Option<String>,
    pub theme: Option<String>,
    pub status: Option<GuidebookStatus>,
    pub primary_color: Option<String>,
    pub hero_image_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SlugQuery {
    pub slug: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SlugAvailability {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareResponse {
    pub url: String,
    pub slug: String,
    pub is_published: bool,
}

// ============================================================================
// Validation
// ============================================================================

fn validate_title(title: &str) -> Result<(), ApiError> {
    let len = title.trim().chars().count();
    if len == 0 {
        return Err(ApiError::Validation("제목을 입력해주세요".to_string()));
    }
    if len > 100 {
        return Err(ApiError::Validation(
            "제목은 100자 이내로 입력해주세요".to_string(),
        ));
    }
    Ok(())
}

fn validate_color(color: &Option<String>) -> Result<(), ApiError> {
    let valid = match color.as_deref() {
        None => true,
        Some(c) => {
            c.len() == 7 && c.starts_with('#') && c[1..].chars().all(|ch| ch.is_ascii_hexdigit())
        }
    };
    if valid {
        Ok(())
    } else {
        Err(ApiError::Validation(
            "색상은 #RRGGBB 형식이어야 합니다".to_string(),
        ))
    }
}

fn checked_slug(slug: &str) -> Result<(), ApiError> {
    slug::validate_slug(slug).map_err(|message| ApiError::bad_request("INVALID_SLUG", message))
}

fn slug_taken() -> ApiError {
    ApiError::conflict("SLUG_TAKEN", "이미 사용 중인 슬러그입니다")
}

pub fn not_found() -> ApiError {
    ApiError::NotFound("가이드북을 찾을 수 없습니다".to_string())
}

// ============================================================================
// Shared queries
// ============================================================================

/// Load a guidebook the caller may manage. Other hosts' guidebooks are
/// reported as missing.
pub async fn load_owned(pool: &PgPool, id: Uuid, claims: &Claims) -> Result<Guidebook, ApiError> {
    let guidebook = sqlx::query_as::<_, Guidebook>(&format!(
        "SELECT {} FROM guidebooks WHERE id = $1",
        GUIDEBOOK_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(not_found)?;

    if !can_manage(guidebook.owner_id, claims)? {
        return Err(not_found());
    }
    Ok(guidebook)
}

/// Owners manage their own guidebooks; admins may manage any.
pub fn can_manage(owner_id: Uuid, claims: &Claims) -> Result<bool, ApiError> {
    Ok(claims.is_admin() || owner_id == claims.user_id()?)
}

pub async fn load_blocks(
    pool: &PgPool,
    guidebook_id: Uuid,
    visible_only: bool,
) -> Result<Vec<Block>, sqlx::Error> {
    let filter = if visible_only { "AND is_visible = true" } else { "" };
    sqlx::query_as::<_, Block>(&format!(
        "SELECT {} FROM blocks WHERE guidebook_id = $1 {} ORDER BY order_index ASC",
        BLOCK_COLUMNS, filter
    ))
    .bind(guidebook_id)
    .fetch_all(pool)
    .await
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/guidebooks - List the caller's guidebooks
pub async fn list_guidebooks(headers: HeaderMap) -> Result<impl IntoResponse, ApiError> {
    let claims = require_user(&headers)?;
    let pool = db::require_pool()?;

    #[derive(sqlx::FromRow)]
    struct Row {
        #[sqlx(flatten)]
        guidebook: Guidebook,
        block_count: i64,
    }

    let rows = sqlx::query_as::<_, Row>(&format!(
        r#"
        SELECT {},
               (SELECT COUNT(*) FROM blocks b WHERE b.guidebook_id = guidebooks.id) AS block_count
        FROM guidebooks
        WHERE owner_id = $1
        ORDER BY created_at DESC
        "#,
        GUIDEBOOK_COLUMNS
    ))
    .bind(claims.user_id()?)
    .fetch_all(pool.as_ref())
    .await?;

    let items = rows
        .into_iter()
        .map(|row| GuidebookSummary {
            guidebook: row.guidebook,
            block_count: row.block_count,
        })
        .collect();

    Ok(Json(GuidebookListResponse { items }))
}

/// POST /api/guidebooks - Create a guidebook
pub async fn create_guidebook(
    headers: HeaderMap,
    ApiJson(payload): ApiJson<CreateGuidebookRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let claims = require_user(&headers)?;

    validate_title(&payload.title)?;
    validate_color(&payload.primary_color)?;

    let slug = match payload.slug.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => {
            checked_slug(s)?;
            s.to_string()
        }
        _ => slug::slug_from_title(&payload.title),
    };

    let pool = db::require_pool()?;
    let user_id = claims.user_id()?;

    let plan = subscription::current_plan(&pool, user_id).await?;

    // Creates for one user are serialized on the user row so the count and
    // the insert see the same total.
    let mut tx = pool.begin().await?;
    sqlx::query("SELECT id FROM users WHERE id = $1 FOR UPDATE")
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(ApiError::Unauthorized)?;

    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM guidebooks WHERE owner_id = $1")
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;

    if !plan.limits().allows_another_guidebook(count) {
        return Err(ApiError::PlanLimit(format!(
            "{} 플랜에서는 가이드북을 더 만들 수 없습니다. 플랜을 업그레이드해주세요",
            plan.as_str()
        )));
    }

    let guidebook = sqlx::query_as::<_, Guidebook>(&format!(
        r#"
        INSERT INTO guidebooks (owner_id, title, slug, description, theme, primary_color)
        VALUES ($1, $2, $3, $4, COALESCE($5, 'default'), $6)
        RETURNING {}
        "#,
        GUIDEBOOK_COLUMNS
    ))
    .bind(user_id)
    .bind(payload.title.trim())
    .bind(&slug)
    .bind(&payload.description)
    .bind(&payload.theme)
    .bind(&payload.primary_color)
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            slug_taken()
        } else {
            ApiError::Database(e)
        }
    })?;
    tx.commit().await?;

    tracing::info!(guidebook_id = %guidebook.id, slug = %guidebook.slug, "Guidebook created");

    Ok((StatusCode::CREATED, Json(guidebook)))
}

/// GET /api/guidebooks/slug-availability?slug=
pub async fn check_slug(
    headers: HeaderMap,
    ApiQuery(query): ApiQuery<SlugQuery>,
) -> Result<impl IntoResponse, ApiError> {
    require_user(&headers)?;

    if let Err(message) = slug::validate_slug(&query.slug) {
        return Ok(Json(SlugAvailability {
            available: false,
            error: Some(message),
        }));
    }

    let pool = db::require_pool()?;
    let (exists,): (bool,) =
        sqlx::query_as("SELECT EXISTS (SELECT 1 FROM guidebooks WHERE slug = $1)")
            .bind(&query.slug)
            .fetch_one(pool.as_ref())
            .await?;

    Ok(Json(SlugAvailability {
        available: !exists,
        error: exists.then(|| "이미 사용 중인 슬러그입니다".to_string()),
    }))
}

/// GET /api/guidebooks/{id} - Guidebook with all blocks (editor data)
pub async fn get_guidebook(
    headers: HeaderMap,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let claims = require_user(&headers)?;
    let pool = db::require_pool()?;

    let guidebook = load_owned(&pool, id, &claims).await?;
    let blocks = load_blocks(&pool, id, false).await?;

    Ok(Json(GuidebookWithBlocks { guidebook, blocks }))
}

/// PATCH /api/guidebooks/{id}
pub async fn update_guidebook(
    headers: HeaderMap,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(payload): ApiJson<UpdateGuidebookRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let claims = require_user(&headers)?;

    if let Some(title) = &payload.title {
        validate_title(title)?;
    }
    if let Some(slug) = &payload.slug {
        checked_slug(slug)?;
    }
    validate_color(&payload.primary_color)?;

    let pool = db::require_pool()?;
    let existing = load_owned(&pool, id, &claims).await?;

    let title = payload
        .title
        .map(|t| t.trim().to_string())
        .unwrap_or(existing.title);
    let slug = payload.slug.unwrap_or(existing.slug);
    let description = payload.description.or(existing.description);
    let theme = payload.theme.unwrap_or(existing.theme);
    let status = payload
        .status
        .map(|s| s.as_str().to_string())
        .unwrap_or(existing.status);
    let primary_color = payload.primary_color.or(existing.primary_color);
    let hero_image_url = payload.hero_image_url.or(existing.hero_image_url);

    let guidebook = sqlx::query_as::<_, Guidebook>(&format!(
        r#"
        UPDATE guidebooks
        SET title = $1, slug = $2, description = $3, theme = $4, status = $5,
            primary_color = $6, hero_image_url = $7, updated_at = now()
        WHERE id = $8
        RETURNING {}
        "#,
        GUIDEBOOK_COLUMNS
    ))
    .bind(&title)
    .bind(&slug)
    .bind(&description)
    .bind(&theme)
    .bind(&status)
    .bind(&primary_color)
    .bind(&hero_image_url)
    .bind(id)
    .fetch_one(pool.as_ref())
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            slug_taken()
        } else {
            ApiError::Database(e)
        }
    })?;

    Ok(Json(guidebook))
}

/// DELETE /api/guidebooks/{id} - Blocks and upsell data cascade
pub async fn delete_guidebook(
    headers: HeaderMap,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let claims = require_user(&headers)?;
    let pool = db::require_pool()?;
    load_owned(&pool, id, &claims).await?;

    sqlx::query("DELETE FROM guidebooks WHERE id = $1")
        .bind(id)
        .execute(pool.as_ref())
        .await?;
    ai::registry().discard(id).await;

    tracing::info!(guidebook_id = %id, "Guidebook deleted");
    Ok(Json(SuccessResponse::ok()))
}

/// GET /api/guidebooks/{id}/share - Public link for sharing / QR codes
pub async fn share_link(
    headers: HeaderMap,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let claims = require_user(&headers)?;
    let pool = db::require_pool()?;
    let guidebook = load_owned(&pool, id, &claims).await?;

    Ok(Json(ShareResponse {
        url: config::get().share_url(&guidebook.slug),
        is_published: guidebook.status == GuidebookStatus::Published.as_str(),
        slug: guidebook.slug,
    }))
}

/// GET /api/public/guidebooks/{slug} - Guest view, published only
pub async fn get_public_guidebook(
    ApiPath(slug): ApiPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !slug::is_valid_slug(&slug) {
        return Err(not_found());
    }

    let pool = db::require_pool()?;

    let guidebook = sqlx::query_as::<_, Guidebook>(&format!(
        "SELECT {} FROM guidebooks WHERE slug = $1 AND status = 'published'",
        GUIDEBOOK_COLUMNS
    ))
    .bind(&slug)
    .fetch_optional(pool.as_ref())
    .await?
    .ok_or_else(not_found)?;

    let blocks = load_blocks(&pool, guidebook.id, true).await?;

    Ok(Json(GuidebookWithBlocks { guidebook, blocks }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::auth::verify_access_token;
    use crate::routes::test_support::{
        admin_token, empty_request, error_code, host_token, json_request, send,
    };
    use axum::routing::get;
    use axum::Router;
    use serde_json::json;

    fn router() -> Router {
        Router::new()
            .route("/api/guidebooks", get(list_guidebooks).post(create_guidebook))
            .route("/api/guidebooks/slug-availability", get(check_slug))
            .route(
                "/api/guidebooks/{id}",
                get(get_guidebook)
                    .patch(update_guidebook)
                    .delete(delete_guidebook),
            )
            .route("/api/public/guidebooks/{slug}", get(get_public_guidebook))
    }

    #[test]
    fn test_admin_may_manage_any_guidebook() {
        let admin = verify_access_token(&admin_token()).unwrap();
        let host = verify_access_token(&host_token()).unwrap();
        let other_owner = Uuid::new_v4();

        assert!(can_manage(other_owner, &admin).unwrap());
        assert!(!can_manage(other_owner, &host).unwrap());
        assert!(can_manage(host.user_id().unwrap(), &host).unwrap());
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&GuidebookStatus::Published).unwrap(),
            "\"published\""
        );
        let parsed: GuidebookStatus = serde_json::from_str("\"archived\"").unwrap();
        assert_eq!(parsed, GuidebookStatus::Archived);
    }

    #[test]
    fn test_color_validation() {
        assert!(validate_color(&None).is_ok());
        assert!(validate_color(&Some("#1a2B3c".to_string())).is_ok());
        assert!(validate_color(&Some("red".to_string())).is_err());
        assert!(validate_color(&Some("#12345g".to_string())).is_err());
    }

    #[tokio::test]
    async fn test_list_requires_auth() {
        let (status, body) = send(router(), empty_request("GET", "/api/guidebooks", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(error_code(&body), "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_create_rejects_empty_title() {
        let token = host_token();
        let req = json_request("POST", "/api/guidebooks", Some(&token), json!({ "title": " " }));
        let (status, body) = send(router(), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_code(&body), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_slug() {
        let token = host_token();
        let req = json_request(
            "POST",
            "/api/guidebooks",
            Some(&token),
            json!({ "title": "Jeju House", "slug": "Jeju House" }),
        );
        let (status, body) = send(router(), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_code(&body), "INVALID_SLUG");
        assert!(!body["error"]["message"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_without_database_is_unavailable() {
        let token = host_token();
        let req = json_request(
            "POST",
            "/api/guidebooks",
            Some(&token),
            json!({ "title": "Jeju House", "slug": "jeju-house" }),
        );
        let (status, _) = send(router(), req).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_slug_availability_reports_validation_error() {
        let token = host_token();
        let req = empty_request(
            "GET",
            "/api/guidebooks/slug-availability?slug=ab",
            Some(&token),
        );
        let (status, body) = send(router(), req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["available"], false);
        assert!(!body["error"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_public_invalid_slug_is_not_found() {
        let req = empty_request("GET", "/api/public/guidebooks/NOT_A_SLUG", None);
        let (status, _) = send(router(), req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_update_with_bad_status_is_rejected() {
        let token = host_token();
        let uri = format!("/api/guidebooks/{}", Uuid::new_v4());
        let req = json_request("PATCH", &uri, Some(&token), json!({ "status": "deleted" }));
        let (status, body) = send(router(), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_code(&body), "VALIDATION_ERROR");
    }
}
