/**
 * Block Routes
 * Editor operations on a guidebook's ordered block list
 */
use axum::{
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::blocks::{validate_content, BlockType};
use crate::db::{
    self,
    models::{Block, BLOCK_COLUMNS},
};
use crate::error::ApiError;
use crate::ordering;
use crate::routes::SuccessResponse;
use crate::routes::auth::require_user;
use crate::routes::extract::{ApiJson, ApiPath};
use crate::routes::guidebooks::{load_blocks, load_owned};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBlockRequest {
    #[serde(rename = "type")]
    pub block_type: BlockType,
    #[serde(default = "empty_object")]
    pub content: Value,
    pub is_visible: Option<bool>,
    /// Insert at this index instead of appending
    pub position: Option<usize>,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateBlockRequest {
    pub content: Option<Value>,
    pub is_visible: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReorderRequest {
    pub block_id: Uuid,
    pub to_index: usize,
}

#[derive(Debug, Serialize)]
pub struct BlockListResponse {
    pub blocks: Vec<Block>,
}

fn block_not_found() -> ApiError {
    ApiError::NotFound("블록을 찾을 수 없습니다".to_string())
}

fn invalid_content(message: String) -> ApiError {
    ApiError::bad_request("INVALID_BLOCK_CONTENT", message)
}

fn parse_block_type(block: &Block) -> Result<BlockType, ApiError> {
    BlockType::parse(&block.block_type)
        .ok_or_else(|| ApiError::Internal(format!("unknown stored block type {}", block.block_type)))
}

// ============================================================================
// Shared helpers
// ============================================================================

/// Append validated blocks after the current last block. Used by the editor
/// and by the AI commit step.
pub async fn append_blocks(
    tx: &mut Transaction<'_, Postgres>,
    guidebook_id: Uuid,
    drafts: &[(BlockType, Value)],
) -> Result<Vec<Block>, ApiError> {
    let (next_index,): (i32,) = sqlx::query_as(
        "SELECT COALESCE(MAX(order_index) + 1, 0) FROM blocks WHERE guidebook_id = $1",
    )
    .bind(guidebook_id)
    .fetch_one(&mut **tx)
    .await?;

    let mut created = Vec::with_capacity(drafts.len());
    for (offset, (block_type, content)) in drafts.iter().enumerate() {
        let block = sqlx::query_as::<_, Block>(&format!(
            r#"
            INSERT INTO blocks (guidebook_id, block_type, order_index, content, is_visible)
            VALUES ($1, $2, $3, $4, true)
            RETURNING {}
            "#,
            BLOCK_COLUMNS
        ))
        .bind(guidebook_id)
        .bind(block_type.as_str())
        .bind(next_index + offset as i32)
        .bind(content)
        .fetch_one(&mut **tx)
        .await?;
        created.push(block);
    }
    Ok(created)
}

async fn touch_guidebook(pool: &PgPool, guidebook_id: Uuid) {
    if let Err(e) = sqlx::query("UPDATE guidebooks SET updated_at = now() WHERE id = $1")
        .bind(guidebook_id)
        .execute(pool)
        .await
    {
        tracing::warn!(guidebook_id = %guidebook_id, "Failed to bump updated_at: {}", e);
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/guidebooks/{id}/blocks
pub async fn list_blocks(
    headers: HeaderMap,
    ApiPath(guidebook_id): ApiPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let claims = require_user(&headers)?;
    let pool = db::require_pool()?;
    load_owned(&pool, guidebook_id, &claims).await?;

    let blocks = load_blocks(&pool, guidebook_id, false).await?;
    Ok(Json(BlockListResponse { blocks }))
}

/// POST /api/guidebooks/{id}/blocks
pub async fn create_block(
    headers: HeaderMap,
    ApiPath(guidebook_id): ApiPath<Uuid>,
    ApiJson(payload): ApiJson<CreateBlockRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let claims = require_user(&headers)?;
    let content = validate_content(payload.block_type, payload.content).map_err(invalid_content)?;

    let pool = db::require_pool()?;
    load_owned(&pool, guidebook_id, &claims).await?;

    let mut tx = pool.begin().await?;

    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM blocks WHERE guidebook_id = $1")
        .bind(guidebook_id)
        .fetch_one(&mut *tx)
        .await?;

    let index = payload
        .position
        .map(|p| p.min(count as usize) as i32)
        .unwrap_or(count as i32);

    // Make room when inserting in the middle.
    sqlx::query(
        "UPDATE blocks SET order_index = order_index + 1 WHERE guidebook_id = $1 AND order_index >= $2",
    )
    .bind(guidebook_id)
    .bind(index)
    .execute(&mut *tx)
    .await?;

    let block = sqlx::query_as::<_, Block>(&format!(
        r#"
        INSERT INTO blocks (guidebook_id, block_type, order_index, content, is_visible)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING {}
        "#,
        BLOCK_COLUMNS
    ))
    .bind(guidebook_id)
    .bind(payload.block_type.as_str())
    .bind(index)
    .bind(&content)
    .bind(payload.is_visible.unwrap_or(true))
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    touch_guidebook(&pool, guidebook_id).await;

    Ok((StatusCode::CREATED, Json(block)))
}

/// PATCH /api/guidebooks/{id}/blocks/{blockId}
pub async fn update_block(
    headers: HeaderMap,
    ApiPath((guidebook_id, block_id)): ApiPath<(Uuid, Uuid)>,
    ApiJson(payload): ApiJson<UpdateBlockRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let claims = require_user(&headers)?;
    let pool = db::require_pool()?;
    load_owned(&pool, guidebook_id, &claims).await?;

    let existing = sqlx::query_as::<_, Block>(&format!(
        "SELECT {} FROM blocks WHERE id = $1 AND guidebook_id = $2",
        BLOCK_COLUMNS
    ))
    .bind(block_id)
    .bind(guidebook_id)
    .fetch_optional(pool.as_ref())
    .await?
    .ok_or_else(block_not_found)?;

    let content = match payload.content {
        Some(content) => {
            validate_content(parse_block_type(&existing)?, content).map_err(invalid_content)?
        }
        None => existing.content,
    };
    let is_visible = payload.is_visible.unwrap_or(existing.is_visible);

    let block = sqlx::query_as::<_, Block>(&format!(
        r#"
        UPDATE blocks SET content = $1, is_visible = $2, updated_at = now()
        WHERE id = $3
        RETURNING {}
        "#,
        BLOCK_COLUMNS
    ))
    .bind(&content)
    .bind(is_visible)
    .bind(block_id)
    .fetch_one(pool.as_ref())
    .await?;

    touch_guidebook(&pool, guidebook_id).await;
    Ok(Json(block))
}

/// DELETE /api/guidebooks/{id}/blocks/{blockId}
/// Later blocks shift up so positions stay contiguous.
pub async fn delete_block(
    headers: HeaderMap,
    ApiPath((guidebook_id, block_id)): ApiPath<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, ApiError> {
    let claims = require_user(&headers)?;
    let pool = db::require_pool()?;
    load_owned(&pool, guidebook_id, &claims).await?;

    let mut tx = pool.begin().await?;

    let removed: Option<(i32,)> = sqlx::query_as(
        "DELETE FROM blocks WHERE id = $1 AND guidebook_id = $2 RETURNING order_index",
    )
    .bind(block_id)
    .bind(guidebook_id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some((removed_index,)) = removed else {
        return Err(block_not_found());
    };

    sqlx::query(
        "UPDATE blocks SET order_index = order_index - 1 WHERE guidebook_id = $1 AND order_index > $2",
    )
    .bind(guidebook_id)
    .bind(removed_index)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    touch_guidebook(&pool, guidebook_id).await;

    Ok(Json(SuccessResponse::ok()))
}

/// POST /api/guidebooks/{id}/blocks/reorder
/// Only the rows between the old and new position are rewritten.
pub async fn reorder_blocks(
    headers: HeaderMap,
    ApiPath(guidebook_id): ApiPath<Uuid>,
    ApiJson(payload): ApiJson<ReorderRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let claims = require_user(&headers)?;
    let pool = db::require_pool()?;
    load_owned(&pool, guidebook_id, &claims).await?;

    let mut tx = pool.begin().await?;

    let ids: Vec<Uuid> = sqlx::query_scalar(
        "SELECT id FROM blocks WHERE guidebook_id = $1 ORDER BY order_index ASC FOR UPDATE",
    )
    .bind(guidebook_id)
    .fetch_all(&mut *tx)
    .await?;

    let from = ids
        .iter()
        .position(|id| *id == payload.block_id)
        .ok_or_else(block_not_found)?;

    if payload.to_index >= ids.len() {
        return Err(ApiError::Validation(
            "이동할 위치가 올바르지 않습니다".to_string(),
        ));
    }

    let changes = ordering::move_item(&ids, from, payload.to_index);
    for (id, order_index) in &changes {
        sqlx::query("UPDATE blocks SET order_index = $1, updated_at = now() WHERE id = $2")
            .bind(order_index)
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;

    tracing::debug!(
        guidebook_id = %guidebook_id,
        from,
        to = payload.to_index,
        rewritten = changes.len(),
        "Blocks reordered"
    );

    let blocks = load_blocks(&pool, guidebook_id, false).await?;
    Ok(Json(BlockListResponse { blocks }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::test_support::{error_code, host_token, json_request, send};
    use axum::routing::{patch, post};
    use axum::Router;
    use serde_json::json;

    fn router() -> Router {
        Router::new()
            .route("/api/guidebooks/{id}/blocks", post(create_block).get(list_blocks))
            .route(
                "/api/guidebooks/{id}/blocks/{block_id}",
                patch(update_block).delete(delete_block),
            )
            .route("/api/guidebooks/{id}/blocks/reorder", post(reorder_blocks))
    }

    fn blocks_uri() -> String {
        format!("/api/guidebooks/{}/blocks", Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_create_block_requires_auth() {
        let req = json_request("POST", &blocks_uri(), None, json!({ "type": "hero" }));
        let (status, _) = send(router(), req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_create_block_validates_content_before_database() {
        let token = host_token();
        let req = json_request(
            "POST",
            &blocks_uri(),
            Some(&token),
            json!({ "type": "hero", "content": { "subtitle": "no title" } }),
        );
        let (status, body) = send(router(), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_code(&body), "INVALID_BLOCK_CONTENT");
    }

    #[tokio::test]
    async fn test_create_block_unknown_type_is_rejected() {
        let token = host_token();
        let req = json_request(
            "POST",
            &blocks_uri(),
            Some(&token),
            json!({ "type": "video", "content": {} }),
        );
        let (status, body) = send(router(), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_code(&body), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_valid_block_without_database_is_unavailable() {
        let token = host_token();
        let req = json_request(
            "POST",
            &blocks_uri(),
            Some(&token),
            json!({ "type": "rules", "content": { "items": [{ "text": "금연" }] } }),
        );
        let (status, _) = send(router(), req).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_reorder_requires_auth() {
        let uri = format!("/api/guidebooks/{}/blocks/reorder", Uuid::new_v4());
        let req = json_request(
            "POST",
            &uri,
            None,
            json!({ "blockId": Uuid::new_v4(), "toIndex": 0 }),
        );
        let (status, _) = send(router(), req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
