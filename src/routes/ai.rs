/**
 * AI Generation Routes
 * Start, poll, cancel, reset and commit AI-drafted blocks for a guidebook
 */
use std::sync::Arc;

use axum::{
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ai::{self, generation, GenerationInput, LlmBlockGenerator, TransitionError};
use crate::config;
use crate::db::{self, models::Block};
use crate::error::ApiError;
use crate::routes::auth::require_user;
use crate::routes::blocks::append_blocks;
use crate::routes::extract::{ApiJson, ApiPath};
use crate::routes::guidebooks::load_owned;
use crate::routes::subscription;

#[derive(Debug, Deserialize)]
pub struct CommitRequest {
    pub selected: Vec<usize>,
}

#[derive(Debug, Serialize)]
pub struct CommitResponse {
    pub blocks: Vec<Block>,
}

impl From<TransitionError> for ApiError {
    fn from(e: TransitionError) -> Self {
        match e {
            TransitionError::InProgress => ApiError::conflict(
                "GENERATION_IN_PROGRESS",
                "이미 AI 생성이 진행 중입니다",
            ),
            TransitionError::NoBlocks => ApiError::conflict(
                "NO_GENERATED_BLOCKS",
                "추가할 생성 결과가 없습니다",
            ),
            TransitionError::InvalidSelection(message) => ApiError::Validation(message),
        }
    }
}

/// POST /api/guidebooks/{id}/ai/generate
pub async fn start_generation(
    headers: HeaderMap,
    ApiPath(guidebook_id): ApiPath<Uuid>,
    ApiJson(input): ApiJson<GenerationInput>,
) -> Result<impl IntoResponse, ApiError> {
    let claims = require_user(&headers)?;
    input.validate().map_err(ApiError::Validation)?;

    let user_id = claims.user_id()?;
    let pool = db::require_pool()?;
    load_owned(&pool, guidebook_id, &claims).await?;

    let plan = subscription::current_plan(&pool, user_id).await?;
    if !plan
        .limits()
        .allows_another_generation(generation::generations_this_month(user_id))
    {
        return Err(ApiError::PlanLimit(
            "이번 달 AI 생성 횟수를 모두 사용했습니다".to_string(),
        ));
    }

    let generator = Arc::new(LlmBlockGenerator::from_config(config::get()));
    let state = ai::registry().start(guidebook_id, input, generator).await?;
    generation::record_generation(user_id);

    Ok((StatusCode::ACCEPTED, Json(state)))
}

/// GET /api/guidebooks/{id}/ai/generate
pub async fn generation_status(
    headers: HeaderMap,
    ApiPath(guidebook_id): ApiPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let claims = require_user(&headers)?;
    let pool = db::require_pool()?;
    load_owned(&pool, guidebook_id, &claims).await?;

    Ok(Json(ai::registry().snapshot(guidebook_id).await))
}

/// DELETE /api/guidebooks/{id}/ai/generate
pub async fn cancel_generation(
    headers: HeaderMap,
    ApiPath(guidebook_id): ApiPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let claims = require_user(&headers)?;
    let pool = db::require_pool()?;
    load_owned(&pool, guidebook_id, &claims).await?;

    Ok(Json(ai::registry().cancel(guidebook_id).await))
}

/// POST /api/guidebooks/{id}/ai/reset
pub async fn reset_generation(
    headers: HeaderMap,
    ApiPath(guidebook_id): ApiPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let claims = require_user(&headers)?;
    let pool = db::require_pool()?;
    load_owned(&pool, guidebook_id, &claims).await?;

    Ok(Json(ai::registry().reset(guidebook_id).await?))
}

/// POST /api/guidebooks/{id}/ai/commit
pub async fn commit_generation(
    headers: HeaderMap,
    ApiPath(guidebook_id): ApiPath<Uuid>,
    ApiJson(payload): ApiJson<CommitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let claims = require_user(&headers)?;
    let pool = db::require_pool()?;
    load_owned(&pool, guidebook_id, &claims).await?;

    let registry = ai::registry();
    let taken = registry
        .take_selected(guidebook_id, &payload.selected)
        .await?;
    let drafts: Vec<_> = taken
        .blocks
        .iter()
        .map(|draft| (draft.block_type, draft.content.clone()))
        .collect();

    let blocks = match insert_drafts(&pool, guidebook_id, &drafts).await {
        Ok(blocks) => blocks,
        Err(e) => {
            registry.restore(guidebook_id, taken).await;
            return Err(e);
        }
    };

    tracing::info!(guidebook_id = %guidebook_id, blocks = blocks.len(), "AI drafts committed");
    Ok((StatusCode::CREATED, Json(CommitResponse { blocks })))
}

async fn insert_drafts(
    pool: &sqlx::PgPool,
    guidebook_id: Uuid,
    drafts: &[(crate::blocks::BlockType, serde_json::Value)],
) -> Result<Vec<Block>, ApiError> {
    let mut tx = pool.begin().await?;
    let blocks = append_blocks(&mut tx, guidebook_id, drafts).await?;
    tx.commit().await?;
    Ok(blocks)
}
