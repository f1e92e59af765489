/**
 * Review Routes
 * Purchase-verified product reviews
 */
use axum::{
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{
    self,
    models::{Review, REVIEW_COLUMNS},
};
use crate::error::{is_unique_violation, ApiError};
use crate::routes::SuccessResponse;
use crate::routes::auth::{require_user, Claims};
use crate::routes::extract::{ApiJson, ApiPath};

const MAX_CONTENT_CHARS: usize = 2000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateReviewRequest {
    pub product_id: Uuid,
    pub rating: i16,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateReviewRequest {
    pub rating: Option<i16>,
    pub content: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewListResponse {
    pub items: Vec<Review>,
    pub average_rating: Option<f64>,
    pub count: usize,
}

// ============================================================================
// Decisions
// ============================================================================

pub fn validate_rating(rating: i16) -> Result<(), ApiError> {
    if (1..=5).contains(&rating) {
        Ok(())
    } else {
        Err(ApiError::Validation(
            "평점은 1에서 5 사이여야 합니다".to_string(),
        ))
    }
}

pub fn validate_review_content(content: &str) -> Result<(), ApiError> {
    let len = content.trim().chars().count();
    if len == 0 {
        return Err(ApiError::Validation("리뷰 내용을 입력해주세요".to_string()));
    }
    if len > MAX_CONTENT_CHARS {
        return Err(ApiError::Validation(format!(
            "리뷰는 {}자 이내로 작성해주세요",
            MAX_CONTENT_CHARS
        )));
    }
    Ok(())
}

/// Whether a caller may review a product, given the purchase found for them
/// (if any) and whether that purchase already carries a review.
pub fn check_review_creation(
    purchase_id: Option<Uuid>,
    already_reviewed: bool,
) -> Result<Uuid, ApiError> {
    let purchase_id = purchase_id.ok_or_else(|| {
        ApiError::forbidden(
            "PURCHASE_VERIFICATION_FAILED",
            "구매한 상품에만 리뷰를 작성할 수 있습니다",
        )
    })?;
    if already_reviewed {
        return Err(review_exists());
    }
    Ok(purchase_id)
}

/// Only the author or an admin may edit or delete a review.
pub fn authorize_review_mutation(review_author: Uuid, claims: &Claims) -> Result<(), ApiError> {
    if claims.is_admin() || claims.user_id()? == review_author {
        Ok(())
    } else {
        Err(ApiError::forbidden(
            "FORBIDDEN",
            "리뷰를 수정하거나 삭제할 권한이 없습니다",
        ))
    }
}

fn review_exists() -> ApiError {
    ApiError::bad_request("REVIEW_ALREADY_EXISTS", "이미 리뷰를 작성했습니다")
}

fn review_not_found() -> ApiError {
    ApiError::NotFound("리뷰를 찾을 수 없습니다".to_string())
}

fn average(ratings: impl Iterator<Item = i16>) -> Option<f64> {
    let (sum, count) = ratings.fold((0i64, 0i64), |(s, c), r| (s + r as i64, c + 1));
    (count > 0).then(|| ((sum as f64 / count as f64) * 10.0).round() / 10.0)
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/products/{productId}/reviews
pub async fn list_reviews(
    ApiPath(product_id): ApiPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let pool = db::require_pool()?;

    let items = sqlx::query_as::<_, Review>(&format!(
        "SELECT {} FROM reviews WHERE product_id = $1 ORDER BY created_at DESC",
        REVIEW_COLUMNS
    ))
    .bind(product_id)
    .fetch_all(pool.as_ref())
    .await?;

    Ok(Json(ReviewListResponse {
        average_rating: average(items.iter().map(|r| r.rating)),
        count: items.len(),
        items,
    }))
}

/// POST /api/reviews
pub async fn create_review(
    headers: HeaderMap,
    ApiJson(payload): ApiJson<CreateReviewRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let claims = require_user(&headers)?;
    validate_rating(payload.rating)?;
    validate_review_content(&payload.content)?;

    let user_id = claims.user_id()?;
    let pool = db::require_pool()?;

    // Prefer a purchase that has not been reviewed yet.
    let purchase: Option<(Uuid, bool)> = sqlx::query_as(
        r#"
        SELECT p.id, EXISTS (SELECT 1 FROM reviews r WHERE r.purchase_id = p.id) AS reviewed
        FROM purchases p
        WHERE p.user_id = $1 AND p.product_id = $2
        ORDER BY reviewed ASC, p.created_at DESC
        LIMIT 1
        "#,
    )
    .bind(user_id)
    .bind(payload.product_id)
    .fetch_optional(pool.as_ref())
    .await?;

    let purchase_id = check_review_creation(
        purchase.map(|(id, _)| id),
        purchase.is_some_and(|(_, reviewed)| reviewed),
    )?;

    let review = sqlx::query_as::<_, Review>(&format!(
        r#"
        INSERT INTO reviews (user_id, product_id, purchase_id, rating, content)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING {}
        "#,
        REVIEW_COLUMNS
    ))
    .bind(user_id)
    .bind(payload.product_id)
    .bind(purchase_id)
    .bind(payload.rating)
    .bind(payload.content.trim())
    .fetch_one(pool.as_ref())
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            review_exists()
        } else {
            ApiError::Database(e)
        }
    })?;

    Ok((StatusCode::CREATED, Json(review)))
}

async fn load_review(id: Uuid) -> Result<(std::sync::Arc<sqlx::PgPool>, Review), ApiError> {
    let pool = db::require_pool()?;
    let review = sqlx::query_as::<_, Review>(&format!(
        "SELECT {} FROM reviews WHERE id = $1",
        REVIEW_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool.as_ref())
    .await?
    .ok_or_else(review_not_found)?;
    Ok((pool, review))
}

/// PATCH /api/reviews/{id}
pub async fn update_review(
    headers: HeaderMap,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(payload): ApiJson<UpdateReviewRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let claims = require_user(&headers)?;
    if let Some(rating) = payload.rating {
        validate_rating(rating)?;
    }
    if let Some(content) = &payload.content {
        validate_review_content(content)?;
    }

    let (pool, existing) = load_review(id).await?;
    authorize_review_mutation(existing.user_id, &claims)?;

    let review = sqlx::query_as::<_, Review>(&format!(
        r#"
        UPDATE reviews SET rating = $1, content = $2, updated_at = now()
        WHERE id = $3
        RETURNING {}
        "#,
        REVIEW_COLUMNS
    ))
    .bind(payload.rating.unwrap_or(existing.rating))
    .bind(
        payload
            .content
            .map(|c| c.trim().to_string())
            .unwrap_or(existing.content),
    )
    .bind(id)
    .fetch_one(pool.as_ref())
    .await?;

    Ok(Json(review))
}

/// DELETE /api/reviews/{id}
pub async fn delete_review(
    headers: HeaderMap,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let claims = require_user(&headers)?;
    let (pool, existing) = load_review(id).await?;
    authorize_review_mutation(existing.user_id, &claims)?;

    sqlx::query("DELETE FROM reviews WHERE id = $1")
        .bind(id)
        .execute(pool.as_ref())
        .await?;

    tracing::info!(review_id = %id, by_admin = claims.is_admin(), "Review deleted");
    Ok(Json(SuccessResponse::ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::auth::{ROLE_ADMIN, ROLE_HOST};
    use crate::routes::test_support::{error_code, host_token, json_request, send};
    use axum::routing::post;
    use axum::Router;
    use serde_json::json;

    fn claims(user_id: Uuid, role: &str) -> Claims {
        Claims {
            sub: user_id.to_string(),
            email: "someone@example.com".to_string(),
            role: role.to_string(),
            exp: 0,
            iat: 0,
        }
    }

    #[test]
    fn test_creation_requires_purchase() {
        let err = check_review_creation(None, false).unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert_eq!(err.code(), "PURCHASE_VERIFICATION_FAILED");
    }

    #[test]
    fn test_creation_rejects_duplicate() {
        let err = check_review_creation(Some(Uuid::new_v4()), true).unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "REVIEW_ALREADY_EXISTS");
    }

    #[test]
    fn test_creation_allowed_with_unreviewed_purchase() {
        let purchase = Uuid::new_v4();
        assert_eq!(check_review_creation(Some(purchase), false).unwrap(), purchase);
    }

    #[test]
    fn test_author_and_admin_may_mutate() {
        let author = Uuid::new_v4();
        assert!(authorize_review_mutation(author, &claims(author, ROLE_HOST)).is_ok());
        assert!(authorize_review_mutation(author, &claims(Uuid::new_v4(), ROLE_ADMIN)).is_ok());

        let err = authorize_review_mutation(author, &claims(Uuid::new_v4(), ROLE_HOST)).unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert_eq!(err.code(), "FORBIDDEN");
    }

    #[test]
    fn test_rating_and_content_validation() {
        assert!(validate_rating(0).is_err());
        assert!(validate_rating(6).is_err());
        assert!((1..=5).all(|r| validate_rating(r).is_ok()));

        assert!(validate_review_content("   ").is_err());
        assert!(validate_review_content(&"가".repeat(MAX_CONTENT_CHARS + 1)).is_err());
        assert!(validate_review_content("깨끗하고 좋았어요").is_ok());
    }

    #[test]
    fn test_average_rating() {
        assert_eq!(average(std::iter::empty()), None);
        assert_eq!(average([5, 4, 4].into_iter()), Some(4.3));
    }

    #[tokio::test]
    async fn test_invalid_rating_is_rejected_before_database() {
        let app = Router::new().route("/api/reviews", post(create_review));
        let token = host_token();
        let req = json_request(
            "POST",
            "/api/reviews",
            Some(&token),
            json!({ "productId": Uuid::new_v4(), "rating": 9, "content": "좋아요" }),
        );
        let (status, body) = send(app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_code(&body), "VALIDATION_ERROR");
    }
}
