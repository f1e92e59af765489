/**
 * Subscription Routes
 * Current plan, payment history and the billing gateway webhook
 */
use axum::{
    body::Bytes,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::ai::generation;
use crate::config;
use crate::db::{
    self,
    models::{PaymentHistory, Subscription},
};
use crate::error::ApiError;
use crate::plans::{Plan, PlanLimits};
use crate::routes::auth::require_user;

pub const WEBHOOK_SECRET_HEADER: &str = "x-webhook-secret";

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub guidebooks: i64,
    pub ai_generations_this_month: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionResponse {
    pub plan: Plan,
    pub status: String,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub limits: PlanLimits,
    pub usage: Usage,
}

#[derive(Debug, Serialize)]
pub struct PaymentListResponse {
    pub items: Vec<PaymentHistory>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionEventData {
    pub user_id: Uuid,
    pub plan: Plan,
    pub status: String,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    pub subscription_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelEventData {
    pub user_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentEventData {
    pub user_id: Uuid,
    pub payment_id: String,
    pub amount: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub description: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
}

fn default_currency() -> String {
    "KRW".to_string()
}

/// Events mirrored from the payment gateway.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum BillingEvent {
    #[serde(rename = "subscription.updated")]
    SubscriptionUpdated(SubscriptionEventData),
    #[serde(rename = "subscription.canceled")]
    SubscriptionCanceled(CancelEventData),
    #[serde(rename = "payment.succeeded")]
    PaymentSucceeded(PaymentEventData),
    #[serde(rename = "payment.failed")]
    PaymentFailed(PaymentEventData),
}

const SUBSCRIPTION_STATUSES: &[&str] = &["active", "trialing", "past_due", "canceled"];

// ============================================================================
// Plan lookup
// ============================================================================

/// Plan currently in effect for a user. No subscription row means free.
pub async fn current_plan(pool: &PgPool, user_id: Uuid) -> Result<Plan, ApiError> {
    let row: Option<(String, String)> =
        sqlx::query_as("SELECT plan, status FROM subscriptions WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(pool)
            .await?;

    Ok(row
        .map(|(plan, status)| Plan::effective(&plan, &status))
        .unwrap_or_default())
}

// ============================================================================
// Webhook authentication
// ============================================================================

/// Compares SHA-256 digests so the comparison length never depends on the
/// provided secret.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let (a, b) = (Sha256::digest(a), Sha256::digest(b));
    a.as_slice().ct_eq(b.as_slice()).into()
}

pub fn verify_webhook_secret(expected: Option<&str>, provided: Option<&str>) -> Result<(), ApiError> {
    let Some(expected) = expected else {
        return Err(ApiError::forbidden(
            "WEBHOOK_DISABLED",
            "결제 웹훅이 설정되지 않았습니다",
        ));
    };
    match provided {
        Some(provided) if constant_time_eq(expected.as_bytes(), provided.as_bytes()) => Ok(()),
        _ => Err(ApiError::forbidden(
            "INVALID_WEBHOOK_SECRET",
            "웹훅 인증에 실패했습니다",
        )),
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/subscription
pub async fn get_subscription(headers: HeaderMap) -> Result<impl IntoResponse, ApiError> {
    let claims = require_user(&headers)?;
    let user_id = claims.user_id()?;
    let pool = db::require_pool()?;

    let subscription = sqlx::query_as::<_, Subscription>(
        r#"
        SELECT id, user_id, plan, status, current_period_start, current_period_end,
               cancel_at_period_end, gateway_subscription_id, updated_at
        FROM subscriptions WHERE user_id = $1
        "#,
    )
    .bind(user_id)
    .fetch_optional(pool.as_ref())
    .await?;

    let (guidebooks,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM guidebooks WHERE owner_id = $1")
            .bind(user_id)
            .fetch_one(pool.as_ref())
            .await?;

    let usage = Usage {
        guidebooks,
        ai_generations_this_month: generation::generations_this_month(user_id),
    };

    let response = match subscription {
        Some(sub) => {
            let plan = Plan::effective(&sub.plan, &sub.status);
            SubscriptionResponse {
                plan,
                status: sub.status,
                current_period_start: sub.current_period_start,
                current_period_end: sub.current_period_end,
                cancel_at_period_end: sub.cancel_at_period_end,
                limits: plan.limits(),
                usage,
            }
        }
        None => SubscriptionResponse {
            plan: Plan::Free,
            status: "active".to_string(),
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            limits: Plan::Free.limits(),
            usage,
        },
    };

    Ok(Json(response))
}

/// GET /api/subscription/payments
pub async fn list_payments(headers: HeaderMap) -> Result<impl IntoResponse, ApiError> {
    let claims = require_user(&headers)?;
    let pool = db::require_pool()?;

    let items = sqlx::query_as::<_, PaymentHistory>(
        r#"
        SELECT id, user_id, amount, currency, status, gateway_payment_id, description, paid_at
        FROM payment_history
        WHERE user_id = $1
        ORDER BY paid_at DESC
        "#,
    )
    .bind(claims.user_id()?)
    .fetch_all(pool.as_ref())
    .await?;

    Ok(Json(PaymentListResponse { items }))
}

/// POST /api/billing/webhook
pub async fn billing_webhook(
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let provided = headers
        .get(WEBHOOK_SECRET_HEADER)
        .and_then(|v| v.to_str().ok());
    verify_webhook_secret(config::get().billing_webhook_secret.as_deref(), provided)?;

    let event: BillingEvent = serde_json::from_slice(&body).map_err(|e| {
        tracing::warn!("Malformed billing event: {}", e);
        ApiError::bad_request("INVALID_WEBHOOK_EVENT", "웹훅 이벤트 형식이 올바르지 않습니다")
    })?;

    let pool = db::require_pool()?;

    match event {
        BillingEvent::SubscriptionUpdated(data) => {
            if !SUBSCRIPTION_STATUSES.contains(&data.status.as_str()) {
                return Err(ApiError::bad_request(
                    "INVALID_WEBHOOK_EVENT",
                    "알 수 없는 구독 상태입니다",
                ));
            }
            sqlx::query(
                r#"
                INSERT INTO subscriptions (user_id, plan, status, current_period_start,
                    current_period_end, cancel_at_period_end, gateway_subscription_id)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (user_id) DO UPDATE SET
                    plan = EXCLUDED.plan,
                    status = EXCLUDED.status,
                    current_period_start = EXCLUDED.current_period_start,
                    current_period_end = EXCLUDED.current_period_end,
                    cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                    gateway_subscription_id = COALESCE(EXCLUDED.gateway_subscription_id,
                        subscriptions.gateway_subscription_id),
                    updated_at = now()
                "#,
            )
            .bind(data.user_id)
            .bind(data.plan.as_str())
            .bind(&data.status)
            .bind(data.current_period_start)
            .bind(data.current_period_end)
            .bind(data.cancel_at_period_end)
            .bind(&data.subscription_id)
            .execute(pool.as_ref())
            .await?;

            tracing::info!(user_id = %data.user_id, plan = data.plan.as_str(), status = %data.status, "Subscription updated");
        }
        BillingEvent::SubscriptionCanceled(data) => {
            sqlx::query(
                "UPDATE subscriptions SET status = 'canceled', updated_at = now() WHERE user_id = $1",
            )
            .bind(data.user_id)
            .execute(pool.as_ref())
            .await?;

            tracing::info!(user_id = %data.user_id, "Subscription canceled");
        }
        BillingEvent::PaymentSucceeded(data) => record_payment(&pool, data, "succeeded").await?,
        BillingEvent::PaymentFailed(data) => record_payment(&pool, data, "failed").await?,
    }

    Ok(StatusCode::NO_CONTENT)
}

/// Gateways redeliver events, so a known payment id updates in place.
async fn record_payment(pool: &PgPool, data: PaymentEventData, status: &str) -> Result<(), ApiError> {
    sqlx::query(
        r#"
        INSERT INTO payment_history (user_id, amount, currency, status, gateway_payment_id,
            description, paid_at)
        VALUES ($1, $2, $3, $4, $5, $6, COALESCE($7, now()))
        ON CONFLICT (gateway_payment_id) DO UPDATE SET status = EXCLUDED.status
        "#,
    )
    .bind(data.user_id)
    .bind(data.amount)
    .bind(&data.currency)
    .bind(status)
    .bind(&data.payment_id)
    .bind(&data.description)
    .bind(data.paid_at)
    .execute(pool)
    .await?;

    tracing::info!(user_id = %data.user_id, payment_id = %data.payment_id, status, "Payment recorded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::test_support::{empty_request, error_code, json_request, send};
    use axum::routing::{get, post};
    use axum::Router;
    use serde_json::json;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret2"));
    }

    #[test]
    fn test_webhook_secret_verification() {
        assert!(verify_webhook_secret(Some("s3cret"), Some("s3cret")).is_ok());

        let wrong = verify_webhook_secret(Some("s3cret"), Some("nope")).unwrap_err();
        assert_eq!(wrong.code(), "INVALID_WEBHOOK_SECRET");

        let missing = verify_webhook_secret(Some("s3cret"), None).unwrap_err();
        assert_eq!(missing.status(), StatusCode::FORBIDDEN);

        let disabled = verify_webhook_secret(None, Some("anything")).unwrap_err();
        assert_eq!(disabled.code(), "WEBHOOK_DISABLED");
    }

    #[test]
    fn test_billing_event_parsing() {
        let event: BillingEvent = serde_json::from_value(json!({
            "type": "subscription.updated",
            "data": {
                "userId": Uuid::nil(),
                "plan": "pro",
                "status": "active",
                "currentPeriodEnd": "2026-11-01T00:00:00Z"
            }
        }))
        .unwrap();
        match event {
            BillingEvent::SubscriptionUpdated(data) => {
                assert_eq!(data.plan, Plan::Pro);
                assert!(!data.cancel_at_period_end);
                assert!(data.current_period_end.is_some());
            }
            other => panic!("unexpected event {:?}", other),
        }

        let payment: BillingEvent = serde_json::from_value(json!({
            "type": "payment.succeeded",
            "data": { "userId": Uuid::nil(), "paymentId": "pay_1", "amount": 9900 }
        }))
        .unwrap();
        match payment {
            BillingEvent::PaymentSucceeded(data) => assert_eq!(data.currency, "KRW"),
            other => panic!("unexpected event {:?}", other),
        }

        assert!(serde_json::from_value::<BillingEvent>(json!({
            "type": "invoice.created",
            "data": {}
        }))
        .is_err());
    }

    #[tokio::test]
    async fn test_subscription_requires_auth() {
        let app = Router::new().route("/api/subscription", get(get_subscription));
        let (status, _) = send(app, empty_request("GET", "/api/subscription", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_webhook_without_secret_is_forbidden() {
        let app = Router::new().route("/api/billing/webhook", post(billing_webhook));
        let req = json_request(
            "POST",
            "/api/billing/webhook",
            None,
            json!({ "type": "subscription.canceled", "data": { "userId": Uuid::nil() } }),
        );
        let (status, body) = send(app, req).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(!error_code(&body).is_empty());
    }
}
