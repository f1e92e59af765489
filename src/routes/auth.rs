/**
 * Authentication Routes
 * JWT-based host authentication with register, login, verify, refresh, and logout
 */
use axum::{
    extract::ConnectInfo,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::distr::{Alphanumeric, SampleString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config;
use crate::db::{self, models::User};
use crate::error::{is_unique_violation, ApiError};
use crate::routes::extract::ApiJson;

// ============================================================================
// Configuration
// ============================================================================

lazy_static::lazy_static! {
    /// Rate limit storage (IP -> last login attempt timestamp)
    static ref RATE_LIMIT: Arc<RwLock<HashMap<String, i64>>> =
        Arc::new(RwLock::new(HashMap::new()));
}

/// Access token expiry in minutes
const ACCESS_TOKEN_EXPIRY_MINUTES: i64 = 15;

/// Refresh token expiry in days
const REFRESH_TOKEN_EXPIRY_DAYS: i64 = 7;

/// One login attempt per IP per window
#[cfg_attr(test, allow(dead_code))]
const RATE_LIMIT_WINDOW_SECS: i64 = 2;

const MIN_PASSWORD_LEN: usize = 8;

pub const ROLE_HOST: &str = "host";
pub const ROLE_ADMIN: &str = "admin";

// ============================================================================
// Types
// ============================================================================

/// JWT Claims structure
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    pub role: String,
    pub exp: i64,
    pub iat: i64,
}

impl Claims {
    pub fn user_id(&self) -> Result<Uuid, ApiError> {
        Uuid::parse_str(&self.sub).map_err(|_| ApiError::Unauthorized)
    }

    pub fn is_admin(&self) -> bool {
        self.role == ROLE_ADMIN
    }
}

/// User info returned to frontend
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub user_id: String,
    pub email: String,
    pub display_name: Option<String>,
    pub role: String,
}

impl From<&User> for UserInfo {
    fn from(user: &User) -> Self {
        Self {
            user_id: user.id.to_string(),
            email: user.email.clone(),
            display_name: user.display_name.clone(),
            role: user.role.clone(),
        }
    }
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub user: UserInfo,
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub is_valid: bool,
    pub user: Option<UserInfo>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogoutRequest {
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Revoke every session of the caller
    #[serde(default)]
    pub all_sessions: bool,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct LogoutResponse {
    pub success: bool,
}

// ============================================================================
// Helper Functions
// ============================================================================

fn generate_refresh_token() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), 64)
}

/// Refresh tokens are stored as SHA-256 hex digests only.
fn hash_refresh_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn create_access_token(
    user_id: &str,
    email: &str,
    role: &str,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let exp = now + Duration::minutes(ACCESS_TOKEN_EXPIRY_MINUTES);

    let claims = Claims {
        sub: user_id.to_string(),
        email: email.to_string(),
        role: role.to_string(),
        exp: exp.timestamp(),
        iat: now.timestamp(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(config::get().jwt_secret.as_bytes()),
    )
}

/// Verify and decode access token
pub fn verify_access_token(token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(config::get().jwt_secret.as_bytes()),
        &Validation::default(),
    )?;
    Ok(token_data.claims)
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Authenticated caller, or 401.
pub fn require_user(headers: &HeaderMap) -> Result<Claims, ApiError> {
    let token = extract_bearer_token(headers).ok_or(ApiError::Unauthorized)?;
    verify_access_token(token).map_err(|e| {
        tracing::debug!("Token verification failed: {}", e);
        ApiError::Unauthorized
    })
}

/// Authenticated caller if a valid token is present.
pub fn optional_user(headers: &HeaderMap) -> Option<Claims> {
    extract_bearer_token(headers).and_then(|t| verify_access_token(t).ok())
}

async fn check_rate_limit(ip: &str) -> bool {
    #[cfg(test)]
    {
        let _ = ip;
        return true;
    }

    #[cfg(not(test))]
    {
        let now = Utc::now().timestamp();
        let mut limits = RATE_LIMIT.write().await;

        limits.retain(|_, last| now - *last < RATE_LIMIT_WINDOW_SECS);

        if limits.contains_key(ip) {
            return false;
        }

        limits.insert(ip.to_string(), now);
        true
    }
}

fn validate_credentials(email: &str, password: &str) -> Result<(), ApiError> {
    if email.trim().is_empty() || password.is_empty() {
        return Err(ApiError::Validation(
            "이메일과 비밀번호를 입력해주세요".to_string(),
        ));
    }
    if !email.contains('@') {
        return Err(ApiError::Validation(
            "올바른 이메일 형식이 아닙니다".to_string(),
        ));
    }
    Ok(())
}

async fn issue_session(user: &User) -> Result<SessionResponse, ApiError> {
    let pool = db::require_pool()?;
    let user_id = user.id.to_string();

    let access_token = create_access_token(&user_id, &user.email, &user.role)
        .map_err(|e| ApiError::Internal(format!("failed to create access token: {}", e)))?;

    let refresh_token = generate_refresh_token();
    let expires_at = Utc::now() + Duration::days(REFRESH_TOKEN_EXPIRY_DAYS);

    sqlx::query("INSERT INTO refresh_tokens (user_id, token_hash, expires_at) VALUES ($1, $2, $3)")
        .bind(user.id)
        .bind(hash_refresh_token(&refresh_token))
        .bind(expires_at)
        .execute(pool.as_ref())
        .await?;

    Ok(SessionResponse {
        user: UserInfo::from(user),
        access_token,
        refresh_token,
    })
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/auth/register
pub async fn register(
    ApiJson(payload): ApiJson<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_credentials(&payload.email, &payload.password)?;

    if payload.password.len() < MIN_PASSWORD_LEN {
        return Err(ApiError::Validation(format!(
            "비밀번호는 최소 {}자 이상이어야 합니다",
            MIN_PASSWORD_LEN
        )));
    }

    let pool = db::require_pool()?;

    // bcrypt is CPU-bound; keep it off the async executor.
    let password = payload.password;
    let password_hash = tokio::task::spawn_blocking(move || hash(&password, DEFAULT_COST))
        .await
        .map_err(|e| ApiError::Internal(format!("hash task panicked: {}", e)))?
        .map_err(|e| ApiError::Internal(format!("failed to hash password: {}", e)))?;

    let display_name = payload
        .display_name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty());

    let user = sqlx::query_as::<_, User>(
        r#"
        INSERT INTO users (email, password_hash, display_name, role)
        VALUES ($1, $2, $3, $4)
        RETURNING id, email, password_hash, display_name, role, created_at
        "#,
    )
    .bind(payload.email.trim())
    .bind(&password_hash)
    .bind(&display_name)
    .bind(ROLE_HOST)
    .fetch_one(pool.as_ref())
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            ApiError::conflict("EMAIL_TAKEN", "이미 가입된 이메일입니다")
        } else {
            ApiError::Database(e)
        }
    })?;

    tracing::info!(user_id = %user.id, "Host registered");

    let session = issue_session(&user).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// POST /api/auth/login
pub async fn login(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ApiJson(payload): ApiJson<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let ip = addr.ip().to_string();

    if !check_rate_limit(&ip).await {
        return Err(ApiError::RateLimited);
    }

    validate_credentials(&payload.email, &payload.password)?;

    let pool = db::require_pool()?;

    let user = sqlx::query_as::<_, User>(
        r#"SELECT id, email, password_hash, display_name, role, created_at
           FROM users
           WHERE LOWER(email) = LOWER($1)"#,
    )
    .bind(payload.email.trim())
    .fetch_optional(pool.as_ref())
    .await?;

    let Some(user) = user else {
        tracing::warn!("Login attempt for unknown email");
        return Err(ApiError::InvalidCredentials);
    };

    let password = payload.password;
    let stored_hash = user.password_hash.clone();
    let password_ok =
        tokio::task::spawn_blocking(move || verify(&password, &stored_hash).unwrap_or(false))
            .await
            .unwrap_or(false);

    if !password_ok {
        tracing::warn!(user_id = %user.id, "Failed login attempt");
        return Err(ApiError::InvalidCredentials);
    }

    let session = issue_session(&user).await?;
    tracing::info!(user_id = %user.id, "Successful login");

    Ok(Json(session))
}

/// POST /api/auth/verify
pub async fn verify_token(headers: HeaderMap) -> impl IntoResponse {
    let response = match require_user(&headers) {
        Ok(claims) => VerifyResponse {
            is_valid: true,
            user: Some(UserInfo {
                user_id: claims.sub,
                email: claims.email,
                display_name: None,
                role: claims.role,
            }),
        },
        Err(_) => VerifyResponse {
            is_valid: false,
            user: None,
        },
    };
    Json(response)
}

/// POST /api/auth/refresh
/// Exchange a refresh token for a new access token; the refresh token rotates.
pub async fn refresh(
    ApiJson(payload): ApiJson<RefreshRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if payload.refresh_token.is_empty() {
        return Err(ApiError::Validation(
            "리프레시 토큰이 필요합니다".to_string(),
        ));
    }

    let pool = db::require_pool()?;
    let token_hash = hash_refresh_token(&payload.refresh_token);

    let mut tx = pool.begin().await?;

    // Revoke-and-return in one statement so a token can only be used once.
    let user = sqlx::query_as::<_, User>(
        r#"
        WITH used AS (
            UPDATE refresh_tokens SET revoked = true
            WHERE token_hash = $1 AND revoked = false AND expires_at > now()
            RETURNING user_id
        )
        SELECT u.id, u.email, u.password_hash, u.display_name, u.role, u.created_at
        FROM users u JOIN used ON used.user_id = u.id
        "#,
    )
    .bind(&token_hash)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(user) = user else {
        return Err(ApiError::Unauthorized);
    };

    let access_token = create_access_token(&user.id.to_string(), &user.email, &user.role)
        .map_err(|e| ApiError::Internal(format!("failed to create access token: {}", e)))?;

    let new_refresh_token = generate_refresh_token();
    sqlx::query("INSERT INTO refresh_tokens (user_id, token_hash, expires_at) VALUES ($1, $2, $3)")
        .bind(user.id)
        .bind(hash_refresh_token(&new_refresh_token))
        .bind(Utc::now() + Duration::days(REFRESH_TOKEN_EXPIRY_DAYS))
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    Ok(Json(RefreshResponse {
        access_token,
        refresh_token: new_refresh_token,
    }))
}

/// POST /api/auth/logout
/// Always succeeds; revocation failures are only logged.
pub async fn logout(
    headers: HeaderMap,
    ApiJson(payload): ApiJson<LogoutRequest>,
) -> impl IntoResponse {
    if let Some(pool) = db::get_pool() {
        if let Some(refresh_token) = payload.refresh_token {
            if let Err(e) =
                sqlx::query("UPDATE refresh_tokens SET revoked = true WHERE token_hash = $1")
                    .bind(hash_refresh_token(&refresh_token))
                    .execute(pool.as_ref())
                    .await
            {
                tracing::warn!("Failed to revoke refresh token: {}", e);
            }
        }

        if payload.all_sessions {
            if let Some(user_id) = optional_user(&headers).and_then(|c| c.user_id().ok()) {
                if let Err(e) =
                    sqlx::query("UPDATE refresh_tokens SET revoked = true WHERE user_id = $1")
                        .bind(user_id)
                        .execute(pool.as_ref())
                        .await
                {
                    tracing::warn!("Failed to revoke sessions for {}: {}", user_id, e);
                }
            }
        }
    }

    Json(LogoutResponse { success: true })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use axum::routing::post;
    use axum::Router;
    use tower::ServiceExt;

    fn auth_router() -> Router {
        use axum::extract::connect_info::MockConnectInfo;
        Router::new()
            .route("/api/auth/register", post(register))
            .route("/api/auth/login", post(login))
            .route("/api/auth/verify", post(verify_token))
            .route("/api/auth/refresh", post(refresh))
            .route("/api/auth/logout", post(logout))
            .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 12345))))
    }

    async fn send(app: Router, req: Request<Body>) -> (StatusCode, axum::body::Bytes) {
        let res = app.oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, bytes)
    }

    fn post_json(uri: &str, json: &impl Serialize) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(json).unwrap()))
            .unwrap()
    }

    #[test]
    fn test_verify_access_token_invalid_returns_err() {
        assert!(verify_access_token("invalid.jwt.token").is_err());
    }

    #[test]
    fn test_access_token_round_trip() {
        let id = Uuid::new_v4().to_string();
        let token = create_access_token(&id, "host@example.com", ROLE_HOST).unwrap();
        let claims = verify_access_token(&token).unwrap();
        assert_eq!(claims.sub, id);
        assert!(!claims.is_admin());
        assert!(claims.user_id().is_ok());
    }

    #[test]
    fn test_refresh_token_hash_is_stable_hex() {
        let h = hash_refresh_token("abc");
        assert_eq!(h.len(), 64);
        assert_eq!(h, hash_refresh_token("abc"));
        assert_ne!(h, hash_refresh_token("abd"));
    }

    #[test]
    fn test_require_user_without_header_is_unauthorized() {
        let err = require_user(&HeaderMap::new()).unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized));
    }

    #[tokio::test]
    async fn test_register_short_password_returns_bad_request() {
        let req = post_json(
            "/api/auth/register",
            &RegisterRequest {
                email: "host@example.com".to_string(),
                password: "short".to_string(),
                display_name: None,
            },
        );
        let (status, _) = send(auth_router(), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_login_empty_email_returns_bad_request() {
        let req = post_json(
            "/api/auth/login",
            &LoginRequest {
                email: "".to_string(),
                password: "password123".to_string(),
            },
        );
        let (status, _) = send(auth_router(), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_login_without_database_is_unavailable() {
        let req = post_json(
            "/api/auth/login",
            &LoginRequest {
                email: "host@example.com".to_string(),
                password: "password123".to_string(),
            },
        );
        let (status, _) = send(auth_router(), req).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_verify_no_token_is_invalid() {
        let req = Request::post("/api/auth/verify").body(Body::empty()).unwrap();
        let (status, bytes) = send(auth_router(), req).await;
        assert_eq!(status, StatusCode::OK);
        let body: VerifyResponse = serde_json::from_slice(&bytes).unwrap();
        assert!(!body.is_valid);
        assert!(body.user.is_none());
    }

    #[tokio::test]
    async fn test_verify_valid_token() {
        let token = create_access_token(&Uuid::new_v4().to_string(), "a@b.c", ROLE_HOST).unwrap();
        let req = Request::post("/api/auth/verify")
            .header("authorization", format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap();
        let (_, bytes) = send(auth_router(), req).await;
        let body: VerifyResponse = serde_json::from_slice(&bytes).unwrap();
        assert!(body.is_valid);
        assert_eq!(body.user.unwrap().email, "a@b.c");
    }

    #[tokio::test]
    async fn test_refresh_empty_token_returns_bad_request() {
        let req = post_json(
            "/api/auth/refresh",
            &RefreshRequest {
                refresh_token: "".to_string(),
            },
        );
        let (status, _) = send(auth_router(), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_logout_returns_success() {
        let req = post_json(
            "/api/auth/logout",
            &LogoutRequest {
                refresh_token: None,
                all_sessions: true,
            },
        );
        let (status, bytes) = send(auth_router(), req).await;
        assert_eq!(status, StatusCode::OK);
        let body: LogoutResponse = serde_json::from_slice(&bytes).unwrap();
        assert!(body.success);
    }
}
