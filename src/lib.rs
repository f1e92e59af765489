//! Roomy Backend - guest guidebook API, library for app logic and testing

pub mod ai;
pub mod blocks;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod ordering;
pub mod plans;
pub mod routes;
pub mod setup;
pub mod slug;

use axum::{
    http::{HeaderValue, Method},
    middleware,
    routing::{get, patch, post, put},
    Router,
};
use std::net::SocketAddr;
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer,
};

/// Request bodies above this are rejected
const BODY_LIMIT_BYTES: usize = 2 * 1024 * 1024;

/// Configure CORS from environment variables.
/// Uses ALLOWED_ORIGINS (comma-separated) or FRONTEND_ORIGIN, falling back to
/// the local frontend dev server.
pub fn configure_cors() -> CorsLayer {
    let allowed_origins = std::env::var("ALLOWED_ORIGINS")
        .ok()
        .and_then(|s| {
            let origins: Vec<HeaderValue> = s
                .split(',')
                .filter_map(|origin| origin.trim().parse().ok())
                .collect();
            if origins.is_empty() {
                None
            } else {
                Some(origins)
            }
        })
        .or_else(|| {
            std::env::var("FRONTEND_ORIGIN")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(|origin| vec![origin])
        })
        .unwrap_or_else(|| {
            vec![
                HeaderValue::from_static("http://localhost:3000"),
                HeaderValue::from_static("http://127.0.0.1:3000"),
            ]
        });

    CorsLayer::new()
        .allow_origin(allowed_origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
        ])
        .allow_credentials(true)
}

fn api_routes() -> Router {
    use routes::{ai, analytics, auth, blocks, guidebooks, reviews, subscription, upsell};

    Router::new()
        // Auth
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/verify", post(auth::verify_token))
        .route("/api/auth/refresh", post(auth::refresh))
        .route("/api/auth/logout", post(auth::logout))
        // Guidebooks
        .route(
            "/api/guidebooks",
            get(guidebooks::list_guidebooks).post(guidebooks::create_guidebook),
        )
        .route(
            "/api/guidebooks/slug-availability",
            get(guidebooks::check_slug),
        )
        .route(
            "/api/guidebooks/{id}",
            get(guidebooks::get_guidebook)
                .patch(guidebooks::update_guidebook)
                .delete(guidebooks::delete_guidebook),
        )
        .route("/api/guidebooks/{id}/share", get(guidebooks::share_link))
        .route(
            "/api/public/guidebooks/{slug}",
            get(guidebooks::get_public_guidebook),
        )
        // Blocks
        .route(
            "/api/guidebooks/{id}/blocks",
            get(blocks::list_blocks).post(blocks::create_block),
        )
        .route(
            "/api/guidebooks/{id}/blocks/reorder",
            post(blocks::reorder_blocks),
        )
        .route(
            "/api/guidebooks/{id}/blocks/{block_id}",
            patch(blocks::update_block).delete(blocks::delete_block),
        )
        // Upsell
        .route(
            "/api/guidebooks/{id}/upsell/items",
            get(upsell::list_items).post(upsell::create_item),
        )
        .route(
            "/api/guidebooks/{id}/upsell/items/{item_id}",
            put(upsell::update_item).delete(upsell::delete_item),
        )
        .route(
            "/api/guidebooks/{id}/upsell/items/{item_id}/move",
            post(upsell::move_item),
        )
        .route(
            "/api/guidebooks/{id}/upsell/requests",
            get(upsell::list_requests),
        )
        .route(
            "/api/guidebooks/{id}/upsell/requests/{request_id}",
            patch(upsell::update_request_status),
        )
        .route(
            "/api/public/guidebooks/{slug}/upsell",
            get(upsell::public_items),
        )
        .route("/api/upsell/requests", post(upsell::create_request))
        // Analytics
        .route("/api/guidebooks/{id}/views", post(analytics::record_view))
        .route("/api/guidebooks/{id}/shares", post(analytics::record_share))
        .route("/api/guidebooks/{id}/stats", get(analytics::guidebook_stats))
        // AI generation
        .route(
            "/api/guidebooks/{id}/ai/generate",
            post(ai::start_generation)
                .get(ai::generation_status)
                .delete(ai::cancel_generation),
        )
        .route("/api/guidebooks/{id}/ai/reset", post(ai::reset_generation))
        .route("/api/guidebooks/{id}/ai/commit", post(ai::commit_generation))
        // Subscription and billing
        .route("/api/subscription", get(subscription::get_subscription))
        .route(
            "/api/subscription/payments",
            get(subscription::list_payments),
        )
        .route("/api/billing/webhook", post(subscription::billing_webhook))
        // Reviews
        .route(
            "/api/products/{product_id}/reviews",
            get(reviews::list_reviews),
        )
        .route("/api/reviews", post(reviews::create_review))
        .route(
            "/api/reviews/{id}",
            patch(reviews::update_review).delete(reviews::delete_review),
        )
}

/// Create and configure the application router.
pub fn create_app() -> Router {
    let cors = configure_cors();
    tracing::info!("CORS configured");

    api_routes()
        .route("/health", get(routes::health::health_ping))
        .route("/health/detailed", get(routes::health::health_detailed))
        .route("/health/database", get(routes::health::health_database))
        .route("/health/ready", get(routes::health::health_ready))
        .layer(logging::middleware::propagate_request_id_layer())
        .layer(middleware::from_fn(logging::middleware::log_request))
        .layer(logging::middleware::request_id_layer())
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT_BYTES))
        .layer(cors)
}

/// Run the server (used by main).
pub async fn run() {
    dotenvy::dotenv().ok();

    // Dropping these stops the background writers and loses buffered lines.
    let _log_guards = logging::init();

    routes::health::init_start_time();

    let app_config = config::get();
    if app_config.is_production() && app_config.has_insecure_jwt_secret() {
        panic!(
            "FATAL: JWT_SECRET must be set to a secure, unique value in production. \
             Refusing to start with the default secret."
        );
    }
    if app_config.billing_webhook_secret.is_none() {
        tracing::warn!("BILLING_WEBHOOK_SECRET not set; billing webhooks will be rejected");
    }
    if app_config.anthropic_api_key.is_none() {
        tracing::warn!("ANTHROPIC_API_KEY not set; AI generation will fail with API_KEY_MISSING");
    }

    if std::env::var("DATABASE_URL").is_ok() {
        match db::init_pool(None).await {
            Ok(pool) => {
                if let Err(e) = db::run_migrations(&pool).await {
                    tracing::error!("Failed to run database migrations: {}", e);
                }
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to initialize database pool: {}. Continuing without database.",
                    e
                );
            }
        }
    } else {
        tracing::info!("DATABASE_URL not set. Running without database connection.");
    }

    let app = create_app();

    let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(3001);
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .expect("Invalid HOST/PORT configuration");
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("Server error");
}
