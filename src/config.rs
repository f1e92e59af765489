/**
 * Application Configuration
 * Process-wide settings read from the environment once
 */

pub const DEFAULT_JWT_SECRET: &str = "default-jwt-secret-change-in-production";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: String,
    /// Public origin of the guest viewer, used to build share links
    pub site_url: String,
    pub jwt_secret: String,
    pub billing_webhook_secret: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub anthropic_model: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            environment: std::env::var("ENVIRONMENT")
                .unwrap_or_else(|_| "development".to_string()),
            site_url: std::env::var("SITE_URL")
                .map(|s| s.trim_end_matches('/').to_string())
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            jwt_secret: std::env::var("JWT_SECRET")
                .unwrap_or_else(|_| DEFAULT_JWT_SECRET.to_string()),
            billing_webhook_secret: non_empty_var("BILLING_WEBHOOK_SECRET"),
            anthropic_api_key: non_empty_var("ANTHROPIC_API_KEY"),
            anthropic_model: non_empty_var("ANTHROPIC_MODEL"),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// Whether the JWT secret is unusable for production.
    pub fn has_insecure_jwt_secret(&self) -> bool {
        self.jwt_secret.is_empty() || self.jwt_secret == DEFAULT_JWT_SECRET
    }

    /// Guest-facing URL of a guidebook.
    pub fn share_url(&self, slug: &str) -> String {
        format!("{}/g/{}", self.site_url, slug)
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

lazy_static::lazy_static! {
    pub static ref CONFIG: AppConfig = AppConfig::from_env();
}

/// Global configuration.
pub fn get() -> &'static AppConfig {
    &CONFIG
}
