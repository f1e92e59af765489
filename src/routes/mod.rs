/**
 * Routes Module
 * API route handlers
 */

pub mod ai;
pub mod analytics;
pub mod auth;
pub mod blocks;
pub mod extract;
pub mod guidebooks;
pub mod health;
pub mod reviews;
pub mod subscription;
pub mod upsell;

use serde::{Deserialize, Serialize};

/// Success response (for delete and other bodiless operations)
#[derive(Debug, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

impl SuccessResponse {
    pub fn ok() -> Self {
        Self { success: true }
    }
}
