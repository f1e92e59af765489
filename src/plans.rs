//! Subscription plans and what each one allows.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    #[default]
    Free,
    Pro,
    Business,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanLimits {
    /// `None` means unlimited
    pub max_guidebooks: Option<i64>,
    pub upsell_enabled: bool,
    pub ai_generations_per_month: Option<u32>,
}

impl Plan {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "free" => Some(Self::Free),
            "pro" => Some(Self::Pro),
            "business" => Some(Self::Business),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
            Self::Business => "business",
        }
    }

    pub fn limits(&self) -> PlanLimits {
        match self {
            Self::Free => PlanLimits {
                max_guidebooks: Some(1),
                upsell_enabled: false,
                ai_generations_per_month: Some(3),
            },
            Self::Pro => PlanLimits {
                max_guidebooks: Some(10),
                upsell_enabled: true,
                ai_generations_per_month: Some(50),
            },
            Self::Business => PlanLimits {
                max_guidebooks: None,
                upsell_enabled: true,
                ai_generations_per_month: None,
            },
        }
    }

    /// Plan in effect for a stored subscription row. Lapsed subscriptions
    /// fall back to free.
    pub fn effective(plan: &str, status: &str) -> Self {
        match (Self::parse(plan), status) {
            (Some(plan), "active" | "trialing") => plan,
            _ => Self::Free,
        }
    }
}

impl PlanLimits {
    pub fn allows_another_guidebook(&self, current: i64) -> bool {
        self.max_guidebooks.map_or(true, |max| current < max)
    }

    pub fn allows_another_generation(&self, used_this_month: u32) -> bool {
        self.ai_generations_per_month
            .map_or(true, |max| used_this_month < max)
    }
}
