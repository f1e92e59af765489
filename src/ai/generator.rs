//! Content generation behind a trait so the pipeline can run without a model.

use async_trait::async_trait;
use serde_json::Value;

use super::generation::{GenerationError, GenerationInput};
use super::listing::{self, ListingDetails};
use super::llm::{LlmClient, LlmError};
use crate::blocks::BlockType;
use crate::config::AppConfig;

const ANALYZE_MAX_TOKENS: u32 = 1024;
const BLOCK_MAX_TOKENS: u32 = 1500;

const SYSTEM_PROMPT: &str = "You write mobile guidebooks that short-stay hosts share with their guests. \
Be concrete and friendly, never invent facts that contradict the listing, and leave a field out \
rather than guess wildly. Write in Korean unless the listing is clearly written in another language. \
Reply with a single JSON object and nothing else.";

#[async_trait]
pub trait BlockGenerator: Send + Sync {
    /// Turn the host's input into listing details. URL input is fetched.
    async fn parse_listing(&self, input: &GenerationInput) -> Result<ListingDetails, GenerationError> {
        match input {
            GenerationInput::Url { url } => {
                let url = listing::parse_listing_url(url)?;
                Ok(listing::fetch_listing(&url).await?)
            }
            GenerationInput::Manual(manual) => Ok(manual.clone().into_details()),
        }
    }

    /// Structured profile of the property shared by every block prompt.
    async fn analyze(&self, listing: &ListingDetails) -> Result<Value, GenerationError>;

    /// Raw content for one block. The caller validates it.
    async fn generate_block(
        &self,
        block_type: BlockType,
        listing: &ListingDetails,
        profile: &Value,
    ) -> Result<Value, GenerationError>;
}

pub struct LlmBlockGenerator {
    client: Option<LlmClient>,
}

impl LlmBlockGenerator {
    pub fn from_config(config: &AppConfig) -> Self {
        let client = match LlmClient::new(
            config.anthropic_api_key.clone(),
            config.anthropic_model.clone(),
        ) {
            Ok(client) => Some(client),
            Err(e) => {
                tracing::warn!("AI generation unavailable: {}", e);
                None
            }
        };
        Self { client }
    }

    fn client(&self) -> Result<&LlmClient, GenerationError> {
        self.client
            .as_ref()
            .ok_or_else(|| LlmError::MissingApiKey.into())
    }
}

#[async_trait]
impl BlockGenerator for LlmBlockGenerator {
    async fn analyze(&self, listing: &ListingDetails) -> Result<Value, GenerationError> {
        let prompt = format!(
            "Here is a rental listing:\n\n{}\n\n\
             Summarise it as JSON with the keys \"summary\" (two sentences), \
             \"highlights\" (up to five short strings), \"propertyType\", \
             \"neighborhood\", \"maxGuests\" (number or null), \"language\" \
             (ISO code of the listing text) and \"tone\" (one word).",
            listing_context(listing)
        );
        let profile = self
            .client()?
            .complete_json::<Value>(SYSTEM_PROMPT, &prompt, ANALYZE_MAX_TOKENS)
            .await?;
        Ok(profile)
    }

    async fn generate_block(
        &self,
        block_type: BlockType,
        listing: &ListingDetails,
        profile: &Value,
    ) -> Result<Value, GenerationError> {
        let prompt = format!(
            "Listing:\n{}\n\nProfile:\n{}\n\nWrite the \"{}\" block of the guidebook. {}",
            listing_context(listing),
            profile,
            block_type,
            block_instructions(block_type)
        );
        let content = self
            .client()?
            .complete_json::<Value>(SYSTEM_PROMPT, &prompt, BLOCK_MAX_TOKENS)
            .await?;
        Ok(content)
    }
}

fn listing_context(listing: &ListingDetails) -> String {
    serde_json::to_string_pretty(listing).unwrap_or_else(|_| listing.title.clone())
}

/// Expected JSON shape per block type.
fn block_instructions(block_type: BlockType) -> &'static str {
    match block_type {
        BlockType::Hero => {
            "Return {\"title\": welcoming headline, \"subtitle\": one line about the stay}."
        }
        BlockType::QuickInfo => {
            "Return {\"checkIn\", \"checkOut\" (HH:MM), \"maxGuests\" (number), \"address\", \
             \"wifiName\", \"wifiPassword\"}; omit keys the listing does not mention."
        }
        BlockType::Amenities => {
            "Return {\"items\": [{\"name\", \"icon\" (single emoji), \"description\"}]} \
             with the amenities guests care about most, at most twelve."
        }
        BlockType::Rules => {
            "Return {\"items\": [{\"text\", \"allowed\" (true for things guests may do, \
             false for prohibitions)}]} covering smoking, pets, noise, parties and checkout."
        }
        BlockType::Notice => {
            "Return {\"title\", \"body\", \"level\" (\"info\", \"warning\" or \"important\")} \
             with the single most important thing guests must know on arrival."
        }
        BlockType::Map => {
            "Return {\"address\", \"directions\" (how to get there from the nearest station \
             or airport)}; include \"latitude\" and \"longitude\" only if the listing states them."
        }
        BlockType::Gallery => "Return {\"images\": [{\"url\", \"caption\"}]}.",
        BlockType::Custom => "Return {\"title\", \"body\" (simple HTML)}.",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::generation::{ErrorCode, ManualListing};

    fn config_without_key() -> AppConfig {
        AppConfig {
            environment: "test".to_string(),
            site_url: "http://localhost:3000".to_string(),
            jwt_secret: "secret".to_string(),
            billing_webhook_secret: None,
            anthropic_api_key: None,
            anthropic_model: None,
        }
    }

    #[tokio::test]
    async fn test_missing_key_surfaces_as_generation_error() {
        let generator = LlmBlockGenerator::from_config(&config_without_key());
        let err = generator.analyze(&ListingDetails::default()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ApiKeyMissing);
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn test_manual_input_is_parsed_without_network() {
        let generator = LlmBlockGenerator::from_config(&config_without_key());
        let input = GenerationInput::Manual(ManualListing {
            title: " Hanok Stay ".to_string(),
            description: "Traditional house".to_string(),
            address: "Seoul Jongno-gu".to_string(),
            amenities: vec!["Ondol".to_string()],
            ..Default::default()
        });
        let details = generator.parse_listing(&input).await.unwrap();
        assert_eq!(details.title, "Hanok Stay");
        assert_eq!(details.amenities, vec!["Ondol".to_string()]);
        assert!(details.source_url.is_none());
    }

    #[tokio::test]
    async fn test_bad_url_fails_as_listing_error() {
        let generator = LlmBlockGenerator::from_config(&config_without_key());
        let input = GenerationInput::Url {
            url: "file:///etc/passwd".to_string(),
        };
        let err = generator.parse_listing(&input).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ListingFetchFailed);
    }

    #[test]
    fn test_every_block_type_has_instructions() {
        for block_type in BlockType::ALL {
            assert!(block_instructions(block_type).starts_with("Return"));
        }
    }
}
