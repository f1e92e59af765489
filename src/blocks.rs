//! Guidebook block types and their content payloads.
//!
//! Block content is stored as JSON. Each block type has a typed view used to
//! validate what hosts (or the AI generator) submit; keys the server does not
//! know about are carried through untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockType {
    #[serde(rename = "hero")]
    Hero,
    #[serde(rename = "quickInfo")]
    QuickInfo,
    #[serde(rename = "amenities")]
    Amenities,
    #[serde(rename = "rules")]
    Rules,
    #[serde(rename = "map")]
    Map,
    #[serde(rename = "gallery")]
    Gallery,
    #[serde(rename = "notice")]
    Notice,
    #[serde(rename = "custom")]
    Custom,
}

impl BlockType {
    pub const ALL: [BlockType; 8] = [
        BlockType::Hero,
        BlockType::QuickInfo,
        BlockType::Amenities,
        BlockType::Rules,
        BlockType::Map,
        BlockType::Gallery,
        BlockType::Notice,
        BlockType::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BlockType::Hero => "hero",
            BlockType::QuickInfo => "quickInfo",
            BlockType::Amenities => "amenities",
            BlockType::Rules => "rules",
            BlockType::Map => "map",
            BlockType::Gallery => "gallery",
            BlockType::Notice => "notice",
            BlockType::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl std::fmt::Display for BlockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeroContent {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickInfoContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_in: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_out: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wifi_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wifi_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_guests: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Amenity {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmenitiesContent {
    pub items: Vec<Amenity>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesContent {
    pub items: Vec<Rule>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapContent {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directions: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryImage {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryContent {
    pub images: Vec<GalleryImage>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    #[default]
    Info,
    Warning,
    Important,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoticeContent {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub level: NoticeLevel,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomContent {
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn parse<T: for<'de> Deserialize<'de>>(content: Value) -> Result<T, String> {
    serde_json::from_value(content).map_err(|e| format!("블록 내용 형식이 올바르지 않습니다: {}", e))
}

fn require(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{} 항목은 비워둘 수 없습니다", field));
    }
    Ok(())
}

fn to_value<T: Serialize>(content: &T) -> Result<Value, String> {
    serde_json::to_value(content).map_err(|e| e.to_string())
}

/// Validate and normalise block content for `block_type`. Returns the
/// content to persist, or a user-facing error message.
pub fn validate_content(block_type: BlockType, content: Value) -> Result<Value, String> {
    if !content.is_object() {
        return Err("블록 내용은 JSON 객체여야 합니다".to_string());
    }

    match block_type {
        BlockType::Hero => {
            let hero: HeroContent = parse(content)?;
            require("title", &hero.title)?;
            to_value(&hero)
        }
        BlockType::QuickInfo => to_value(&parse::<QuickInfoContent>(content)?),
        BlockType::Amenities => {
            let amenities: AmenitiesContent = parse(content)?;
            for item in &amenities.items {
                require("items.name", &item.name)?;
            }
            to_value(&amenities)
        }
        BlockType::Rules => {
            let rules: RulesContent = parse(content)?;
            for item in &rules.items {
                require("items.text", &item.text)?;
            }
            to_value(&rules)
        }
        BlockType::Map => {
            let map: MapContent = parse(content)?;
            require("address", &map.address)?;
            if map.latitude.is_some_and(|lat| !(-90.0..=90.0).contains(&lat))
                || map.longitude.is_some_and(|lng| !(-180.0..=180.0).contains(&lng))
            {
                return Err("좌표 값이 올바르지 않습니다".to_string());
            }
            to_value(&map)
        }
        BlockType::Gallery => {
            let gallery: GalleryContent = parse(content)?;
            for image in &gallery.images {
                require("images.url", &image.url)?;
            }
            to_value(&gallery)
        }
        BlockType::Notice => {
            let notice: NoticeContent = parse(content)?;
            require("title", &notice.title)?;
            require("body", &notice.body)?;
            to_value(&notice)
        }
        BlockType::Custom => {
            let mut custom: CustomContent = parse(content)?;
            require("title", &custom.title)?;
            custom.body = ammonia::clean(&custom.body);
            to_value(&custom)
        }
    }
}
