//! Per-guidebook AI generation state machine.
//!
//! Each guidebook has at most one job: `idle → loading → success | error`.
//! The pipeline runs on a spawned task and publishes progress by updating the
//! registry after every step; clients poll the snapshot. Cancelling drops the
//! in-flight future through a `CancellationToken`, and a run counter keeps a
//! stale pipeline from touching state that belongs to a newer run.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::generator::BlockGenerator;
use super::listing::{parse_listing_url, ListingDetails, ListingError};
use super::llm::LlmError;
use crate::blocks::{self, BlockType};

/// Steps that do work; `complete` only marks the end.
const WORK_STEPS: usize = 8;

// ============================================================================
// Steps and progress
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GenerationStep {
    #[serde(rename = "parsing")]
    Parsing,
    #[serde(rename = "analyzing")]
    Analyzing,
    #[serde(rename = "generating_hero")]
    GeneratingHero,
    #[serde(rename = "generating_quickInfo")]
    GeneratingQuickInfo,
    #[serde(rename = "generating_amenities")]
    GeneratingAmenities,
    #[serde(rename = "generating_rules")]
    GeneratingRules,
    #[serde(rename = "generating_notice")]
    GeneratingNotice,
    #[serde(rename = "generating_map")]
    GeneratingMap,
    #[serde(rename = "complete")]
    Complete,
}

impl GenerationStep {
    pub const ALL: [GenerationStep; 9] = [
        Self::Parsing,
        Self::Analyzing,
        Self::GeneratingHero,
        Self::GeneratingQuickInfo,
        Self::GeneratingAmenities,
        Self::GeneratingRules,
        Self::GeneratingNotice,
        Self::GeneratingMap,
        Self::Complete,
    ];
}

/// One LLM call per block type, in this order.
const BLOCK_STEPS: [(GenerationStep, BlockType); 6] = [
    (GenerationStep::GeneratingHero, BlockType::Hero),
    (GenerationStep::GeneratingQuickInfo, BlockType::QuickInfo),
    (GenerationStep::GeneratingAmenities, BlockType::Amenities),
    (GenerationStep::GeneratingRules, BlockType::Rules),
    (GenerationStep::GeneratingNotice, BlockType::Notice),
    (GenerationStep::GeneratingMap, BlockType::Map),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Loading,
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepProgress {
    pub step: GenerationStep,
    pub status: StepStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    pub percent: u8,
    pub steps: Vec<StepProgress>,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            percent: 0,
            steps: GenerationStep::ALL
                .iter()
                .map(|&step| StepProgress {
                    step,
                    status: StepStatus::Pending,
                })
                .collect(),
        }
    }
}

impl Progress {
    pub fn status_of(&self, step: GenerationStep) -> StepStatus {
        self.steps
            .iter()
            .find(|s| s.step == step)
            .map(|s| s.status)
            .unwrap_or(StepStatus::Pending)
    }

    fn set(&mut self, step: GenerationStep, status: StepStatus) {
        if let Some(entry) = self.steps.iter_mut().find(|s| s.step == step) {
            entry.status = status;
        }
        self.percent = self.compute_percent();
    }

    fn compute_percent(&self) -> u8 {
        if self.status_of(GenerationStep::Complete) == StepStatus::Success {
            return 100;
        }
        let done = self
            .steps
            .iter()
            .filter(|s| s.step != GenerationStep::Complete && s.status == StepStatus::Success)
            .count();
        (done * 100 / WORK_STEPS) as u8
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ApiKeyMissing,
    RateLimitExceeded,
    TokenLimitExceeded,
    ListingFetchFailed,
    InvalidAiResponse,
    GenerationFailed,
}

impl ErrorCode {
    /// A missing key will not fix itself on retry.
    pub fn retryable(&self) -> bool {
        !matches!(self, Self::ApiKeyMissing)
    }
}

/// Failure shown to the host as `{ code, message, retryable }`.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("{message}")]
pub struct GenerationError {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
}

impl GenerationError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: code.retryable(),
        }
    }
}

impl From<LlmError> for GenerationError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::MissingApiKey => {
                Self::new(ErrorCode::ApiKeyMissing, "AI API 키가 설정되지 않았습니다")
            }
            LlmError::InvalidApiKey => {
                Self::new(ErrorCode::ApiKeyMissing, "AI API 키가 올바르지 않습니다")
            }
            LlmError::RateLimited => Self::new(
                ErrorCode::RateLimitExceeded,
                "AI 요청 한도를 초과했습니다. 잠시 후 다시 시도해주세요",
            ),
            LlmError::MaxTokens => Self::new(
                ErrorCode::TokenLimitExceeded,
                "AI 응답이 너무 길어 중단되었습니다. 다시 시도해주세요",
            ),
            LlmError::Parse(_) => {
                Self::new(ErrorCode::InvalidAiResponse, "AI 응답을 해석할 수 없습니다")
            }
            LlmError::Transport(_) | LlmError::Timeout | LlmError::Http { .. } => {
                Self::new(ErrorCode::GenerationFailed, "AI 생성 중 오류가 발생했습니다")
            }
        }
    }
}

impl From<ListingError> for GenerationError {
    fn from(e: ListingError) -> Self {
        tracing::warn!("Listing fetch failed: {}", e);
        Self::new(
            ErrorCode::ListingFetchFailed,
            "숙소 페이지를 불러오지 못했습니다. URL을 확인하거나 직접 입력해주세요",
        )
    }
}

// ============================================================================
// Input
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ManualListing {
    pub title: String,
    pub description: String,
    pub address: String,
    pub check_in: Option<String>,
    pub check_out: Option<String>,
    pub amenities: Vec<String>,
    pub house_rules: Vec<String>,
    pub photos: Vec<String>,
}

impl ManualListing {
    pub fn into_details(self) -> ListingDetails {
        ListingDetails {
            title: self.title.trim().to_string(),
            description: self.description.trim().to_string(),
            address: self.address.trim().to_string(),
            check_in: self.check_in,
            check_out: self.check_out,
            amenities: self.amenities,
            house_rules: self.house_rules,
            photos: self.photos,
            source_url: None,
            page_text: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum GenerationInput {
    Url { url: String },
    Manual(ManualListing),
}

impl GenerationInput {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Url { url } => parse_listing_url(url)
                .map(|_| ())
                .map_err(|_| "올바른 숙소 URL(http/https)을 입력해주세요".to_string()),
            Self::Manual(listing) => {
                for (field, value) in [
                    ("숙소 이름", &listing.title),
                    ("숙소 설명", &listing.description),
                    ("주소", &listing.address),
                ] {
                    if value.trim().is_empty() {
                        return Err(format!("{}을(를) 입력해주세요", field));
                    }
                }
                Ok(())
            }
        }
    }
}

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationStatus {
    Idle,
    Loading,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DraftBlock {
    #[serde(rename = "type")]
    pub block_type: BlockType,
    pub content: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationState {
    pub status: GenerationStatus,
    pub progress: Progress,
    pub blocks: Vec<DraftBlock>,
    pub error: Option<GenerationError>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Default for GenerationState {
    fn default() -> Self {
        Self {
            status: GenerationStatus::Idle,
            progress: Progress::default(),
            blocks: Vec::new(),
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("generation already in progress")]
    InProgress,
    #[error("no generated blocks to commit")]
    NoBlocks,
    #[error("{0}")]
    InvalidSelection(String),
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Default)]
struct Job {
    state: GenerationState,
    run: u64,
    cancel: Option<CancellationToken>,
}

/// Drafts removed from the registry for a commit.
pub struct TakenDrafts {
    pub blocks: Vec<DraftBlock>,
    job: Job,
}

/// In-process generation jobs keyed by guidebook id. A missing entry is
/// the idle state.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<Uuid, Job>>,
    runs: AtomicU64,
}

lazy_static::lazy_static! {
    static ref REGISTRY: Arc<JobRegistry> = Arc::new(JobRegistry::default());
    /// (user, "YYYY-MM") -> generations started
    static ref MONTHLY_USAGE: Mutex<HashMap<(Uuid, String), u32>> = Mutex::new(HashMap::new());
}

pub fn registry() -> Arc<JobRegistry> {
    Arc::clone(&REGISTRY)
}

impl JobRegistry {
    pub async fn snapshot(&self, guidebook_id: Uuid) -> GenerationState {
        self.jobs
            .read()
            .await
            .get(&guidebook_id)
            .map(|job| job.state.clone())
            .unwrap_or_default()
    }

    /// Begin a run. Finished runs (success or error) are discarded first.
    pub async fn start(
        self: &Arc<Self>,
        guidebook_id: Uuid,
        input: GenerationInput,
        generator: Arc<dyn BlockGenerator>,
    ) -> Result<GenerationState, TransitionError> {
        let token = CancellationToken::new();
        let run = self.runs.fetch_add(1, Ordering::Relaxed) + 1;

        let snapshot = {
            let mut jobs = self.jobs.write().await;
            let job = jobs.entry(guidebook_id).or_default();
            if job.state.status == GenerationStatus::Loading {
                return Err(TransitionError::InProgress);
            }
            job.state = GenerationState {
                status: GenerationStatus::Loading,
                started_at: Some(Utc::now()),
                ..Default::default()
            };
            job.run = run;
            job.cancel = Some(token.clone());
            job.state.clone()
        };

        tracing::info!(guidebook_id = %guidebook_id, run, "AI generation started");

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!(guidebook_id = %guidebook_id, run, "AI generation cancelled");
                }
                _ = registry.run_pipeline(guidebook_id, run, input, generator) => {}
            }
        });

        Ok(snapshot)
    }

    /// `loading → idle`; any other state is returned unchanged. Idle jobs
    /// are dropped from the registry.
    pub async fn cancel(&self, guidebook_id: Uuid) -> GenerationState {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get(&guidebook_id) else {
            return GenerationState::default();
        };
        if job.state.status != GenerationStatus::Loading {
            return job.state.clone();
        }
        if let Some(token) = jobs.remove(&guidebook_id).and_then(|job| job.cancel) {
            token.cancel();
        }
        GenerationState::default()
    }

    /// `success | error → idle`.
    pub async fn reset(&self, guidebook_id: Uuid) -> Result<GenerationState, TransitionError> {
        let mut jobs = self.jobs.write().await;
        if jobs
            .get(&guidebook_id)
            .is_some_and(|job| job.state.status == GenerationStatus::Loading)
        {
            return Err(TransitionError::InProgress);
        }
        jobs.remove(&guidebook_id);
        Ok(GenerationState::default())
    }

    /// Forget a guidebook's job, cancelling it if it is still running.
    pub async fn discard(&self, guidebook_id: Uuid) {
        let removed = self.jobs.write().await.remove(&guidebook_id);
        if let Some(token) = removed.and_then(|job| job.cancel) {
            token.cancel();
        }
    }

    /// Take the drafts picked for commit, in generated order, leaving the job
    /// idle so a concurrent commit finds nothing. Duplicate indices are
    /// ignored. Hand the result to [`JobRegistry::restore`] if the commit
    /// fails.
    pub async fn take_selected(
        &self,
        guidebook_id: Uuid,
        selected: &[usize],
    ) -> Result<TakenDrafts, TransitionError> {
        let mut jobs = self.jobs.write().await;
        let state = match jobs.get(&guidebook_id) {
            Some(job) if job.state.status == GenerationStatus::Success => &job.state,
            _ => return Err(TransitionError::NoBlocks),
        };

        if selected.is_empty() {
            return Err(TransitionError::InvalidSelection(
                "추가할 블록을 하나 이상 선택해주세요".to_string(),
            ));
        }
        if let Some(bad) = selected.iter().find(|&&i| i >= state.blocks.len()) {
            return Err(TransitionError::InvalidSelection(format!(
                "존재하지 않는 블록 번호입니다: {}",
                bad
            )));
        }

        let mut indices = selected.to_vec();
        indices.sort_unstable();
        indices.dedup();
        let blocks = indices.into_iter().map(|i| state.blocks[i].clone()).collect();

        let Some(job) = jobs.remove(&guidebook_id) else {
            return Err(TransitionError::NoBlocks);
        };
        Ok(TakenDrafts { blocks, job })
    }

    /// Put back drafts from a failed commit, unless a new run has started
    /// in the meantime.
    pub async fn restore(&self, guidebook_id: Uuid, taken: TakenDrafts) {
        self.jobs
            .write()
            .await
            .entry(guidebook_id)
            .or_insert(taken.job);
    }

    /// Apply `f` if `run` is still the live run for this guidebook.
    async fn update(&self, guidebook_id: Uuid, run: u64, f: impl FnOnce(&mut GenerationState)) {
        let mut jobs = self.jobs.write().await;
        if let Some(job) = jobs.get_mut(&guidebook_id) {
            if job.run == run && job.state.status == GenerationStatus::Loading {
                f(&mut job.state);
            }
        }
    }

    async fn mark(&self, guidebook_id: Uuid, run: u64, step: GenerationStep, status: StepStatus) {
        self.update(guidebook_id, run, |state| state.progress.set(step, status))
            .await;
    }

    async fn run_pipeline(
        &self,
        guidebook_id: Uuid,
        run: u64,
        input: GenerationInput,
        generator: Arc<dyn BlockGenerator>,
    ) {
        let outcome = self
            .pipeline(guidebook_id, run, &input, generator.as_ref())
            .await;

        match outcome {
            Ok(drafts) => {
                tracing::info!(guidebook_id = %guidebook_id, run, blocks = drafts.len(), "AI generation finished");
                self.update(guidebook_id, run, move |state| {
                    state.progress.set(GenerationStep::Complete, StepStatus::Success);
                    state.status = GenerationStatus::Success;
                    state.blocks = drafts;
                    state.finished_at = Some(Utc::now());
                })
                .await;
            }
            Err((step, error)) => {
                tracing::warn!(
                    guidebook_id = %guidebook_id,
                    run,
                    step = ?step,
                    code = ?error.code,
                    "AI generation failed: {}",
                    error
                );
                self.update(guidebook_id, run, move |state| {
                    state.progress.set(step, StepStatus::Error);
                    state.status = GenerationStatus::Error;
                    state.error = Some(error);
                    state.finished_at = Some(Utc::now());
                })
                .await;
            }
        }
    }

    async fn pipeline(
        &self,
        guidebook_id: Uuid,
        run: u64,
        input: &GenerationInput,
        generator: &dyn BlockGenerator,
    ) -> Result<Vec<DraftBlock>, (GenerationStep, GenerationError)> {
        use GenerationStep::*;

        self.mark(guidebook_id, run, Parsing, StepStatus::Loading).await;
        let listing = generator
            .parse_listing(input)
            .await
            .map_err(|e| (Parsing, e))?;
        self.mark(guidebook_id, run, Parsing, StepStatus::Success).await;

        self.mark(guidebook_id, run, Analyzing, StepStatus::Loading).await;
        let profile = generator
            .analyze(&listing)
            .await
            .map_err(|e| (Analyzing, e))?;
        self.mark(guidebook_id, run, Analyzing, StepStatus::Success).await;

        let mut drafts = Vec::with_capacity(BLOCK_STEPS.len() + 1);
        for (step, block_type) in BLOCK_STEPS {
            self.mark(guidebook_id, run, step, StepStatus::Loading).await;
            let raw = generator
                .generate_block(block_type, &listing, &profile)
                .await
                .map_err(|e| (step, e))?;
            let content = blocks::validate_content(block_type, raw).map_err(|reason| {
                tracing::debug!(block_type = %block_type, "Rejected generated content: {}", reason);
                (
                    step,
                    GenerationError::new(
                        ErrorCode::InvalidAiResponse,
                        "AI가 만든 블록 내용이 올바르지 않습니다. 다시 시도해주세요",
                    ),
                )
            })?;
            drafts.push(DraftBlock {
                block_type,
                content,
            });
            self.mark(guidebook_id, run, step, StepStatus::Success).await;
        }

        if let Some(gallery) = gallery_draft(&listing.photos) {
            // Photos sit right under the hero.
            drafts.insert(1, gallery);
        }

        Ok(drafts)
    }
}

/// Gallery block built straight from photo URLs, no model call.
fn gallery_draft(photos: &[String]) -> Option<DraftBlock> {
    let images: Vec<Value> = photos
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(|url| json!({ "url": url }))
        .collect();
    if images.is_empty() {
        return None;
    }
    Some(DraftBlock {
        block_type: BlockType::Gallery,
        content: json!({ "images": images }),
    })
}

// ============================================================================
// Monthly allowance
// ============================================================================

fn month_key() -> String {
    Utc::now().format("%Y-%m").to_string()
}

pub fn generations_this_month(user_id: Uuid) -> u32 {
    let usage = MONTHLY_USAGE.lock().unwrap_or_else(|e| e.into_inner());
    usage.get(&(user_id, month_key())).copied().unwrap_or(0)
}

pub fn record_generation(user_id: Uuid) {
    let mut usage = MONTHLY_USAGE.lock().unwrap_or_else(|e| e.into_inner());
    let key = month_key();
    usage.retain(|(_, month), _| *month == key);
    *usage.entry((user_id, key)).or_insert(0) += 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Scripted generator: optional failure at one block type, optional
    /// delay in analysis, optional broken content.
    #[derive(Default)]
    struct FakeGenerator {
        fail_on: Option<(BlockType, LlmError)>,
        analyze_delay: Option<Duration>,
        broken_hero: bool,
    }

    #[async_trait]
    impl BlockGenerator for FakeGenerator {
        async fn analyze(&self, listing: &ListingDetails) -> Result<Value, GenerationError> {
            if let Some(delay) = self.analyze_delay {
                tokio::time::sleep(delay).await;
            }
            Ok(json!({ "summary": listing.title }))
        }

        async fn generate_block(
            &self,
            block_type: BlockType,
            listing: &ListingDetails,
            _profile: &Value,
        ) -> Result<Value, GenerationError> {
            if let Some((failing, err)) = &self.fail_on {
                if *failing == block_type {
                    return Err(err.clone().into());
                }
            }
            Ok(match block_type {
                BlockType::Hero if self.broken_hero => json!({ "subtitle": "no title" }),
                BlockType::Hero => json!({ "title": listing.title }),
                BlockType::QuickInfo => json!({ "checkIn": "15:00", "checkOut": "11:00" }),
                BlockType::Amenities => json!({ "items": [{ "name": "Wi-Fi" }] }),
                BlockType::Rules => json!({ "items": [{ "text": "실내 금연" }] }),
                BlockType::Notice => json!({ "title": "안내", "body": "체크아웃 시 문을 잠가주세요" }),
                BlockType::Map => json!({ "address": listing.address }),
                _ => json!({}),
            })
        }
    }

    fn manual_input(photos: &[&str]) -> GenerationInput {
        GenerationInput::Manual(ManualListing {
            title: "바다 앞 독채".to_string(),
            description: "애월 해변 도보 3분".to_string(),
            address: "제주 애월읍 123".to_string(),
            photos: photos.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        })
    }

    async fn settle(registry: &JobRegistry, id: Uuid) -> GenerationState {
        for _ in 0..500 {
            let state = registry.snapshot(id).await;
            if state.status != GenerationStatus::Loading {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("generation did not settle");
    }

    #[test]
    fn test_step_names() {
        let names: Vec<String> = GenerationStep::ALL
            .iter()
            .map(|s| serde_json::to_value(s).unwrap().as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "parsing",
                "analyzing",
                "generating_hero",
                "generating_quickInfo",
                "generating_amenities",
                "generating_rules",
                "generating_notice",
                "generating_map",
                "complete",
            ]
        );
    }

    #[test]
    fn test_percent_counts_work_steps() {
        let mut progress = Progress::default();
        assert_eq!(progress.percent, 0);
        progress.set(GenerationStep::Parsing, StepStatus::Success);
        assert_eq!(progress.percent, 12);
        progress.set(GenerationStep::Analyzing, StepStatus::Success);
        progress.set(GenerationStep::GeneratingHero, StepStatus::Loading);
        assert_eq!(progress.percent, 25);
        progress.set(GenerationStep::Complete, StepStatus::Success);
        assert_eq!(progress.percent, 100);
    }

    #[test]
    fn test_error_codes_and_retryability() {
        let missing: GenerationError = LlmError::MissingApiKey.into();
        assert_eq!(missing.code, ErrorCode::ApiKeyMissing);
        assert!(!missing.retryable);

        let limited: GenerationError = LlmError::RateLimited.into();
        assert_eq!(limited.code, ErrorCode::RateLimitExceeded);
        assert!(limited.retryable);

        let truncated: GenerationError = LlmError::MaxTokens.into();
        assert_eq!(truncated.code, ErrorCode::TokenLimitExceeded);

        let garbled: GenerationError = LlmError::Parse("eof".into()).into();
        assert_eq!(garbled.code, ErrorCode::InvalidAiResponse);

        let fetch: GenerationError = ListingError::Status(404).into();
        assert_eq!(fetch.code, ErrorCode::ListingFetchFailed);
        assert!(fetch.retryable);

        let value = serde_json::to_value(&limited).unwrap();
        assert_eq!(value["code"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(value["retryable"], true);
    }

    #[test]
    fn test_input_validation() {
        let url: GenerationInput =
            serde_json::from_value(json!({ "mode": "url", "url": "https://airbnb.com/rooms/1" }))
                .unwrap();
        assert!(url.validate().is_ok());

        let bad_url: GenerationInput =
            serde_json::from_value(json!({ "mode": "url", "url": "airbnb" })).unwrap();
        assert!(bad_url.validate().is_err());

        let missing_address: GenerationInput = serde_json::from_value(json!({
            "mode": "manual",
            "title": "Loft",
            "description": "Nice"
        }))
        .unwrap();
        assert!(missing_address.validate().is_err());

        assert!(manual_input(&[]).validate().is_ok());
    }

    #[tokio::test]
    async fn test_successful_run_produces_drafts() {
        let registry = Arc::new(JobRegistry::default());
        let id = Uuid::new_v4();

        let started = registry
            .start(id, manual_input(&[]), Arc::new(FakeGenerator::default()))
            .await
            .unwrap();
        assert_eq!(started.status, GenerationStatus::Loading);

        let state = settle(&registry, id).await;
        assert_eq!(state.status, GenerationStatus::Success);
        assert_eq!(state.progress.percent, 100);
        assert!(state.progress.steps.iter().all(|s| s.status == StepStatus::Success));
        assert!(state.error.is_none());

        let types: Vec<BlockType> = state.blocks.iter().map(|b| b.block_type).collect();
        assert_eq!(
            types,
            vec![
                BlockType::Hero,
                BlockType::QuickInfo,
                BlockType::Amenities,
                BlockType::Rules,
                BlockType::Notice,
                BlockType::Map,
            ]
        );
        assert_eq!(state.blocks[0].content["title"], "바다 앞 독채");
    }

    #[tokio::test]
    async fn test_photos_become_gallery_without_model_call() {
        let registry = Arc::new(JobRegistry::default());
        let id = Uuid::new_v4();
        registry
            .start(
                id,
                manual_input(&["https://img.example.com/a.jpg", " "]),
                Arc::new(FakeGenerator::default()),
            )
            .await
            .unwrap();

        let state = settle(&registry, id).await;
        assert_eq!(state.blocks.len(), 7);
        assert_eq!(state.blocks[1].block_type, BlockType::Gallery);
        assert_eq!(
            state.blocks[1].content["images"],
            json!([{ "url": "https://img.example.com/a.jpg" }])
        );
    }

    #[tokio::test]
    async fn test_failure_marks_failed_step_only() {
        let registry = Arc::new(JobRegistry::default());
        let id = Uuid::new_v4();
        let generator = FakeGenerator {
            fail_on: Some((BlockType::Rules, LlmError::RateLimited)),
            ..Default::default()
        };
        registry
            .start(id, manual_input(&[]), Arc::new(generator))
            .await
            .unwrap();

        let state = settle(&registry, id).await;
        assert_eq!(state.status, GenerationStatus::Error);
        let error = state.error.clone().unwrap();
        assert_eq!(error.code, ErrorCode::RateLimitExceeded);
        assert!(error.retryable);

        use GenerationStep::*;
        for step in [Parsing, Analyzing, GeneratingHero, GeneratingQuickInfo, GeneratingAmenities] {
            assert_eq!(state.progress.status_of(step), StepStatus::Success, "{:?}", step);
        }
        assert_eq!(state.progress.status_of(GeneratingRules), StepStatus::Error);
        for step in [GeneratingNotice, GeneratingMap, Complete] {
            assert_eq!(state.progress.status_of(step), StepStatus::Pending, "{:?}", step);
        }
        assert_eq!(state.progress.percent, 62);
        assert!(state.blocks.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_model_content_is_reported() {
        let registry = Arc::new(JobRegistry::default());
        let id = Uuid::new_v4();
        let generator = FakeGenerator {
            broken_hero: true,
            ..Default::default()
        };
        registry
            .start(id, manual_input(&[]), Arc::new(generator))
            .await
            .unwrap();

        let state = settle(&registry, id).await;
        assert_eq!(state.error.unwrap().code, ErrorCode::InvalidAiResponse);
        assert_eq!(
            state.progress.status_of(GenerationStep::GeneratingHero),
            StepStatus::Error
        );
    }

    #[tokio::test]
    async fn test_second_start_while_loading_is_rejected() {
        let registry = Arc::new(JobRegistry::default());
        let id = Uuid::new_v4();
        let slow = || {
            Arc::new(FakeGenerator {
                analyze_delay: Some(Duration::from_secs(30)),
                ..Default::default()
            })
        };

        registry.start(id, manual_input(&[]), slow()).await.unwrap();
        let second = registry.start(id, manual_input(&[]), slow()).await;
        assert_eq!(second.unwrap_err(), TransitionError::InProgress);
        assert_eq!(
            registry.reset(id).await.unwrap_err(),
            TransitionError::InProgress
        );

        let cancelled = registry.cancel(id).await;
        assert_eq!(cancelled.status, GenerationStatus::Idle);
        assert_eq!(cancelled.progress.percent, 0);

        // Give the dropped pipeline a chance to misbehave.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.snapshot(id).await.status, GenerationStatus::Idle);
    }

    #[tokio::test]
    async fn test_cancel_when_idle_is_a_no_op() {
        let registry = JobRegistry::default();
        let state = registry.cancel(Uuid::new_v4()).await;
        assert_eq!(state.status, GenerationStatus::Idle);
    }

    #[tokio::test]
    async fn test_restart_after_error_resets_implicitly() {
        let registry = Arc::new(JobRegistry::default());
        let id = Uuid::new_v4();
        let failing = FakeGenerator {
            fail_on: Some((BlockType::Hero, LlmError::MaxTokens)),
            ..Default::default()
        };
        registry
            .start(id, manual_input(&[]), Arc::new(failing))
            .await
            .unwrap();
        assert_eq!(settle(&registry, id).await.status, GenerationStatus::Error);

        let restarted = registry
            .start(id, manual_input(&[]), Arc::new(FakeGenerator::default()))
            .await
            .unwrap();
        assert_eq!(restarted.status, GenerationStatus::Loading);
        assert!(restarted.error.is_none());
        assert_eq!(settle(&registry, id).await.status, GenerationStatus::Success);
    }

    #[tokio::test]
    async fn test_reset_returns_to_idle() {
        let registry = Arc::new(JobRegistry::default());
        let id = Uuid::new_v4();
        let failing = FakeGenerator {
            fail_on: Some((BlockType::Map, LlmError::Timeout)),
            ..Default::default()
        };
        registry
            .start(id, manual_input(&[]), Arc::new(failing))
            .await
            .unwrap();
        settle(&registry, id).await;

        let state = registry.reset(id).await.unwrap();
        assert_eq!(state.status, GenerationStatus::Idle);
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn test_commit_selection_rules() {
        let registry = Arc::new(JobRegistry::default());
        let id = Uuid::new_v4();

        assert_eq!(
            registry.take_selected(id, &[0]).await.err(),
            Some(TransitionError::NoBlocks)
        );

        registry
            .start(id, manual_input(&[]), Arc::new(FakeGenerator::default()))
            .await
            .unwrap();
        settle(&registry, id).await;

        assert!(matches!(
            registry.take_selected(id, &[]).await,
            Err(TransitionError::InvalidSelection(_))
        ));
        assert!(matches!(
            registry.take_selected(id, &[0, 6]).await,
            Err(TransitionError::InvalidSelection(_))
        ));
        assert_eq!(registry.snapshot(id).await.status, GenerationStatus::Success);

        let picked = registry.take_selected(id, &[5, 0, 5]).await.unwrap();
        let types: Vec<BlockType> = picked.blocks.iter().map(|b| b.block_type).collect();
        assert_eq!(types, vec![BlockType::Hero, BlockType::Map]);
        assert_eq!(registry.snapshot(id).await.status, GenerationStatus::Idle);
        assert!(registry.jobs.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_drafts_can_only_be_taken_once() {
        let registry = Arc::new(JobRegistry::default());
        let id = Uuid::new_v4();
        registry
            .start(id, manual_input(&[]), Arc::new(FakeGenerator::default()))
            .await
            .unwrap();
        settle(&registry, id).await;

        let (first, second) = tokio::join!(
            registry.take_selected(id, &[0]),
            registry.take_selected(id, &[0])
        );
        assert!(first.is_ok() != second.is_ok());
        let taken = first.or(second).unwrap();

        // A failed commit puts the drafts back.
        registry.restore(id, taken).await;
        let state = registry.snapshot(id).await;
        assert_eq!(state.status, GenerationStatus::Success);
        assert_eq!(state.blocks.len(), 6);
    }

    #[tokio::test]
    async fn test_idle_jobs_leave_the_registry() {
        let registry = Arc::new(JobRegistry::default());
        let id = Uuid::new_v4();
        let slow = FakeGenerator {
            analyze_delay: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        registry
            .start(id, manual_input(&[]), Arc::new(slow))
            .await
            .unwrap();
        registry.cancel(id).await;
        assert!(registry.jobs.read().await.is_empty());

        registry
            .start(id, manual_input(&[]), Arc::new(FakeGenerator::default()))
            .await
            .unwrap();
        settle(&registry, id).await;
        registry.reset(id).await.unwrap();
        assert!(registry.jobs.read().await.is_empty());

        let other = Uuid::new_v4();
        registry
            .start(other, manual_input(&[]), Arc::new(FakeGenerator::default()))
            .await
            .unwrap();
        registry.discard(other).await;
        assert!(registry.jobs.read().await.is_empty());
        assert_eq!(registry.snapshot(other).await.status, GenerationStatus::Idle);
    }

    #[test]
    fn test_monthly_usage_counter() {
        let user = Uuid::new_v4();
        assert_eq!(generations_this_month(user), 0);
        record_generation(user);
        record_generation(user);
        assert_eq!(generations_this_month(user), 2);
        assert_eq!(generations_this_month(Uuid::new_v4()), 0);
    }
}
