//! AI-assisted guidebook drafting: listing intake, model client and the
//! per-guidebook generation state machine.

pub mod generation;
pub mod generator;
pub mod listing;
pub mod llm;

pub use generation::{
    registry, GenerationError, GenerationInput, GenerationState, GenerationStatus, JobRegistry,
    TransitionError,
};
pub use generator::{BlockGenerator, LlmBlockGenerator};
