//! Adapter interfaces for external systems.
//!
//! Stage processors talk to a generative service only through the
//! [`Generator`] trait, so the pipeline runs unchanged against the real
//! Messages API, the offline generator, or a scripted test double.

pub mod anthropic;
pub mod offline;

use anyhow::Result;
use async_trait::async_trait;

use crate::domain::StageName;

pub use anthropic::{AnthropicConfig, AnthropicGenerator};
pub use offline::OfflineGenerator;

/// A single request to the generative service
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Stage the request is made for (used by routing doubles and logs)
    pub stage: StageName,

    /// System prompt
    pub system: String,

    /// User prompt
    pub prompt: String,

    /// Output budget
    pub max_tokens: u32,
}

/// Output from a generation call
#[derive(Debug, Clone, Default)]
pub struct GenerationOutput {
    /// Raw generated text
    pub text: String,

    /// Prompt tokens used (if reported)
    pub input_tokens: u64,

    /// Completion tokens used (if reported)
    pub output_tokens: u64,
}

impl GenerationOutput {
    /// Create an output with just text
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// Trait for generative backends
#[async_trait]
pub trait Generator: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    /// Generate text for a request
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput>;
}
