//! Generator used when no generative service is configured.
//!
//! Every call fails, which routes each stage through its deterministic
//! fallback artifact.

use anyhow::Result;
use async_trait::async_trait;

use super::{GenerationOutput, GenerationRequest, Generator};

#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineGenerator;

impl OfflineGenerator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Generator for OfflineGenerator {
    fn name(&self) -> &str {
        "offline"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput> {
        anyhow::bail!(
            "no generation provider configured (stage {})",
            request.stage
        )
    }
}
