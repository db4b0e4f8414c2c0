use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};
use warden_core::{FilePatch, LlmConfig, ReviewConfig, WardenError};

use crate::llm::{ChatMessage, LlmClient};
use crate::prompt::{
    assemble_diff, bound_output, build_review_prompt, build_system_prompt, strip_code_fences,
};

/// Review posted when a change request carries no textual patch at all.
pub const NO_TEXTUAL_CHANGES: &str =
    "Warden found no textual changes to review (only binary or empty files changed).";

/// Facade over the text-generation engine.
///
/// Implementations bound their input (truncating at file boundaries), bound
/// their output, and fail with [`WardenError::GenerationTimeout`] instead of
/// hanging.
#[async_trait]
pub trait ReviewGenerator: Send + Sync {
    async fn generate(&self, files: &[FilePatch]) -> Result<String, WardenError>;
}

/// [`ReviewGenerator`] backed by an OpenAI-compatible chat model.
pub struct LlmReviewer {
    client: LlmClient,
    limits: ReviewConfig,
    timeout: Duration,
}

impl LlmReviewer {
    /// # Errors
    ///
    /// Returns [`WardenError::Config`] if the HTTP client cannot be built.
    pub fn new(llm: &LlmConfig, limits: &ReviewConfig) -> Result<Self, WardenError> {
        Ok(Self {
            client: LlmClient::new(llm)?,
            limits: limits.clone(),
            timeout: llm.timeout(),
        })
    }
}

#[async_trait]
impl ReviewGenerator for LlmReviewer {
    async fn generate(&self, files: &[FilePatch]) -> Result<String, WardenError> {
        if files.is_empty() {
            return Ok(bound_output(NO_TEXTUAL_CHANGES, self.limits.max_output_chars));
        }

        let diff = assemble_diff(files, self.limits.max_input_chars);
        if diff.is_truncated() {
            info!(
                omitted = diff.omitted.len(),
                cut = diff.cut.as_deref().unwrap_or(""),
                budget = self.limits.max_input_chars,
                "diff truncated for review"
            );
        }

        let messages = vec![
            ChatMessage::system(build_system_prompt()),
            ChatMessage::user(build_review_prompt(&diff.text)),
        ];
        debug!(model = self.client.model(), chars = diff.text.len(), "requesting review");

        let raw = tokio::time::timeout(self.timeout, self.client.chat(messages))
            .await
            .map_err(|_| WardenError::GenerationTimeout(self.timeout))??;

        let review = strip_code_fences(&raw);
        if review.is_empty() {
            return Err(WardenError::Transient("model returned an empty review".into()));
        }
        Ok(bound_output(review, self.limits.max_output_chars))
    }
}
