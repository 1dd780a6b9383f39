mod gemini;

pub use gemini::{GeminiService, GeminiServiceFactory};

use crate::config::SafetySetting;

/// Substrings in provider error text that signal quota exhaustion.
pub const RATE_LIMIT_MARKERS: &[&str] = &[
    "429",
    "Resource has been exhausted",
    "RESOURCE_EXHAUSTED",
    "quota",
];

/// Whether provider error text matches a known quota-exhaustion signal.
pub fn is_rate_limit_message(text: &str) -> bool {
    RATE_LIMIT_MARKERS.iter().any(|m| text.contains(m))
        || text.to_ascii_lowercase().contains("rate limit")
}

/// Structured failure of a completion call, classified at the service
/// boundary so the retry controller can react without string matching.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AiError {
    /// Quota exhausted on the active credential — recoverable by rotation.
    #[error("rate limited: {0}")]
    RateLimited(String),
    /// The prompt or the response was blocked (or came back empty); the block
    /// reason is carried verbatim. Never retried.
    #[error("content blocked: {0}")]
    Blocked(String),
    /// Anything else — network, protocol, unexpected payloads.
    #[error("{0}")]
    Transport(String),
}

/// Contract the pipeline needs from an AI completion backend: one prompt plus
/// inline image content plus a safety policy in, raw completion text out.
///
/// Interpreting the text (the `CAPTION:` / `TAGS:` structure) is the request
/// formatter's job, not the service's.
#[async_trait::async_trait]
pub trait CompletionService: Send + Sync {
    /// The display name of this service (e.g., "Gemini").
    fn name(&self) -> &str;

    /// Run one completion over a base64-encoded image.
    async fn complete(
        &self,
        prompt: &str,
        image_base64: &str,
        mime_type: &str,
        safety: &[SafetySetting],
    ) -> Result<String, AiError>;
}

/// Builds a configured [`CompletionService`] for one credential.
///
/// Construction may fail (malformed credential, client build error); the
/// credential store's rotation treats that as "skip to the next candidate".
pub trait ServiceFactory: Send + Sync {
    fn build(
        &self,
        credential: &str,
        model: &str,
    ) -> anyhow::Result<Box<dyn CompletionService>>;
}
