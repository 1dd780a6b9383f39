use anyhow::{Context, Result};
use reqwest::Client;
use serde_json::json;

use super::{is_rate_limit_message, AiError, CompletionService, ServiceFactory};
use crate::config::SafetySetting;

/// Finish reasons Gemini uses when generation was cut off by a filter.
const BLOCKING_FINISH_REASONS: &[&str] = &["SAFETY", "PROHIBITED_CONTENT", "BLOCKLIST", "SPII"];

pub struct GeminiService {
    api_key: String,
    model: String,
    client: Client,
}

impl GeminiService {
    pub fn new(api_key: String, model: String) -> Result<Self> {
        if api_key.trim().is_empty() {
            anyhow::bail!("Gemini API key is empty");
        }
        let client = Client::builder()
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            api_key,
            model,
            client,
        })
    }
}

#[async_trait::async_trait]
impl CompletionService for GeminiService {
    fn name(&self) -> &str {
        "Gemini"
    }

    async fn complete(
        &self,
        prompt: &str,
        image_base64: &str,
        mime_type: &str,
        safety: &[SafetySetting],
    ) -> Result<String, AiError> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );

        let safety_settings: Vec<serde_json::Value> = safety
            .iter()
            .map(|s| {
                json!({
                    "category": s.category.wire_name(),
                    "threshold": s.threshold.wire_name(),
                })
            })
            .collect();

        let body = json!({
            "contents": [
                {
                    "parts": [
                        { "text": prompt },
                        {
                            "inline_data": {
                                "mime_type": mime_type,
                                "data": image_base64
                            }
                        }
                    ]
                }
            ],
            "safetySettings": safety_settings,
            "generationConfig": {
                "maxOutputTokens": 2048
            }
        });

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AiError::Transport(format!("Gemini request failed: {e}")))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| AiError::Transport(format!("Failed to read Gemini response: {e}")))?;

        if !status.is_success() {
            let message = format!("Gemini API error ({status}): {text}");
            if status.as_u16() == 429 || is_rate_limit_message(&text) {
                return Err(AiError::RateLimited(message));
            }
            return Err(AiError::Transport(message));
        }

        extract_completion_text(&text)
    }
}

/// Pull the completion text out of a successful `generateContent` reply,
/// mapping blocked prompts and empty candidate lists to [`AiError::Blocked`].
fn extract_completion_text(body: &str) -> Result<String, AiError> {
    let json: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| AiError::Transport(format!("Failed to parse Gemini response JSON: {e}")))?;

    if let Some(reason) = json["promptFeedback"]["blockReason"].as_str() {
        return Err(AiError::Blocked(reason.to_string()));
    }

    let candidates = match json["candidates"].as_array() {
        Some(c) if !c.is_empty() => c,
        _ => return Err(AiError::Blocked("no candidates returned".to_string())),
    };

    let candidate = &candidates[0];
    if let Some(reason) = candidate["finishReason"].as_str() {
        if BLOCKING_FINISH_REASONS.contains(&reason) {
            return Err(AiError::Blocked(reason.to_string()));
        }
    }

    let mut text = String::new();
    if let Some(parts) = candidate["content"]["parts"].as_array() {
        for part in parts {
            if let Some(t) = part["text"].as_str() {
                text.push_str(t);
            }
        }
    }

    if text.trim().is_empty() {
        return Err(AiError::Blocked("empty completion".to_string()));
    }

    Ok(text)
}

/// Builds [`GeminiService`] instances; this is what credential rotation calls
/// to re-configure the backend for a newly selected key.
pub struct GeminiServiceFactory;

impl ServiceFactory for GeminiServiceFactory {
    fn build(&self, credential: &str, model: &str) -> Result<Box<dyn CompletionService>> {
        Ok(Box::new(GeminiService::new(
            credential.to_string(),
            model.to_string(),
        )?))
    }
}
