use reqwest::blocking::Client;
use serde_json::{json, Value};

use super::{
    classify_with, env_non_empty, http_client, missing_text_error, post_json, Keywords, ModelParams, ProviderSettings,
    RewriteBackend,
};
use crate::error::RewriteError;

pub const DEFAULT_MODEL: &str = "gemini-1.5-pro";
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const API_KEY_VAR: &str = "GOOGLE_API_KEY";

const KEYWORDS: Keywords = Keywords {
    rate_limit: &[
        "rate limit",
        "429",
        "resourceexhausted",
        "resource_exhausted",
        "too many requests",
        "retry in",
        "retry_delay",
    ],
    connection: &[
        "deadline exceeded",
        "timeout",
        "temporarily unavailable",
        "connection",
        "unavailable",
        "dns",
    ],
    auth: &[
        "unauthenticated",
        "invalid api key",
        "401",
        "permission",
        "api key not valid",
        "forbidden",
        "billing",
        "payment",
        "insufficient funds",
        "subscription",
    ],
};

pub fn classify_error(message: &str) -> RewriteError {
    classify_with(&KEYWORDS, message)
}

/// Gemini `generateContent` with a system instruction.
pub struct GeminiBackend {
    client: Client,
    base_url: String,
    defaults: ModelParams,
}

impl GeminiBackend {
    pub fn new(settings: &ProviderSettings) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client(settings.timeout)?,
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            defaults: settings.params.clone(),
        })
    }

    fn model<'a>(&'a self, params: &'a ModelParams) -> &'a str {
        params
            .model
            .as_deref()
            .or(self.defaults.model.as_deref())
            .unwrap_or(DEFAULT_MODEL)
    }

    fn payload(&self, system: &str, user: &str, params: &ModelParams) -> Value {
        let mut generation = serde_json::Map::new();
        if let Some(t) = params.temperature.or(self.defaults.temperature) {
            generation.insert("temperature".into(), json!(t));
        }
        if let Some(p) = params.top_p.or(self.defaults.top_p) {
            generation.insert("topP".into(), json!(p));
        }
        let mut payload = json!({
            "contents": [
                {"role": "user", "parts": [{"text": user}]}
            ],
        });
        if !system.trim().is_empty() {
            payload["system_instruction"] = json!({"parts": [{"text": system}]});
        }
        if !generation.is_empty() {
            payload["generationConfig"] = Value::Object(generation);
        }
        payload
    }
}

fn api_key() -> Option<String> {
    env_non_empty(API_KEY_VAR).or_else(|| env_non_empty("GEMINI_API_KEY"))
}

/// Concatenated text parts of the first candidate.
pub fn extract_candidate_text(json: &Value) -> Option<String> {
    let parts = json
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|arr| arr.first())
        .and_then(|v| v.get("content"))
        .and_then(|v| v.get("parts"))
        .and_then(Value::as_array)?;
    let texts: Vec<&str> = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect();
    (!texts.is_empty()).then(|| texts.concat())
}

impl RewriteBackend for GeminiBackend {
    fn name(&self) -> &str {
        "gemini"
    }

    fn validate_environment(&self) -> Result<(), RewriteError> {
        match api_key() {
            Some(_) => Ok(()),
            None => Err(RewriteError::Auth(format!(
                "Missing {API_KEY_VAR} in environment (expected via .env or shell env)"
            ))),
        }
    }

    fn rewrite(&mut self, system: &str, user: &str, params: &ModelParams) -> Result<String, RewriteError> {
        let key = api_key().ok_or_else(|| RewriteError::Auth(format!("Missing {API_KEY_VAR}")))?;
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model(params)
        );
        let request = self.client.post(url).header("x-goog-api-key", key);
        let body = post_json(request, &self.payload(system, user, params)).map_err(|m| classify_error(&m))?;
        extract_candidate_text(&body).ok_or_else(|| missing_text_error("gemini", &body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_gemini_messages() {
        assert!(matches!(
            classify_error("HTTP 429: {\"status\": \"RESOURCE_EXHAUSTED\"} retry_delay { seconds: 30 }"),
            RewriteError::RateLimit(_)
        ));
        assert!(matches!(classify_error("504 Deadline Exceeded"), RewriteError::Connection(_)));
        assert!(matches!(
            classify_error("HTTP 400: API key not valid. Please pass a valid API key."),
            RewriteError::Auth(_)
        ));
        assert!(matches!(classify_error("safety block"), RewriteError::Unknown(_)));
    }

    #[test]
    fn joins_candidate_parts() {
        let body = json!({
            "candidates": [{"content": {"parts": [{"text": "Hel"}, {"text": "lo"}]}}]
        });
        assert_eq!(extract_candidate_text(&body).as_deref(), Some("Hello"));
        assert_eq!(extract_candidate_text(&json!({"candidates": []})), None);
    }

    #[test]
    fn payload_carries_system_instruction_and_config() {
        let backend = GeminiBackend::new(&ProviderSettings::default()).unwrap();
        let params = ModelParams {
            temperature: Some(0.2),
            top_p: Some(0.9),
            ..ModelParams::default()
        };
        let p = backend.payload("be terse", "text", &params);
        assert_eq!(p["system_instruction"]["parts"][0]["text"], "be terse");
        assert_eq!(p["generationConfig"]["topP"], 0.9);
        assert_eq!(backend.model(&params), DEFAULT_MODEL);
    }
}
