use reqwest::blocking::Client;
use serde_json::{json, Value};

use super::{
    classify_with, env_non_empty, http_client, missing_text_error, post_json, Keywords, ModelParams, ProviderSettings,
    RewriteBackend,
};
use crate::error::RewriteError;

pub const DEFAULT_MODEL: &str = "gpt-5.1";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";
pub const API_KEY_VAR: &str = "OPENAI_API_KEY";

const KEYWORDS: Keywords = Keywords {
    rate_limit: &["rate limit", "429", "too many requests", "retry in", "retry_after"],
    connection: &["timeout", "temporarily unavailable", "connection", "unavailable", "dns"],
    auth: &[
        "unauthorized",
        "invalid api key",
        "401",
        "permission",
        "forbidden",
        "payment required",
        "insufficient_quota",
        "insufficient quota",
        "insufficient funds",
        "billing",
        "subscription",
    ],
};

pub fn classify_error(message: &str) -> RewriteError {
    classify_with(&KEYWORDS, message)
}

/// OpenAI Responses API (`/v1/responses`).
pub struct OpenAiBackend {
    client: Client,
    base_url: String,
    defaults: ModelParams,
}

impl OpenAiBackend {
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

    fn payload(&self, system: &str, user: &str, params: &ModelParams) -> Value {
        let model = params
            .model
            .as_deref()
            .or(self.defaults.model.as_deref())
            .unwrap_or(DEFAULT_MODEL);
        let mut payload = json!({
            "model": model,
            "input": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });
        if let Some(t) = params.temperature.or(self.defaults.temperature) {
            payload["temperature"] = json!(t);
        }
        if let Some(p) = params.top_p.or(self.defaults.top_p) {
            payload["top_p"] = json!(p);
        }
        payload
    }
}

/// Text of a Responses API reply: `output_text`, else every `output[].content[].text`.
pub fn extract_output_text(json: &Value) -> Option<String> {
    if let Some(text) = json.get("output_text").and_then(Value::as_str) {
        return Some(text.to_string());
    }
    let mut chunks = Vec::new();
    for item in json.get("output").and_then(Value::as_array)? {
        let Some(content) = item.get("content").and_then(Value::as_array) else {
            continue;
        };
        for part in content {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                chunks.push(text);
            }
        }
    }
    (!chunks.is_empty()).then(|| chunks.join("\n"))
}

impl RewriteBackend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    fn validate_environment(&self) -> Result<(), RewriteError> {
        match env_non_empty(API_KEY_VAR) {
            Some(_) => Ok(()),
            None => Err(RewriteError::Auth(format!(
                "Missing {API_KEY_VAR} in environment (expected via .env or shell env)"
            ))),
        }
    }

    fn rewrite(&mut self, system: &str, user: &str, params: &ModelParams) -> Result<String, RewriteError> {
        let key = env_non_empty(API_KEY_VAR)
            .ok_or_else(|| RewriteError::Auth(format!("Missing {API_KEY_VAR}")))?;
        let url = format!("{}/v1/responses", self.base_url.trim_end_matches('/'));
        let request = self.client.post(url).bearer_auth(key);
        let body = post_json(request, &self.payload(system, user, params)).map_err(|m| classify_error(&m))?;
        extract_output_text(&body).ok_or_else(|| missing_text_error("openai", &body))
    }
}
