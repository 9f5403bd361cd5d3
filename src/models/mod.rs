//! Rewrite backends.
//!
//! Each provider owns its own error classifier; the retry policy only sees
//! [`RewriteError`] classes.

pub mod dummy;
pub mod gemini;
pub mod openai;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::anyhow;
use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;

use crate::error::RewriteError;

pub use dummy::DummyBackend;
pub use gemini::GeminiBackend;
pub use openai::OpenAiBackend;

pub const DEFAULT_TIMEOUT_SECONDS: u64 = 300;

/// Per-call sampling parameters.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelParams {
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
}

/// The external rewrite operation.
pub trait RewriteBackend {
    fn name(&self) -> &str;

    /// Check required credentials before any fragment is sent.
    fn validate_environment(&self) -> Result<(), RewriteError> {
        Ok(())
    }

    fn rewrite(&mut self, system: &str, user: &str, params: &ModelParams) -> Result<String, RewriteError>;
}

/// Resolved settings for one provider table such as `[llm.openai]`.
#[derive(Clone, Debug, Default)]
pub struct ProviderSettings {
    pub params: ModelParams,
    pub base_url: Option<String>,
    pub timeout: Option<Duration>,
}

pub fn create_backend(provider: &str, settings: &ProviderSettings) -> anyhow::Result<Box<dyn RewriteBackend>> {
    let backend: Box<dyn RewriteBackend> = match provider.trim().to_ascii_lowercase().as_str() {
        "openai" => Box::new(OpenAiBackend::new(settings)?),
        "gemini" => Box::new(GeminiBackend::new(settings)?),
        "dummy" => Box::new(DummyBackend::new(settings.params.model.clone())),
        other => {
            return Err(anyhow!(
                "unknown llm provider {other:?} (expected openai, gemini or dummy)"
            ))
        }
    };
    log::debug!("rewrite backend: {}", backend.name());
    Ok(backend)
}

/// Load `KEY=VALUE` pairs from `<dir>/.env` without overriding variables already set.
/// Returns whether a file was loaded.
pub fn load_env_file(dir: &Path) -> bool {
    let path = dir.join(".env");
    if !path.is_file() {
        return false;
    }
    match dotenvy::from_path(&path) {
        Ok(()) => {
            log::debug!("loaded environment from {}", path.display());
            true
        }
        Err(err) => {
            log::warn!("ignoring {}: {err}", path.display());
            false
        }
    }
}

pub fn find_file_upwards(start_dir: &Path, filename: &str, max_levels: usize) -> Option<PathBuf> {
    let mut dir = start_dir;
    for _ in 0..=max_levels {
        let candidate = dir.join(filename);
        if candidate.exists() {
            return Some(candidate);
        }
        dir = dir.parent()?;
    }
    None
}

pub(crate) fn env_non_empty(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Keyword lists checked in order: rate limit, connection, auth; anything else is unknown.
pub(crate) struct Keywords {
    pub rate_limit: &'static [&'static str],
    pub connection: &'static [&'static str],
    pub auth: &'static [&'static str],
}

pub(crate) fn classify_with(keywords: &Keywords, message: &str) -> RewriteError {
    let lower = message.to_lowercase();
    let hit = |list: &[&str]| list.iter().any(|k| lower.contains(k));
    let msg = message.to_string();
    if hit(keywords.rate_limit) {
        RewriteError::RateLimit(msg)
    } else if hit(keywords.connection) {
        RewriteError::Connection(msg)
    } else if hit(keywords.auth) {
        RewriteError::Auth(msg)
    } else {
        RewriteError::Unknown(msg)
    }
}

/// A 2xx reply with no text in it: names the top-level keys and any status or finish reason.
pub(crate) fn missing_text_error(provider: &str, body: &Value) -> RewriteError {
    let keys: Vec<&str> = body
        .as_object()
        .map(|o| o.keys().map(String::as_str).collect())
        .unwrap_or_default();
    let mut msg = format!("{provider} response has no text (keys: [{}])", keys.join(", "));
    for pointer in [
        "/status",
        "/incomplete_details",
        "/promptFeedback/blockReason",
        "/candidates/0/finishReason",
    ] {
        if let Some(v) = body.pointer(pointer) {
            msg.push_str(&format!("; {}: {v}", pointer.trim_start_matches('/')));
        }
    }
    RewriteError::Unknown(msg)
}

pub(crate) fn http_client(timeout: Option<Duration>) -> anyhow::Result<Client> {
    let client = Client::builder()
        .timeout(timeout.unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECONDS)))
        .build()?;
    Ok(client)
}

/// POST a JSON payload and return the parsed JSON body. Failures come back as free text for
/// the provider classifier.
pub(crate) fn post_json(
    request: reqwest::blocking::RequestBuilder,
    payload: &Value,
) -> Result<Value, String> {
    let response = request
        .header(CONTENT_TYPE, "application/json")
        .body(payload.to_string())
        .send()
        .map_err(|err| {
            if err.is_timeout() {
                format!("timeout: {err}")
            } else if err.is_connect() {
                format!("connection error: {err}")
            } else {
                err.to_string()
            }
        })?;
    let status = response.status();
    let body = response
        .text()
        .map_err(|err| format!("connection error while reading body: {err}"))?;
    if !status.is_success() {
        return Err(format!("HTTP {}: {}", status.as_u16(), body.trim()));
    }
    serde_json::from_str(&body).map_err(|err| format!("invalid JSON response: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_provider_is_rejected() {
        let err = create_backend("llama", &ProviderSettings::default())
            .err()
            .unwrap();
        assert!(err.to_string().contains("unknown llm provider"));
    }

    #[test]
    fn textless_reply_names_its_shape() {
        let body = serde_json::json!({
            "status": "incomplete",
            "incomplete_details": {"reason": "max_output_tokens"},
            "output": []
        });
        let err = missing_text_error("openai", &body);
        assert!(matches!(err, RewriteError::Unknown(_)));
        let msg = err.message();
        assert!(msg.contains("keys: [incomplete_details, output, status]"), "{msg}");
        assert!(msg.contains("status: \"incomplete\""), "{msg}");
        assert!(msg.contains("max_output_tokens"), "{msg}");
    }

    #[test]
    fn dummy_provider_needs_no_credentials() {
        let backend = create_backend("Dummy", &ProviderSettings::default()).unwrap();
        assert_eq!(backend.name(), "dummy");
        assert!(backend.validate_environment().is_ok());
    }

    #[test]
    fn env_file_is_loaded_without_overriding() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(".env"),
            "export LECTURE_PIPELINE_TEST_A=\"from file\"\nLECTURE_PIPELINE_TEST_B=file\n",
        )
        .unwrap();
        std::env::set_var("LECTURE_PIPELINE_TEST_B", "shell");
        assert!(load_env_file(dir.path()));
        assert_eq!(std::env::var("LECTURE_PIPELINE_TEST_A").unwrap(), "from file");
        assert_eq!(std::env::var("LECTURE_PIPELINE_TEST_B").unwrap(), "shell");
        assert!(!load_env_file(&dir.path().join("missing")));
    }

    #[test]
    fn finds_files_in_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("marker.toml"), "").unwrap();
        assert_eq!(
            find_file_upwards(&nested, "marker.toml", 4),
            Some(dir.path().join("marker.toml"))
        );
        assert_eq!(find_file_upwards(&nested, "marker.toml", 1), None);
    }
}
