use super::{ModelParams, RewriteBackend};
use crate::error::RewriteError;

/// Offline backend that echoes the user prompt; for dry runs and tests.
pub struct DummyBackend {
    model: Option<String>,
}

impl DummyBackend {
    pub fn new(model: Option<String>) -> Self {
        Self { model }
    }
}

impl RewriteBackend for DummyBackend {
    fn name(&self) -> &str {
        "dummy"
    }

    fn rewrite(&mut self, _system: &str, user: &str, params: &ModelParams) -> Result<String, RewriteError> {
        let model = params
            .model
            .as_deref()
            .or(self.model.as_deref())
            .unwrap_or("n/a");
        Ok(format!("[DUMMY:{model}] {user}"))
    }
}
