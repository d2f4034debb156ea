//! Scripted LLM for deterministic pipeline tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use common::{error::AppError, llm::LlmClient};
use serde_json::Value;

/// Replays canned structured responses keyed by schema name. Schemas without
/// a script behave like an outage, which exercises the degraded paths.
pub struct ScriptedLlm {
    structured: Mutex<HashMap<String, String>>,
    plain: Mutex<Option<String>>,
    offline: bool,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self {
            structured: Mutex::new(HashMap::new()),
            plain: Mutex::new(None),
            offline: false,
        }
    }

    pub fn offline() -> Self {
        Self {
            structured: Mutex::new(HashMap::new()),
            plain: Mutex::new(None),
            offline: true,
        }
    }

    pub fn with_response(self, schema_name: &str, response: String) -> Self {
        self.structured
            .lock()
            .expect("script lock")
            .insert(schema_name.to_string(), response);
        self
    }

    pub fn with_plain_response(self, response: String) -> Self {
        *self.plain.lock().expect("script lock") = Some(response);
        self
    }
}

impl Default for ScriptedLlm {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, _system: &str, _user: &str) -> Result<String, AppError> {
        if self.offline {
            return Err(AppError::DependencyUnavailable("scripted llm offline".into()));
        }
        self.plain
            .lock()
            .expect("script lock")
            .clone()
            .ok_or_else(|| AppError::DependencyUnavailable("no plain response scripted".into()))
    }

    async fn complete_structured(
        &self,
        _system: &str,
        _user: &str,
        schema_name: &str,
        _schema: Value,
    ) -> Result<String, AppError> {
        if self.offline {
            return Err(AppError::DependencyUnavailable("scripted llm offline".into()));
        }
        self.structured
            .lock()
            .expect("script lock")
            .get(schema_name)
            .cloned()
            .ok_or_else(|| {
                AppError::DependencyUnavailable(format!("no script for schema {schema_name}"))
            })
    }
}
