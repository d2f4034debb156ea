use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
        CreateChatCompletionRequestArgs, ResponseFormat, ResponseFormatJsonSchema,
    },
    Client,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use crate::error::AppError;

/// Seam over the completion model. The orchestrator and the ingestion
/// pipeline only ever see this trait; tests inject scripted fakes.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Free-form completion.
    async fn complete(&self, system: &str, user: &str) -> Result<String, AppError>;

    /// Completion constrained to a JSON schema; returns the raw JSON payload.
    async fn complete_structured(
        &self,
        system: &str,
        user: &str,
        schema_name: &str,
        schema: Value,
    ) -> Result<String, AppError>;
}

pub struct OpenAiLlmClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiLlmClient {
    pub fn new(client: Client<OpenAIConfig>, model: String) -> Self {
        Self { client, model }
    }
}

#[async_trait]
impl LlmClient for OpenAiLlmClient {
    async fn complete(&self, system: &str, user: &str) -> Result<String, AppError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages([
                ChatCompletionRequestSystemMessage::from(system).into(),
                ChatCompletionRequestUserMessage::from(user).into(),
            ])
            .build()?;

        let response = self.client.chat().create(request).await?;

        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or(AppError::LlmParsing(
                "No content found in LLM response".into(),
            ))
    }

    async fn complete_structured(
        &self,
        system: &str,
        user: &str,
        schema_name: &str,
        schema: Value,
    ) -> Result<String, AppError> {
        let response_format = ResponseFormat::JsonSchema {
            json_schema: ResponseFormatJsonSchema {
                description: None,
                name: schema_name.into(),
                schema: Some(schema),
                strict: Some(true),
            },
        };

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages([
                ChatCompletionRequestSystemMessage::from(system).into(),
                ChatCompletionRequestUserMessage::from(user).into(),
            ])
            .response_format(response_format)
            .build()?;

        let response = self.client.chat().create(request).await?;

        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or(AppError::LlmParsing(
                "No content found in LLM response".into(),
            ))
    }
}

/// Runs a structured call and parses the payload; a malformed payload earns
/// exactly one retry with a stricter system prompt before the caller's
/// degraded path takes over.
pub async fn structured_call<T>(
    llm: &dyn LlmClient,
    system: &str,
    user: &str,
    schema_name: &str,
    schema: Value,
) -> Result<T, AppError>
where
    T: DeserializeOwned,
{
    let raw = llm
        .complete_structured(system, user, schema_name, schema.clone())
        .await?;

    match serde_json::from_str::<T>(&raw) {
        Ok(parsed) => Ok(parsed),
        Err(first_err) => {
            warn!(
                schema = schema_name,
                error = %first_err,
                "Structured LLM response failed to parse; retrying with stricter prompt"
            );

            let strict_system = format!(
                "{system}\n\nRespond with ONLY a JSON object matching the requested schema. \
                 No prose, no markdown fences."
            );
            let raw = llm
                .complete_structured(&strict_system, user, schema_name, schema)
                .await?;

            serde_json::from_str::<T>(&raw).map_err(|e| {
                AppError::LlmParsing(format!(
                    "Failed to parse structured response for {schema_name}: {e}"
                ))
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Deserialize)]
    struct Verdict {
        sufficient: bool,
    }

    struct FlakyLlm {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmClient for FlakyLlm {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String, AppError> {
            Ok("ok".into())
        }

        async fn complete_structured(
            &self,
            _system: &str,
            _user: &str,
            _schema_name: &str,
            _schema: Value,
        ) -> Result<String, AppError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                Ok("not json at all".into())
            } else {
                Ok(r#"{"sufficient": true}"#.into())
            }
        }
    }

    #[tokio::test]
    async fn structured_call_retries_once_on_malformed_payload() {
        let llm = FlakyLlm {
            calls: AtomicUsize::new(0),
        };

        let verdict: Verdict = structured_call(
            &llm,
            "You judge sufficiency.",
            "context",
            "sufficiency_verdict",
            json!({"type": "object"}),
        )
        .await
        .expect("second attempt parses");

        assert!(verdict.sufficient);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 2);
    }

    struct AlwaysBroken;

    #[async_trait]
    impl LlmClient for AlwaysBroken {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String, AppError> {
            Ok("ok".into())
        }

        async fn complete_structured(
            &self,
            _system: &str,
            _user: &str,
            _schema_name: &str,
            _schema: Value,
        ) -> Result<String, AppError> {
            Ok("{truncated".into())
        }
    }

    #[tokio::test]
    async fn structured_call_surfaces_parse_failure_after_retry() {
        let err = structured_call::<Verdict>(
            &AlwaysBroken,
            "system",
            "user",
            "sufficiency_verdict",
            json!({"type": "object"}),
        )
        .await
        .expect_err("both attempts malformed");

        assert!(matches!(err, AppError::LlmParsing(_)));
    }
}
