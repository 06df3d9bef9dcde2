//! The `llm` operation: one input, a `prompt` setting, and a `model`
//! selector. Oversized inputs are truncated to their tail with a warning
//! rather than rejected, so long pipelines degrade instead of failing.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use lmflow_core::Warning;

use super::{InputArity, OpEnvironment, OpError, OpOutcome, OpRequest, OperationExecutor};
use crate::llm::{LlmModel, LlmRequest};

/// Build-time bound on how many characters of input reach the model.
pub const CONTEXT_WINDOW_LIMIT_CHARS: usize = 120_000;

#[derive(Debug, Deserialize)]
struct LlmSettings {
    prompt: String,
    model: LlmModel,
}

/// Invokes the model collaborator with the step's prompt and input.
pub struct LlmOp;

#[async_trait]
impl OperationExecutor for LlmOp {
    fn arity(&self) -> InputArity {
        InputArity::Exactly(1)
    }

    async fn execute(
        &self,
        request: OpRequest<'_>,
        env: &OpEnvironment,
    ) -> Result<OpOutcome, OpError> {
        let settings: LlmSettings =
            serde_json::from_value(Value::Object(request.settings.clone()))
                .map_err(|err| OpError::Reported(format!("invalid llm settings: {}", err)))?;

        let input = &request.inputs[0];
        let mut warnings = Vec::new();
        let user_prompt = match truncate_to_tail(input, CONTEXT_WINDOW_LIMIT_CHARS) {
            Some((kept, original_len)) => {
                warnings.push(Warning::InputTooLarge {
                    input_length: original_len,
                    limit: CONTEXT_WINDOW_LIMIT_CHARS,
                });
                kept
            }
            None => input.clone(),
        };

        let response = env
            .llm
            .call(&LlmRequest {
                model: settings.model,
                system_prompt: settings.prompt,
                user_prompt,
            })
            .await
            .map_err(|err| OpError::Reported(err.to_string()))?;

        Ok(OpOutcome {
            output: response.text,
            warnings,
            tokens_output: response.output_tokens,
        })
    }
}

/// Returns the last `limit` characters and the original character count
/// when `input` exceeds the limit, `None` otherwise.
fn truncate_to_tail(input: &str, limit: usize) -> Option<(String, usize)> {
    let len = input.chars().count();
    if len <= limit {
        return None;
    }
    Some((input.chars().skip(len - limit).collect(), len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::StaticFetcher;
    use crate::llm::EchoLlm;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn env() -> OpEnvironment {
        OpEnvironment {
            llm: Arc::new(EchoLlm),
            http: Arc::new(StaticFetcher::new(HashMap::new())),
        }
    }

    fn settings() -> serde_json::Map<String, Value> {
        let mut map = serde_json::Map::new();
        map.insert("prompt".to_string(), "return the input".into());
        map.insert("model".to_string(), "small".into());
        map
    }

    #[tokio::test]
    async fn small_input_passes_untouched() {
        let inputs = vec!["short".to_string()];
        let outcome = LlmOp
            .execute(
                OpRequest {
                    inputs: &inputs,
                    settings: &settings(),
                },
                &env(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.output, "short");
        assert!(outcome.warnings.is_empty());
        assert_eq!(outcome.tokens_output, Some(1));
    }

    #[tokio::test]
    async fn oversized_input_is_tail_truncated_with_warning() {
        let oversized: String = std::iter::repeat('x')
            .take(CONTEXT_WINDOW_LIMIT_CHARS)
            .chain(std::iter::once('z'))
            .collect();
        let inputs = vec![oversized];
        let outcome = LlmOp
            .execute(
                OpRequest {
                    inputs: &inputs,
                    settings: &settings(),
                },
                &env(),
            )
            .await
            .unwrap();

        // The echo model returns what it was given: the tail.
        assert_eq!(outcome.output.chars().count(), CONTEXT_WINDOW_LIMIT_CHARS);
        assert!(outcome.output.ends_with('z'));
        assert_eq!(
            outcome.warnings,
            vec![Warning::InputTooLarge {
                input_length: CONTEXT_WINDOW_LIMIT_CHARS + 1,
                limit: CONTEXT_WINDOW_LIMIT_CHARS,
            }]
        );
    }

    #[tokio::test]
    async fn missing_prompt_is_a_reported_failure() {
        let mut incomplete = serde_json::Map::new();
        incomplete.insert("model".to_string(), "small".into());
        let inputs = vec!["x".to_string()];
        let err = LlmOp
            .execute(
                OpRequest {
                    inputs: &inputs,
                    settings: &incomplete,
                },
                &env(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OpError::Reported(_)));
    }
}
