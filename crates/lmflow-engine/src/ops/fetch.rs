//! The `fetch_url_content` operation: one input holding the URL.

use async_trait::async_trait;

use super::{InputArity, OpEnvironment, OpError, OpOutcome, OpRequest, OperationExecutor};

pub struct FetchUrlContent;

#[async_trait]
impl OperationExecutor for FetchUrlContent {
    fn arity(&self) -> InputArity {
        InputArity::Exactly(1)
    }

    async fn execute(
        &self,
        request: OpRequest<'_>,
        env: &OpEnvironment,
    ) -> Result<OpOutcome, OpError> {
        let url = request.inputs[0].trim();
        let body = env
            .http
            .fetch(url)
            .await
            .map_err(|err| OpError::Reported(err.to_string()))?;
        Ok(OpOutcome::plain(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::StaticFetcher;
    use crate::llm::EchoLlm;
    use std::collections::HashMap;
    use std::sync::Arc;

    #[tokio::test]
    async fn fetches_via_the_collaborator() {
        let env = OpEnvironment {
            llm: Arc::new(EchoLlm),
            http: Arc::new(StaticFetcher::new(HashMap::from([(
                "https://example.test/page".to_string(),
                "the body".to_string(),
            )]))),
        };
        let inputs = vec!["https://example.test/page".to_string()];
        let outcome = FetchUrlContent
            .execute(
                OpRequest {
                    inputs: &inputs,
                    settings: &serde_json::Map::new(),
                },
                &env,
            )
            .await
            .unwrap();
        assert_eq!(outcome.output, "the body");

        let inputs = vec!["https://example.test/missing".to_string()];
        let err = FetchUrlContent
            .execute(
                OpRequest {
                    inputs: &inputs,
                    settings: &serde_json::Map::new(),
                },
                &env,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OpError::Reported(_)));
    }
}
