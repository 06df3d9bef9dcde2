//! The structural operations: identity, concat, and the test constant.

use async_trait::async_trait;

use super::{InputArity, OpEnvironment, OpError, OpOutcome, OpRequest, OperationExecutor};

/// Returns its single input unchanged.
pub struct Identity;

#[async_trait]
impl OperationExecutor for Identity {
    fn arity(&self) -> InputArity {
        InputArity::Exactly(1)
    }

    async fn execute(
        &self,
        request: OpRequest<'_>,
        _env: &OpEnvironment,
    ) -> Result<OpOutcome, OpError> {
        Ok(OpOutcome::plain(request.inputs[0].clone()))
    }
}

/// Joins its inputs with a newline.
pub struct Concat;

#[async_trait]
impl OperationExecutor for Concat {
    fn arity(&self) -> InputArity {
        InputArity::AtLeast(2)
    }

    async fn execute(
        &self,
        request: OpRequest<'_>,
        _env: &OpEnvironment,
    ) -> Result<OpOutcome, OpError> {
        Ok(OpOutcome::plain(request.inputs.join("\n")))
    }
}

/// Ignores its inputs and returns a fixed string, configurable through the
/// `value` setting. Exists so idempotence tests have a zero-dependency op.
pub struct ConstantForTesting;

#[async_trait]
impl OperationExecutor for ConstantForTesting {
    fn arity(&self) -> InputArity {
        InputArity::AtLeast(0)
    }

    async fn execute(
        &self,
        request: OpRequest<'_>,
        _env: &OpEnvironment,
    ) -> Result<OpOutcome, OpError> {
        let value = request
            .settings
            .get("value")
            .and_then(|v| v.as_str())
            .unwrap_or("constant");
        Ok(OpOutcome::plain(value))
    }
}
