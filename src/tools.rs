//! Tool registry seam and failure-proof tool invocation.
//!
//! The remote model blocks on a result for every invocation it issues, so
//! [`invoke`] never fails: unknown tools, errors, timeouts and panics all
//! become [`ToolOutcome::Error`].

use crate::channel::messages::{ToolCall, ToolOutcome};
use crate::error::ToolExecutionError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Executes named tools with JSON arguments.
///
/// Must be safe to call concurrently for distinct invocation ids.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    /// Run `name` with `args`.
    ///
    /// # Errors
    ///
    /// Returns [`ToolExecutionError`] if the tool is unknown or fails.
    async fn execute(
        &self,
        name: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, ToolExecutionError>;
}

/// A registry with no tools; every call reports `NotFound`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyToolRegistry;

#[async_trait]
impl ToolRegistry for EmptyToolRegistry {
    async fn execute(
        &self,
        name: &str,
        _args: serde_json::Value,
    ) -> Result<serde_json::Value, ToolExecutionError> {
        Err(ToolExecutionError::NotFound(name.to_owned()))
    }
}

/// Run one tool call to completion, converting every failure into an
/// error-kind outcome.
///
/// The call runs on its own task so a panic inside the tool cannot take
/// the session down with it.
pub async fn invoke(
    registry: Arc<dyn ToolRegistry>,
    call: ToolCall,
    timeout: Option<Duration>,
) -> ToolOutcome {
    let start = Instant::now();
    let name = call.name.clone();
    let mut task = tokio::spawn(async move { registry.execute(&call.name, call.args).await });

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut task).await {
            Ok(joined) => joined,
            Err(_elapsed) => {
                task.abort();
                let err = ToolExecutionError::Timeout {
                    name: name.clone(),
                    timeout_ms: limit.as_millis() as u64,
                };
                tracing::error!(
                    tool_name = %name,
                    timeout_ms = limit.as_millis() as u64,
                    "tool execution timed out"
                );
                return ToolOutcome::Error(err.to_string());
            }
        },
        None => task.await,
    };

    match joined {
        Ok(Ok(value)) => {
            tracing::info!(
                tool_name = %name,
                duration_ms = start.elapsed().as_millis() as u64,
                "tool execution completed"
            );
            ToolOutcome::Result(value)
        }
        Ok(Err(e)) => {
            tracing::warn!(tool_name = %name, error = %e, "tool execution failed");
            ToolOutcome::Error(e.to_string())
        }
        Err(join_err) => {
            tracing::error!(tool_name = %name, error = %join_err, "tool execution panicked");
            ToolOutcome::Error(ToolExecutionError::Panicked(name).to_string())
        }
    }
}
