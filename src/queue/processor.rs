//! Processor contract.
//!
//! A processor returns `Ok(result)` or a classified error; the worker pool
//! decides between retry and terminal failure from the class alone.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use super::context::JobContext;
use super::job::{FailureKind, JobFailure};
use super::registry::TaskType;

#[derive(Debug, Error)]
pub enum ProcessError {
    /// Worth another attempt (provider outage, lost connection)
    #[error("{reason}")]
    Retryable { reason: String, context: Vec<String> },

    /// Retrying cannot help (bad credentials, missing template)
    #[error("{reason}")]
    Terminal { reason: String, context: Vec<String> },
}

impl ProcessError {
    pub fn retryable(reason: impl Into<String>) -> Self {
        ProcessError::Retryable {
            reason: reason.into(),
            context: Vec::new(),
        }
    }

    pub fn terminal(reason: impl Into<String>) -> Self {
        ProcessError::Terminal {
            reason: reason.into(),
            context: Vec::new(),
        }
    }

    /// Append a context line, innermost last.
    pub fn with_context(mut self, line: impl Into<String>) -> Self {
        match &mut self {
            ProcessError::Retryable { context, .. } | ProcessError::Terminal { context, .. } => {
                context.push(line.into())
            }
        }
        self
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            ProcessError::Retryable { .. } => FailureKind::Retryable,
            ProcessError::Terminal { .. } => FailureKind::Terminal,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            ProcessError::Retryable { reason, .. } | ProcessError::Terminal { reason, .. } => reason,
        }
    }

    pub fn into_failure(self, at: DateTime<Utc>) -> JobFailure {
        let kind = self.kind();
        let (reason, stack) = match self {
            ProcessError::Retryable { reason, context } | ProcessError::Terminal { reason, context } => {
                (reason, context)
            }
        };
        JobFailure {
            reason,
            stack,
            kind,
            failed_at: at,
        }
    }
}

#[async_trait]
pub trait Processor: Send + Sync {
    /// The task this processor handles; it runs on the queue of the same name.
    fn task_type(&self) -> TaskType;

    /// Run one attempt. Must tolerate being invoked again for the same job
    /// after a retry.
    async fn process(&self, ctx: &JobContext) -> Result<Value, ProcessError>;
}
