//! Task processors and the providers and repositories they depend on.

mod bulk_message;
mod contact_import;
mod email_notification;
pub mod providers;
mod template_processing;

use std::collections::BTreeSet;

use serde::Serialize;

use crate::queue::{JobContext, ProcessError, Progress, TaskType};

pub use bulk_message::{BulkMessageProcessor, BulkMessageResult};
pub use contact_import::{ContactImportProcessor, ContactImportResult, ImportError, CONTACT_BATCH_SIZE};
pub use email_notification::{EmailNotificationProcessor, EmailNotificationResult};
pub use providers::{
    EmailReceipt, EmailSender, HttpEmailSender, HttpMessageSender, MessageReceipt, MessageSender,
    OutboundEmail, OutboundMessage, ProviderError,
};
pub use template_processing::{RenderedTemplate, TemplateProcessingProcessor, TemplateProcessingResult};

/// One item of a batch that did not go through.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemError {
    pub recipient: String,
    pub reason: String,
}

impl ItemError {
    pub fn new(recipient: &str, reason: impl Into<String>) -> Self {
        Self {
            recipient: recipient.to_string(),
            reason: reason.into(),
        }
    }

    fn missing_variables(recipient: &str, missing: &BTreeSet<String>) -> Self {
        let names: Vec<&str> = missing.iter().map(String::as_str).collect();
        Self::new(recipient, format!("missing variables: {}", names.join(", ")))
    }
}

/// Report progress as a percentage, at most about twenty times per job.
async fn progress(ctx: &JobContext, done: usize, total: usize) {
    if total == 0 {
        return;
    }
    let step = (total / 20).max(1);
    if done % step == 0 || done == total {
        let percent = (done as f64 * 100.0 / total as f64).round();
        ctx.update_progress(Progress::Percent(percent)).await;
    }
}

fn wrong_payload(expected: TaskType, ctx: &JobContext) -> ProcessError {
    ProcessError::terminal(format!(
        "{} processor cannot handle {} payload",
        expected,
        ctx.payload().task_type()
    ))
}
