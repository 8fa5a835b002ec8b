//! Bulk outbound messaging: one provider call per recipient, paced by the
//! provider's ceiling.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::metrics::ProviderMetrics;
use crate::queue::{JobContext, ProcessError, Processor, TaskPayload, TaskType};
use crate::ratelimit::RateLimiter;
use crate::template::render_str;

use super::providers::{MessageSender, OutboundMessage};
use super::{progress, wrong_payload, ItemError};

#[derive(Debug, Default, serde::Serialize)]
pub struct BulkMessageResult {
    pub sent: usize,
    pub failed: usize,
    pub errors: Vec<ItemError>,
}

pub struct BulkMessageProcessor {
    sender: Arc<dyn MessageSender>,
    limiter: Arc<dyn RateLimiter>,
}

impl BulkMessageProcessor {
    pub fn new(sender: Arc<dyn MessageSender>, limiter: Arc<dyn RateLimiter>) -> Self {
        Self { sender, limiter }
    }
}

#[async_trait]
impl Processor for BulkMessageProcessor {
    fn task_type(&self) -> TaskType {
        TaskType::BulkMessage
    }

    async fn process(&self, ctx: &JobContext) -> Result<Value, ProcessError> {
        let TaskPayload::BulkMessage(payload) = ctx.payload() else {
            return Err(wrong_payload(self.task_type(), ctx));
        };

        let total = payload.recipients.len();
        let mut result = BulkMessageResult::default();
        let mut transient_failures = 0;

        for (index, recipient) in payload.recipients.iter().enumerate() {
            let (body, missing) = render_str(&payload.body, &recipient.variables);
            if !missing.is_empty() {
                result.failed += 1;
                result.errors.push(ItemError::missing_variables(&recipient.to, &missing));
            } else {
                let permit = self.limiter.acquire().await.map_err(|e| {
                    ProcessError::retryable(e.to_string()).with_context("acquiring messaging rate permit")
                })?;

                let message = OutboundMessage {
                    tenant_id: payload.tenant_id.clone(),
                    to: recipient.to.clone(),
                    body,
                };
                let sent = self.sender.send(&message).await;
                self.limiter.settle_quietly(permit).await;
                match sent {
                    Ok(_) => {
                        ProviderMetrics::record_success(self.sender.name());
                        result.sent += 1;
                    }
                    Err(e) if e.is_batch_fatal() => {
                        ProviderMetrics::record_failure(self.sender.name(), e.outcome());
                        return Err(ProcessError::terminal(e.to_string())
                            .with_context(format!("{} of {} recipients sent before abort", result.sent, total)));
                    }
                    Err(e) => {
                        ProviderMetrics::record_failure(self.sender.name(), e.outcome());
                        tracing::debug!(
                            job_id = %ctx.job().id,
                            recipient = %recipient.to,
                            error = %e,
                            "Message send failed"
                        );
                        if e.is_transient() {
                            transient_failures += 1;
                        }
                        result.failed += 1;
                        result.errors.push(ItemError::new(&recipient.to, e.to_string()));
                    }
                }
            }

            progress(ctx, index + 1, total).await;
        }

        // Provider down for the whole batch: retry it rather than report it
        if result.sent == 0 && transient_failures == total {
            return Err(ProcessError::retryable(format!(
                "all {} sends failed with transient provider errors",
                total
            )));
        }

        tracing::info!(
            job_id = %ctx.job().id,
            tenant_id = %payload.tenant_id,
            campaign_id = payload.campaign_id.as_deref().unwrap_or("-"),
            sent = result.sent,
            failed = result.failed,
            "Bulk message batch finished"
        );
        serde_json::to_value(result).map_err(|e| ProcessError::terminal(e.to_string()))
    }
}
