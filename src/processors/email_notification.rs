//! Batched email delivery.
//!
//! Recipients are split into provider-sized batches; each batch is a single
//! provider call and consumes a single rate permit.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::metrics::ProviderMetrics;
use crate::queue::{JobContext, ProcessError, Processor, TaskPayload, TaskType};
use crate::ratelimit::RateLimiter;

use super::providers::{EmailSender, OutboundEmail};
use super::{progress, wrong_payload, ItemError};

#[derive(Debug, Default, Serialize)]
pub struct EmailNotificationResult {
    pub delivered: usize,
    pub failed: usize,
    pub batches: usize,
    pub message_ids: Vec<String>,
    pub errors: Vec<ItemError>,
}

pub struct EmailNotificationProcessor {
    sender: Arc<dyn EmailSender>,
    limiter: Arc<dyn RateLimiter>,
    batch_size: usize,
}

impl EmailNotificationProcessor {
    pub fn new(sender: Arc<dyn EmailSender>, limiter: Arc<dyn RateLimiter>, batch_size: usize) -> Self {
        Self {
            sender,
            limiter,
            batch_size: batch_size.max(1),
        }
    }
}

#[async_trait]
impl Processor for EmailNotificationProcessor {
    fn task_type(&self) -> TaskType {
        TaskType::EmailNotification
    }

    async fn process(&self, ctx: &JobContext) -> Result<Value, ProcessError> {
        let TaskPayload::EmailNotification(payload) = ctx.payload() else {
            return Err(wrong_payload(self.task_type(), ctx));
        };

        let total = payload.recipients.len();
        let total_batches = total.div_ceil(self.batch_size);
        let mut result = EmailNotificationResult::default();
        let mut transient_failures = 0;

        for (batch_no, chunk) in payload.recipients.chunks(self.batch_size).enumerate() {
            let permit = self.limiter.acquire().await.map_err(|e| {
                ProcessError::retryable(e.to_string()).with_context("acquiring email rate permit")
            })?;

            let email = OutboundEmail {
                tenant_id: payload.tenant_id.clone(),
                from: payload.from.clone(),
                subject: payload.subject.clone(),
                text: payload.text.clone(),
                html: payload.html.clone(),
                to: chunk.to_vec(),
            };
            result.batches += 1;

            let sent = self.sender.send_batch(&email).await;
            self.limiter.settle_quietly(permit).await;
            match sent {
                Ok(receipt) => {
                    ProviderMetrics::record_success(self.sender.name());
                    result.delivered += receipt.accepted.len();
                    result
                        .message_ids
                        .extend(receipt.accepted.into_iter().map(|a| a.message_id));
                    result.failed += receipt.rejected.len();
                    result.errors.extend(
                        receipt
                            .rejected
                            .into_iter()
                            .map(|r| ItemError::new(&r.email, r.reason)),
                    );
                }
                Err(e) if e.is_batch_fatal() => {
                    ProviderMetrics::record_failure(self.sender.name(), e.outcome());
                    return Err(ProcessError::terminal(e.to_string()).with_context(format!(
                        "{} of {} batches sent before abort",
                        batch_no, total_batches
                    )));
                }
                Err(e) => {
                    ProviderMetrics::record_failure(self.sender.name(), e.outcome());
                    tracing::warn!(
                        job_id = %ctx.job().id,
                        batch = batch_no,
                        size = chunk.len(),
                        error = %e,
                        "Email batch failed"
                    );
                    if e.is_transient() {
                        transient_failures += 1;
                    }
                    let reason = e.to_string();
                    result.failed += chunk.len();
                    result
                        .errors
                        .extend(chunk.iter().map(|r| ItemError::new(&r.email, reason.clone())));
                }
            }

            progress(ctx, batch_no + 1, total_batches).await;
        }

        if result.delivered == 0 && transient_failures == total_batches {
            return Err(ProcessError::retryable(format!(
                "all {} email batches failed with transient provider errors",
                total_batches
            )));
        }

        tracing::info!(
            job_id = %ctx.job().id,
            tenant_id = %payload.tenant_id,
            delivered = result.delivered,
            failed = result.failed,
            batches = result.batches,
            "Email notification finished"
        );
        serde_json::to_value(result).map_err(|e| ProcessError::terminal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::providers::ProviderError;
    use crate::processors::testing::{active_context, StubEmailSender};
    use crate::queue::{EmailNotificationPayload, EmailRecipient, FailureKind, TenantId};
    use crate::ratelimit::{LocalRateLimiter, RateLimit};

    fn limiter() -> Arc<dyn RateLimiter> {
        Arc::new(LocalRateLimiter::new("test", RateLimit::per_second(1_000).unwrap()))
    }

    fn payload(recipients: usize) -> TaskPayload {
        TaskPayload::EmailNotification(EmailNotificationPayload {
            tenant_id: TenantId::new("tenant-1"),
            from: Some("noreply@example.com".into()),
            subject: "Weekly digest".into(),
            text: Some("Hello".into()),
            html: None,
            recipients: (0..recipients)
                .map(|i| EmailRecipient {
                    email: format!("user{}@example.com", i),
                    name: None,
                })
                .collect(),
        })
    }

    #[tokio::test]
    async fn test_recipients_are_batched() {
        let sender = Arc::new(StubEmailSender::new());
        let processor = EmailNotificationProcessor::new(sender.clone(), limiter(), 2);
        let ctx = active_context(payload(5)).await;

        let result = processor.process(&ctx).await.unwrap();
        assert_eq!(result["delivered"], 5);
        assert_eq!(result["batches"], 3);
        assert_eq!(result["message_ids"].as_array().unwrap().len(), 5);

        let batches = sender.batches.lock().unwrap();
        let sizes: Vec<usize> = batches.iter().map(|b| b.to.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_rejected_addresses_are_item_errors() {
        let mut stub = StubEmailSender::new();
        stub.reject = vec!["user1@example.com".into()];
        let processor = EmailNotificationProcessor::new(Arc::new(stub), limiter(), 50);
        let ctx = active_context(payload(3)).await;

        let result = processor.process(&ctx).await.unwrap();
        assert_eq!(result["delivered"], 2);
        assert_eq!(result["failed"], 1);
        assert_eq!(result["errors"][0]["recipient"], "user1@example.com");
    }

    #[tokio::test]
    async fn test_bad_credentials_abort() {
        let mut stub = StubEmailSender::new();
        stub.error = Some(|| ProviderError::Unauthorized("revoked".into()));
        let processor = EmailNotificationProcessor::new(Arc::new(stub), limiter(), 2);
        let ctx = active_context(payload(4)).await;

        let err = processor.process(&ctx).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Terminal);
    }

    #[tokio::test]
    async fn test_outage_is_retried() {
        let mut stub = StubEmailSender::new();
        stub.error = Some(|| ProviderError::Server {
            status: 503,
            body: "maintenance".into(),
        });
        let processor = EmailNotificationProcessor::new(Arc::new(stub), limiter(), 2);
        let ctx = active_context(payload(4)).await;

        let err = processor.process(&ctx).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Retryable);
    }
}
