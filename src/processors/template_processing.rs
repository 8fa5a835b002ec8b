//! Per-recipient template rendering.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::queue::{JobContext, ProcessError, Processor, TaskPayload, TaskType, TemplateSource};
use crate::repository::TemplateRepository;
use crate::template::{merge_variables, substitute_variables};

use super::{progress, wrong_payload, ItemError};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedTemplate {
    pub recipient: String,
    pub content: Value,
}

#[derive(Debug, Default, Serialize)]
pub struct TemplateProcessingResult {
    pub rendered: usize,
    pub failed: usize,
    pub outputs: Vec<RenderedTemplate>,
    pub errors: Vec<ItemError>,
}

pub struct TemplateProcessingProcessor {
    templates: Arc<dyn TemplateRepository>,
}

impl TemplateProcessingProcessor {
    pub fn new(templates: Arc<dyn TemplateRepository>) -> Self {
        Self { templates }
    }

    async fn resolve(&self, ctx: &JobContext, source: &TemplateSource) -> Result<Value, ProcessError> {
        match source {
            TemplateSource::Inline { content } => Ok(content.clone()),
            TemplateSource::Stored { template_id } => {
                let tenant = ctx.tenant_id();
                match self.templates.get_template(tenant, template_id).await {
                    Ok(Some(content)) => Ok(content),
                    Ok(None) => Err(ProcessError::terminal(format!(
                        "template '{}' not found for tenant {}",
                        template_id, tenant
                    ))),
                    Err(e) if e.is_transient() => Err(ProcessError::retryable(e.to_string())
                        .with_context(format!("loading template '{}'", template_id))),
                    Err(e) => Err(ProcessError::terminal(e.to_string())
                        .with_context(format!("loading template '{}'", template_id))),
                }
            }
        }
    }
}

#[async_trait]
impl Processor for TemplateProcessingProcessor {
    fn task_type(&self) -> TaskType {
        TaskType::TemplateProcessing
    }

    async fn process(&self, ctx: &JobContext) -> Result<Value, ProcessError> {
        let TaskPayload::TemplateProcessing(payload) = ctx.payload() else {
            return Err(wrong_payload(self.task_type(), ctx));
        };

        let template = self.resolve(ctx, &payload.template).await?;
        let defaults = Value::Object(payload.defaults.clone());
        let total = payload.recipients.len();
        let mut result = TemplateProcessingResult::default();

        for (index, recipient) in payload.recipients.iter().enumerate() {
            let rendered = merge_variables(&defaults, &Value::Object(recipient.variables.clone()))
                .and_then(|vars| substitute_variables(&template, &vars));

            match rendered {
                Ok(r) if r.is_complete() => {
                    result.rendered += 1;
                    result.outputs.push(RenderedTemplate {
                        recipient: recipient.recipient.clone(),
                        content: r.value,
                    });
                }
                Ok(r) => {
                    result.failed += 1;
                    result
                        .errors
                        .push(ItemError::missing_variables(&recipient.recipient, &r.missing));
                }
                Err(e) => {
                    result.failed += 1;
                    result.errors.push(ItemError::new(&recipient.recipient, e.to_string()));
                }
            }

            progress(ctx, index + 1, total).await;
        }

        tracing::info!(
            job_id = %ctx.job().id,
            tenant_id = %payload.tenant_id,
            rendered = result.rendered,
            failed = result.failed,
            "Template processing finished"
        );
        serde_json::to_value(result).map_err(|e| ProcessError::terminal(e.to_string()))
    }
}
