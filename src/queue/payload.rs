//! Typed job payloads, one variant per task type.
//!
//! Payloads are validated at enqueue time so a processor never sees a job it
//! cannot interpret. Every payload names the tenant it belongs to; processors
//! scope all reads and writes by it.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::registry::TaskType;

pub type Variables = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", content = "data", rename_all = "kebab-case")]
pub enum TaskPayload {
    BulkMessage(BulkMessagePayload),
    ContactImport(ContactImportPayload),
    TemplateProcessing(TemplateProcessingPayload),
    EmailNotification(EmailNotificationPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkMessagePayload {
    pub tenant_id: TenantId,
    #[serde(default)]
    pub campaign_id: Option<String>,
    /// Message body; may contain `{{variable}}` placeholders
    pub body: String,
    pub recipients: Vec<MessageRecipient>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecipient {
    pub to: String,
    #[serde(default)]
    pub variables: Variables,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactImportPayload {
    pub tenant_id: TenantId,
    #[serde(default)]
    pub list_id: Option<String>,
    pub records: Vec<ContactRecord>,
}

/// Raw row as uploaded; validated by the import processor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactRecord {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub attributes: Variables,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateProcessingPayload {
    pub tenant_id: TenantId,
    pub template: TemplateSource,
    /// Job-level variables; each recipient's own variables win
    #[serde(default)]
    pub defaults: Variables,
    pub recipients: Vec<TemplateRecipient>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum TemplateSource {
    Inline { content: Value },
    Stored { template_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateRecipient {
    pub recipient: String,
    #[serde(default)]
    pub variables: Variables,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailNotificationPayload {
    pub tenant_id: TenantId,
    #[serde(default)]
    pub from: Option<String>,
    pub subject: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub html: Option<String>,
    pub recipients: Vec<EmailRecipient>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailRecipient {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl TaskPayload {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskPayload::BulkMessage(_) => TaskType::BulkMessage,
            TaskPayload::ContactImport(_) => TaskType::ContactImport,
            TaskPayload::TemplateProcessing(_) => TaskType::TemplateProcessing,
            TaskPayload::EmailNotification(_) => TaskType::EmailNotification,
        }
    }

    pub fn tenant_id(&self) -> &TenantId {
        match self {
            TaskPayload::BulkMessage(p) => &p.tenant_id,
            TaskPayload::ContactImport(p) => &p.tenant_id,
            TaskPayload::TemplateProcessing(p) => &p.tenant_id,
            TaskPayload::EmailNotification(p) => &p.tenant_id,
        }
    }

    /// Number of items the job fans out to (recipients or records)
    pub fn item_count(&self) -> usize {
        match self {
            TaskPayload::BulkMessage(p) => p.recipients.len(),
            TaskPayload::ContactImport(p) => p.records.len(),
            TaskPayload::TemplateProcessing(p) => p.recipients.len(),
            TaskPayload::EmailNotification(p) => p.recipients.len(),
        }
    }

    /// Shape checks that do not need any external data.
    pub fn validate(&self) -> Result<(), String> {
        if self.tenant_id().as_str().trim().is_empty() {
            return Err("tenant_id must not be empty".to_string());
        }

        match self {
            TaskPayload::BulkMessage(p) => {
                if p.body.trim().is_empty() {
                    return Err("body must not be empty".to_string());
                }
                if p.recipients.is_empty() {
                    return Err("recipients must not be empty".to_string());
                }
                if let Some(pos) = p.recipients.iter().position(|r| r.to.trim().is_empty()) {
                    return Err(format!("recipient {} has no address", pos));
                }
            }
            TaskPayload::ContactImport(p) => {
                if p.records.is_empty() {
                    return Err("records must not be empty".to_string());
                }
            }
            TaskPayload::TemplateProcessing(p) => {
                if p.recipients.is_empty() {
                    return Err("recipients must not be empty".to_string());
                }
                match &p.template {
                    TemplateSource::Inline { content } if content.is_null() => {
                        return Err("inline template content must not be null".to_string());
                    }
                    TemplateSource::Stored { template_id } if template_id.trim().is_empty() => {
                        return Err("template_id must not be empty".to_string());
                    }
                    _ => {}
                }
            }
            TaskPayload::EmailNotification(p) => {
                if p.subject.trim().is_empty() {
                    return Err("subject must not be empty".to_string());
                }
                if p.text.is_none() && p.html.is_none() {
                    return Err("either text or html content is required".to_string());
                }
                if p.recipients.is_empty() {
                    return Err("recipients must not be empty".to_string());
                }
                if let Some(pos) = p.recipients.iter().position(|r| !r.email.contains('@')) {
                    return Err(format!("recipient {} has an invalid email address", pos));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn sample_bulk_payload(recipients: usize) -> TaskPayload {
        TaskPayload::BulkMessage(BulkMessagePayload {
            tenant_id: TenantId::new("tenant-1"),
            campaign_id: None,
            body: "Hi {{name}}".to_string(),
            recipients: (0..recipients)
                .map(|i| MessageRecipient {
                    to: format!("+1555000{:04}", i),
                    variables: json!({ "name": format!("user{}", i) })
                        .as_object()
                        .cloned()
                        .unwrap_or_default(),
                })
                .collect(),
        })
    }

    #[test]
    fn test_wire_format_is_tagged_by_task() {
        let payload = sample_bulk_payload(1);
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["task"], "bulk-message");
        assert_eq!(value["data"]["tenant_id"], "tenant-1");

        let back: TaskPayload = serde_json::from_value(value).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_stored_template_source() {
        let payload: TaskPayload = serde_json::from_value(json!({
            "task": "template-processing",
            "data": {
                "tenant_id": "t",
                "template": { "source": "stored", "template_id": "welcome" },
                "recipients": [{ "recipient": "a@example.com" }]
            }
        }))
        .unwrap();
        assert_eq!(payload.task_type(), TaskType::TemplateProcessing);
        assert!(payload.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_empty_recipients() {
        let payload = sample_bulk_payload(0);
        assert_eq!(
            payload.validate().unwrap_err(),
            "recipients must not be empty"
        );
    }

    #[test]
    fn test_validation_rejects_blank_tenant() {
        let payload = TaskPayload::ContactImport(ContactImportPayload {
            tenant_id: TenantId::new(" "),
            list_id: None,
            records: vec![ContactRecord::default()],
        });
        assert!(payload.validate().unwrap_err().contains("tenant_id"));
    }

    #[test]
    fn test_email_requires_content() {
        let payload = TaskPayload::EmailNotification(EmailNotificationPayload {
            tenant_id: TenantId::new("t"),
            from: None,
            subject: "Hello".to_string(),
            text: None,
            html: None,
            recipients: vec![EmailRecipient {
                email: "a@example.com".to_string(),
                name: None,
            }],
        });
        assert!(payload.validate().unwrap_err().contains("text or html"));
    }
}
