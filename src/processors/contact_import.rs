//! Contact list import: validate, de-duplicate, write in batches.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::queue::{ContactRecord, JobContext, ProcessError, Processor, TaskPayload, TaskType};
use crate::repository::{ContactRepository, NewContact, RepositoryError};

use super::{progress, wrong_payload};

/// Rows written per repository round trip
pub const CONTACT_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportError {
    /// Zero-based position in the uploaded file
    pub row: usize,
    pub reason: String,
}

#[derive(Debug, Default, Serialize)]
pub struct ContactImportResult {
    pub imported: usize,
    /// Duplicates, within the file or of existing contacts
    pub skipped: usize,
    pub failed: usize,
    pub errors: Vec<ImportError>,
}

pub struct ContactImportProcessor {
    contacts: Arc<dyn ContactRepository>,
    batch_size: usize,
}

impl ContactImportProcessor {
    pub fn new(contacts: Arc<dyn ContactRepository>) -> Self {
        Self {
            contacts,
            batch_size: CONTACT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

fn repository_error(e: RepositoryError, stage: &str) -> ProcessError {
    let err = if e.is_transient() {
        ProcessError::retryable(e.to_string())
    } else {
        ProcessError::terminal(e.to_string())
    };
    err.with_context(stage.to_string())
}

fn normalize_email(raw: &str) -> Result<String, String> {
    let email = raw.trim().to_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.contains(char::is_whitespace)
        }
        None => false,
    };
    if valid {
        Ok(email)
    } else {
        Err(format!("invalid email '{}'", raw.trim()))
    }
}

/// `+` followed by 7 to 15 digits; spaces, dashes, dots and parentheses are
/// dropped.
fn normalize_phone(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    let (plus, rest) = match trimmed.strip_prefix('+') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };

    let mut digits = String::with_capacity(rest.len());
    for c in rest.chars() {
        match c {
            '0'..='9' => digits.push(c),
            ' ' | '-' | '.' | '(' | ')' => {}
            _ => return Err(format!("invalid phone '{}'", trimmed)),
        }
    }
    if !(7..=15).contains(&digits.len()) {
        return Err(format!("invalid phone '{}'", trimmed));
    }
    Ok(if plus { format!("+{}", digits) } else { digits })
}

fn validate(record: &ContactRecord, list_id: Option<&String>) -> Result<NewContact, String> {
    let name = record
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| "name is required".to_string())?;

    let email = record
        .email
        .as_deref()
        .filter(|e| !e.trim().is_empty())
        .map(normalize_email)
        .transpose()?;
    let phone = record
        .phone
        .as_deref()
        .filter(|p| !p.trim().is_empty())
        .map(normalize_phone)
        .transpose()?;

    let dedupe_key = email
        .clone()
        .or_else(|| phone.clone())
        .ok_or_else(|| "email or phone is required".to_string())?;

    Ok(NewContact {
        dedupe_key,
        name: name.to_string(),
        email,
        phone,
        list_id: list_id.cloned(),
        attributes: record.attributes.clone(),
    })
}

#[async_trait]
impl Processor for ContactImportProcessor {
    fn task_type(&self) -> TaskType {
        TaskType::ContactImport
    }

    async fn process(&self, ctx: &JobContext) -> Result<Value, ProcessError> {
        let TaskPayload::ContactImport(payload) = ctx.payload() else {
            return Err(wrong_payload(self.task_type(), ctx));
        };
        let tenant = &payload.tenant_id;

        let mut result = ContactImportResult::default();
        let mut seen = HashSet::new();
        let mut valid = Vec::with_capacity(payload.records.len());

        for (row, record) in payload.records.iter().enumerate() {
            match validate(record, payload.list_id.as_ref()) {
                Ok(contact) => {
                    if seen.insert(contact.dedupe_key.clone()) {
                        valid.push(contact);
                    } else {
                        result.skipped += 1;
                    }
                }
                Err(reason) => {
                    result.failed += 1;
                    result.errors.push(ImportError { row, reason });
                }
            }
        }

        let total_batches = valid.len().div_ceil(self.batch_size);
        for (batch_no, batch) in valid.chunks(self.batch_size).enumerate() {
            let keys: Vec<String> = batch.iter().map(|c| c.dedupe_key.clone()).collect();
            let existing = self
                .contacts
                .existing_keys(tenant, &keys)
                .await
                .map_err(|e| repository_error(e, "checking existing contacts"))?;

            let fresh: Vec<NewContact> = batch
                .iter()
                .filter(|c| !existing.contains(&c.dedupe_key))
                .cloned()
                .collect();
            result.skipped += batch.len() - fresh.len();

            // A retry after a partial import lands here with those rows
            // already present; they count as skipped.
            let written = self
                .contacts
                .insert_batch(tenant, &fresh)
                .await
                .map_err(|e| repository_error(e, "inserting contact batch"))?;
            result.imported += written;
            result.skipped += fresh.len() - written.min(fresh.len());

            progress(ctx, batch_no + 1, total_batches).await;
        }

        tracing::info!(
            job_id = %ctx.job().id,
            tenant_id = %tenant,
            imported = result.imported,
            skipped = result.skipped,
            failed = result.failed,
            "Contact import finished"
        );
        serde_json::to_value(result).map_err(|e| ProcessError::terminal(e.to_string()))
    }
}
