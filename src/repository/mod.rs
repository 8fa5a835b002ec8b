//! Tenant-scoped data the processors read and write.
//!
//! Every call takes the tenant id; implementations must never return or
//! touch another tenant's rows.

mod memory;
mod postgres;

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::queue::{TenantId, Variables};

pub use memory::{MemoryContactRepository, MemoryTemplateRepository};
pub use postgres::{PostgresContactRepository, PostgresTemplateRepository};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    Database(String),

    /// Pool exhausted, connection lost or circuit open
    #[error("Repository unavailable: {0}")]
    Unavailable(String),
}

impl RepositoryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RepositoryError::Unavailable(_))
    }
}

/// A validated contact ready to be stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewContact {
    /// Normalized email, or phone when there is no email
    pub dedupe_key: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub list_id: Option<String>,
    pub attributes: Variables,
}

#[async_trait]
pub trait ContactRepository: Send + Sync {
    /// Which of `keys` already exist for the tenant.
    async fn existing_keys(
        &self,
        tenant: &TenantId,
        keys: &[String],
    ) -> Result<HashSet<String>, RepositoryError>;

    /// Insert a batch in one round trip. Rows whose key already exists are
    /// skipped; returns how many were written.
    async fn insert_batch(
        &self,
        tenant: &TenantId,
        contacts: &[NewContact],
    ) -> Result<usize, RepositoryError>;
}

#[async_trait]
pub trait TemplateRepository: Send + Sync {
    async fn get_template(
        &self,
        tenant: &TenantId,
        template_id: &str,
    ) -> Result<Option<Value>, RepositoryError>;
}
