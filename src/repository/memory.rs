//! In-memory repositories for tests and database-less deployments

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::queue::TenantId;

use super::{ContactRepository, NewContact, RepositoryError, TemplateRepository};

#[derive(Default)]
pub struct MemoryContactRepository {
    contacts: DashMap<TenantId, HashMap<String, NewContact>>,
}

impl MemoryContactRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, tenant: &TenantId) -> usize {
        self.contacts.get(tenant).map(|c| c.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ContactRepository for MemoryContactRepository {
    async fn existing_keys(
        &self,
        tenant: &TenantId,
        keys: &[String],
    ) -> Result<HashSet<String>, RepositoryError> {
        let Some(contacts) = self.contacts.get(tenant) else {
            return Ok(HashSet::new());
        };
        Ok(keys
            .iter()
            .filter(|key| contacts.contains_key(*key))
            .cloned()
            .collect())
    }

    async fn insert_batch(
        &self,
        tenant: &TenantId,
        contacts: &[NewContact],
    ) -> Result<usize, RepositoryError> {
        let mut stored = self.contacts.entry(tenant.clone()).or_default();
        let mut inserted = 0;
        for contact in contacts {
            if !stored.contains_key(&contact.dedupe_key) {
                stored.insert(contact.dedupe_key.clone(), contact.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}

#[derive(Default)]
pub struct MemoryTemplateRepository {
    templates: DashMap<(TenantId, String), Value>,
}

impl MemoryTemplateRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, tenant: &TenantId, template_id: impl Into<String>, content: Value) {
        self.templates
            .insert((tenant.clone(), template_id.into()), content);
    }
}

#[async_trait]
impl TemplateRepository for MemoryTemplateRepository {
    async fn get_template(
        &self,
        tenant: &TenantId,
        template_id: &str,
    ) -> Result<Option<Value>, RepositoryError> {
        Ok(self
            .templates
            .get(&(tenant.clone(), template_id.to_string()))
            .map(|t| t.clone()))
    }
}
