//! PostgreSQL repositories. Schema lives in `migrations/`.

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder};
use uuid::Uuid;

use crate::postgres::{PostgresPool, PostgresPoolError};
use crate::queue::TenantId;

use super::{ContactRepository, NewContact, RepositoryError, TemplateRepository};

impl From<PostgresPoolError> for RepositoryError {
    fn from(err: PostgresPoolError) -> Self {
        if err.is_transient() {
            RepositoryError::Unavailable(err.to_string())
        } else {
            RepositoryError::Database(err.to_string())
        }
    }
}

pub struct PostgresContactRepository {
    pool: PostgresPool,
}

impl PostgresContactRepository {
    pub fn new(pool: PostgresPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContactRepository for PostgresContactRepository {
    async fn existing_keys(
        &self,
        tenant: &TenantId,
        keys: &[String],
    ) -> Result<HashSet<String>, RepositoryError> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }

        let found: Vec<String> = self
            .pool
            .execute_with_circuit_breaker(|pool| async move {
                sqlx::query_scalar(
                    "SELECT dedupe_key FROM contacts WHERE tenant_id = $1 AND dedupe_key = ANY($2)",
                )
                .bind(tenant.as_str())
                .bind(keys)
                .fetch_all(&pool)
                .await
            })
            .await?;

        Ok(found.into_iter().collect())
    }

    async fn insert_batch(
        &self,
        tenant: &TenantId,
        contacts: &[NewContact],
    ) -> Result<usize, RepositoryError> {
        if contacts.is_empty() {
            return Ok(0);
        }

        let rows = self
            .pool
            .execute_with_circuit_breaker(|pool| async move {
                let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                    "INSERT INTO contacts (id, tenant_id, dedupe_key, name, email, phone, list_id, attributes) ",
                );
                builder.push_values(contacts, |mut row, contact| {
                    row.push_bind(Uuid::new_v4())
                        .push_bind(tenant.as_str())
                        .push_bind(&contact.dedupe_key)
                        .push_bind(&contact.name)
                        .push_bind(&contact.email)
                        .push_bind(&contact.phone)
                        .push_bind(&contact.list_id)
                        .push_bind(Json(&contact.attributes));
                });
                builder.push(" ON CONFLICT (tenant_id, dedupe_key) DO NOTHING");

                builder.build().execute(&pool).await
            })
            .await?
            .rows_affected();

        tracing::debug!(tenant_id = %tenant, rows, batch = contacts.len(), "Inserted contact batch");
        Ok(rows as usize)
    }
}

pub struct PostgresTemplateRepository {
    pool: PostgresPool,
}

impl PostgresTemplateRepository {
    pub fn new(pool: PostgresPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TemplateRepository for PostgresTemplateRepository {
    async fn get_template(
        &self,
        tenant: &TenantId,
        template_id: &str,
    ) -> Result<Option<Value>, RepositoryError> {
        let content: Option<Json<Value>> = self
            .pool
            .execute_with_circuit_breaker(|pool| async move {
                sqlx::query_scalar("SELECT content FROM templates WHERE tenant_id = $1 AND id = $2")
                    .bind(tenant.as_str())
                    .bind(template_id)
                    .fetch_optional(&pool)
                    .await
            })
            .await?;

        Ok(content.map(|Json(value)| value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_errors_classified() {
        assert!(RepositoryError::from(PostgresPoolError::CircuitOpen).is_transient());
        assert!(RepositoryError::from(PostgresPoolError::Sqlx(sqlx::Error::PoolTimedOut)).is_transient());
        assert!(!RepositoryError::from(PostgresPoolError::Sqlx(sqlx::Error::RowNotFound)).is_transient());
    }
}
