//! Email template repository

use crate::db::DatabasePool;
use crate::memory::MemoryStore;
use crate::models::{EmailTemplate, NewTemplate};
use async_trait::async_trait;
use chrono::Utc;
use mailpipe_common::types::TemplateId;
use mailpipe_common::{Error, Result};
use uuid::Uuid;

/// Template repository trait
#[async_trait]
pub trait TemplateRepository: Send + Sync {
    async fn create(&self, input: NewTemplate) -> Result<EmailTemplate>;
    async fn get(&self, id: TemplateId) -> Result<Option<EmailTemplate>>;
}

/// Database template repository
pub struct DbTemplateRepository {
    pool: DatabasePool,
}

impl DbTemplateRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TemplateRepository for DbTemplateRepository {
    async fn create(&self, input: NewTemplate) -> Result<EmailTemplate> {
        sqlx::query_as::<_, EmailTemplate>(
            r#"
            INSERT INTO email_templates (id, name, subject, html_content, text_content, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&input.name)
        .bind(&input.subject)
        .bind(&input.html_content)
        .bind(&input.text_content)
        .bind(Utc::now())
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn get(&self, id: TemplateId) -> Result<Option<EmailTemplate>> {
        sqlx::query_as::<_, EmailTemplate>("SELECT * FROM email_templates WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }
}

#[async_trait]
impl TemplateRepository for MemoryStore {
    async fn create(&self, input: NewTemplate) -> Result<EmailTemplate> {
        let template = EmailTemplate {
            id: Uuid::now_v7(),
            name: input.name,
            subject: input.subject,
            html_content: input.html_content,
            text_content: input.text_content,
            created_at: Utc::now(),
        };
        self.state().templates.insert(template.id, template.clone());
        Ok(template)
    }

    async fn get(&self, id: TemplateId) -> Result<Option<EmailTemplate>> {
        Ok(self.state().templates.get(&id).cloned())
    }
}
