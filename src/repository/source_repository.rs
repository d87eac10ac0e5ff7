//! Source repository.
//!
//! `(project_id, uri)` is unique; storing the same page twice upserts in
//! place so retried jobs stay idempotent.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::domain::{NewSource, Source};

pub struct SourceRepository {
    pool: PgPool,
}

const SOURCE_COLUMNS: &str = "id, project_id, uri, source_group, source_type, title, content, \
     cleaned_content, status, created_by_job_id, page_type, relevant_field_groups, \
     classification_method, classification_confidence, metadata, created_at, updated_at";

impl SourceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a source, or refresh the existing row for the same
    /// `(project_id, uri)`. Returns the stored source and whether it was
    /// newly created.
    pub async fn upsert(&self, source: &NewSource) -> Result<(Source, bool)> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO sources (
                project_id, uri, source_group, source_type, title, content,
                cleaned_content, status, created_by_job_id, page_type,
                relevant_field_groups, classification_method,
                classification_confidence, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (project_id, uri) DO UPDATE SET
                title = EXCLUDED.title,
                content = EXCLUDED.content,
                cleaned_content = EXCLUDED.cleaned_content,
                status = EXCLUDED.status,
                page_type = EXCLUDED.page_type,
                relevant_field_groups = EXCLUDED.relevant_field_groups,
                classification_method = EXCLUDED.classification_method,
                classification_confidence = EXCLUDED.classification_confidence,
                metadata = EXCLUDED.metadata,
                updated_at = now()
            RETURNING {SOURCE_COLUMNS}, (created_at = updated_at) AS newly_created
            "#
        ))
        .bind(source.project_id)
        .bind(&source.uri)
        .bind(&source.source_group)
        .bind(&source.source_type)
        .bind(&source.title)
        .bind(&source.content)
        .bind(&source.cleaned_content)
        .bind(&source.status)
        .bind(source.created_by_job_id)
        .bind(&source.page_type)
        .bind(&source.relevant_field_groups)
        .bind(&source.classification_method)
        .bind(source.classification_confidence)
        .bind(&source.meta_data)
        .fetch_one(&self.pool)
        .await
        .context("Failed to upsert source")?;

        let created: bool = row.get("newly_created");
        Ok((row_to_source(&row), created))
    }

    pub async fn get(&self, source_id: Uuid) -> Result<Option<Source>> {
        let row = sqlx::query(&format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE id = $1"))
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch source")?;

        Ok(row.as_ref().map(row_to_source))
    }

    pub async fn get_many(&self, source_ids: &[Uuid]) -> Result<Vec<Source>> {
        let rows = sqlx::query(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources WHERE id = ANY($1) ORDER BY created_at ASC"
        ))
        .bind(source_ids)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch sources")?;

        Ok(rows.iter().map(row_to_source).collect())
    }

    /// Completed sources on one domain, newest first. Feeds the domain
    /// boilerplate analysis.
    pub async fn list_by_domain(
        &self,
        project_id: Uuid,
        domain: &str,
        limit: i64,
    ) -> Result<Vec<Source>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SOURCE_COLUMNS} FROM sources
            WHERE project_id = $1
              AND status = 'completed'
              AND metadata->>'domain' = $2
            ORDER BY created_at DESC
            LIMIT $3
            "#
        ))
        .bind(project_id)
        .bind(domain)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list sources by domain")?;

        Ok(rows.iter().map(row_to_source).collect())
    }

    pub async fn list_by_job(&self, job_id: Uuid) -> Result<Vec<Source>> {
        let rows = sqlx::query(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources WHERE created_by_job_id = $1 ORDER BY created_at ASC"
        ))
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list sources by job")?;

        Ok(rows.iter().map(row_to_source).collect())
    }

    pub async fn update_cleaned_content(&self, source_id: Uuid, cleaned: &str) -> Result<()> {
        sqlx::query(
            "UPDATE sources SET cleaned_content = $2, updated_at = now() WHERE id = $1",
        )
        .bind(source_id)
        .bind(cleaned)
        .execute(&self.pool)
        .await
        .context("Failed to update cleaned content")?;
        Ok(())
    }

    /// Delete all sources created by one job. Extractions and entity links
    /// cascade via FK.
    pub async fn delete_by_job(&self, job_id: Uuid) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sources WHERE created_by_job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete sources by job")?;

        Ok(result.rows_affected())
    }
}

fn row_to_source(row: &sqlx::postgres::PgRow) -> Source {
    Source {
        id: row.get("id"),
        project_id: row.get("project_id"),
        uri: row.get("uri"),
        source_group: row.get("source_group"),
        source_type: row.get("source_type"),
        title: row.get("title"),
        content: row.get("content"),
        cleaned_content: row.get("cleaned_content"),
        status: row.get("status"),
        created_by_job_id: row.get("created_by_job_id"),
        page_type: row.get("page_type"),
        relevant_field_groups: row.get("relevant_field_groups"),
        classification_method: row.get("classification_method"),
        classification_confidence: row.get("classification_confidence"),
        meta_data: row.get("metadata"),
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
    }
}
