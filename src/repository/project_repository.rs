//! Project repository. Deletion is soft: `is_active` flips off, rows stay.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::domain::Project;

pub struct ProjectRepository {
    pool: PgPool,
}

const PROJECT_COLUMNS: &str = "id, name, description, extraction_schema, entity_types, \
     extraction_context, classification_config, crawl_config, is_active, created_at, updated_at";

impl ProjectRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        name: &str,
        description: Option<&str>,
        extraction_schema: &Value,
        entity_types: &Value,
        extraction_context: &Value,
    ) -> Result<Project> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO projects (name, description, extraction_schema, entity_types, extraction_context)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {PROJECT_COLUMNS}
            "#
        ))
        .bind(name)
        .bind(description)
        .bind(extraction_schema)
        .bind(entity_types)
        .bind(extraction_context)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create project")?;

        let project = row_to_project(&row);
        log::info!("Created project {} ({})", project.name, project.id);
        Ok(project)
    }

    pub async fn get(&self, project_id: Uuid) -> Result<Option<Project>> {
        let row = sqlx::query(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE id = $1"
        ))
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch project")?;

        Ok(row.as_ref().map(row_to_project))
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<Project>> {
        let row = sqlx::query(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE name = $1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch project by name")?;

        Ok(row.as_ref().map(row_to_project))
    }

    pub async fn list_active(&self) -> Result<Vec<Project>> {
        let rows = sqlx::query(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE is_active ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list projects")?;

        Ok(rows.iter().map(row_to_project).collect())
    }

    /// Soft delete: data is retained, the project disappears from listings.
    pub async fn soft_delete(&self, project_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE projects SET is_active = FALSE, updated_at = now() WHERE id = $1",
        )
        .bind(project_id)
        .execute(&self.pool)
        .await
        .context("Failed to soft-delete project")?;

        Ok(result.rows_affected() > 0)
    }
}

fn row_to_project(row: &sqlx::postgres::PgRow) -> Project {
    Project {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        extraction_schema: row.get("extraction_schema"),
        entity_types: row.get("entity_types"),
        extraction_context: row.get("extraction_context"),
        classification_config: row.get("classification_config"),
        crawl_config: row.get("crawl_config"),
        is_active: row.get("is_active"),
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
    }
}
