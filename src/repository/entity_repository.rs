//! Entity repository: deduplicated concepts plus extraction links.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::domain::Entity;

pub struct EntityRepository {
    pool: PgPool,
}

const ENTITY_COLUMNS: &str =
    "id, project_id, source_group, entity_type, value, normalized_value, attributes, created_at";

impl EntityRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the entity for the dedup key, creating it when absent.
    ///
    /// `created` is true only when this call inserted the row. Concurrent
    /// callers racing on the same key both land on the existing entity.
    pub async fn get_or_create(
        &self,
        project_id: Uuid,
        source_group: &str,
        entity_type: &str,
        value: &str,
        normalized_value: &str,
        attributes: &Value,
    ) -> Result<(Entity, bool)> {
        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO entities (
                project_id, source_group, entity_type, value, normalized_value, attributes
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (project_id, source_group, entity_type, normalized_value) DO NOTHING
            RETURNING {ENTITY_COLUMNS}
            "#
        ))
        .bind(project_id)
        .bind(source_group)
        .bind(entity_type)
        .bind(value)
        .bind(normalized_value)
        .bind(attributes)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to insert entity")?;

        if let Some(row) = inserted {
            return Ok((row_to_entity(&row), true));
        }

        let row = sqlx::query(&format!(
            r#"
            SELECT {ENTITY_COLUMNS} FROM entities
            WHERE project_id = $1 AND source_group = $2
              AND entity_type = $3 AND normalized_value = $4
            "#
        ))
        .bind(project_id)
        .bind(source_group)
        .bind(entity_type)
        .bind(normalized_value)
        .fetch_one(&self.pool)
        .await
        .context("Failed to fetch existing entity")?;

        Ok((row_to_entity(&row), false))
    }

    /// Link an entity to an extraction. Idempotent per (extraction, entity,
    /// role); returns whether a new link was created.
    pub async fn link_to_extraction(
        &self,
        extraction_id: Uuid,
        entity_id: Uuid,
        role: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO extraction_entities (extraction_id, entity_id, role)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(extraction_id)
        .bind(entity_id)
        .bind(role)
        .execute(&self.pool)
        .await
        .context("Failed to link entity to extraction")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn list_by_type(
        &self,
        project_id: Uuid,
        entity_type: &str,
        source_group: Option<&str>,
    ) -> Result<Vec<Entity>> {
        let rows = match source_group {
            Some(group) => {
                sqlx::query(&format!(
                    r#"
                    SELECT {ENTITY_COLUMNS} FROM entities
                    WHERE project_id = $1 AND entity_type = $2 AND source_group = $3
                    ORDER BY value
                    "#
                ))
                .bind(project_id)
                .bind(entity_type)
                .bind(group)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(&format!(
                    r#"
                    SELECT {ENTITY_COLUMNS} FROM entities
                    WHERE project_id = $1 AND entity_type = $2
                    ORDER BY value
                    "#
                ))
                .bind(project_id)
                .bind(entity_type)
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("Failed to list entities")?;

        Ok(rows.iter().map(row_to_entity).collect())
    }
}

fn row_to_entity(row: &sqlx::postgres::PgRow) -> Entity {
    Entity {
        id: row.get("id"),
        project_id: row.get("project_id"),
        source_group: row.get("source_group"),
        entity_type: row.get("entity_type"),
        value: row.get("value"),
        normalized_value: row.get("normalized_value"),
        attributes: row.get("attributes"),
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
    }
}
