//! Extraction repository: fact rows and the orphan scan.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::domain::{Extraction, NewExtraction};

pub struct ExtractionRepository {
    pool: PgPool,
}

const EXTRACTION_COLUMNS: &str = "id, project_id, source_id, source_group, extraction_type, \
     data, confidence, profile_used, embedding_id, created_at";

impl ExtractionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert rows with `embedding_id = NULL`; the pipeline flips the ids
    /// after the vector upsert lands.
    pub async fn insert_batch(&self, extractions: &[NewExtraction]) -> Result<Vec<Extraction>> {
        let mut inserted = Vec::with_capacity(extractions.len());

        let mut tx = self.pool.begin().await.context("Failed to begin insert")?;
        for extraction in extractions {
            let row = sqlx::query(&format!(
                r#"
                INSERT INTO extractions (
                    project_id, source_id, source_group, extraction_type,
                    data, confidence, profile_used
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                RETURNING {EXTRACTION_COLUMNS}
                "#
            ))
            .bind(extraction.project_id)
            .bind(extraction.source_id)
            .bind(&extraction.source_group)
            .bind(&extraction.extraction_type)
            .bind(&extraction.data)
            .bind(extraction.confidence)
            .bind(&extraction.profile_used)
            .fetch_one(&mut *tx)
            .await
            .context("Failed to insert extraction")?;

            inserted.push(row_to_extraction(&row));
        }
        tx.commit().await.context("Failed to commit extractions")?;

        Ok(inserted)
    }

    pub async fn get(&self, extraction_id: Uuid) -> Result<Option<Extraction>> {
        let row = sqlx::query(&format!(
            "SELECT {EXTRACTION_COLUMNS} FROM extractions WHERE id = $1"
        ))
        .bind(extraction_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch extraction")?;

        Ok(row.as_ref().map(row_to_extraction))
    }

    pub async fn list_by_source(&self, source_id: Uuid) -> Result<Vec<Extraction>> {
        let rows = sqlx::query(&format!(
            "SELECT {EXTRACTION_COLUMNS} FROM extractions WHERE source_id = $1 ORDER BY created_at ASC"
        ))
        .bind(source_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list extractions by source")?;

        Ok(rows.iter().map(row_to_extraction).collect())
    }

    /// Ids of every extraction belonging to the given sources. Used by the
    /// cleanup service to delete vector points before the rows cascade.
    pub async fn ids_by_sources(&self, source_ids: &[Uuid]) -> Result<Vec<Uuid>> {
        let rows = sqlx::query("SELECT id FROM extractions WHERE source_id = ANY($1)")
            .bind(source_ids)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list extraction ids")?;

        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    /// Delete a source's extractions of the given types, returning the
    /// deleted ids (their vector points need removal too). Lets
    /// re-extraction of a source replace instead of duplicate.
    pub async fn delete_by_source_and_types(
        &self,
        source_id: Uuid,
        extraction_types: &[String],
    ) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            "DELETE FROM extractions WHERE source_id = $1 AND extraction_type = ANY($2) RETURNING id",
        )
        .bind(source_id)
        .bind(extraction_types)
        .fetch_all(&self.pool)
        .await
        .context("Failed to delete stale extractions")?;

        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    /// Mark extractions searchable: `embedding_id := id`.
    pub async fn set_embedding_ids(&self, extraction_ids: &[Uuid]) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE extractions SET embedding_id = id WHERE id = ANY($1)",
        )
        .bind(extraction_ids)
        .execute(&self.pool)
        .await
        .context("Failed to set embedding ids")?;

        Ok(result.rows_affected())
    }

    /// Orphans: non-empty data committed to Postgres, no vector yet.
    pub async fn find_orphaned(
        &self,
        project_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<Extraction>> {
        let rows = match project_id {
            Some(project_id) => {
                sqlx::query(&format!(
                    r#"
                    SELECT {EXTRACTION_COLUMNS} FROM extractions
                    WHERE embedding_id IS NULL
                      AND data <> '{{}}'::jsonb
                      AND project_id = $1
                    ORDER BY created_at ASC
                    LIMIT $2
                    "#
                ))
                .bind(project_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(&format!(
                    r#"
                    SELECT {EXTRACTION_COLUMNS} FROM extractions
                    WHERE embedding_id IS NULL
                      AND data <> '{{}}'::jsonb
                    ORDER BY created_at ASC
                    LIMIT $1
                    "#
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("Failed to find orphaned extractions")?;

        Ok(rows.iter().map(row_to_extraction).collect())
    }

    pub async fn count_orphaned(&self, project_id: Uuid) -> Result<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM extractions
            WHERE embedding_id IS NULL
              AND data <> '{}'::jsonb
              AND project_id = $1
            "#,
        )
        .bind(project_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count orphaned extractions")?;

        Ok(row.get("n"))
    }
}

fn row_to_extraction(row: &sqlx::postgres::PgRow) -> Extraction {
    Extraction {
        id: row.get("id"),
        project_id: row.get("project_id"),
        source_id: row.get("source_id"),
        source_group: row.get("source_group"),
        extraction_type: row.get("extraction_type"),
        data: row.get("data"),
        confidence: row.get("confidence"),
        profile_used: row.get("profile_used"),
        embedding_id: row.get("embedding_id"),
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
    }
}
