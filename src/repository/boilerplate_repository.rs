//! Domain boilerplate repository: one fingerprint row per (project, domain).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::domain::DomainBoilerplate;

pub struct DomainBoilerplateRepository {
    pool: PgPool,
}

const BOILERPLATE_COLUMNS: &str = "id, project_id, domain, boilerplate_hashes, pages_analyzed, \
     blocks_total, blocks_boilerplate, bytes_removed_avg, threshold_pct, min_pages, \
     min_block_chars, updated_at";

impl DomainBoilerplateRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn upsert(
        &self,
        project_id: Uuid,
        domain: &str,
        boilerplate_hashes: &[String],
        pages_analyzed: i32,
        blocks_total: i32,
        blocks_boilerplate: i32,
        bytes_removed_avg: i32,
        threshold_pct: f64,
        min_pages: i32,
        min_block_chars: i32,
    ) -> Result<DomainBoilerplate> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO domain_boilerplate (
                project_id, domain, boilerplate_hashes, pages_analyzed, blocks_total,
                blocks_boilerplate, bytes_removed_avg, threshold_pct, min_pages, min_block_chars
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT ON CONSTRAINT uq_domain_boilerplate_project_domain DO UPDATE SET
                boilerplate_hashes = EXCLUDED.boilerplate_hashes,
                pages_analyzed = EXCLUDED.pages_analyzed,
                blocks_total = EXCLUDED.blocks_total,
                blocks_boilerplate = EXCLUDED.blocks_boilerplate,
                bytes_removed_avg = EXCLUDED.bytes_removed_avg,
                threshold_pct = EXCLUDED.threshold_pct,
                min_pages = EXCLUDED.min_pages,
                min_block_chars = EXCLUDED.min_block_chars,
                updated_at = now()
            RETURNING {BOILERPLATE_COLUMNS}
            "#
        ))
        .bind(project_id)
        .bind(domain)
        .bind(boilerplate_hashes)
        .bind(pages_analyzed)
        .bind(blocks_total)
        .bind(blocks_boilerplate)
        .bind(bytes_removed_avg)
        .bind(threshold_pct)
        .bind(min_pages)
        .bind(min_block_chars)
        .fetch_one(&self.pool)
        .await
        .context("Failed to upsert domain boilerplate")?;

        log::info!(
            "Stored boilerplate fingerprint for {} ({} hashes over {} pages)",
            domain,
            boilerplate_hashes.len(),
            pages_analyzed
        );
        Ok(row_to_boilerplate(&row))
    }

    pub async fn get(&self, project_id: Uuid, domain: &str) -> Result<Option<DomainBoilerplate>> {
        let row = sqlx::query(&format!(
            "SELECT {BOILERPLATE_COLUMNS} FROM domain_boilerplate WHERE project_id = $1 AND domain = $2"
        ))
        .bind(project_id)
        .bind(domain)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch domain boilerplate")?;

        Ok(row.as_ref().map(row_to_boilerplate))
    }

    pub async fn list_by_project(&self, project_id: Uuid) -> Result<Vec<DomainBoilerplate>> {
        let rows = sqlx::query(&format!(
            "SELECT {BOILERPLATE_COLUMNS} FROM domain_boilerplate WHERE project_id = $1 ORDER BY domain"
        ))
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list domain boilerplate")?;

        Ok(rows.iter().map(row_to_boilerplate).collect())
    }
}

fn row_to_boilerplate(row: &sqlx::postgres::PgRow) -> DomainBoilerplate {
    DomainBoilerplate {
        id: row.get("id"),
        project_id: row.get("project_id"),
        domain: row.get("domain"),
        boilerplate_hashes: row.get("boilerplate_hashes"),
        pages_analyzed: row.get("pages_analyzed"),
        blocks_total: row.get("blocks_total"),
        blocks_boilerplate: row.get("blocks_boilerplate"),
        bytes_removed_avg: row.get("bytes_removed_avg"),
        threshold_pct: row.get("threshold_pct"),
        min_pages: row.get("min_pages"),
        min_block_chars: row.get("min_block_chars"),
        updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
    }
}
