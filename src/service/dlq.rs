//! Dead-letter entries for extraction work that failed terminally.
//!
//! Entries live in a per-job redis list so job cleanup can drop them in one
//! DEL. Nothing consumes them automatically; they exist for inspection and
//! manual replay.

use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub job_id: Uuid,
    pub source_id: Option<Uuid>,
    pub error: String,
    pub created_at: chrono::DateTime<Utc>,
}

#[derive(Clone)]
pub struct DlqService {
    redis: ConnectionManager,
}

impl DlqService {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    pub async fn push(&self, job_id: Uuid, source_id: Option<Uuid>, error: &str) -> Result<()> {
        let entry = DlqEntry {
            job_id,
            source_id,
            error: error.to_string(),
            created_at: Utc::now(),
        };
        let mut redis = self.redis.clone();
        let _: () = redis
            .rpush(job_key(job_id), serde_json::to_string(&entry).unwrap_or_default())
            .await?;
        Ok(())
    }

    pub async fn list(&self, job_id: Uuid) -> Result<Vec<DlqEntry>> {
        let mut redis = self.redis.clone();
        let raw: Vec<String> = redis.lrange(job_key(job_id), 0, -1).await?;
        Ok(raw
            .iter()
            .filter_map(|item| serde_json::from_str(item).ok())
            .collect())
    }

    /// Drop every entry for a job; returns how many were removed.
    pub async fn remove_by_job_id(&self, job_id: Uuid) -> Result<u64> {
        let key = job_key(job_id);
        let mut redis = self.redis.clone();
        let count: u64 = redis.llen(&key).await?;
        if count > 0 {
            let _: () = redis.del(&key).await?;
        }
        Ok(count)
    }
}

fn job_key(job_id: Uuid) -> String {
    format!("dlq:jobs:{}", job_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_scoped_by_job() {
        let id = Uuid::new_v4();
        assert_eq!(job_key(id), format!("dlq:jobs:{}", id));
    }
}
