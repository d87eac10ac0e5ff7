//! Operational alerts: always logged, optionally delivered to a webhook.
//!
//! Webhook delivery is throttled per (alert type, project) so a failing
//! batch cannot turn into an alert storm.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Default throttle window per alert type + project combination.
const DEFAULT_THROTTLE_SECONDS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    EmbeddingFailure,
    OrphanedExtractions,
    JobFailed,
    RecoveryCompleted,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmbeddingFailure => "embedding_failure",
            Self::OrphanedExtractions => "orphaned_extractions",
            Self::JobFailed => "job_failed",
            Self::RecoveryCompleted => "recovery_completed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub alert_type: AlertType,
    pub level: AlertLevel,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub project_id: Option<Uuid>,
    pub source_id: Option<Uuid>,
    pub job_id: Option<Uuid>,
    pub details: Value,
}

impl Alert {
    pub fn new(alert_type: AlertType, level: AlertLevel, title: &str, message: &str) -> Self {
        Self {
            alert_type,
            level,
            title: title.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
            project_id: None,
            source_id: None,
            job_id: None,
            details: json!({}),
        }
    }

    pub fn to_webhook_payload(&self) -> Value {
        json!({
            "type": self.alert_type.as_str(),
            "level": self.level.as_str(),
            "title": self.title,
            "message": self.message,
            "timestamp": self.timestamp.to_rfc3339(),
            "project_id": self.project_id.map(|id| id.to_string()),
            "source_id": self.source_id.map(|id| id.to_string()),
            "job_id": self.job_id.map(|id| id.to_string()),
            "details": self.details,
        })
    }

    pub fn to_slack_payload(&self) -> Value {
        let color = match self.level {
            AlertLevel::Info => "#36a64f",
            AlertLevel::Warning => "#ffcc00",
            AlertLevel::Error => "#ff6600",
            AlertLevel::Critical => "#ff0000",
        };

        let mut fields = Vec::new();
        if let Some(id) = self.project_id {
            fields.push(json!({"title": "Project", "value": id.to_string(), "short": true}));
        }
        if let Some(id) = self.source_id {
            fields.push(json!({"title": "Source", "value": id.to_string(), "short": true}));
        }
        if let Some(id) = self.job_id {
            fields.push(json!({"title": "Job", "value": id.to_string(), "short": true}));
        }
        if let Some(details) = self.details.as_object() {
            for (key, value) in details {
                let rendered = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                fields.push(json!({"title": key, "value": rendered, "short": true}));
            }
        }

        json!({
            "attachments": [{
                "color": color,
                "title": format!("[{}] {}", self.level.as_str().to_uppercase(), self.title),
                "text": self.message,
                "fields": fields,
                "ts": self.timestamp.timestamp(),
            }]
        })
    }
}

#[derive(Debug, Clone)]
pub struct AlertConfig {
    pub webhook_url: Option<String>,
    /// "json" or "slack".
    pub webhook_format: String,
    pub enabled: bool,
    pub throttle_seconds: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            webhook_format: "json".to_string(),
            enabled: true,
            throttle_seconds: DEFAULT_THROTTLE_SECONDS,
        }
    }
}

pub struct AlertService {
    config: AlertConfig,
    client: reqwest::Client,
    last_webhook: DashMap<(AlertType, Option<Uuid>), Instant>,
}

impl AlertService {
    pub fn new(config: AlertConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("Failed to create HTTP client"),
            last_webhook: DashMap::new(),
        }
    }

    /// Log the alert; deliver to the webhook when configured and not
    /// throttled. Returns false only when webhook delivery failed.
    pub async fn send(&self, alert: &Alert) -> bool {
        if !self.config.enabled {
            return true;
        }

        let context = format!(
            "[{}] {} - {} (project={:?}, job={:?})",
            alert.alert_type.as_str(),
            alert.title,
            alert.message,
            alert.project_id,
            alert.job_id
        );
        match alert.level {
            AlertLevel::Info => log::info!("{}", context),
            AlertLevel::Warning => log::warn!("{}", context),
            AlertLevel::Error | AlertLevel::Critical => log::error!("{}", context),
        }

        if self.config.webhook_url.is_some() {
            return self.send_webhook(alert).await;
        }
        true
    }

    fn is_throttled(&self, alert: &Alert) -> bool {
        if self.config.throttle_seconds == 0 {
            return false;
        }
        let key = (alert.alert_type, alert.project_id);
        match self.last_webhook.get(&key) {
            Some(last) => last.elapsed() < Duration::from_secs(self.config.throttle_seconds),
            None => false,
        }
    }

    async fn send_webhook(&self, alert: &Alert) -> bool {
        if self.is_throttled(alert) {
            log::debug!(
                "Webhook throttled for {} (project {:?})",
                alert.alert_type.as_str(),
                alert.project_id
            );
            // The alert was logged; skipping the webhook is not a failure.
            return true;
        }

        let url = self.config.webhook_url.as_deref().unwrap_or_default();
        let payload = if self.config.webhook_format == "slack" {
            alert.to_slack_payload()
        } else {
            alert.to_webhook_payload()
        };

        match self.client.post(url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                self.last_webhook
                    .insert((alert.alert_type, alert.project_id), Instant::now());
                true
            }
            Ok(response) => {
                log::error!(
                    "Webhook delivery failed with {} for {}",
                    response.status(),
                    alert.alert_type.as_str()
                );
                false
            }
            Err(err) => {
                log::error!("Webhook request error: {}", err);
                false
            }
        }
    }

    // Convenience constructors for the alerts the pipeline emits.

    pub async fn alert_embedding_failure(
        &self,
        project_id: Uuid,
        source_id: Uuid,
        extractions_affected: usize,
        error: &str,
    ) -> bool {
        let mut alert = Alert::new(
            AlertType::EmbeddingFailure,
            AlertLevel::Error,
            "Embedding Generation Failed",
            &format!(
                "Failed to embed {} extractions. Rows are stored but not searchable until recovered.",
                extractions_affected
            ),
        );
        alert.project_id = Some(project_id);
        alert.source_id = Some(source_id);
        alert.details = json!({
            "extractions_affected": extractions_affected,
            "error": truncate(error, 500),
        });
        self.send(&alert).await
    }

    pub async fn alert_orphaned_extractions(&self, project_id: Uuid, orphan_count: usize) -> bool {
        let mut alert = Alert::new(
            AlertType::OrphanedExtractions,
            AlertLevel::Warning,
            "Orphaned Extractions Detected",
            &format!(
                "Found {} extractions without embeddings. They stay invisible to search until recovered.",
                orphan_count
            ),
        );
        alert.project_id = Some(project_id);
        alert.details = json!({ "orphan_count": orphan_count });
        self.send(&alert).await
    }

    pub async fn alert_job_failed(
        &self,
        job_id: Uuid,
        job_type: &str,
        error: &str,
        project_id: Option<Uuid>,
    ) -> bool {
        let mut alert = Alert::new(
            AlertType::JobFailed,
            AlertLevel::Error,
            &format!("{} job failed", job_type),
            &format!("Job {} failed: {}", job_id, truncate(error, 200)),
        );
        alert.project_id = project_id;
        alert.job_id = Some(job_id);
        alert.details = json!({
            "job_type": job_type,
            "error": truncate(error, 500),
        });
        self.send(&alert).await
    }

    /// Info when everything recovered, warning when failures remain.
    pub async fn alert_recovery_completed(
        &self,
        recovered: usize,
        failed: usize,
        project_id: Option<Uuid>,
    ) -> bool {
        let level = if failed == 0 {
            AlertLevel::Info
        } else {
            AlertLevel::Warning
        };
        let scope = project_id
            .map(|id| format!("project {}", id))
            .unwrap_or_else(|| "all projects".to_string());

        let mut alert = Alert::new(
            AlertType::RecoveryCompleted,
            level,
            "Extraction Recovery Completed",
            &format!(
                "Recovery finished for {}: {} extractions recovered, {} failed.",
                scope, recovered, failed
            ),
        );
        alert.project_id = project_id;
        alert.details = json!({
            "recovered": recovered,
            "failed": failed,
            "scope": if project_id.is_some() { "project" } else { "global" },
        });
        self.send(&alert).await
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    #[test]
    fn webhook_payload_shape() {
        let mut alert = Alert::new(
            AlertType::EmbeddingFailure,
            AlertLevel::Error,
            "Title",
            "Message",
        );
        let project_id = Uuid::new_v4();
        alert.project_id = Some(project_id);
        alert.details = json!({"extractions_affected": 3});

        let payload = alert.to_webhook_payload();
        assert_eq!(payload["type"], "embedding_failure");
        assert_eq!(payload["level"], "error");
        assert_eq!(payload["project_id"], project_id.to_string());
        assert_eq!(payload["details"]["extractions_affected"], 3);
        assert_eq!(payload["source_id"], Value::Null);
    }

    #[test]
    fn slack_payload_carries_level_and_fields() {
        let mut alert = Alert::new(
            AlertType::JobFailed,
            AlertLevel::Warning,
            "Scrape job failed",
            "Something broke",
        );
        alert.job_id = Some(Uuid::new_v4());
        alert.details = json!({"error": "boom"});

        let payload = alert.to_slack_payload();
        let attachment = &payload["attachments"][0];
        assert_eq!(attachment["color"], "#ffcc00");
        assert!(attachment["title"].as_str().unwrap().starts_with("[WARNING]"));
        assert!(attachment["fields"].as_array().unwrap().len() >= 2);
    }

    #[tokio::test]
    async fn disabled_service_sends_nothing() {
        let service = AlertService::new(AlertConfig {
            enabled: false,
            webhook_url: Some("http://localhost:1/never".into()),
            ..AlertConfig::default()
        });
        let alert = Alert::new(AlertType::JobFailed, AlertLevel::Error, "t", "m");
        assert!(service.send(&alert).await);
    }

    #[tokio::test]
    async fn webhook_delivery_and_throttling() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let service = AlertService::new(AlertConfig {
            webhook_url: Some(format!("{}/hook", server.url())),
            webhook_format: "json".into(),
            enabled: true,
            throttle_seconds: 300,
        });

        let project_id = Uuid::new_v4();
        assert!(service.alert_orphaned_extractions(project_id, 3).await);
        // Second alert for the same (type, project) inside the window only
        // logs; the webhook sees exactly one request.
        assert!(service.alert_orphaned_extractions(project_id, 5).await);

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn different_projects_are_throttled_independently() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .with_status(200)
            .expect(2)
            .create_async()
            .await;

        let service = AlertService::new(AlertConfig {
            webhook_url: Some(format!("{}/hook", server.url())),
            webhook_format: "json".into(),
            enabled: true,
            throttle_seconds: 300,
        });

        assert!(service.alert_orphaned_extractions(Uuid::new_v4(), 1).await);
        assert!(service.alert_orphaned_extractions(Uuid::new_v4(), 1).await);

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn failed_webhook_returns_false() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("POST", "/hook")
            .with_status(500)
            .create_async()
            .await;

        let service = AlertService::new(AlertConfig {
            webhook_url: Some(format!("{}/hook", server.url())),
            webhook_format: "json".into(),
            enabled: true,
            throttle_seconds: 0,
        });

        let alert = Alert::new(AlertType::JobFailed, AlertLevel::Error, "t", "m");
        assert!(!service.send(&alert).await);
    }

    #[tokio::test]
    async fn recovery_alert_level_depends_on_failures() {
        let service = AlertService::new(AlertConfig::default());
        // No webhook configured: both calls only log and return true.
        assert!(service.alert_recovery_completed(5, 0, None).await);
        assert!(service.alert_recovery_completed(5, 2, Some(Uuid::new_v4())).await);
    }
}
