use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::error::NotifyError;
use crate::models::IncidentAlert;

/// Delivers incident alerts to counselors (email/SMS relay, log sink).
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn notify(&self, alert: &IncidentAlert) -> Result<(), NotifyError>;
}

/// Emits alerts as structured log events only.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, alert: &IncidentAlert) -> Result<(), NotifyError> {
        warn!(
            target: "safety_alert",
            incident_id = %alert.incident_id,
            student_id = %alert.student_id,
            severity = %alert.severity,
            keywords = %alert.matched_keywords.join(", "),
            recommendations = %alert.recommendations.join("; "),
            "counselor alert"
        );
        Ok(())
    }
}

/// Appends one JSON line per alert to a spool file picked up by the mail/SMS relay.
#[derive(Debug, Clone)]
pub struct OutboxNotifier {
    path: PathBuf,
}

impl OutboxNotifier {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Notifier for OutboxNotifier {
    async fn notify(&self, alert: &IncidentAlert) -> Result<(), NotifyError> {
        let mut line = serde_json::to_vec(alert)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}
