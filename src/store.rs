use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::ScoringConfig;
use crate::error::StoreError;
use crate::models::{ChatMessage, IncidentStatus, RiskScore, SignalSnapshot, SosIncident, Student};

/// Persistence seam shared by the scorer and the safety monitor.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn active_student_ids(&self) -> Result<Vec<Uuid>, StoreError>;

    async fn student_by_email(&self, email: &str) -> Result<Option<Student>, StoreError>;

    async fn student_names(&self, ids: &[Uuid]) -> Result<Vec<(Uuid, String)>, StoreError>;

    /// Returns `None` when the student is unknown.
    async fn signal_snapshot(
        &self,
        student_id: Uuid,
        now: DateTime<Utc>,
        config: &ScoringConfig,
    ) -> Result<Option<SignalSnapshot>, StoreError>;

    /// Replaces any prior score for the student.
    async fn save_risk_score(&self, score: &RiskScore) -> Result<(), StoreError>;

    async fn risk_score(&self, student_id: Uuid) -> Result<Option<RiskScore>, StoreError>;

    async fn risk_scores(&self) -> Result<Vec<RiskScore>, StoreError>;

    async fn insert_message(&self, message: &ChatMessage) -> Result<(), StoreError>;

    /// Oldest first.
    async fn messages_from(
        &self,
        sender_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<ChatMessage>, StoreError>;

    /// Deletes non-flagged messages created strictly before `boundary`.
    async fn delete_expired_messages(&self, boundary: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn latest_open_incident(
        &self,
        student_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Option<SosIncident>, StoreError>;

    async fn insert_incident(&self, incident: &SosIncident) -> Result<(), StoreError>;

    /// Appends a message and any new keywords to an incident that is still
    /// `open`. Returns `None` without writing when it is not.
    async fn append_to_open_incident(
        &self,
        id: Uuid,
        message_id: Uuid,
        keywords: &[String],
        now: DateTime<Utc>,
    ) -> Result<Option<SosIncident>, StoreError>;

    /// Writes status, notes, `updated_at` and `resolved_at` only if the stored
    /// status is still `from`. Returns whether a row was written.
    async fn transition_incident(
        &self,
        incident: &SosIncident,
        from: IncidentStatus,
    ) -> Result<bool, StoreError>;

    async fn incident(&self, id: Uuid) -> Result<Option<SosIncident>, StoreError>;

    /// Newest first.
    async fn incidents(&self, status: Option<IncidentStatus>) -> Result<Vec<SosIncident>, StoreError>;

    async fn mark_counselor_notified(&self, id: Uuid) -> Result<(), StoreError>;
}
