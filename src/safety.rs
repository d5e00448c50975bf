use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::SafetyConfig;
use crate::error::{IncidentError, StoreError};
use crate::locks::KeyedLocks;
use crate::models::{
    ChatMessage, IncidentAlert, IncidentStatus, MessageSeverity, SafetyReport, SosIncident,
};
use crate::notify::Notifier;
use crate::store::Store;

/// Case-insensitive substring match of `text` against `keywords`.
///
/// Returns the matching keywords in configured order, without duplicates.
pub fn match_keywords(text: &str, keywords: &[String]) -> Vec<String> {
    let haystack = text.to_lowercase();
    let mut matched: Vec<String> = Vec::new();
    for keyword in keywords {
        let needle = keyword.trim().to_lowercase();
        if needle.is_empty() || !haystack.contains(&needle) {
            continue;
        }
        if !matched.iter().any(|m| m.to_lowercase() == needle) {
            matched.push(keyword.trim().to_string());
        }
    }
    matched
}

/// Sums keyword weights: 0.8 per high-risk, 0.5 per medium-risk, 0.3 otherwise.
/// Tier entries match when they occur inside the matched keyword.
pub fn risk_points(matched: &[String], config: &SafetyConfig) -> f64 {
    let in_tier = |keyword: &str, tier: &[String]| {
        let keyword = keyword.to_lowercase();
        tier.iter().any(|entry| keyword.contains(&entry.to_lowercase()))
    };

    matched
        .iter()
        .map(|keyword| {
            if in_tier(keyword, &config.high_risk_keywords) {
                0.8
            } else if in_tier(keyword, &config.medium_risk_keywords) {
                0.5
            } else {
                0.3
            }
        })
        .sum()
}

fn severity_for(points: f64) -> MessageSeverity {
    if points >= 0.8 {
        MessageSeverity::Critical
    } else if points >= 0.5 {
        MessageSeverity::High
    } else if points >= 0.3 {
        MessageSeverity::Medium
    } else {
        MessageSeverity::Low
    }
}

/// Grades a set of matched keywords; an empty set is `Low`.
pub fn assess(matched: &[String], config: &SafetyConfig) -> MessageSeverity {
    severity_for(risk_points(matched, config))
}

/// Counselor actions for an alert, most urgent first.
pub fn intervention_recommendations(severity: MessageSeverity, matched: &[String]) -> Vec<String> {
    let actions: &[&str] = match severity {
        MessageSeverity::Critical => &[
            "IMMEDIATE ACTION REQUIRED: Contact student immediately",
            "Notify school counselor and administration",
            "Consider involving emergency services if student is unreachable",
            "Contact parent/guardian immediately",
            "Arrange for immediate in-person check-in",
        ],
        MessageSeverity::High => &[
            "Contact student within 1 hour",
            "Schedule immediate counseling session",
            "Notify parent/guardian",
            "Increase monitoring and check-ins",
            "Provide crisis hotline information",
        ],
        MessageSeverity::Medium => &[
            "Contact student within 24 hours",
            "Schedule counseling session within 48 hours",
            "Consider notifying parent/guardian",
            "Provide mental health resources",
            "Monitor for escalation",
        ],
        MessageSeverity::Low => &[
            "Continue regular monitoring",
            "Provide general mental health resources",
            "Encourage open communication",
        ],
    };
    let mut recommendations: Vec<String> = actions.iter().map(|a| a.to_string()).collect();

    let mentions = |needle: &str| matched.iter().any(|k| k.to_lowercase().contains(needle));
    if mentions("suicide") {
        recommendations.push("Suicide risk protocol activated - follow emergency procedures".into());
    }
    if mentions("harm") {
        recommendations.push("Self-harm risk identified - assess for physical safety".into());
    }
    recommendations
}

/// Screens each body and summarizes how many were flagged and how badly.
///
/// Overall risk escalates with either the worst single message or the number
/// of flagged messages (3+ critical, 2 high, 1 medium).
pub fn safety_report<'a, I>(
    bodies: I,
    config: &SafetyConfig,
    generated_at: DateTime<Utc>,
) -> SafetyReport
where
    I: IntoIterator<Item = &'a str>,
{
    let mut total_messages = 0;
    let mut keywords = std::collections::BTreeSet::new();
    let mut scores = Vec::new();

    for body in bodies {
        total_messages += 1;
        let matched = match_keywords(body, &config.keywords);
        if matched.is_empty() {
            continue;
        }
        scores.push(risk_points(&matched, config).min(1.0));
        keywords.extend(matched);
    }

    let flagged_messages = scores.len();
    let max_risk_score = scores.iter().copied().fold(0.0, f64::max);
    let avg_risk_score = if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f64>() / flagged_messages as f64
    };
    let overall_risk = severity_for(max_risk_score).max(match flagged_messages {
        0 => MessageSeverity::Low,
        1 => MessageSeverity::Medium,
        2 => MessageSeverity::High,
        _ => MessageSeverity::Critical,
    });

    SafetyReport {
        total_messages,
        flagged_messages,
        flagged_percentage: if total_messages == 0 {
            0.0
        } else {
            flagged_messages as f64 / total_messages as f64 * 100.0
        },
        unique_keywords: keywords.into_iter().collect(),
        avg_risk_score,
        max_risk_score,
        overall_risk,
        requires_immediate_attention: overall_risk >= MessageSeverity::High,
        generated_at,
    }
}

#[derive(Debug)]
pub struct MessageOutcome {
    pub message: ChatMessage,
    pub matched: Vec<String>,
    pub incident: Option<SosIncident>,
    pub alert: Option<IncidentAlert>,
    /// Pending counselor notification; resolves to whether delivery succeeded.
    pub dispatch: Option<JoinHandle<bool>>,
}

/// Screens chat messages and owns the SOS incident lifecycle.
pub struct SafetyMonitor<S: Store, N: Notifier> {
    store: Arc<S>,
    notifier: Arc<N>,
    config: SafetyConfig,
    /// Serializes incident writes per student.
    incident_locks: KeyedLocks<Uuid>,
}

impl<S: Store, N: Notifier> SafetyMonitor<S, N> {
    pub fn new(store: Arc<S>, notifier: Arc<N>, config: SafetyConfig) -> Self {
        Self {
            store,
            notifier,
            config,
            incident_locks: KeyedLocks::default(),
        }
    }

    /// Persists the message and, on a keyword match, the incident before
    /// returning. Counselor notification is dispatched in the background.
    pub async fn process_message(
        &self,
        sender_id: Uuid,
        body: &str,
        is_private: bool,
    ) -> Result<MessageOutcome, StoreError> {
        self.process_message_at(sender_id, body, is_private, Utc::now()).await
    }

    pub async fn process_message_at(
        &self,
        sender_id: Uuid,
        body: &str,
        is_private: bool,
        now: DateTime<Utc>,
    ) -> Result<MessageOutcome, StoreError> {
        let matched = match_keywords(body, &self.config.keywords);
        let message = ChatMessage {
            id: Uuid::new_v4(),
            sender_id,
            body: body.to_string(),
            is_private,
            flagged_for_sos: !matched.is_empty(),
            created_at: now,
        };
        self.store.insert_message(&message).await?;

        if matched.is_empty() {
            return Ok(MessageOutcome {
                message,
                matched,
                incident: None,
                alert: None,
                dispatch: None,
            });
        }

        let incident = self.record_incident(&message, &matched, now).await?;
        let severity = assess(&matched, &self.config);
        warn!(
            student_id = %sender_id,
            incident_id = %incident.id,
            severity = %severity,
            matched = %matched.join(", "),
            "chat message flagged for SOS"
        );

        let alert = IncidentAlert {
            incident_id: incident.id,
            student_id: sender_id,
            matched_keywords: matched.clone(),
            severity,
            recommendations: intervention_recommendations(severity, &matched),
            raised_at: now,
        };
        let dispatch = self.dispatch(alert.clone());

        Ok(MessageOutcome {
            message,
            matched,
            incident: Some(incident),
            alert: Some(alert),
            dispatch: Some(dispatch),
        })
    }

    async fn record_incident(
        &self,
        message: &ChatMessage,
        matched: &[String],
        now: DateTime<Utc>,
    ) -> Result<SosIncident, StoreError> {
        let _guard = self.incident_locks.lock(message.sender_id).await;

        let since = now - Duration::minutes(self.config.incident_merge_window_minutes);
        if let Some(open) = self.store.latest_open_incident(message.sender_id, since).await? {
            // Another process may have acknowledged it since the lookup.
            if let Some(incident) = self
                .store
                .append_to_open_incident(open.id, message.id, matched, now)
                .await?
            {
                return Ok(incident);
            }
        }

        let incident = SosIncident {
            id: Uuid::new_v4(),
            student_id: message.sender_id,
            message_ids: vec![message.id],
            matched_keywords: matched.to_vec(),
            status: IncidentStatus::Open,
            counselor_notified: false,
            notes: None,
            created_at: now,
            updated_at: now,
            resolved_at: None,
        };
        self.store.insert_incident(&incident).await?;
        Ok(incident)
    }

    fn dispatch(&self, alert: IncidentAlert) -> JoinHandle<bool> {
        let store = Arc::clone(&self.store);
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            if let Err(err) = notifier.notify(&alert).await {
                warn!(
                    incident_id = %alert.incident_id,
                    error = %err,
                    "counselor notification failed"
                );
                return false;
            }
            match store.mark_counselor_notified(alert.incident_id).await {
                Ok(()) => true,
                Err(err) => {
                    warn!(
                        incident_id = %alert.incident_id,
                        error = %err,
                        "failed to record counselor notification"
                    );
                    false
                }
            }
        })
    }

    pub async fn acknowledge(
        &self,
        incident_id: Uuid,
        notes: Option<&str>,
    ) -> Result<SosIncident, IncidentError> {
        self.transition(incident_id, IncidentStatus::Acknowledged, notes).await
    }

    pub async fn resolve(
        &self,
        incident_id: Uuid,
        notes: Option<&str>,
    ) -> Result<SosIncident, IncidentError> {
        self.transition(incident_id, IncidentStatus::Resolved, notes).await
    }

    async fn transition(
        &self,
        incident_id: Uuid,
        target: IncidentStatus,
        notes: Option<&str>,
    ) -> Result<SosIncident, IncidentError> {
        let student_id = self
            .store
            .incident(incident_id)
            .await?
            .ok_or(IncidentError::NotFound(incident_id))?
            .student_id;
        let _guard = self.incident_locks.lock(student_id).await;

        let mut incident = self
            .store
            .incident(incident_id)
            .await?
            .ok_or(IncidentError::NotFound(incident_id))?;
        let from = incident.status;
        if from.next() != Some(target) {
            return Err(IncidentError::InvalidTransition { from, to: target });
        }

        let now = Utc::now();
        incident.status = target;
        incident.updated_at = now;
        if target == IncidentStatus::Resolved {
            incident.resolved_at = Some(now);
        }
        if let Some(note) = notes.map(str::trim).filter(|note| !note.is_empty()) {
            incident.notes = Some(match incident.notes.take() {
                Some(existing) => format!("{existing}\n{note}"),
                None => note.to_string(),
            });
        }

        if !self.store.transition_incident(&incident, from).await? {
            let current = self
                .store
                .incident(incident_id)
                .await?
                .ok_or(IncidentError::NotFound(incident_id))?;
            return Err(IncidentError::InvalidTransition {
                from: current.status,
                to: target,
            });
        }
        info!(incident_id = %incident_id, status = %target, "incident updated");
        Ok(incident)
    }

    pub async fn incidents(
        &self,
        status: Option<IncidentStatus>,
    ) -> Result<Vec<SosIncident>, StoreError> {
        self.store.incidents(status).await
    }

    /// Screening summary of the student's messages over the report window.
    pub async fn student_report(
        &self,
        student_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<SafetyReport, StoreError> {
        let since = now - Duration::days(self.config.report_window_days);
        let messages = self.store.messages_from(student_id, since).await?;
        Ok(safety_report(
            messages.iter().map(|m| m.body.as_str()),
            &self.config,
            now,
        ))
    }

    /// Deletes non-flagged messages older than the retention window.
    pub async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let boundary = now - Duration::days(self.config.retention_days);
        let deleted = self.store.delete_expired_messages(boundary).await?;
        info!(deleted, boundary = %boundary, "expired chat messages removed");
        Ok(deleted)
    }
}
