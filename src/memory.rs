use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::ScoringConfig;
use crate::error::StoreError;
use crate::models::{
    AttendanceTally, ChatMessage, IncidentStatus, RiskScore, SignalRecord, SignalSnapshot,
    SosIncident, Student,
};
use crate::risk;
use crate::store::Store;

/// In-process `Store` used by the integration tests.
#[derive(Default)]
pub struct MemoryStore {
    pub students: Mutex<Vec<Student>>,
    pub signals: Mutex<Vec<SignalRecord>>,
    pub scores: Mutex<HashMap<Uuid, RiskScore>>,
    pub messages: Mutex<Vec<ChatMessage>>,
    pub incidents: Mutex<Vec<SosIncident>>,
    /// Students whose score writes fail.
    pub failing_score_writes: Mutex<HashSet<Uuid>>,
    pub fail_incident_writes: std::sync::atomic::AtomicBool,
    pub score_writes: AtomicU64,
    pub snapshot_delay: Option<Duration>,
    pub open_incident_delay: Option<Duration>,
}

impl MemoryStore {
    pub fn with_snapshot_delay(delay: Duration) -> Self {
        Self {
            snapshot_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn with_open_incident_delay(delay: Duration) -> Self {
        Self {
            open_incident_delay: Some(delay),
            ..Self::default()
        }
    }

    pub async fn add_student(&self, full_name: &str, email: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.students.lock().await.push(Student {
            id,
            full_name: full_name.to_string(),
            email: email.to_string(),
            class_name: "10A".to_string(),
            is_active: true,
        });
        id
    }

    pub async fn add_signal(&self, record: SignalRecord) {
        self.signals.lock().await.push(record);
    }

    /// Records `present` of `total` days, ending today.
    pub async fn add_attendance(&self, student_id: Uuid, present: u32, total: u32) {
        let today = Utc::now().date_naive();
        let mut signals = self.signals.lock().await;
        for offset in 0..total {
            signals.push(SignalRecord::Attendance {
                student_id,
                day: today - chrono::Duration::days(i64::from(offset)),
                present: offset < present,
            });
        }
    }

    pub async fn add_test(&self, student_id: Uuid, score: f64, max_score: f64) {
        self.add_signal(SignalRecord::Test {
            student_id,
            taken_on: Utc::now().date_naive(),
            score,
            max_score,
        })
        .await;
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn active_student_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        Ok(self
            .students
            .lock()
            .await
            .iter()
            .filter(|student| student.is_active)
            .map(|student| student.id)
            .collect())
    }

    async fn student_by_email(&self, email: &str) -> Result<Option<Student>, StoreError> {
        Ok(self
            .students
            .lock()
            .await
            .iter()
            .find(|student| student.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn student_names(&self, ids: &[Uuid]) -> Result<Vec<(Uuid, String)>, StoreError> {
        Ok(self
            .students
            .lock()
            .await
            .iter()
            .filter(|student| ids.contains(&student.id))
            .map(|student| (student.id, student.full_name.clone()))
            .collect())
    }

    async fn signal_snapshot(
        &self,
        student_id: Uuid,
        now: DateTime<Utc>,
        config: &ScoringConfig,
    ) -> Result<Option<SignalSnapshot>, StoreError> {
        if let Some(delay) = self.snapshot_delay {
            tokio::time::sleep(delay).await;
        }
        if !self.students.lock().await.iter().any(|s| s.id == student_id) {
            return Ok(None);
        }

        let attendance_since = risk::cutoff(now, config.attendance_window_days);
        let academic_since = risk::cutoff(now, config.academic_window_days);
        let chat_since = risk::cutoff(now, config.chat_window_days);

        let mut tally = AttendanceTally {
            present_days: 0,
            total_days: 0,
        };
        let mut ratios = Vec::new();
        let mut overdue = 0.0;

        for record in self.signals.lock().await.iter() {
            match record {
                SignalRecord::Attendance {
                    student_id: id,
                    day,
                    present,
                } if *id == student_id && *day >= attendance_since.date_naive() => {
                    tally.total_days += 1;
                    if *present {
                        tally.present_days += 1;
                    }
                }
                SignalRecord::Test {
                    student_id: id,
                    taken_on,
                    score,
                    max_score,
                } if *id == student_id
                    && *max_score > 0.0
                    && *taken_on >= academic_since.date_naive() =>
                {
                    ratios.push(score / max_score);
                }
                SignalRecord::Fee {
                    student_id: id,
                    due_on,
                    amount,
                    paid,
                } if *id == student_id && !*paid && *due_on < now.date_naive() => {
                    overdue += amount;
                }
                _ => {}
            }
        }

        let flagged_message_ages_days = self
            .messages
            .lock()
            .await
            .iter()
            .filter(|m| m.sender_id == student_id && m.flagged_for_sos && m.created_at >= chat_since)
            .map(|m| (now - m.created_at).num_days())
            .collect();

        Ok(Some(SignalSnapshot {
            student_id,
            attendance: (tally.total_days > 0).then_some(tally),
            academic_ratio: (!ratios.is_empty())
                .then(|| ratios.iter().sum::<f64>() / ratios.len() as f64),
            overdue_fee_amount: overdue,
            flagged_message_ages_days,
        }))
    }

    async fn save_risk_score(&self, score: &RiskScore) -> Result<(), StoreError> {
        if self.failing_score_writes.lock().await.contains(&score.student_id) {
            return Err(StoreError::InvalidValue("score write rejected".to_string()));
        }
        self.score_writes.fetch_add(1, Ordering::Relaxed);
        self.scores.lock().await.insert(score.student_id, score.clone());
        Ok(())
    }

    async fn risk_score(&self, student_id: Uuid) -> Result<Option<RiskScore>, StoreError> {
        Ok(self.scores.lock().await.get(&student_id).cloned())
    }

    async fn risk_scores(&self) -> Result<Vec<RiskScore>, StoreError> {
        Ok(self.scores.lock().await.values().cloned().collect())
    }

    async fn insert_message(&self, message: &ChatMessage) -> Result<(), StoreError> {
        self.messages.lock().await.push(message.clone());
        Ok(())
    }

    async fn messages_from(
        &self,
        sender_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let mut messages: Vec<ChatMessage> = self
            .messages
            .lock()
            .await
            .iter()
            .filter(|m| m.sender_id == sender_id && m.created_at >= since)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    async fn delete_expired_messages(&self, boundary: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut messages = self.messages.lock().await;
        let before = messages.len();
        messages.retain(|m| m.flagged_for_sos || m.created_at >= boundary);
        Ok((before - messages.len()) as u64)
    }

    async fn latest_open_incident(
        &self,
        student_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Option<SosIncident>, StoreError> {
        if let Some(delay) = self.open_incident_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .incidents
            .lock()
            .await
            .iter()
            .filter(|i| {
                i.student_id == student_id && i.status == IncidentStatus::Open && i.updated_at >= since
            })
            .max_by_key(|i| i.updated_at)
            .cloned())
    }

    async fn insert_incident(&self, incident: &SosIncident) -> Result<(), StoreError> {
        if self.fail_incident_writes.load(Ordering::Relaxed) {
            return Err(StoreError::InvalidValue("incident write rejected".to_string()));
        }
        self.incidents.lock().await.push(incident.clone());
        Ok(())
    }

    async fn append_to_open_incident(
        &self,
        id: Uuid,
        message_id: Uuid,
        keywords: &[String],
        now: DateTime<Utc>,
    ) -> Result<Option<SosIncident>, StoreError> {
        if self.fail_incident_writes.load(Ordering::Relaxed) {
            return Err(StoreError::InvalidValue("incident write rejected".to_string()));
        }
        let mut incidents = self.incidents.lock().await;
        let Some(incident) = incidents
            .iter_mut()
            .find(|i| i.id == id && i.status == IncidentStatus::Open)
        else {
            return Ok(None);
        };
        for keyword in keywords {
            if !incident.matched_keywords.contains(keyword) {
                incident.matched_keywords.push(keyword.clone());
            }
        }
        incident.message_ids.push(message_id);
        incident.updated_at = now;
        Ok(Some(incident.clone()))
    }

    async fn transition_incident(
        &self,
        incident: &SosIncident,
        from: IncidentStatus,
    ) -> Result<bool, StoreError> {
        if self.fail_incident_writes.load(Ordering::Relaxed) {
            return Err(StoreError::InvalidValue("incident write rejected".to_string()));
        }
        let mut incidents = self.incidents.lock().await;
        let Some(slot) = incidents
            .iter_mut()
            .find(|i| i.id == incident.id && i.status == from)
        else {
            return Ok(false);
        };
        slot.status = incident.status;
        slot.notes = incident.notes.clone();
        slot.updated_at = incident.updated_at;
        slot.resolved_at = incident.resolved_at;
        Ok(true)
    }

    async fn incident(&self, id: Uuid) -> Result<Option<SosIncident>, StoreError> {
        Ok(self.incidents.lock().await.iter().find(|i| i.id == id).cloned())
    }

    async fn incidents(&self, status: Option<IncidentStatus>) -> Result<Vec<SosIncident>, StoreError> {
        let mut incidents: Vec<SosIncident> = self
            .incidents
            .lock()
            .await
            .iter()
            .filter(|i| status.map_or(true, |s| i.status == s))
            .cloned()
            .collect();
        incidents.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(incidents)
    }

    async fn mark_counselor_notified(&self, id: Uuid) -> Result<(), StoreError> {
        let mut incidents = self.incidents.lock().await;
        let incident = incidents
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("incident {id}")))?;
        incident.counselor_notified = true;
        Ok(())
    }
}
