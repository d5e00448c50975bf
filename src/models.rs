use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    pub id: Uuid,
    pub full_name: String,
    pub email: String,
    pub class_name: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttendanceTally {
    pub present_days: u32,
    pub total_days: u32,
}

/// Raw per-student signals as read from the persistence layer.
///
/// `None` means the underlying records are absent for the window; a present
/// value may still be zero (no overdue fees, no flagged messages).
#[derive(Debug, Clone, PartialEq)]
pub struct SignalSnapshot {
    pub student_id: Uuid,
    pub attendance: Option<AttendanceTally>,
    pub academic_ratio: Option<f64>,
    pub overdue_fee_amount: f64,
    pub flagged_message_ages_days: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Red,
    Amber,
    Green,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Red => "red",
            RiskLevel::Amber => "amber",
            RiskLevel::Green => "green",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "red" => Ok(RiskLevel::Red),
            "amber" => Ok(RiskLevel::Amber),
            "green" => Ok(RiskLevel::Green),
            other => Err(StoreError::InvalidValue(format!("risk level `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComponentScores {
    pub attendance: f64,
    pub academic: f64,
    pub fee: f64,
    pub chat: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskScore {
    pub student_id: Uuid,
    pub components: ComponentScores,
    pub overall: f64,
    pub level: RiskLevel,
    pub calculated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub body: String,
    pub is_private: bool,
    pub flagged_for_sos: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Open,
    Acknowledged,
    Resolved,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Open => "open",
            IncidentStatus::Acknowledged => "acknowledged",
            IncidentStatus::Resolved => "resolved",
        }
    }

    /// The only status staff may move an incident to from `self`.
    pub fn next(&self) -> Option<IncidentStatus> {
        match self {
            IncidentStatus::Open => Some(IncidentStatus::Acknowledged),
            IncidentStatus::Acknowledged => Some(IncidentStatus::Resolved),
            IncidentStatus::Resolved => None,
        }
    }
}

impl fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IncidentStatus {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "open" => Ok(IncidentStatus::Open),
            "acknowledged" => Ok(IncidentStatus::Acknowledged),
            "resolved" => Ok(IncidentStatus::Resolved),
            other => Err(StoreError::InvalidValue(format!("incident status `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SosIncident {
    pub id: Uuid,
    pub student_id: Uuid,
    pub message_ids: Vec<Uuid>,
    pub matched_keywords: Vec<String>,
    pub status: IncidentStatus,
    pub counselor_notified: bool,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for MessageSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MessageSeverity::Low => "low",
            MessageSeverity::Medium => "medium",
            MessageSeverity::High => "high",
            MessageSeverity::Critical => "critical",
        })
    }
}

/// What the notifier is told about an incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentAlert {
    pub incident_id: Uuid,
    pub student_id: Uuid,
    pub matched_keywords: Vec<String>,
    pub severity: MessageSeverity,
    pub recommendations: Vec<String>,
    pub raised_at: DateTime<Utc>,
}

/// Screening summary over a set of chat messages.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafetyReport {
    pub total_messages: usize,
    pub flagged_messages: usize,
    pub flagged_percentage: f64,
    /// Sorted.
    pub unique_keywords: Vec<String>,
    pub avg_risk_score: f64,
    pub max_risk_score: f64,
    pub overall_risk: MessageSeverity,
    pub requires_immediate_attention: bool,
    pub generated_at: DateTime<Utc>,
}

/// Per-student result of a batch run.
#[derive(Debug, Clone, PartialEq)]
pub enum StudentOutcome {
    Success { student_id: Uuid, score: RiskScore },
    Failure { student_id: Uuid, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub outcomes: Vec<StudentOutcome>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| matches!(outcome, StudentOutcome::Success { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    pub fn failures(&self) -> impl Iterator<Item = (Uuid, &str)> {
        self.outcomes.iter().filter_map(|outcome| match outcome {
            StudentOutcome::Failure { student_id, reason } => Some((*student_id, reason.as_str())),
            StudentOutcome::Success { .. } => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RiskExplanation {
    pub components: ComponentScores,
    pub factors: Vec<String>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlaggedStudent {
    pub student_id: Uuid,
    pub full_name: String,
    pub overall: f64,
    pub calculated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DashboardSummary {
    pub green: usize,
    pub amber: usize,
    pub red: usize,
    pub high_risk: Vec<FlaggedStudent>,
    pub open_incidents: usize,
}

impl DashboardSummary {
    pub fn total(&self) -> usize {
        self.green + self.amber + self.red
    }
}

/// Signal rows accepted by `import`.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalRecord {
    Attendance {
        student_id: Uuid,
        day: NaiveDate,
        present: bool,
    },
    Test {
        student_id: Uuid,
        taken_on: NaiveDate,
        score: f64,
        max_score: f64,
    },
    Fee {
        student_id: Uuid,
        due_on: NaiveDate,
        amount: f64,
        paid: bool,
    },
}
