use thiserror::Error;
use uuid::Uuid;

use crate::models::IncidentStatus;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid stored value: {0}")]
    InvalidValue(String),
}

/// Signal components that must be present before a score can be computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalComponent {
    Attendance,
    Academic,
}

impl SignalComponent {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalComponent::Attendance => "attendance",
            SignalComponent::Academic => "academic",
        }
    }
}

#[derive(Debug, Error)]
pub enum ScoreError {
    #[error("missing {} data", .0.as_str())]
    MissingData(SignalComponent),
    #[error("no signal snapshot for student {0}")]
    UnknownStudent(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum IncidentError {
    #[error("incident {0} not found")]
    NotFound(Uuid),
    #[error("incident cannot move from {from} to {to}")]
    InvalidTransition {
        from: IncidentStatus,
        to: IncidentStatus,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to decode config: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unsupported config schema version `{0}`")]
    SchemaVersion(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
    #[error("notification outbox write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("notification encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}
