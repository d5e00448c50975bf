use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const CONFIG_SCHEMA_VERSION: &str = "1";

const WEIGHT_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Weights {
    pub attendance: f64,
    pub academic: f64,
    pub fee: f64,
    pub chat: f64,
}

impl Weights {
    pub fn sum(&self) -> f64 {
        self.attendance + self.academic + self.fee + self.chat
    }

    fn as_array(&self) -> [f64; 4] {
        [self.attendance, self.academic, self.fee, self.chat]
    }
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            attendance: 0.3,
            academic: 0.3,
            fee: 0.2,
            chat: 0.2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub green: f64,
    pub amber: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            green: 0.75,
            amber: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub weights: Weights,
    pub thresholds: Thresholds,
    /// Overdue amount at which the fee component bottoms out at 0.
    pub fee_overdue_threshold: f64,
    /// Recency-weighted flag total at which the chat component bottoms out at 0.
    pub chat_flag_threshold: f64,
    pub attendance_window_days: i64,
    pub academic_window_days: i64,
    pub chat_window_days: i64,
    pub max_parallel: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: Weights::default(),
            thresholds: Thresholds::default(),
            fee_overdue_threshold: 500.0,
            chat_flag_threshold: 3.0,
            attendance_window_days: 30,
            academic_window_days: 60,
            chat_window_days: 30,
            max_parallel: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub keywords: Vec<String>,
    pub high_risk_keywords: Vec<String>,
    pub medium_risk_keywords: Vec<String>,
    pub retention_days: i64,
    /// Flags from the same student within this window join the open incident.
    pub incident_merge_window_minutes: i64,
    /// How far back a per-student safety report looks.
    pub report_window_days: i64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            keywords: to_strings(&[
                "harm myself",
                "suicide",
                "kill myself",
                "end my life",
                "hurt myself",
                "want to die",
                "don't want to live",
                "no point in living",
                "want to disappear",
                "can't take it anymore",
                "thinking about death",
                "suicidal thoughts",
                "self harm",
                "cut myself",
            ]),
            high_risk_keywords: to_strings(&["suicide", "kill myself", "end my life", "want to die"]),
            medium_risk_keywords: to_strings(&["harm myself", "hurt myself", "can't take it"]),
            retention_days: 15,
            incident_merge_window_minutes: 60,
            report_window_days: 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub schema_version: String,
    pub scoring: ScoringConfig,
    pub safety: SafetyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION.to_string(),
            scoring: ScoringConfig::default(),
            safety: SafetyConfig::default(),
        }
    }
}

impl Config {
    /// File (if any), then `SAFETY_*` environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_json(&std::fs::read_to_string(path)?)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(raw)?;
        if config.schema_version != CONFIG_SCHEMA_VERSION {
            return Err(ConfigError::SchemaVersion(config.schema_version));
        }
        Ok(config)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("SAFETY_KEYWORDS") {
            self.safety.keywords = raw
                .split(',')
                .map(str::trim)
                .filter(|keyword| !keyword.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(raw) = lookup("SAFETY_RETENTION_DAYS") {
            self.safety.retention_days = parse_number("SAFETY_RETENTION_DAYS", &raw)?;
        }
        if let Some(raw) = lookup("SAFETY_INCIDENT_MERGE_MINUTES") {
            self.safety.incident_merge_window_minutes =
                parse_number("SAFETY_INCIDENT_MERGE_MINUTES", &raw)?;
        }
        if let Some(raw) = lookup("SAFETY_WEIGHTS") {
            let values = raw
                .split(',')
                .map(|part| parse_number::<f64>("SAFETY_WEIGHTS", part.trim()))
                .collect::<Result<Vec<_>, _>>()?;
            let &[attendance, academic, fee, chat] = values.as_slice() else {
                return Err(ConfigError::Invalid(format!(
                    "SAFETY_WEIGHTS needs 4 values, got {}",
                    values.len()
                )));
            };
            self.scoring.weights = Weights {
                attendance,
                academic,
                fee,
                chat,
            };
        }
        if let Some(raw) = lookup("SAFETY_GREEN_THRESHOLD") {
            self.scoring.thresholds.green = parse_number("SAFETY_GREEN_THRESHOLD", &raw)?;
        }
        if let Some(raw) = lookup("SAFETY_AMBER_THRESHOLD") {
            self.scoring.thresholds.amber = parse_number("SAFETY_AMBER_THRESHOLD", &raw)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let weights = &self.scoring.weights;
        if weights.as_array().iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ConfigError::Invalid("weights must be non-negative".into()));
        }
        if (weights.sum() - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(ConfigError::Invalid(format!(
                "weights must sum to 1, got {:.6}",
                weights.sum()
            )));
        }

        let thresholds = &self.scoring.thresholds;
        if !(0.0..=1.0).contains(&thresholds.amber)
            || !(0.0..=1.0).contains(&thresholds.green)
            || thresholds.amber > thresholds.green
        {
            return Err(ConfigError::Invalid(format!(
                "thresholds need 0 <= amber <= green <= 1, got amber {} green {}",
                thresholds.amber, thresholds.green
            )));
        }

        if self.scoring.fee_overdue_threshold <= 0.0 || self.scoring.chat_flag_threshold <= 0.0 {
            return Err(ConfigError::Invalid("normalization thresholds must be positive".into()));
        }
        if self.scoring.attendance_window_days < 1
            || self.scoring.academic_window_days < 1
            || self.scoring.chat_window_days < 1
        {
            return Err(ConfigError::Invalid("signal windows must be at least one day".into()));
        }
        if self.scoring.max_parallel == 0 {
            return Err(ConfigError::Invalid("max_parallel must be at least 1".into()));
        }

        if self.safety.keywords.iter().any(|k| k.trim().is_empty()) {
            return Err(ConfigError::Invalid("keywords must not be blank".into()));
        }
        if self.safety.retention_days < 1 {
            return Err(ConfigError::Invalid("retention_days must be at least 1".into()));
        }
        if self.safety.report_window_days < 1 {
            return Err(ConfigError::Invalid("report_window_days must be at least 1".into()));
        }
        if self.safety.incident_merge_window_minutes < 0 {
            return Err(ConfigError::Invalid(
                "incident_merge_window_minutes must not be negative".into(),
            ));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{key} is not a number: `{raw}`")))
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}
