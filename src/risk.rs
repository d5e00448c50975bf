use chrono::{DateTime, Duration, Utc};

use crate::config::{ScoringConfig, Thresholds, Weights};
use crate::error::{ScoreError, SignalComponent};
use crate::models::{
    AttendanceTally, ComponentScores, RiskExplanation, RiskLevel, RiskScore, SignalSnapshot,
};

/// Component scores at or below this are reported as a severe factor.
const SEVERE_COMPONENT: f64 = 0.3;
/// Component scores at or below this are reported as a mild factor.
const WEAK_COMPONENT: f64 = 0.6;

pub fn recency_weight(days_ago: i64) -> f64 {
    match days_ago {
        i64::MIN..=7 => 1.0,
        8..=30 => 0.7,
        31..=60 => 0.4,
        _ => 0.2,
    }
}

pub fn cutoff(now: DateTime<Utc>, window_days: i64) -> DateTime<Utc> {
    now - Duration::days(window_days.max(1))
}

/// `None` when no days were recorded.
pub fn attendance_score(tally: AttendanceTally) -> Option<f64> {
    (tally.total_days > 0).then(|| clip(tally.present_days as f64 / tally.total_days as f64))
}

pub fn fee_score(overdue_amount: f64, threshold: f64) -> f64 {
    1.0 - (overdue_amount.max(0.0) / threshold).min(1.0)
}

pub fn chat_score(flag_ages_days: &[i64], threshold: f64) -> f64 {
    let weighted: f64 = flag_ages_days.iter().map(|age| recency_weight(*age)).sum();
    1.0 - (weighted / threshold).min(1.0)
}

/// Normalizes a snapshot into four components in [0, 1].
///
/// Fails when attendance or academic data is absent; no score is fabricated
/// from a partial snapshot.
pub fn component_scores(
    snapshot: &SignalSnapshot,
    config: &ScoringConfig,
) -> Result<ComponentScores, ScoreError> {
    let attendance = snapshot
        .attendance
        .and_then(attendance_score)
        .ok_or(ScoreError::MissingData(SignalComponent::Attendance))?;
    let academic = match snapshot.academic_ratio {
        Some(ratio) if ratio.is_finite() => clip(ratio),
        _ => return Err(ScoreError::MissingData(SignalComponent::Academic)),
    };

    Ok(ComponentScores {
        attendance,
        academic,
        fee: fee_score(snapshot.overdue_fee_amount, config.fee_overdue_threshold),
        chat: chat_score(&snapshot.flagged_message_ages_days, config.chat_flag_threshold),
    })
}

pub fn overall_score(components: &ComponentScores, weights: &Weights) -> f64 {
    components.attendance * weights.attendance
        + components.academic * weights.academic
        + components.fee * weights.fee
        + components.chat * weights.chat
}

pub fn classify(overall: f64, thresholds: &Thresholds) -> RiskLevel {
    if overall >= thresholds.green {
        RiskLevel::Green
    } else if overall >= thresholds.amber {
        RiskLevel::Amber
    } else {
        RiskLevel::Red
    }
}

pub fn score_snapshot(
    snapshot: &SignalSnapshot,
    config: &ScoringConfig,
    now: DateTime<Utc>,
) -> Result<RiskScore, ScoreError> {
    let components = component_scores(snapshot, config)?;
    let overall = overall_score(&components, &config.weights);
    Ok(RiskScore {
        student_id: snapshot.student_id,
        components,
        overall,
        level: classify(overall, &config.thresholds),
        calculated_at: now,
    })
}

pub fn explain(components: ComponentScores) -> RiskExplanation {
    let mut factors = Vec::new();
    let mut recommendations = Vec::new();

    let checks = [
        (
            components.attendance,
            "Poor attendance pattern detected",
            "Irregular attendance noted",
            "Schedule meeting with student and parents about attendance",
        ),
        (
            components.academic,
            "Declining academic performance",
            "Below-average test scores",
            "Arrange additional academic support or tutoring",
        ),
        (
            components.fee,
            "Multiple overdue fee payments",
            "Some overdue payments",
            "Contact parents about fee payment arrangements",
        ),
        (
            components.chat,
            "Concerning chat messages detected",
            "Some flagged communications",
            "Immediate counselor intervention required",
        ),
    ];

    for (score, severe, mild, recommendation) in checks {
        if score <= SEVERE_COMPONENT {
            factors.push(severe.to_string());
            recommendations.push(recommendation.to_string());
        } else if score <= WEAK_COMPONENT {
            factors.push(mild.to_string());
        }
    }

    if recommendations.is_empty() {
        recommendations.push("Continue regular monitoring and support".to_string());
    }

    RiskExplanation {
        components,
        factors,
        recommendations,
    }
}

fn clip(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}
