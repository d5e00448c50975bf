use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ScoringConfig;
use crate::error::{ScoreError, StoreError};
use crate::locks::KeyedLocks;
use crate::models::{
    BatchReport, DashboardSummary, FlaggedStudent, IncidentStatus, RiskExplanation, RiskLevel,
    RiskScore, StudentOutcome,
};
use crate::risk;
use crate::store::Store;

const HIGH_RISK_LIMIT: usize = 10;

/// Computes and persists composite risk scores.
///
/// Recomputations for different students run in parallel; recomputations for
/// the same student are serialized on a per-student lock.
pub struct RiskScorer<S: Store> {
    store: Arc<S>,
    config: ScoringConfig,
    inflight: KeyedLocks<Uuid>,
}

impl<S: Store> RiskScorer<S> {
    pub fn new(store: Arc<S>, config: ScoringConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            inflight: KeyedLocks::default(),
        })
    }

    pub async fn recompute(&self, student_id: Uuid) -> Result<RiskScore, ScoreError> {
        let _guard = self.inflight.lock(student_id).await;

        let now = Utc::now();
        let snapshot = self
            .store
            .signal_snapshot(student_id, now, &self.config)
            .await?
            .ok_or(ScoreError::UnknownStudent(student_id))?;
        let score = risk::score_snapshot(&snapshot, &self.config, now)?;
        self.store.save_risk_score(&score).await?;

        info!(
            student_id = %student_id,
            overall = score.overall,
            risk_level = %score.level,
            "risk score recomputed"
        );
        Ok(score)
    }

    /// Scores every active student once. Per-student failures are collected
    /// into the report; only failing to list students aborts the run.
    pub async fn recompute_all(self: &Arc<Self>) -> Result<BatchReport, StoreError> {
        let mut seen = HashSet::new();
        let students: Vec<Uuid> = self
            .store
            .active_student_ids()
            .await?
            .into_iter()
            .filter(|id| seen.insert(*id))
            .collect();

        let permits = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
        let mut tasks = JoinSet::new();
        for student_id in students.iter().copied() {
            let scorer = Arc::clone(self);
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let outcome = match permits.acquire_owned().await {
                    Ok(_permit) => match scorer.recompute(student_id).await {
                        Ok(score) => StudentOutcome::Success { student_id, score },
                        Err(err) => StudentOutcome::Failure {
                            student_id,
                            reason: err.to_string(),
                        },
                    },
                    Err(_) => StudentOutcome::Failure {
                        student_id,
                        reason: "batch cancelled".to_string(),
                    },
                };
                (student_id, outcome)
            });
        }

        let mut outcomes: HashMap<Uuid, StudentOutcome> = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((student_id, outcome)) => {
                    outcomes.insert(student_id, outcome);
                }
                Err(err) => warn!(error = %err, "risk recompute task aborted"),
            }
        }

        let mut report = BatchReport::default();
        for student_id in students {
            let outcome = outcomes
                .remove(&student_id)
                .unwrap_or_else(|| StudentOutcome::Failure {
                    student_id,
                    reason: "recompute task aborted".to_string(),
                });
            if let StudentOutcome::Failure { reason, .. } = &outcome {
                warn!(student_id = %student_id, reason = %reason, "risk recompute failed");
            }
            report.outcomes.push(outcome);
        }

        info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            "risk batch complete"
        );
        Ok(report)
    }

    pub async fn explain(&self, student_id: Uuid) -> Result<RiskExplanation, ScoreError> {
        let snapshot = self
            .store
            .signal_snapshot(student_id, Utc::now(), &self.config)
            .await?
            .ok_or(ScoreError::UnknownStudent(student_id))?;
        let components = risk::component_scores(&snapshot, &self.config)?;
        Ok(risk::explain(components))
    }

    pub async fn dashboard(&self) -> Result<DashboardSummary, StoreError> {
        let scores = self.store.risk_scores().await?;
        let mut summary = DashboardSummary::default();
        let mut red = Vec::new();

        for score in scores {
            match score.level {
                RiskLevel::Green => summary.green += 1,
                RiskLevel::Amber => summary.amber += 1,
                RiskLevel::Red => {
                    summary.red += 1;
                    red.push(score);
                }
            }
        }

        red.sort_by(|a, b| {
            a.overall
                .partial_cmp(&b.overall)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        red.truncate(HIGH_RISK_LIMIT);

        let ids: Vec<Uuid> = red.iter().map(|score| score.student_id).collect();
        let names: HashMap<Uuid, String> = self.store.student_names(&ids).await?.into_iter().collect();
        summary.high_risk = red
            .into_iter()
            .map(|score| FlaggedStudent {
                full_name: names
                    .get(&score.student_id)
                    .cloned()
                    .unwrap_or_else(|| score.student_id.to_string()),
                student_id: score.student_id,
                overall: score.overall,
                calculated_at: score.calculated_at,
            })
            .collect();
        summary.open_incidents = self.store.incidents(Some(IncidentStatus::Open)).await?.len();

        Ok(summary)
    }
}
