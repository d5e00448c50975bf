use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use student_safety::config::ScoringConfig;
use student_safety::memory::MemoryStore;
use student_safety::models::{RiskLevel, SignalRecord, StudentOutcome};
use student_safety::scorer::RiskScorer;
use student_safety::store::Store;

#[tokio::test]
async fn healthy_student_scores_green() {
    let store = Arc::new(MemoryStore::default());
    let student = store.add_student("Avery Lee", "avery@example.edu").await;
    store.add_attendance(student, 18, 20).await;
    store.add_test(student, 82.0, 100.0).await;

    let scorer = RiskScorer::new(Arc::clone(&store), ScoringConfig::default());
    let score = scorer.recompute(student).await.unwrap();

    assert!((score.components.attendance - 0.9).abs() < 1e-9);
    assert!((score.components.academic - 0.82).abs() < 1e-9);
    assert_eq!(score.components.fee, 1.0);
    assert_eq!(score.components.chat, 1.0);
    assert!((score.overall - 0.916).abs() < 1e-9);
    assert_eq!(score.level, RiskLevel::Green);
    assert_eq!(store.risk_score(student).await.unwrap(), Some(score));
}

#[tokio::test]
async fn recompute_twice_is_idempotent_and_supersedes() {
    let store = Arc::new(MemoryStore::default());
    let student = store.add_student("Jules Moreno", "jules@example.edu").await;
    store.add_attendance(student, 12, 20).await;
    store.add_test(student, 55.0, 100.0).await;
    store
        .add_signal(SignalRecord::Fee {
            student_id: student,
            due_on: Utc::now().date_naive() - chrono::Duration::days(10),
            amount: 250.0,
            paid: false,
        })
        .await;

    let scorer = RiskScorer::new(Arc::clone(&store), ScoringConfig::default());
    let first = scorer.recompute(student).await.unwrap();
    let second = scorer.recompute(student).await.unwrap();

    assert_eq!(first.overall, second.overall);
    assert_eq!(first.level, second.level);
    assert_eq!(first.components.fee, 0.5);
    assert_eq!(store.scores.lock().await.len(), 1);
    assert_eq!(store.score_writes.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn batch_reports_partial_failures() {
    let store = Arc::new(MemoryStore::default());
    let first = store.add_student("Avery Lee", "avery@example.edu").await;
    let second = store.add_student("Jules Moreno", "jules@example.edu").await;
    let missing = store.add_student("Kiara Patel", "kiara@example.edu").await;
    for student in [first, second] {
        store.add_attendance(student, 17, 20).await;
        store.add_test(student, 70.0, 100.0).await;
    }
    store.add_test(missing, 90.0, 100.0).await;

    let scorer = RiskScorer::new(Arc::clone(&store), ScoringConfig::default());
    let report = scorer.recompute_all().await.unwrap();

    assert_eq!(report.succeeded(), 2);
    assert_eq!(report.failed(), 1);
    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures, vec![(missing, "missing attendance data")]);

    assert!(store.risk_score(first).await.unwrap().is_some());
    assert!(store.risk_score(second).await.unwrap().is_some());
    assert!(store.risk_score(missing).await.unwrap().is_none());
}

#[tokio::test]
async fn persistence_failure_is_isolated_to_one_student() {
    let store = Arc::new(MemoryStore::default());
    let ok = store.add_student("Avery Lee", "avery@example.edu").await;
    let broken = store.add_student("Jules Moreno", "jules@example.edu").await;
    for student in [ok, broken] {
        store.add_attendance(student, 20, 20).await;
        store.add_test(student, 90.0, 100.0).await;
    }
    store.failing_score_writes.lock().await.insert(broken);

    let scorer = RiskScorer::new(Arc::clone(&store), ScoringConfig::default());
    let report = scorer.recompute_all().await.unwrap();

    assert_eq!(report.succeeded(), 1);
    assert!(matches!(
        &report.outcomes[1],
        StudentOutcome::Failure { student_id, reason }
            if *student_id == broken && reason.contains("score write rejected")
    ));
}

#[tokio::test]
async fn batch_visits_each_active_student_once() {
    let store = Arc::new(MemoryStore::default());
    let mut students = Vec::new();
    for index in 0..12 {
        let id = store
            .add_student(&format!("Student {index}"), &format!("s{index}@example.edu"))
            .await;
        store.add_attendance(id, 15, 20).await;
        store.add_test(id, 60.0, 100.0).await;
        students.push(id);
    }
    store.students.lock().await[0].is_active = false;

    let scorer = RiskScorer::new(Arc::clone(&store), ScoringConfig::default());
    let report = scorer.recompute_all().await.unwrap();

    assert_eq!(report.outcomes.len(), 11);
    assert_eq!(report.succeeded(), 11);
    assert_eq!(store.score_writes.load(Ordering::Relaxed), 11);
    assert!(store.risk_score(students[0]).await.unwrap().is_none());
}

#[tokio::test]
async fn same_student_recomputes_are_serialized() {
    let store = Arc::new(MemoryStore::with_snapshot_delay(Duration::from_millis(50)));
    let student = store.add_student("Avery Lee", "avery@example.edu").await;
    store.add_attendance(student, 18, 20).await;
    store.add_test(student, 80.0, 100.0).await;
    let scorer = RiskScorer::new(Arc::clone(&store), ScoringConfig::default());

    let started = std::time::Instant::now();
    let (a, b) = tokio::join!(scorer.recompute(student), scorer.recompute(student));
    a.unwrap();
    b.unwrap();

    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn unknown_student_fails_cleanly() {
    let store = Arc::new(MemoryStore::default());
    let scorer = RiskScorer::new(store, ScoringConfig::default());
    let err = scorer.recompute(uuid::Uuid::new_v4()).await.unwrap_err();
    assert!(err.to_string().starts_with("no signal snapshot for student"));
}

#[tokio::test]
async fn dashboard_counts_levels_and_lists_red_students() {
    let store = Arc::new(MemoryStore::default());
    let healthy = store.add_student("Avery Lee", "avery@example.edu").await;
    store.add_attendance(healthy, 20, 20).await;
    store.add_test(healthy, 95.0, 100.0).await;

    let struggling = store.add_student("Kiara Patel", "kiara@example.edu").await;
    store.add_attendance(struggling, 4, 20).await;
    store.add_test(struggling, 20.0, 100.0).await;
    store
        .add_signal(SignalRecord::Fee {
            student_id: struggling,
            due_on: Utc::now().date_naive() - chrono::Duration::days(30),
            amount: 900.0,
            paid: false,
        })
        .await;

    let scorer = RiskScorer::new(Arc::clone(&store), ScoringConfig::default());
    scorer.recompute_all().await.unwrap();
    let summary = scorer.dashboard().await.unwrap();

    assert_eq!(summary.green, 1);
    assert_eq!(summary.red, 1);
    assert_eq!(summary.high_risk.len(), 1);
    assert_eq!(summary.high_risk[0].full_name, "Kiara Patel");

    let explanation = scorer.explain(struggling).await.unwrap();
    assert!(explanation
        .factors
        .contains(&"Poor attendance pattern detected".to_string()));
    assert!(explanation
        .recommendations
        .contains(&"Contact parents about fee payment arrangements".to_string()));
}
