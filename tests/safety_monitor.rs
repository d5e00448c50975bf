use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use student_safety::config::SafetyConfig;
use student_safety::error::{IncidentError, NotifyError};
use student_safety::memory::MemoryStore;
use student_safety::models::{IncidentAlert, IncidentStatus, MessageSeverity};
use student_safety::notify::Notifier;
use student_safety::safety::SafetyMonitor;
use student_safety::store::Store;
use tokio::sync::Mutex;

#[derive(Default)]
struct RecordingNotifier {
    alerts: Mutex<Vec<IncidentAlert>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, alert: &IncidentAlert) -> Result<(), NotifyError> {
        self.alerts.lock().await.push(alert.clone());
        Ok(())
    }
}

struct FailingNotifier;

#[async_trait]
impl Notifier for FailingNotifier {
    async fn notify(&self, _alert: &IncidentAlert) -> Result<(), NotifyError> {
        Err(NotifyError::Delivery("sms gateway unavailable".to_string()))
    }
}

fn config(keywords: &[&str]) -> SafetyConfig {
    SafetyConfig {
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
        ..SafetyConfig::default()
    }
}

#[tokio::test]
async fn flagged_message_opens_incident_and_notifies() {
    let store = Arc::new(MemoryStore::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let student = store.add_student("Avery Lee", "avery@example.edu").await;
    let monitor = SafetyMonitor::new(
        Arc::clone(&store),
        Arc::clone(&notifier),
        config(&["harm myself", "suicide"]),
    );

    let mut outcome = monitor
        .process_message(student, "I want to harm myself", true)
        .await
        .unwrap();

    assert!(outcome.message.flagged_for_sos);
    assert_eq!(outcome.matched, vec!["harm myself".to_string()]);
    let incident = outcome.incident.clone().unwrap();
    assert_eq!(incident.student_id, student);
    assert_eq!(incident.status, IncidentStatus::Open);
    assert_eq!(incident.message_ids, vec![outcome.message.id]);

    assert!(outcome.dispatch.take().unwrap().await.unwrap());
    let alerts = notifier.alerts.lock().await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].severity, MessageSeverity::High);
    assert_eq!(alerts[0].recommendations[0], "Contact student within 1 hour");
    assert_eq!(
        alerts[0].recommendations.last().map(String::as_str),
        Some("Self-harm risk identified - assess for physical safety")
    );
    assert_eq!(outcome.alert.as_ref(), Some(&alerts[0]));

    let stored = store.incidents(None).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert!(stored[0].counselor_notified);
}

#[tokio::test]
async fn clean_message_creates_no_incident() {
    let store = Arc::new(MemoryStore::default());
    let student = store.add_student("Avery Lee", "avery@example.edu").await;
    let monitor = SafetyMonitor::new(
        Arc::clone(&store),
        Arc::new(RecordingNotifier::default()),
        SafetyConfig::default(),
    );

    for body in ["see you at practice", "", "   "] {
        let outcome = monitor.process_message(student, body, true).await.unwrap();
        assert!(!outcome.message.flagged_for_sos);
        assert!(outcome.incident.is_none());
        assert!(outcome.dispatch.is_none());
    }
    assert!(store.incidents(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn notification_failure_keeps_incident() {
    let store = Arc::new(MemoryStore::default());
    let student = store.add_student("Avery Lee", "avery@example.edu").await;
    let monitor = SafetyMonitor::new(
        Arc::clone(&store),
        Arc::new(FailingNotifier),
        SafetyConfig::default(),
    );

    let outcome = monitor
        .process_message(student, "thinking about suicide", true)
        .await
        .unwrap();

    assert!(!outcome.dispatch.unwrap().await.unwrap());
    let stored = store.incidents(Some(IncidentStatus::Open)).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert!(!stored[0].counselor_notified);
    assert!(store.messages.lock().await[0].flagged_for_sos);
}

#[tokio::test]
async fn incident_persistence_failure_is_surfaced() {
    let store = Arc::new(MemoryStore::default());
    let student = store.add_student("Avery Lee", "avery@example.edu").await;
    store.fail_incident_writes.store(true, Ordering::Relaxed);
    let monitor = SafetyMonitor::new(
        Arc::clone(&store),
        Arc::new(RecordingNotifier::default()),
        SafetyConfig::default(),
    );

    let result = monitor.process_message(student, "i want to die", true).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn repeated_flags_within_window_join_open_incident() {
    let store = Arc::new(MemoryStore::default());
    let student = store.add_student("Avery Lee", "avery@example.edu").await;
    let monitor = SafetyMonitor::new(
        Arc::clone(&store),
        Arc::new(RecordingNotifier::default()),
        SafetyConfig::default(),
    );
    let start = Utc::now();

    let first = monitor
        .process_message_at(student, "I want to hurt myself", true, start)
        .await
        .unwrap();
    let second = monitor
        .process_message_at(student, "maybe suicide", true, start + Duration::minutes(20))
        .await
        .unwrap();

    let incidents = store.incidents(None).await.unwrap();
    assert_eq!(incidents.len(), 1);
    assert_eq!(
        incidents[0].matched_keywords,
        vec!["hurt myself".to_string(), "suicide".to_string()]
    );
    assert_eq!(
        incidents[0].message_ids,
        vec![first.message.id, second.message.id]
    );

    monitor
        .process_message_at(student, "I want to hurt myself", true, start + Duration::hours(3))
        .await
        .unwrap();
    assert_eq!(store.incidents(None).await.unwrap().len(), 2);
}

#[tokio::test]
async fn acknowledged_incident_is_not_extended() {
    let store = Arc::new(MemoryStore::default());
    let student = store.add_student("Avery Lee", "avery@example.edu").await;
    let monitor = SafetyMonitor::new(
        Arc::clone(&store),
        Arc::new(RecordingNotifier::default()),
        SafetyConfig::default(),
    );

    let first = monitor
        .process_message(student, "want to die", true)
        .await
        .unwrap();
    monitor
        .acknowledge(first.incident.unwrap().id, None)
        .await
        .unwrap();
    monitor
        .process_message(student, "want to die", true)
        .await
        .unwrap();

    assert_eq!(store.incidents(Some(IncidentStatus::Open)).await.unwrap().len(), 1);
    assert_eq!(
        store
            .incidents(Some(IncidentStatus::Acknowledged))
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn concurrent_flags_share_one_incident() {
    let store = Arc::new(MemoryStore::with_open_incident_delay(
        std::time::Duration::from_millis(50),
    ));
    let student = store.add_student("Avery Lee", "avery@example.edu").await;
    let monitor = SafetyMonitor::new(
        Arc::clone(&store),
        Arc::new(RecordingNotifier::default()),
        SafetyConfig::default(),
    );

    let (first, second) = tokio::join!(
        monitor.process_message(student, "want to die", true),
        monitor.process_message(student, "suicide", true)
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    let incidents = store.incidents(None).await.unwrap();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].message_ids.len(), 2);
    assert!(incidents[0].message_ids.contains(&first.message.id));
    assert!(incidents[0].message_ids.contains(&second.message.id));
}

#[tokio::test]
async fn late_flag_never_reopens_acknowledged_incident() {
    let store = Arc::new(MemoryStore::with_open_incident_delay(
        std::time::Duration::from_millis(100),
    ));
    let student = store.add_student("Avery Lee", "avery@example.edu").await;
    let monitor = Arc::new(SafetyMonitor::new(
        Arc::clone(&store),
        Arc::new(RecordingNotifier::default()),
        SafetyConfig::default(),
    ));
    let incident = monitor
        .process_message(student, "want to die", true)
        .await
        .unwrap()
        .incident
        .unwrap();

    let late = {
        let monitor = Arc::clone(&monitor);
        tokio::spawn(async move { monitor.process_message(student, "suicide", true).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let acknowledged = monitor
        .acknowledge(incident.id, Some("called"))
        .await
        .unwrap();
    assert_eq!(acknowledged.status, IncidentStatus::Acknowledged);
    late.await.unwrap().unwrap();

    let stored = store.incident(incident.id).await.unwrap().unwrap();
    assert_eq!(stored.status, IncidentStatus::Acknowledged);
    assert_eq!(stored.notes.as_deref(), Some("called"));
    assert_eq!(stored.message_ids.len(), 2);
    assert!(store.incidents(Some(IncidentStatus::Open)).await.unwrap().is_empty());
}

#[tokio::test]
async fn append_skips_incidents_that_left_open() {
    let store = Arc::new(MemoryStore::default());
    let student = store.add_student("Avery Lee", "avery@example.edu").await;
    let monitor = SafetyMonitor::new(
        Arc::clone(&store),
        Arc::new(RecordingNotifier::default()),
        SafetyConfig::default(),
    );
    let incident = monitor
        .process_message(student, "want to die", true)
        .await
        .unwrap()
        .incident
        .unwrap();
    monitor.acknowledge(incident.id, Some("called")).await.unwrap();

    let appended = store
        .append_to_open_incident(
            incident.id,
            uuid::Uuid::new_v4(),
            &["suicide".to_string()],
            Utc::now(),
        )
        .await
        .unwrap();
    assert!(appended.is_none());

    let stored = store.incident(incident.id).await.unwrap().unwrap();
    assert_eq!(stored.message_ids, incident.message_ids);
    assert_eq!(stored.matched_keywords, vec!["want to die".to_string()]);
}

#[tokio::test]
async fn stale_transition_is_rejected() {
    let store = Arc::new(MemoryStore::default());
    let student = store.add_student("Avery Lee", "avery@example.edu").await;
    let monitor = SafetyMonitor::new(
        Arc::clone(&store),
        Arc::new(RecordingNotifier::default()),
        SafetyConfig::default(),
    );
    let mut incident = monitor
        .process_message(student, "want to die", true)
        .await
        .unwrap()
        .incident
        .unwrap();
    monitor.acknowledge(incident.id, None).await.unwrap();

    incident.status = IncidentStatus::Acknowledged;
    assert!(!store
        .transition_incident(&incident, IncidentStatus::Open)
        .await
        .unwrap());
}

#[tokio::test]
async fn student_report_covers_recent_messages() {
    let store = Arc::new(MemoryStore::default());
    let student = store.add_student("Avery Lee", "avery@example.edu").await;
    let other = store.add_student("Jules Moreno", "jules@example.edu").await;
    let monitor = SafetyMonitor::new(
        Arc::clone(&store),
        Arc::new(RecordingNotifier::default()),
        SafetyConfig::default(),
    );
    let now = Utc::now();

    for (sender, body, at) in [
        (student, "I can't take it anymore", now - Duration::hours(2)),
        (student, "see you at practice", now - Duration::hours(1)),
        (student, "want to die", now - Duration::days(10)),
        (other, "suicide", now - Duration::hours(1)),
    ] {
        monitor.process_message_at(sender, body, true, at).await.unwrap();
    }

    let report = monitor.student_report(student, now).await.unwrap();
    assert_eq!(report.total_messages, 2);
    assert_eq!(report.flagged_messages, 1);
    assert!((report.flagged_percentage - 50.0).abs() < 1e-9);
    assert_eq!(report.unique_keywords, vec!["can't take it anymore".to_string()]);
    assert_eq!(report.max_risk_score, 0.5);
    assert_eq!(report.overall_risk, MessageSeverity::High);
    assert!(report.requires_immediate_attention);
}

#[tokio::test]
async fn incident_lifecycle_moves_one_step_at_a_time() {
    let store = Arc::new(MemoryStore::default());
    let student = store.add_student("Avery Lee", "avery@example.edu").await;
    let monitor = SafetyMonitor::new(
        Arc::clone(&store),
        Arc::new(RecordingNotifier::default()),
        SafetyConfig::default(),
    );
    let incident = monitor
        .process_message(student, "end my life", true)
        .await
        .unwrap()
        .incident
        .unwrap();

    let skipped = monitor.resolve(incident.id, None).await.unwrap_err();
    assert!(matches!(
        skipped,
        IncidentError::InvalidTransition {
            from: IncidentStatus::Open,
            to: IncidentStatus::Resolved
        }
    ));

    let acknowledged = monitor
        .acknowledge(incident.id, Some("called student"))
        .await
        .unwrap();
    assert_eq!(acknowledged.status, IncidentStatus::Acknowledged);

    let resolved = monitor
        .resolve(incident.id, Some("met with counselor"))
        .await
        .unwrap();
    assert_eq!(resolved.status, IncidentStatus::Resolved);
    assert!(resolved.resolved_at.is_some());
    assert_eq!(
        resolved.notes.as_deref(),
        Some("called student\nmet with counselor")
    );

    assert!(matches!(
        monitor.acknowledge(incident.id, None).await,
        Err(IncidentError::InvalidTransition { .. })
    ));
    assert!(matches!(
        monitor.acknowledge(uuid::Uuid::new_v4(), None).await,
        Err(IncidentError::NotFound(_))
    ));
}

#[tokio::test]
async fn retention_cleanup_spares_flagged_messages() {
    let store = Arc::new(MemoryStore::default());
    let student = store.add_student("Avery Lee", "avery@example.edu").await;
    let monitor = SafetyMonitor::new(
        Arc::clone(&store),
        Arc::new(RecordingNotifier::default()),
        SafetyConfig::default(),
    );
    let now = Utc::now();
    let old = now - Duration::days(16);

    let stale = monitor
        .process_message_at(student, "homework done", true, old)
        .await
        .unwrap();
    let flagged = monitor
        .process_message_at(student, "I want to harm myself", true, old)
        .await
        .unwrap();
    let fresh = monitor
        .process_message_at(student, "see you tomorrow", true, now - Duration::days(14))
        .await
        .unwrap();

    let deleted = monitor.cleanup_expired(now).await.unwrap();
    assert_eq!(deleted, 1);

    let remaining: Vec<_> = store.messages.lock().await.iter().map(|m| m.id).collect();
    assert!(!remaining.contains(&stale.message.id));
    assert!(remaining.contains(&flagged.message.id));
    assert!(remaining.contains(&fresh.message.id));
}

#[tokio::test]
async fn flagged_messages_lower_chat_score() {
    use student_safety::config::ScoringConfig;
    use student_safety::scorer::RiskScorer;

    let store = Arc::new(MemoryStore::default());
    let student = store.add_student("Avery Lee", "avery@example.edu").await;
    store.add_attendance(student, 20, 20).await;
    store.add_test(student, 90.0, 100.0).await;
    let monitor = SafetyMonitor::new(
        Arc::clone(&store),
        Arc::new(RecordingNotifier::default()),
        SafetyConfig::default(),
    );
    monitor
        .process_message(student, "i want to die", true)
        .await
        .unwrap();

    let scorer = RiskScorer::new(Arc::clone(&store), ScoringConfig::default());
    let score = scorer.recompute(student).await.unwrap();
    assert!((score.components.chat - (1.0 - 1.0 / 3.0)).abs() < 1e-9);
}
