use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::config::ScoringConfig;
use crate::error::StoreError;
use crate::models::{
    AttendanceTally, ChatMessage, ComponentScores, IncidentStatus, RiskScore, SignalRecord,
    SignalSnapshot, SosIncident, Student,
};
use crate::risk;
use crate::store::Store;

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn risk_score_from_row(row: &PgRow) -> Result<RiskScore, StoreError> {
    let level: String = row.try_get("risk_level")?;
    Ok(RiskScore {
        student_id: row.try_get("student_id")?,
        components: ComponentScores {
            attendance: row.try_get("attendance_score")?,
            academic: row.try_get("academic_score")?,
            fee: row.try_get("fee_score")?,
            chat: row.try_get("chat_score")?,
        },
        overall: row.try_get("overall_score")?,
        level: level.parse()?,
        calculated_at: row.try_get("calculated_at")?,
    })
}

fn incident_from_row(row: &PgRow) -> Result<SosIncident, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(SosIncident {
        id: row.try_get("id")?,
        student_id: row.try_get("student_id")?,
        message_ids: row.try_get("message_ids")?,
        matched_keywords: row.try_get("matched_keywords")?,
        status: status.parse()?,
        counselor_notified: row.try_get("counselor_notified")?,
        notes: row.try_get("notes")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        resolved_at: row.try_get("resolved_at")?,
    })
}

fn message_from_row(row: &PgRow) -> Result<ChatMessage, StoreError> {
    Ok(ChatMessage {
        id: row.try_get("id")?,
        sender_id: row.try_get("sender_id")?,
        body: row.try_get("body")?,
        is_private: row.try_get("is_private")?,
        flagged_for_sos: row.try_get("flagged_for_sos")?,
        created_at: row.try_get("created_at")?,
    })
}

const INCIDENT_COLUMNS: &str = "id, student_id, message_ids, matched_keywords, status, \
    counselor_notified, notes, created_at, updated_at, resolved_at";

#[async_trait]
impl Store for PgStore {
    async fn active_student_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            "SELECT id FROM student_safety.students WHERE is_active ORDER BY full_name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|row| row.get("id")).collect())
    }

    async fn student_by_email(&self, email: &str) -> Result<Option<Student>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, full_name, email, class_name, is_active
            FROM student_safety.students
            WHERE lower(email) = lower($1)
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| Student {
            id: row.get("id"),
            full_name: row.get("full_name"),
            email: row.get("email"),
            class_name: row.get("class_name"),
            is_active: row.get("is_active"),
        }))
    }

    async fn student_names(&self, ids: &[Uuid]) -> Result<Vec<(Uuid, String)>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, full_name FROM student_safety.students WHERE id = ANY($1)",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get("id"), row.get("full_name")))
            .collect())
    }

    async fn signal_snapshot(
        &self,
        student_id: Uuid,
        now: DateTime<Utc>,
        config: &ScoringConfig,
    ) -> Result<Option<SignalSnapshot>, StoreError> {
        let known = sqlx::query("SELECT 1 FROM student_safety.students WHERE id = $1")
            .bind(student_id)
            .fetch_optional(&self.pool)
            .await?;
        if known.is_none() {
            return Ok(None);
        }

        let attendance = sqlx::query(
            r#"
            SELECT COUNT(*) AS total_days,
                   COUNT(*) FILTER (WHERE present) AS present_days
            FROM student_safety.attendance_records
            WHERE student_id = $1 AND day >= $2
            "#,
        )
        .bind(student_id)
        .bind(risk::cutoff(now, config.attendance_window_days).date_naive())
        .fetch_one(&self.pool)
        .await?;
        let total_days: i64 = attendance.get("total_days");
        let present_days: i64 = attendance.get("present_days");

        let academic = sqlx::query(
            r#"
            SELECT AVG(score / max_score) AS avg_ratio
            FROM student_safety.test_records
            WHERE student_id = $1 AND taken_on >= $2 AND max_score > 0
            "#,
        )
        .bind(student_id)
        .bind(risk::cutoff(now, config.academic_window_days).date_naive())
        .fetch_one(&self.pool)
        .await?;

        let fees = sqlx::query(
            r#"
            SELECT COALESCE(SUM(amount), 0) AS overdue
            FROM student_safety.fee_records
            WHERE student_id = $1 AND NOT paid AND due_on < $2
            "#,
        )
        .bind(student_id)
        .bind(now.date_naive())
        .fetch_one(&self.pool)
        .await?;

        let flagged = sqlx::query(
            r#"
            SELECT created_at
            FROM student_safety.chat_messages
            WHERE sender_id = $1 AND flagged_for_sos AND created_at >= $2
            "#,
        )
        .bind(student_id)
        .bind(risk::cutoff(now, config.chat_window_days))
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(SignalSnapshot {
            student_id,
            attendance: (total_days > 0).then(|| AttendanceTally {
                present_days: present_days.clamp(0, i64::from(u32::MAX)) as u32,
                total_days: total_days.clamp(0, i64::from(u32::MAX)) as u32,
            }),
            academic_ratio: academic.get("avg_ratio"),
            overdue_fee_amount: fees.get("overdue"),
            flagged_message_ages_days: flagged
                .iter()
                .map(|row| {
                    let created_at: DateTime<Utc> = row.get("created_at");
                    (now - created_at).num_days()
                })
                .collect(),
        }))
    }

    async fn save_risk_score(&self, score: &RiskScore) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO student_safety.risk_scores
            (student_id, attendance_score, academic_score, fee_score, chat_score,
             overall_score, risk_level, calculated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (student_id) DO UPDATE
            SET attendance_score = EXCLUDED.attendance_score,
                academic_score = EXCLUDED.academic_score,
                fee_score = EXCLUDED.fee_score,
                chat_score = EXCLUDED.chat_score,
                overall_score = EXCLUDED.overall_score,
                risk_level = EXCLUDED.risk_level,
                calculated_at = EXCLUDED.calculated_at
            "#,
        )
        .bind(score.student_id)
        .bind(score.components.attendance)
        .bind(score.components.academic)
        .bind(score.components.fee)
        .bind(score.components.chat)
        .bind(score.overall)
        .bind(score.level.as_str())
        .bind(score.calculated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn risk_score(&self, student_id: Uuid) -> Result<Option<RiskScore>, StoreError> {
        sqlx::query("SELECT * FROM student_safety.risk_scores WHERE student_id = $1")
            .bind(student_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(risk_score_from_row)
            .transpose()
    }

    async fn risk_scores(&self) -> Result<Vec<RiskScore>, StoreError> {
        sqlx::query("SELECT * FROM student_safety.risk_scores ORDER BY overall_score")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(risk_score_from_row)
            .collect()
    }

    async fn insert_message(&self, message: &ChatMessage) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO student_safety.chat_messages
            (id, sender_id, body, is_private, flagged_for_sos, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(message.id)
        .bind(message.sender_id)
        .bind(&message.body)
        .bind(message.is_private)
        .bind(message.flagged_for_sos)
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn messages_from(
        &self,
        sender_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        sqlx::query(
            r#"
            SELECT id, sender_id, body, is_private, flagged_for_sos, created_at
            FROM student_safety.chat_messages
            WHERE sender_id = $1 AND created_at >= $2
            ORDER BY created_at
            "#,
        )
        .bind(sender_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(message_from_row)
        .collect()
    }

    async fn delete_expired_messages(&self, boundary: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM student_safety.chat_messages
            WHERE created_at < $1 AND NOT flagged_for_sos
            "#,
        )
        .bind(boundary)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn latest_open_incident(
        &self,
        student_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Option<SosIncident>, StoreError> {
        let query = format!(
            "SELECT {INCIDENT_COLUMNS} FROM student_safety.sos_incidents \
             WHERE student_id = $1 AND status = 'open' AND updated_at >= $2 \
             ORDER BY updated_at DESC LIMIT 1"
        );
        sqlx::query(&query)
            .bind(student_id)
            .bind(since)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(incident_from_row)
            .transpose()
    }

    async fn insert_incident(&self, incident: &SosIncident) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO student_safety.sos_incidents
            (id, student_id, message_ids, matched_keywords, status,
             counselor_notified, notes, created_at, updated_at, resolved_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(incident.id)
        .bind(incident.student_id)
        .bind(&incident.message_ids)
        .bind(&incident.matched_keywords)
        .bind(incident.status.as_str())
        .bind(incident.counselor_notified)
        .bind(&incident.notes)
        .bind(incident.created_at)
        .bind(incident.updated_at)
        .bind(incident.resolved_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_to_open_incident(
        &self,
        id: Uuid,
        message_id: Uuid,
        keywords: &[String],
        now: DateTime<Utc>,
    ) -> Result<Option<SosIncident>, StoreError> {
        let query = format!(
            r#"
            UPDATE student_safety.sos_incidents
            SET message_ids = array_append(message_ids, $2),
                matched_keywords = matched_keywords || ARRAY(
                    SELECT k FROM unnest($3::text[]) WITH ORDINALITY AS t(k, n)
                    WHERE NOT (k = ANY(matched_keywords))
                    ORDER BY n
                ),
                updated_at = $4
            WHERE id = $1 AND status = 'open'
            RETURNING {INCIDENT_COLUMNS}
            "#
        );
        sqlx::query(&query)
            .bind(id)
            .bind(message_id)
            .bind(keywords)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(incident_from_row)
            .transpose()
    }

    async fn transition_incident(
        &self,
        incident: &SosIncident,
        from: IncidentStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE student_safety.sos_incidents
            SET status = $2,
                notes = $3,
                updated_at = $4,
                resolved_at = $5
            WHERE id = $1 AND status = $6
            "#,
        )
        .bind(incident.id)
        .bind(incident.status.as_str())
        .bind(&incident.notes)
        .bind(incident.updated_at)
        .bind(incident.resolved_at)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn incident(&self, id: Uuid) -> Result<Option<SosIncident>, StoreError> {
        let query = format!("SELECT {INCIDENT_COLUMNS} FROM student_safety.sos_incidents WHERE id = $1");
        sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(incident_from_row)
            .transpose()
    }

    async fn incidents(&self, status: Option<IncidentStatus>) -> Result<Vec<SosIncident>, StoreError> {
        let mut query = format!("SELECT {INCIDENT_COLUMNS} FROM student_safety.sos_incidents");
        if status.is_some() {
            query.push_str(" WHERE status = $1");
        }
        query.push_str(" ORDER BY created_at DESC");

        let mut rows = sqlx::query(&query);
        if let Some(status) = status {
            rows = rows.bind(status.as_str());
        }

        rows.fetch_all(&self.pool)
            .await?
            .iter()
            .map(incident_from_row)
            .collect()
    }

    async fn mark_counselor_notified(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE student_safety.sos_incidents SET counselor_notified = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

async fn upsert_student(
    pool: &PgPool,
    full_name: &str,
    email: &str,
    class_name: &str,
) -> anyhow::Result<Uuid> {
    let id = sqlx::query(
        r#"
        INSERT INTO student_safety.students (id, full_name, email, class_name)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (email) DO UPDATE
        SET full_name = EXCLUDED.full_name, class_name = EXCLUDED.class_name
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(full_name)
    .bind(email)
    .bind(class_name)
    .fetch_one(pool)
    .await?
    .get("id");
    Ok(id)
}

/// Inserts one signal row; returns false when `source_key` was already loaded.
async fn insert_signal(pool: &PgPool, record: &SignalRecord, source_key: &str) -> anyhow::Result<bool> {
    let result = match record {
        SignalRecord::Attendance {
            student_id,
            day,
            present,
        } => {
            sqlx::query(
                r#"
                INSERT INTO student_safety.attendance_records (id, student_id, day, present, source_key)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (source_key) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(student_id)
            .bind(day)
            .bind(present)
            .bind(source_key)
            .execute(pool)
            .await?
        }
        SignalRecord::Test {
            student_id,
            taken_on,
            score,
            max_score,
        } => {
            sqlx::query(
                r#"
                INSERT INTO student_safety.test_records
                (id, student_id, taken_on, score, max_score, source_key)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (source_key) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(student_id)
            .bind(taken_on)
            .bind(score)
            .bind(max_score)
            .bind(source_key)
            .execute(pool)
            .await?
        }
        SignalRecord::Fee {
            student_id,
            due_on,
            amount,
            paid,
        } => {
            sqlx::query(
                r#"
                INSERT INTO student_safety.fee_records
                (id, student_id, due_on, amount, paid, source_key)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (source_key) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(student_id)
            .bind(due_on)
            .bind(amount)
            .bind(paid)
            .bind(source_key)
            .execute(pool)
            .await?
        }
    };
    Ok(result.rows_affected() > 0)
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let students = [
        ("Avery Lee", "avery.lee@example.edu", "10A", 19u32, 0.86, 0.0),
        ("Jules Moreno", "jules.moreno@example.edu", "10A", 15, 0.64, 180.0),
        ("Kiara Patel", "kiara.patel@example.edu", "11B", 9, 0.41, 650.0),
    ];
    let today = Utc::now().date_naive();

    for (name, email, class_name, present_days, academic, overdue) in students {
        let student_id = upsert_student(pool, name, email, class_name).await?;

        for offset in 0..20u32 {
            let day = today - Duration::days(i64::from(offset));
            let record = SignalRecord::Attendance {
                student_id,
                day,
                present: offset < present_days,
            };
            insert_signal(pool, &record, &format!("seed-att-{email}-{offset}")).await?;
        }

        let tests = [
            (today - Duration::days(10), academic * 100.0),
            (today - Duration::days(3), academic * 100.0),
        ];
        for (index, (taken_on, score)) in tests.into_iter().enumerate() {
            let record = SignalRecord::Test {
                student_id,
                taken_on,
                score,
                max_score: 100.0,
            };
            insert_signal(pool, &record, &format!("seed-test-{email}-{index}")).await?;
        }

        if overdue > 0.0 {
            let due_on = NaiveDate::from_ymd_opt(2026, 1, 15).context("invalid date")?;
            let record = SignalRecord::Fee {
                student_id,
                due_on: due_on.min(today - Duration::days(1)),
                amount: overdue,
                paid: false,
            };
            insert_signal(pool, &record, &format!("seed-fee-{email}")).await?;
        }
    }

    Ok(())
}

pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        email: String,
        full_name: String,
        class_name: Option<String>,
        kind: String,
        occurred_on: NaiveDate,
        value: f64,
        max_value: Option<f64>,
        paid: Option<bool>,
        source_key: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut inserted = 0usize;

    for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result?;
        let student_id = upsert_student(
            pool,
            &row.full_name,
            &row.email,
            row.class_name.as_deref().unwrap_or("unassigned"),
        )
        .await?;

        let record = match row.kind.to_ascii_lowercase().as_str() {
            "attendance" => SignalRecord::Attendance {
                student_id,
                day: row.occurred_on,
                present: row.value > 0.0,
            },
            "test" => SignalRecord::Test {
                student_id,
                taken_on: row.occurred_on,
                score: row.value,
                max_score: row
                    .max_value
                    .with_context(|| format!("row {}: test rows need max_value", line + 1))?,
            },
            "fee" => SignalRecord::Fee {
                student_id,
                due_on: row.occurred_on,
                amount: row.value,
                paid: row.paid.unwrap_or(false),
            },
            other => anyhow::bail!("row {}: unknown signal kind `{other}`", line + 1),
        };

        let source_key = row
            .source_key
            .unwrap_or_else(|| format!("import-{}", Uuid::new_v4()));
        if insert_signal(pool, &record, &source_key).await? {
            inserted += 1;
        }
    }

    Ok(inserted)
}
