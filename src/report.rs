use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::models::{BatchReport, DashboardSummary, SosIncident};

pub fn build_report(
    generated_at: DateTime<Utc>,
    summary: &DashboardSummary,
    open_incidents: &[SosIncident],
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Student Risk Dashboard");
    let _ = writeln!(output, "Generated {}", generated_at.format("%Y-%m-%d %H:%M UTC"));
    let _ = writeln!(output);
    let _ = writeln!(output, "## Risk Levels");

    if summary.total() == 0 {
        let _ = writeln!(output, "No risk scores have been calculated yet.");
    } else {
        let _ = writeln!(output, "- green: {}", summary.green);
        let _ = writeln!(output, "- amber: {}", summary.amber);
        let _ = writeln!(output, "- red: {}", summary.red);
        let _ = writeln!(output, "- total: {}", summary.total());
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Highest Risk Students");

    if summary.high_risk.is_empty() {
        let _ = writeln!(output, "No students at red level.");
    } else {
        for student in summary.high_risk.iter() {
            let _ = writeln!(
                output,
                "- {} score {:.2} (calculated {})",
                student.full_name,
                student.overall,
                student.calculated_at.format("%Y-%m-%d")
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Open SOS Incidents");

    if open_incidents.is_empty() {
        let _ = writeln!(output, "No open incidents.");
    } else {
        for incident in open_incidents.iter() {
            let _ = writeln!(
                output,
                "- {} student {} on {}: {}{}",
                incident.id,
                incident.student_id,
                incident.created_at.format("%Y-%m-%d %H:%M"),
                incident.matched_keywords.join(", "),
                if incident.counselor_notified {
                    ""
                } else {
                    " (counselor not yet notified)"
                }
            );
        }
    }

    output
}

pub fn batch_summary(report: &BatchReport) -> String {
    let mut output = String::new();
    let _ = writeln!(
        output,
        "Recomputed {} students: {} succeeded, {} failed.",
        report.outcomes.len(),
        report.succeeded(),
        report.failed()
    );
    for (student_id, reason) in report.failures() {
        let _ = writeln!(output, "- {student_id}: {reason}");
    }
    output
}
