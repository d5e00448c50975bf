use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use student_safety::config::Config;
use student_safety::db::{self, PgStore};
use student_safety::models::IncidentStatus;
use student_safety::notify::{LogNotifier, Notifier, OutboxNotifier};
use student_safety::report;
use student_safety::safety::SafetyMonitor;
use student_safety::scheduler::{self, Cadence};
use student_safety::scorer::RiskScorer;
use student_safety::store::Store;

/// One week.
const MAX_CADENCE_MINS: u64 = 7 * 24 * 60;

#[derive(Parser)]
#[command(name = "student-safety")]
#[command(about = "Student risk scoring and chat safety monitoring", long_about = None)]
struct Cli {
    /// JSON config file; SAFETY_* environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Append counselor alerts as JSON lines to this file instead of logging them
    #[arg(long, global = true)]
    outbox: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import attendance, test and fee rows from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Validate and print the effective configuration
    CheckConfig,
    /// Recompute one student's risk score
    Score {
        #[arg(long)]
        email: String,
    },
    /// Recompute risk scores for every active student
    RecomputeAll,
    /// Explain the factors behind a student's risk
    Explain {
        #[arg(long)]
        email: String,
    },
    /// Send a chat message through the safety monitor
    Send {
        #[arg(long)]
        email: String,
        #[arg(long)]
        message: String,
        #[arg(long)]
        public: bool,
    },
    /// Summarize a student's recent chat messages for safety concerns
    SafetyReport {
        #[arg(long)]
        email: String,
    },
    /// List SOS incidents, newest first
    Incidents {
        #[arg(long)]
        status: Option<String>,
    },
    /// Acknowledge an open SOS incident
    Acknowledge {
        #[arg(long)]
        id: Uuid,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Resolve an acknowledged SOS incident
    Resolve {
        #[arg(long)]
        id: Uuid,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Delete non-flagged chat messages past the retention window
    Cleanup,
    /// Generate a markdown dashboard report
    Report {
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Run recomputation and retention cleanup on a cadence until Ctrl-C
    Schedule {
        #[arg(long, default_value_t = 60, value_parser = clap::value_parser!(u64).range(1..=MAX_CADENCE_MINS))]
        recompute_every_mins: u64,
        #[arg(long, default_value_t = 360, value_parser = clap::value_parser!(u64).range(1..=MAX_CADENCE_MINS))]
        cleanup_every_mins: u64,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_json = std::env::var("SAFETY_LOG_JSON")
        .map(|value| matches!(value.trim(), "1" | "true" | "yes"))
        .unwrap_or(false);
    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("invalid configuration")?;

    if let Commands::CheckConfig = cli.command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;
    let store = Arc::new(PgStore::new(pool));

    match cli.outbox {
        Some(path) => run(cli.command, config, store, Arc::new(OutboxNotifier::new(path))).await,
        None => run(cli.command, config, store, Arc::new(LogNotifier)).await,
    }
}

async fn run<N: Notifier>(
    command: Commands,
    config: Config,
    store: Arc<PgStore>,
    notifier: Arc<N>,
) -> anyhow::Result<()> {
    let scorer = RiskScorer::new(Arc::clone(&store), config.scoring.clone());
    let monitor = Arc::new(SafetyMonitor::new(
        Arc::clone(&store),
        notifier,
        config.safety.clone(),
    ));

    match command {
        Commands::InitDb => {
            db::init_db(store.pool()).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(store.pool()).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let inserted = db::import_csv(store.pool(), &csv).await?;
            println!("Inserted {inserted} signals from {}.", csv.display());
        }
        Commands::CheckConfig => {}
        Commands::Score { email } => {
            let student = find_student(store.as_ref(), &email).await?;
            let score = scorer.recompute(student.id).await?;
            println!(
                "{} ({}) score {:.3} -> {} [attendance {:.2}, academic {:.2}, fee {:.2}, chat {:.2}]",
                student.full_name,
                student.email,
                score.overall,
                score.level,
                score.components.attendance,
                score.components.academic,
                score.components.fee,
                score.components.chat
            );
        }
        Commands::RecomputeAll => {
            let batch = scorer.recompute_all().await?;
            print!("{}", report::batch_summary(&batch));
        }
        Commands::Explain { email } => {
            let student = find_student(store.as_ref(), &email).await?;
            let explanation = scorer.explain(student.id).await?;
            println!("Risk factors for {}:", student.full_name);
            if explanation.factors.is_empty() {
                println!("- none");
            }
            for factor in &explanation.factors {
                println!("- {factor}");
            }
            println!("Recommendations:");
            for recommendation in &explanation.recommendations {
                println!("- {recommendation}");
            }
        }
        Commands::Send {
            email,
            message,
            public,
        } => {
            let student = find_student(store.as_ref(), &email).await?;
            let outcome = monitor.process_message(student.id, &message, !public).await?;
            match &outcome.incident {
                Some(incident) => println!(
                    "Message {} flagged ({}); incident {} is {}.",
                    outcome.message.id,
                    outcome.matched.join(", "),
                    incident.id,
                    incident.status
                ),
                None => println!("Message {} stored.", outcome.message.id),
            }
            if let Some(alert) = &outcome.alert {
                println!("Severity: {}. Recommended actions:", alert.severity);
                for recommendation in &alert.recommendations {
                    println!("- {recommendation}");
                }
            }
            if let Some(dispatch) = outcome.dispatch {
                match dispatch.await {
                    Ok(true) => println!("Counselor notified."),
                    Ok(false) => println!("Counselor notification failed; see logs."),
                    Err(err) => println!("Counselor notification task failed: {err}"),
                }
            }
        }
        Commands::SafetyReport { email } => {
            let student = find_student(store.as_ref(), &email).await?;
            let summary = monitor.student_report(student.id, Utc::now()).await?;
            println!(
                "{}: {} of {} messages flagged ({:.1}%), overall risk {}",
                student.full_name,
                summary.flagged_messages,
                summary.total_messages,
                summary.flagged_percentage,
                summary.overall_risk
            );
            println!(
                "Max score {:.2}, average {:.2}; keywords: {}",
                summary.max_risk_score,
                summary.avg_risk_score,
                if summary.unique_keywords.is_empty() {
                    "none".to_string()
                } else {
                    summary.unique_keywords.join(", ")
                }
            );
            if summary.requires_immediate_attention {
                println!("Requires immediate attention.");
            }
        }
        Commands::Incidents { status } => {
            let status = status
                .as_deref()
                .map(str::parse::<IncidentStatus>)
                .transpose()
                .context("status must be open, acknowledged or resolved")?;
            let incidents = monitor.incidents(status).await?;
            if incidents.is_empty() {
                println!("No incidents found.");
            }
            for incident in incidents {
                println!(
                    "- {} [{}] student {} at {}: {}{}",
                    incident.id,
                    incident.status,
                    incident.student_id,
                    incident.created_at.format("%Y-%m-%d %H:%M"),
                    incident.matched_keywords.join(", "),
                    incident
                        .notes
                        .as_deref()
                        .map(|notes| format!(" | notes: {notes}"))
                        .unwrap_or_default()
                );
            }
        }
        Commands::Acknowledge { id, notes } => {
            let incident = monitor.acknowledge(id, notes.as_deref()).await?;
            println!("Incident {} is {}.", incident.id, incident.status);
        }
        Commands::Resolve { id, notes } => {
            let incident = monitor.resolve(id, notes.as_deref()).await?;
            println!("Incident {} is {}.", incident.id, incident.status);
        }
        Commands::Cleanup => {
            let deleted = monitor.cleanup_expired(Utc::now()).await?;
            println!("Deleted {deleted} expired messages.");
        }
        Commands::Report { out } => {
            let summary = scorer.dashboard().await?;
            let open = monitor.incidents(Some(IncidentStatus::Open)).await?;
            let markdown = report::build_report(Utc::now(), &summary, &open);
            std::fs::write(&out, markdown)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Schedule {
            recompute_every_mins,
            cleanup_every_mins,
        } => {
            let cadence = Cadence {
                recompute_every: Duration::from_secs(recompute_every_mins * 60),
                cleanup_every: Duration::from_secs(cleanup_every_mins * 60),
            };
            scheduler::run(scorer, monitor, cadence, async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await;
        }
    }

    Ok(())
}

async fn find_student<S: Store>(
    store: &S,
    email: &str,
) -> anyhow::Result<student_safety::models::Student> {
    store
        .student_by_email(email)
        .await?
        .with_context(|| format!("no student with email {email}"))
}
