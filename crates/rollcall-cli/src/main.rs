use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use rollcall_core::enroll::{self, EnrollSummary};
use rollcall_core::matcher;
use rollcall_core::retention::{self, ANNOTATED_EXTENSION, ANNOTATED_PREFIX};
use rollcall_core::timeline::{self, TimelineEntry};
use rollcall_core::{CommandEncoder, Config, EmbeddingIndex, GalleryCache, PutMode, RecognitionPipeline};
use rollcall_store::{AttendanceStore, NewStudent, SessionRequest};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "rollcall", version, about = "Face-recognition attendance")]
struct Cli {
    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll an identity from one or more photos
    Enroll {
        /// Identity name; must match the roster name to be marked present
        name: String,
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Add to the identity's stored vectors instead of replacing them
        #[arg(long)]
        append: bool,
    },
    /// Enroll every identity subdirectory of a dataset directory
    EnrollDataset {
        /// Defaults to the configured dataset directory
        dir: Option<PathBuf>,
    },
    /// Recognize a class photo and record attendance
    Recognize {
        photo: PathBuf,
        #[arg(long)]
        subject: i64,
        #[arg(long)]
        teacher: i64,
        /// Cosine similarity threshold (default: configured recognition threshold)
        #[arg(long, conflicts_with = "reverify", value_parser = parse_threshold)]
        threshold: Option<f32>,
        /// Use the stricter re-verification threshold
        #[arg(long)]
        reverify: bool,
    },
    /// List enrolled identities
    Identities,
    /// Remove an enrolled identity and its vectors
    Forget { name: String },
    /// Manage the student roster
    Roster {
        #[command(subcommand)]
        action: RosterAction,
    },
    /// List recorded sessions, newest first
    Sessions {
        #[arg(short, long)]
        limit: Option<u32>,
    },
    /// Show one session's attendance
    Session { id: i64 },
    /// Per-student attendance totals
    Report,
    /// Student, session and presence counts for a day
    Stats {
        /// YYYY-MM-DD (default: today)
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Recent recognition runs
    Timeline,
    /// Delete all but the newest annotated images
    Cleanup {
        /// Defaults to the configured max recent captures
        #[arg(long)]
        keep: Option<usize>,
    },
    /// Show daemon status
    Status,
}

#[derive(Subcommand)]
enum RosterAction {
    /// Add a student
    Add {
        name: String,
        #[arg(long)]
        roll_no: Option<String>,
        #[arg(long)]
        department: Option<String>,
    },
    /// List students
    List,
    /// Remove a student and their attendance records
    Remove { id: i64 },
}

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn status(&self) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("failed to load configuration")?;
    let json = cli.json;

    match cli.command {
        Commands::Enroll { name, images, append } => {
            let mode = if append { PutMode::Append } else { PutMode::Replace };
            let gallery = open_gallery(&config)?;
            let mut encoder = CommandEncoder::from_config(&config)?;
            let summary = enroll::enroll_images(&mut encoder, &gallery, &name, &images, mode)
                .with_context(|| format!("failed to enroll {name}"))?;
            print_enrolled(json, &[summary])?;
        }
        Commands::EnrollDataset { dir } => {
            let dir = dir.unwrap_or_else(|| config.dataset_dir.clone());
            let gallery = open_gallery(&config)?;
            let mut encoder = CommandEncoder::from_config(&config)?;
            let summaries = enroll::enroll_dataset(&mut encoder, &gallery, &dir)
                .with_context(|| format!("failed to enroll dataset {}", dir.display()))?;
            print_enrolled(json, &summaries)?;
        }
        Commands::Recognize {
            photo,
            subject,
            teacher,
            threshold,
            reverify,
        } => {
            let threshold = match (threshold, reverify) {
                (Some(t), _) => t,
                (None, true) => config.reverify_threshold,
                (None, false) => config.recognition_threshold,
            };
            recognize(&config, json, photo, SessionRequest::now(subject, teacher), threshold)?;
        }
        Commands::Identities => {
            let index = EmbeddingIndex::open(&config.encodings_dir, config.embedding_dim)?;
            let identities = index.identities()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&identities)?);
            } else if identities.is_empty() {
                println!("No identities enrolled");
            } else {
                for id in identities {
                    let state = if id.present { "" } else { "  (vector file missing)" };
                    println!("{:<24} {:>3} vectors  {}{state}", id.name, id.vectors, id.file);
                }
            }
        }
        Commands::Forget { name } => {
            let index = EmbeddingIndex::open(&config.encodings_dir, config.embedding_dim)?;
            index.remove(&name).with_context(|| format!("failed to remove {name}"))?;
            println!("Removed identity {name}");
        }
        Commands::Roster { action } => roster(&config, json, action)?,
        Commands::Sessions { limit } => {
            let store = open_store(&config)?;
            let sessions = store.list_sessions(limit)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else {
                for s in sessions {
                    println!(
                        "#{:<5} {} {}-{}  subject {:<4} teacher {:<4} present {:>3}  absent {:>3}",
                        s.session.id,
                        s.session.date,
                        s.session.start_time,
                        s.session.end_time,
                        s.session.subject_id,
                        s.session.teacher_id,
                        s.present,
                        s.absent
                    );
                }
            }
        }
        Commands::Session { id } => {
            let store = open_store(&config)?;
            let session = store.session(id)?;
            let entries = store.session_attendance(id)?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "session": session,
                        "attendance": entries,
                    }))?
                );
            } else {
                println!(
                    "Session #{} on {} {}-{} (subject {}, teacher {})",
                    session.id, session.date, session.start_time, session.end_time, session.subject_id, session.teacher_id
                );
                for e in entries {
                    let confidence = e.confidence.map(|c| format!("{c:.2}")).unwrap_or_default();
                    println!("  {:<24} {:<8} {confidence}", e.name, e.status);
                }
            }
        }
        Commands::Report => {
            let store = open_store(&config)?;
            let report = store.attendance_report()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for r in report {
                    println!(
                        "{:<24} present {:>3}  absent {:>3}  total {:>3}  {:>6.2}%",
                        r.name, r.present, r.absent, r.total, r.percentage
                    );
                }
            }
        }
        Commands::Stats { date } => {
            let date = date.unwrap_or_else(|| chrono::Local::now().date_naive());
            let stats = open_store(&config)?.dashboard_stats(date)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Date:            {date}");
                println!("Students:        {}", stats.total_students);
                println!("Sessions:        {}", stats.sessions_on_date);
                println!("Present:         {}", stats.present_on_date);
            }
        }
        Commands::Timeline => {
            let entries = timeline::read(&config.timeline_path)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for e in entries {
                    println!(
                        "{}  {:<40} marked {:>3} of {:>3} faces  subject {} teacher {}",
                        e.timestamp, e.photo, e.marked, e.faces_found, e.subject_id, e.teacher_id
                    );
                }
            }
        }
        Commands::Cleanup { keep } => {
            let keep = keep.unwrap_or(config.max_recent_captures);
            let removed = retention::cleanup_old_files(&config.output_dir, ANNOTATED_PREFIX, ANNOTATED_EXTENSION, keep)
                .with_context(|| format!("failed to clean {}", config.output_dir.display()))?;
            println!("Removed {removed} annotated image(s), kept up to {keep}");
        }
        Commands::Status => {
            let conn = zbus::Connection::session().await?;
            let proxy = AttendanceProxy::new(&conn).await?;
            match proxy.status().await {
                Ok(status) => println!("{status}"),
                Err(e) => {
                    tracing::debug!(error = %e, "status call failed");
                    println!("rollcalld: not running");
                }
            }
        }
    }

    Ok(())
}

fn open_gallery(config: &Config) -> Result<GalleryCache> {
    let index = EmbeddingIndex::open(&config.encodings_dir, config.embedding_dim)
        .with_context(|| format!("failed to open index {}", config.encodings_dir.display()))?;
    Ok(GalleryCache::new(index))
}

fn open_store(config: &Config) -> Result<AttendanceStore> {
    AttendanceStore::open(&config.db_path)
        .with_context(|| format!("failed to open database {}", config.db_path.display()))
}

fn parse_threshold(arg: &str) -> Result<f32, String> {
    let value: f32 = arg.parse().map_err(|e| format!("{e}"))?;
    matcher::check_threshold(value).map_err(|e| e.to_string())
}

fn recognize(config: &Config, json: bool, photo: PathBuf, session: SessionRequest, threshold: f32) -> Result<()> {
    config.ensure_dirs()?;
    let gallery = Arc::new(open_gallery(config)?);
    let mut pipeline = RecognitionPipeline::from_config(config, gallery)?;
    let mut store = open_store(config)?;

    let recognition = pipeline
        .recognize(&photo, threshold)
        .with_context(|| format!("failed to recognize {}", photo.display()))?;
    let outcome = store.reconcile(&session, &recognition.results)?;

    let entry = TimelineEntry {
        timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        photo: recognition.annotated_filename.clone(),
        marked: outcome.recognized_count,
        faces_found: recognition.faces_found,
        subject_id: session.subject_id,
        teacher_id: session.teacher_id,
    };
    if let Err(e) = timeline::append(&config.timeline_path, entry) {
        tracing::warn!(error = %e, "timeline update failed");
    }

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "faces_found": recognition.faces_found,
                "recognized": recognition.recognized,
                "results": recognition.results,
                "annotated_path": recognition.annotated_path,
                "attendance": outcome,
            }))?
        );
        return Ok(());
    }

    println!(
        "{} face(s) found, {} recognized (threshold {threshold:.2})",
        recognition.faces_found, recognition.recognized
    );
    for r in &recognition.results {
        println!("  {:<24} {:.2}", r.name, r.confidence);
    }
    println!(
        "Session #{}: {} marked present: {}",
        outcome.session_id,
        outcome.recognized_count,
        outcome.names_marked_present.join(", ")
    );
    println!("Annotated image: {}", recognition.annotated_path.display());
    Ok(())
}

fn roster(config: &Config, json: bool, action: RosterAction) -> Result<()> {
    let store = open_store(config)?;
    match action {
        RosterAction::Add {
            name,
            roll_no,
            department,
        } => {
            let student = store.add_student(&NewStudent {
                name,
                roll_no,
                department,
            })?;
            if json {
                println!("{}", serde_json::to_string_pretty(&student)?);
            } else {
                println!("Added student #{} {}", student.id, student.name);
            }
        }
        RosterAction::List => {
            let students = store.list_students()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&students)?);
            } else {
                for s in students {
                    println!(
                        "#{:<5} {:<24} {:<10} {}",
                        s.id,
                        s.name,
                        s.roll_no.as_deref().unwrap_or("-"),
                        s.department.as_deref().unwrap_or("-")
                    );
                }
            }
        }
        RosterAction::Remove { id } => {
            store.remove_student(id)?;
            println!("Removed student #{id}");
        }
    }
    Ok(())
}

fn print_enrolled(json: bool, summaries: &[EnrollSummary]) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summaries)?);
        return Ok(());
    }
    if summaries.is_empty() {
        println!("No identities enrolled");
    }
    for s in summaries {
        println!(
            "Enrolled {}: {} of {} image(s) usable, {} vector(s) stored",
            s.identity, s.embeddings, s.images, s.stored
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_threshold_must_be_in_unit_range() {
        let parse = |t: &str| {
            Cli::try_parse_from(["rollcall", "recognize", "p.jpg", "--subject", "1", "--teacher", "2", "--threshold", t])
        };
        for bad in ["-0.1", "1.5", "NaN", "abc"] {
            assert!(parse(bad).is_err(), "{bad} accepted");
        }
        match parse("0.45").unwrap().command {
            Commands::Recognize { threshold, .. } => assert_eq!(threshold, Some(0.45)),
            _ => panic!("wrong subcommand"),
        }
    }
}
