use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tutorbench::batch::{self, BatchRequest};
use tutorbench::config;
use tutorbench::db;
use tutorbench::generate::GenerationClient;
use tutorbench::handlers::{self, AutoRequest, StartRequest};
use tutorbench::model::{BatchStatus, SetType};
use tutorbench::tutor::{TutorClient, TutorService};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List students, optionally filtered to one set
    Students {
        #[arg(long)]
        set_type: Option<String>,
    },
    /// List topics, either a student's assignments or the subject catalog
    Topics {
        #[arg(long)]
        student_id: Option<String>,
        #[arg(long)]
        subject_id: Option<String>,
    },
    /// List subjects
    Subjects,
    /// Check upstream API health
    Health,
    /// Start a manual conversation
    Start {
        student_id: String,
        topic_id: String,
        set_type: String,
    },
    /// Send one tutor message through a manual conversation
    Send {
        conversation_id: i64,
        message: String,
    },
    /// Start an auto conversation and drive it to the end
    Auto {
        student_id: String,
        topic_id: String,
        set_type: String,
        #[arg(long)]
        system_prompt: String,
        #[arg(long)]
        initial_message: String,
    },
    /// Run one prompt pair across every student-topic pair of a set
    Batch {
        name: String,
        set_type: String,
        #[arg(long)]
        system_prompt: String,
        #[arg(long)]
        initial_message: String,
    },
    /// Restart the driver on an interrupted auto conversation
    Resume { conversation_id: i64 },
    /// Submit the latest completed batch of a set for scoring
    Evaluate { set_type: String },
    /// List stored conversations, newest activity first
    Conversations {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Print a conversation transcript
    Messages { conversation_id: i64 },
    /// List stored batches, newest first
    Batches {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// List recorded evaluation submissions, newest first
    Evaluations {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Poll a running batch until it finishes
    Watch { batch_id: i64 },
}

fn parse_set_type(s: &str) -> Result<SetType> {
    SetType::parse(s).ok_or_else(|| anyhow!("unknown set type: {s} (expected mini_dev, dev, or eval)"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let mut cfg = config::load(Some(&cli.config))?;
    cfg.ensure_dirs()?;

    // Keys may come from the environment instead of the config file.
    if let Ok(key) = std::env::var("TUTOR_API_KEY") {
        cfg.tutor_api.api_key = key;
    }
    if let Ok(key) = std::env::var("GENERATION_API_KEY") {
        cfg.generation.api_key = key;
    }

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/tutorbench.db", cfg.app.data_dir));
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let client = TutorClient::new(&cfg.tutor_api.base_url, cfg.tutor_api.api_key.clone())?;
    let generator = GenerationClient::from_config(&cfg.generation)?;

    match cli.command {
        Command::Students { set_type } => {
            let filter = set_type.as_deref().map(parse_set_type).transpose()?;
            for s in client.list_students(filter).await? {
                println!("{}  {} (grade {})", s.id, s.name, s.grade_level);
            }
        }
        Command::Topics {
            student_id,
            subject_id,
        } => {
            let topics = match student_id {
                Some(student_id) => client.student_topics(&student_id).await?,
                None => client.list_topics(subject_id.as_deref()).await?,
            };
            for t in topics {
                println!("{}  {} [{}] (grade {})", t.id, t.name, t.subject_name, t.grade_level);
            }
        }
        Command::Subjects => {
            for s in client.list_subjects().await? {
                println!("{}  {}", s.id, s.name);
            }
        }
        Command::Health => {
            let health = client.health().await?;
            println!("{}", serde_json::to_string_pretty(&health)?);
        }
        Command::Start {
            student_id,
            topic_id,
            set_type,
        } => {
            let req = StartRequest {
                student_id,
                topic_id,
                set_type: parse_set_type(&set_type)?,
            };
            let convo = handlers::start_manual(&pool, &client, &req).await?;
            println!(
                "conversation {} started: {} on {} ({} turns)",
                convo.id, convo.student_name, convo.topic_name, convo.messages_remaining
            );
        }
        Command::Send {
            conversation_id,
            message,
        } => {
            let reply = handlers::append_manual_turn(&pool, &client, conversation_id, &message).await?;
            println!("student: {}", reply.student_message.content);
            if reply.conversation_ended {
                println!("conversation ended");
            } else {
                println!("{} turns remaining", reply.messages_remaining);
            }
        }
        Command::Auto {
            student_id,
            topic_id,
            set_type,
            system_prompt,
            initial_message,
        } => {
            let req = AutoRequest {
                student_id,
                topic_id,
                set_type: parse_set_type(&set_type)?,
                system_prompt,
                initial_message,
            };
            let (convo, handle) = handlers::start_auto(
                &pool,
                Arc::new(client.clone()),
                Arc::new(generator.clone()),
                &req,
            )
            .await?;
            println!("conversation {} running ({} turns)", convo.id, convo.messages_remaining);
            handle.await?;
            let convo = db::get_conversation(&pool, convo.id)
                .await?
                .ok_or_else(|| anyhow!("conversation {} disappeared", convo.id))?;
            println!(
                "conversation {} finished: {} ({} turns left)",
                convo.id, convo.status, convo.messages_remaining
            );
        }
        Command::Batch {
            name,
            set_type,
            system_prompt,
            initial_message,
        } => {
            let req = BatchRequest {
                name,
                set_type: parse_set_type(&set_type)?,
                system_prompt,
                initial_message,
            };
            let (created, handle) = batch::create_batch(
                &pool,
                Arc::new(client.clone()),
                Arc::new(generator.clone()),
                req,
            )
            .await?;
            println!(
                "batch {} running: {} conversations",
                created.id, created.total_conversations
            );
            handle.await?;
            let finished = db::get_batch(&pool, created.id)
                .await?
                .ok_or_else(|| anyhow!("batch {} disappeared", created.id))?;
            println!(
                "batch {} {}: {}/{} completed",
                finished.id, finished.status, finished.completed_conversations, finished.total_conversations
            );
        }
        Command::Resume { conversation_id } => {
            let (convo, handle) = handlers::resume_conversation(
                &pool,
                Arc::new(client.clone()),
                Arc::new(generator.clone()),
                conversation_id,
            )
            .await?;
            println!("conversation {} resumed ({} turns left)", convo.id, convo.messages_remaining);
            handle.await?;
            let convo = db::get_conversation(&pool, conversation_id)
                .await?
                .ok_or_else(|| anyhow!("conversation {conversation_id} disappeared"))?;
            println!(
                "conversation {} finished: {} ({} turns left)",
                convo.id, convo.status, convo.messages_remaining
            );
        }
        Command::Evaluate { set_type } => {
            let evaluation =
                handlers::submit_evaluation(&pool, &client, parse_set_type(&set_type)?).await?;
            println!(
                "score {:.4} over {} conversations (submission {})",
                evaluation.score, evaluation.num_conversations, evaluation.submission_number
            );
            if let Some(left) = evaluation.submissions_remaining {
                println!("{left} submissions remaining");
            }
        }
        Command::Conversations { limit } => {
            for c in db::list_conversations(&pool, limit).await? {
                let mode = if c.is_auto { "auto" } else { "manual" };
                println!(
                    "{}  {}  {} / {}  {} ({} left, {})",
                    c.id, c.student_name, c.subject_name, c.topic_name, c.status, c.messages_remaining, mode
                );
            }
        }
        Command::Messages { conversation_id } => {
            for m in db::list_messages(&pool, conversation_id).await? {
                println!("{}: {}", m.role, m.content);
            }
        }
        Command::Batches { limit } => {
            for b in db::list_batches(&pool, limit).await? {
                println!(
                    "{}  {}  [{}]  {}  {}/{}",
                    b.id, b.name, b.set_type, b.status, b.completed_conversations, b.total_conversations
                );
            }
        }
        Command::Evaluations { limit } => {
            for e in db::list_evaluations(&pool, limit).await? {
                let left = e
                    .submissions_remaining
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "?".to_string());
                println!(
                    "{}  [{}]  score {:.4}  submission {} ({} left)  batch {}",
                    e.id, e.set_type, e.score, e.submission_number, left, e.batch_id
                );
            }
        }
        Command::Watch { batch_id } => {
            let poll = Duration::from_millis(cfg.app.poll_interval_ms);
            loop {
                let b = db::get_batch(&pool, batch_id)
                    .await?
                    .ok_or_else(|| anyhow!("batch {batch_id} not found"))?;
                println!(
                    "batch {} {}: {}/{}",
                    b.id, b.status, b.completed_conversations, b.total_conversations
                );
                if b.status != BatchStatus::Running {
                    break;
                }
                tokio::time::sleep(poll).await;
            }
        }
    }

    Ok(())
}
