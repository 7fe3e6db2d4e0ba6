//! Conversation operations: manual and auto starts, manual turn appends,
//! resume of interrupted auto runs, and evaluation submission.
//!
//! Every operation validates against the stored row before touching the
//! Tutoring API, so a caller racing a background driver gets a typed error
//! instead of interleaved writes.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::db::{self, NewConversation, NewEvaluation, Pool};
use crate::driver::{self, DriveRequest};
use crate::generate::{Generator, TranscriptTurn};
use crate::model::{BatchStatus, Conversation, ConversationStatus, Evaluation, Message, MessageRole, SetType};
use crate::tutor::model::{Student, Topic};
use crate::tutor::{TutorApiError, TutorService};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("invalid request: {0}")]
    Invalid(&'static str),
    #[error("student {0} not found")]
    StudentNotFound(String),
    #[error("topic {0} not found for this student")]
    TopicNotFound(String),
    #[error("conversation {0} not found")]
    ConversationNotFound(i64),
    #[error("conversation {0} is closed")]
    ConversationClosed(i64),
    #[error("conversation {0} is already running")]
    AlreadyRunning(i64),
    #[error("conversation {0} is driven automatically")]
    NotManual(i64),
    #[error("conversation {0} is not auto-driven")]
    NotAuto(i64),
    #[error("no students available for set {0}")]
    NoStudents(SetType),
    #[error("no student-topic pairs available for set {0}")]
    NoPairs(SetType),
    #[error("no batch found for set {0}")]
    NoBatch(SetType),
    #[error("batch {id} is {status}, not completed")]
    BatchNotCompleted { id: i64, status: BatchStatus },
    #[error("evaluation scored {score} (submission {submission_number}) but was not saved: {detail}")]
    EvaluationNotSaved {
        score: f64,
        submission_number: i64,
        detail: String,
    },
    #[error(transparent)]
    Tutor(#[from] TutorApiError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct StartRequest {
    pub student_id: String,
    pub topic_id: String,
    pub set_type: SetType,
}

#[derive(Debug, Clone)]
pub struct AutoRequest {
    pub student_id: String,
    pub topic_id: String,
    pub set_type: SetType,
    pub system_prompt: String,
    pub initial_message: String,
}

/// Both persisted halves of a manual turn plus where the conversation stands.
#[derive(Debug, Clone, Serialize)]
pub struct TurnReply {
    pub tutor_message: Message,
    pub student_message: Message,
    pub messages_remaining: i64,
    pub conversation_ended: bool,
}

/// Resolve display names for a pair. The student must exist in the catalog
/// and the topic must be assigned to that student.
async fn resolve_names(
    tutor: &dyn TutorService,
    student_id: &str,
    topic_id: &str,
) -> Result<(Student, Topic), HandlerError> {
    let (students, topics) =
        tokio::try_join!(tutor.list_students(None), tutor.student_topics(student_id))?;
    let student = students
        .into_iter()
        .find(|s| s.id == student_id)
        .ok_or_else(|| HandlerError::StudentNotFound(student_id.to_string()))?;
    let topic = topics
        .into_iter()
        .find(|t| t.id == topic_id)
        .ok_or_else(|| HandlerError::TopicNotFound(topic_id.to_string()))?;
    Ok((student, topic))
}

/// Open a conversation the caller will drive turn by turn with
/// [`append_manual_turn`].
#[instrument(skip_all, fields(student_id = %req.student_id, topic_id = %req.topic_id))]
pub async fn start_manual(
    pool: &Pool,
    tutor: &dyn TutorService,
    req: &StartRequest,
) -> Result<Conversation, HandlerError> {
    if req.student_id.trim().is_empty() {
        return Err(HandlerError::Invalid("student_id must be non-empty"));
    }
    if req.topic_id.trim().is_empty() {
        return Err(HandlerError::Invalid("topic_id must be non-empty"));
    }

    let (student, topic) = resolve_names(tutor, &req.student_id, &req.topic_id).await?;
    let started = tutor.start_conversation(&student.id, &topic.id).await?;
    let convo = db::insert_conversation(
        pool,
        &NewConversation {
            external_conversation_id: &started.conversation_id,
            student_id: &student.id,
            student_name: &student.name,
            topic_id: &topic.id,
            topic_name: &topic.name,
            subject_name: &topic.subject_name,
            set_type: req.set_type,
            messages_remaining: started.max_turns,
            is_auto: false,
            is_running: false,
            system_prompt: None,
            initial_message: None,
            batch_id: None,
        },
    )
    .await?;
    info!(conversation_id = convo.id, "manual conversation started");
    Ok(convo)
}

/// Open a conversation and hand it to a background driver immediately. The
/// row is created already claimed so no second driver can pick it up before
/// the spawned task starts.
#[instrument(skip_all, fields(student_id = %req.student_id, topic_id = %req.topic_id))]
pub async fn start_auto(
    pool: &Pool,
    tutor: Arc<dyn TutorService>,
    generator: Arc<dyn Generator>,
    req: &AutoRequest,
) -> Result<(Conversation, JoinHandle<()>), HandlerError> {
    if req.student_id.trim().is_empty() {
        return Err(HandlerError::Invalid("student_id must be non-empty"));
    }
    if req.topic_id.trim().is_empty() {
        return Err(HandlerError::Invalid("topic_id must be non-empty"));
    }
    if req.system_prompt.trim().is_empty() {
        return Err(HandlerError::Invalid("system_prompt must be non-empty"));
    }
    if req.initial_message.trim().is_empty() {
        return Err(HandlerError::Invalid("initial_message must be non-empty"));
    }

    let (student, topic) = resolve_names(tutor.as_ref(), &req.student_id, &req.topic_id).await?;
    let started = tutor.start_conversation(&student.id, &topic.id).await?;
    let convo = db::insert_conversation(
        pool,
        &NewConversation {
            external_conversation_id: &started.conversation_id,
            student_id: &student.id,
            student_name: &student.name,
            topic_id: &topic.id,
            topic_name: &topic.name,
            subject_name: &topic.subject_name,
            set_type: req.set_type,
            messages_remaining: started.max_turns,
            is_auto: true,
            is_running: true,
            system_prompt: Some(&req.system_prompt),
            initial_message: Some(&req.initial_message),
            batch_id: None,
        },
    )
    .await?;
    info!(conversation_id = convo.id, "auto conversation started");

    let drive = DriveRequest {
        conversation_id: convo.id,
        external_id: convo.external_conversation_id.clone(),
        system_prompt: req.system_prompt.clone(),
        seed_message: Some(req.initial_message.clone()),
        turns_budget: convo.messages_remaining,
        transcript: Vec::new(),
    };
    let handle = spawn_driver(pool.clone(), tutor, generator, drive);
    Ok((convo, handle))
}

fn spawn_driver(
    pool: Pool,
    tutor: Arc<dyn TutorService>,
    generator: Arc<dyn Generator>,
    req: DriveRequest,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let conversation_id = req.conversation_id;
        if let Err(err) = driver::run_conversation(&pool, tutor.as_ref(), generator.as_ref(), req).await
        {
            warn!(?err, conversation_id, "auto conversation failed");
        }
    })
}

/// Send one caller-authored tutor message through a manual conversation and
/// persist the exchange.
#[instrument(skip_all, fields(conversation_id = conversation_id))]
pub async fn append_manual_turn(
    pool: &Pool,
    tutor: &dyn TutorService,
    conversation_id: i64,
    message: &str,
) -> Result<TurnReply, HandlerError> {
    if message.trim().is_empty() {
        return Err(HandlerError::Invalid("message must be non-empty"));
    }
    let convo = db::get_conversation(pool, conversation_id)
        .await?
        .ok_or(HandlerError::ConversationNotFound(conversation_id))?;
    if convo.status == ConversationStatus::Closed {
        return Err(HandlerError::ConversationClosed(conversation_id));
    }
    if convo.is_auto {
        return Err(HandlerError::NotManual(conversation_id));
    }
    if convo.is_running {
        return Err(HandlerError::AlreadyRunning(conversation_id));
    }

    let reply = tutor
        .send_message(&convo.external_conversation_id, message)
        .await?;
    let (tutor_message, student_message) =
        db::insert_message_pair(pool, conversation_id, message, &reply.student_response).await?;

    let remaining = convo.messages_remaining - 1;
    let status = if reply.is_complete {
        ConversationStatus::Closed
    } else {
        ConversationStatus::Open
    };
    db::update_conversation_progress(pool, conversation_id, remaining, status).await?;

    Ok(TurnReply {
        tutor_message,
        student_message,
        messages_remaining: remaining,
        conversation_ended: reply.is_complete,
    })
}

/// Restart the driver on an auto conversation that stopped early. The running
/// flag is claimed with a compare-and-set so two resumes cannot both win.
#[instrument(skip_all, fields(conversation_id = conversation_id))]
pub async fn resume_conversation(
    pool: &Pool,
    tutor: Arc<dyn TutorService>,
    generator: Arc<dyn Generator>,
    conversation_id: i64,
) -> Result<(Conversation, JoinHandle<()>), HandlerError> {
    let convo = db::get_conversation(pool, conversation_id)
        .await?
        .ok_or(HandlerError::ConversationNotFound(conversation_id))?;
    if convo.status == ConversationStatus::Closed {
        return Err(HandlerError::ConversationClosed(conversation_id));
    }
    if !convo.is_auto {
        return Err(HandlerError::NotAuto(conversation_id));
    }
    if convo.messages_remaining <= 0 {
        return Err(HandlerError::Invalid("no turns remaining"));
    }
    if !db::try_acquire_running(pool, conversation_id).await? {
        return Err(HandlerError::AlreadyRunning(conversation_id));
    }
    info!(conversation_id, "resuming auto conversation");

    let run_pool = pool.clone();
    let handle = tokio::spawn(async move {
        let req = match rebuild_request(&run_pool, &convo).await {
            Ok(req) => req,
            Err(err) => {
                warn!(?err, conversation_id = convo.id, "resume aborted before driving");
                if let Err(err) = db::release_conversation(&run_pool, convo.id).await {
                    warn!(?err, conversation_id = convo.id, "failed to release conversation");
                }
                return;
            }
        };
        if let Err(err) =
            driver::run_conversation(&run_pool, tutor.as_ref(), generator.as_ref(), req).await
        {
            warn!(?err, conversation_id = convo.id, "resumed conversation failed");
        }
    });

    let convo = db::get_conversation(pool, conversation_id)
        .await?
        .ok_or(HandlerError::ConversationNotFound(conversation_id))?;
    Ok((convo, handle))
}

/// Rebuild the driver request from persisted rows. A conversation with no
/// messages yet replays the stored opener; one with history continues from
/// the generator.
async fn rebuild_request(pool: &Pool, convo: &Conversation) -> anyhow::Result<DriveRequest> {
    let rows = db::list_messages(pool, convo.id).await?;
    let seed_message = if rows.is_empty() {
        convo.initial_message.clone()
    } else {
        None
    };
    let transcript = rows
        .into_iter()
        .map(|m| match m.role {
            MessageRole::Tutor => TranscriptTurn::tutor(m.content),
            MessageRole::Student => TranscriptTurn::student(m.content),
        })
        .collect();
    Ok(DriveRequest {
        conversation_id: convo.id,
        external_id: convo.external_conversation_id.clone(),
        system_prompt: convo.system_prompt.clone().unwrap_or_default(),
        seed_message,
        turns_budget: convo.messages_remaining,
        transcript,
    })
}

/// Submit the latest completed batch of a set for scoring and record the
/// result. Nothing is written when the gate checks or the upstream call fail.
#[instrument(skip_all, fields(set_type = %set_type))]
pub async fn submit_evaluation(
    pool: &Pool,
    tutor: &dyn TutorService,
    set_type: SetType,
) -> Result<Evaluation, HandlerError> {
    let batch = db::latest_batch_for_set_type(pool, set_type)
        .await?
        .ok_or(HandlerError::NoBatch(set_type))?;
    if batch.status != BatchStatus::Completed {
        return Err(HandlerError::BatchNotCompleted {
            id: batch.id,
            status: batch.status,
        });
    }

    let scored = tutor.submit_evaluation(set_type).await?;
    let saved = db::insert_evaluation(
        pool,
        &NewEvaluation {
            set_type,
            batch_id: batch.id,
            score: scored.score,
            num_conversations: scored.num_conversations,
            submission_number: scored.submission_number,
            submissions_remaining: scored.submissions_remaining,
            system_prompt: &batch.system_prompt,
            initial_message: &batch.initial_message,
        },
    )
    .await;
    match saved {
        Ok(evaluation) => {
            info!(score = scored.score, submission = scored.submission_number, "evaluation recorded");
            Ok(evaluation)
        }
        Err(err) => Err(HandlerError::EvaluationNotSaved {
            score: scored.score,
            submission_number: scored.submission_number,
            detail: err.to_string(),
        }),
    }
}
