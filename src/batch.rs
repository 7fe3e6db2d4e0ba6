//! Batch Orchestrator: fans one prompt pair out across every student-topic
//! pair of a set, then drives the provisioned conversations sequentially in a
//! background task.
//!
//! Provisioning tolerates per-pair failures (the pair is skipped and the
//! planned total corrected); driving tolerates per-conversation failures (the
//! run is skipped and the completed counter simply not bumped). Only a fault
//! in the orchestration itself marks the whole batch failed.

use anyhow::anyhow;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::db::{self, NewBatch, NewConversation, Pool};
use crate::driver::{self, DriveRequest};
use crate::generate::Generator;
use crate::handlers::HandlerError;
use crate::model::{Batch, Conversation, SetType};
use crate::tutor::model::{Student, Topic};
use crate::tutor::TutorService;

#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub name: String,
    pub set_type: SetType,
    pub system_prompt: String,
    pub initial_message: String,
}

/// Provision and launch a batch. Returns as soon as every conversation row
/// exists; the returned handle joins the background task that drives them.
pub async fn create_batch(
    pool: &Pool,
    tutor: Arc<dyn TutorService>,
    generator: Arc<dyn Generator>,
    req: BatchRequest,
) -> Result<(Batch, JoinHandle<()>), HandlerError> {
    if req.name.trim().is_empty() {
        return Err(HandlerError::Invalid("name must be non-empty"));
    }
    if req.system_prompt.trim().is_empty() {
        return Err(HandlerError::Invalid("system_prompt must be non-empty"));
    }
    if req.initial_message.trim().is_empty() {
        return Err(HandlerError::Invalid("initial_message must be non-empty"));
    }

    let students = tutor.list_students(Some(req.set_type)).await?;
    if students.is_empty() {
        return Err(HandlerError::NoStudents(req.set_type));
    }

    let mut pairs: Vec<(Student, Topic)> = Vec::new();
    for student in students {
        let topics = tutor.student_topics(&student.id).await?;
        for topic in topics {
            pairs.push((student.clone(), topic));
        }
    }
    if pairs.is_empty() {
        return Err(HandlerError::NoPairs(req.set_type));
    }

    let batch = db::insert_batch(
        pool,
        &NewBatch {
            name: &req.name,
            set_type: req.set_type,
            system_prompt: &req.system_prompt,
            initial_message: &req.initial_message,
            total_conversations: pairs.len() as i64,
        },
    )
    .await?;
    info!(batch_id = batch.id, pairs = pairs.len(), "batch created");

    let mut provisioned: Vec<Conversation> = Vec::new();
    for (student, topic) in &pairs {
        match provision_pair(pool, tutor.as_ref(), &batch, student, topic).await {
            Ok(convo) => provisioned.push(convo),
            Err(err) => warn!(
                ?err,
                student_id = %student.id,
                topic_id = %topic.id,
                "skipping pair; provisioning failed"
            ),
        }
    }

    // Skipped pairs shrink the plan; the stored total must match reality.
    if provisioned.len() != pairs.len() {
        db::set_batch_total(pool, batch.id, provisioned.len() as i64).await?;
    }
    let batch = db::get_batch(pool, batch.id)
        .await?
        .ok_or_else(|| HandlerError::Internal(anyhow!("batch {} missing after provisioning", batch.id)))?;

    let run_pool = pool.clone();
    let batch_id = batch.id;
    let handle = tokio::spawn(async move {
        if let Err(err) =
            drive_batch(&run_pool, tutor.as_ref(), generator.as_ref(), batch_id, provisioned).await
        {
            error!(?err, batch_id, "batch run failed");
            if let Err(err) = db::fail_batch(&run_pool, batch_id).await {
                error!(?err, batch_id, "failed to mark batch failed");
            }
        }
    });

    Ok((batch, handle))
}

async fn provision_pair(
    pool: &Pool,
    tutor: &dyn TutorService,
    batch: &Batch,
    student: &Student,
    topic: &Topic,
) -> Result<Conversation, HandlerError> {
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
            set_type: batch.set_type,
            messages_remaining: started.max_turns,
            is_auto: true,
            is_running: true,
            system_prompt: Some(&batch.system_prompt),
            initial_message: Some(&batch.initial_message),
            batch_id: Some(batch.id),
        },
    )
    .await?;
    Ok(convo)
}

/// Drive every provisioned conversation in order. A failed run is logged and
/// skipped; the batch still completes with whatever tally it reached.
#[instrument(skip_all, fields(batch_id = batch_id))]
async fn drive_batch(
    pool: &Pool,
    tutor: &dyn TutorService,
    generator: &dyn Generator,
    batch_id: i64,
    conversations: Vec<Conversation>,
) -> anyhow::Result<()> {
    let mut completed = 0i64;
    for convo in conversations {
        let req = DriveRequest {
            conversation_id: convo.id,
            external_id: convo.external_conversation_id.clone(),
            system_prompt: convo.system_prompt.clone().unwrap_or_default(),
            seed_message: convo.initial_message.clone(),
            turns_budget: convo.messages_remaining,
            transcript: Vec::new(),
        };
        match driver::run_conversation(pool, tutor, generator, req).await {
            Ok(_) => {
                completed += 1;
                db::increment_batch_completed(pool, batch_id).await?;
            }
            Err(err) => {
                warn!(?err, conversation_id = convo.id, "batch conversation failed; continuing");
            }
        }
    }
    db::complete_batch(pool, batch_id, completed).await?;
    info!(batch_id, completed, "batch completed");
    Ok(())
}
