//! Turn Driver: advances one conversation against the tutoring API until the
//! student signals completion, the turn budget runs out, or a call fails.
//!
//! Each turn is durable on its own: the tutor/student pair is committed, the
//! remaining budget and open/closed state are written, and only then is the
//! next tutor message generated. A failure therefore leaves every finished
//! turn persisted and the conversation resumable from the stored state.

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::db::{self, Pool};
use crate::generate::{Generator, TranscriptTurn};
use crate::model::ConversationStatus;
use crate::tutor::TutorService;

/// Everything a driver needs to advance one conversation.
///
/// `seed_message` is the opening tutor message for a transcript with no turns
/// yet; when `None`, the first tutor message is generated from the transcript
/// (the resume path after at least one persisted turn).
#[derive(Debug, Clone)]
pub struct DriveRequest {
    pub conversation_id: i64,
    pub external_id: String,
    pub system_prompt: String,
    pub seed_message: Option<String>,
    pub turns_budget: i64,
    pub transcript: Vec<TranscriptTurn>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveOutcome {
    pub turns_taken: i64,
    pub completed: bool,
}

/// Run the turn loop and always clear the running flag afterwards, whether
/// the loop finished or failed. A failure of the clear itself is logged so it
/// never masks the loop's own error.
#[instrument(skip_all, fields(conversation_id = req.conversation_id))]
pub async fn run_conversation(
    pool: &Pool,
    tutor: &dyn TutorService,
    generator: &dyn Generator,
    req: DriveRequest,
) -> Result<DriveOutcome> {
    let conversation_id = req.conversation_id;
    let result = drive_to_end(pool, tutor, generator, req).await;

    if let Err(err) = db::release_conversation(pool, conversation_id).await {
        warn!(?err, conversation_id, "failed to clear running flag");
    }

    match &result {
        Ok(outcome) => info!(
            conversation_id,
            turns = outcome.turns_taken,
            completed = outcome.completed,
            "conversation run finished"
        ),
        Err(err) => warn!(?err, conversation_id, "conversation run failed"),
    }
    result
}

async fn drive_to_end(
    pool: &Pool,
    tutor: &dyn TutorService,
    generator: &dyn Generator,
    req: DriveRequest,
) -> Result<DriveOutcome> {
    let mut transcript = req.transcript;
    let mut pending = req.seed_message;
    let mut remaining = req.turns_budget;
    let mut turns_taken = 0i64;
    let mut completed = false;

    while !completed && remaining > 0 {
        let tutor_message = match pending.take() {
            Some(message) => message,
            None => generator
                .next_tutor_message(&req.system_prompt, &transcript)
                .await
                .context("failed to generate next tutor message")?,
        };

        let reply = tutor
            .send_message(&req.external_id, &tutor_message)
            .await
            .with_context(|| format!("turn {} failed", turns_taken + 1))?;

        db::insert_message_pair(pool, req.conversation_id, &tutor_message, &reply.student_response)
            .await?;
        transcript.push(TranscriptTurn::tutor(tutor_message));
        transcript.push(TranscriptTurn::student(reply.student_response));

        remaining -= 1;
        turns_taken += 1;
        completed = reply.is_complete;

        let status = if completed {
            ConversationStatus::Closed
        } else {
            ConversationStatus::Open
        };
        db::update_conversation_progress(pool, req.conversation_id, remaining, status).await?;
    }

    Ok(DriveOutcome {
        turns_taken,
        completed,
    })
}
