//! Insert payloads accepted by the repositories.
//!
//! Keep these structs focused on what a single INSERT needs. Business logic
//! should live in higher layers.

use crate::model::SetType;

/// Everything needed to persist a conversation after the upstream start call.
#[derive(Debug, Clone)]
pub struct NewConversation<'a> {
    pub external_conversation_id: &'a str,
    pub student_id: &'a str,
    pub student_name: &'a str,
    pub topic_id: &'a str,
    pub topic_name: &'a str,
    pub subject_name: &'a str,
    pub set_type: SetType,
    pub messages_remaining: i64,
    pub is_auto: bool,
    pub is_running: bool,
    pub system_prompt: Option<&'a str>,
    pub initial_message: Option<&'a str>,
    pub batch_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewBatch<'a> {
    pub name: &'a str,
    pub set_type: SetType,
    pub system_prompt: &'a str,
    pub initial_message: &'a str,
    pub total_conversations: i64,
}

/// Evaluation record echoing the prompts of the batch it was submitted for.
#[derive(Debug, Clone)]
pub struct NewEvaluation<'a> {
    pub set_type: SetType,
    pub batch_id: i64,
    pub score: f64,
    pub num_conversations: i64,
    pub submission_number: i64,
    pub submissions_remaining: Option<i64>,
    pub system_prompt: &'a str,
    pub initial_message: &'a str,
}
