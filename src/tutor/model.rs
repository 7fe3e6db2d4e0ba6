//! Wire types for the tutoring-simulation API.

use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
pub struct Student {
    pub id: String,
    pub name: String,
    pub grade_level: i64,
}

#[derive(Deserialize, Debug)]
pub struct StudentListResp {
    pub students: Vec<Student>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Subject {
    pub id: String,
    pub name: String,
}

#[derive(Deserialize, Debug)]
pub struct SubjectListResp {
    pub subjects: Vec<Subject>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Topic {
    pub id: String,
    pub subject_id: String,
    pub subject_name: String,
    pub name: String,
    pub grade_level: i64,
}

#[derive(Deserialize, Debug)]
pub struct TopicListResp {
    pub topics: Vec<Topic>,
}

/// `POST /interact/start` response. `max_turns` is the full turn budget the
/// upstream grants this conversation.
#[derive(Deserialize, Debug, Clone)]
pub struct StartConversationResp {
    pub conversation_id: String,
    pub student_id: String,
    pub topic_id: String,
    pub max_turns: i64,
    pub conversations_remaining: Option<i64>,
}

/// `POST /interact` response: one simulated student reply.
#[derive(Deserialize, Debug, Clone)]
pub struct InteractResp {
    pub conversation_id: String,
    pub interaction_id: String,
    pub student_response: String,
    pub turn_number: i64,
    pub is_complete: bool,
}

/// `POST /evaluate` response for a scored submission.
#[derive(Deserialize, Debug, Clone)]
pub struct EvaluateResp {
    pub score: f64,
    pub num_conversations: i64,
    pub submission_number: i64,
    pub submissions_remaining: Option<i64>,
}
