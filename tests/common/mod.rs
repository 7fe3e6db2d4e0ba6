#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex;

use tutorbench::generate::{Generator, TranscriptTurn};
use tutorbench::model::SetType;
use tutorbench::tutor::model::{
    EvaluateResp, InteractResp, StartConversationResp, Student, Topic,
};
use tutorbench::tutor::{TutorApiError, TutorService};

pub async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

pub fn student(id: &str, name: &str) -> Student {
    Student {
        id: id.to_string(),
        name: name.to_string(),
        grade_level: 4,
    }
}

pub fn topic(id: &str, name: &str, subject: &str) -> Topic {
    Topic {
        id: id.to_string(),
        subject_id: format!("subject-{subject}"),
        subject_name: subject.to_string(),
        name: name.to_string(),
        grade_level: 4,
    }
}

pub fn start_resp(conversation_id: &str, max_turns: i64) -> StartConversationResp {
    StartConversationResp {
        conversation_id: conversation_id.to_string(),
        student_id: "student-1".to_string(),
        topic_id: "topic-1".to_string(),
        max_turns,
        conversations_remaining: None,
    }
}

pub fn interact(reply: &str, is_complete: bool) -> InteractResp {
    InteractResp {
        conversation_id: "ext-1".to_string(),
        interaction_id: "int-1".to_string(),
        student_response: reply.to_string(),
        turn_number: 1,
        is_complete,
    }
}

pub fn api_error(status: u16) -> TutorApiError {
    TutorApiError::Api {
        status,
        body: "scripted failure".to_string(),
    }
}

/// Tutoring-API fake: serves a fixed catalog, replays scripted responses for
/// the mutating calls, and records everything it was asked.
#[derive(Clone, Default)]
pub struct ScriptedTutor {
    students: Vec<Student>,
    topics: HashMap<String, Vec<Topic>>,
    start_responses: Arc<Mutex<VecDeque<Result<StartConversationResp, TutorApiError>>>>,
    interact_responses: Arc<Mutex<VecDeque<Result<InteractResp, TutorApiError>>>>,
    evaluate_responses: Arc<Mutex<VecDeque<Result<EvaluateResp, TutorApiError>>>>,
    started: Arc<Mutex<Vec<(String, String)>>>,
    sent: Arc<Mutex<Vec<(String, String)>>>,
    evaluated: Arc<Mutex<Vec<SetType>>>,
}

impl ScriptedTutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_catalog(students: Vec<Student>, topics: HashMap<String, Vec<Topic>>) -> Self {
        Self {
            students,
            topics,
            ..Default::default()
        }
    }

    pub async fn queue_start(&self, resp: Result<StartConversationResp, TutorApiError>) {
        self.start_responses.lock().await.push_back(resp);
    }

    pub async fn queue_interact(&self, resp: Result<InteractResp, TutorApiError>) {
        self.interact_responses.lock().await.push_back(resp);
    }

    pub async fn queue_evaluate(&self, resp: Result<EvaluateResp, TutorApiError>) {
        self.evaluate_responses.lock().await.push_back(resp);
    }

    pub async fn started(&self) -> Vec<(String, String)> {
        self.started.lock().await.clone()
    }

    pub async fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().await.clone()
    }

    pub async fn evaluated(&self) -> Vec<SetType> {
        self.evaluated.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl TutorService for ScriptedTutor {
    async fn list_students(
        &self,
        _set_type: Option<SetType>,
    ) -> Result<Vec<Student>, TutorApiError> {
        Ok(self.students.clone())
    }

    async fn student_topics(&self, student_id: &str) -> Result<Vec<Topic>, TutorApiError> {
        Ok(self.topics.get(student_id).cloned().unwrap_or_default())
    }

    async fn start_conversation(
        &self,
        student_id: &str,
        topic_id: &str,
    ) -> Result<StartConversationResp, TutorApiError> {
        let mut started = self.started.lock().await;
        started.push((student_id.to_string(), topic_id.to_string()));
        let n = started.len();
        drop(started);
        self.start_responses.lock().await.pop_front().unwrap_or_else(|| {
            Ok(StartConversationResp {
                conversation_id: format!("ext-{n}"),
                student_id: student_id.to_string(),
                topic_id: topic_id.to_string(),
                max_turns: 5,
                conversations_remaining: None,
            })
        })
    }

    async fn send_message(
        &self,
        conversation_id: &str,
        tutor_message: &str,
    ) -> Result<InteractResp, TutorApiError> {
        let mut sent = self.sent.lock().await;
        sent.push((conversation_id.to_string(), tutor_message.to_string()));
        let n = sent.len();
        drop(sent);
        self.interact_responses.lock().await.pop_front().unwrap_or_else(|| {
            Ok(InteractResp {
                conversation_id: conversation_id.to_string(),
                interaction_id: format!("int-{n}"),
                student_response: format!("reply {n}"),
                turn_number: n as i64,
                is_complete: false,
            })
        })
    }

    async fn submit_evaluation(&self, set_type: SetType) -> Result<EvaluateResp, TutorApiError> {
        self.evaluated.lock().await.push(set_type);
        self.evaluate_responses.lock().await.pop_front().unwrap_or_else(|| {
            Ok(EvaluateResp {
                score: 0.5,
                num_conversations: 1,
                submission_number: 1,
                submissions_remaining: Some(3),
            })
        })
    }
}

/// Generator fake: replays scripted tutor messages and records the transcript
/// it was shown for each call.
#[derive(Clone, Default)]
pub struct ScriptedGenerator {
    responses: Arc<Mutex<VecDeque<anyhow::Result<String>>>>,
    calls: Arc<Mutex<Vec<Vec<TranscriptTurn>>>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses(responses: Vec<anyhow::Result<String>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    pub async fn calls(&self) -> Vec<Vec<TranscriptTurn>> {
        self.calls.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl Generator for ScriptedGenerator {
    async fn next_tutor_message(
        &self,
        _system_prompt: &str,
        transcript: &[TranscriptTurn],
    ) -> anyhow::Result<String> {
        let mut calls = self.calls.lock().await;
        calls.push(transcript.to_vec());
        let n = calls.len();
        drop(calls);
        self.responses
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok(format!("generated {n}")))
    }
}
