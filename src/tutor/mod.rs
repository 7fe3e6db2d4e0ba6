use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::fmt;
use thiserror::Error;
use tracing::warn;

use crate::model::SetType;
use crate::tutor::model::{
    EvaluateResp, InteractResp, StartConversationResp, Student, StudentListResp, Subject,
    SubjectListResp, Topic, TopicListResp,
};

pub mod model;

const API_KEY_HEADER: &str = "x-api-key";

/// Failures talking to the tutoring API, split so callers can branch on the
/// upstream's evaluation verdicts without parsing message text.
#[derive(Debug, Error)]
pub enum TutorApiError {
    #[error("tutor API key is not configured")]
    KeyMissing,
    #[error("submission limit reached: {0}")]
    SubmissionLimit(String),
    #[error("missing conversations for this set: {0}")]
    MissingConversations(String),
    #[error("submission rejected: {0}")]
    InvalidSubmission(String),
    #[error("tutor API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("tutor API request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Map an `/evaluate` rejection to its variant by HTTP status alone; the
/// body is carried verbatim for display but never matched on.
pub fn classify_evaluation_failure(status: StatusCode, body: String) -> TutorApiError {
    match status.as_u16() {
        429 => TutorApiError::SubmissionLimit(body),
        400 => TutorApiError::MissingConversations(body),
        422 => TutorApiError::InvalidSubmission(body),
        status => TutorApiError::Api { status, body },
    }
}

/// The slice of the tutoring API the orchestrator depends on. Tests
/// substitute recording fakes; `TutorClient` is the HTTP implementation.
#[async_trait]
pub trait TutorService: Send + Sync {
    async fn list_students(&self, set_type: Option<SetType>)
        -> Result<Vec<Student>, TutorApiError>;

    async fn student_topics(&self, student_id: &str) -> Result<Vec<Topic>, TutorApiError>;

    async fn start_conversation(
        &self,
        student_id: &str,
        topic_id: &str,
    ) -> Result<StartConversationResp, TutorApiError>;

    async fn send_message(
        &self,
        conversation_id: &str,
        tutor_message: &str,
    ) -> Result<InteractResp, TutorApiError>;

    async fn submit_evaluation(&self, set_type: SetType) -> Result<EvaluateResp, TutorApiError>;
}

#[derive(Clone)]
pub struct TutorClient {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl fmt::Debug for TutorClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TutorClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl TutorClient {
    pub fn new(base_url: &str, api_key: String) -> Result<Self> {
        let mut normalized = base_url.trim().to_string();
        if !normalized.ends_with('/') {
            normalized.push('/');
        }
        let base_url = Url::parse(&normalized).context("invalid tutor API base URL")?;
        if base_url.cannot_be_a_base() {
            return Err(anyhow!("tutor API base URL cannot be a base: {base_url}"));
        }
        let http = Client::builder()
            .user_agent("tutorbench/0.1")
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        // cannot_be_a_base was rejected in the constructor
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty();
            path.extend(segments);
        }
        url
    }

    fn require_key(&self) -> Result<(), TutorApiError> {
        if self.api_key.trim().is_empty() {
            return Err(TutorApiError::KeyMissing);
        }
        Ok(())
    }

    pub fn build_students_request(
        &self,
        set_type: Option<SetType>,
    ) -> Result<reqwest::Request, TutorApiError> {
        let mut url = self.endpoint(&["students"]);
        if let Some(set_type) = set_type {
            url.query_pairs_mut()
                .append_pair("set_type", set_type.as_str());
        }
        Ok(self.http.get(url).build()?)
    }

    pub fn build_student_topics_request(
        &self,
        student_id: &str,
    ) -> Result<reqwest::Request, TutorApiError> {
        let url = self.endpoint(&["students", student_id, "topics"]);
        Ok(self.http.get(url).build()?)
    }

    pub fn build_subjects_request(&self) -> Result<reqwest::Request, TutorApiError> {
        Ok(self.http.get(self.endpoint(&["subjects"])).build()?)
    }

    pub fn build_topics_request(
        &self,
        subject_id: Option<&str>,
    ) -> Result<reqwest::Request, TutorApiError> {
        let mut url = self.endpoint(&["topics"]);
        if let Some(subject_id) = subject_id {
            url.query_pairs_mut().append_pair("subject_id", subject_id);
        }
        Ok(self.http.get(url).build()?)
    }

    pub fn build_health_request(&self) -> Result<reqwest::Request, TutorApiError> {
        Ok(self.http.get(self.endpoint(&["health"])).build()?)
    }

    pub fn build_start_request(
        &self,
        student_id: &str,
        topic_id: &str,
    ) -> Result<reqwest::Request, TutorApiError> {
        Ok(self
            .http
            .post(self.endpoint(&["interact", "start"]))
            .header(API_KEY_HEADER, &self.api_key)
            .header("Content-Type", "application/json")
            .json(&json!({ "student_id": student_id, "topic_id": topic_id }))
            .build()?)
    }

    pub fn build_interact_request(
        &self,
        conversation_id: &str,
        tutor_message: &str,
    ) -> Result<reqwest::Request, TutorApiError> {
        Ok(self
            .http
            .post(self.endpoint(&["interact"]))
            .header(API_KEY_HEADER, &self.api_key)
            .header("Content-Type", "application/json")
            .json(&json!({
                "conversation_id": conversation_id,
                "tutor_message": tutor_message,
            }))
            .build()?)
    }

    pub fn build_evaluate_request(
        &self,
        set_type: SetType,
    ) -> Result<reqwest::Request, TutorApiError> {
        Ok(self
            .http
            .post(self.endpoint(&["evaluate"]))
            .header(API_KEY_HEADER, &self.api_key)
            .header("Content-Type", "application/json")
            .json(&json!({ "set_type": set_type.as_str() }))
            .build()?)
    }

    async fn execute_json<T: DeserializeOwned>(
        &self,
        request: reqwest::Request,
    ) -> Result<T, TutorApiError> {
        let res = self.http.execute(request).await?;
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            warn!(status, "tutor API error: {}", body);
            return Err(TutorApiError::Api { status, body });
        }
        Ok(res.json::<T>().await?)
    }

    pub async fn list_subjects(&self) -> Result<Vec<Subject>, TutorApiError> {
        let request = self.build_subjects_request()?;
        let resp: SubjectListResp = self.execute_json(request).await?;
        Ok(resp.subjects)
    }

    pub async fn list_topics(&self, subject_id: Option<&str>) -> Result<Vec<Topic>, TutorApiError> {
        let request = self.build_topics_request(subject_id)?;
        let resp: TopicListResp = self.execute_json(request).await?;
        Ok(resp.topics)
    }

    pub async fn health(&self) -> Result<Value, TutorApiError> {
        let request = self.build_health_request()?;
        self.execute_json(request).await
    }
}

#[async_trait]
impl TutorService for TutorClient {
    async fn list_students(
        &self,
        set_type: Option<SetType>,
    ) -> Result<Vec<Student>, TutorApiError> {
        let request = self.build_students_request(set_type)?;
        let resp: StudentListResp = self.execute_json(request).await?;
        Ok(resp.students)
    }

    async fn student_topics(&self, student_id: &str) -> Result<Vec<Topic>, TutorApiError> {
        let request = self.build_student_topics_request(student_id)?;
        let resp: TopicListResp = self.execute_json(request).await?;
        Ok(resp.topics)
    }

    async fn start_conversation(
        &self,
        student_id: &str,
        topic_id: &str,
    ) -> Result<StartConversationResp, TutorApiError> {
        self.require_key()?;
        let request = self.build_start_request(student_id, topic_id)?;
        self.execute_json(request).await
    }

    async fn send_message(
        &self,
        conversation_id: &str,
        tutor_message: &str,
    ) -> Result<InteractResp, TutorApiError> {
        self.require_key()?;
        let request = self.build_interact_request(conversation_id, tutor_message)?;
        self.execute_json(request).await
    }

    async fn submit_evaluation(&self, set_type: SetType) -> Result<EvaluateResp, TutorApiError> {
        self.require_key()?;
        let request = self.build_evaluate_request(set_type)?;
        let res = self.http.execute(request).await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "evaluation rejected: {}", body);
            return Err(classify_evaluation_failure(status, body));
        }
        Ok(res.json::<EvaluateResp>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_client() -> TutorClient {
        TutorClient::new("https://tutor-api.example.com", "secret-key".into()).unwrap()
    }

    fn body_json(request: &reqwest::Request) -> Value {
        let bytes = request.body().and_then(|b| b.as_bytes()).unwrap();
        serde_json::from_slice(bytes).unwrap()
    }

    #[test]
    fn start_request_sets_key_header_and_body() {
        let client = sample_client();
        let request = client.build_start_request("student-1", "topic-9").unwrap();
        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(request.url().path(), "/interact/start");
        assert_eq!(
            request
                .headers()
                .get(API_KEY_HEADER)
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "secret-key"
        );
        let body = body_json(&request);
        assert_eq!(body["student_id"], "student-1");
        assert_eq!(body["topic_id"], "topic-9");
    }

    #[test]
    fn interact_request_carries_conversation_and_message() {
        let client = sample_client();
        let request = client.build_interact_request("ext-42", "what is 2+2?").unwrap();
        assert_eq!(request.url().path(), "/interact");
        let body = body_json(&request);
        assert_eq!(body["conversation_id"], "ext-42");
        assert_eq!(body["tutor_message"], "what is 2+2?");
    }

    #[test]
    fn evaluate_request_carries_set_type() {
        let client = sample_client();
        let request = client.build_evaluate_request(SetType::MiniDev).unwrap();
        assert_eq!(request.url().path(), "/evaluate");
        assert_eq!(body_json(&request)["set_type"], "mini_dev");
    }

    #[test]
    fn catalog_requests_are_unauthenticated() {
        let client = sample_client();
        let request = client
            .build_students_request(Some(SetType::Dev))
            .unwrap();
        assert_eq!(request.url().path(), "/students");
        assert_eq!(request.url().query(), Some("set_type=dev"));
        assert!(request.headers().get(API_KEY_HEADER).is_none());

        let request = client.build_students_request(None).unwrap();
        assert_eq!(request.url().query(), None);

        let request = client.build_student_topics_request("student-1").unwrap();
        assert_eq!(request.url().path(), "/students/student-1/topics");

        let request = client.build_topics_request(Some("math")).unwrap();
        assert_eq!(request.url().query(), Some("subject_id=math"));
    }

    #[test]
    fn base_url_path_prefix_is_preserved() {
        let client = TutorClient::new("https://host.example.com/api/v2", "k".into()).unwrap();
        let request = client.build_health_request().unwrap();
        assert_eq!(request.url().path(), "/api/v2/health");
    }

    #[test]
    fn evaluation_failures_classify_by_status_code() {
        let err = classify_evaluation_failure(StatusCode::TOO_MANY_REQUESTS, "nope".into());
        assert!(matches!(err, TutorApiError::SubmissionLimit(_)));

        let err = classify_evaluation_failure(StatusCode::BAD_REQUEST, "none yet".into());
        assert!(matches!(err, TutorApiError::MissingConversations(_)));

        let err = classify_evaluation_failure(StatusCode::UNPROCESSABLE_ENTITY, "bad".into());
        assert!(matches!(err, TutorApiError::InvalidSubmission(_)));

        // Suggestive body text must not override the status code.
        let err = classify_evaluation_failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            "429 Missing conversations".into(),
        );
        match err {
            TutorApiError::Api { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "429 Missing conversations");
            }
            other => panic!("expected generic error, got {other:?}"),
        }
    }

    #[test]
    fn empty_key_is_rejected_before_any_call() {
        let client = TutorClient::new("https://tutor-api.example.com", "  ".into()).unwrap();
        assert!(matches!(
            client.require_key(),
            Err(TutorApiError::KeyMissing)
        ));
    }
}
