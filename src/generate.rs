//! Text-generation client producing the tutor side of a conversation.
//!
//! Speaks the OpenAI chat-completions wire format: the stored transcript is
//! replayed with tutor turns as `assistant` and student turns as `user`, the
//! system prompt leading. Output length and temperature come from
//! configuration, never from callers.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;

use crate::config::Generation;
use crate::model::MessageRole;

/// One turn of role-tagged conversation history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptTurn {
    pub role: MessageRole,
    pub content: String,
}

impl TranscriptTurn {
    pub fn tutor(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tutor,
            content: content.into(),
        }
    }

    pub fn student(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Student,
            content: content.into(),
        }
    }
}

/// Produces the next tutor utterance from the system prompt and the history.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn next_tutor_message(
        &self,
        system_prompt: &str,
        transcript: &[TranscriptTurn],
    ) -> Result<String>;
}

#[derive(Clone)]
pub struct GenerationClient {
    http: Client,
    base_url: Url,
    api_key: String,
    model: String,
    max_output_tokens: u32,
    temperature: f64,
}

impl fmt::Debug for GenerationClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationClient")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

pub fn request_body(
    model: &str,
    system_prompt: &str,
    transcript: &[TranscriptTurn],
    max_tokens: u32,
    temperature: f64,
) -> Value {
    let mut messages = Vec::with_capacity(transcript.len() + 1);
    messages.push(json!({ "role": "system", "content": system_prompt }));
    for turn in transcript {
        let role = match turn.role {
            MessageRole::Tutor => "assistant",
            MessageRole::Student => "user",
        };
        messages.push(json!({ "role": role, "content": turn.content }));
    }
    json!({
        "model": model,
        "messages": messages,
        "max_tokens": max_tokens,
        "temperature": temperature,
    })
}

impl GenerationClient {
    pub fn from_config(cfg: &Generation) -> Result<Self> {
        let mut normalized = cfg.base_url.trim().to_string();
        if !normalized.ends_with('/') {
            normalized.push('/');
        }
        let base_url = Url::parse(&normalized).context("invalid generation base URL")?;
        if base_url.cannot_be_a_base() {
            return Err(anyhow!("generation base URL cannot be a base: {base_url}"));
        }
        let http = Client::builder()
            .user_agent("tutorbench/0.1")
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            max_output_tokens: cfg.max_output_tokens,
            temperature: cfg.temperature,
        })
    }

    pub fn build_request(
        &self,
        system_prompt: &str,
        transcript: &[TranscriptTurn],
    ) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join("v1/chat/completions")
            .context("invalid generation base URL")?;
        let body = request_body(
            &self.model,
            system_prompt,
            transcript,
            self.max_output_tokens,
            self.temperature,
        );
        self.http
            .post(endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .build()
            .context("failed to build generation request")
    }

    async fn execute(&self, request: reqwest::Request) -> Result<String> {
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach generation service")?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("generation error {}: {}", status, body));
        }
        let payload: ChatCompletionResp = res
            .json()
            .await
            .context("invalid generation response JSON")?;
        payload
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| anyhow!("generation returned no usable choices"))
    }
}

#[async_trait]
impl Generator for GenerationClient {
    async fn next_tutor_message(
        &self,
        system_prompt: &str,
        transcript: &[TranscriptTurn],
    ) -> Result<String> {
        if self.api_key.trim().is_empty() {
            return Err(anyhow!("generation API key is not configured"));
        }
        let request = self.build_request(system_prompt, transcript)?;
        self.execute(request).await
    }
}

#[derive(Deserialize)]
struct ChatCompletionResp {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}
