use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use common::settings::LlmCredentials;
use common::{Error, Result};

/// Optional text-generation service. Callers must degrade gracefully on
/// any error: a failed call never blocks a send, the pre-rendered text
/// is the floor.
#[async_trait]
pub trait LlmService: Send + Sync {
    async fn generate(
        &self,
        creds: &LlmCredentials,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String>;

    async fn rewrite(&self, creds: &LlmCredentials, text: &str) -> Result<String>;
}

/// Client for any OpenAI-compatible chat-completions endpoint.
pub struct OpenAiCompatClient {
    http: Client,
}

impl OpenAiCompatClient {
    pub fn new() -> Self {
        Self {
            http: Client::builder()
                .use_rustls_tls()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("Failed to build HTTP client"),
        }
    }

    async fn chat(
        &self,
        creds: &LlmCredentials,
        system: &str,
        user: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String> {
        let url = format!("{}/chat/completions", creds.base_url.trim_end_matches('/'));
        let request = ChatRequest {
            model: &creds.model,
            messages: vec![
                ChatMessage { role: "system", content: system.to_string() },
                ChatMessage { role: "user", content: user.to_string() },
            ],
            max_tokens,
            temperature,
        };

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&creds.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(Error::Http(format!("HTTP {status}: {body}")));
        }

        let parsed: ChatResponse =
            serde_json::from_str(&body).map_err(|e| Error::Http(e.to_string()))?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::Http("empty completion".into()))?;
        debug!(chars = text.len(), "completion received");
        Ok(text)
    }
}

impl Default for OpenAiCompatClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmService for OpenAiCompatClient {
    async fn generate(
        &self,
        creds: &LlmCredentials,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String> {
        self.chat(
            creds,
            "You write short, natural Telegram messages. Reply with the message text only.",
            prompt,
            max_tokens,
            temperature,
        )
        .await
    }

    async fn rewrite(&self, creds: &LlmCredentials, text: &str) -> Result<String> {
        self.chat(
            creds,
            "Rewrite the following post, keeping its meaning and length. Reply with the rewritten text only.",
            text,
            1024,
            0.7,
        )
        .await
    }
}

/// Stand-in when no credentials are configured.
pub struct NoLlm;

#[async_trait]
impl LlmService for NoLlm {
    async fn generate(
        &self,
        _creds: &LlmCredentials,
        _prompt: &str,
        _max_tokens: u32,
        _temperature: f32,
    ) -> Result<String> {
        Err(Error::Other("no LLM service configured".into()))
    }

    async fn rewrite(&self, _creds: &LlmCredentials, _text: &str) -> Result<String> {
        Err(Error::Other("no LLM service configured".into()))
    }
}

// ─── Wire types ───────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}
