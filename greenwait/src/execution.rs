//! Completion calls for dispatched jobs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ExecutionConfig;
use crate::error::ExecutionError;
use crate::job::{CompletionResult, Job};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompletionResponse {
    pub text: String,
    pub completion_token_count: u32,
}

/// A chat-completion backend.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ExecutionError>;
}

/// Azure OpenAI chat completions, one deployment per model name.
pub struct AzureOpenAiProvider {
    client: Client,
    endpoint: String,
    api_version: String,
    api_key: SecretString,
}

impl std::fmt::Debug for AzureOpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureOpenAiProvider")
            .field("endpoint", &self.endpoint)
            .field("api_version", &self.api_version)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize)]
struct AzureRequest<'a> {
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    model: &'a str,
}

#[derive(Debug, Deserialize)]
struct AzureResponse {
    choices: Vec<AzureChoice>,
    usage: Option<AzureUsage>,
}

#[derive(Debug, Deserialize)]
struct AzureChoice {
    message: AzureMessage,
}

#[derive(Debug, Deserialize)]
struct AzureMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AzureUsage {
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct AzureError {
    error: AzureErrorDetail,
}

#[derive(Debug, Deserialize)]
struct AzureErrorDetail {
    message: String,
}

const PROVIDER: &str = "azure-openai";

impl AzureOpenAiProvider {
    pub fn new(config: &ExecutionConfig, api_key: SecretString) -> Result<Self, ExecutionError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_version: config.api_version.clone(),
            api_key,
        })
    }

    fn url(&self, deployment: &str) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.endpoint, deployment, self.api_version
        )
    }
}

#[async_trait]
impl CompletionProvider for AzureOpenAiProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ExecutionError> {
        let body = AzureRequest {
            messages: &request.messages,
            max_tokens: request.max_output_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            model: &request.model,
        };

        let response = self
            .client
            .post(self.url(&request.model))
            .header("api-key", self.api_key.expose_secret())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let raw = response.text().await.unwrap_or_default();
            let reason = serde_json::from_str::<AzureError>(&raw)
                .map(|e| e.error.message)
                .unwrap_or(raw);
            return Err(error_for_status(status, reason));
        }

        let parsed: AzureResponse =
            response
                .json()
                .await
                .map_err(|e| ExecutionError::InvalidResponse {
                    provider: PROVIDER.to_string(),
                    reason: e.to_string(),
                })?;

        parse_completion(parsed)
    }
}

fn error_for_status(status: StatusCode, reason: String) -> ExecutionError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        ExecutionError::QuotaExceeded {
            provider: PROVIDER.to_string(),
            reason,
        }
    } else {
        ExecutionError::RequestFailed {
            provider: PROVIDER.to_string(),
            status: status.as_u16(),
            reason,
        }
    }
}

fn parse_completion(response: AzureResponse) -> Result<CompletionResponse, ExecutionError> {
    let text = response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| ExecutionError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason: "no message content in response".to_string(),
        })?;

    Ok(CompletionResponse {
        text,
        completion_token_count: response.usage.map(|u| u.completion_tokens).unwrap_or(0),
    })
}

/// Turns a job into a completion call with the configured prompt framing
/// and an overall timeout.
pub struct ExecutionAdapter {
    provider: Arc<dyn CompletionProvider>,
    config: ExecutionConfig,
}

impl std::fmt::Debug for ExecutionAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionAdapter")
            .field("provider", &self.provider.name())
            .field("timeout_secs", &self.config.timeout_secs)
            .finish()
    }
}

impl ExecutionAdapter {
    pub fn new(provider: Arc<dyn CompletionProvider>, config: ExecutionConfig) -> Self {
        Self { provider, config }
    }

    pub fn request_for(&self, job: &Job) -> CompletionRequest {
        self.request(&job.prompt, &job.model)
    }

    /// Frame `prompt` with the system prompt and the configured settings.
    pub fn request(&self, prompt: &str, model: &str) -> CompletionRequest {
        CompletionRequest {
            model: model.to_string(),
            messages: vec![
                ChatMessage::system(&self.config.system_prompt),
                ChatMessage::user(prompt),
            ],
            max_output_tokens: self.config.max_output_tokens,
            temperature: self.config.temperature,
            top_p: self.config.top_p,
        }
    }

    pub async fn execute(&self, job: &Job) -> Result<CompletionResult, ExecutionError> {
        let result = self.complete(self.request_for(job)).await?;
        debug!(job_id = %job.id, tokens = result.token_count, "completion received");
        Ok(result)
    }

    /// Run `prompt` now, outside any job.
    pub async fn execute_prompt(
        &self,
        prompt: &str,
        model: &str,
    ) -> Result<CompletionResult, ExecutionError> {
        let result = self.complete(self.request(prompt, model)).await?;
        debug!(model, tokens = result.token_count, "immediate completion received");
        Ok(result)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResult, ExecutionError> {
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let response = tokio::time::timeout(timeout, self.provider.complete(request))
            .await
            .map_err(|_| ExecutionError::Timeout(timeout))??;

        Ok(CompletionResult {
            text: response.text,
            token_count: response.completion_token_count,
        })
    }
}
