//! Remote classifier using an OpenAI-compatible chat completions API
//!
//! Granite Guardian (and similar guard models) answer a single user turn
//! with a bare verdict token, so one request per check is enough.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::classifier::{ClassifierError, RiskClassifier};
use crate::config::ClassifierConfig;

/// Classifier backed by an OpenAI-compatible HTTP endpoint
#[derive(Debug, Clone)]
pub struct GuardianClassifier {
    client: Client,
    url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: [Message<'a>; 1],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

impl GuardianClassifier {
    /// Build a classifier from validated configuration.
    ///
    /// No request timeout is set here: the gateway's per-message deadline
    /// bounds the call, and a closed stream cancels it.
    pub fn new(config: &ClassifierConfig) -> Result<Self, ClassifierError> {
        if config.api_key.is_empty() {
            return Err(ClassifierError::Config("API key is empty".to_string()));
        }

        let client = Client::builder()
            .build()
            .map_err(|e| ClassifierError::Config(e.to_string()))?;

        let url = config.completions_url();
        info!(
            "GuardianClassifier initialized with model: {}, url: {}",
            config.model, url
        );

        Ok(Self {
            client,
            url,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RiskClassifier for GuardianClassifier {
    async fn classify(&self, text: &str) -> Result<String, ClassifierError> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: [Message {
                role: "user",
                content: text,
            }],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        debug!(url = %self.url, model = %self.model, "Sending risk check");

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    ClassifierError::Request(format!("Failed to connect to classifier: {e}"))
                } else {
                    ClassifierError::Request(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClassifierError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ClassifierError::Parse(e.to_string()))?;

        let output = completion
            .choices
            .into_iter()
            .next()
            .ok_or(ClassifierError::EmptyResponse)?
            .message
            .content
            .unwrap_or_default();

        let output = output.trim().to_string();
        debug!(output = %output, "Risk model response");
        Ok(output)
    }

    fn name(&self) -> &'static str {
        "guardian"
    }
}
