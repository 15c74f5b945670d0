//! HTTP client for the OpenAI-compatible chat-completions advisor.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::strategy::StrategyManager;
use crate::types::{FullDecision, TradeContext};

use super::parser::parse_response;
use super::prompt::{build_system_prompt, build_user_prompt};

/// Advisor transport configuration.
#[derive(Debug, Clone)]
pub struct AdvisorConfig {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    /// Optional HTTP(S) proxy URL.
    pub proxy_url: Option<String>,
    /// Request timeout. Reasoning models are slow; the default is 120 s.
    pub timeout: Duration,
    pub temperature: f64,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.deepseek.com/v1/chat/completions".into(),
            api_key: String::new(),
            model: "deepseek-chat".into(),
            proxy_url: None,
            timeout: Duration::from_secs(120),
            temperature: 0.1,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdvisorError {
    #[error("advisor transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("advisor API error (status {status}): {body}")]
    Api { status: u16, body: String },
    #[error("advisor returned no choices")]
    EmptyChoices,
    #[error("invalid proxy URL {url}: {source}")]
    InvalidProxy {
        url: String,
        source: reqwest::Error,
    },
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: String,
}

/// Single-model advisor client. One instance lives for the whole process.
pub struct AdvisorClient {
    config: AdvisorConfig,
    http: reqwest::Client,
}

impl AdvisorClient {
    pub fn new(config: AdvisorConfig) -> Result<Self, AdvisorError> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if let Some(proxy_url) = &config.proxy_url {
            let proxy = reqwest::Proxy::all(proxy_url).map_err(|source| {
                AdvisorError::InvalidProxy {
                    url: proxy_url.clone(),
                    source,
                }
            })?;
            builder = builder.proxy(proxy);
        }
        let http = builder.build()?;
        Ok(Self { config, http })
    }

    /// Ask the advisor for a full decision turn. Transport and API errors
    /// abort the cycle; parse deviations never do.
    pub async fn get_decision(
        &self,
        ctx: &TradeContext,
        strategies: &StrategyManager,
    ) -> Result<FullDecision, AdvisorError> {
        let system_prompt = build_system_prompt(strategies);
        let user_prompt = build_user_prompt(ctx);

        let content = self.call(&system_prompt, &user_prompt).await?;
        debug!(chars = content.len(), "advisor response received");

        let (cot_trace, decisions) = parse_response(&content);
        if decisions.is_empty() {
            debug!("advisor returned no decisions this cycle");
        }

        Ok(FullDecision {
            system_prompt,
            user_prompt,
            cot_trace,
            decisions,
            timestamp: Utc::now(),
        })
    }

    async fn call(&self, system_prompt: &str, user_prompt: &str) -> Result<String, AdvisorError> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: user_prompt,
                },
            ],
            temperature: self.config.temperature,
        };

        let response = self
            .http
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(AdvisorError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = serde_json::from_str(&body).map_err(|e| {
            warn!(error = %e, "advisor response body was not valid JSON");
            AdvisorError::Api {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            }
        })?;

        let choice = parsed.choices.into_iter().next().ok_or(AdvisorError::EmptyChoices)?;
        Ok(choice.message.content)
    }
}
