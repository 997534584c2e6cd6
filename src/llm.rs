//! Remote model clients over the OpenAI-compatible `/chat/completions` API.
//!
//! Captioning (vision) and grounded chat share one client type; each is
//! exposed behind its own trait so the pipeline and the chat engine can be
//! driven by fakes.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::caption::CAPTION_PROMPT;
use crate::config::{CaptioningConfig, ChatConfig};
use crate::error::CaptionError;

/// Vision-language captioning of one base64 JPEG.
#[async_trait]
pub trait Captioner: Send + Sync {
    /// Raw model text for the fixed captioning prompt.
    async fn caption(&self, image_b64: &str) -> Result<String, CaptionError>;
}

/// Free-text completion from a system instruction and a user prompt.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String>;
}

// ─── Request types (OpenAI-compatible) ──────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: Vec<ContentPart>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String, // "data:image/jpeg;base64,..."
}

// ─── Client ─────────────────────────────────────────────────────────────────

pub struct CompletionClient {
    http: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    max_tokens: u32,
    temperature: Option<f32>,
}

impl CompletionClient {
    pub fn new(
        base_url: &str,
        model: &str,
        api_key: Option<String>,
        max_tokens: u32,
        temperature: Option<f32>,
        timeout_secs: u64,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model: model.to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            max_tokens,
            temperature,
        })
    }

    pub fn for_captioning(cfg: &CaptioningConfig) -> Result<Self> {
        Self::new(
            &cfg.base_url,
            &cfg.model,
            cfg.api_key.clone(),
            cfg.max_tokens,
            Some(cfg.temperature),
            cfg.timeout_secs,
        )
    }

    pub fn for_chat(cfg: &ChatConfig) -> Result<Self> {
        Self::new(
            &cfg.base_url,
            &cfg.model,
            cfg.api_key.clone(),
            512,
            None,
            cfg.timeout_secs,
        )
    }

    async fn send(&self, messages: Vec<Message>) -> Result<String, CaptionError> {
        let body = ChatRequest {
            model: self.model.clone(),
            messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        debug!("LLM call → {} ({})", self.endpoint, self.model);

        let mut req = self
            .http
            .post(&self.endpoint)
            .header("Accept", "application/json")
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(CaptionError::Upstream {
                status,
                body: body.chars().take(300).collect(),
            });
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| CaptionError::Malformed(e.to_string()))?;

        json["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| CaptionError::Malformed(format!("unexpected completion payload: {}", json)))
    }
}

#[async_trait]
impl Captioner for CompletionClient {
    async fn caption(&self, image_b64: &str) -> Result<String, CaptionError> {
        let messages = vec![Message {
            role: "user".into(),
            content: vec![
                ContentPart::Text {
                    text: CAPTION_PROMPT.to_string(),
                },
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: format!("data:image/jpeg;base64,{}", image_b64),
                    },
                },
            ],
        }];
        self.send(messages).await
    }
}

#[async_trait]
impl ChatModel for CompletionClient {
    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let messages = vec![
            Message {
                role: "system".into(),
                content: vec![ContentPart::Text {
                    text: system.to_string(),
                }],
            },
            Message {
                role: "user".into(),
                content: vec![ContentPart::Text {
                    text: user.to_string(),
                }],
            },
        ];
        let text = self.send(messages).await?;
        Ok(text.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[test]
    fn content_parts_use_openai_tags() {
        let part = ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: "data:image/jpeg;base64,AAAA".into(),
            },
        };
        let v = serde_json::to_value(&part).unwrap();
        assert_eq!(v["type"], "image_url");
        assert_eq!(v["image_url"]["url"], "data:image/jpeg;base64,AAAA");
    }

    #[tokio::test]
    async fn caption_returns_message_content() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/chat/completions")
                    .header("authorization", "Bearer k")
                    .body_contains("data:image/jpeg;base64,AAAA")
                    .body_contains("number_of_individuals");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"choices":[{"message":{"role":"assistant","content":"{\"a\":1}"}}]}"#);
            })
            .await;

        let c = CompletionClient::new(&server.base_url(), "m", Some("k".into()), 10, None, 5).unwrap();
        assert_eq!(c.caption("AAAA").await.unwrap(), "{\"a\":1}");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn trailing_slash_in_base_url_is_ignored() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"choices":[{"message":{"content":"ok"}}]}"#);
            })
            .await;

        let base = format!("{}/", server.url("/v1"));
        let c = CompletionClient::new(&base, "m", None, 10, None, 5).unwrap();
        assert_eq!(c.caption("AAAA").await.unwrap(), "ok");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn non_success_status_is_upstream_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/chat/completions");
                then.status(503).body("overloaded");
            })
            .await;

        let c = CompletionClient::new(&server.base_url(), "m", None, 10, None, 5).unwrap();
        match c.caption("AAAA").await {
            Err(CaptionError::Upstream { status, body }) => {
                assert_eq!(status, 503);
                assert_eq!(body, "overloaded");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn long_error_body_is_truncated() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/chat/completions");
                then.status(500).body("x".repeat(1_000));
            })
            .await;

        let c = CompletionClient::new(&server.base_url(), "m", None, 10, None, 5).unwrap();
        match c.caption("AAAA").await {
            Err(CaptionError::Upstream { body, .. }) => assert_eq!(body.len(), 300),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn missing_choices_is_malformed() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/chat/completions");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"error":"nope"}"#);
            })
            .await;

        let c = CompletionClient::new(&server.base_url(), "m", None, 10, None, 5).unwrap();
        assert!(matches!(
            c.caption("AAAA").await,
            Err(CaptionError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn chat_completion_sends_system_and_user() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/chat/completions")
                    .body_contains(r#""role":"system""#)
                    .body_contains("who was there?");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"choices":[{"message":{"content":"  Two people walked by.  "}}]}"#);
            })
            .await;

        let c = CompletionClient::new(&server.base_url(), "m", None, 10, None, 5).unwrap();
        let answer = c.complete("be brief", "who was there?").await.unwrap();
        assert_eq!(answer, "Two people walked by.");
        mock.assert_async().await;
    }
}
