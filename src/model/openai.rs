//! OpenAI-compatible `/chat/completions` client.
//!
//! Sends the image as a base64 `data:` URI inside an `image_url` content part,
//! which SiliconFlow, vLLM, LM Studio and OpenAI itself all accept.

use super::{VisionModel, VisionRequest, VisionResponse};
use crate::error::{ConvertError, ModelError};
use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    temperature: f32,
    max_tokens: usize,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: Content<'a>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Content<'a> {
    Text(&'a str),
    Parts(Vec<Part<'a>>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Part<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
    detail: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: usize,
    #[serde(default)]
    completion_tokens: usize,
}

/// Client for one model behind an OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleModel {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    timeout_secs: u64,
}

impl OpenAiCompatibleModel {
    /// `base_url` is the API root, e.g. `https://api.siliconflow.cn/v1`.
    pub fn new(
        api_key: &str,
        base_url: &str,
        model: &str,
        timeout_secs: u64,
    ) -> Result<Self, ConvertError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ConvertError::InvalidConfig(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: chat_endpoint(base_url),
            api_key: api_key.to_string(),
            model: model.to_string(),
            timeout_secs,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn build_body<'a>(&'a self, request: &'a VisionRequest, data_uri: String) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            messages: vec![
                Message {
                    role: "system",
                    content: Content::Text(&request.system_prompt),
                },
                Message {
                    role: "user",
                    content: Content::Parts(vec![
                        Part::ImageUrl {
                            image_url: ImageUrl {
                                url: data_uri,
                                detail: "high",
                            },
                        },
                        Part::Text {
                            text: &request.user_prompt,
                        },
                    ]),
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        }
    }

    fn map_send_error(&self, e: reqwest::Error) -> ModelError {
        if e.is_timeout() {
            ModelError::Timeout {
                secs: self.timeout_secs,
            }
        } else {
            ModelError::Request {
                endpoint: self.endpoint.clone(),
                detail: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl VisionModel for OpenAiCompatibleModel {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn describe(&self, request: &VisionRequest) -> Result<VisionResponse, ModelError> {
        let body = self.build_body(request, request.image.data_uri());

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, text));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ModelError::InvalidResponse(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ModelError::InvalidResponse("response has no choices".into()))?;
        let usage = parsed.usage.unwrap_or(Usage {
            prompt_tokens: 0,
            completion_tokens: 0,
        });

        debug!(
            "Image {}: {} input tokens, {} output tokens",
            request.image_key, usage.prompt_tokens, usage.completion_tokens
        );

        Ok(VisionResponse {
            content,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        })
    }
}

/// `<base>/chat/completions`, tolerating a trailing slash or a full endpoint URL.
fn chat_endpoint(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    if trimmed.ends_with("/chat/completions") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/chat/completions")
    }
}

fn classify_status(status: StatusCode, retry_after: Option<u64>, body: String) -> ModelError {
    let message: String = body.chars().take(300).collect();
    match status {
        StatusCode::TOO_MANY_REQUESTS => ModelError::RateLimited {
            retry_after_secs: retry_after,
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ModelError::Auth { detail: message },
        _ => ModelError::Api {
            status: status.as_u16(),
            message,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ImagePayload;

    fn request() -> VisionRequest {
        VisionRequest {
            system_prompt: "sys".into(),
            user_prompt: "caption".into(),
            image: ImagePayload {
                base64: "QUJD".into(),
                mime_type: "image/png".into(),
            },
            temperature: 0.1,
            max_tokens: 64,
            image_key: "k".into(),
        }
    }

    #[test]
    fn endpoint_joining() {
        assert_eq!(
            chat_endpoint("https://api.siliconflow.cn/v1"),
            "https://api.siliconflow.cn/v1/chat/completions"
        );
        assert_eq!(
            chat_endpoint("http://localhost:8000/v1/"),
            "http://localhost:8000/v1/chat/completions"
        );
        assert_eq!(
            chat_endpoint("http://h/v1/chat/completions"),
            "http://h/v1/chat/completions"
        );
    }

    #[test]
    fn body_carries_image_as_data_uri() {
        let model = OpenAiCompatibleModel::new("sk", "http://h/v1", "m", 5).unwrap();
        let req = request();
        let body = model.build_body(&req, req.image.data_uri());
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "m");
        assert_eq!(json["messages"][0]["content"], "sys");
        assert_eq!(json["messages"][1]["content"][0]["type"], "image_url");
        assert_eq!(
            json["messages"][1]["content"][0]["image_url"]["url"],
            "data:image/png;base64,QUJD"
        );
        assert_eq!(json["messages"][1]["content"][1]["text"], "caption");
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, Some(3), String::new()),
            ModelError::RateLimited { retry_after_secs: Some(3) }
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None, "bad key".into()),
            ModelError::Auth { .. }
        ));
        let e = classify_status(StatusCode::BAD_GATEWAY, None, "upstream".into());
        assert!(e.is_transient());
    }

    #[test]
    fn response_parsing_tolerates_missing_usage() {
        let parsed: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"Title: A\nDescription: B"}}]}"#,
        )
        .unwrap();
        assert!(parsed.usage.is_none());
        assert_eq!(
            parsed.choices[0].message.content.as_deref(),
            Some("Title: A\nDescription: B")
        );
    }
}
