//! Adapter exposing an edgequake-llm `LLMProvider` as a [`VisionModel`].

use super::{VisionModel, VisionRequest, VisionResponse};
use crate::error::{ConvertError, ModelError};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use std::sync::Arc;

/// Any edgequake-llm provider (OpenAI, Anthropic, Gemini, Ollama, ...).
pub struct LlmProviderModel {
    provider: Arc<dyn LLMProvider>,
    provider_name: String,
    model: String,
}

impl LlmProviderModel {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            provider_name: "edgequake-llm".to_string(),
            model: model.into(),
        }
    }

    /// Instantiate a named provider through `ProviderFactory`, which reads the
    /// matching API key (`OPENAI_API_KEY`, `ANTHROPIC_API_KEY`, ...) from the environment.
    pub fn from_name(provider_name: &str, model: &str) -> Result<Self, ConvertError> {
        let provider = ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
            ConvertError::InvalidConfig(format!(
                "LLM provider '{provider_name}' is not configured: {e}"
            ))
        })?;
        let mut model = Self::new(provider, model);
        model.provider_name = provider_name.to_string();
        Ok(model)
    }
}

#[async_trait]
impl VisionModel for LlmProviderModel {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn describe(&self, request: &VisionRequest) -> Result<VisionResponse, ModelError> {
        let image = ImageData::new(request.image.base64.clone(), request.image.mime_type.as_str())
            .with_detail("high");
        let messages = vec![
            ChatMessage::system(request.system_prompt.as_str()),
            ChatMessage::user_with_images(request.user_prompt.as_str(), vec![image]),
        ];
        let options = CompletionOptions {
            temperature: Some(request.temperature),
            max_tokens: Some(request.max_tokens),
            ..Default::default()
        };

        let response = self
            .provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| ModelError::Provider {
                provider: self.provider_name.clone(),
                detail: e.to_string(),
            })?;

        Ok(VisionResponse {
            content: response.content,
            prompt_tokens: response.prompt_tokens as usize,
            completion_tokens: response.completion_tokens as usize,
        })
    }
}
