//! Vision-model backends used for captioning.
//!
//! The pipeline only sees [`VisionModel`]: one image in, one text answer out.
//! Three implementations ship with the crate:
//!
//! * [`openai::OpenAiCompatibleModel`] posts to any `/chat/completions`
//!   endpoint that accepts `image_url` data URIs (SiliconFlow, vLLM, OpenAI, ...).
//! * [`provider::LlmProviderModel`] adapts an edgequake-llm `LLMProvider`,
//!   so every provider that crate knows about works unchanged.
//! * [`mock::MockVisionModel`] is scripted and instrumented for tests.
//!
//! [`resolve_model`] picks one from a [`ConversionConfig`].

pub mod mock;
pub mod openai;
pub mod provider;

use crate::config::ConversionConfig;
use crate::error::{ConvertError, ModelError};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Base64-encoded image attached to a request.
#[derive(Debug, Clone)]
pub struct ImagePayload {
    pub base64: String,
    pub mime_type: String,
}

impl ImagePayload {
    /// `data:` URI form accepted by OpenAI-compatible APIs.
    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.base64)
    }
}

/// One captioning request.
#[derive(Debug, Clone)]
pub struct VisionRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub image: ImagePayload,
    pub temperature: f32,
    pub max_tokens: usize,
    /// Content key of the image, for logging and for test doubles.
    pub image_key: String,
}

/// Raw answer of a model.
#[derive(Debug, Clone, Default)]
pub struct VisionResponse {
    pub content: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

/// A vision-language model able to answer one image request.
#[async_trait]
pub trait VisionModel: Send + Sync {
    /// Identifier recorded on every caption this model produces.
    fn model_id(&self) -> &str;

    /// Send one request. Implementations do not retry; the caller does.
    async fn describe(&self, request: &VisionRequest) -> Result<VisionResponse, ModelError>;
}

/// Pick the captioning backend for `config`, most specific first:
///
/// 1. `vision_model`: used as-is.
/// 2. `provider`: a pre-built edgequake-llm provider.
/// 3. `api_key`: the OpenAI-compatible endpoint at `base_url`.
/// 4. `provider_name`: created through edgequake-llm's `ProviderFactory`.
///
/// `Ok(None)` means captioning is disabled (degraded mode).
pub fn resolve_model(
    config: &ConversionConfig,
) -> Result<Option<Arc<dyn VisionModel>>, ConvertError> {
    if let Some(ref model) = config.vision_model {
        return Ok(Some(Arc::clone(model)));
    }

    if let Some(ref provider) = config.provider {
        return Ok(Some(Arc::new(provider::LlmProviderModel::new(
            Arc::clone(provider),
            config.model_identifier.clone(),
        ))));
    }

    if let Some(key) = config.api_key.as_deref().filter(|k| !k.is_empty()) {
        let model = openai::OpenAiCompatibleModel::new(
            key,
            &config.base_url,
            &config.model_identifier,
            config.api_timeout_secs,
        )?;
        info!(
            "Captioning with {} via {}",
            config.model_identifier, config.base_url
        );
        return Ok(Some(Arc::new(model)));
    }

    if let Some(ref name) = config.provider_name {
        let model = provider::LlmProviderModel::from_name(name, &config.model_identifier)?;
        info!("Captioning with {} via provider '{}'", config.model_identifier, name);
        return Ok(Some(Arc::new(model)));
    }

    warn!("No API key or provider configured; images will be embedded without captions");
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_uri_format() {
        let p = ImagePayload {
            base64: "QUJD".into(),
            mime_type: "image/png".into(),
        };
        assert_eq!(p.data_uri(), "data:image/png;base64,QUJD");
    }

    #[test]
    fn no_backend_means_degraded_mode() {
        let config = ConversionConfig::default();
        assert!(resolve_model(&config).unwrap().is_none());
    }

    #[test]
    fn injected_model_wins() {
        let mock: Arc<dyn VisionModel> = Arc::new(mock::MockVisionModel::new());
        let config = ConversionConfig::builder()
            .api_key("sk-ignored")
            .vision_model(mock)
            .build()
            .unwrap();
        let model = resolve_model(&config).unwrap().unwrap();
        assert_eq!(model.model_id(), mock::MOCK_MODEL_ID);
    }

    #[test]
    fn api_key_selects_openai_compatible() {
        let config = ConversionConfig::builder()
            .api_key("sk-test")
            .model_identifier("Qwen/Qwen2.5-VL-72B-Instruct")
            .build()
            .unwrap();
        let model = resolve_model(&config).unwrap().unwrap();
        assert_eq!(model.model_id(), "Qwen/Qwen2.5-VL-72B-Instruct");
    }
}
