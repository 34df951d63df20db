//! Configuration types for PDF-to-Markdown conversion.
//!
//! Every recognised option lives in [`ConversionConfig`], built via its
//! [`ConversionConfigBuilder`]. Unset fields fall back to the documented
//! defaults below; `build()` rejects combinations that cannot work.

use crate::error::ConvertError;
use crate::model::VisionModel;
use crate::pipeline::retry::RetryPolicy;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Default OpenAI-compatible endpoint used when only an API key is given.
pub const DEFAULT_BASE_URL: &str = "https://api.siliconflow.cn/v1";

/// Default captioning model.
pub const DEFAULT_MODEL: &str = "Pro/Qwen/Qwen2.5-VL-7B-Instruct";

/// Default cache root, relative to the working directory.
pub const DEFAULT_CACHE_DIR: &str = "./db";

/// Default parent of per-document output directories.
pub const DEFAULT_OUTPUT_ROOT: &str = "outputs";

/// Configuration for a PDF-to-Markdown conversion.
///
/// # Example
/// ```rust
/// use paper2md::ConversionConfig;
///
/// let config = ConversionConfig::builder()
///     .api_key("sk-test")
///     .concurrency_limit(2)
///     .cache_dir("/tmp/paper2md-db")
///     .build()
///     .unwrap();
/// assert_eq!(config.concurrency_limit, 2);
/// ```
#[derive(Clone)]
pub struct ConversionConfig {
    /// API key for the OpenAI-compatible captioning endpoint. Default: None.
    ///
    /// With no key, no named provider and no injected model, captioning is
    /// disabled and images are embedded without descriptions.
    pub api_key: Option<String>,

    /// Base URL of the OpenAI-compatible endpoint. Default: [`DEFAULT_BASE_URL`].
    pub base_url: String,

    /// edgequake-llm provider name ("openai", "anthropic", "gemini", "ollama", ...).
    /// Used only when `api_key` is None. Default: None.
    pub provider_name: Option<String>,

    /// Pre-constructed edgequake-llm provider. Takes precedence over `api_key`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Pre-constructed vision model. Takes precedence over everything else.
    pub vision_model: Option<Arc<dyn VisionModel>>,

    /// Model identifier sent with each request and recorded on each caption.
    /// Default: [`DEFAULT_MODEL`].
    pub model_identifier: String,

    /// Directory receiving `<stem>.md` and `images/`.
    /// Default: None, meaning `outputs/<pdf stem>`.
    pub output_dir: Option<PathBuf>,

    /// Directory holding the SQLite database. Default: [`DEFAULT_CACHE_DIR`].
    pub cache_dir: PathBuf,

    /// Maximum number of caption requests in flight at once. Default: 4.
    pub concurrency_limit: usize,

    /// Logical document identity used for cache keys instead of the local path.
    /// Default: None.
    pub cache_identity_override: Option<String>,

    /// Skip the document-level cache lookup. Cached captions are still reused.
    /// Default: false.
    pub refresh: bool,

    /// Sampling temperature for caption requests. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens the model may generate per caption. Default: 1024.
    pub max_tokens: usize,

    /// Retries after the first attempt on a transient failure. Default: 3.
    pub max_retries: u32,

    /// First retry delay in milliseconds; doubles on every retry. Default: 500.
    pub retry_backoff_ms: u64,

    /// Upper bound on a single retry delay in milliseconds. Default: 8000.
    pub max_backoff_ms: u64,

    /// Per model call timeout in seconds. Default: 60.
    pub api_timeout_secs: u64,

    /// Deadline for the whole run in seconds. Default: None (no deadline).
    pub run_timeout_secs: Option<u64>,

    /// Custom caption system prompt. If None, uses the built-in default.
    pub caption_prompt: Option<String>,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Truncate at a "References" heading and drop later pages. Default: false.
    pub strip_references: bool,

    /// Page separator in assembled output. Default: horizontal rule.
    pub page_separator: PageSeparator,

    /// Include YAML front-matter with document metadata. Default: false.
    pub include_metadata: bool,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Optional per-image progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            provider_name: None,
            provider: None,
            vision_model: None,
            model_identifier: DEFAULT_MODEL.to_string(),
            output_dir: None,
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            concurrency_limit: 4,
            cache_identity_override: None,
            refresh: false,
            temperature: 0.1,
            max_tokens: 1024,
            max_retries: 3,
            retry_backoff_ms: 500,
            max_backoff_ms: 8_000,
            api_timeout_secs: 60,
            run_timeout_secs: None,
            caption_prompt: None,
            password: None,
            strip_references: false,
            page_separator: PageSeparator::default(),
            include_metadata: false,
            download_timeout_secs: 120,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ConversionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("vision_model", &self.vision_model.as_ref().map(|m| m.model_id().to_string()))
            .field("model_identifier", &self.model_identifier)
            .field("output_dir", &self.output_dir)
            .field("cache_dir", &self.cache_dir)
            .field("concurrency_limit", &self.concurrency_limit)
            .field("cache_identity_override", &self.cache_identity_override)
            .field("refresh", &self.refresh)
            .field("max_retries", &self.max_retries)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("run_timeout_secs", &self.run_timeout_secs)
            .field("strip_references", &self.strip_references)
            .field("page_separator", &self.page_separator)
            .finish()
    }
}

impl ConversionConfig {
    /// Create a new builder for `ConversionConfig`.
    pub fn builder() -> ConversionConfigBuilder {
        ConversionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Retry schedule derived from the retry fields.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.retry_backoff_ms),
            multiplier: 2,
            max_backoff: Duration::from_millis(self.max_backoff_ms.max(self.retry_backoff_ms)),
        }
    }

    /// Whether any captioning backend is configured.
    pub fn captioning_enabled(&self) -> bool {
        self.vision_model.is_some()
            || self.provider.is_some()
            || self.api_key.as_deref().is_some_and(|k| !k.is_empty())
            || self.provider_name.is_some()
    }

    /// Output directory for a document with the given file stem.
    pub fn output_dir_for(&self, stem: &str) -> PathBuf {
        match self.output_dir {
            Some(ref dir) => dir.clone(),
            None => PathBuf::from(DEFAULT_OUTPUT_ROOT).join(stem),
        }
    }
}

/// Builder for [`ConversionConfig`].
#[derive(Debug)]
pub struct ConversionConfigBuilder {
    config: ConversionConfig,
}

impl ConversionConfigBuilder {
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = url.into();
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn vision_model(mut self, model: Arc<dyn VisionModel>) -> Self {
        self.config.vision_model = Some(model);
        self
    }

    pub fn model_identifier(mut self, model: impl Into<String>) -> Self {
        self.config.model_identifier = model.into();
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = Some(dir.into());
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache_dir = dir.into();
        self
    }

    pub fn concurrency_limit(mut self, n: usize) -> Self {
        self.config.concurrency_limit = n.max(1);
        self
    }

    pub fn cache_identity_override(mut self, identity: impl Into<String>) -> Self {
        self.config.cache_identity_override = Some(identity.into());
        self
    }

    pub fn refresh(mut self, v: bool) -> Self {
        self.config.refresh = v;
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn max_backoff_ms(mut self, ms: u64) -> Self {
        self.config.max_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn run_timeout_secs(mut self, secs: u64) -> Self {
        self.config.run_timeout_secs = Some(secs);
        self
    }

    pub fn caption_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.caption_prompt = Some(prompt.into());
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn strip_references(mut self, v: bool) -> Self {
        self.config.strip_references = v;
        self
    }

    pub fn page_separator(mut self, sep: PageSeparator) -> Self {
        self.config.page_separator = sep;
        self
    }

    pub fn include_metadata(mut self, v: bool) -> Self {
        self.config.include_metadata = v;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ConversionConfig, ConvertError> {
        let c = &self.config;
        if c.concurrency_limit == 0 {
            return Err(ConvertError::InvalidConfig(
                "concurrency_limit must be ≥ 1".into(),
            ));
        }
        if c.api_timeout_secs == 0 {
            return Err(ConvertError::InvalidConfig(
                "api_timeout_secs must be ≥ 1".into(),
            ));
        }
        if c.run_timeout_secs == Some(0) {
            return Err(ConvertError::InvalidConfig(
                "run_timeout_secs must be ≥ 1 when set".into(),
            ));
        }
        if c.model_identifier.trim().is_empty() {
            return Err(ConvertError::InvalidConfig(
                "model_identifier must not be empty".into(),
            ));
        }
        if !c.base_url.starts_with("http://") && !c.base_url.starts_with("https://") {
            return Err(ConvertError::InvalidConfig(format!(
                "base_url must be an HTTP/HTTPS URL, got '{}'",
                c.base_url
            )));
        }
        if c
            .cache_identity_override
            .as_deref()
            .is_some_and(|id| id.trim().is_empty())
        {
            return Err(ConvertError::InvalidConfig(
                "cache_identity_override must not be blank".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// How to separate pages in the assembled Markdown output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageSeparator {
    /// No separator; pages joined with "\n\n".
    None,
    /// Horizontal rule: "\n\n---\n\n" (default)
    #[default]
    HorizontalRule,
    /// HTML comment with page number: "<!-- page N -->"
    Comment,
    /// Custom string inserted between pages.
    Custom(String),
}

impl PageSeparator {
    /// Render the separator string placed before the given page (1-indexed).
    pub fn render(&self, page_num: usize) -> String {
        match self {
            PageSeparator::None => "\n\n".to_string(),
            PageSeparator::HorizontalRule => "\n\n---\n\n".to_string(),
            PageSeparator::Comment => format!("\n\n<!-- page {} -->\n\n", page_num),
            PageSeparator::Custom(s) => format!("\n\n{}\n\n", s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_documented_values() {
        let c = ConversionConfig::default();
        assert_eq!(c.concurrency_limit, 4);
        assert_eq!(c.model_identifier, DEFAULT_MODEL);
        assert_eq!(c.cache_dir, PathBuf::from("./db"));
        assert!(c.api_key.is_none());
        assert!(!c.captioning_enabled());
    }

    #[test]
    fn builder_clamps_concurrency() {
        let c = ConversionConfig::builder().concurrency_limit(0).build().unwrap();
        assert_eq!(c.concurrency_limit, 1);
    }

    #[test]
    fn builder_rejects_blank_identity_override() {
        let err = ConversionConfig::builder()
            .cache_identity_override("   ")
            .build()
            .unwrap_err();
        assert!(matches!(err, ConvertError::InvalidConfig(_)));
    }

    #[test]
    fn builder_rejects_non_http_base_url() {
        let err = ConversionConfig::builder()
            .base_url("ftp://models.local")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("base_url"));
    }

    #[test]
    fn empty_api_key_does_not_enable_captioning() {
        let c = ConversionConfig::builder().api_key("").build().unwrap();
        assert!(!c.captioning_enabled());
        let c = ConversionConfig::builder().api_key("sk-1").build().unwrap();
        assert!(c.captioning_enabled());
    }

    #[test]
    fn output_dir_defaults_to_outputs_stem() {
        let c = ConversionConfig::default();
        assert_eq!(c.output_dir_for("paper"), PathBuf::from("outputs/paper"));
        let c = ConversionConfig::builder().output_dir("/tmp/x").build().unwrap();
        assert_eq!(c.output_dir_for("paper"), PathBuf::from("/tmp/x"));
    }

    #[test]
    fn retry_policy_mirrors_fields() {
        let c = ConversionConfig::builder()
            .max_retries(5)
            .retry_backoff_ms(100)
            .max_backoff_ms(50)
            .build()
            .unwrap();
        let p = c.retry_policy();
        assert_eq!(p.max_retries, 5);
        assert_eq!(p.initial_backoff, Duration::from_millis(100));
        // cap never below the first delay
        assert_eq!(p.max_backoff, Duration::from_millis(100));
    }

    #[test]
    fn separator_render() {
        assert_eq!(PageSeparator::None.render(2), "\n\n");
        assert_eq!(PageSeparator::HorizontalRule.render(2), "\n\n---\n\n");
        assert_eq!(PageSeparator::Comment.render(3), "\n\n<!-- page 3 -->\n\n");
        assert_eq!(
            PageSeparator::Custom("***".into()).render(1),
            "\n\n***\n\n"
        );
    }
}
