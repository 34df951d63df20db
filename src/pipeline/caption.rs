//! Captioning: one model request per distinct image, bounded concurrency,
//! retry with backoff, cache consulted first.
//!
//! ## Flow per image
//!
//! ```text
//! cache.caption(identity, key) ── hit ──▶ Caption (source = Cache, 0 calls)
//!        │ miss / cache error
//!        ▼
//! RetryPolicy::run(timeout(model.describe)) ── ok ──▶ parse ─▶ cache.store_caption ─▶ Caption
//!        │ permanent error or budget spent
//!        ▼
//! CaptionError (image stays uncaptioned, other images unaffected)
//! ```
//!
//! Images are deduplicated by key before dispatch, so one document never
//! sends two concurrent requests for the same content. Completion order is
//! irrelevant: results come back keyed by [`ImageKey`].

use crate::config::ConversionConfig;
use crate::error::{CaptionError, ModelError};
use crate::model::{VisionModel, VisionRequest};
use crate::output::{Caption, CaptionSource, ImageRecord};
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::{encode, postprocess};
use crate::progress::ProgressCallback;
use crate::prompts::{CAPTION_USER_PROMPT, DEFAULT_CAPTION_PROMPT};
use crate::store::{Cache, DocumentIdentity, ImageKey};
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Knobs the captioner needs, lifted out of [`ConversionConfig`].
#[derive(Debug, Clone)]
pub struct CaptionSettings {
    pub system_prompt: String,
    pub user_prompt: String,
    pub temperature: f32,
    pub max_tokens: usize,
    pub api_timeout: Duration,
    pub concurrency_limit: usize,
    pub retry: RetryPolicy,
}

impl CaptionSettings {
    pub fn from_config(config: &ConversionConfig) -> Self {
        Self {
            system_prompt: config
                .caption_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_CAPTION_PROMPT.to_string()),
            user_prompt: CAPTION_USER_PROMPT.to_string(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            api_timeout: Duration::from_secs(config.api_timeout_secs),
            concurrency_limit: config.concurrency_limit.max(1),
            retry: config.retry_policy(),
        }
    }
}

impl Default for CaptionSettings {
    fn default() -> Self {
        Self::from_config(&ConversionConfig::default())
    }
}

/// Result of captioning one image.
#[derive(Debug, Clone)]
pub struct CaptionOutcome {
    pub key: ImageKey,
    pub result: Result<Caption, CaptionError>,
    pub source: CaptionSource,
    /// Model calls issued for this image, retries included.
    pub model_calls: u32,
}

/// Bounded pool of caption requests against one model.
pub struct Captioner {
    model: Arc<dyn VisionModel>,
    cache: Option<Cache>,
    settings: CaptionSettings,
    progress: Option<ProgressCallback>,
}

impl Captioner {
    /// `cache` may be `None` when the database could not be opened; every
    /// image then goes to the model.
    pub fn new(model: Arc<dyn VisionModel>, cache: Option<Cache>, settings: CaptionSettings) -> Self {
        Self {
            model,
            cache,
            settings,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: Option<ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    pub fn model_id(&self) -> &str {
        self.model.model_id()
    }

    /// Caption every distinct image, at most `concurrency_limit` at a time.
    ///
    /// Waits for all of them before returning.
    pub async fn caption_all(
        &self,
        identity: &DocumentIdentity,
        images: &[ImageRecord],
    ) -> HashMap<ImageKey, CaptionOutcome> {
        let mut seen = HashSet::new();
        let unique: Vec<&ImageRecord> = images
            .iter()
            .filter(|img| seen.insert(img.key.clone()))
            .collect();
        debug!(
            "Captioning {} distinct images ({} references) with limit {}",
            unique.len(),
            images.len(),
            self.settings.concurrency_limit
        );

        stream::iter(unique.into_iter().map(|img| self.caption_image(identity, img)))
            .buffer_unordered(self.settings.concurrency_limit)
            .map(|outcome| (outcome.key.clone(), outcome))
            .collect()
            .await
    }

    /// Caption a single image: cache first, then the model with retries.
    pub async fn caption_image(
        &self,
        identity: &DocumentIdentity,
        image: &ImageRecord,
    ) -> CaptionOutcome {
        if let Some(ref cb) = self.progress {
            cb.on_image_start(image.page, image.position);
        }

        if let Some(ref cache) = self.cache {
            match cache.caption(identity, &image.key) {
                Ok(Some(caption)) => {
                    debug!("Image {}: caption cache hit", image.key);
                    if let Some(ref cb) = self.progress {
                        cb.on_image_complete(image.page, image.position, true);
                    }
                    return CaptionOutcome {
                        key: image.key.clone(),
                        result: Ok(caption),
                        source: CaptionSource::Cache,
                        model_calls: 0,
                    };
                }
                Ok(None) => {}
                Err(e) => warn!("Image {}: caption cache read failed: {}", image.key, e),
            }
        }

        let (result, model_calls) = self.request_caption(image).await;

        if let Ok(ref caption) = result {
            if let Some(ref cache) = self.cache {
                if let Err(e) = cache.store_caption(identity, caption) {
                    warn!("Image {}: caption cache write failed: {}", image.key, e);
                }
            }
        }

        if let Some(ref cb) = self.progress {
            match &result {
                Ok(_) => cb.on_image_complete(image.page, image.position, false),
                Err(e) => cb.on_image_error(image.page, image.position, &e.to_string()),
            }
        }
        if let Err(ref e) = result {
            warn!("{}", e);
        }

        CaptionOutcome {
            key: image.key.clone(),
            result,
            source: CaptionSource::Model,
            model_calls,
        }
    }

    async fn request_caption(&self, image: &ImageRecord) -> (Result<Caption, CaptionError>, u32) {
        let request = VisionRequest {
            system_prompt: self.settings.system_prompt.clone(),
            user_prompt: self.settings.user_prompt.clone(),
            image: encode::to_payload(&image.bytes),
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
            image_key: image.key.to_string(),
        };
        let timeout = self.settings.api_timeout;
        let label = format!("Image {} (page {})", image.key, image.page);

        let (response, attempts) = self
            .settings
            .retry
            .run(&label, |_attempt| {
                let model = &self.model;
                let request = &request;
                async move {
                    match tokio::time::timeout(timeout, model.describe(request)).await {
                        Ok(result) => result,
                        Err(_) => Err(ModelError::Timeout {
                            secs: timeout.as_secs(),
                        }),
                    }
                }
            })
            .await;

        let result = match response {
            Ok(response) => {
                match parse_caption_response(&response.content, image.page, image.position) {
                    Some((title, description)) => Ok(Caption {
                        image_key: image.key.clone(),
                        title,
                        description,
                        model: self.model.model_id().to_string(),
                    }),
                    None => Err(CaptionError::EmptyResponse {
                        key: image.key.to_string(),
                    }),
                }
            }
            Err(e) => Err(CaptionError::ModelFailed {
                key: image.key.to_string(),
                attempts,
                detail: e.to_string(),
            }),
        };
        (result, attempts)
    }
}

// ── Response parsing ─────────────────────────────────────────────────────

/// Title used when the model gives none.
pub fn fallback_title(page: usize, position: usize) -> String {
    format!("Figure {}.{}", page, position + 1)
}

/// Split a model answer into `(title, description)`.
///
/// Expects `Title:` and `Description:` lines (any case, optionally bolded,
/// ASCII or full-width colon). Without a title line the title falls back to
/// [`fallback_title`]; without any label the whole answer is the description.
/// Returns `None` when nothing usable remains.
pub fn parse_caption_response(raw: &str, page: usize, position: usize) -> Option<(String, String)> {
    let text = postprocess::clean_model_text(raw);
    if text.is_empty() {
        return None;
    }

    let mut title: Option<String> = None;
    let mut description_lines: Vec<&str> = Vec::new();
    let mut unlabelled: Vec<&str> = Vec::new();
    let mut in_description = false;

    for line in text.lines() {
        if let Some(value) = labelled_value(line, "title") {
            if title.is_none() {
                title = Some(clean_title(value)).filter(|t| !t.is_empty());
            }
            in_description = false;
            continue;
        }
        if let Some(value) = labelled_value(line, "description") {
            in_description = true;
            if !value.is_empty() {
                description_lines.push(value);
            }
            continue;
        }
        if in_description {
            description_lines.push(line);
        } else {
            unlabelled.push(line);
        }
    }

    let description = if description_lines.is_empty() {
        unlabelled.join("\n")
    } else {
        description_lines.join("\n")
    };
    let description = description.trim().to_string();
    let title = title.unwrap_or_else(|| fallback_title(page, position));

    if description.is_empty() && title == fallback_title(page, position) {
        return None;
    }
    Some((title, description))
}

/// Value after `label:` if `line` starts with that label.
fn labelled_value<'a>(line: &'a str, label: &str) -> Option<&'a str> {
    let l = line
        .trim()
        .trim_start_matches(['*', '_', '#', '-'])
        .trim_start();
    let head = l.get(..label.len())?;
    if !head.eq_ignore_ascii_case(label) {
        return None;
    }
    let rest = l[label.len()..].trim_start_matches(['*', '_']).trim_start();
    let rest = rest
        .strip_prefix(':')
        .or_else(|| rest.strip_prefix('：'))?;
    Some(rest.trim().trim_matches(['*', '_']).trim())
}

fn clean_title(value: &str) -> String {
    value
        .trim_matches(['"', '\'', '“', '”', '「', '」'])
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
