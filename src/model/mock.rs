//! Scripted, instrumented vision model for tests and offline dry runs.
//!
//! Behaviours:
//! - succeeds with a deterministic caption derived from the image key
//! - fails permanently or transiently for chosen image keys
//! - fails the first N calls for every key, then succeeds
//! - sleeps before answering, to exercise concurrency limits and timeouts
//!
//! Every call is counted, and the peak number of simultaneously active
//! calls is recorded.

use super::{VisionModel, VisionRequest, VisionResponse};
use crate::error::ModelError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub const MOCK_MODEL_ID: &str = "mock-vlm";

/// Instrumented mock implementing [`VisionModel`].
#[derive(Debug, Default)]
pub struct MockVisionModel {
    delay: Duration,
    failing_keys: HashSet<String>,
    transient_failures: usize,
    empty_responses: bool,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    attempts_by_key: Mutex<HashMap<String, usize>>,
}

/// Decrements the in-flight counter even when the future is dropped mid-call.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockVisionModel {
    /// A model that always succeeds immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail every call for the image with this key (HTTP 400, not retried).
    pub fn failing_for(mut self, image_key: impl Into<String>) -> Self {
        self.failing_keys.insert(image_key.into());
        self
    }

    /// Fail the first `n` calls for each key with HTTP 503, then succeed.
    pub fn transient_failures(mut self, n: usize) -> Self {
        self.transient_failures = n;
        self
    }

    /// Answer every call with whitespace only.
    pub fn empty_responses(mut self) -> Self {
        self.empty_responses = true;
        self
    }

    /// Total calls received, retries included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls that were active at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Calls received for one key.
    pub fn calls_for(&self, image_key: &str) -> usize {
        self.attempts_by_key
            .lock()
            .map(|m| m.get(image_key).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Deterministic caption text for a key.
    pub fn caption_text(image_key: &str) -> String {
        let short: String = image_key.chars().take(8).collect();
        format!(
            "Title: Figure {short}\nDescription: A mock description of image {short}."
        )
    }
}

#[async_trait]
impl VisionModel for MockVisionModel {
    fn model_id(&self) -> &str {
        MOCK_MODEL_ID
    }

    async fn describe(&self, request: &VisionRequest) -> Result<VisionResponse, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlightGuard(&self.in_flight);
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        let attempt = {
            let mut map = self
                .attempts_by_key
                .lock()
                .map_err(|_| ModelError::InvalidResponse("mock state poisoned".into()))?;
            let n = map.entry(request.image_key.clone()).or_insert(0);
            *n += 1;
            *n
        };

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if self.failing_keys.contains(&request.image_key) {
            return Err(ModelError::Api {
                status: 400,
                message: "mock: image rejected".into(),
            });
        }
        if attempt <= self.transient_failures {
            return Err(ModelError::Api {
                status: 503,
                message: format!("mock: transient failure {attempt}"),
            });
        }

        let content = if self.empty_responses {
            "   ".to_string()
        } else {
            Self::caption_text(&request.image_key)
        };
        Ok(VisionResponse {
            content,
            prompt_tokens: 10,
            completion_tokens: 20,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ImagePayload;

    fn request(key: &str) -> VisionRequest {
        VisionRequest {
            system_prompt: String::new(),
            user_prompt: String::new(),
            image: ImagePayload {
                base64: String::new(),
                mime_type: "image/png".into(),
            },
            temperature: 0.0,
            max_tokens: 10,
            image_key: key.into(),
        }
    }

    #[tokio::test]
    async fn counts_calls_per_key() {
        let m = MockVisionModel::new();
        m.describe(&request("a")).await.unwrap();
        m.describe(&request("a")).await.unwrap();
        m.describe(&request("b")).await.unwrap();
        assert_eq!(m.calls(), 3);
        assert_eq!(m.calls_for("a"), 2);
        assert_eq!(m.peak_in_flight(), 1);
    }

    #[tokio::test]
    async fn multibyte_keys_are_shortened_by_char() {
        let m = MockVisionModel::new();
        let response = m.describe(&request("图像键值测试数据样本")).await.unwrap();
        assert!(response.content.contains("Figure 图像键值测试数据\n"));
    }

    #[tokio::test]
    async fn transient_then_success() {
        let m = MockVisionModel::new().transient_failures(2);
        assert!(m.describe(&request("a")).await.unwrap_err().is_transient());
        assert!(m.describe(&request("a")).await.is_err());
        assert!(m.describe(&request("a")).await.is_ok());
    }

    #[tokio::test]
    async fn failing_key_is_permanent() {
        let m = MockVisionModel::new().failing_for("bad");
        let err = m.describe(&request("bad")).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(m.describe(&request("good")).await.is_ok());
    }
}
