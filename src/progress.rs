//! Progress-callback trait for per-image captioning events.
//!
//! Inject an [`Arc<dyn ConversionProgressCallback>`] via
//! [`crate::config::ConversionConfigBuilder::progress_callback`] to receive
//! events as the captioner works through a document's images.
//!
//! # Example
//!
//! ```rust
//! use paper2md::{ConversionProgressCallback, ConversionConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: AtomicUsize,
//! }
//!
//! impl ConversionProgressCallback for CountingCallback {
//!     fn on_image_complete(&self, page: usize, position: usize, cached: bool) {
//!         self.completed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("page {page} image {position} done (cached: {cached})");
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback { completed: AtomicUsize::new(0) });
//!
//! let config = ConversionConfig::builder()
//!     .progress_callback(counter as Arc<dyn ConversionProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the pipeline as it captions each image.
///
/// Images are captioned concurrently, so `on_image_start`,
/// `on_image_complete` and `on_image_error` may be called from several
/// tasks at once. All methods default to no-ops.
pub trait ConversionProgressCallback: Send + Sync {
    /// Called once extraction has finished, before any caption request.
    ///
    /// # Arguments
    /// * `total_pages`: pages extracted
    /// * `total_images`: distinct images that need a caption
    fn on_run_start(&self, total_pages: usize, total_images: usize) {
        let _ = (total_pages, total_images);
    }

    /// Called before the cache is consulted for an image.
    fn on_image_start(&self, page: usize, position: usize) {
        let _ = (page, position);
    }

    /// Called when an image has a caption; `cached` is true for cache reuse.
    fn on_image_complete(&self, page: usize, position: usize, cached: bool) {
        let _ = (page, position, cached);
    }

    /// Called when an image stays uncaptioned after all retries.
    fn on_image_error(&self, page: usize, position: usize, error: &str) {
        let _ = (page, position, error);
    }

    /// Called once after every image has been attempted.
    fn on_run_complete(&self, captioned: usize, uncaptioned: usize) {
        let _ = (captioned, uncaptioned);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ConversionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ConversionConfig`].
pub type ProgressCallback = Arc<dyn ConversionProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TrackingCallback {
        starts: AtomicUsize,
        completes: AtomicUsize,
        cached: AtomicUsize,
        errors: AtomicUsize,
    }

    impl ConversionProgressCallback for TrackingCallback {
        fn on_image_start(&self, _page: usize, _position: usize) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_image_complete(&self, _page: usize, _position: usize, cached: bool) {
            self.completes.fetch_add(1, Ordering::SeqCst);
            if cached {
                self.cached.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn on_image_error(&self, _page: usize, _position: usize, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_run_start(3, 5);
        cb.on_image_start(1, 0);
        cb.on_image_complete(1, 0, false);
        cb.on_image_error(2, 1, "timeout");
        cb.on_run_complete(4, 1);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();
        tracker.on_image_start(1, 0);
        tracker.on_image_complete(1, 0, true);
        tracker.on_image_start(1, 1);
        tracker.on_image_complete(1, 1, false);
        tracker.on_image_start(2, 0);
        tracker.on_image_error(2, 0, "HTTP 503");

        assert_eq!(tracker.starts.load(Ordering::SeqCst), 3);
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.cached.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
    }
}
