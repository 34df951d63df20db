//! Output and data-model types.
//!
//! [`ConversionOutput`] is what every `convert*` entry point returns on
//! success, including degraded runs: images that could not be captioned
//! carry a [`CaptionError`] instead of a [`Caption`], and
//! [`ConversionStats`] counts both.

use crate::error::CaptionError;
use crate::store::ImageKey;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// One physical page of extracted text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// 1-indexed page number.
    pub number: usize,
    pub text: String,
}

/// An extracted image, persisted in the ImageStore.
///
/// `position` is assigned at extraction time (pdfium object order within
/// the page) and is the only ordering the Assembler uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub key: ImageKey,
    /// 1-indexed page number.
    pub page: usize,
    /// 0-indexed position within the page.
    pub position: usize,
    pub width: u32,
    pub height: u32,
    /// PNG bytes.
    #[serde(skip)]
    pub bytes: Arc<Vec<u8>>,
}

impl ImageRecord {
    /// Path relative to the output directory, as referenced from the Markdown.
    pub fn relative_path(&self) -> String {
        format!("images/{}", self.key.file_name())
    }
}

/// A model-generated title and description for one image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caption {
    pub image_key: ImageKey,
    pub title: String,
    pub description: String,
    /// Identifier of the model that produced it.
    pub model: String,
}

/// Where a caption came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptionSource {
    /// Reused from the caption cache; no model call.
    Cache,
    /// Produced by a model call during this run.
    Model,
}

/// An image as it appears in the result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageOutput {
    pub key: ImageKey,
    pub page: usize,
    pub position: usize,
    /// Path of the written image file.
    pub path: PathBuf,
    pub caption: Option<Caption>,
    pub source: Option<CaptionSource>,
    pub error: Option<CaptionError>,
}

/// Document-level metadata extracted from the PDF info dictionary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub subject: Option<String>,
    pub creator: Option<String>,
    pub producer: Option<String>,
    pub creation_date: Option<String>,
    pub modification_date: Option<String>,
    pub page_count: usize,
    pub pdf_version: String,
}

/// Counters reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionStats {
    pub total_pages: usize,
    /// Image references in the document (duplicates included).
    pub total_images: usize,
    /// Image references that ended up with a caption.
    pub captioned_images: usize,
    /// Of those, captions reused from the cache.
    pub cached_captions: usize,
    /// Image references whose captioning failed.
    pub failed_images: usize,
    /// Image references left uncaptioned because no model was configured.
    pub skipped_images: usize,
    /// Model calls issued, retries included.
    pub model_calls: usize,
    pub total_duration_ms: u64,
    pub extract_duration_ms: u64,
    pub caption_duration_ms: u64,
}

impl ConversionStats {
    /// Images left without a caption, failed or skipped.
    pub fn uncaptioned(&self) -> usize {
        self.failed_images + self.skipped_images
    }
}

/// Lifecycle of one document run.
///
/// ```text
/// Pending ─▶ Extracting ─▶ Captioning ─▶ Assembling ─▶ Cached ─▶ Done
///    │           │                            │                   ▲
///    │           └─▶ Failed                   └───────────────────┤
///    └─▶ Cached (document cache hit) ─────────────────────────────┘
/// ```
///
/// A single caption failure never leaves `Captioning`; only extraction can fail the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Pending,
    Extracting,
    Captioning,
    Assembling,
    Cached,
    Done,
    Failed,
}

impl RunState {
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Pending, Extracting)
                | (Pending, Cached)
                | (Extracting, Captioning)
                | (Extracting, Failed)
                | (Captioning, Assembling)
                | (Assembling, Cached)
                | (Assembling, Done)
                | (Cached, Done)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }
}

/// Result of a conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionOutput {
    /// Identity the cache rows are keyed by.
    pub identity: String,
    pub markdown: String,
    /// Written Markdown file.
    pub markdown_path: PathBuf,
    /// Directory holding the extracted images.
    pub images_dir: PathBuf,
    /// Page texts in page order, restored from the cache on a document hit.
    pub pages: Vec<Page>,
    /// Images in document order.
    pub images: Vec<ImageOutput>,
    pub metadata: Option<DocumentMetadata>,
    pub stats: ConversionStats,
    /// True when the document cache answered and nothing was recomputed.
    pub from_cache: bool,
    /// Every state the run passed through, ending in `Done`.
    pub states: Vec<RunState>,
}

impl ConversionOutput {
    /// Whether every image got a caption.
    pub fn fully_captioned(&self) -> bool {
        self.images.iter().all(|i| i.caption.is_some())
    }
}

/// Compact result of [`crate::convert::process_pdf`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedPdf {
    pub page_texts: Vec<String>,
    pub images: Vec<ImageOutput>,
    pub markdown_path: PathBuf,
}

impl From<ConversionOutput> for ProcessedPdf {
    fn from(out: ConversionOutput) -> Self {
        Self {
            page_texts: out.pages.into_iter().map(|p| p.text).collect(),
            images: out.images,
            markdown_path: out.markdown_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions_are_allowed() {
        use RunState::*;
        let path = [Pending, Extracting, Captioning, Assembling, Cached, Done];
        for w in path.windows(2) {
            assert!(w[0].can_transition_to(w[1]), "{:?} -> {:?}", w[0], w[1]);
        }
    }

    #[test]
    fn captioning_cannot_fail_the_run() {
        assert!(!RunState::Captioning.can_transition_to(RunState::Failed));
        assert!(RunState::Extracting.can_transition_to(RunState::Failed));
    }

    #[test]
    fn done_is_terminal() {
        assert!(RunState::Done.is_terminal());
        assert!(!RunState::Done.can_transition_to(RunState::Extracting));
    }

    #[test]
    fn relative_path_uses_key() {
        let key = ImageKey::for_bytes(b"abc");
        let rec = ImageRecord {
            key: key.clone(),
            page: 1,
            position: 0,
            width: 1,
            height: 1,
            bytes: Arc::new(vec![]),
        };
        assert_eq!(rec.relative_path(), format!("images/{}.png", key));
    }
}
