//! # paper2md
//!
//! Convert PDF papers to Markdown, with every embedded figure captioned by a
//! Vision Language Model (VLM) and a SQLite cache so repeated runs cost
//! nothing.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Input     resolve local file or download from URL
//!  ├─ 2. Extract   page text + embedded images via pdfium (spawn_blocking)
//!  ├─ 3. Store     PNG bytes into the content-addressed ImageStore
//!  ├─ 4. Caption   bounded pool of VLM calls, retry/backoff, cache first
//!  └─ 5. Assemble  deterministic Markdown, written atomically, cached
//! ```
//!
//! A second run over the same document is answered from the document cache
//! without extraction or model calls and produces byte-identical Markdown.
//! Without an API key or provider, images are embedded without captions.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use paper2md::{convert, ConversionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConversionConfig::builder()
//!         .api_key(std::env::var("PAPER2MD_API_KEY")?)
//!         .output_dir("outputs/attention")
//!         .build()?;
//!     let output = convert("attention.pdf", &config).await?;
//!     println!("{}", output.markdown_path.display());
//!     eprintln!(
//!         "images: {}/{} captioned",
//!         output.stats.captioned_images, output.stats.total_images
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `paper2md` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! paper2md = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod convert;
pub mod error;
pub mod model;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ConversionConfig, ConversionConfigBuilder, PageSeparator};
pub use convert::{convert, convert_sync, inspect, invalidate, process_pdf, Converter};
pub use error::{CacheError, CaptionError, ConvertError, ExtractionError, ModelError};
pub use model::VisionModel;
pub use output::{
    Caption, CaptionSource, ConversionOutput, ConversionStats, DocumentMetadata, ImageOutput,
    ImageRecord, Page, ProcessedPdf, RunState,
};
pub use pipeline::extract::{DocumentExtractor, ExtractedDocument, PdfiumExtractor, RawImage};
pub use progress::{ConversionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use store::{Cache, CacheEntry, Database, DocumentIdentity, ImageKey, ImageStore};
