//! Conversion entry points and the run orchestrator.
//!
//! [`Converter`] owns the collaborators of one configuration (extractor,
//! captioning model, database) and drives a single document through
//!
//! ```text
//! Pending ─▶ Extracting ─▶ Captioning ─▶ Assembling ─▶ [Cached] ─▶ Done
//!    │            └─▶ Failed
//!    └─▶ Cached (document cache hit) ─▶ Done
//! ```
//!
//! Only extraction (and writing the Markdown file) can fail a run. Caption
//! failures degrade the document; cache failures fall back to recomputation.
//!
//! The free functions [`convert`], [`convert_sync`], [`process_pdf`],
//! [`inspect`] and [`invalidate`] build a `Converter` from configuration.

use crate::config::ConversionConfig;
use crate::error::{CacheError, ConvertError};
use crate::model::{resolve_model, VisionModel};
use crate::output::{
    CaptionSource, ConversionOutput, ConversionStats, DocumentMetadata, ImageOutput, Page,
    ProcessedPdf, RunState,
};
use crate::pipeline::assemble::assemble;
use crate::pipeline::caption::{CaptionOutcome, CaptionSettings, Captioner};
use crate::pipeline::extract::{self, DocumentExtractor, PdfiumExtractor};
use crate::pipeline::input;
use crate::store::{CacheEntry, CachedImage, Database, DocumentIdentity, ImageKey};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Convert a PDF file or URL to Markdown.
///
/// This is the primary entry point for the library. Writes
/// `<output_dir>/<stem>.md` and `<output_dir>/images/`.
///
/// # Returns
/// `Ok(ConversionOutput)` on success, even if some images could not be
/// captioned (check `output.stats.failed_images`).
///
/// # Errors
/// Returns `Err(ConvertError)` only for fatal errors:
/// - File not found / not a PDF / corrupt or encrypted PDF
/// - Markdown or image files could not be written
/// - The run deadline expired
pub async fn convert(
    input_str: impl AsRef<str>,
    config: &ConversionConfig,
) -> Result<ConversionOutput, ConvertError> {
    Converter::from_config(config.clone())?
        .run(input_str.as_ref())
        .await
}

/// Synchronous wrapper around [`convert`].
///
/// Creates a temporary tokio runtime internally.
pub fn convert_sync(
    input_str: impl AsRef<str>,
    config: &ConversionConfig,
) -> Result<ConversionOutput, ConvertError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| ConvertError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(convert(input_str, config))
}

/// Convert `source` into `output_dir`, captioning with `api_key` if given.
///
/// `cache_root` defaults to `./db`.
pub async fn process_pdf(
    source: impl AsRef<str>,
    output_dir: impl AsRef<Path>,
    api_key: Option<&str>,
    cache_root: Option<&Path>,
) -> Result<ProcessedPdf, ConvertError> {
    let mut builder = ConversionConfig::builder().output_dir(output_dir.as_ref());
    if let Some(key) = api_key {
        builder = builder.api_key(key);
    }
    if let Some(root) = cache_root {
        builder = builder.cache_dir(root);
    }
    let config = builder.build()?;
    Ok(convert(source, &config).await?.into())
}

/// Extract PDF metadata without converting content.
///
/// Does not require a model, an API key or the cache.
pub async fn inspect(input_str: impl AsRef<str>) -> Result<DocumentMetadata, ConvertError> {
    let config = ConversionConfig::default();
    Converter::new(config, Arc::new(PdfiumExtractor), None, None)
        .inspect(input_str.as_ref())
        .await
}

/// Forget the cached document and captions for `input`.
///
/// Returns whether anything was removed.
pub fn invalidate(
    input_str: &str,
    identity_override: Option<&str>,
    cache_dir: impl AsRef<Path>,
) -> Result<bool, CacheError> {
    let identity = DocumentIdentity::for_input(input_str, identity_override);
    Database::open(cache_dir)?.cache().invalidate(&identity)
}

// ── Converter ────────────────────────────────────────────────────────────

/// Drives documents through extraction, captioning and assembly.
pub struct Converter {
    config: ConversionConfig,
    extractor: Arc<dyn DocumentExtractor>,
    model: Option<Arc<dyn VisionModel>>,
    db: Option<Database>,
}

impl Converter {
    /// Production wiring: pdfium extraction, the model `config` selects, and
    /// the SQLite database under `config.cache_dir`.
    ///
    /// A database that cannot be opened is logged and the converter runs
    /// without caching.
    pub fn from_config(config: ConversionConfig) -> Result<Self, ConvertError> {
        let model = resolve_model(&config)?;
        let db = match Database::open(&config.cache_dir) {
            Ok(db) => Some(db),
            Err(e) => {
                warn!(
                    "Cache unavailable at {}: {}; continuing without cache",
                    config.cache_dir.display(),
                    e
                );
                None
            }
        };
        Ok(Self::new(config, Arc::new(PdfiumExtractor), model, db))
    }

    /// Explicit wiring. `model = None` runs in degraded mode; `db = None`
    /// disables both caches and the ImageStore.
    pub fn new(
        config: ConversionConfig,
        extractor: Arc<dyn DocumentExtractor>,
        model: Option<Arc<dyn VisionModel>>,
        db: Option<Database>,
    ) -> Self {
        Self {
            config,
            extractor,
            model,
            db,
        }
    }

    pub fn config(&self) -> &ConversionConfig {
        &self.config
    }

    pub fn database(&self) -> Option<&Database> {
        self.db.as_ref()
    }

    /// Convert one document, honouring `run_timeout_secs`.
    ///
    /// On timeout, in-flight caption requests are dropped. Captions that
    /// already completed stay in the cache.
    pub async fn run(&self, input_str: &str) -> Result<ConversionOutput, ConvertError> {
        match self.config.run_timeout_secs {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), self.run_inner(input_str))
                .await
                .map_err(|_| {
                    warn!("Conversion of {} timed out after {}s", input_str, secs);
                    ConvertError::RunTimedOut { secs }
                })?,
            None => self.run_inner(input_str).await,
        }
    }

    /// Metadata of `input_str` through this converter's extractor.
    pub async fn inspect(&self, input_str: &str) -> Result<DocumentMetadata, ConvertError> {
        let resolved = input::resolve_input(input_str, self.config.download_timeout_secs).await?;
        extract::extract_metadata(
            Arc::clone(&self.extractor),
            resolved.path(),
            self.config.password.as_deref(),
        )
        .await
    }

    /// Forget the cached document and captions for `input_str`.
    pub fn invalidate(&self, input_str: &str) -> Result<bool, CacheError> {
        let identity = self.identity_for(input_str);
        match self.db {
            Some(ref db) => db.cache().invalidate(&identity),
            None => Ok(false),
        }
    }

    fn identity_for(&self, input_str: &str) -> DocumentIdentity {
        DocumentIdentity::for_input(input_str, self.config.cache_identity_override.as_deref())
    }

    async fn run_inner(&self, input_str: &str) -> Result<ConversionOutput, ConvertError> {
        let total_start = Instant::now();
        let mut states = StateLog::new();
        info!("Starting conversion: {}", input_str);

        // ── Step 1: Resolve input and identity ───────────────────────────
        let resolved = match input::resolve_input(input_str, self.config.download_timeout_secs).await
        {
            Ok(r) => r,
            Err(e) => {
                states.fail(&e);
                return Err(e);
            }
        };
        let identity = self.identity_for(input_str);
        let stem = resolved.stem();
        let output_dir = self.config.output_dir_for(&stem);
        let images_dir = output_dir.join("images");
        let markdown_path = output_dir.join(format!("{}.md", stem));
        debug!("Document identity: {}", identity);

        // ── Step 2: Document cache ───────────────────────────────────────
        if self.config.refresh {
            debug!("Refresh requested; skipping document cache lookup");
        } else if let Some(entry) = self.load_cached(&identity, &images_dir)? {
            states.advance(RunState::Cached);
            write_markdown(&markdown_path, &entry.markdown).await?;
            states.advance(RunState::Done);
            let output =
                self.cached_output(identity, entry, markdown_path, images_dir, states, total_start);
            info!(
                "Conversion served from cache: {} images, {}ms",
                output.images.len(),
                output.stats.total_duration_ms
            );
            return Ok(output);
        }

        // ── Step 3: Extract ──────────────────────────────────────────────
        states.advance(RunState::Extracting);
        let extract_start = Instant::now();
        let mut doc = match extract::extract_document(
            Arc::clone(&self.extractor),
            resolved.path(),
            self.config.password.as_deref(),
        )
        .await
        {
            Ok(doc) => doc,
            Err(e) => {
                states.fail(&e);
                return Err(e);
            }
        };
        if self.config.strip_references {
            extract::strip_references(&mut doc);
        }
        let image_store = self.db.as_ref().map(|db| db.image_store());
        let records = match extract::persist_images(
            std::mem::take(&mut doc.images),
            image_store.as_ref(),
            &images_dir,
        ) {
            Ok(r) => r,
            Err(e) => {
                states.fail(&e);
                return Err(e);
            }
        };
        let extract_duration_ms = extract_start.elapsed().as_millis() as u64;
        info!(
            "Extracted {} pages and {} images in {}ms",
            doc.pages.len(),
            records.len(),
            extract_duration_ms
        );

        // ── Step 4: Caption ──────────────────────────────────────────────
        states.advance(RunState::Captioning);
        let distinct = records.iter().map(|r| &r.key).collect::<HashSet<_>>().len();
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_run_start(doc.pages.len(), distinct);
        }
        let caption_start = Instant::now();
        let outcomes = match self.model {
            Some(ref model) if !records.is_empty() => {
                let cache = self.db.as_ref().map(|db| db.cache());
                Captioner::new(
                    Arc::clone(model),
                    cache,
                    CaptionSettings::from_config(&self.config),
                )
                .with_progress(self.config.progress_callback.clone())
                .caption_all(&identity, &records)
                .await
            }
            Some(_) => HashMap::new(),
            None => {
                let cached = self.cached_captions(&identity, records.iter().map(|r| &r.key));
                let missing = records.iter().filter(|r| !cached.contains_key(&r.key)).count();
                if missing > 0 {
                    warn!(
                        "Captioning disabled; {} images will be embedded without descriptions",
                        missing
                    );
                }
                cached
            }
        };
        let caption_duration_ms = caption_start.elapsed().as_millis() as u64;

        let images: Vec<ImageOutput> = records
            .iter()
            .map(|r| {
                let outcome = outcomes.get(&r.key);
                ImageOutput {
                    key: r.key.clone(),
                    page: r.page,
                    position: r.position,
                    path: images_dir.join(r.key.file_name()),
                    caption: outcome.and_then(|o| o.result.as_ref().ok().cloned()),
                    source: outcome
                        .filter(|o| o.result.is_ok())
                        .map(|o| o.source),
                    error: outcome.and_then(|o| o.result.as_ref().err().cloned()),
                }
            })
            .collect();

        // ── Step 5: Assemble ─────────────────────────────────────────────
        states.advance(RunState::Assembling);
        let metadata = self.config.include_metadata.then_some(&doc.metadata);
        let markdown = assemble(&doc.pages, &images, metadata, &self.config.page_separator);
        write_markdown(&markdown_path, &markdown).await?;

        let captioned = images.iter().filter(|i| i.caption.is_some()).count();
        let stats = ConversionStats {
            total_pages: doc.pages.len(),
            total_images: images.len(),
            captioned_images: captioned,
            cached_captions: images
                .iter()
                .filter(|i| i.source == Some(CaptionSource::Cache))
                .count(),
            failed_images: images.iter().filter(|i| i.error.is_some()).count(),
            skipped_images: images
                .iter()
                .filter(|i| i.caption.is_none() && i.error.is_none())
                .count(),
            model_calls: outcomes.values().map(|o| o.model_calls as usize).sum(),
            total_duration_ms: 0,
            extract_duration_ms,
            caption_duration_ms,
        };

        // ── Step 6: Document cache admission ─────────────────────────────
        if captioned == images.len()
            && self.store_document(&identity, &markdown, &doc.pages, &images)
        {
            states.advance(RunState::Cached);
        }
        states.advance(RunState::Done);

        let stats = ConversionStats {
            total_duration_ms: total_start.elapsed().as_millis() as u64,
            ..stats
        };
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_run_complete(stats.captioned_images, stats.uncaptioned());
        }
        if stats.uncaptioned() > 0 {
            warn!(
                "{} of {} images left without a caption",
                stats.uncaptioned(),
                stats.total_images
            );
        }
        info!(
            "Conversion complete: {} pages, {}/{} images captioned ({} from cache, {} model calls), {}ms total",
            stats.total_pages,
            stats.captioned_images,
            stats.total_images,
            stats.cached_captions,
            stats.model_calls,
            stats.total_duration_ms
        );

        Ok(ConversionOutput {
            identity: identity.as_str().to_string(),
            markdown,
            markdown_path,
            images_dir,
            pages: doc.pages,
            images,
            metadata: Some(doc.metadata),
            stats,
            from_cache: false,
            states: states.into_vec(),
        })
    }

    /// Look up `identity` and, on a valid hit, write its images into
    /// `images_dir`. Cache faults are logged and reported as a miss.
    fn load_cached(
        &self,
        identity: &DocumentIdentity,
        images_dir: &Path,
    ) -> Result<Option<CacheEntry>, ConvertError> {
        let Some(ref db) = self.db else {
            return Ok(None);
        };
        let store = db.image_store();

        let entry = match db.cache().lookup(identity) {
            Ok(Some(entry)) => entry,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!("Cache lookup failed for {}: {}; recomputing", identity, e);
                return Ok(None);
            }
        };
        match entry.is_valid(&store) {
            Ok(true) => {}
            Ok(false) => {
                warn!("Cache entry for {} is incomplete; recomputing", identity);
                return Ok(None);
            }
            Err(e) => {
                warn!("Cache validation failed for {}: {}; recomputing", identity, e);
                return Ok(None);
            }
        }

        if !entry.images.is_empty() {
            extract::create_dir(images_dir)?;
        }
        let mut written = HashSet::new();
        for image in &entry.images {
            if !written.insert(image.key.clone()) {
                continue;
            }
            let bytes = match store.get(&image.key) {
                Ok(bytes) => bytes,
                Err(e @ CacheError::NotFound { .. }) => {
                    warn!("Inconsistent cache for {}: {}; recomputing", identity, e);
                    return Ok(None);
                }
                Err(e) => {
                    warn!("ImageStore read failed for {}: {}; recomputing", identity, e);
                    return Ok(None);
                }
            };
            extract::write_image_file(images_dir, &image.key, &bytes)?;
        }
        info!("Cache hit for {}", identity);
        Ok(Some(entry))
    }

    fn cached_output(
        &self,
        identity: DocumentIdentity,
        entry: CacheEntry,
        markdown_path: PathBuf,
        images_dir: PathBuf,
        states: StateLog,
        total_start: Instant,
    ) -> ConversionOutput {
        let images: Vec<ImageOutput> = entry
            .images
            .into_iter()
            .map(|i| ImageOutput {
                path: images_dir.join(i.key.file_name()),
                key: i.key,
                page: i.page,
                position: i.position,
                caption: Some(i.caption),
                source: Some(CaptionSource::Cache),
                error: None,
            })
            .collect();
        let stats = ConversionStats {
            total_pages: entry.pages.len(),
            total_images: images.len(),
            captioned_images: images.len(),
            cached_captions: images.len(),
            total_duration_ms: total_start.elapsed().as_millis() as u64,
            ..Default::default()
        };
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_run_complete(images.len(), 0);
        }
        ConversionOutput {
            identity: identity.as_str().to_string(),
            markdown: entry.markdown,
            markdown_path,
            images_dir,
            pages: entry.pages,
            images,
            metadata: None,
            stats,
            from_cache: true,
            states: states.into_vec(),
        }
    }

    /// Captions already cached for `keys`, used when no model is configured.
    /// Lookup failures are logged and leave the image uncaptioned.
    fn cached_captions<'a>(
        &self,
        identity: &DocumentIdentity,
        keys: impl Iterator<Item = &'a ImageKey>,
    ) -> HashMap<ImageKey, CaptionOutcome> {
        let Some(ref db) = self.db else {
            return HashMap::new();
        };
        let cache = db.cache();
        let mut outcomes = HashMap::new();
        for key in keys {
            if outcomes.contains_key(key) {
                continue;
            }
            match cache.caption(identity, key) {
                Ok(Some(caption)) => {
                    debug!("Reusing cached caption for {}", key);
                    outcomes.insert(
                        key.clone(),
                        CaptionOutcome {
                            key: key.clone(),
                            result: Ok(caption),
                            source: CaptionSource::Cache,
                            model_calls: 0,
                        },
                    );
                }
                Ok(None) => {}
                Err(e) => warn!("Caption cache read failed for {}: {}", key, e),
            }
        }
        outcomes
    }

    /// Write the document entry. Returns whether it was stored.
    fn store_document(
        &self,
        identity: &DocumentIdentity,
        markdown: &str,
        pages: &[Page],
        images: &[ImageOutput],
    ) -> bool {
        let Some(ref db) = self.db else {
            return false;
        };
        let entry = CacheEntry {
            markdown: markdown.to_string(),
            pages: pages.to_vec(),
            images: images
                .iter()
                .filter_map(|i| {
                    i.caption.clone().map(|caption| CachedImage {
                        key: i.key.clone(),
                        page: i.page,
                        position: i.position,
                        caption,
                    })
                })
                .collect(),
        };
        match entry.is_valid(&db.image_store()) {
            Ok(true) => {}
            Ok(false) => {
                warn!("Not caching {}: some images are missing from the store", identity);
                return false;
            }
            Err(e) => {
                warn!("Not caching {}: {}", identity, e);
                return false;
            }
        }
        match db.cache().store(identity, &entry) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to cache {}: {}", identity, e);
                false
            }
        }
    }
}

/// Atomic write: temp file, then rename.
async fn write_markdown(path: &Path, markdown: &str) -> Result<(), ConvertError> {
    let write_failed = |source| ConvertError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_failed)?;
    }
    let tmp_path = path.with_extension("md.tmp");
    tokio::fs::write(&tmp_path, markdown)
        .await
        .map_err(write_failed)?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(write_failed)?;
    debug!("Wrote {}", path.display());
    Ok(())
}

/// States a run has passed through.
struct StateLog(Vec<RunState>);

impl StateLog {
    fn new() -> Self {
        Self(vec![RunState::Pending])
    }

    fn current(&self) -> RunState {
        self.0.last().copied().unwrap_or(RunState::Pending)
    }

    fn advance(&mut self, next: RunState) {
        let current = self.current();
        debug_assert!(
            current.can_transition_to(next),
            "invalid transition {:?} -> {:?}",
            current,
            next
        );
        debug!("Run state: {:?} -> {:?}", current, next);
        self.0.push(next);
    }

    fn fail(&mut self, error: &ConvertError) {
        warn!("Run failed in {:?}: {}", self.current(), error);
        self.0.push(RunState::Failed);
    }

    fn into_vec(self) -> Vec<RunState> {
        self.0
    }
}
