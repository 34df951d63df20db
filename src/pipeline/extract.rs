//! Extraction: page text and embedded images from a PDF.
//!
//! [`DocumentExtractor`] is the seam. [`PdfiumExtractor`] is the production
//! implementation; tests inject canned documents. Extraction always runs,
//! nothing here is cached.
//!
//! Image order contract: within a page, images are numbered `0..n` in the
//! order pdfium enumerates page objects, which is content-stream order.
//! That number is recorded once, here, and the Assembler relies on nothing
//! else to place the image.
//!
//! pdfium is not async-safe, so [`extract_document`] runs the extractor in
//! `spawn_blocking`.

use crate::error::{ConvertError, ExtractionError};
use crate::output::{DocumentMetadata, ImageRecord, Page};
use crate::pipeline::encode;
use crate::store::{ImageKey, ImageStore};
use once_cell::sync::Lazy;
use pdfium_render::prelude::*;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Images with either side below this many pixels are decorative (rules,
/// bullets, masks) and are not extracted.
pub const MIN_IMAGE_SIDE: u32 = 16;

/// An image as produced by an extractor, before persistence.
#[derive(Debug, Clone)]
pub struct RawImage {
    /// 1-indexed page number.
    pub page: usize,
    /// 0-indexed position within the page.
    pub position: usize,
    /// PNG bytes.
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Everything extraction yields for one document.
#[derive(Debug, Clone, Default)]
pub struct ExtractedDocument {
    pub metadata: DocumentMetadata,
    /// One entry per physical page, in page order.
    pub pages: Vec<Page>,
    /// In page order, then position order.
    pub images: Vec<RawImage>,
}

/// Produces page text and images for a local PDF.
pub trait DocumentExtractor: Send + Sync {
    fn extract(&self, path: &Path, password: Option<&str>)
        -> Result<ExtractedDocument, ExtractionError>;

    /// Metadata only, without touching page content.
    fn metadata(&self, path: &Path, password: Option<&str>)
        -> Result<DocumentMetadata, ExtractionError>;
}

/// pdfium-backed extractor. Binds the library (downloading it on first use)
/// for each document.
#[derive(Debug, Clone, Copy, Default)]
pub struct PdfiumExtractor;

impl PdfiumExtractor {
    fn bind() -> Result<Pdfium, ExtractionError> {
        pdfium_auto::bind_pdfium_silent()
            .map_err(|e| ExtractionError::PdfiumBindingFailed(e.to_string()))
    }
}

impl DocumentExtractor for PdfiumExtractor {
    fn extract(
        &self,
        path: &Path,
        password: Option<&str>,
    ) -> Result<ExtractedDocument, ExtractionError> {
        let pdfium = Self::bind()?;
        let document = open_document(&pdfium, path, password)?;
        let metadata = read_metadata(&document);
        info!("PDF loaded: {} pages", metadata.page_count);

        let mut pages = Vec::with_capacity(metadata.page_count);
        let mut images = Vec::new();

        for (idx, page) in document.pages().iter().enumerate() {
            let number = idx + 1;
            let text = match page.text() {
                Ok(t) => t.all(),
                Err(e) => {
                    warn!("Page {}: text extraction failed: {:?}", number, e);
                    String::new()
                }
            };

            let mut position = 0;
            for object in page.objects().iter() {
                let Some(image_object) = object.as_image_object() else {
                    continue;
                };
                let decoded = match image_object.get_raw_image() {
                    Ok(img) => img,
                    Err(e) => {
                        warn!("Page {}: skipping undecodable image: {:?}", number, e);
                        continue;
                    }
                };
                if decoded.width() < MIN_IMAGE_SIDE || decoded.height() < MIN_IMAGE_SIDE {
                    debug!(
                        "Page {}: skipping {}x{} decorative image",
                        number,
                        decoded.width(),
                        decoded.height()
                    );
                    continue;
                }
                let png = encode::encode_png(&decoded).map_err(|e| {
                    ExtractionError::ImageEncoding {
                        page: number,
                        position,
                        detail: e.to_string(),
                    }
                })?;
                images.push(RawImage {
                    page: number,
                    position,
                    png,
                    width: decoded.width(),
                    height: decoded.height(),
                });
                position += 1;
            }

            debug!(
                "Page {}: {} chars of text, {} images",
                number,
                text.len(),
                position
            );
            pages.push(Page { number, text });
        }

        Ok(ExtractedDocument {
            metadata,
            pages,
            images,
        })
    }

    fn metadata(
        &self,
        path: &Path,
        password: Option<&str>,
    ) -> Result<DocumentMetadata, ExtractionError> {
        let pdfium = Self::bind()?;
        let document = open_document(&pdfium, path, password)?;
        Ok(read_metadata(&document))
    }
}

fn open_document<'a>(
    pdfium: &'a Pdfium,
    path: &Path,
    password: Option<&'a str>,
) -> Result<PdfDocument<'a>, ExtractionError> {
    pdfium.load_pdf_from_file(path, password).map_err(|e| {
        let err_str = format!("{:?}", e);
        if err_str.contains("Password") || err_str.contains("password") {
            if password.is_some() {
                ExtractionError::WrongPassword {
                    path: path.to_path_buf(),
                }
            } else {
                ExtractionError::PasswordRequired {
                    path: path.to_path_buf(),
                }
            }
        } else {
            ExtractionError::CorruptPdf {
                path: path.to_path_buf(),
                detail: err_str,
            }
        }
    })
}

fn read_metadata(document: &PdfDocument<'_>) -> DocumentMetadata {
    let metadata = document.metadata();
    let get_meta = |tag: PdfDocumentMetadataTagType| -> Option<String> {
        metadata.get(tag).and_then(|t| {
            let v = t.value().trim().to_string();
            if v.is_empty() {
                None
            } else {
                Some(v)
            }
        })
    };

    DocumentMetadata {
        title: get_meta(PdfDocumentMetadataTagType::Title),
        author: get_meta(PdfDocumentMetadataTagType::Author),
        subject: get_meta(PdfDocumentMetadataTagType::Subject),
        creator: get_meta(PdfDocumentMetadataTagType::Creator),
        producer: get_meta(PdfDocumentMetadataTagType::Producer),
        creation_date: get_meta(PdfDocumentMetadataTagType::CreationDate),
        modification_date: get_meta(PdfDocumentMetadataTagType::ModificationDate),
        page_count: document.pages().len() as usize,
        pdf_version: format!("{:?}", document.version()),
    }
}

// ── Async wrappers ───────────────────────────────────────────────────────

/// Run `extractor` on a blocking thread.
pub async fn extract_document(
    extractor: Arc<dyn DocumentExtractor>,
    path: &Path,
    password: Option<&str>,
) -> Result<ExtractedDocument, ConvertError> {
    let path = path.to_path_buf();
    let password = password.map(str::to_string);
    let doc = tokio::task::spawn_blocking(move || extractor.extract(&path, password.as_deref()))
        .await
        .map_err(|e| ConvertError::Internal(format!("Extraction task panicked: {}", e)))??;
    Ok(doc)
}

/// Metadata only, on a blocking thread.
pub async fn extract_metadata(
    extractor: Arc<dyn DocumentExtractor>,
    path: &Path,
    password: Option<&str>,
) -> Result<DocumentMetadata, ConvertError> {
    let path = path.to_path_buf();
    let password = password.map(str::to_string);
    let meta = tokio::task::spawn_blocking(move || extractor.metadata(&path, password.as_deref()))
        .await
        .map_err(|e| ConvertError::Internal(format!("Metadata task panicked: {}", e)))??;
    Ok(meta)
}

// ── Persistence ──────────────────────────────────────────────────────────

/// Store every image in the ImageStore and write it to `images_dir`.
///
/// Files are named by content key, so a byte-identical image is written once
/// however often it appears. Without a store, or when a store write fails,
/// the key is computed locally and the document just won't be cacheable.
pub fn persist_images(
    raw: Vec<RawImage>,
    store: Option<&ImageStore>,
    images_dir: &Path,
) -> Result<Vec<ImageRecord>, ConvertError> {
    if !raw.is_empty() {
        create_dir(images_dir)?;
    }

    let mut records = Vec::with_capacity(raw.len());
    for image in raw {
        let key = match store.map(|s| s.put(&image.png)) {
            Some(Ok(key)) => key,
            None => ImageKey::for_bytes(&image.png),
            Some(Err(e)) => {
                warn!(
                    "ImageStore write failed for page {} image {}: {}",
                    image.page, image.position, e
                );
                ImageKey::for_bytes(&image.png)
            }
        };
        write_image_file(images_dir, &key, &image.png)?;
        records.push(ImageRecord {
            key,
            page: image.page,
            position: image.position,
            width: image.width,
            height: image.height,
            bytes: Arc::new(image.png),
        });
    }
    Ok(records)
}

/// Write `<images_dir>/<key>.png` unless it already exists.
pub fn write_image_file(images_dir: &Path, key: &ImageKey, bytes: &[u8]) -> Result<PathBuf, ConvertError> {
    let path = images_dir.join(key.file_name());
    if !path.exists() {
        std::fs::write(&path, bytes).map_err(|source| ConvertError::OutputWriteFailed {
            path: path.clone(),
            source,
        })?;
    }
    Ok(path)
}

pub(crate) fn create_dir(dir: &Path) -> Result<(), ConvertError> {
    std::fs::create_dir_all(dir).map_err(|source| ConvertError::OutputWriteFailed {
        path: dir.to_path_buf(),
        source,
    })
}

// ── Reference stripping ──────────────────────────────────────────────────

static RE_REFERENCES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^[ \t#*]*(references|bibliography|参考文献)[ \t*:]*$").unwrap()
});

/// Truncate the document at its reference list.
///
/// The page holding a line that reads `References`/`Bibliography`/`参考文献`
/// keeps only the text before that line; later pages are dropped, along with
/// their images. Returns the page number where the cut happened.
pub fn strip_references(doc: &mut ExtractedDocument) -> Option<usize> {
    let (idx, offset) = doc
        .pages
        .iter()
        .enumerate()
        .find_map(|(i, p)| RE_REFERENCES.find(&p.text).map(|m| (i, m.start())))?;

    let cut_page = doc.pages[idx].number;
    doc.pages[idx].text.truncate(offset);
    doc.pages.truncate(idx + 1);
    doc.images.retain(|img| img.page <= cut_page);
    info!("Stripped references from page {} onwards", cut_page);
    Some(cut_page)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;

    fn page(number: usize, text: &str) -> Page {
        Page {
            number,
            text: text.to_string(),
        }
    }

    fn raw(page: usize, position: usize, bytes: &[u8]) -> RawImage {
        RawImage {
            page,
            position,
            png: bytes.to_vec(),
            width: 32,
            height: 32,
        }
    }

    #[test]
    fn strip_references_truncates_and_drops_later_pages() {
        let mut doc = ExtractedDocument {
            pages: vec![
                page(1, "Intro"),
                page(2, "Results\n\nReferences\n[1] A. Author"),
                page(3, "[2] B. Author"),
            ],
            images: vec![raw(2, 0, b"a"), raw(3, 0, b"b")],
            ..Default::default()
        };
        assert_eq!(strip_references(&mut doc), Some(2));
        assert_eq!(doc.pages.len(), 2);
        assert_eq!(doc.pages[1].text, "Results\n\n");
        assert_eq!(doc.images.len(), 1);
    }

    #[test]
    fn strip_references_matches_heading_forms() {
        for heading in ["## References", "REFERENCES", "参考文献", "**Bibliography**"] {
            let mut doc = ExtractedDocument {
                pages: vec![page(1, &format!("body\n{heading}\n[1] x"))],
                ..Default::default()
            };
            assert_eq!(strip_references(&mut doc), Some(1), "heading {heading:?}");
        }
    }

    #[test]
    fn strip_references_ignores_inline_mentions() {
        let mut doc = ExtractedDocument {
            pages: vec![page(1, "See the references in section 2.")],
            ..Default::default()
        };
        assert_eq!(strip_references(&mut doc), None);
        assert_eq!(doc.pages[0].text, "See the references in section 2.");
    }

    #[test]
    fn persist_writes_each_distinct_image_once() {
        let dir = tempfile::tempdir().unwrap();
        let images_dir = dir.path().join("images");
        let store = Database::open_in_memory().unwrap().image_store();
        let records = persist_images(
            vec![raw(1, 0, b"same"), raw(2, 0, b"same"), raw(2, 1, b"other")],
            Some(&store),
            &images_dir,
        )
        .unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].key, records[1].key);
        assert_ne!(records[1].key, records[2].key);
        assert_eq!(store.len().unwrap(), 2);
        assert_eq!(std::fs::read_dir(&images_dir).unwrap().count(), 2);
        assert!(images_dir.join(records[2].key.file_name()).exists());
    }

    #[test]
    fn persist_without_images_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let images_dir = dir.path().join("images");
        assert!(persist_images(vec![], None, &images_dir).unwrap().is_empty());
        assert!(!images_dir.exists());
    }

    #[test]
    fn persist_without_store_still_keys_by_content() {
        let dir = tempfile::tempdir().unwrap();
        let records = persist_images(vec![raw(1, 0, b"solo")], None, dir.path()).unwrap();
        assert_eq!(records[0].key, ImageKey::for_bytes(b"solo"));
        assert!(dir.path().join(records[0].key.file_name()).exists());
    }
}
