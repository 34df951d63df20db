//! Input resolution: normalise a user-supplied path or URL to a local file.
//!
//! pdfium needs a file-system path, so URL inputs are downloaded into a
//! `TempDir` that lives as long as the returned [`ResolvedInput`]. The PDF
//! magic bytes (`%PDF`) are checked up front so callers get a meaningful
//! error rather than a pdfium failure.

use crate::error::{ConvertError, ExtractionError};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// The resolved input: either a local path or a downloaded temp file.
pub enum ResolvedInput {
    /// Input was already a local file.
    Local(PathBuf),
    /// Input was a URL; PDF downloaded to a temp directory kept alive here.
    Downloaded { path: PathBuf, _temp_dir: TempDir },
}

impl ResolvedInput {
    /// Get the path to the PDF file regardless of how it was resolved.
    pub fn path(&self) -> &Path {
        match self {
            ResolvedInput::Local(p) => p,
            ResolvedInput::Downloaded { path, .. } => path,
        }
    }

    /// File stem used to name the Markdown output, `document` if there is none.
    pub fn stem(&self) -> String {
        self.path()
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "document".to_string())
    }
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve the input string to a local PDF file path.
///
/// If the input is a URL, download it to a temporary directory.
/// If the input is a local file, validate it exists and is readable.
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<ResolvedInput, ConvertError> {
    if input.trim().is_empty() {
        return Err(ExtractionError::InvalidInput {
            input: input.to_string(),
        }
        .into());
    }
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        Ok(resolve_local(input)?)
    }
}

/// Resolve a local file path, validating existence and PDF magic bytes.
fn resolve_local(path_str: &str) -> Result<ResolvedInput, ExtractionError> {
    let path = PathBuf::from(path_str);

    if !path.exists() {
        return Err(ExtractionError::FileNotFound { path });
    }

    match std::fs::File::open(&path) {
        Ok(mut f) => {
            use std::io::Read;
            let mut magic = [0u8; 4];
            if f.read_exact(&mut magic).is_ok() && &magic != b"%PDF" {
                return Err(ExtractionError::NotAPdf { path, magic });
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(ExtractionError::PermissionDenied { path });
        }
        Err(_) => {
            return Err(ExtractionError::FileNotFound { path });
        }
    }

    debug!("Resolved local PDF: {}", path.display());
    Ok(ResolvedInput::Local(path))
}

/// Download a URL to a temporary directory and return the path.
async fn download_url(url: &str, timeout_secs: u64) -> Result<ResolvedInput, ConvertError> {
    info!("Downloading PDF from: {}", url);

    let failed = |reason: String| ExtractionError::DownloadFailed {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            ExtractionError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            failed(e.to_string())
        }
    })?;

    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())).into());
    }

    let filename = filename_from_url(url);

    let temp_dir = TempDir::new().map_err(|e| ConvertError::Internal(e.to_string()))?;
    let file_path = temp_dir.path().join(&filename);

    let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;

    if bytes.len() >= 4 && &bytes[..4] != b"%PDF" {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[..4]);
        return Err(ExtractionError::NotAPdf {
            path: file_path,
            magic,
        }
        .into());
    }

    tokio::fs::write(&file_path, &bytes)
        .await
        .map_err(|e| ConvertError::Internal(format!("Failed to write temp file: {}", e)))?;

    info!("Downloaded to: {}", file_path.display());

    Ok(ResolvedInput::Downloaded {
        path: file_path,
        _temp_dir: temp_dir,
    })
}

/// Last path segment of the URL, always ending in `.pdf`.
///
/// `1706.03762` becomes `1706.03762.pdf`, so the stem keeps the full id.
fn filename_from_url(url: &str) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(mut segments) = parsed.path_segments() {
            if let Some(last) = segments.next_back() {
                if !last.is_empty() && last.to_ascii_lowercase().ends_with(".pdf") {
                    return last.to_string();
                }
                if !last.is_empty() {
                    return format!("{last}.pdf");
                }
            }
        }
    }

    "downloaded.pdf".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.com/doc.pdf"));
        assert!(is_url("http://example.com/doc.pdf"));
        assert!(!is_url("/tmp/doc.pdf"));
        assert!(!is_url("doc.pdf"));
        assert!(!is_url(""));
    }

    #[test]
    fn filename_from_url_variants() {
        assert_eq!(filename_from_url("https://h/papers/a.pdf"), "a.pdf");
        assert_eq!(filename_from_url("https://h/papers/B.PDF"), "B.PDF");
        assert_eq!(
            filename_from_url("https://arxiv.org/pdf/1706.03762"),
            "1706.03762.pdf"
        );
        assert_eq!(filename_from_url("https://h/papers/paper"), "paper.pdf");
        assert_eq!(filename_from_url("https://h/"), "downloaded.pdf");
    }

    #[test]
    fn dotted_url_segments_keep_distinct_stems() {
        let stem = |url: &str| {
            let resolved = ResolvedInput::Local(PathBuf::from(filename_from_url(url)));
            resolved.stem()
        };
        let first = stem("https://arxiv.org/pdf/1706.03762");
        let second = stem("https://arxiv.org/pdf/1706.99999");
        assert_eq!(first, "1706.03762");
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn missing_file_is_file_not_found() {
        let err = resolve_input("/definitely/not/here.pdf", 5).await.err().unwrap();
        assert!(matches!(
            err,
            ConvertError::Extraction(ExtractionError::FileNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn non_pdf_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("notes.pdf");
        std::fs::write(&p, b"hello world").unwrap();
        let err = resolve_input(p.to_str().unwrap(), 5).await.err().unwrap();
        assert!(matches!(
            err,
            ConvertError::Extraction(ExtractionError::NotAPdf { .. })
        ));
    }

    #[tokio::test]
    async fn local_pdf_resolves_with_stem() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("attention.pdf");
        std::fs::write(&p, b"%PDF-1.7\n").unwrap();
        let resolved = resolve_input(p.to_str().unwrap(), 5).await.unwrap();
        assert_eq!(resolved.path(), p.as_path());
        assert_eq!(resolved.stem(), "attention");
    }
}
