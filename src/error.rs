//! Error types for the paper2md library.
//!
//! Failure modes are split by how far they reach:
//!
//! * [`ConvertError`] is **fatal**. Extraction failed (missing file, corrupt
//!   PDF, wrong password), the configuration is invalid, or the output could
//!   not be written. Returned as `Err(ConvertError)` from every `convert*`
//!   entry point.
//!
//! * [`CaptionError`] is **per image**. The model could not caption one image
//!   after all retries; the image is still embedded without a caption and the
//!   run carries on. Stored in [`crate::output::ImageOutput`].
//!
//! * [`CacheError`] is **recovered**. A read or write against the SQLite store
//!   failed; the pipeline logs it and recomputes instead of aborting.
//!   [`CacheError::NotFound`] is the ImageStore miss.
//!
//! * [`ModelError`] is the transport-level failure of one model call. The
//!   retry policy consults [`ModelError::is_transient`] before trying again.

use std::path::PathBuf;
use thiserror::Error;

/// Fatal extraction failures. Any of these aborts the run.
#[derive(Debug, Error)]
pub enum ExtractionError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}\nTry repairing with: qpdf --decrypt input.pdf output.pdf")]
    CorruptPdf { path: PathBuf, detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{path}' is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired { path: PathBuf },

    /// A password was provided but it is wrong.
    #[error("Wrong password for PDF '{path}'")]
    WrongPassword { path: PathBuf },

    /// An embedded image could not be decoded or re-encoded as PNG.
    #[error("Image {position} on page {page} could not be encoded: {detail}")]
    ImageEncoding {
        page: usize,
        position: usize,
        detail: String,
    },

    // ── Pdfium binding errors ─────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
PDFium is normally downloaded automatically on first run.\n\
If the auto-download failed, you can:\n\
  • Check your internet connection and try again.\n\
  • Set PDFIUM_LIB_PATH=/path/to/libpdfium to use an existing copy.\n"
    )]
    PdfiumBindingFailed(String),
}

/// All fatal errors returned by the paper2md library.
///
/// Image-level caption failures use [`CaptionError`] and are stored in the
/// output rather than propagated here.
#[derive(Debug, Error)]
pub enum ConvertError {
    /// The source could not be resolved or parsed.
    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the output Markdown file or image directory.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The whole run exceeded `run_timeout_secs`.
    #[error("Conversion timed out after {secs}s; captions finished so far stay cached")]
    RunTimedOut { secs: u64 },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal caption failure for a single image.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
pub enum CaptionError {
    /// Model call failed after the retry budget was spent, or failed permanently.
    #[error("Image {key}: model call failed after {attempts} attempt(s): {detail}")]
    ModelFailed {
        key: String,
        attempts: u32,
        detail: String,
    },

    /// Model answered with nothing usable.
    #[error("Image {key}: model returned an empty caption")]
    EmptyResponse { key: String },
}

/// Failures of the SQLite-backed ImageStore and Cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Cache entry could not be (de)serialised: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache lock poisoned")]
    LockPoisoned,

    /// ImageStore miss. Never expected for keys referenced by a valid entry.
    #[error("Image '{key}' not found in store")]
    NotFound { key: String },
}

/// Failure of one vision-model call.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    /// Connection reset, DNS failure and similar network faults.
    #[error("Request to '{endpoint}' failed: {detail}")]
    Request { endpoint: String, detail: String },

    /// The call did not finish within `api_timeout_secs`.
    #[error("Model call timed out after {secs}s")]
    Timeout { secs: u64 },

    /// HTTP 429.
    #[error("Rate limit exceeded")]
    RateLimited { retry_after_secs: Option<u64> },

    /// HTTP 401/403. Retrying will not help.
    #[error("Authentication rejected: {detail}")]
    Auth { detail: String },

    /// Any other non-success HTTP status.
    #[error("Model API returned HTTP {status}: {message}")]
    Api { status: u16, message: String },

    /// The body could not be parsed or held no choices.
    #[error("Malformed model response: {0}")]
    InvalidResponse(String),

    /// Error surfaced by an edgequake-llm provider.
    #[error("Provider '{provider}' error: {detail}")]
    Provider { provider: String, detail: String },
}

impl ModelError {
    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ModelError::Request { .. } | ModelError::Timeout { .. } => true,
            ModelError::RateLimited { .. } => true,
            ModelError::Api { status, .. } => *status >= 500 || *status == 408,
            ModelError::Auth { .. } | ModelError::InvalidResponse(_) => false,
            ModelError::Provider { detail, .. } => {
                let d = detail.to_lowercase();
                !(d.contains("401")
                    || d.contains("403")
                    || d.contains("unauthorized")
                    || d.contains("invalid api key")
                    || d.contains("not configured"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extraction_error_is_transparent_in_convert_error() {
        let e: ConvertError = ExtractionError::FileNotFound {
            path: PathBuf::from("/tmp/missing.pdf"),
        }
        .into();
        assert!(e.to_string().contains("missing.pdf"), "got: {e}");
    }

    #[test]
    fn caption_error_display() {
        let e = CaptionError::ModelFailed {
            key: "ab12".into(),
            attempts: 4,
            detail: "HTTP 503".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("ab12"));
        assert!(msg.contains("4 attempt"));
    }

    #[test]
    fn transient_classification() {
        assert!(ModelError::Timeout { secs: 5 }.is_transient());
        assert!(ModelError::RateLimited { retry_after_secs: None }.is_transient());
        assert!(ModelError::Api { status: 503, message: String::new() }.is_transient());
        assert!(!ModelError::Api { status: 400, message: String::new() }.is_transient());
        assert!(!ModelError::Auth { detail: "bad key".into() }.is_transient());
        assert!(!ModelError::InvalidResponse("no choices".into()).is_transient());
    }

    #[test]
    fn provider_errors_mentioning_auth_are_permanent() {
        let e = ModelError::Provider {
            provider: "openai".into(),
            detail: "HTTP 401 Unauthorized".into(),
        };
        assert!(!e.is_transient());
        let e = ModelError::Provider {
            provider: "openai".into(),
            detail: "connection reset by peer".into(),
        };
        assert!(e.is_transient());
    }

    #[test]
    fn not_found_display() {
        let e = CacheError::NotFound { key: "deadbeef".into() };
        assert!(e.to_string().contains("deadbeef"));
    }
}
