//! Pipeline stages for PDF-to-Markdown conversion.
//!
//! Each submodule implements one step and is testable on its own.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ extract ──▶ caption ──▶ assemble
//! (URL/path) (pdfium)   (VLM pool)  (Markdown)
//!              │            │
//!              ▼            ▼
//!          ImageStore     Cache
//! ```
//!
//! 1. [`input`]: canonicalise the user-supplied path or URL to a local file
//! 2. [`extract`]: page text and embedded images; runs in `spawn_blocking`
//!    because pdfium is not async-safe
//! 3. [`encode`]: PNG normalisation and base64 payloads
//! 4. [`caption`]: bounded, cache-aware captioning with [`retry`]
//! 5. [`assemble`]: deterministic Markdown layout, cleaned by [`postprocess`]

pub mod assemble;
pub mod caption;
pub mod encode;
pub mod extract;
pub mod input;
pub mod postprocess;
pub mod retry;
