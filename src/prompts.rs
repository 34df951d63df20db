//! Prompts for VLM-based figure captioning.
//!
//! Callers can override the system prompt via
//! [`crate::config::ConversionConfig::caption_prompt`]; the constants here
//! are used only when no override is provided. Overrides should keep the
//! `Title:` / `Description:` answer format, which
//! [`crate::pipeline::caption::parse_caption_response`] expects.

/// Default system prompt for captioning an image extracted from a PDF.
pub const DEFAULT_CAPTION_PROMPT: &str = r#"You describe images that were extracted from PDF documents, usually research papers.

For the image you are given:

1. Identify the image type (chart, plot, diagram, table, photograph, equation, logo, ...).
2. State its main subject and what it is used to show.
3. List the key information it carries: axes, labels, trends, values, components.
4. Transcribe any legible text or labels that matter for understanding it.

Be concise. Do not speculate beyond what is visible. Avoid redundant phrasing.

Answer in exactly this format and nothing else:

Title: <a precise title of 5 to 12 words>
Description: <two to five sentences>"#;

/// User turn accompanying the image.
pub const CAPTION_USER_PROMPT: &str =
    "Caption this image. Reply with the Title and Description lines only.";
