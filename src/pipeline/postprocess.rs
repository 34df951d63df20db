//! Post-processing: deterministic cleanup of extracted text and model output.
//!
//! Every rule is a pure `&str → String` function, so the Assembler stays
//! deterministic. Two entry points use them:
//!
//! - [`clean_page_text`] for pdfium page text (CRLF line breaks, trailing
//!   spaces, long blank runs, invisible characters)
//! - [`clean_model_text`] for caption answers (the above, plus stray
//!   ```` ```markdown ```` / ```` ```html ```` fences that models add despite the prompt)
//!
//! [`finalize_document`] is applied once to the assembled Markdown.

use once_cell::sync::Lazy;
use regex::Regex;

/// Normalise one page of extracted text. The result has no leading or trailing blank lines.
pub fn clean_page_text(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = remove_invisible_chars(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    s.trim_matches('\n').to_string()
}

/// Normalise a model answer before it is parsed into title and description.
pub fn clean_model_text(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = strip_markdown_fences(&s);
    let s = remove_invisible_chars(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    s.trim().to_string()
}

/// Final pass over the assembled document.
pub fn finalize_document(input: &str) -> String {
    let s = trim_trailing_whitespace(input);
    let s = collapse_blank_lines(&s);
    ensure_final_newline(&s)
}

// ── Rule 1: Strip outer markdown fences ──────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:markdown|md|html|text)?[ \t]*\n(.*)\n```\s*$").unwrap());

fn strip_markdown_fences(input: &str) -> String {
    if let Some(caps) = RE_OUTER_FENCES.captures(input.trim()) {
        caps[1].to_string()
    } else {
        input.to_string()
    }
}

// ── Rule 2: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 3: Trim trailing whitespace per line ────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 4: Collapse excessive blank lines ───────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n").to_string()
}

// ── Rule 5: Remove invisible Unicode characters ─────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}', '\u{0000}',
        ],
        "",
    )
}

// ── Rule 6: Ensure file ends with single newline ─────────────────────────────

fn ensure_final_newline(input: &str) -> String {
    let trimmed = input.trim_end();
    if trimmed.is_empty() {
        String::from("\n")
    } else {
        format!("{}\n", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_markdown_and_html_fences() {
        assert_eq!(
            clean_model_text("```markdown\nTitle: A\nDescription: B\n```"),
            "Title: A\nDescription: B"
        );
        assert_eq!(clean_model_text("```html\n<p>x</p>\n```\n"), "<p>x</p>");
        assert_eq!(clean_model_text("```\nplain\n```"), "plain");
    }

    #[test]
    fn leaves_inner_code_blocks_alone() {
        let s = "Description: see\n```python\nprint(1)\n```\nafter";
        assert_eq!(clean_model_text(s), s);
    }

    #[test]
    fn page_text_normalisation() {
        let raw = "\r\n\r\nLine one  \r\nLine\u{00AD}two\r\n\r\n\r\n\r\nLast\u{200B}\r\n";
        assert_eq!(clean_page_text(raw), "Line one\nLinetwo\n\nLast");
    }

    #[test]
    fn finalize_ends_with_single_newline() {
        assert_eq!(finalize_document("a\n\n\n\nb\n\n\n"), "a\n\nb\n");
        assert_eq!(finalize_document(""), "\n");
    }

    #[test]
    fn rules_are_deterministic() {
        let s = "x  \n\n\n\ny\u{FEFF}";
        assert_eq!(clean_page_text(s), clean_page_text(s));
    }
}
