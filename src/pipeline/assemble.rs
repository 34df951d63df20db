//! Assembly: pages plus captioned images → one Markdown document.
//!
//! Pure and deterministic. Placement depends only on each image's recorded
//! `(page, position)`, never on the order captions arrived in.
//!
//! ## Layout
//!
//! ```text
//! [front matter]
//! page 1: images by position, then page text
//! <separator>
//! page 2: ...
//! ```
//!
//! A captioned image renders as
//!
//! ```text
//! ![Title](images/<key>.png)
//!
//! > Description line 1
//! > Description line 2
//! ```
//!
//! An uncaptioned image renders as the bare reference `![](images/<key>.png)`.

use crate::config::PageSeparator;
use crate::output::{Caption, DocumentMetadata, ImageOutput, Page};
use crate::pipeline::postprocess;
use crate::store::ImageKey;

/// Assemble the final Markdown.
///
/// `metadata` is rendered as YAML front matter when present. Images whose
/// page is not in `pages` are appended after the last page in page order, so
/// no reference is ever lost.
pub fn assemble(
    pages: &[Page],
    images: &[ImageOutput],
    metadata: Option<&DocumentMetadata>,
    separator: &PageSeparator,
) -> String {
    let mut sorted: Vec<&ImageOutput> = images.iter().collect();
    sorted.sort_by(|a, b| {
        (a.page, a.position, a.key.as_str()).cmp(&(b.page, b.position, b.key.as_str()))
    });

    let mut sorted_pages: Vec<&Page> = pages.iter().collect();
    sorted_pages.sort_by_key(|p| p.number);

    let mut out = String::new();
    if let Some(meta) = metadata {
        out.push_str(&format_yaml_front_matter(meta));
    }

    for (i, page) in sorted_pages.iter().enumerate() {
        if i > 0 {
            out.push_str(&separator.render(page.number));
        }
        let blocks: Vec<String> = sorted
            .iter()
            .filter(|img| img.page == page.number)
            .map(|img| render_image(&img.key, img.caption.as_ref()))
            .chain(Some(postprocess::clean_page_text(&page.text)).filter(|t| !t.is_empty()))
            .collect();
        out.push_str(&blocks.join("\n\n"));
    }

    let orphans: Vec<String> = sorted
        .iter()
        .filter(|img| !sorted_pages.iter().any(|p| p.number == img.page))
        .map(|img| render_image(&img.key, img.caption.as_ref()))
        .collect();
    if !orphans.is_empty() {
        out.push_str("\n\n");
        out.push_str(&orphans.join("\n\n"));
    }

    postprocess::finalize_document(&out)
}

/// One image reference, with its caption when there is one.
pub fn render_image(key: &ImageKey, caption: Option<&Caption>) -> String {
    let path = format!("images/{}", key.file_name());
    match caption {
        Some(c) => {
            let mut s = format!("![{}]({})", escape_alt(&c.title), path);
            let quote = blockquote(&c.description);
            if !quote.is_empty() {
                s.push_str("\n\n");
                s.push_str(&quote);
            }
            s
        }
        None => format!("![]({})", path),
    }
}

fn blockquote(text: &str) -> String {
    let text = text.trim();
    if text.is_empty() {
        return String::new();
    }
    text.lines()
        .map(|line| {
            let line = line.trim_end();
            if line.is_empty() {
                ">".to_string()
            } else {
                format!("> {}", line)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Alt text must stay on one line and must not close the bracket early.
fn escape_alt(title: &str) -> String {
    title
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace('\\', "\\\\")
        .replace('[', "\\[")
        .replace(']', "\\]")
}

/// Format document metadata as YAML front matter.
pub fn format_yaml_front_matter(meta: &DocumentMetadata) -> String {
    let mut yaml = String::from("---\n");

    let mut field = |name: &str, value: &Option<String>| {
        if let Some(v) = value {
            yaml.push_str(&format!("{}: \"{}\"\n", name, yaml_escape(v)));
        }
    };
    field("title", &meta.title);
    field("author", &meta.author);
    field("subject", &meta.subject);
    field("creator", &meta.creator);
    field("producer", &meta.producer);

    yaml.push_str(&format!("pages: {}\n", meta.page_count));
    if !meta.pdf_version.is_empty() {
        yaml.push_str(&format!("pdf_version: \"{}\"\n", yaml_escape(&meta.pdf_version)));
    }

    yaml.push_str("---\n\n");
    yaml
}

fn yaml_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CaptionError;
    use std::path::PathBuf;

    fn page(number: usize, text: &str) -> Page {
        Page {
            number,
            text: text.to_string(),
        }
    }

    fn image(page: usize, position: usize, seed: &[u8], caption: Option<(&str, &str)>) -> ImageOutput {
        let key = ImageKey::for_bytes(seed);
        ImageOutput {
            path: PathBuf::from(format!("images/{}", key.file_name())),
            caption: caption.map(|(t, d)| Caption {
                image_key: key.clone(),
                title: t.to_string(),
                description: d.to_string(),
                model: "m".into(),
            }),
            source: None,
            error: None,
            key,
            page,
            position,
        }
    }

    #[test]
    fn image_lands_between_neighbouring_pages() {
        let pages = vec![page(1, "P1 text"), page(2, "P2 text"), page(3, "P3 text")];
        let img = image(2, 0, b"fig", Some(("Chart", "A chart.")));
        let md = assemble(&pages, &[img.clone()], None, &PageSeparator::HorizontalRule);

        let p1 = md.find("P1 text").unwrap();
        let fig = md.find(&format!("![Chart](images/{}.png)", img.key)).unwrap();
        let p3 = md.find("P3 text").unwrap();
        assert!(p1 < fig && fig < p3, "{md}");
        assert!(md.contains("> A chart."));
    }

    #[test]
    fn intra_page_position_orders_images() {
        let pages = vec![page(1, "text")];
        let a = image(1, 0, b"a", Some(("A", "first")));
        let b = image(1, 1, b"b", Some(("B", "second")));
        // Completion order reversed; output must not care.
        let md = assemble(&pages, &[b, a], None, &PageSeparator::None);
        assert!(md.find("![A]").unwrap() < md.find("![B]").unwrap());
    }

    #[test]
    fn uncaptioned_image_degrades_to_bare_reference() {
        let mut failed = image(1, 0, b"x", None);
        failed.error = Some(CaptionError::EmptyResponse {
            key: failed.key.to_string(),
        });
        let md = assemble(&[page(1, "body")], &[failed.clone()], None, &PageSeparator::None);
        assert!(md.contains(&format!("![](images/{}.png)", failed.key)));
        assert!(!md.contains('>'));
    }

    #[test]
    fn output_is_deterministic() {
        let pages = vec![page(1, "one"), page(2, "two")];
        let imgs = vec![
            image(2, 1, b"c", Some(("C", "c"))),
            image(1, 0, b"a", None),
            image(2, 0, b"b", Some(("B", "line1\nline2"))),
        ];
        let meta = DocumentMetadata {
            title: Some("Paper".into()),
            page_count: 2,
            ..Default::default()
        };
        let first = assemble(&pages, &imgs, Some(&meta), &PageSeparator::Comment);
        let second = assemble(&pages, &imgs, Some(&meta), &PageSeparator::Comment);
        assert_eq!(first, second);
        assert!(first.starts_with("---\ntitle: \"Paper\"\n"));
        assert!(first.contains("<!-- page 2 -->"));
        assert!(first.contains("> line1\n> line2"));
        assert!(first.ends_with('\n') && !first.ends_with("\n\n"));
    }

    #[test]
    fn separators_only_between_pages() {
        let md = assemble(
            &[page(1, "a"), page(2, "b")],
            &[],
            None,
            &PageSeparator::HorizontalRule,
        );
        assert_eq!(md, "a\n\n---\n\nb\n");
    }

    #[test]
    fn alt_text_is_escaped() {
        let key = ImageKey::for_bytes(b"k");
        let caption = Caption {
            image_key: key.clone(),
            title: "See [1]\nand more".into(),
            description: String::new(),
            model: "m".into(),
        };
        assert_eq!(
            render_image(&key, Some(&caption)),
            format!("![See \\[1\\] and more](images/{}.png)", key)
        );
    }

    #[test]
    fn trailing_backslash_cannot_escape_the_bracket() {
        let key = ImageKey::for_bytes(b"k");
        let caption = Caption {
            image_key: key.clone(),
            title: "Path C:\\".into(),
            description: String::new(),
            model: "m".into(),
        };
        assert_eq!(
            render_image(&key, Some(&caption)),
            format!("![Path C:\\\\](images/{}.png)", key)
        );
    }

    #[test]
    fn orphan_images_are_kept() {
        let stray = image(9, 0, b"s", None);
        let md = assemble(&[page(1, "a")], &[stray.clone()], None, &PageSeparator::None);
        assert!(md.contains(&stray.key.file_name()));
    }

    #[test]
    fn front_matter_escapes_quotes() {
        let meta = DocumentMetadata {
            title: Some("A \"quoted\" title".into()),
            page_count: 1,
            pdf_version: "Pdf17".into(),
            ..Default::default()
        };
        let yaml = format_yaml_front_matter(&meta);
        assert!(yaml.contains("title: \"A \\\"quoted\\\" title\"\n"));
        assert!(yaml.contains("pages: 1\n"));
        assert!(yaml.ends_with("---\n\n"));
    }
}
