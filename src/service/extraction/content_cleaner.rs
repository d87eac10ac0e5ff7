//! Content cleaning for extraction and embedding.
//!
//! Two layers:
//! - Layer 1 strips universal structural junk (tracking pixels, bare nav
//!   links, skip-to-content anchors). Safe for extraction input.
//! - Layer 2 finds where real content starts by link density and cuts the
//!   navigation header off. Only for the classification/embedding path;
//!   extraction keeps the full page so header context survives.

use regex::Regex;
use std::sync::LazyLock;

static UNIVERSAL_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        // Empty-alt images: logos, tracking pixels, spacers
        Regex::new(r"(?i)!\[\]\(https?://[^)]+\)\s*").unwrap(),
        // Skip-to-content accessibility links
        Regex::new(r"(?im)^\[Skip to [^\]]*\]\([^)]*\)\s*\n?").unwrap(),
        // Bare link list items: "* [Link](url)" with nothing after.
        // "* [Link](url) - Description" survives.
        Regex::new(r"(?m)^(?:[*\-]\s+)\[[^\]]{1,80}\]\([^)]*(?:\([^)]*\)[^)]*)*\)\s*$").unwrap(),
        // Bare image lines alone on a line
        Regex::new(r"(?m)^!\[[^\]]*\]\([^)]+\)\s*$").unwrap(),
    ]
});

static EXCESS_NEWLINES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());
static MARKDOWN_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\]]*\]\([^)]*\)").unwrap());
static BARE_URL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"https?://\S+").unwrap());

/// Layer 1: remove universal structural patterns and collapse runs of 3+
/// newlines. Output is still safe as extraction input.
pub fn strip_structural_junk(content: &str) -> String {
    if content.is_empty() {
        return String::new();
    }

    let mut cleaned = content.to_string();
    for pattern in UNIVERSAL_PATTERNS.iter() {
        cleaned = pattern.replace_all(&cleaned, "").into_owned();
    }
    cleaned = EXCESS_NEWLINES.replace_all(&cleaned, "\n\n").into_owned();
    cleaned.trim().to_string()
}

/// Ratio of markdown-link characters to total characters on one line.
pub fn line_link_density(line: &str) -> f64 {
    if line.is_empty() {
        return 0.0;
    }
    let total = line.len() as f64;
    let mut link_chars = 0usize;
    let mut covered: Vec<(usize, usize)> = Vec::new();

    for m in MARKDOWN_LINK.find_iter(line) {
        link_chars += m.len();
        covered.push((m.start(), m.end()));
    }
    for m in BARE_URL.find_iter(line) {
        // URLs inside a markdown link are already counted.
        if covered.iter().any(|&(s, e)| m.start() >= s && m.start() < e) {
            continue;
        }
        link_chars += m.len();
    }

    link_chars as f64 / total
}

/// Layer 2: byte offset where real content starts.
///
/// Scans from the top, skipping short lines; a run of 3 consecutive
/// link-sparse lines marks the start. Returns 0 when content starts
/// immediately or no clear region is found.
pub fn find_content_by_line_density(content: &str) -> usize {
    const MIN_CONTENT_LINES: usize = 3;
    const DENSITY_THRESHOLD: f64 = 0.4;
    const MIN_LINE_LENGTH: usize = 20;
    const MAX_SCAN_LINES: usize = 200;

    if content.is_empty() {
        return 0;
    }

    let lines: Vec<&str> = content.split('\n').collect();
    let mut consecutive = 0;
    let mut content_start_line = 0;

    for (i, line) in lines.iter().take(MAX_SCAN_LINES).enumerate() {
        let stripped = line.trim();
        if stripped.is_empty() || stripped.len() < MIN_LINE_LENGTH {
            continue;
        }

        if line_link_density(stripped) < DENSITY_THRESHOLD {
            if consecutive == 0 {
                content_start_line = i;
            }
            consecutive += 1;
            if consecutive >= MIN_CONTENT_LINES {
                return lines[..content_start_line]
                    .iter()
                    .map(|l| l.len() + 1)
                    .sum();
            }
        } else {
            consecutive = 0;
        }
    }

    0
}

/// Full clean (Layer 1 + 2). For classification and embedding input only;
/// never feed this to extraction, the density cut can drop header context.
pub fn clean_for_embedding(content: &str) -> String {
    if content.is_empty() {
        return String::new();
    }

    let cleaned = strip_structural_junk(content);
    let offset = find_content_by_line_density(&cleaned);
    if offset > 0 && offset < cleaned.len() {
        cleaned[offset..].trim().to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_empty_alt_images() {
        let input = "Before ![](https://cdn.example.com/pixel.gif) after";
        assert_eq!(strip_structural_junk(input), "Before after");
    }

    #[test]
    fn strips_skip_to_content_links() {
        let input = "[Skip to main content](#main)\nReal text starts here.";
        assert_eq!(strip_structural_junk(input), "Real text starts here.");
    }

    #[test]
    fn strips_bare_link_list_items() {
        let input = "* [Home](https://example.com/)\n* [About](https://example.com/about)\nParagraph stays.";
        let cleaned = strip_structural_junk(input);
        assert!(!cleaned.contains("Home"));
        assert!(cleaned.contains("Paragraph stays."));
    }

    #[test]
    fn keeps_link_items_with_descriptions() {
        let input = "* [Gearbox X200](https://example.com/x200) — planetary, 200 kW";
        let cleaned = strip_structural_junk(input);
        assert!(cleaned.contains("Gearbox X200"));
        assert!(cleaned.contains("planetary, 200 kW"));
    }

    #[test]
    fn strips_lone_image_lines() {
        let input = "Text above\n\n![hero banner](https://example.com/hero.jpg)\n\nText below";
        let cleaned = strip_structural_junk(input);
        assert!(!cleaned.contains("hero.jpg"));
        assert!(cleaned.contains("Text above"));
        assert!(cleaned.contains("Text below"));
    }

    #[test]
    fn collapses_excess_newlines() {
        let input = "one\n\n\n\n\ntwo";
        assert_eq!(strip_structural_junk(input), "one\n\ntwo");
    }

    #[test]
    fn unique_content_survives_byte_identically() {
        let input = "## Products\n\nThe X200 gearbox delivers 200 kW of continuous power.\n\nContact sales for pricing.";
        assert_eq!(strip_structural_junk(input), input);
    }

    #[test]
    fn link_density_on_pure_link_line_is_high() {
        let line = "[Home](https://a.com) [About](https://a.com/about)";
        assert!(line_link_density(line) > 0.9);
    }

    #[test]
    fn link_density_on_prose_is_low() {
        let line = "The X200 planetary gearbox delivers 200 kW continuously.";
        assert_eq!(line_link_density(line), 0.0);
    }

    #[test]
    fn density_windowing_cuts_nav_header() {
        let nav: String = (0..6)
            .map(|i| format!("[Menu item number {i}](https://example.com/item{i}) [Other link here](https://example.com/o{i})"))
            .collect::<Vec<_>>()
            .join("\n");
        let body = "This paragraph is real content about gearboxes and motors.\nIt continues with specifications and materials in detail.\nA third content line keeps the run going for the scanner.";
        let page = format!("{}\n{}", nav, body);

        let offset = find_content_by_line_density(&page);
        assert!(offset > 0);
        let cleaned = clean_for_embedding(&page);
        assert!(cleaned.starts_with("This paragraph is real content"));
    }

    #[test]
    fn content_starting_immediately_returns_zero_offset() {
        let page = "Real content line one is sufficiently long for scanning.\nSecond real line of prose with no links to speak of.\nThird line closes out the content run cleanly.";
        assert_eq!(find_content_by_line_density(page), 0);
        assert_eq!(clean_for_embedding(page), page);
    }

    #[test]
    fn empty_input_stays_empty() {
        assert_eq!(strip_structural_junk(""), "");
        assert_eq!(clean_for_embedding(""), "");
        assert_eq!(find_content_by_line_density(""), 0);
    }
}
