//! Markup-to-plain-text normalization for harvested documents.
//!
//! Documents are stored as text only, so structure that matters for search
//! has to survive flattening:
//!
//! 1. [`unwrap_cdata`] turns `<![CDATA[...]]>` sections (code and noformat
//!    macro bodies in wiki storage format) into escaped text, since an HTML
//!    parser discards them as bogus comments.
//! 2. [`mark_heading_boundaries`] inserts `": "` before every closing
//!    `</h2>`–`</h7>` tag, so a subtitle stays visibly separated from the
//!    paragraph that follows it.
//! 3. [`html_to_text`] joins the text nodes with newlines.
//! 4. [`collapse_space_before_period`] removes the whitespace that step 3
//!    leaves between a link and a period that immediately follows it.

use std::borrow::Cow;
use std::sync::OnceLock;

use regex::Regex;
use scraper::Html;

fn cdata_section() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<!\[CDATA\[(.*?)\]\]>").expect("valid cdata regex"))
}

fn heading_close() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(</h[2-7]\s*>)").expect("valid heading regex"))
}

fn space_before_period() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+\.").expect("valid whitespace regex"))
}

/// Replace each CDATA section with its content, escaped so the parser
/// keeps it as a text node.
pub fn unwrap_cdata(html: &str) -> Cow<'_, str> {
    cdata_section().replace_all(html, |caps: &regex::Captures<'_>| escape_text(&caps[1]))
}

fn escape_text(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Insert `": "` before closing `h2`..`h7` tags. The tags themselves are
/// left as written.
pub fn mark_heading_boundaries(html: &str) -> Cow<'_, str> {
    heading_close().replace_all(html, ": ${1}")
}

pub fn collapse_space_before_period(text: &str) -> Cow<'_, str> {
    space_before_period().replace_all(text, ".")
}

/// Flatten markup to its text nodes, one per line. Whitespace-only nodes
/// are dropped.
pub fn html_to_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    fragment
        .root_element()
        .text()
        .filter(|t| !t.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Clean up text that is already plain.
pub fn clean_text(text: &str) -> String {
    collapse_space_before_period(text).trim_end().to_string()
}

/// Full pipeline for markup bodies (wiki storage format, HTML files).
pub fn normalize_markup(html: &str) -> String {
    let unwrapped = unwrap_cdata(html);
    let marked = mark_heading_boundaries(&unwrapped);
    let text = html_to_text(&marked);
    clean_text(&text).trim_start().to_string()
}
