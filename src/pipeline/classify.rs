//! Page classification and formatting.
//!
//! Every cleaned page is assigned a [`PageType`] by the first matching
//! entry in an ordered classifier registry, then formatted into an XHTML
//! fragment by that type's formatter. Registry order is significance
//! order: a table of contents full of dot leaders must win over the
//! generic body rule, and the catch-all body entry sits last and matches
//! everything.
//!
//! Formatting failures are never fatal: a page whose specialised
//! formatter chokes degrades to plain body paragraphs, because a slightly
//! under-formatted page beats a lost one.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Structural role of a page within the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageType {
    Cover,
    Toc,
    Table,
    Footnote,
    Body,
}

/// A specialised formatter declined or failed to format its page.
#[derive(Debug, Clone, Error)]
#[error("formatting as {page_type:?} failed: {detail}")]
pub struct ClassificationError {
    pub page_type: PageType,
    pub detail: String,
}

/// A classified, formatted page.
#[derive(Debug, Clone)]
pub struct FormattedPage {
    pub page_type: PageType,
    pub xhtml: String,
}

struct ClassifierEntry {
    page_type: PageType,
    matches: fn(page_index: usize, text: &str) -> bool,
    format: fn(text: &str) -> Result<String, ClassificationError>,
}

/// First match wins; the body entry at the end matches everything.
static REGISTRY: Lazy<Vec<ClassifierEntry>> = Lazy::new(|| {
    vec![
        ClassifierEntry {
            page_type: PageType::Cover,
            matches: is_cover,
            format: format_cover,
        },
        ClassifierEntry {
            page_type: PageType::Toc,
            matches: is_toc,
            format: format_toc,
        },
        ClassifierEntry {
            page_type: PageType::Table,
            matches: is_table,
            format: format_table,
        },
        ClassifierEntry {
            page_type: PageType::Footnote,
            matches: is_footnote,
            format: format_footnote,
        },
        ClassifierEntry {
            page_type: PageType::Body,
            matches: |_, _| true,
            format: |text| Ok(format_body(text)),
        },
    ]
});

/// Classify a cleaned page and render its XHTML fragment.
pub fn classify_and_format(page_index: usize, text: &str) -> FormattedPage {
    for entry in REGISTRY.iter() {
        if !(entry.matches)(page_index, text) {
            continue;
        }
        match (entry.format)(text) {
            Ok(xhtml) => {
                return FormattedPage {
                    page_type: entry.page_type,
                    xhtml,
                }
            }
            Err(e) => {
                warn!("page {page_index}: {e}; falling back to body formatting");
                return FormattedPage {
                    page_type: PageType::Body,
                    xhtml: format_body(text),
                };
            }
        }
    }
    // Unreachable while the body catch-all is registered.
    FormattedPage {
        page_type: PageType::Body,
        xhtml: format_body(text),
    }
}

// ── Predicates ───────────────────────────────────────────────────────────

/// Dot leaders (`Chapter One ...... 12`) as produced by most TOC layouts.
static TOC_LEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)\.{3,}\s*\d+\s*$").unwrap());

/// A line that reads as tabular: multiple cells split by 2+ spaces, a tab,
/// or pipes.
static TABLE_ROW: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*\S[^\n]*(\t|\||[ ]{2,})\S").unwrap());

/// Footnote marker at line start: `1. `, `[2] `, `* `.
static FOOTNOTE_MARK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*(\[\d{1,3}\]|\d{1,3}\.|\*)\s+\S").unwrap());

fn is_cover(page_index: usize, text: &str) -> bool {
    // Only the very first page can be a cover: short, no sentence
    // punctuation at line ends, mostly title-like lines.
    if page_index != 0 {
        return false;
    }
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    !lines.is_empty() && lines.len() <= 8 && text.len() < 400
}

fn is_toc(_: usize, text: &str) -> bool {
    let leader_lines = TOC_LEADER.find_iter(text).count();
    leader_lines >= 3
}

fn is_table(_: usize, text: &str) -> bool {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.len() < 3 {
        return false;
    }
    let tabular = lines
        .iter()
        .filter(|l| TABLE_ROW.is_match(l))
        .count();
    tabular * 2 > lines.len()
}

fn is_footnote(_: usize, text: &str) -> bool {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return false;
    }
    let marked = lines.iter().filter(|l| FOOTNOTE_MARK.is_match(l)).count();
    marked * 2 > lines.len()
}

// ── Formatters ───────────────────────────────────────────────────────────

/// Minimal escaping for text nodes in XHTML output.
pub fn escape_xhtml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

fn format_cover(text: &str) -> Result<String, ClassificationError> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let title = lines.next().ok_or_else(|| ClassificationError {
        page_type: PageType::Cover,
        detail: "empty cover page".into(),
    })?;
    let mut out = format!("<h1>{}</h1>\n", escape_xhtml(title.trim()));
    for line in lines {
        out.push_str(&format!(
            "<p class=\"cover\">{}</p>\n",
            escape_xhtml(line.trim())
        ));
    }
    Ok(out)
}

fn format_toc(text: &str) -> Result<String, ClassificationError> {
    let mut out = String::from("<nav class=\"toc\">\n<ul>\n");
    let mut items = 0;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        // Drop the dot leader and trailing page number from each entry.
        let entry = TOC_LEADER.replace(line, "");
        let entry = entry.trim().trim_end_matches('.').trim();
        if entry.is_empty() {
            continue;
        }
        out.push_str(&format!("<li>{}</li>\n", escape_xhtml(entry)));
        items += 1;
    }
    if items == 0 {
        return Err(ClassificationError {
            page_type: PageType::Toc,
            detail: "no usable entries".into(),
        });
    }
    out.push_str("</ul>\n</nav>\n");
    Ok(out)
}

fn format_table(text: &str) -> Result<String, ClassificationError> {
    static CELL_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\t|\||[ ]{2,}").unwrap());

    let mut out = String::from("<table>\n");
    let mut rows = 0;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let cells: Vec<&str> = CELL_SPLIT
            .split(line)
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .collect();
        if cells.is_empty() {
            continue;
        }
        out.push_str("<tr>");
        for cell in cells {
            out.push_str(&format!("<td>{}</td>", escape_xhtml(cell)));
        }
        out.push_str("</tr>\n");
        rows += 1;
    }
    if rows == 0 {
        return Err(ClassificationError {
            page_type: PageType::Table,
            detail: "no usable rows".into(),
        });
    }
    out.push_str("</table>\n");
    Ok(out)
}

fn format_footnote(text: &str) -> Result<String, ClassificationError> {
    let mut out = String::from("<aside class=\"footnotes\">\n");
    let mut notes = 0;
    for block in text.split("\n\n") {
        let block = block.trim();
        if block.is_empty() {
            continue;
        }
        out.push_str(&format!(
            "<p class=\"footnote\">{}</p>\n",
            escape_xhtml(&block.replace('\n', " "))
        ));
        notes += 1;
    }
    if notes == 0 {
        return Err(ClassificationError {
            page_type: PageType::Footnote,
            detail: "no usable notes".into(),
        });
    }
    out.push_str("</aside>\n");
    Ok(out)
}

/// Paragraph-per-blank-line body formatting; the universal fallback.
pub fn format_body(text: &str) -> String {
    let mut out = String::new();
    for block in text.split("\n\n") {
        let block = block.trim();
        if block.is_empty() {
            continue;
        }
        out.push_str(&format!(
            "<p>{}</p>\n",
            escape_xhtml(&block.replace('\n', " "))
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_short_page_is_cover() {
        let page = classify_and_format(0, "THE BOOK\n\nA. Author");
        assert_eq!(page.page_type, PageType::Cover);
        assert!(page.xhtml.starts_with("<h1>THE BOOK</h1>"));
    }

    #[test]
    fn cover_rule_only_applies_to_page_zero() {
        let page = classify_and_format(5, "SHORT\n\nPAGE");
        assert_eq!(page.page_type, PageType::Body);
    }

    #[test]
    fn dot_leaders_classify_as_toc() {
        let text = "Contents\nChapter One ........ 1\nChapter Two ........ 15\nChapter Three ...... 30";
        let page = classify_and_format(1, text);
        assert_eq!(page.page_type, PageType::Toc);
        assert!(page.xhtml.contains("<li>Chapter One</li>"));
        assert!(!page.xhtml.contains("15"));
    }

    #[test]
    fn tabular_text_classifies_as_table() {
        let text = "Year  Revenue  Cost\n2023  100  80\n2024  120  90\n2025  150  95";
        let page = classify_and_format(3, text);
        assert_eq!(page.page_type, PageType::Table);
        assert!(page.xhtml.contains("<td>Revenue</td>"));
    }

    #[test]
    fn footnote_markers_classify_as_footnote() {
        let text = "[1] First source.\n\n[2] Second source.";
        let page = classify_and_format(9, text);
        assert_eq!(page.page_type, PageType::Footnote);
        assert!(page.xhtml.contains("class=\"footnotes\""));
    }

    #[test]
    fn prose_falls_through_to_body() {
        let text = "It was a dark and stormy night. The rain\nfell in torrents.\n\nA new paragraph began.";
        let page = classify_and_format(4, text);
        assert_eq!(page.page_type, PageType::Body);
        assert_eq!(page.xhtml.matches("<p>").count(), 2);
    }

    #[test]
    fn body_joins_wrapped_lines_within_paragraph() {
        let page = classify_and_format(4, "one\ntwo\n\nthree");
        assert!(page.xhtml.contains("<p>one two</p>"));
    }

    #[test]
    fn escapes_markup() {
        let page = classify_and_format(4, "a < b && c > d");
        assert!(page.xhtml.contains("a &lt; b &amp;&amp; c &gt; d"));
    }
}
