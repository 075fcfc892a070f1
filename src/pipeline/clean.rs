//! Deterministic text cleanup applied between recognition and formatting.
//!
//! Recognition output (and embedded text layers even more so) carries
//! scanning artifacts: stray control characters, page-number-only lines,
//! runs of blank lines, trailing whitespace. The rules here are pure
//! string transforms with no configuration, so a page's cleaned text is a
//! function of its raw text alone and cache entries stay valid across
//! runs.

use once_cell::sync::Lazy;
use regex::Regex;

/// Control characters other than `\n` and `\t`. Carriage returns are
/// normalised away before this runs.
static CONTROL_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\x00-\x08\x0B\x0C\x0E-\x1F\x7F]").unwrap());

/// Three or more consecutive newlines collapse to a paragraph break.
static EXCESS_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

/// A line holding nothing but a page number, possibly dash-decorated
/// (`12`, `- 12 -`, `— 12 —`).
static PAGE_NUMBER_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^[ \t]*[-–—]?[ \t]*\d{1,4}[ \t]*[-–—]?[ \t]*$").unwrap());

static TRAILING_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)[ \t]+$").unwrap());

/// Normalise one page's raw text.
pub fn clean_page_text(raw: &str) -> String {
    let text = raw.replace("\r\n", "\n").replace('\r', "\n");
    let text = CONTROL_CHARS.replace_all(&text, "");
    let text = PAGE_NUMBER_LINE.replace_all(&text, "");
    let text = TRAILING_SPACE.replace_all(&text, "");
    let text = EXCESS_BLANK_LINES.replace_all(&text, "\n\n");
    text.trim().to_string()
}
