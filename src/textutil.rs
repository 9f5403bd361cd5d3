use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

static EDIT_COMMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").expect("edit comment regex"));
static BLANK_RUN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n[ \t]*(?:\n[ \t]*){2,}").expect("blank run regex"));
static HEADING_STAMP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[\d{2}:\d{2}:\d{2}\](?:\(#t=\d{2}:\d{2}:\d{2}\))?\s*$").expect("stamp regex")
});

/// Length in chars; every size budget in the pipeline is measured this way.
#[inline]
pub fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Last `n` chars of `s`.
pub fn char_suffix(s: &str, n: usize) -> &str {
    let total = char_len(s);
    if n >= total {
        return s;
    }
    let skip = total - n;
    match s.char_indices().nth(skip) {
        Some((i, _)) => &s[i..],
        None => "",
    }
}

/// Remove `<!-- ... -->` comments and collapse the blank runs they leave behind.
pub fn strip_edit_comments(text: &str) -> String {
    if !text.contains("<!--") {
        return text.to_string();
    }
    let stripped = EDIT_COMMENT_RE.replace_all(text, "");
    let trimmed_lines = stripped
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");
    BLANK_RUN_RE
        .replace_all(&trimmed_lines, "\n\n")
        .trim()
        .to_string()
}

/// `3723.4` -> `"01:02:03"`.
pub fn format_hms(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{h:02}:{m:02}:{s:02}")
}

/// Append ` — [HH:MM:SS]` (or the `(#t=...)` link form) to every `#`/`##` heading.
pub fn add_timecodes_to_headings(markdown: &str, start_seconds: f64, as_link: bool) -> String {
    let stamp = format_hms(start_seconds);
    let marker = if as_link {
        format!("[{stamp}](#t={stamp})")
    } else {
        format!("[{stamp}]")
    };
    markdown
        .lines()
        .map(|line| {
            let is_heading = line.starts_with("# ") || line.starts_with("## ");
            if is_heading && !HEADING_STAMP_RE.is_match(line) {
                format!("{} — {marker}", line.trim_end())
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Whitespace-token Jaccard similarity in `0..=1`.
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    let ta: HashSet<&str> = a.split_whitespace().collect();
    let tb: HashSet<&str> = b.split_whitespace().collect();
    if ta.is_empty() && tb.is_empty() {
        return 1.0;
    }
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let inter = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    inter as f64 / union as f64
}
