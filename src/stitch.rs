use once_cell::sync::Lazy;
use regex::Regex;

use crate::textutil::char_len;

static TRAILING_TIMECODE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\s*[—–-]?\s*\[\d{2}:\d{2}:\d{2}\](?:\(#t=[0-9:]+\))?\s*$")
        .expect("trailing timecode regex")
});
static WS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DedupMode {
    None,
    Lines,
}

impl DedupMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DedupMode::None => "none",
            DedupMode::Lines => "lines",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DedupOutcome {
    pub text: String,
    pub removed: usize,
    pub mode: DedupMode,
}

/// Drop the leading line run of `cur` that repeats the trailing line run of `prev`.
///
/// Both windows are bounded by `window_chars` (at least one line each). Matching is done on
/// normalized lines; whatever is removed is removed from the original text, whole lines only.
pub fn dedup_overlapping_boundary(prev: &str, cur: &str, window_chars: usize) -> DedupOutcome {
    let unchanged = || DedupOutcome {
        text: cur.to_string(),
        removed: 0,
        mode: DedupMode::None,
    };
    if window_chars == 0 || prev.trim().is_empty() || cur.trim().is_empty() {
        return unchanged();
    }

    let prev_lines: Vec<&str> = prev.trim_end().lines().collect();
    let cur_lines: Vec<&str> = cur.lines().skip_while(|l| l.trim().is_empty()).collect();

    let prev_take = window_len(prev_lines.iter().rev().copied(), window_chars);
    let cur_take = window_len(cur_lines.iter().copied(), window_chars);
    let prev_win: Vec<String> = prev_lines[prev_lines.len() - prev_take..]
        .iter()
        .map(|l| normalize_line(l))
        .collect();
    let cur_win: Vec<String> = cur_lines[..cur_take].iter().map(|l| normalize_line(l)).collect();

    let max_k = prev_win.len().min(cur_win.len());
    let found = (1..=max_k).rev().find(|&k| {
        let tail = &prev_win[prev_win.len() - k..];
        let head = &cur_win[..k];
        tail == head && head.iter().any(|l| !l.is_empty())
    });

    let Some(k) = found else {
        return unchanged();
    };
    let rest: Vec<&str> = cur_lines[k..]
        .iter()
        .copied()
        .skip_while(|l| l.trim().is_empty())
        .collect();
    log::debug!("boundary dedup removed {k} leading lines");
    DedupOutcome {
        text: rest.join("\n"),
        removed: k,
        mode: DedupMode::Lines,
    }
}

fn window_len<'a>(lines: impl Iterator<Item = &'a str>, window_chars: usize) -> usize {
    let mut take = 0usize;
    let mut len = 0usize;
    for line in lines {
        let n = char_len(line) + usize::from(take > 0);
        if take > 0 && len + n > window_chars {
            break;
        }
        len += n;
        take += 1;
    }
    take
}

/// Comparison form of a line: unified quotes and dashes, no trailing heading timecode,
/// collapsed whitespace.
pub fn normalize_line(line: &str) -> String {
    let without_stamp = TRAILING_TIMECODE_RE.replace(line, "");
    let unified: String = without_stamp
        .chars()
        .map(|c| match c {
            '“' | '”' | '„' | '«' | '»' | '″' => '"',
            '‘' | '’' | '‚' | '′' | '`' => '\'',
            '–' | '—' | '−' | '‐' | '‑' => '-',
            other => other,
        })
        .collect();
    WS_RE.replace_all(unified.trim(), " ").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_repeated_line_run() {
        let out = dedup_overlapping_boundary("A\nB\nC", "B\nC\nD", 100);
        assert_eq!(out.text, "D");
        assert_eq!(out.removed, 2);
        assert_eq!(out.mode, DedupMode::Lines);
        assert_eq!(out.mode.as_str(), "lines");
    }

    #[test]
    fn no_overlap_is_unchanged() {
        let out = dedup_overlapping_boundary("A\nB", "C\nD", 100);
        assert_eq!(out.text, "C\nD");
        assert_eq!(out.removed, 0);
        assert_eq!(out.mode.as_str(), "none");
    }

    #[test]
    fn normalization_ignores_quotes_dashes_and_timecodes() {
        let prev = "## Topic — [00:01:00](#t=00:01:00)\nHe said “yes” – twice.";
        let cur = "## Topic — [00:02:00](#t=00:02:00)\nHe said \"yes\" - twice.\nNew line.";
        let out = dedup_overlapping_boundary(prev, cur, 200);
        assert_eq!(out.removed, 2);
        assert_eq!(out.text, "New line.");
    }

    #[test]
    fn partial_lines_are_never_trimmed() {
        let out = dedup_overlapping_boundary("The end of a sentence.", "of a sentence. More.", 100);
        assert_eq!(out.mode, DedupMode::None);
        assert_eq!(out.text, "of a sentence. More.");
    }

    #[test]
    fn window_limits_the_match() {
        let prev = "one\ntwo\nthree";
        let cur = "one\ntwo\nthree\nfour";
        // Only "three" fits the previous window, and "one" starts the current one.
        let out = dedup_overlapping_boundary(prev, cur, 5);
        assert_eq!(out.mode, DedupMode::None);
        let out = dedup_overlapping_boundary(prev, cur, 100);
        assert_eq!(out.removed, 3);
        assert_eq!(out.text, "four");
    }

    #[test]
    fn blank_lines_do_not_count_as_a_match() {
        let out = dedup_overlapping_boundary("A\n\n", "\n\nB", 100);
        assert_eq!(out.mode, DedupMode::None);
        assert_eq!(out.text, "\n\nB");
    }

    #[test]
    fn leading_blank_lines_after_removal_are_dropped() {
        let out = dedup_overlapping_boundary("x\nsame", "\nsame\n\nnext", 100);
        assert_eq!(out.removed, 1);
        assert_eq!(out.text, "next");
    }

    #[test]
    fn zero_window_disables() {
        let out = dedup_overlapping_boundary("A", "A", 0);
        assert_eq!(out.mode, DedupMode::None);
    }
}
