//! Input parsing: timestamped plain text and SRT subtitles into [`Line`]s.

use std::path::Path;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::chunker::Line;
use crate::error::PipelineError;

static TXT_STAMP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*\[(\d{1,2}):(\d{2}):(\d{2})(?:[.,](\d{1,3}))?\]\s*(.*)$")
        .expect("txt stamp regex")
});
static SRT_TIME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{1,2}):(\d{2}):(\d{2})[,.](\d{1,3})\s*-->\s*(\d{1,2}):(\d{2}):(\d{2})[,.](\d{1,3})")
        .expect("srt time regex")
});
static WS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputFormat {
    Txt,
    Srt,
}

impl InputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputFormat::Txt => "txt",
            InputFormat::Srt => "srt",
        }
    }

    pub fn from_path(path: &Path) -> Self {
        let is_srt = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("srt"));
        if is_srt {
            InputFormat::Srt
        } else {
            InputFormat::Txt
        }
    }
}

impl FromStr for InputFormat {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "txt" => Ok(InputFormat::Txt),
            "srt" => Ok(InputFormat::Srt),
            other => Err(PipelineError::config(
                "pipeline.format",
                format!("expected txt or srt (got {other:?})"),
            )),
        }
    }
}

fn hms_to_seconds(h: &str, m: &str, s: &str, frac: Option<&str>) -> Option<f64> {
    let h: f64 = h.parse().ok()?;
    let m: f64 = m.parse().ok()?;
    let s: f64 = s.parse().ok()?;
    let frac = match frac {
        Some(f) if !f.is_empty() => {
            let digits: f64 = f.parse().ok()?;
            digits / 10f64.powi(f.len() as i32)
        }
        _ => 0.0,
    };
    Some(h * 3600.0 + m * 60.0 + s + frac)
}

/// One line per input line; a leading `[HH:MM:SS]` stamp becomes the line time.
pub fn parse_timestamped_txt_lines(text: &str) -> Vec<Line> {
    text.trim_start_matches('\u{feff}')
        .lines()
        .enumerate()
        .map(|(i, raw)| match TXT_STAMP_RE.captures(raw) {
            Some(c) => {
                let time = hms_to_seconds(&c[1], &c[2], &c[3], c.get(4).map(|m| m.as_str()));
                Line::new(i, c[5].trim_end(), time)
            }
            None => Line::new(i, raw.trim_end(), None),
        })
        .collect()
}

#[derive(Clone, Debug, PartialEq)]
pub struct SrtEntry {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

fn is_index_line(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

/// Parse caption blocks. The index line is optional and stray blank lines inside a block
/// are tolerated.
pub fn parse_srt_entries(content: &str) -> Vec<SrtEntry> {
    let lines: Vec<&str> = content.trim_start_matches('\u{feff}').lines().collect();
    let mut entries = Vec::new();
    let mut i = 0usize;

    while i < lines.len() {
        let stripped = lines[i].trim();
        if stripped.is_empty() {
            i += 1;
            continue;
        }

        let time_line = if SRT_TIME_RE.is_match(lines[i]) {
            i += 1;
            lines[i - 1]
        } else if is_index_line(stripped) && i + 1 < lines.len() && SRT_TIME_RE.is_match(lines[i + 1]) {
            i += 2;
            lines[i - 1]
        } else {
            i += 1;
            continue;
        };
        let Some(caps) = SRT_TIME_RE.captures(time_line) else {
            continue;
        };
        let (Some(start), Some(end)) = (
            hms_to_seconds(&caps[1], &caps[2], &caps[3], Some(&caps[4])),
            hms_to_seconds(&caps[5], &caps[6], &caps[7], Some(&caps[8])),
        ) else {
            continue;
        };

        let mut text_lines: Vec<&str> = Vec::new();
        let trailing = time_line[caps.get(0).map_or(0, |m| m.end())..].trim();
        if !trailing.is_empty() {
            text_lines.push(trailing);
        }

        while i < lines.len() {
            let next = lines[i].trim();
            if next.is_empty() {
                let mut j = i + 1;
                while j < lines.len() && lines[j].trim().is_empty() {
                    j += 1;
                }
                i = j;
                if j >= lines.len() || SRT_TIME_RE.is_match(lines[j]) || is_index_line(lines[j].trim()) {
                    break;
                }
                continue;
            }
            if SRT_TIME_RE.is_match(next) {
                break;
            }
            text_lines.push(next);
            i += 1;
        }

        let text = WS_RE.replace_all(&text_lines.join(" "), " ").trim().to_string();
        entries.push(SrtEntry { start, end, text });
    }
    entries
}

/// Longest suffix of `previous` that is a prefix of `current`, in bytes of `current`.
fn longest_overlap(previous: &str, current: &str) -> usize {
    let mut bounds: Vec<usize> = current
        .char_indices()
        .map(|(i, _)| i)
        .skip(1)
        .chain(std::iter::once(current.len()))
        .collect();
    bounds.retain(|&b| b <= previous.len());
    bounds
        .into_iter()
        .rev()
        .find(|&b| previous.ends_with(&current[..b]))
        .unwrap_or(0)
}

/// Remove rolling-caption repetition: exact repeats, prefix growth and suffix/prefix overlap.
pub fn dedupe_entries(entries: Vec<SrtEntry>) -> Vec<SrtEntry> {
    let mut out = Vec::new();
    let mut prev = String::new();

    for entry in entries {
        if entry.text.is_empty() {
            continue;
        }
        let full = entry.text.clone();
        let cleaned = if prev.is_empty() {
            full.clone()
        } else if full == prev || prev.starts_with(&full) {
            prev = full;
            continue;
        } else if let Some(rest) = full.strip_prefix(prev.as_str()) {
            rest.trim_start().to_string()
        } else {
            let overlap = longest_overlap(&prev, &full);
            full[overlap..].trim_start().to_string()
        };
        prev = full;
        if cleaned.is_empty() {
            continue;
        }
        out.push(SrtEntry {
            text: cleaned,
            ..entry
        });
    }
    out
}

pub fn srt_to_lines(content: &str) -> Vec<Line> {
    dedupe_entries(parse_srt_entries(content))
        .into_iter()
        .enumerate()
        .map(|(i, e)| Line::new(i, e.text, Some(e.start)))
        .collect()
}

pub fn parse_transcript(content: &str, format: InputFormat) -> Vec<Line> {
    match format {
        InputFormat::Txt => parse_timestamped_txt_lines(content),
        InputFormat::Srt => srt_to_lines(content),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn txt_stamps_become_times() {
        let lines = parse_timestamped_txt_lines("[00:01:02] Hello there\nno stamp\n[1:00:00.5] Later");
        assert_eq!(lines[0].text, "Hello there");
        assert_eq!(lines[0].time, Some(62.0));
        assert_eq!(lines[1].time, None);
        assert_eq!(lines[1].text, "no stamp");
        assert_eq!(lines[2].time, Some(3600.5));
    }

    #[test]
    fn srt_blocks_with_and_without_index() {
        let srt = "1\n00:00:01,000 --> 00:00:02,500\nHello\nworld\n\n00:00:03,000 --> 00:00:04,000\nSecond\n\n\n3\n00:00:05,000 --> 00:00:06,000\nThird";
        let entries = parse_srt_entries(srt);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].text, "Hello world");
        assert_eq!(entries[0].start, 1.0);
        assert_eq!(entries[0].end, 2.5);
        assert_eq!(entries[1].text, "Second");
        assert_eq!(entries[2].text, "Third");
    }

    #[test]
    fn stray_blank_line_inside_block_is_tolerated() {
        let srt = "1\n00:00:01,000 --> 00:00:02,000\nfirst part\n\nsecond part\n\n2\n00:00:03,000 --> 00:00:04,000\nnext";
        let entries = parse_srt_entries(srt);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].text, "first part second part");
    }

    #[test]
    fn rolling_captions_are_deduplicated() {
        let e = |start: f64, text: &str| SrtEntry {
            start,
            end: start + 1.0,
            text: text.to_string(),
        };
        let out = dedupe_entries(vec![
            e(1.0, "so today we"),
            e(2.0, "so today we"),
            e(3.0, "so today we talk about"),
            e(4.0, "talk about rust"),
            e(5.0, "talk"),
            e(6.0, "something new"),
        ]);
        let texts: Vec<&str> = out.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["so today we", "talk about", "rust", "something new"]);
        assert_eq!(out[1].start, 3.0);
    }

    #[test]
    fn srt_lines_carry_start_times() {
        let srt = "1\n00:00:10,000 --> 00:00:12,000\nalpha\n\n2\n00:00:12,000 --> 00:00:14,000\nbeta";
        let lines = srt_to_lines(srt);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].index, 1);
        assert_eq!(lines[1].time, Some(12.0));
    }

    #[test]
    fn format_from_extension_and_name() {
        assert_eq!(InputFormat::from_path(Path::new("a/b.SRT")), InputFormat::Srt);
        assert_eq!(InputFormat::from_path(Path::new("a/b.txt")), InputFormat::Txt);
        assert_eq!("srt".parse::<InputFormat>().unwrap(), InputFormat::Srt);
        assert!("docx".parse::<InputFormat>().is_err());
    }

    #[test]
    fn overlap_is_char_safe() {
        assert_eq!(longest_overlap("привет мир", "мир да"), "мир".len());
        assert_eq!(longest_overlap("abc", "xyz"), 0);
    }
}
