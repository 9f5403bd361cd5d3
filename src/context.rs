use std::str::FromStr;

use crate::error::PipelineError;
use crate::textutil::{char_len, char_suffix, strip_edit_comments};

pub const DEFAULT_SENTENCE_DELIMITERS: &str = ".!?…";

/// Which text of the previous fragment feeds the context window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ContextSource {
    #[default]
    Raw,
    Cleaned,
    None,
}

impl ContextSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextSource::Raw => "raw",
            ContextSource::Cleaned => "cleaned",
            ContextSource::None => "none",
        }
    }
}

impl FromStr for ContextSource {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raw" => Ok(ContextSource::Raw),
            "cleaned" => Ok(ContextSource::Cleaned),
            "none" | "off" => Ok(ContextSource::None),
            other => Err(PipelineError::config(
                "context.source",
                format!("expected raw, cleaned or none (got {other:?})"),
            )),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ContextOptions {
    pub source: ContextSource,
    pub max_chars: usize,
    pub sentence_delimiters: String,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            source: ContextSource::Raw,
            max_chars: 500,
            sentence_delimiters: DEFAULT_SENTENCE_DELIMITERS.to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContextWindow {
    pub text: String,
    /// Set when cleaned text was requested but was empty, so raw text was used.
    pub fell_back: bool,
}

/// Bounded continuity text taken from the end of the previous fragment.
pub fn build_context(prev_raw: &str, prev_cleaned: Option<&str>, opts: &ContextOptions) -> ContextWindow {
    if opts.max_chars == 0 {
        return ContextWindow::default();
    }
    let (source, fell_back) = match opts.source {
        ContextSource::None => return ContextWindow::default(),
        ContextSource::Raw => (prev_raw.to_string(), false),
        ContextSource::Cleaned => {
            let cleaned = prev_cleaned.map(strip_edit_comments).unwrap_or_default();
            if cleaned.trim().is_empty() {
                if !prev_raw.trim().is_empty() {
                    log::warn!("cleaned context is empty; falling back to the raw previous fragment");
                }
                (prev_raw.to_string(), true)
            } else {
                (cleaned, false)
            }
        }
    };
    ContextWindow {
        text: tail_fit(&source, opts.max_chars, &opts.sentence_delimiters),
        fell_back,
    }
}

/// Trailing whole lines of `text` within `max_chars`, topped up with a sentence or word
/// tail of the first line that did not fit.
pub fn tail_fit(text: &str, max_chars: usize, delimiters: &str) -> String {
    let mut picked: Vec<String> = Vec::new();
    let mut len = 0usize;

    for line in text.lines().rev() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let n = char_len(line);
        let sep = usize::from(!picked.is_empty());
        if len + sep + n <= max_chars {
            len += sep + n;
            picked.push(line.to_string());
            continue;
        }

        let room = max_chars.saturating_sub(len + sep);
        let partial = sentence_tail(line, room, delimiters).or_else(|| word_tail(line, room));
        match partial {
            Some(p) => picked.push(p),
            None if picked.is_empty() => picked.push(char_suffix(line, max_chars).to_string()),
            None => {}
        }
        break;
    }

    picked.reverse();
    picked.join("\n")
}

/// Sentences of `text`, split after a delimiter char that is followed by whitespace.
pub fn split_sentences_with<'a>(text: &'a str, delimiters: &str) -> Vec<&'a str> {
    let mut out = Vec::new();
    let mut start = 0usize;
    let mut chars = text.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if !delimiters.contains(c) {
            continue;
        }
        if let Some(&(j, next)) = chars.peek() {
            if next.is_whitespace() {
                let s = text[start..j].trim();
                if !s.is_empty() {
                    out.push(s);
                }
                start = j;
            }
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

fn sentence_tail(line: &str, room: usize, delimiters: &str) -> Option<String> {
    if room == 0 || delimiters.is_empty() {
        return None;
    }
    let sentences = split_sentences_with(line, delimiters);
    if sentences.len() < 2 {
        return None;
    }
    pack_tail(&sentences, room)
}

fn word_tail(line: &str, room: usize) -> Option<String> {
    if room == 0 {
        return None;
    }
    let words: Vec<&str> = line.split_whitespace().collect();
    pack_tail(&words, room)
}

fn pack_tail(items: &[&str], room: usize) -> Option<String> {
    let mut taken: Vec<&str> = Vec::new();
    let mut len = 0usize;
    for &item in items.iter().rev() {
        let n = char_len(item);
        let sep = usize::from(!taken.is_empty());
        if len + sep + n > room {
            break;
        }
        len += sep + n;
        taken.push(item);
    }
    if taken.is_empty() {
        return None;
    }
    taken.reverse();
    Some(taken.join(" "))
}
