use once_cell::sync::Lazy;
use regex::Regex;

use crate::textutil::char_len;

static SENTENCE_END_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[.!?…]+\s+").expect("sentence end regex"));

/// Pieces of one over-long line, each at most `limit` chars.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LineSplit {
    pub pieces: Vec<String>,
    /// Number of tokens that had to be cut by raw character offsets.
    pub hard_splits: usize,
}

/// Break `line` into pieces of at most `limit` chars. Always returns at least one piece.
///
/// Preference order: sentence boundaries, then whitespace, then raw character offsets.
/// Pieces are packed greedily and re-joined with single spaces, so separators are not
/// necessarily preserved byte for byte. Output is fully determined by `(line, limit)`.
pub fn split_long_line(line: &str, limit: usize) -> LineSplit {
    if limit == 0 || char_len(line) <= limit {
        return LineSplit {
            pieces: vec![line.to_string()],
            hard_splits: 0,
        };
    }

    let mut out = LineSplit::default();
    let mut cur = String::new();
    for sentence in split_sentences(line) {
        if char_len(sentence) > limit {
            flush(&mut cur, &mut out.pieces);
            split_words_into(sentence, limit, &mut out);
            continue;
        }
        push_packed(&mut cur, sentence, limit, &mut out.pieces);
    }
    flush(&mut cur, &mut out.pieces);
    if out.pieces.is_empty() {
        // whitespace-only line: keep one empty piece so the line still has a unit
        out.pieces.push(String::new());
    }
    out
}

/// Sentences of `text`, each keeping its terminal punctuation, surrounding whitespace dropped.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0usize;
    for m in SENTENCE_END_RE.find_iter(text) {
        let punct_end = m.start() + m.as_str().trim_end().len();
        let s = text[start..punct_end].trim();
        if !s.is_empty() {
            out.push(s);
        }
        start = m.end();
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

fn split_words_into(text: &str, limit: usize, out: &mut LineSplit) {
    let mut cur = String::new();
    for token in text.split_whitespace() {
        let token_len = char_len(token);
        if token_len > limit {
            flush(&mut cur, &mut out.pieces);
            log::warn!(
                "hard-splitting a {token_len}-char token without word boundaries into pieces of <= {limit} chars"
            );
            out.pieces.extend(hard_split(token, limit));
            out.hard_splits += 1;
            continue;
        }
        push_packed(&mut cur, token, limit, &mut out.pieces);
    }
    flush(&mut cur, &mut out.pieces);
}

/// Cut `token` into `ceil(len/limit)` pieces by character offset.
pub fn hard_split(token: &str, limit: usize) -> Vec<String> {
    let chars: Vec<char> = token.chars().collect();
    chars
        .chunks(limit.max(1))
        .map(|c| c.iter().collect())
        .collect()
}

fn push_packed(cur: &mut String, item: &str, limit: usize, pieces: &mut Vec<String>) {
    if cur.is_empty() {
        cur.push_str(item);
    } else if char_len(cur) + 1 + char_len(item) <= limit {
        cur.push(' ');
        cur.push_str(item);
    } else {
        pieces.push(std::mem::take(cur));
        cur.push_str(item);
    }
}

fn flush(cur: &mut String, pieces: &mut Vec<String>) {
    if !cur.is_empty() {
        pieces.push(std::mem::take(cur));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_line_is_returned_as_is() {
        let s = split_long_line("hello world", 50);
        assert_eq!(s.pieces, vec!["hello world".to_string()]);
        assert_eq!(s.hard_splits, 0);
    }

    #[test]
    fn boundaryless_line_is_cut_into_equal_pieces() {
        let line = "x".repeat(1000);
        let s = split_long_line(&line, 100);
        assert_eq!(s.pieces.len(), 10);
        assert!(s.pieces.iter().all(|p| p.chars().count() == 100));
        assert_eq!(s.pieces.concat(), line);
        assert_eq!(s.hard_splits, 1);
    }

    #[test]
    fn sentences_are_packed_greedily() {
        let line = "One two. Three four! Five six? Seven eight.";
        let s = split_long_line(line, 20);
        assert_eq!(
            s.pieces,
            vec!["One two. Three four!", "Five six?", "Seven eight."]
        );
        assert_eq!(s.hard_splits, 0);
    }

    #[test]
    fn long_sentence_falls_back_to_words() {
        let line = "alpha beta gamma delta epsilon zeta. End.";
        let s = split_long_line(line, 12);
        assert_eq!(
            s.pieces,
            vec!["alpha beta", "gamma delta", "epsilon", "zeta.", "End."]
        );
    }

    #[test]
    fn ellipsis_ends_a_sentence() {
        assert_eq!(split_sentences("Wait… what? Yes"), vec!["Wait…", "what?", "Yes"]);
    }

    #[test]
    fn multibyte_text_respects_char_limit() {
        let line = "привет ".repeat(30);
        let s = split_long_line(line.trim(), 20);
        assert!(s.pieces.iter().all(|p| p.chars().count() <= 20));
        assert_eq!(s.pieces.join(" "), line.trim());
    }

    #[test]
    fn whitespace_only_line_keeps_one_empty_piece() {
        let s = split_long_line(&" ".repeat(40), 10);
        assert_eq!(s.pieces, vec![String::new()]);
        assert_eq!(s.hard_splits, 0);
    }

    #[test]
    fn output_is_deterministic() {
        let line = "Some text. ".repeat(40) + &"y".repeat(90);
        assert_eq!(split_long_line(&line, 33), split_long_line(&line, 33));
    }
}
