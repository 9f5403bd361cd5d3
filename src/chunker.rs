use std::collections::VecDeque;

use crate::error::PipelineError;
use crate::split::{hard_split, split_long_line};
use crate::textutil::char_len;

/// One input line with its 0-based position and optional timestamp in seconds.
#[derive(Clone, Debug, PartialEq)]
pub struct Line {
    pub index: usize,
    pub text: String,
    pub time: Option<f64>,
}

impl Line {
    pub fn new(index: usize, text: impl Into<String>, time: Option<f64>) -> Self {
        Self {
            index,
            text: text.into(),
            time,
        }
    }
}

/// A whole line (`split == false`) or one piece of a line broken to fit the budget.
#[derive(Clone, Debug, PartialEq)]
pub struct Unit {
    pub text: String,
    /// Original index of the source line.
    pub line: usize,
    pub split: bool,
    pub time: Option<f64>,
}

impl Unit {
    fn whole(line: &Line) -> Self {
        Self {
            text: line.text.clone(),
            line: line.index,
            split: false,
            time: line.time,
        }
    }

    fn piece(text: String, line: usize, time: Option<f64>) -> Self {
        Self {
            text,
            line,
            split: true,
            time,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Chunk {
    pub units: Vec<Unit>,
    /// Leading units carried over from the previous chunk's tail.
    pub overlap_units: usize,
    pub start: Option<f64>,
    pub end: Option<f64>,
}

impl Chunk {
    pub fn overlap(&self) -> &[Unit] {
        &self.units[..self.overlap_units]
    }

    /// Newly introduced units; this is what gets rewritten.
    pub fn fragment_units(&self) -> &[Unit] {
        &self.units[self.overlap_units..]
    }

    pub fn fragment_text(&self) -> String {
        join_units(self.fragment_units())
    }

    pub fn text(&self) -> String {
        join_units(&self.units)
    }

    pub fn char_len(&self) -> usize {
        joined_len(&self.units)
    }
}

fn join_units(units: &[Unit]) -> String {
    units
        .iter()
        .map(|u| u.text.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

fn joined_len(units: &[Unit]) -> usize {
    let chars: usize = units.iter().map(|u| char_len(&u.text)).sum();
    chars + units.len().saturating_sub(1)
}

/// Length after appending an item of `item_len` chars to a chunk currently `len` chars long
/// holding `count` units.
fn grown_len(len: usize, count: usize, item_len: usize) -> usize {
    if count == 0 {
        item_len
    } else {
        len + 1 + item_len
    }
}

/// Pack `lines` into chunks of at most `chunk_chars` chars, each carrying up to
/// `overlap_chars` of the previous chunk's tail as leading overlap units.
pub fn chunk_text_line_preserving(
    lines: &[Line],
    chunk_chars: usize,
    overlap_chars: usize,
) -> Result<Vec<Chunk>, PipelineError> {
    if chunk_chars == 0 {
        return Err(PipelineError::config(
            "chunking.chunk_chars",
            "must be positive (got 0)",
        ));
    }
    let overlap = overlap_chars.min(chunk_chars - 1);
    // Pieces of an over-long line leave room for a carried tail next to them when the
    // budget allows it.
    let split_limit = if chunk_chars > 2 * overlap + 1 {
        chunk_chars - overlap - 1
    } else {
        chunk_chars
    };

    let mut packer = Packer {
        lines,
        chunk_chars,
        split_limit,
        cursor: 0,
        pending: VecDeque::new(),
    };
    let mut chunks: Vec<Chunk> = Vec::new();

    while packer.has_input() {
        let carried = chunks
            .last()
            .map(|prev| overlap_tail(&prev.units, overlap))
            .unwrap_or_default();
        let mut chunk = packer.fill(carried);
        if chunk.overlap_units == chunk.units.len() {
            log::debug!(
                "chunk {}: tail overlap left no room for new content; retrying without overlap",
                chunks.len() + 1
            );
            chunk = packer.fill(Vec::new());
        }
        if chunk.units.is_empty() {
            log::warn!("chunker made no progress at line {}; forcing the next unit", packer.cursor);
            chunk = packer.force_next();
        }
        chunks.push(chunk);
    }

    log::debug!(
        "chunked {} lines into {} chunks (chunk_chars={chunk_chars}, overlap_chars={overlap})",
        lines.len(),
        chunks.len()
    );
    Ok(chunks)
}

struct Packer<'a> {
    lines: &'a [Line],
    chunk_chars: usize,
    split_limit: usize,
    cursor: usize,
    pending: VecDeque<Unit>,
}

impl Packer<'_> {
    fn has_input(&self) -> bool {
        self.cursor < self.lines.len() || !self.pending.is_empty()
    }

    /// Append new content after `carried`; returns a chunk with no new units when nothing fits.
    fn fill(&mut self, carried: Vec<Unit>) -> Chunk {
        let overlap_units = carried.len();
        let mut units = carried;
        let mut len = joined_len(&units);

        if let Some(piece) = self.pending.front() {
            if grown_len(len, units.len(), char_len(&piece.text)) <= self.chunk_chars {
                if let Some(piece) = self.pending.pop_front() {
                    units.push(piece);
                }
            }
            return finish(units, overlap_units);
        }

        while let Some(line) = self.lines.get(self.cursor) {
            let n = char_len(&line.text);
            let next = grown_len(len, units.len(), n);
            if next <= self.chunk_chars {
                units.push(Unit::whole(line));
                len = next;
                self.cursor += 1;
                continue;
            }
            let nothing_new = units.len() == overlap_units;
            if nothing_new && n > self.chunk_chars {
                let split = split_long_line(&line.text, self.split_limit);
                log::debug!(
                    "line {} ({n} chars) split into {} pieces",
                    line.index,
                    split.pieces.len()
                );
                self.pending.extend(
                    split
                        .pieces
                        .into_iter()
                        .map(|p| Unit::piece(p, line.index, line.time)),
                );
                self.cursor += 1;
                if let Some(first) = self.pending.front() {
                    if grown_len(len, units.len(), char_len(&first.text)) <= self.chunk_chars {
                        if let Some(first) = self.pending.pop_front() {
                            units.push(first);
                        }
                    }
                }
            }
            break;
        }
        finish(units, overlap_units)
    }

    /// Take the next pending piece or line on its own, ignoring carried overlap.
    fn force_next(&mut self) -> Chunk {
        if self.pending.is_empty() {
            if let Some(line) = self.lines.get(self.cursor) {
                self.cursor += 1;
                if char_len(&line.text) <= self.chunk_chars {
                    return finish(vec![Unit::whole(line)], 0);
                }
                self.pending.extend(
                    hard_split(&line.text, self.chunk_chars)
                        .into_iter()
                        .map(|p| Unit::piece(p, line.index, line.time)),
                );
            }
        }
        finish(self.pending.pop_front().into_iter().collect(), 0)
    }
}

fn finish(units: Vec<Unit>, overlap_units: usize) -> Chunk {
    let fresh = &units[overlap_units..];
    let start = fresh.iter().find_map(|u| u.time);
    let end = fresh.iter().rev().find_map(|u| u.time);
    Chunk {
        units,
        overlap_units,
        start,
        end,
    }
}

/// Maximal suffix of `units` within `budget` chars. A split tail unit, or a tail unit too
/// long to carry whole, is re-split at `budget` and its trailing sub-pieces are carried.
fn overlap_tail(units: &[Unit], budget: usize) -> Vec<Unit> {
    let Some(last) = units.last() else {
        return Vec::new();
    };
    if budget == 0 {
        return Vec::new();
    }

    if !last.split {
        let mut take = 0usize;
        let mut len = 0usize;
        for u in units.iter().rev() {
            if u.split {
                break;
            }
            let next = grown_len(len, take, char_len(&u.text));
            if next > budget {
                break;
            }
            len = next;
            take += 1;
        }
        if take > 0 {
            return units[units.len() - take..].to_vec();
        }
    }

    let pieces = split_long_line(&last.text, budget).pieces;
    let mut tail: Vec<String> = Vec::new();
    let mut len = 0usize;
    for p in pieces.into_iter().rev() {
        let next = grown_len(len, tail.len(), char_len(&p));
        if next > budget {
            break;
        }
        len = next;
        tail.push(p);
    }
    tail.reverse();
    tail.into_iter()
        .map(|p| Unit::piece(p, last.line, last.time))
        .collect()
}
