use std::io::Write;
use std::path::Path;

use anyhow::Context;
use serde::Serialize;

use crate::textutil::{char_len, similarity_ratio};

pub const QC_HEADER: [&str; 7] = [
    "chunk_id",
    "start",
    "end",
    "orig_len",
    "cleaned_len",
    "similarity",
    "change_ratio",
];

/// Per-fragment quality record.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QcRecord {
    pub chunk_id: usize,
    pub start: Option<f64>,
    pub end: Option<f64>,
    pub orig_len: usize,
    pub cleaned_len: usize,
    pub similarity: f64,
    pub change_ratio: f64,
}

impl QcRecord {
    #[must_use]
    pub fn measure(
        chunk_id: usize,
        start: Option<f64>,
        end: Option<f64>,
        original: &str,
        cleaned: &str,
    ) -> Self {
        let sim = similarity_ratio(original, cleaned);
        Self {
            chunk_id,
            start,
            end,
            orig_len: char_len(original),
            cleaned_len: char_len(cleaned),
            similarity: round4(sim),
            change_ratio: round4(1.0 - sim),
        }
    }
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

/// CSV writer for QC rows over any sink; the header is written even when there are no rows.
pub fn write_qc_rows<W: Write>(sink: W, rows: &[QcRecord]) -> csv::Result<W> {
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .terminator(csv::Terminator::CRLF)
        .from_writer(sink);
    wtr.write_record(QC_HEADER)?;
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    wtr.into_inner().map_err(|e| csv::Error::from(e.into_error()))
}

pub fn write_qc_report(path: &Path, rows: &[QcRecord]) -> anyhow::Result<()> {
    let f = std::fs::File::create(path)
        .with_context(|| format!("create qc report: {}", path.display()))?;
    write_qc_rows(f, rows).with_context(|| format!("write qc report: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn measures_similarity_and_lengths() {
        let r = QcRecord::measure(1, Some(3.0), None, "a b c", "a b d");
        assert_eq!(r.orig_len, 5);
        assert_eq!(r.similarity, 0.5);
        assert_eq!(r.change_ratio, 0.5);
    }

    #[test]
    fn ratios_are_rounded_to_four_places() {
        let r = QcRecord::measure(2, None, None, "a b c", "a");
        assert_eq!(r.similarity, 0.3333);
        assert_eq!(r.change_ratio, 0.6667);
    }

    fn render(rows: &[QcRecord]) -> String {
        String::from_utf8(write_qc_rows(Vec::new(), rows).unwrap()).unwrap()
    }

    #[test]
    fn csv_has_header_and_blank_missing_times() {
        let rows = vec![QcRecord::measure(1, Some(1.5), None, "x", "x")];
        assert_eq!(
            render(&rows),
            "chunk_id,start,end,orig_len,cleaned_len,similarity,change_ratio\r\n1,1.5,,1,1,1.0,0.0\r\n"
        );
    }

    #[test]
    fn failed_fragment_row_has_zero_similarity() {
        let rows = vec![QcRecord::measure(4, Some(60.0), Some(75.0), "some raw text", "")];
        let csv = render(&rows);
        assert_eq!(csv.lines().nth(1), Some("4,60.0,75.0,13,0,0.0,1.0"));
    }

    #[test]
    fn writes_report_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qc.csv");
        write_qc_report(&path, &[]).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("chunk_id,start"));
    }
}
