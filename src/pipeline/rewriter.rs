use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context};

use crate::chunker::{chunk_text_line_preserving, Chunk, Line};
use crate::context::{build_context, ContextSource};
use crate::error::{PipelineError, RewriteError};
use crate::logging::log_trace_block;
use crate::models::{ModelParams, RewriteBackend};
use crate::progress::ConsoleProgress;
use crate::quality::{write_qc_report, QcRecord};
use crate::retry::{run_with_retry, RetryOutcome};
use crate::stitch::dedup_overlapping_boundary;
use crate::terminology::TermGlossary;
use crate::textutil::{add_timecodes_to_headings, strip_edit_comments};
use crate::transcript::parse_transcript;

use super::config::{FailedFragmentPolicy, PipelineConfig};
use super::prompts::{summary_user_prompt, FragmentPrompt};
use super::trace::TraceWriter;

/// Per-document mutable state threaded through the sequential loop.
#[derive(Debug, Default)]
pub struct DocumentState {
    pub glossary: TermGlossary,
    /// Raw text of the previous fragment.
    pub prev_raw_fragment: String,
    /// Rewritten text of the previous fragment; `None` when it failed.
    pub prev_cleaned: Option<String>,
    /// Last emitted block, the left side of the next stitch boundary.
    pub prev_for_dedup: Option<String>,
    pub blocks: Vec<String>,
    pub qc: Vec<QcRecord>,
}

impl DocumentState {
    pub fn document(&self) -> String {
        self.blocks.join("\n\n")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FragmentFailure {
    pub fragment_id: usize,
    pub error: RewriteError,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Complete,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn exit_code(&self) -> u8 {
        match self {
            RunStatus::Complete => 0,
            RunStatus::Partial => 3,
            RunStatus::Failed => 4,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DocumentReport {
    pub total: usize,
    pub ok: usize,
    pub failed: usize,
    pub failures: Vec<FragmentFailure>,
    pub output: PathBuf,
    pub qc_report: PathBuf,
    pub summary_appended: bool,
}

impl DocumentReport {
    pub fn status(&self) -> RunStatus {
        if self.failed == 0 {
            RunStatus::Complete
        } else if self.ok == 0 {
            RunStatus::Failed
        } else {
            RunStatus::Partial
        }
    }
}

/// Outcome of one fragment after post-processing.
struct FragmentResult {
    block: Option<String>,
    cleaned: Option<String>,
    qc: QcRecord,
    error: Option<RewriteError>,
}

pub struct RewriterPipeline {
    cfg: PipelineConfig,
    backend: Box<dyn RewriteBackend>,
    progress: ConsoleProgress,
    trace: TraceWriter,
    sleep: fn(Duration),
}

impl RewriterPipeline {
    pub fn new(cfg: PipelineConfig, backend: Box<dyn RewriteBackend>, progress: ConsoleProgress) -> Self {
        let trace = match TraceWriter::new(cfg.trace_dir.clone(), cfg.trace_prompts) {
            Ok(t) => t,
            Err(err) => {
                log::warn!("prompt trace disabled: {err:#}");
                TraceWriter::disabled()
            }
        };
        Self {
            cfg,
            backend,
            progress,
            trace,
            sleep: std::thread::sleep,
        }
    }

    /// Replace the function used for retry and pacing waits.
    pub fn with_sleeper(mut self, sleep: fn(Duration)) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn partial_path(&self) -> PathBuf {
        with_suffix(&self.cfg.output_base(), ".partial.md")
    }

    pub fn run(&mut self) -> anyhow::Result<DocumentReport> {
        let input = self.cfg.input.clone();
        self.progress.info(format!("Read input: {}", input.display()));
        let content = fs::read_to_string(&input)
            .with_context(|| format!("read input: {}", input.display()))?;
        if content.trim().is_empty() {
            return Err(anyhow!("input file is empty: {}", input.display()));
        }
        let lines = parse_transcript(&content, self.cfg.format);
        if lines.iter().all(|l| l.text.trim().is_empty()) {
            return Err(anyhow!("input has no textual content: {}", input.display()));
        }
        self.run_lines(&lines)
    }

    /// Chunk `lines` and rewrite every fragment in order.
    pub fn run_lines(&mut self, lines: &[Line]) -> anyhow::Result<DocumentReport> {
        let cfg = &self.cfg;
        let timestamped = lines.iter().filter(|l| l.time.is_some()).count();
        log::debug!(
            "input: {} lines ({timestamped} timestamped), format={}",
            lines.len(),
            cfg.format.as_str()
        );
        log::debug!(
            "settings: provider={} mode={} chunk_chars={} overlap_chars={} context={}/{} dedup_window={} attempts={}",
            cfg.provider,
            cfg.content_mode.as_str(),
            cfg.chunk_chars,
            cfg.overlap_chars,
            cfg.context.source.as_str(),
            cfg.context.max_chars,
            cfg.dedup_window_chars,
            cfg.retry.max_attempts
        );
        let chunks = chunk_text_line_preserving(lines, cfg.chunk_chars, cfg.overlap_chars)?;
        self.progress.info(format!("Chunks: {}", chunks.len()));

        self.backend.validate_environment().map_err(|err| {
            PipelineError::config(format!("llm.{}", self.cfg.provider), err.message().to_string())
        })?;

        fs::create_dir_all(&self.cfg.outdir)
            .with_context(|| format!("create output dir: {}", self.cfg.outdir.display()))?;
        let partial = self.partial_path();

        let total = chunks.len();
        let mut state = DocumentState::default();
        let mut failures = Vec::new();
        let mut ok = 0usize;

        for (i, chunk) in chunks.iter().enumerate() {
            let fragment_id = i + 1;
            if i > 0 && !self.cfg.request_delay.is_zero() {
                (self.sleep)(self.cfg.request_delay);
            }
            let result = self.process_fragment(fragment_id, chunk, &mut state);
            let succeeded = result.error.is_none();
            match result.error {
                None => ok += 1,
                Some(error) => {
                    log::warn!("fragment {fragment_id}/{total} failed: {error}");
                    failures.push(FragmentFailure { fragment_id, error });
                }
            }
            state.prev_raw_fragment = self.raw_fragment(chunk);
            state.prev_cleaned = result.cleaned;
            state.prev_for_dedup = result.block.clone();
            if let Some(block) = result.block {
                state.blocks.push(block);
            }
            state.qc.push(result.qc);
            self.progress
                .fragment_done(fragment_id, total, succeeded, ok, failures.len());

            if self.cfg.write_partial {
                write_atomic(&partial, &state.document())?;
            }
        }

        let mut document = state.document();
        let mut summary_appended = false;
        if self.cfg.append_summary && ok > 0 && !document.trim().is_empty() {
            if let Some(summary) = self.summarize(&document) {
                document = format!(
                    "{}\n\n{}\n\n{}\n",
                    document.trim_end(),
                    self.cfg.summary_heading,
                    summary.trim()
                );
                summary_appended = true;
            }
        }
        if !document.ends_with('\n') {
            document.push('\n');
        }

        let base = self.cfg.output_base();
        let output = with_suffix(&base, ".md");
        write_atomic(&output, &document)?;
        let qc_report = with_suffix(&base, "_qc_report.csv");
        write_qc_report(&qc_report, &state.qc)?;
        if partial.exists() {
            fs::remove_file(&partial)
                .with_context(|| format!("remove partial output: {}", partial.display()))?;
        }

        self.progress.info(format!("Markdown: {}", output.display()));
        self.progress.info(format!("QC report: {}", qc_report.display()));

        let failed = failures.len();
        Ok(DocumentReport {
            total,
            ok,
            failed,
            failures,
            output,
            qc_report,
            summary_appended,
        })
    }

    fn raw_fragment(&self, chunk: &Chunk) -> String {
        if self.cfg.use_context_overlap {
            chunk.fragment_text()
        } else {
            chunk.text()
        }
    }

    fn process_fragment(
        &mut self,
        fragment_id: usize,
        chunk: &Chunk,
        state: &mut DocumentState,
    ) -> FragmentResult {
        let raw = self.raw_fragment(chunk);
        let context = if self.cfg.use_context_overlap
            && fragment_id > 1
            && self.cfg.context.source != ContextSource::None
        {
            build_context(&state.prev_raw_fragment, state.prev_cleaned.as_deref(), &self.cfg.context).text
        } else {
            String::new()
        };
        log::debug!(
            "fragment {fragment_id}: {} chars, context {} chars, {} overlap units",
            raw.chars().count(),
            context.chars().count(),
            chunk.overlap_units
        );

        if raw.trim().is_empty() {
            return FragmentResult {
                block: None,
                cleaned: None,
                qc: QcRecord::measure(fragment_id, chunk.start, chunk.end, &raw, ""),
                error: None,
            };
        }

        let hints = state.glossary.hints();
        let user = FragmentPrompt {
            lang: &self.cfg.lang,
            parasites: &self.cfg.parasites,
            glossary: &self.cfg.glossary,
            aside_style: &self.cfg.aside_style,
            fragment: &raw,
            context: &context,
            term_hints: &hints,
        }
        .render(&self.cfg.prompts.user_template);
        let system = self.cfg.prompts.system.clone();

        self.trace_fragment(fragment_id, "system", &system);
        self.trace_fragment(fragment_id, "user", &user);
        log_trace_block(&format!("fragment {fragment_id} prompt"), &user);

        let outcome = self.call_backend(&system, &user);
        let rewritten = match outcome.result {
            Ok(text) => text,
            Err(error) => {
                self.trace_fragment(fragment_id, "error", &error.to_string());
                let block = match self.cfg.failed_policy {
                    FailedFragmentPolicy::Raw => Some(raw.clone()),
                    FailedFragmentPolicy::Omit => None,
                };
                return FragmentResult {
                    block,
                    cleaned: None,
                    qc: QcRecord::measure(fragment_id, chunk.start, chunk.end, &raw, ""),
                    error: Some(error),
                };
            }
        };
        self.trace_fragment(fragment_id, "response", &rewritten);
        log_trace_block(&format!("fragment {fragment_id} response"), &rewritten);
        if outcome.calls > 1 {
            log::info!("fragment {fragment_id}: succeeded after {} attempts", outcome.calls);
        }

        let fold = state.glossary.fold_fragment(&rewritten);
        let mut cleaned = fold.text;
        if self.cfg.include_timecodes {
            if let Some(start) = chunk.start {
                cleaned = add_timecodes_to_headings(&cleaned, start, true);
            }
        }
        if let Some(prev) = state.prev_for_dedup.as_deref() {
            if self.cfg.dedup_window_chars > 0 {
                let outcome = dedup_overlapping_boundary(prev, &cleaned, self.cfg.dedup_window_chars);
                if outcome.removed > 0 {
                    log::debug!(
                        "fragment {fragment_id}: dedup removed {} leading {}",
                        outcome.removed,
                        outcome.mode.as_str()
                    );
                }
                cleaned = outcome.text;
            }
        }
        let block = if self.cfg.suppress_edit_comments {
            strip_edit_comments(&cleaned)
        } else {
            cleaned.clone()
        };

        FragmentResult {
            qc: QcRecord::measure(fragment_id, chunk.start, chunk.end, &raw, &block),
            block: (!block.trim().is_empty()).then(|| block.clone()),
            cleaned: Some(cleaned),
            error: None,
        }
    }

    fn trace_fragment(&self, fragment_id: usize, kind: &str, text: &str) {
        if let Err(err) = self.trace.write_fragment_text(fragment_id, kind, text) {
            log::warn!("fragment {fragment_id}: {err:#}");
        }
    }

    fn call_backend(&mut self, system: &str, user: &str) -> RetryOutcome {
        let params: &ModelParams = &self.cfg.provider_settings.params;
        let backend = &mut self.backend;
        run_with_retry(&self.cfg.retry, self.sleep, |_attempt| {
            backend.rewrite(system, user, params)
        })
    }

    fn summarize(&mut self, document: &str) -> Option<String> {
        self.progress.info("Generating summary");
        let user = summary_user_prompt(&self.cfg.prompts.summary, document);
        let system = self.cfg.prompts.system.clone();
        if let Err(err) = self.trace.write_named_text("summary.user.txt", &user) {
            log::warn!("{err:#}");
        }
        let outcome = self.call_backend(&system, &user);
        match outcome.result {
            Ok(summary) => {
                log_trace_block("summary response", &summary);
                Some(summary)
            }
            Err(err) => {
                log::warn!("summary generation failed: {err}");
                None
            }
        }
    }
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Write through a sibling temp file and rename, so readers never see a half-written file.
pub fn write_atomic(path: &Path, text: &str) -> anyhow::Result<()> {
    let tmp = with_suffix(path, ".tmp");
    fs::write(&tmp, text).with_context(|| format!("write: {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(ok: usize, failed: usize) -> DocumentReport {
        DocumentReport {
            total: ok + failed,
            ok,
            failed,
            failures: Vec::new(),
            output: PathBuf::new(),
            qc_report: PathBuf::new(),
            summary_appended: false,
        }
    }

    #[test]
    fn exit_status_distinguishes_partial_from_total_failure() {
        assert_eq!(report(3, 0).status().exit_code(), 0);
        assert_eq!(report(2, 1).status(), RunStatus::Partial);
        assert_eq!(report(0, 2).status().exit_code(), 4);
    }

    #[test]
    fn atomic_write_replaces_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.partial.md");
        write_atomic(&path, "one").unwrap();
        write_atomic(&path, "two").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "two");
        assert!(!dir.path().join("doc.partial.md.tmp").exists());
    }

    #[test]
    fn output_names_extend_the_stem() {
        assert_eq!(
            with_suffix(Path::new("/out/talk"), "_qc_report.csv"),
            PathBuf::from("/out/talk_qc_report.csv")
        );
    }
}
