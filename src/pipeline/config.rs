use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

use crate::config::{LayeredConfig, DEFAULT_CONFIG_FILENAME, DEFAULT_CONFIG_TOML};
use crate::context::{ContextOptions, ContextSource, DEFAULT_SENTENCE_DELIMITERS};
use crate::error::PipelineError;
use crate::models::ProviderSettings;
use crate::pipeline::prompts::{default_prompt_files, ContentMode, PromptCatalog, DEFAULT_PROMPTS_DIR};
use crate::retry::RetryPolicy;
use crate::transcript::InputFormat;

pub const DEFAULT_SUMMARY_HEADING: &str = "## Non-authorial AI generated summary";
pub const DEFAULT_PARASITES_EN: &str = "um\nuh\nlike\nyou know\nkind of\nsort of\nI mean\nbasically\nactually\nright\nokay so\n";

/// What to emit in place of a fragment whose rewrite failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailedFragmentPolicy {
    Raw,
    Omit,
}

impl std::str::FromStr for FailedFragmentPolicy {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raw" => Ok(FailedFragmentPolicy::Raw),
            "omit" => Ok(FailedFragmentPolicy::Omit),
            other => Err(PipelineError::config(
                "pipeline.failed_fragment_policy",
                format!("expected raw or omit (got {other:?})"),
            )),
        }
    }
}

/// Command-line values that take precedence over the config file.
#[derive(Clone, Debug, Default)]
pub struct CliOverrides {
    pub format: Option<String>,
    pub outdir: Option<PathBuf>,
    pub lang: Option<String>,
    pub glossary: Option<PathBuf>,
    pub provider: Option<String>,
    pub chunk_chars: Option<i64>,
    pub overlap_chars: Option<i64>,
    pub include_timecodes: Option<bool>,
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub config_path: PathBuf,
    pub input: PathBuf,
    pub format: InputFormat,
    pub outdir: PathBuf,

    pub lang: String,
    pub parasites: Vec<String>,
    pub glossary: Vec<String>,
    pub content_mode: ContentMode,
    pub include_timecodes: bool,
    pub aside_style: String,
    pub suppress_edit_comments: bool,
    pub append_summary: bool,
    pub summary_heading: String,
    pub failed_policy: FailedFragmentPolicy,

    pub chunk_chars: usize,
    pub overlap_chars: usize,
    pub use_context_overlap: bool,
    pub context: ContextOptions,
    pub dedup_window_chars: usize,

    pub retry: RetryPolicy,
    pub request_delay: Duration,

    pub provider: String,
    pub provider_settings: ProviderSettings,
    pub prompts: PromptCatalog,

    pub trace_dir: PathBuf,
    pub trace_prompts: bool,
    pub write_partial: bool,
}

fn non_negative(key: &str, value: i64) -> Result<usize, PipelineError> {
    usize::try_from(value)
        .map_err(|_| PipelineError::config(key, format!("must not be negative (got {value})")))
}

fn seconds(key: &str, value: f64) -> Result<Duration, PipelineError> {
    if value < 0.0 {
        return Err(PipelineError::config(key, format!("must be a non-negative number of seconds (got {value})")));
    }
    Duration::try_from_secs_f64(value)
        .map_err(|_| PipelineError::config(key, format!("must be a finite number of seconds (got {value})")))
}

/// Non-empty trimmed lines of a list file; a missing file is an empty list.
pub fn load_list(path: &Path) -> anyhow::Result<Vec<String>> {
    if !path.exists() {
        log::warn!("list file not found: {}", path.display());
        return Ok(Vec::new());
    }
    let text = std::fs::read_to_string(path).with_context(|| format!("read list: {}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

impl PipelineConfig {
    pub fn from_paths_and_args(input: &Path, layered: &LayeredConfig, args: &CliOverrides) -> anyhow::Result<Self> {
        let file_cfg = &layered.config;
        let cfg_dir = layered.config_dir().to_path_buf();
        let p = &file_cfg.pipeline;

        let format = match args
            .format
            .as_deref()
            .or(p.format.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            Some(f) => f.parse::<InputFormat>()?,
            None => InputFormat::from_path(input),
        };

        let outdir = args.outdir.clone().unwrap_or_else(|| {
            input
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        });

        let lang = args
            .lang
            .clone()
            .or_else(|| p.lang.clone())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "en".to_string());

        let parasites = match file_cfg.parasites.get(&lang) {
            Some(rel) => load_list(&resolve_relative(&cfg_dir, rel))?,
            None => Vec::new(),
        };
        let glossary = match args.glossary.as_deref() {
            Some(path) => load_list(path)?,
            None => Vec::new(),
        };

        let content_mode = p.content_mode.as_deref().unwrap_or("normal").parse::<ContentMode>()?;
        let failed_policy = p
            .failed_fragment_policy
            .as_deref()
            .unwrap_or("raw")
            .parse::<FailedFragmentPolicy>()?;

        let chunk_chars = args.chunk_chars.or(file_cfg.chunking.chunk_chars).unwrap_or(6500);
        if chunk_chars <= 0 {
            return Err(PipelineError::config("chunking.chunk_chars", format!("must be positive (got {chunk_chars})")).into());
        }
        let chunk_chars = non_negative("chunking.chunk_chars", chunk_chars)?;
        let overlap_chars = non_negative(
            "chunking.overlap_chars",
            args.overlap_chars.or(file_cfg.chunking.overlap_chars).unwrap_or(500),
        )?;

        let c = &file_cfg.context;
        let context = ContextOptions {
            source: match c.source.as_deref() {
                Some(s) => s.parse::<ContextSource>()?,
                None => ContextSource::Raw,
            },
            max_chars: match c.max_chars {
                Some(v) => non_negative("context.max_chars", v)?,
                None => overlap_chars,
            },
            sentence_delimiters: c
                .sentence_delimiters
                .clone()
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| DEFAULT_SENTENCE_DELIMITERS.to_string()),
        };
        let dedup_window_chars = match file_cfg.stitch.dedup_window_chars {
            Some(v) => non_negative("stitch.dedup_window_chars", v)?,
            None => overlap_chars,
        };

        let r = &file_cfg.retry;
        let attempts = r.attempts.unwrap_or(3);
        if attempts < 1 {
            return Err(PipelineError::config("retry.attempts", format!("must be at least 1 (got {attempts})")).into());
        }
        let attempts = u32::try_from(attempts).unwrap_or(u32::MAX);
        let retry = RetryPolicy::new(attempts, seconds("retry.pause_seconds", r.pause_seconds.unwrap_or(2.0))?);
        let request_delay = seconds("retry.request_delay_seconds", r.request_delay_seconds.unwrap_or(0.0))?;

        let provider = args
            .provider
            .clone()
            .or_else(|| file_cfg.llm.provider.clone())
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "openai".to_string());
        let provider_settings = file_cfg
            .llm
            .provider_section(&provider)
            .ok_or_else(|| {
                PipelineError::config(
                    "llm.provider",
                    format!("unknown provider {provider:?} (expected openai, gemini or dummy)"),
                )
            })?
            .settings();

        let prompts = PromptCatalog::load(&cfg_dir, &file_cfg.prompts, content_mode).context("load prompts")?;

        let trace_dir = p.trace_dir.clone().unwrap_or_else(|| "_trace".to_string());
        let trace_dir = if Path::new(&trace_dir).is_absolute() {
            PathBuf::from(trace_dir)
        } else {
            outdir.join(trace_dir)
        };

        Ok(Self {
            config_path: layered.path.clone(),
            input: input.to_path_buf(),
            format,
            outdir,
            lang,
            parasites,
            glossary,
            content_mode,
            include_timecodes: args
                .include_timecodes
                .or(p.include_timecodes_in_headings)
                .unwrap_or(true),
            aside_style: p
                .highlight_asides_style
                .clone()
                .unwrap_or_else(|| "italic".to_string()),
            suppress_edit_comments: p.suppress_edit_comments.unwrap_or(true),
            append_summary: p.append_summary.unwrap_or(true),
            summary_heading: p
                .summary_heading
                .clone()
                .filter(|h| !h.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_SUMMARY_HEADING.to_string()),
            failed_policy,
            chunk_chars,
            overlap_chars,
            use_context_overlap: c.use_context_overlap.unwrap_or(true),
            context,
            dedup_window_chars,
            retry,
            request_delay,
            provider,
            provider_settings,
            prompts,
            trace_dir,
            trace_prompts: p.trace_prompts.unwrap_or(false),
            write_partial: p.write_partial.unwrap_or(true),
        })
    }

    /// `<outdir>/<input stem>`; the output files append their suffix to this.
    pub fn output_base(&self) -> PathBuf {
        let stem = self
            .input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());
        self.outdir.join(stem)
    }
}

fn resolve_relative(base: &Path, rel: &str) -> PathBuf {
    let p = PathBuf::from(rel);
    if p.is_relative() {
        base.join(p)
    } else {
        p
    }
}

/// Write the default config, prompt files and an English filler list into `dir`.
/// Existing files are kept unless `force`.
pub fn init_default_config(dir: &Path, force: bool) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("create config dir: {}", dir.display()))?;
    let cfg_path = dir.join(DEFAULT_CONFIG_FILENAME);

    let prompts_dir = dir.join(DEFAULT_PROMPTS_DIR);
    std::fs::create_dir_all(&prompts_dir)
        .with_context(|| format!("create prompts dir: {}", prompts_dir.display()))?;
    for (fname, body) in default_prompt_files() {
        write_unless_present(&prompts_dir.join(fname), body, force)?;
    }

    let parasites_dir = dir.join("parasites");
    std::fs::create_dir_all(&parasites_dir)
        .with_context(|| format!("create parasites dir: {}", parasites_dir.display()))?;
    write_unless_present(&parasites_dir.join("en.txt"), DEFAULT_PARASITES_EN, force)?;

    write_unless_present(&cfg_path, DEFAULT_CONFIG_TOML, force)?;
    Ok(cfg_path)
}

fn write_unless_present(path: &Path, body: &str, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        log::debug!("keeping {}", path.display());
        return Ok(());
    }
    std::fs::write(path, body).with_context(|| format!("write: {}", path.display()))?;
    Ok(())
}
