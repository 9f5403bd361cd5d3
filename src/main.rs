use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{CommandFactory, Parser};

use lecture_pipeline::config::{default_table, load_layered, DoctorReport};
use lecture_pipeline::error::PipelineError;
use lecture_pipeline::logging::{init_logging, resolve_level};
use lecture_pipeline::models::{create_backend, load_env_file};
use lecture_pipeline::pipeline::{init_default_config, CliOverrides, PipelineConfig, RewriterPipeline};
use lecture_pipeline::progress::ConsoleProgress;

#[derive(Parser, Debug)]
#[command(name = "lecture-pipeline")]
#[command(about = "Rewrite long lecture transcripts into clean Markdown, one bounded fragment at a time", long_about = None)]
struct Args {
    /// Generate default config + prompt files, then exit
    #[arg(long)]
    init_config: bool,

    /// Directory to write config/prompt files (default: current directory)
    #[arg(long, value_name = "DIR")]
    init_config_dir: Option<PathBuf>,

    /// Overwrite existing config/prompt files when used with --init-config
    #[arg(long)]
    force: bool,

    /// Compare the user config with the built-in defaults, then exit
    #[arg(long)]
    config_doctor: bool,

    /// Emit the config doctor report as JSON
    #[arg(long, requires = "config_doctor")]
    json: bool,

    /// Input transcript (.txt with optional [HH:MM:SS] stamps, or .srt)
    #[arg(short, long, value_name = "FILE")]
    input: Option<PathBuf>,

    /// Input format: txt or srt (default: config, then file extension)
    #[arg(long)]
    format: Option<String>,

    /// Output directory (default: next to the input)
    #[arg(short, long, value_name = "DIR")]
    outdir: Option<PathBuf>,

    /// Output language code (e.g. en, ru)
    #[arg(long)]
    lang: Option<String>,

    /// Glossary file, one term per line
    #[arg(long, value_name = "FILE")]
    glossary: Option<PathBuf>,

    /// Config file path (default: search for lecture-pipeline.toml upwards)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override a config value, e.g. --set chunking.chunk_chars=4000 (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE")]
    set: Vec<String>,

    /// Rewrite provider: openai, gemini or dummy
    #[arg(long)]
    provider: Option<String>,

    /// Fragment size budget in characters
    #[arg(long)]
    chunk_chars: Option<i64>,

    /// Characters of the previous chunk carried into the next
    #[arg(long)]
    overlap_chars: Option<i64>,

    /// Append [HH:MM:SS] links to headings (true/false)
    #[arg(long, value_name = "BOOL")]
    include_timecodes: Option<bool>,

    /// Shortcut for --log-level debug
    #[arg(long)]
    debug: bool,

    /// trace, debug, info, warn or error
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            let is_config = err.chain().any(|e| e.is::<PipelineError>());
            eprintln!("ERROR: {err:#}");
            ExitCode::from(if is_config { 2 } else { 1 })
        }
    }
}

fn run(args: Args) -> anyhow::Result<u8> {
    if args.init_config {
        init_logging(&resolve_level(args.log_level.as_deref(), args.debug, None));
        let dir = args
            .init_config_dir
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        let cfg_path = init_default_config(&dir, args.force).context("init default config")?;
        eprintln!("Wrote config: {}", cfg_path.display());
        return Ok(0);
    }

    let search_dir = args
        .input
        .as_deref()
        .and_then(Path::parent)
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let layered = load_layered(args.config.as_deref(), &search_dir, &args.set)?;
    init_logging(&resolve_level(
        args.log_level.as_deref(),
        args.debug,
        layered.config.pipeline.log_level.as_deref(),
    ));
    if !load_env_file(layered.config_dir()) {
        if let Ok(cwd) = std::env::current_dir() {
            load_env_file(&cwd);
        }
    }

    if args.config_doctor {
        return config_doctor(&layered, args.json);
    }

    let Some(input) = args.input.clone() else {
        let mut cmd = Args::command();
        cmd.print_help().context("print help")?;
        eprintln!(
            "\n\nUSAGE:\n  lecture-pipeline --input lecture.txt\n\nTIPS:\n  - Run --init-config once to write lecture-pipeline.toml and the prompt files.\n  - Default config search: lecture-pipeline.toml (upwards), or set LECTURE_PIPELINE_CONFIG.\n"
        );
        return Ok(0);
    };
    if !input.is_file() {
        return Err(anyhow::anyhow!("input not found: {}", input.display()));
    }

    let overrides = CliOverrides {
        format: args.format,
        outdir: args.outdir,
        lang: args.lang,
        glossary: args.glossary,
        provider: args.provider,
        chunk_chars: args.chunk_chars,
        overlap_chars: args.overlap_chars,
        include_timecodes: args.include_timecodes,
    };
    let cfg = PipelineConfig::from_paths_and_args(&input, &layered, &overrides).context("build config")?;
    let progress = ConsoleProgress::new(true);
    if layered.file_found {
        progress.info(format!("Config: {}", layered.path.display()));
    } else {
        progress.info("Config: built-in defaults");
    }
    progress.info(format!("Provider: {}", cfg.provider));
    let backend = create_backend(&cfg.provider, &cfg.provider_settings)?;

    let mut pipeline = RewriterPipeline::new(cfg, backend, progress);
    let report = pipeline.run()?;
    if report.failed == 0 {
        eprintln!("All {} fragment(s) processed successfully.", report.total);
    } else {
        eprintln!(
            "Completed with {} failure(s) out of {} fragment(s).",
            report.failed, report.total
        );
        for f in &report.failures {
            eprintln!("  fragment {}: {} ({})", f.fragment_id, f.error, f.error.class().as_str());
        }
    }
    eprintln!("Done. Markdown: {}", report.output.display());
    eprintln!("QC report: {}", report.qc_report.display());
    Ok(report.status().exit_code())
}

fn config_doctor(layered: &lecture_pipeline::config::LayeredConfig, json: bool) -> anyhow::Result<u8> {
    let defaults = default_table()?;
    let has_local = layered.file_found || layered.local_path.is_some() || !layered.table.is_empty();
    if !has_local {
        eprintln!("WARNING: config not found; using only default");
    }
    let report = DoctorReport::build(&defaults, has_local.then_some(&layered.table));
    if json {
        let text = serde_json::to_string_pretty(&report).context("serialize doctor report")?;
        println!("{text}");
    } else {
        print!("{}", report.render_text());
    }
    Ok(if report.warn_count() > 0 { 1 } else { 0 })
}
