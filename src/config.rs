use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use toml::{Table, Value};

use crate::error::PipelineError;
use crate::models::{find_file_upwards, ModelParams, ProviderSettings};

pub const DEFAULT_CONFIG_FILENAME: &str = "lecture-pipeline.toml";
pub const CONFIG_ENV_VAR: &str = "LECTURE_PIPELINE_CONFIG";

/// Keys that are valid but absent from the built-in file. A trailing `.*` admits any child.
const OPTIONAL_KEYS: &[&str] = &[
    "context.max_chars",
    "stitch.dedup_window_chars",
    "pipeline.format",
    "parasites.*",
    "llm.openai.*",
    "llm.gemini.*",
    "llm.dummy.*",
];

#[derive(Clone, Debug, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub chunking: ChunkingSection,
    #[serde(default)]
    pub context: ContextSection,
    #[serde(default)]
    pub stitch: StitchSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub prompts: PromptsSection,
    /// Language code to a filler-word list, one word per line.
    #[serde(default)]
    pub parasites: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct PipelineSection {
    #[serde(default)]
    pub lang: Option<String>,
    /// "txt" or "srt"; when unset the input extension decides.
    #[serde(default)]
    pub format: Option<String>,
    /// "normal", "strict" or "creative"; selects the system prompt.
    #[serde(default)]
    pub content_mode: Option<String>,
    #[serde(default)]
    pub include_timecodes_in_headings: Option<bool>,
    /// "italic" or "blockquote".
    #[serde(default)]
    pub highlight_asides_style: Option<String>,
    #[serde(default)]
    pub suppress_edit_comments: Option<bool>,
    #[serde(default)]
    pub append_summary: Option<bool>,
    #[serde(default)]
    pub summary_heading: Option<String>,
    /// "raw" emits the untouched fragment in place of a failed one, "omit" drops it.
    #[serde(default)]
    pub failed_fragment_policy: Option<String>,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub trace_dir: Option<String>,
    #[serde(default)]
    pub trace_prompts: Option<bool>,
    #[serde(default)]
    pub write_partial: Option<bool>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct ChunkingSection {
    #[serde(default)]
    pub chunk_chars: Option<i64>,
    #[serde(default)]
    pub overlap_chars: Option<i64>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct ContextSection {
    #[serde(default)]
    pub use_context_overlap: Option<bool>,
    /// "raw", "cleaned" or "none".
    #[serde(default)]
    pub source: Option<String>,
    /// Defaults to `chunking.overlap_chars`.
    #[serde(default)]
    pub max_chars: Option<i64>,
    #[serde(default)]
    pub sentence_delimiters: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct StitchSection {
    /// Defaults to `chunking.overlap_chars`; 0 disables boundary dedup.
    #[serde(default)]
    pub dedup_window_chars: Option<i64>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct RetrySection {
    #[serde(default)]
    pub attempts: Option<i64>,
    #[serde(default)]
    pub pause_seconds: Option<f64>,
    /// Pause before every rewrite request after the first.
    #[serde(default)]
    pub request_delay_seconds: Option<f64>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct LlmSection {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub openai: ProviderSection,
    #[serde(default)]
    pub gemini: ProviderSection,
    #[serde(default)]
    pub dummy: ProviderSection,
}

impl LlmSection {
    pub fn provider_section(&self, provider: &str) -> Option<&ProviderSection> {
        match provider.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(&self.openai),
            "gemini" => Some(&self.gemini),
            "dummy" => Some(&self.dummy),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct ProviderSection {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<f64>,
}

impl ProviderSection {
    pub fn settings(&self) -> ProviderSettings {
        ProviderSettings {
            params: ModelParams {
                model: self.model.clone().filter(|m| !m.trim().is_empty()),
                temperature: self.temperature,
                top_p: self.top_p,
            },
            base_url: self.base_url.clone().filter(|u| !u.trim().is_empty()),
            timeout: self
                .timeout_seconds
                .filter(|s| *s > 0.0)
                .and_then(|s| std::time::Duration::try_from_secs_f64(s).ok()),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct PromptsSection {
    #[serde(default)]
    pub system_normal: Option<String>,
    #[serde(default)]
    pub system_strict: Option<String>,
    #[serde(default)]
    pub system_creative: Option<String>,
    #[serde(default)]
    pub user_template: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

pub fn find_default_config(workdir: &Path, filename: &str) -> Option<PathBuf> {
    if let Ok(cwd) = std::env::current_dir() {
        if let Some(p) = find_file_upwards(&cwd, filename, 8) {
            return Some(p);
        }
    }
    if let Some(p) = find_file_upwards(workdir, filename, 8) {
        return Some(p);
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            if let Some(p) = find_file_upwards(dir, filename, 10) {
                return Some(p);
            }
        }
    }
    None
}

/// `foo.toml` -> `foo.local.toml` in the same directory.
pub fn local_overlay_path(config_path: &Path) -> PathBuf {
    let stem = config_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "lecture-pipeline".to_string());
    let name = match config_path.extension() {
        Some(ext) => format!("{stem}.local.{}", ext.to_string_lossy()),
        None => format!("{stem}.local"),
    };
    config_path.with_file_name(name)
}

pub fn read_toml_table(path: &Path) -> anyhow::Result<Table> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    let table: Table = text
        .parse()
        .with_context(|| format!("parse config toml: {}", path.display()))?;
    Ok(table)
}

pub fn config_from_table(table: Table) -> anyhow::Result<AppConfig> {
    let cfg: AppConfig = Value::Table(table)
        .try_into()
        .context("parse config toml")?;
    Ok(cfg)
}

/// Tables merge recursively; any other value in `overlay` replaces the base value.
pub fn deep_merge(base: &mut Table, overlay: Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(Value::Table(dst)), Value::Table(src)) => deep_merge(dst, src),
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// VALUE as a TOML literal (`4000`, `true`, `"x"`, `[1, 2]`), else the raw text as a string.
pub fn parse_override_value(raw: &str) -> Value {
    let raw = raw.trim();
    format!("v = {raw}")
        .parse::<Table>()
        .ok()
        .and_then(|mut t| t.remove("v"))
        .unwrap_or_else(|| Value::String(raw.to_string()))
}

/// Apply one `dotted.key=VALUE` assignment.
pub fn apply_override(table: &mut Table, assignment: &str) -> Result<(), PipelineError> {
    let (key, raw) = assignment
        .split_once('=')
        .ok_or_else(|| PipelineError::config("--set", format!("expected KEY=VALUE, got {assignment:?}")))?;
    let parts: Vec<&str> = key.trim().split('.').map(str::trim).collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(PipelineError::config("--set", format!("invalid key {key:?}")));
    }
    let Some((leaf, parents)) = parts.split_last() else {
        return Err(PipelineError::config("--set", format!("invalid key {key:?}")));
    };
    let mut cursor = table;
    for (depth, part) in parents.iter().enumerate() {
        let entry = cursor
            .entry(part.to_string())
            .or_insert_with(|| Value::Table(Table::new()));
        cursor = match entry {
            Value::Table(t) => t,
            other => {
                return Err(PipelineError::config(
                    parts[..=depth].join("."),
                    format!("cannot set {key:?}: {} is not a table", other.type_str()),
                ))
            }
        };
    }
    cursor.insert(leaf.to_string(), parse_override_value(raw));
    Ok(())
}

/// The user's configuration after the local overlay and `--set` overrides.
#[derive(Clone, Debug)]
pub struct LayeredConfig {
    /// Main config file; may not exist when nothing was found.
    pub path: PathBuf,
    pub file_found: bool,
    pub local_path: Option<PathBuf>,
    pub table: Table,
    pub config: AppConfig,
}

impl LayeredConfig {
    pub fn config_dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }
}

pub fn resolve_config_path(explicit: Option<&Path>, search_dir: &Path) -> Option<PathBuf> {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| {
            std::env::var(CONFIG_ENV_VAR)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
        })
        .or_else(|| find_default_config(search_dir, DEFAULT_CONFIG_FILENAME))
}

pub fn load_layered(
    explicit: Option<&Path>,
    search_dir: &Path,
    overrides: &[String],
) -> anyhow::Result<LayeredConfig> {
    let found = resolve_config_path(explicit, search_dir);
    if let Some(p) = explicit {
        if !p.is_file() {
            return Err(anyhow!("config not found: {}", p.display()));
        }
    }

    let mut table = Table::new();
    let mut file_found = false;
    let mut local_path = None;
    let path = match found {
        Some(p) => {
            if p.is_file() {
                table = read_toml_table(&p)?;
                file_found = true;
                log::debug!("config: {}", p.display());
            }
            let local = local_overlay_path(&p);
            if local.is_file() {
                deep_merge(&mut table, read_toml_table(&local)?);
                log::debug!("config overlay: {}", local.display());
                local_path = Some(local);
            }
            p
        }
        None => search_dir.join(DEFAULT_CONFIG_FILENAME),
    };

    for assignment in overrides {
        apply_override(&mut table, assignment)?;
    }
    let config = config_from_table(table.clone())?;
    Ok(LayeredConfig {
        path,
        file_found,
        local_path,
        table,
        config,
    })
}

pub fn default_table() -> anyhow::Result<Table> {
    DEFAULT_CONFIG_TOML
        .parse()
        .context("parse built-in default config")
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct OverrideEntry {
    pub path: String,
    pub label: &'static str,
    pub from: Value,
    pub to: Value,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct KeyValue {
    pub path: String,
    pub value: Value,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct TypeWarning {
    pub path: String,
    pub default_type: &'static str,
    pub local_type: &'static str,
}

/// Differences between the built-in defaults and the user's configuration.
#[derive(Clone, Debug, Default, Serialize)]
pub struct DoctorReport {
    pub has_local_config: bool,
    pub overrides: Vec<OverrideEntry>,
    pub added_local_only: Vec<KeyValue>,
    pub new_default_only: Vec<KeyValue>,
    pub stale_local_only: Vec<KeyValue>,
    pub type_warnings: Vec<TypeWarning>,
    pub effective_config: Table,
}

impl DoctorReport {
    pub fn build(defaults: &Table, local: Option<&Table>) -> Self {
        let mut report = DoctorReport {
            has_local_config: local.is_some(),
            ..DoctorReport::default()
        };
        let mut effective = defaults.clone();
        if let Some(local) = local {
            report.walk_tables(defaults, local, "");
            deep_merge(&mut effective, local.clone());
        }
        report.effective_config = effective;
        report
    }

    pub fn warn_count(&self) -> usize {
        self.stale_local_only.len() + self.type_warnings.len()
    }

    fn walk_tables(&mut self, dv: &Table, lv: &Table, prefix: &str) {
        let mut keys: Vec<&String> = dv.keys().chain(lv.keys()).collect();
        keys.sort();
        keys.dedup();
        for key in keys {
            let path = join_path(prefix, key);
            match (dv.get(key), lv.get(key)) {
                (Some(Value::Table(d)), Some(Value::Table(l))) => self.walk_tables(d, l, &path),
                (Some(d), Some(l)) => self.compare_leaf(d, l, &path),
                (Some(d), None) => {
                    for (p, v) in leaf_paths(d, &path) {
                        self.new_default_only.push(KeyValue { path: p, value: v });
                    }
                }
                (None, Some(l)) => {
                    for (p, v) in leaf_paths(l, &path) {
                        if !is_optional_key(&p) {
                            self.stale_local_only.push(KeyValue {
                                path: p.clone(),
                                value: v.clone(),
                            });
                        }
                        self.added_local_only.push(KeyValue { path: p, value: v });
                    }
                }
                (None, None) => {}
            }
        }
    }

    fn compare_leaf(&mut self, d: &Value, l: &Value, path: &str) {
        if d != l {
            let is_list = matches!(d, Value::Array(_)) || matches!(l, Value::Array(_));
            self.overrides.push(OverrideEntry {
                path: path.to_string(),
                label: if is_list { "changed(list)" } else { "changed" },
                from: d.clone(),
                to: l.clone(),
            });
        }
        if d.type_str() != l.type_str() {
            self.type_warnings.push(TypeWarning {
                path: path.to_string(),
                default_type: d.type_str(),
                local_type: l.type_str(),
            });
        }
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let overrides: Vec<String> = self
            .overrides
            .iter()
            .map(|o| format!("{}: {}: {} -> {}", o.label, o.path, o.from, o.to))
            .collect();
        push_section(&mut out, "Overrides report", &overrides);
        let added: Vec<String> = self
            .added_local_only
            .iter()
            .map(|kv| format!("added(local-only): {} = {}", kv.path, kv.value))
            .collect();
        push_section(&mut out, "Added local-only keys", &added);
        let fresh: Vec<String> = self
            .new_default_only
            .iter()
            .map(|kv| format!("new(default-only): {} = {}", kv.path, kv.value))
            .collect();
        push_section(&mut out, "New keys in default", &fresh);
        let stale: Vec<String> = self
            .stale_local_only
            .iter()
            .map(|kv| format!("WARNING stale(local): {} = {}", kv.path, kv.value))
            .collect();
        push_section(&mut out, "Stale local keys", &stale);
        let types: Vec<String> = self
            .type_warnings
            .iter()
            .map(|w| {
                format!(
                    "WARNING type-mismatch: {} default={} local={}",
                    w.path, w.default_type, w.local_type
                )
            })
            .collect();
        push_section(&mut out, "Type compatibility warnings", &types);
        out.push_str("\nEffective config:\n");
        out.push_str(&toml::to_string(&self.effective_config).unwrap_or_default());
        out
    }
}

fn push_section(out: &mut String, title: &str, lines: &[String]) {
    out.push_str(title);
    out.push_str(":\n");
    if lines.is_empty() {
        out.push_str("  (none)\n");
    }
    for line in lines {
        out.push_str("  ");
        out.push_str(line);
        out.push('\n');
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn leaf_paths(value: &Value, path: &str) -> Vec<(String, Value)> {
    match value {
        Value::Table(t) if !t.is_empty() => t
            .iter()
            .flat_map(|(k, v)| leaf_paths(v, &join_path(path, k)))
            .collect(),
        other => vec![(path.to_string(), other.clone())],
    }
}

fn is_optional_key(path: &str) -> bool {
    OPTIONAL_KEYS.iter().any(|k| match k.strip_suffix(".*") {
        Some(prefix) => path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.')),
        None => *k == path,
    })
}

/// Built-in defaults; also the file written by `--init-config`.
pub const DEFAULT_CONFIG_TOML: &str = r###"[pipeline]
lang = "en"
# format = "txt"        # txt | srt; by file extension when unset
content_mode = "normal" # normal | strict | creative
include_timecodes_in_headings = true
highlight_asides_style = "italic" # italic | blockquote
suppress_edit_comments = true
append_summary = true
summary_heading = "## Non-authorial AI generated summary"
failed_fragment_policy = "raw" # raw | omit
log_level = "info"
trace_dir = "_trace"
trace_prompts = false
write_partial = true

[chunking]
chunk_chars = 6500
overlap_chars = 500

[context]
use_context_overlap = true
source = "raw" # raw | cleaned | none
# max_chars = 500   # defaults to chunking.overlap_chars
sentence_delimiters = ".!?…"

[stitch]
# dedup_window_chars = 500   # defaults to chunking.overlap_chars; 0 disables

[retry]
attempts = 3
pause_seconds = 2.0
request_delay_seconds = 0.0

[llm]
provider = "openai" # openai | gemini | dummy

[llm.openai]
model = "gpt-5.1"
temperature = 1.0
timeout_seconds = 300.0

[llm.gemini]
model = "gemini-1.5-pro"
temperature = 1.0
timeout_seconds = 300.0

[llm.dummy]
model = "dummy"

[prompts]
system_normal = "prompts/system_normal.md"
system_strict = "prompts/system_strict.md"
system_creative = "prompts/system_creative.md"
user_template = "prompts/user_template.md"
summary = "prompts/summary_prompt.md"

[parasites]
en = "parasites/en.txt"
"###;

#[cfg(test)]
mod tests {
    use super::*;

    fn table(text: &str) -> Table {
        text.parse().unwrap()
    }

    #[test]
    fn built_in_defaults_parse() {
        let cfg = config_from_table(default_table().unwrap()).unwrap();
        assert_eq!(cfg.chunking.chunk_chars, Some(6500));
        assert_eq!(cfg.chunking.overlap_chars, Some(500));
        assert_eq!(cfg.retry.attempts, Some(3));
        assert_eq!(cfg.llm.provider.as_deref(), Some("openai"));
        assert_eq!(cfg.context.max_chars, None);
        assert_eq!(
            cfg.pipeline.summary_heading.as_deref(),
            Some("## Non-authorial AI generated summary")
        );
        assert_eq!(cfg.parasites.get("en").map(String::as_str), Some("parasites/en.txt"));
    }

    #[test]
    fn deep_merge_recurses_into_tables_only() {
        let mut base = table("[a]\nx = 1\ny = [1, 2]\n[b]\nz = \"keep\"\n");
        deep_merge(&mut base, table("[a]\nx = 2\ny = [3]\n"));
        assert_eq!(base["a"]["x"].as_integer(), Some(2));
        assert_eq!(base["a"]["y"].as_array().map(Vec::len), Some(1));
        assert_eq!(base["b"]["z"].as_str(), Some("keep"));
    }

    #[test]
    fn set_overrides_parse_toml_then_fall_back_to_string() {
        let mut t = Table::new();
        apply_override(&mut t, "chunking.chunk_chars=4000").unwrap();
        apply_override(&mut t, "pipeline.lang = ru").unwrap();
        apply_override(&mut t, "pipeline.trace_prompts=true").unwrap();
        apply_override(&mut t, "pipeline.summary_heading=\"## Summary\"").unwrap();
        assert_eq!(t["chunking"]["chunk_chars"].as_integer(), Some(4000));
        assert_eq!(t["pipeline"]["lang"].as_str(), Some("ru"));
        assert_eq!(t["pipeline"]["trace_prompts"].as_bool(), Some(true));
        assert_eq!(t["pipeline"]["summary_heading"].as_str(), Some("## Summary"));
    }

    #[test]
    fn set_rejects_malformed_assignments() {
        let mut t = table("[pipeline]\nlang = \"en\"\n");
        assert!(apply_override(&mut t, "novalue").is_err());
        assert!(apply_override(&mut t, "a..b=1").is_err());
        let err = apply_override(&mut t, "pipeline.lang.x=1").unwrap_err();
        assert!(err.to_string().contains("pipeline.lang"));
    }

    #[test]
    fn local_overlay_sits_beside_the_main_file() {
        assert_eq!(
            local_overlay_path(Path::new("/etc/lp/lecture-pipeline.toml")),
            PathBuf::from("/etc/lp/lecture-pipeline.local.toml")
        );
    }

    #[test]
    fn layered_load_applies_overlay_then_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join(DEFAULT_CONFIG_FILENAME);
        std::fs::write(&main, "[chunking]\nchunk_chars = 3000\noverlap_chars = 200\n").unwrap();
        std::fs::write(
            dir.path().join("lecture-pipeline.local.toml"),
            "[chunking]\noverlap_chars = 100\n",
        )
        .unwrap();
        let loaded = load_layered(
            Some(&main),
            dir.path(),
            &["chunking.chunk_chars=2500".to_string()],
        )
        .unwrap();
        assert!(loaded.file_found);
        assert!(loaded.local_path.is_some());
        assert_eq!(loaded.config.chunking.chunk_chars, Some(2500));
        assert_eq!(loaded.config.chunking.overlap_chars, Some(100));
    }

    #[test]
    fn explicit_missing_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_layered(Some(&dir.path().join("nope.toml")), dir.path(), &[]).is_err());
    }

    #[test]
    fn doctor_reports_overrides_stale_keys_and_type_mismatches() {
        let defaults = table("[retry]\nattempts = 3\npause_seconds = 2.0\n[chunking]\nchunk_chars = 6500\n");
        let local = table(
            "[retry]\nattempts = 5\npause_seconds = 2\nbogus = 1\n[context]\nmax_chars = 300\n",
        );
        let report = DoctorReport::build(&defaults, Some(&local));
        assert_eq!(report.overrides.len(), 2);
        assert_eq!(report.overrides[0].path, "retry.attempts");
        assert_eq!(report.new_default_only[0].path, "chunking.chunk_chars");
        assert_eq!(report.added_local_only.len(), 2);
        assert_eq!(report.stale_local_only.len(), 1);
        assert_eq!(report.stale_local_only[0].path, "retry.bogus");
        assert_eq!(report.type_warnings[0].default_type, "float");
        assert_eq!(report.type_warnings[0].local_type, "integer");
        assert_eq!(report.warn_count(), 2);
        assert_eq!(report.effective_config["retry"]["attempts"].as_integer(), Some(5));

        let text = report.render_text();
        assert!(text.contains("changed: retry.attempts: 3 -> 5"));
        assert!(text.contains("WARNING stale(local): retry.bogus = 1"));
        assert!(text.contains("WARNING type-mismatch: retry.pause_seconds default=float local=integer"));
    }

    #[test]
    fn doctor_without_local_config_is_clean() {
        let report = DoctorReport::build(&table("[a]\nx = 1\n"), None);
        assert!(!report.has_local_config);
        assert_eq!(report.warn_count(), 0);
        assert!(report.render_text().contains("Overrides report:\n  (none)"));
    }
}
