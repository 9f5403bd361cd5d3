use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};

use crate::config::PromptsSection;
use crate::error::PipelineError;

pub const DEFAULT_PROMPTS_DIR: &str = "prompts";

pub const DEFAULT_SYSTEM_NORMAL: &str = "system_normal.md";
pub const DEFAULT_SYSTEM_STRICT: &str = "system_strict.md";
pub const DEFAULT_SYSTEM_CREATIVE: &str = "system_creative.md";
pub const DEFAULT_USER_TEMPLATE: &str = "user_template.md";
pub const DEFAULT_SUMMARY: &str = "summary_prompt.md";

/// Selects the system prompt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentMode {
    Normal,
    Strict,
    Creative,
}

impl ContentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentMode::Normal => "normal",
            ContentMode::Strict => "strict",
            ContentMode::Creative => "creative",
        }
    }
}

impl std::str::FromStr for ContentMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "normal" => Ok(ContentMode::Normal),
            "strict" => Ok(ContentMode::Strict),
            "creative" => Ok(ContentMode::Creative),
            other => Err(PipelineError::config(
                "pipeline.content_mode",
                format!("unknown mode {other:?} (expected normal, strict or creative)"),
            )),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PromptCatalog {
    pub system: String,
    pub user_template: String,
    pub summary: String,
}

impl PromptCatalog {
    pub fn load(config_dir: &Path, p: &PromptsSection, mode: ContentMode) -> anyhow::Result<Self> {
        let (system_key, system_path, system_file, system_text) = match mode {
            ContentMode::Normal => (
                "system_normal",
                &p.system_normal,
                DEFAULT_SYSTEM_NORMAL,
                DEFAULT_SYSTEM_NORMAL_TEXT,
            ),
            ContentMode::Strict => (
                "system_strict",
                &p.system_strict,
                DEFAULT_SYSTEM_STRICT,
                DEFAULT_SYSTEM_STRICT_TEXT,
            ),
            ContentMode::Creative => (
                "system_creative",
                &p.system_creative,
                DEFAULT_SYSTEM_CREATIVE,
                DEFAULT_SYSTEM_CREATIVE_TEXT,
            ),
        };
        Ok(Self {
            system: read_prompt(config_dir, system_key, system_path.as_deref(), system_file, system_text)?,
            user_template: read_prompt(
                config_dir,
                "user_template",
                p.user_template.as_deref(),
                DEFAULT_USER_TEMPLATE,
                DEFAULT_USER_TEMPLATE_TEXT,
            )?,
            summary: read_prompt(
                config_dir,
                "summary",
                p.summary.as_deref(),
                DEFAULT_SUMMARY,
                DEFAULT_SUMMARY_TEXT,
            )?,
        })
    }
}

/// A configured path must exist; an unconfigured prompt falls back to
/// `prompts/<file>` beside the config, then to the built-in text.
fn read_prompt(
    config_dir: &Path,
    key: &str,
    configured: Option<&str>,
    default_filename: &str,
    built_in: &str,
) -> anyhow::Result<String> {
    let configured = configured.map(str::trim).filter(|s| !s.is_empty());
    let rel = configured
        .map(PathBuf::from)
        .unwrap_or_else(|| Path::new(DEFAULT_PROMPTS_DIR).join(default_filename));
    let p = if rel.is_relative() { config_dir.join(&rel) } else { rel };
    if !p.exists() {
        if configured.is_some() {
            return Err(anyhow!(
                "prompt file not found for {key}: {} (run: lecture-pipeline --init-config)",
                p.display()
            ));
        }
        log::debug!("prompt {key}: built-in");
        return Ok(built_in.to_string());
    }
    let text = std::fs::read_to_string(&p).with_context(|| format!("read prompt: {}", p.display()))?;
    log::debug!("prompt {key}: {}", p.display());
    Ok(text)
}

pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (k, v) in vars {
        let pat = format!("{{{{{k}}}}}");
        out = out.replace(&pat, v);
    }
    out
}

/// Prompt wording for `highlight_asides_style`.
pub fn aside_style_label(style: &str) -> &'static str {
    match style.trim().to_ascii_lowercase().as_str() {
        "blockquote" | "quote" => "blockquote (> ...)",
        _ => "italics (*...*)",
    }
}

/// Values substituted into the user template for one fragment.
pub struct FragmentPrompt<'a> {
    pub lang: &'a str,
    pub parasites: &'a [String],
    pub glossary: &'a [String],
    pub aside_style: &'a str,
    pub fragment: &'a str,
    pub context: &'a str,
    pub term_hints: &'a str,
}

impl FragmentPrompt<'_> {
    pub fn render(&self, template: &str) -> String {
        let parasites = self.parasites.join(", ");
        let glossary = if self.glossary.is_empty() {
            "—".to_string()
        } else {
            self.glossary.join(", ")
        };
        render_template(
            template,
            &[
                ("LANG", self.lang),
                ("PARASITES", &parasites),
                ("GLOSSARY_OR_DASH", &glossary),
                ("ASIDE_STYLE", aside_style_label(self.aside_style)),
                ("CHUNK_TEXT", self.fragment),
                ("CONTEXT_TEXT", self.context),
                ("TERM_HINTS", self.term_hints),
            ],
        )
    }
}

pub fn summary_user_prompt(summary_prompt: &str, document: &str) -> String {
    format!("{summary_prompt}\n\n<<<\n{document}\n>>>")
}

pub fn default_prompt_files() -> Vec<(&'static str, &'static str)> {
    vec![
        (DEFAULT_SYSTEM_NORMAL, DEFAULT_SYSTEM_NORMAL_TEXT),
        (DEFAULT_SYSTEM_STRICT, DEFAULT_SYSTEM_STRICT_TEXT),
        (DEFAULT_SYSTEM_CREATIVE, DEFAULT_SYSTEM_CREATIVE_TEXT),
        (DEFAULT_USER_TEMPLATE, DEFAULT_USER_TEMPLATE_TEXT),
        (DEFAULT_SUMMARY, DEFAULT_SUMMARY_TEXT),
    ]
}

pub const DEFAULT_SYSTEM_NORMAL_TEXT: &str = r#"You are an editor who turns raw lecture transcripts into clean, readable Markdown.

Rules:
- Keep the speaker's meaning, order of ideas and technical detail.
- Remove filler words, false starts and verbal tics; fix punctuation and casing.
- Split the text into paragraphs; add `#`/`##` headings only where the topic clearly changes.
- Do NOT summarize and do NOT add facts that are not in the transcript.
- Output ONLY the edited Markdown."#;

pub const DEFAULT_SYSTEM_STRICT_TEXT: &str = r#"You are a conservative transcript editor.

Rules:
- Change as little as possible: remove filler words and fix punctuation only.
- Never reorder, merge or drop sentences.
- Never add headings, lists or explanations.
- Output ONLY the edited text."#;

pub const DEFAULT_SYSTEM_CREATIVE_TEXT: &str = r#"You are an editor who turns lecture transcripts into well-structured study notes in Markdown.

Rules:
- Keep every idea, example and technical detail from the transcript.
- You may rephrase freely for clarity, reorder sentences within a paragraph and add headings, lists and emphasis.
- Do NOT invent facts.
- Output ONLY the Markdown."#;

pub const DEFAULT_USER_TEMPLATE_TEXT: &str = r#"Edit the transcript fragment below. Output language: {{LANG}}.

Filler words to remove: {{PARASITES}}
Glossary (keep spelling exactly): {{GLOSSARY_OR_DASH}}
Mark digressions and asides with {{ASIDE_STYLE}}.

When you unify several spellings of the same term, record it in one HTML comment:
<!-- merged terms: {"canonical": ["variant", ...]} -->

Terms already unified earlier (reuse these spellings):
{{TERM_HINTS}}

Preceding context (for continuity only, do NOT output it):
<<<
{{CONTEXT_TEXT}}
>>>

Fragment to edit:
<<<
{{CHUNK_TEXT}}
>>>"#;

pub const DEFAULT_SUMMARY_TEXT: &str = r#"Write a concise summary of the lecture below in the same language as the text.
Use a short bullet list of the key ideas, then one paragraph of conclusions.
Output ONLY the summary in Markdown, without a heading."#;
