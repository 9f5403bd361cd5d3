use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use lecture_pipeline::config::load_layered;
use lecture_pipeline::error::RewriteError;
use lecture_pipeline::models::{ModelParams, RewriteBackend};
use lecture_pipeline::pipeline::{CliOverrides, PipelineConfig, RewriterPipeline, RunStatus};
use lecture_pipeline::progress::ConsoleProgress;

type Responder = Box<dyn FnMut(usize, &str) -> Result<String, RewriteError>>;

/// In-memory backend: records every user prompt and answers through a closure that gets
/// the 1-based call number and the prompt.
struct ScriptedBackend {
    prompts: Rc<RefCell<Vec<String>>>,
    respond: Responder,
}

impl RewriteBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn rewrite(&mut self, _system: &str, user: &str, _params: &ModelParams) -> Result<String, RewriteError> {
        self.prompts.borrow_mut().push(user.to_string());
        let n = self.prompts.borrow().len();
        (self.respond)(n, user)
    }
}

const USER_TEMPLATE: &str = "CTX<<{{CONTEXT_TEXT}}>>\nHINTS<<{{TERM_HINTS}}>>\nFRAG<<{{CHUNK_TEXT}}>>";

fn between<'a>(text: &'a str, open: &str, close: &str) -> &'a str {
    let start = text.find(open).map(|i| i + open.len()).unwrap_or(0);
    let end = text[start..].find(close).map(|i| start + i).unwrap_or(text.len());
    &text[start..end]
}

fn fragment_of(prompt: &str) -> &str {
    between(prompt, "FRAG<<", ">>")
}

fn is_summary(prompt: &str) -> bool {
    prompt.starts_with("SUMMARIZE")
}

struct Fixture {
    dir: tempfile::TempDir,
    input: PathBuf,
}

impl Fixture {
    fn new(input_name: &str, transcript: &str, extra_config: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("prompts")).unwrap();
        fs::write(dir.path().join("prompts/user.md"), USER_TEMPLATE).unwrap();
        fs::write(dir.path().join("prompts/summary.md"), "SUMMARIZE").unwrap();
        let config = format!(
            "[pipeline]\nappend_summary = true\n\n[chunking]\nchunk_chars = 50\noverlap_chars = 0\n\n\
             [context]\nmax_chars = 100\n\n[stitch]\ndedup_window_chars = 200\n\n\
             [retry]\nattempts = 3\npause_seconds = 0.0\n\n\
             [prompts]\nuser_template = \"prompts/user.md\"\nsummary = \"prompts/summary.md\"\n\n{extra_config}"
        );
        fs::write(dir.path().join("lecture-pipeline.toml"), config).unwrap();
        let input = dir.path().join(input_name);
        fs::write(&input, transcript).unwrap();
        Self { dir, input }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn config(&self, set: &[&str]) -> PipelineConfig {
        let set: Vec<String> = set.iter().map(|s| s.to_string()).collect();
        let layered = load_layered(Some(&self.path().join("lecture-pipeline.toml")), self.path(), &set).unwrap();
        PipelineConfig::from_paths_and_args(&self.input, &layered, &CliOverrides::default()).unwrap()
    }

    fn pipeline(&self, set: &[&str], respond: Responder) -> (RewriterPipeline, Rc<RefCell<Vec<String>>>) {
        let prompts = Rc::new(RefCell::new(Vec::new()));
        let backend = ScriptedBackend {
            prompts: Rc::clone(&prompts),
            respond,
        };
        let pipeline = RewriterPipeline::new(self.config(set), Box::new(backend), ConsoleProgress::new(false))
            .with_sleeper(|_| {});
        (pipeline, prompts)
    }

    fn read(&self, name: &str) -> String {
        fs::read_to_string(self.path().join(name)).unwrap()
    }
}

const THREE_LINES: &str = "first line of the lecture is here\nsecond line goes on and on ok\nthird line closes the talk now\n";

fn echo(_: usize, prompt: &str) -> Result<String, RewriteError> {
    if is_summary(prompt) {
        return Ok("A short recap.".to_string());
    }
    Ok(fragment_of(prompt).to_uppercase())
}

#[test]
fn rewrites_every_fragment_and_writes_outputs() {
    let fx = Fixture::new("talk.txt", THREE_LINES, "");
    let (mut pipeline, prompts) = fx.pipeline(&[], Box::new(echo));
    let report = pipeline.run().unwrap();

    assert_eq!(report.total, 3);
    assert_eq!(report.ok, 3);
    assert_eq!(report.status(), RunStatus::Complete);
    assert!(report.summary_appended);
    assert_eq!(prompts.borrow().len(), 4);

    let md = fx.read("talk.md");
    assert_eq!(
        md,
        "FIRST LINE OF THE LECTURE IS HERE\n\nSECOND LINE GOES ON AND ON OK\n\nTHIRD LINE CLOSES THE TALK NOW\n\n\
         ## Non-authorial AI generated summary\n\nA short recap.\n"
    );
    let qc = fx.read("talk_qc_report.csv");
    let rows: Vec<&str> = qc.lines().collect();
    assert_eq!(rows[0], "chunk_id,start,end,orig_len,cleaned_len,similarity,change_ratio");
    assert_eq!(rows.len(), 4);
    assert!(rows[1].starts_with("1,,,33,33,"));
    assert!(!fx.path().join("talk.partial.md").exists());
}

#[test]
fn context_comes_from_the_previous_raw_fragment() {
    let fx = Fixture::new("talk.txt", THREE_LINES, "");
    let (mut pipeline, prompts) = fx.pipeline(&["pipeline.append_summary=false"], Box::new(echo));
    pipeline.run().unwrap();

    let prompts = prompts.borrow();
    assert_eq!(between(&prompts[0], "CTX<<", ">>"), "");
    assert_eq!(between(&prompts[1], "CTX<<", ">>"), "first line of the lecture is here");
    assert_eq!(between(&prompts[2], "CTX<<", ">>"), "second line goes on and on ok");
    assert_eq!(fragment_of(&prompts[2]), "third line closes the talk now");
}

#[test]
fn cleaned_context_uses_the_rewritten_text() {
    let fx = Fixture::new("talk.txt", THREE_LINES, "");
    let (mut pipeline, prompts) = fx.pipeline(
        &["pipeline.append_summary=false", "context.source=cleaned"],
        Box::new(echo),
    );
    pipeline.run().unwrap();
    assert_eq!(
        between(&prompts.borrow()[1], "CTX<<", ">>"),
        "FIRST LINE OF THE LECTURE IS HERE"
    );
}

#[test]
fn repeated_boundary_lines_are_stitched_once() {
    let fx = Fixture::new("talk.txt", THREE_LINES, "");
    let respond = |n: usize, _: &str| -> Result<String, RewriteError> {
        Ok(match n {
            1 => "Intro.\nShared sentence.".to_string(),
            2 => "Shared sentence.\nMiddle part.".to_string(),
            _ => "Middle part.\nEnding.".to_string(),
        })
    };
    let (mut pipeline, _) = fx.pipeline(&["pipeline.append_summary=false"], Box::new(respond));
    pipeline.run().unwrap();
    assert_eq!(
        fx.read("talk.md"),
        "Intro.\nShared sentence.\n\nMiddle part.\n\nEnding.\n"
    );
}

#[test]
fn term_merges_feed_forward_and_comments_are_stripped() {
    let fx = Fixture::new("talk.txt", THREE_LINES, "");
    let respond = |n: usize, prompt: &str| -> Result<String, RewriteError> {
        Ok(match n {
            1 => "Kubernetes intro.\n<!-- merged terms: {\"Kubernetes\": [\"kubernetis\"]} -->".to_string(),
            _ => fragment_of(prompt).to_string(),
        })
    };
    let (mut pipeline, prompts) = fx.pipeline(&["pipeline.append_summary=false"], Box::new(respond));
    pipeline.run().unwrap();

    let prompts = prompts.borrow();
    assert_eq!(between(&prompts[0], "HINTS<<", ">>"), "");
    assert_eq!(
        between(&prompts[1], "HINTS<<", ">>"),
        "{\"Kubernetes\":[\"kubernetis\"]}"
    );
    assert!(!fx.read("talk.md").contains("<!--"));
}

#[test]
fn edit_comments_survive_when_not_suppressed() {
    let fx = Fixture::new("talk.txt", THREE_LINES, "");
    let respond = |_: usize, prompt: &str| -> Result<String, RewriteError> {
        Ok(format!("{}\n<!-- edited -->", fragment_of(prompt)))
    };
    let (mut pipeline, _) = fx.pipeline(
        &["pipeline.append_summary=false", "pipeline.suppress_edit_comments=false"],
        Box::new(respond),
    );
    pipeline.run().unwrap();
    assert_eq!(fx.read("talk.md").matches("<!-- edited -->").count(), 3);
}

#[test]
fn transient_errors_retry_and_auth_failures_keep_the_raw_fragment() {
    let fx = Fixture::new("talk.txt", THREE_LINES, "");
    let respond = |n: usize, prompt: &str| -> Result<String, RewriteError> {
        match n {
            1 => Err(RewriteError::RateLimit("429 please retry in 0s".into())),
            2 => Ok("   ".to_string()),
            3 => Ok(fragment_of(prompt).to_string()),
            4 => Err(RewriteError::Auth("HTTP 401".into())),
            _ => Ok(fragment_of(prompt).to_string()),
        }
    };
    let (mut pipeline, prompts) = fx.pipeline(&["pipeline.append_summary=false"], Box::new(respond));
    let report = pipeline.run().unwrap();

    assert_eq!(prompts.borrow().len(), 5);
    assert_eq!(report.ok, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.status(), RunStatus::Partial);
    assert_eq!(report.status().exit_code(), 3);
    assert_eq!(report.failures[0].fragment_id, 2);
    assert!(matches!(report.failures[0].error, RewriteError::Auth(_)));
    assert_eq!(fx.read("talk.md"), THREE_LINES.replace('\n', "\n\n").trim_end().to_string() + "\n");

    let qc = fx.read("talk_qc_report.csv");
    assert!(qc.lines().nth(2).unwrap().starts_with("2,,,29,0,0.0,1.0"));
}

#[test]
fn lost_trace_dir_does_not_abort_the_document() {
    let fx = Fixture::new("talk.txt", THREE_LINES, "");
    let trace_dir = fx.path().join("_trace");
    let respond = move |n: usize, prompt: &str| -> Result<String, RewriteError> {
        if n == 1 {
            fs::remove_dir_all(&trace_dir).unwrap();
        }
        echo(n, prompt)
    };
    let (mut pipeline, _) = fx.pipeline(
        &["pipeline.trace_prompts=true", "pipeline.append_summary=false"],
        Box::new(respond),
    );
    let report = pipeline.run().unwrap();

    assert_eq!(report.ok, 3);
    assert_eq!(report.status(), RunStatus::Complete);
    assert!(fx.read("talk.md").starts_with("FIRST LINE OF THE LECTURE IS HERE"));
    assert!(!fx.path().join("_trace").exists());
}

#[test]
fn omitted_failures_leave_no_block() {
    let fx = Fixture::new("talk.txt", THREE_LINES, "");
    let respond = |n: usize, prompt: &str| -> Result<String, RewriteError> {
        if n == 2 {
            Err(RewriteError::Unknown("HTTP 400".into()))
        } else {
            Ok(fragment_of(prompt).to_string())
        }
    };
    let (mut pipeline, _) = fx.pipeline(
        &["pipeline.append_summary=false", "pipeline.failed_fragment_policy=omit"],
        Box::new(respond),
    );
    let report = pipeline.run().unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(
        fx.read("talk.md"),
        "first line of the lecture is here\n\nthird line closes the talk now\n"
    );
}

#[test]
fn every_fragment_failing_is_a_total_failure() {
    let fx = Fixture::new("talk.txt", THREE_LINES, "");
    let respond = |_: usize, _: &str| -> Result<String, RewriteError> {
        Err(RewriteError::Connection("connection refused".into()))
    };
    let (mut pipeline, prompts) = fx.pipeline(&[], Box::new(respond));
    let report = pipeline.run().unwrap();
    assert_eq!(report.status(), RunStatus::Failed);
    assert_eq!(report.status().exit_code(), 4);
    assert!(!report.summary_appended);
    // three attempts per fragment, no summary call
    assert_eq!(prompts.borrow().len(), 9);
}

#[test]
fn headings_get_timecodes_from_the_fragment_start() {
    let transcript = "[00:01:05] welcome to the course on systems\n[00:02:10] today we talk about caches\n";
    let fx = Fixture::new("talk.txt", transcript, "");
    let respond = |n: usize, prompt: &str| -> Result<String, RewriteError> {
        Ok(format!("# Part {n}\n{}", fragment_of(prompt)))
    };
    let (mut pipeline, _) = fx.pipeline(&["pipeline.append_summary=false"], Box::new(respond));
    pipeline.run().unwrap();
    let md = fx.read("talk.md");
    assert!(md.contains("# Part 1 — [00:01:05](#t=00:01:05)"));
    assert!(md.contains("# Part 2 — [00:02:10](#t=00:02:10)"));
    let qc = fx.read("talk_qc_report.csv");
    assert!(qc.lines().nth(1).unwrap().starts_with("1,65.0,65.0,"));
}

#[test]
fn srt_input_is_deduplicated_before_chunking() {
    let srt = "1\n00:00:01,000 --> 00:00:03,000\nhello there\n\n2\n00:00:03,000 --> 00:00:05,000\nhello there\n\n3\n00:00:05,000 --> 00:00:07,000\ngeneral kenobi\n";
    let fx = Fixture::new("clip.srt", srt, "");
    let (mut pipeline, prompts) = fx.pipeline(
        &["pipeline.append_summary=false", "chunking.chunk_chars=200"],
        Box::new(echo),
    );
    let report = pipeline.run().unwrap();
    assert_eq!(report.total, 1);
    assert_eq!(fragment_of(&prompts.borrow()[0]), "hello there\ngeneral kenobi");
    assert_eq!(fx.read("clip.md"), "HELLO THERE\nGENERAL KENOBI\n");
}

#[test]
fn empty_input_is_rejected() {
    let fx = Fixture::new("talk.txt", "  \n\n", "");
    let (mut pipeline, prompts) = fx.pipeline(&[], Box::new(echo));
    let err = pipeline.run().unwrap_err();
    assert!(err.to_string().contains("empty"));
    assert!(prompts.borrow().is_empty());
}

#[test]
fn request_delay_paces_every_fragment_after_the_first() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static SLEEPS: AtomicUsize = AtomicUsize::new(0);

    let fx = Fixture::new("talk.txt", THREE_LINES, "");
    let prompts = Rc::new(RefCell::new(Vec::new()));
    let backend = ScriptedBackend {
        prompts: Rc::clone(&prompts),
        respond: Box::new(echo),
    };
    let cfg = fx.config(&["pipeline.append_summary=false", "retry.request_delay_seconds=0.5"]);
    let mut pipeline = RewriterPipeline::new(cfg, Box::new(backend), ConsoleProgress::new(false))
        .with_sleeper(|_| {
            SLEEPS.fetch_add(1, Ordering::SeqCst);
        });
    pipeline.run().unwrap();
    assert_eq!(SLEEPS.load(Ordering::SeqCst), 2);
}
