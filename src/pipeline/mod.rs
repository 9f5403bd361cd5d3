mod config;
pub mod prompts;
mod rewriter;
mod trace;

pub use config::{init_default_config, load_list, CliOverrides, FailedFragmentPolicy, PipelineConfig};
pub use rewriter::{
    write_atomic, DocumentReport, DocumentState, FragmentFailure, RewriterPipeline, RunStatus,
};
pub use trace::TraceWriter;
