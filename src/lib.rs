//! Lecture transcript rewriting: bounded fragments, carried context, stitched output.

pub mod chunker;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod quality;
pub mod retry;
pub mod split;
pub mod stitch;
pub mod terminology;
pub mod textutil;
pub mod transcript;
