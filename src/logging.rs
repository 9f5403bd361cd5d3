use log::LevelFilter;

const LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

/// Pick the log level: explicit flag, then `--debug`, then the config value, then `info`.
pub fn resolve_level(cli: Option<&str>, debug: bool, configured: Option<&str>) -> String {
    let normalize = |s: &str| {
        let s = s.trim().to_ascii_lowercase();
        let s = if s == "warning" { "warn".to_string() } else { s };
        LEVELS.contains(&s.as_str()).then_some(s)
    };
    if let Some(level) = cli.and_then(normalize) {
        return level;
    }
    if debug {
        return "debug".to_string();
    }
    configured
        .and_then(normalize)
        .unwrap_or_else(|| "info".to_string())
}

/// Install the global logger. `RUST_LOG` wins over `level` when set.
pub fn init_logging(level: &str) {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_target(false)
        .try_init();
}

#[must_use]
pub fn trace_enabled() -> bool {
    log::max_level() >= LevelFilter::Trace
}

/// Log a framed multi-line block at trace level.
pub fn log_trace_block(title: &str, body: &str) {
    if !trace_enabled() {
        return;
    }
    log::trace!("===== {title} BEGIN =====\n{body}\n===== {title} END =====");
}
