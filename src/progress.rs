use std::io::{self, Write};
use std::time::Instant;

/// Human-facing progress lines on stderr, prefixed with elapsed time.
pub struct ConsoleProgress {
    enabled: bool,
    t0: Instant,
}

impl ConsoleProgress {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            t0: Instant::now(),
        }
    }

    pub fn info(&self, msg: impl AsRef<str>) {
        if !self.enabled {
            return;
        }
        let ts = fmt_elapsed(self.t0.elapsed().as_secs_f64());
        let mut stderr = io::stderr().lock();
        let _ = writeln!(stderr, "[{ts}] {}", msg.as_ref());
    }

    /// `[3/10] OK | done: 3, failed: 0, left: 7`
    pub fn fragment_done(&self, index: usize, total: usize, ok: bool, done: usize, failed: usize) {
        self.info(fragment_line(index, total, ok, done, failed));
    }
}

fn fragment_line(index: usize, total: usize, ok: bool, done: usize, failed: usize) -> String {
    let status = if ok { "OK" } else { "FAILED" };
    let left = total.saturating_sub(index);
    format!("[{index}/{total}] {status} | done: {done}, failed: {failed}, left: {left}")
}

fn fmt_elapsed(seconds: f64) -> String {
    let seconds = seconds.max(0.0) as u64;
    let h = seconds / 3600;
    let m = (seconds % 3600) / 60;
    let s = seconds % 60;
    if h > 0 {
        format!("{h:02}:{m:02}:{s:02}")
    } else {
        format!("{m:02}:{s:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_status_line() {
        assert_eq!(
            fragment_line(3, 10, true, 3, 0),
            "[3/10] OK | done: 3, failed: 0, left: 7"
        );
        assert_eq!(
            fragment_line(2, 2, false, 1, 1),
            "[2/2] FAILED | done: 1, failed: 1, left: 0"
        );
    }

    #[test]
    fn elapsed_formatting() {
        assert_eq!(fmt_elapsed(65.0), "01:05");
        assert_eq!(fmt_elapsed(3725.0), "01:02:05");
    }
}
