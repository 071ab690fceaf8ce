/// Log replay: split a run log back into its stdout and stderr halves.
///
/// A line counts as an error when it carries the error marker written by the
/// log writer, or when it matches one of the caller's extra patterns.
use regex::Regex;
use std::io::{BufRead, Write};
use std::sync::LazyLock;

/// Separator between extra patterns on the command line.
pub const PATTERN_DELIMITER: &str = "[{|}]";

static MARKER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\[[0-9]{4}-[0-9]{2}-[0-9]{2} [0-9]{2}:[0-9]{2}:[0-9]{2}\] EASY_EXEC_ERROR: (.*)",
    )
    .unwrap()
});

/// Split a delimited pattern list and compile each non-blank piece.
pub fn parse_patterns(input: &str) -> Result<Vec<Regex>, regex::Error> {
    input
        .split(PATTERN_DELIMITER)
        .filter(|piece| !piece.trim().is_empty())
        .map(Regex::new)
        .collect()
}

pub struct LogClassifier {
    extra: Vec<Regex>,
}

/// Line counts from one replay.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySummary {
    pub lines: usize,
    pub error_lines: usize,
}

impl LogClassifier {
    pub fn new(extra: Vec<Regex>) -> Self {
        Self { extra }
    }

    pub fn is_error(&self, line: &str) -> bool {
        if MARKER_PATTERN.is_match(line) {
            return true;
        }
        self.extra.iter().any(|pattern| {
            let hit = pattern.is_match(line);
            if hit {
                tracing::debug!(pattern = %pattern, "extra error pattern matched");
            }
            hit
        })
    }

    /// Copy every line of `log` to `err` when it is an error line, to `out`
    /// otherwise. Lines are written unchanged.
    pub fn replay<R: BufRead, O: Write, E: Write>(
        &self,
        log: R,
        out: &mut O,
        err: &mut E,
    ) -> std::io::Result<ReplaySummary> {
        let mut summary = ReplaySummary::default();
        for line in log.lines() {
            let line = line?;
            summary.lines += 1;
            if self.is_error(&line) {
                summary.error_lines += 1;
                writeln!(err, "{line}")?;
            } else {
                writeln!(out, "{line}")?;
            }
        }
        out.flush()?;
        err.flush()?;
        Ok(summary)
    }
}
