use std::{
    fmt::Display,
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
};

use futures::Stream;
use regex::Regex;
use serde::Serialize;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl Display for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub line: String,
}

/// Output of one execution, filled line by line while the process runs.
///
/// Clones share the same lines.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    state: Arc<Mutex<BufferState>>,
    changed: Arc<Notify>,
}

#[derive(Debug, Default)]
struct BufferState {
    lines: Vec<OutputLine>,
    finished: bool,
}

impl OutputBuffer {
    fn state(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn push(&self, stream: OutputStream, line: String) {
        self.state().lines.push(OutputLine { stream, line });
        self.changed.notify_waiters();
    }

    pub(crate) fn finish(&self) {
        self.state().finished = true;
        self.changed.notify_waiters();
    }

    /// Whether the process has ended and no more lines will arrive.
    pub fn is_finished(&self) -> bool {
        self.state().finished
    }

    pub fn lines(&self) -> Vec<OutputLine> {
        self.state().lines.clone()
    }

    pub fn len(&self) -> usize {
        self.state().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lines from `offset` on, and whether the buffer is finished.
    pub fn lines_since(&self, offset: usize) -> (Vec<OutputLine>, bool) {
        let state = self.state();
        let lines = state.lines.get(offset..).unwrap_or_default().to_vec();
        (lines, state.finished)
    }

    /// All lines of one stream joined by newlines.
    pub fn text(&self, stream: OutputStream) -> String {
        self.state()
            .lines
            .iter()
            .filter(|line| line.stream == stream)
            .map(|line| line.line.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Every line already written followed by new ones as they arrive, ending once the
    /// buffer is finished.
    pub fn follow(&self) -> impl Stream<Item = OutputLine> + Send + 'static {
        let buffer = self.clone();
        async_stream::stream! {
            let mut offset = 0;
            loop {
                let changed = buffer.changed.notified();
                let (lines, finished) = buffer.lines_since(offset);
                offset += lines.len();
                for line in lines {
                    yield line;
                }
                if finished {
                    break;
                }
                changed.await;
            }
        }
    }
}

// Explicit totals come first; incidental counts are only used when no total is printed.
const RECORD_PATTERNS: [&str; 4] = [
    r"(?i)\btotal(?:\s+records)?\s*[:=]\s*([\d,]+)",
    r"(?i)\b(?:records[_ ]processed|total[_ ]records)\s*[:=]\s*([\d,]+)",
    r"(?i)\b(?:processed|synced|loaded|inserted|upserted|wrote)\s+([\d,]+)\s+(?:records|rows)\b",
    r"(?i)\b([\d,]+)\s+(?:records|rows)\b",
];

fn record_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        RECORD_PATTERNS
            .iter()
            .filter_map(|pattern| Regex::new(pattern).ok())
            .collect()
    })
}

/// Extracts a "records processed" count from pipeline output.
///
/// The first pattern with any match decides, and within it the last match wins, so a
/// cumulative total printed at the end of a run takes precedence over progress lines.
pub fn parse_records_processed(output: &str) -> Option<u64> {
    record_patterns().iter().find_map(|pattern| {
        pattern
            .captures_iter(output)
            .filter_map(|captures| {
                let digits = captures
                    .get(1)?
                    .as_str()
                    .chars()
                    .filter(char::is_ascii_digit)
                    .collect::<String>();
                digits.parse::<u64>().ok()
            })
            .last()
    })
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio_stream::StreamExt;

    use super::*;

    #[test]
    fn total_marker_with_thousands_separator() {
        assert_eq!(parse_records_processed("TOTAL: 1,234 records"), Some(1234));
    }

    #[test]
    fn explicit_totals_beat_incidental_counts() {
        let output = "\
fetched 50 records from page 1
fetched 50 records from page 2
records_processed=100
wrote 3 rows to audit log";

        assert_eq!(parse_records_processed(output), Some(100));
    }

    #[test]
    fn last_match_wins() {
        let output = "Processed 10 records\nProcessed 25 records\nProcessed 40 records\n";

        assert_eq!(parse_records_processed(output), Some(40));
    }

    #[test]
    fn no_count_in_output() {
        assert_eq!(parse_records_processed("all done"), None);
        assert_eq!(parse_records_processed(""), None);
    }

    #[test]
    fn text_splits_streams() {
        let buffer = OutputBuffer::default();
        buffer.push(OutputStream::Stdout, "one".to_owned());
        buffer.push(OutputStream::Stderr, "oops".to_owned());
        buffer.push(OutputStream::Stdout, "two".to_owned());

        assert_eq!(buffer.text(OutputStream::Stdout), "one\ntwo");
        assert_eq!(buffer.text(OutputStream::Stderr), "oops");
        assert_eq!(buffer.lines_since(1).0.len(), 2);
        assert!(buffer.lines_since(5).0.is_empty());
    }

    #[tokio::test]
    async fn follow_yields_existing_and_new_lines() {
        let buffer = OutputBuffer::default();
        buffer.push(OutputStream::Stdout, "first".to_owned());

        let follower = tokio::spawn({
            let stream = buffer.follow();
            async move {
                stream
                    .map(|line| line.line)
                    .collect::<Vec<_>>()
                    .await
            }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        buffer.push(OutputStream::Stdout, "second".to_owned());
        buffer.finish();

        assert_eq!(follower.await.unwrap(), vec!["first", "second"]);
    }
}
