//! Operator-visible job trace.
//!
//! Adapters write human-readable progress and command output here. The trace
//! is returned to the queen when the task finishes; it is separate from the
//! process log written through `tracing`.

use std::sync::Mutex;

const MASKED_TEXT: &str = "[****]";
const DEFAULT_BYTES_LIMIT: usize = 4 * 1024 * 1024;

/// Kind of content written to the trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceTag {
    Exec,
    Stdout,
    Stderr,
    Dump,
}

impl TraceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceTag::Exec => "exec",
            TraceTag::Stdout => "stdout",
            TraceTag::Stderr => "stderr",
            TraceTag::Dump => "dump",
        }
    }
}

/// Callback invoked with every completed line and its tag.
pub type LineFeeder = Box<dyn Fn(&str, TraceTag) + Send + Sync>;

pub trait JobTrace: Send + Sync {
    fn write(&self, data: &[u8], tag: TraceTag);

    fn writeln(&self, line: &str, tag: TraceTag) {
        let mut data = Vec::with_capacity(line.len() + 2);
        data.extend_from_slice(line.as_bytes());
        data.extend_from_slice(b"\r\n");
        self.write(&data, tag);
    }

    /// Flushes pending output and returns the full trace.
    fn finish(&self) -> Vec<u8>;

    fn close(&self);
}

struct TraceState {
    contents: Vec<u8>,
    pending_line: String,
    truncated: bool,
    closed: bool,
}

/// In-memory trace with a byte limit and secret masking.
pub struct BufferedTrace {
    state: Mutex<TraceState>,
    limit: usize,
    masks: Vec<String>,
    feeder: Option<LineFeeder>,
}

impl BufferedTrace {
    pub fn new(limit: usize, masks: Vec<String>, feeder: Option<LineFeeder>) -> Self {
        let limit = if limit == 0 { DEFAULT_BYTES_LIMIT } else { limit };
        let mut masks: Vec<String> = masks.into_iter().filter(|m| !m.is_empty()).collect();
        // longest first so overlapping secrets are fully hidden
        masks.sort_by_key(|m| std::cmp::Reverse(m.len()));
        Self {
            state: Mutex::new(TraceState {
                contents: Vec::new(),
                pending_line: String::new(),
                truncated: false,
                closed: false,
            }),
            limit,
            masks,
            feeder,
        }
    }

    fn mask(&self, text: &str) -> String {
        self.masks
            .iter()
            .fold(text.to_string(), |acc, secret| acc.replace(secret.as_str(), MASKED_TEXT))
    }

    pub fn size(&self) -> usize {
        self.state.lock().map(|s| s.contents.len()).unwrap_or(0)
    }
}

impl Default for BufferedTrace {
    fn default() -> Self {
        Self::new(DEFAULT_BYTES_LIMIT, Vec::new(), None)
    }
}

impl JobTrace for BufferedTrace {
    fn write(&self, data: &[u8], tag: TraceTag) {
        let text = self.mask(&String::from_utf8_lossy(data));
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state.closed {
            return;
        }

        if let Some(feeder) = &self.feeder {
            state.pending_line.push_str(&text);
            while let Some(pos) = state.pending_line.find('\n') {
                let line: String = state.pending_line.drain(..=pos).collect();
                feeder(line.trim_end_matches(['\r', '\n']), tag);
            }
        }

        if state.truncated {
            return;
        }
        let remaining = self.limit.saturating_sub(state.contents.len());
        if text.len() <= remaining {
            state.contents.extend_from_slice(text.as_bytes());
        } else {
            let mut cut = remaining;
            while cut > 0 && !text.is_char_boundary(cut) {
                cut -= 1;
            }
            state.contents.extend_from_slice(&text.as_bytes()[..cut]);
            let notice = format!(
                "\r\nJob's log exceeded limit of {} bytes, trace is truncated.\r\n",
                self.limit
            );
            state.contents.extend_from_slice(notice.as_bytes());
            state.truncated = true;
        }
    }

    fn finish(&self) -> Vec<u8> {
        let Ok(mut state) = self.state.lock() else {
            return Vec::new();
        };
        if let Some(feeder) = &self.feeder {
            if !state.pending_line.is_empty() {
                let line = std::mem::take(&mut state.pending_line);
                feeder(line.trim_end_matches(['\r', '\n']), TraceTag::Exec);
            }
        }
        state.contents.clone()
    }

    fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
            state.contents.clear();
            state.pending_line.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_masks_secrets() {
        let trace = BufferedTrace::new(0, vec!["s3cr3t".into()], None);
        trace.writeln("password is s3cr3t", TraceTag::Exec);
        let out = String::from_utf8(trace.finish()).unwrap();
        assert_eq!(out, "password is [****]\r\n");
    }

    #[test]
    fn test_truncates_once() {
        let trace = BufferedTrace::new(10, vec![], None);
        trace.write(b"0123456789abcdef", TraceTag::Stdout);
        trace.write(b"more", TraceTag::Stdout);
        let out = String::from_utf8(trace.finish()).unwrap();
        assert!(out.starts_with("0123456789"));
        assert_eq!(out.matches("trace is truncated").count(), 1);
        assert!(!out.contains("more"));
    }

    #[test]
    fn test_line_feeder_receives_lines() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let feeder: LineFeeder = Box::new(move |line, tag| {
            sink.lock().unwrap().push(format!("{}:{}", tag.as_str(), line));
        });
        let trace = BufferedTrace::new(0, vec![], Some(feeder));
        trace.write(b"one\r\ntw", TraceTag::Stdout);
        trace.write(b"o\n", TraceTag::Stderr);
        trace.finish();
        assert_eq!(*lines.lock().unwrap(), vec!["stdout:one", "stderr:two"]);
    }
}
