//! Splits a raw byte stream into trimmed lines on `\n`, `\r`, or `\r\n`.
//!
//! The downloader subprocess overwrites its progress line in place using a
//! bare `\r`, the same way a terminal progress bar does. Splitting only on
//! `\n` would mean the UI never sees a progress update until the line
//! eventually ends, so every carriage return is treated as a line boundary
//! too, matching how a real terminal renders the stream incrementally.

/// Incremental line splitter fed with arbitrary byte chunks from a stream.
///
/// Accumulates a partial line across calls to [`LineSplitter::feed`] and
/// yields completed, trimmed, non-empty segments split on any of `\n`, `\r`,
/// or `\r\n`. A `\r\n` pair is treated as a single boundary rather than two.
#[derive(Debug, Default)]
pub struct LineSplitter {
    partial: String,
}

impl LineSplitter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk of decoded text, returning the lines it completes.
    ///
    /// Bytes that don't yet form a complete line are retained for the next
    /// call (or for [`LineSplitter::flush`] at end of stream).
    pub fn feed(&mut self, chunk: &str) -> Vec<String> {
        self.partial.push_str(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        let bytes = self.partial.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                b'\n' => {
                    push_segment(&mut lines, &self.partial[start..i]);
                    start = i + 1;
                }
                b'\r' => {
                    push_segment(&mut lines, &self.partial[start..i]);
                    if bytes.get(i + 1) == Some(&b'\n') {
                        i += 1;
                    }
                    start = i + 1;
                }
                _ => {}
            }
            i += 1;
        }
        self.partial.drain(0..start);
        lines
    }

    /// Flushes any trailing partial line (the stream ended without a terminator).
    pub fn flush(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        let remaining = std::mem::take(&mut self.partial);
        let trimmed = remaining.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}

fn push_segment(lines: &mut Vec<String>, segment: &str) {
    let trimmed = segment.trim();
    if !trimmed.is_empty() {
        lines.push(trimmed.to_string());
    }
}
