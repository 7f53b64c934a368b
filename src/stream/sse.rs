//! Incremental `text/event-stream` decoding.
//!
//! Network reads split the byte stream at arbitrary points, including in
//! the middle of a frame or a multi-byte character. [`SseDecoder`] buffers
//! the unterminated tail of each read and only emits a frame once its line
//! is complete. Only `data:` lines carry content; `event:`, `id:`, comment
//! lines and blank separators are consumed silently.

use bytes::{Buf, BytesMut};
use tracing::debug;

use crate::{RelayError, Result};

/// A single unterminated line may not grow past this.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

const DONE_SENTINEL: &str = "[DONE]";

/// One decoded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// Payload of a `data:` line, whitespace-trimmed.
    Data(String),
    /// `data: [DONE]`, the end-of-stream sentinel.
    Done,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: BytesMut,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one read and return the frames it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<SseFrame>> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line = self.buffer.split_to(pos);
            self.buffer.advance(1);
            if let Some(frame) = parse_line(&line) {
                frames.push(frame);
            }
        }

        if self.buffer.len() > MAX_LINE_BYTES {
            return Err(RelayError::Stream(format!(
                "event stream line exceeds {MAX_LINE_BYTES} bytes"
            )));
        }
        Ok(frames)
    }

    /// Flush a final line the provider did not newline-terminate.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = self.buffer.split();
        parse_line(&line)
    }

    /// Bytes held back waiting for a newline.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn parse_line(line: &[u8]) -> Option<SseFrame> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let rest = line.strip_prefix(b"data:")?;
    let payload = match std::str::from_utf8(rest) {
        Ok(s) => s.trim(),
        Err(e) => {
            debug!(error = %e, "skipping non-UTF-8 event line");
            return None;
        }
    };
    if payload.is_empty() {
        return None;
    }
    if payload == DONE_SENTINEL {
        return Some(SseFrame::Done);
    }
    Some(SseFrame::Data(payload.to_string()))
}
