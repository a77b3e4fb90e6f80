//! Incremental decoder for blank-line delimited event frames.
//!
//! A frame is a run of `field: value` lines terminated by an empty line.
//! `event:` names the frame (default `"message"`) and every `data:` line is
//! joined with `\n` to form the payload. Payloads are not interpreted here.

use async_stream::stream;
use futures::{Stream, StreamExt};

use crate::error::Result;

const DEFAULT_EVENT: &str = "message";

/// One decoded event frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event: String,
    pub data: String,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }
}

/// Incremental frame decoder.
///
/// Bytes are buffered until a full line is available, so multi-byte UTF-8
/// sequences and `\r\n` pairs split across chunks decode correctly.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and drain every frame it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            let line = strip_cr(&self.buffer[start..end]);
            let line = String::from_utf8_lossy(line).into_owned();
            start = end + 1;

            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
        }
        self.buffer.drain(..start);

        frames
    }

    /// Flush whatever is left once the underlying stream has ended.
    pub fn finish(&mut self) -> Option<Frame> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(strip_cr(&rest)).into_owned();
            if let Some(frame) = self.process_line(&line) {
                return Some(frame);
            }
        }
        self.take_frame()
    }

    /// Decode a complete payload in one shot.
    pub fn decode_all(input: &[u8]) -> Vec<Frame> {
        let mut decoder = Self::new();
        let mut frames = decoder.feed(input);
        frames.extend(decoder.finish());
        frames
    }

    fn process_line(&mut self, line: &str) -> Option<Frame> {
        if line.is_empty() {
            return self.take_frame();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            // id/retry carry nothing the transcript needs
            _ => {}
        }
        None
    }

    fn take_frame(&mut self) -> Option<Frame> {
        if self.event.is_none() && self.data.is_empty() {
            return None;
        }
        let event = self
            .event
            .take()
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| DEFAULT_EVENT.to_string());
        let data = std::mem::take(&mut self.data).join("\n");
        Some(Frame { event, data })
    }
}

fn strip_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Turn a chunked byte stream into a lazy stream of frames.
///
/// A read error is yielded once and ends the stream; the trailing partial
/// frame is flushed when the byte stream ends cleanly.
pub fn frames<S, B>(bytes: S) -> impl Stream<Item = Result<Frame>>
where
    S: Stream<Item = Result<B>>,
    B: AsRef<[u8]>,
{
    stream! {
        let mut decoder = FrameDecoder::new();
        futures::pin_mut!(bytes);

        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(chunk) => {
                    for frame in decoder.feed(chunk.as_ref()) {
                        yield Ok(frame);
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }

        if let Some(frame) = decoder.finish() {
            yield Ok(frame);
        }
    }
}
