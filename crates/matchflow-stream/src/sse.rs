//! # SSE Frame Decoder
//!
//! Turns the raw byte stream of a simulation run into discrete
//! [`Frame`]s. The backend's protocol is SSE-shaped: frames are delimited
//! by a blank line and carry an optional `event: <type>` line plus a
//! `data: <json>` line.
//!
//! The decoder handles:
//! - Frame buffering across arbitrary chunk boundaries (a trailing partial
//!   frame is retained for the next chunk, never dropped, never emitted
//!   early)
//! - Multi-byte UTF-8 sequences split across chunks (bytes are buffered
//!   until a newline, and `\n` cannot occur inside a multi-byte sequence)
//! - `\r\n` line endings and `:` comment lines
//! - Payload decode failures: the offending frame is dropped and reported
//!   on the side channel; decoding continues

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use futures::Stream;
use serde_json::Value;
use tokio_stream::StreamExt;
use tracing::warn;

use matchflow_core::Frame;

/// Event type assigned to frames that carry no `event:` line.
///
/// The payload's `stage` field is the real discriminator for such frames,
/// so this fallback only matters when both are absent.
pub const FALLBACK_EVENT_TYPE: &str = "message";

/// A frame whose payload failed to decode as JSON.
///
/// Reported in-band so the read loop can count it without aborting.
#[derive(Clone, Debug, thiserror::Error)]
#[error("malformed frame payload: {message}")]
pub struct FrameParseError {
    /// Decode error description.
    pub message: String,
}

/// Error item surfaced by [`frame_stream`].
#[derive(Debug, thiserror::Error)]
pub enum FrameStreamError {
    /// One frame's payload failed to decode; the stream continues.
    #[error(transparent)]
    Parse(#[from] FrameParseError),
    /// The transport failed mid-stream; the stream ends after this item.
    #[error("stream read failed: {0}")]
    Read(String),
}

/// Push-based frame decoder.
///
/// Feed it chunks as they arrive; it emits zero or more complete frames per
/// call and keeps everything else buffered.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    /// Raw bytes not yet consumed up to a newline.
    buffer: BytesMut,
    /// `event:` line of the frame under construction.
    pending_event: Option<String>,
    /// `data:` lines of the frame under construction.
    pending_data: Vec<String>,
    /// Count of frames dropped due to payload decode failures.
    parse_errors: u64,
}

impl FrameDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            ..Self::default()
        }
    }

    /// Frames dropped so far due to undecodable payloads.
    #[must_use]
    pub fn parse_errors(&self) -> u64 {
        self.parse_errors
    }

    /// Feed one chunk, returning every frame completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Result<Frame, FrameParseError>> {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();

        while let Some(newline_pos) = self.buffer.iter().position(|&b| b == b'\n') {
            // Zero-copy split of the line out of the buffer
            let mut line_bytes = self.buffer.split_to(newline_pos + 1);
            line_bytes.truncate(line_bytes.len() - 1);
            if line_bytes.last() == Some(&b'\r') {
                line_bytes.truncate(line_bytes.len() - 1);
            }

            let Ok(line) = std::str::from_utf8(&line_bytes) else {
                warn!("skipping non-UTF-8 line in event stream");
                continue;
            };
            if let Some(item) = self.accept_line(line) {
                out.push(item);
            }
        }

        out
    }

    /// Flush the trailing frame at end of stream.
    ///
    /// The backend does not always terminate the final frame with a blank
    /// line; any buffered remainder is treated as the last line.
    pub fn flush(&mut self) -> Option<Result<Frame, FrameParseError>> {
        if !self.buffer.is_empty() {
            let remainder = self.buffer.split();
            if let Ok(line) = std::str::from_utf8(&remainder) {
                let line = line.trim_end_matches('\r').to_owned();
                if let Some(item) = self.accept_line(&line) {
                    return Some(item);
                }
            }
        }
        self.finish_pending()
    }

    /// Process one complete line; a blank line finalizes the pending frame.
    fn accept_line(&mut self, line: &str) -> Option<Result<Frame, FrameParseError>> {
        if line.trim().is_empty() {
            return self.finish_pending();
        }
        if line.starts_with(':') {
            return None; // comment
        }
        if let Some(value) = field_value(line, "event") {
            self.pending_event = Some(value.to_string());
        } else if let Some(value) = field_value(line, "data") {
            self.pending_data.push(value.to_string());
        }
        // Other fields (id:, retry:) carry nothing this protocol uses
        None
    }

    /// Finalize the frame under construction, decoding its payload.
    fn finish_pending(&mut self) -> Option<Result<Frame, FrameParseError>> {
        if self.pending_event.is_none() && self.pending_data.is_empty() {
            return None;
        }
        let event_type = self
            .pending_event
            .take()
            .unwrap_or_else(|| FALLBACK_EVENT_TYPE.to_string());
        let data = std::mem::take(&mut self.pending_data).join("\n");

        let payload = if data.trim().is_empty() {
            Value::Null
        } else {
            match serde_json::from_str(&data) {
                Ok(v) => v,
                Err(e) => {
                    self.parse_errors += 1;
                    warn!(
                        event_type = %event_type,
                        error = %e,
                        "dropping frame with undecodable payload"
                    );
                    return Some(Err(FrameParseError {
                        message: e.to_string(),
                    }));
                }
            }
        };

        Some(Ok(Frame::new(event_type, payload)))
    }
}

/// Adapt a transport byte stream into a stream of decoded frames.
///
/// Pull-based: nothing is read from the network until the consumer asks for
/// the next frame. A read error flushes whatever was buffered, then surfaces
/// as a final [`FrameStreamError::Read`] item carrying the cause.
pub fn frame_stream<S, E>(
    byte_stream: S,
) -> impl Stream<Item = Result<Frame, FrameStreamError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: std::fmt::Display + Send + 'static,
{
    futures::stream::unfold(
        (byte_stream, FrameDecoder::new(), VecDeque::new(), false),
        |(mut stream, mut decoder, mut queued, mut done)| async move {
            loop {
                if let Some(item) = queued.pop_front() {
                    return Some((item, (stream, decoder, queued, done)));
                }
                if done {
                    return None;
                }
                match stream.next().await {
                    Some(Ok(chunk)) => queued.extend(
                        decoder
                            .feed(&chunk)
                            .into_iter()
                            .map(|r| r.map_err(FrameStreamError::from)),
                    ),
                    Some(Err(e)) => {
                        warn!(error = %e, "event stream read error");
                        queued.extend(decoder.flush().map(|r| r.map_err(FrameStreamError::from)));
                        queued.push_back(Err(FrameStreamError::Read(e.to_string())));
                        done = true;
                    }
                    None => {
                        queued.extend(decoder.flush().map(|r| r.map_err(FrameStreamError::from)));
                        done = true;
                    }
                }
            }
        },
    )
}

/// Extract the value of `<field>:` from a line, tolerating a missing space.
fn field_value<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(field)?.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest).trim_end())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
