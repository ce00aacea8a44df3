//! Server-Sent Events framing for the task event stream.

use std::collections::VecDeque;
use std::pin::Pin;

use futures::StreamExt as _;
use futures::stream;

use crate::backend::EnvelopeStream;
use crate::envelope::RawEnvelope;
use crate::errors::TransportError;

pub(crate) type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static>>;

/// SSE event name used when a frame carries no `event:` line.
pub const DEFAULT_EVENT: &str = "message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn into_envelope(self) -> RawEnvelope {
        RawEnvelope::new(
            self.event.unwrap_or_else(|| DEFAULT_EVENT.to_string()),
            self.data,
        )
    }
}

/// Upper bound for one buffered, not yet delimited frame.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Incremental SSE decoder; chunks may split frames anywhere.
pub struct SseDecoder {
    buf: Vec<u8>,
    /// Bytes of `buf` already known to contain no complete delimiter.
    scanned: usize,
    limit: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_limit(MAX_FRAME_BYTES)
    }
}

impl SseDecoder {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            limit,
        }
    }

    /// Feeds one chunk and returns every frame it completed.
    ///
    /// Fails once the pending, undelimited frame grows past the limit.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Result<Vec<SseFrame>, TransportError> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some((end, boundary)) = frame_boundary(&self.buf, self.scanned) {
            let rest = self.buf.split_off(end + boundary);
            let mut frame = std::mem::replace(&mut self.buf, rest);
            frame.truncate(end);
            self.scanned = 0;
            frames.extend(SseFrame::parse(&String::from_utf8_lossy(&frame)));
        }
        // A delimiter may straddle the next chunk by up to three bytes.
        self.scanned = self.buf.len().saturating_sub(3);
        if self.buf.len() > self.limit {
            self.buf.clear();
            self.scanned = 0;
            return Err(TransportError::FrameTooLarge { limit: self.limit });
        }
        Ok(frames)
    }
}

/// Position and length of the first blank-line frame separator at or after
/// `from`.
fn frame_boundary(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let tail = buf.get(from..)?;
    let lf = tail
        .windows(2)
        .position(|w| w == b"\n\n")
        .map(|at| (from + at, 2));
    let crlf = tail
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|at| (from + at, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

impl SseFrame {
    /// Parses one frame. Comment-only and empty frames yield `None`.
    fn parse(text: &str) -> Option<Self> {
        let mut event = None;
        let mut data: Option<String> = None;
        for line in text.lines() {
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let (field, value) = line.split_once(':').unwrap_or((line, ""));
            let value = value.strip_prefix(' ').unwrap_or(value);
            match field {
                "event" => event = Some(value.to_string()),
                "data" => match data.as_mut() {
                    Some(buf) => {
                        buf.push('\n');
                        buf.push_str(value);
                    }
                    None => data = Some(value.to_string()),
                },
                _ => {}
            }
        }
        if event.is_none() && data.is_none() {
            return None;
        }
        Some(Self {
            event,
            data: data.unwrap_or_default(),
        })
    }
}

/// Turns a response body into a stream of raw envelopes.
///
/// A read error ends the stream with `TransportError::Read` and an oversized
/// frame with `TransportError::FrameTooLarge`; a clean end of body simply
/// ends it.
pub(crate) fn envelope_stream(bytes_stream: ByteStream) -> EnvelopeStream {
    struct State {
        bytes_stream: ByteStream,
        decoder: SseDecoder,
        pending: VecDeque<RawEnvelope>,
        done: bool,
    }

    let stream = stream::try_unfold(
        State {
            bytes_stream,
            decoder: SseDecoder::default(),
            pending: VecDeque::new(),
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(envelope) = state.pending.pop_front() {
                    return Ok(Some((envelope, state)));
                }
                if state.done {
                    return Ok(None);
                }

                match state.bytes_stream.next().await {
                    Some(Ok(chunk)) => {
                        for frame in state.decoder.push_chunk(&chunk)? {
                            state.pending.push_back(frame.into_envelope());
                        }
                    }
                    Some(Err(e)) => return Err(TransportError::Read(e.to_string())),
                    None => state.done = true,
                }
            }
        },
    );
    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_handles_partial_chunk_boundaries() {
        let mut decoder = SseDecoder::default();
        let part1 = b": heartbeat\n\nevent: think\ndata: {\"type\":\"think\",\"res";
        let part2 = b"ult\":\"hello\"}\n\n";
        let frames1 = decoder.push_chunk(part1).expect("frames");
        assert!(frames1.is_empty());
        let frames2 = decoder.push_chunk(part2).expect("frames");
        assert_eq!(frames2.len(), 1);
        assert_eq!(frames2[0].event.as_deref(), Some("think"));
        assert!(frames2[0].data.contains("hello"));
    }

    #[test]
    fn decoder_accepts_crlf_and_multiline_data() {
        let mut decoder = SseDecoder::default();
        let frames = decoder
            .push_chunk(b"event: log\r\ndata: {\"result\":\r\ndata: \"x\"}\r\n\r\n")
            .expect("frames");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{\"result\":\n\"x\"}");
    }

    #[test]
    fn comment_only_frames_are_skipped() {
        let mut decoder = SseDecoder::default();
        let frames = decoder
            .push_chunk(b": keepalive\n\nevent: complete\ndata: {}\n\n")
            .expect("frames");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("complete"));
    }

    #[test]
    fn frames_without_event_name_default_to_message() {
        let mut decoder = SseDecoder::default();
        let frames = decoder.push_chunk(b"data: {}\n\n").expect("frames");
        let envelope = frames.into_iter().next().expect("frame").into_envelope();
        assert_eq!(envelope.event_kind, DEFAULT_EVENT);
        assert_eq!(envelope.payload, "{}");
    }

    #[test]
    fn delimiters_split_across_single_byte_chunks_are_found() {
        let mut decoder = SseDecoder::default();
        let mut frames = Vec::new();
        for byte in b"event: step\r\ndata: {\"result\":\"a\"}\r\n\r\nevent: log\ndata: {}\n\n" {
            frames.extend(decoder.push_chunk(&[*byte]).expect("frames"));
        }
        let events: Vec<_> = frames.iter().map(|f| f.event.as_deref()).collect();
        assert_eq!(events, vec![Some("step"), Some("log")]);
        assert_eq!(frames[0].data, "{\"result\":\"a\"}");
    }

    #[test]
    fn undelimited_frame_past_limit_is_rejected() {
        let mut decoder = SseDecoder::with_limit(16);
        assert!(decoder.push_chunk(b"data: 0123456").expect("under limit").is_empty());
        assert_eq!(
            decoder.push_chunk(b"789abcdef"),
            Err(TransportError::FrameTooLarge { limit: 16 })
        );
        let frames = decoder.push_chunk(b"data: ok\n\n").expect("decoder recovers");
        assert_eq!(frames.len(), 1);
    }
}
