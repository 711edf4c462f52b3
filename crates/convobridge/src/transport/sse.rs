//! Server-Sent Events decoding for the sidecar event feed.
//!
//! Only the parts of the format the sidecar uses are honoured: `event:` and
//! `data:` fields, comments, and blank-line frame boundaries. `id:` and
//! `retry:` are accepted and dropped since the feed is re-subscribed from
//! scratch rather than resumed.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use futures::Stream;

/// One dispatched SSE frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

#[derive(Default)]
struct FrameBuilder {
    event: Option<String>,
    data: Vec<String>,
}

impl FrameBuilder {
    /// Feed one line. Returns a frame when the line closes one.
    fn feed(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.finish();
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
            _ => {}
        }
        None
    }

    fn finish(&mut self) -> Option<SseFrame> {
        if self.data.is_empty() && self.event.is_none() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame {
            event: self.event.take(),
            data,
        })
    }
}

/// Stream adapter turning a byte stream into [`SseFrame`]s.
///
/// Bytes are buffered until a full line is available, so multi-byte UTF-8
/// sequences split across chunks decode correctly. Invalid UTF-8 lines are
/// skipped.
pub struct SseStream<S> {
    inner: S,
    buffer: BytesMut,
    frame: FrameBuilder,
    done: bool,
}

impl<S> SseStream<S> {
    #[must_use]
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: BytesMut::new(),
            frame: FrameBuilder::default(),
            done: false,
        }
    }

    fn next_line(&mut self) -> Option<Vec<u8>> {
        let end = self.buffer.iter().position(|&b| b == b'\n')?;
        let mut line = self.buffer.split_to(end + 1);
        line.truncate(end);
        if line.last() == Some(&b'\r') {
            line.truncate(end - 1);
        }
        Some(line.to_vec())
    }
}

impl<S, E> Stream for SseStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<SseFrame, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            while let Some(raw) = self.next_line() {
                let Ok(line) = std::str::from_utf8(&raw) else {
                    continue;
                };
                if let Some(frame) = self.frame.feed(line) {
                    return Poll::Ready(Some(Ok(frame)));
                }
            }

            if self.done {
                // A trailing unterminated line still counts.
                let rest = self.buffer.split().freeze();
                if let Ok(line) = std::str::from_utf8(rest.chunk())
                    && !line.is_empty()
                {
                    self.frame.feed(line);
                }
                return Poll::Ready(self.frame.finish().map(Ok));
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => self.buffer.extend_from_slice(&bytes),
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => self.done = true,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
