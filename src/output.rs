//! Output handling and buffering for service logs.
//!
//! `OutputPump` turns a child's raw byte stream into decoded lines and forwards
//! them to the event channel. `LogBuffer` keeps the most recent lines per
//! service for display.

use std::collections::VecDeque;

use strip_ansi_escapes::strip;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::events::Event;

/// Longest line forwarded in one piece. A longer run of bytes without a
/// newline is split into several lines.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Indicates the source stream of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

impl StreamKind {
    pub fn label(self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// A single line of log output from a service.
#[derive(Debug, Clone)]
pub struct LogLine {
    /// The content of the log line.
    pub text: String,
    /// The stream it originated from (stdout/stderr).
    pub stream: StreamKind,
}

/// A fixed-capacity ring buffer for storing `LogLine`s.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    max_lines: usize,
    lines: VecDeque<LogLine>,
}

impl LogBuffer {
    /// Creates a new `LogBuffer` with the specified maximum capacity.
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines,
            lines: VecDeque::with_capacity(max_lines.min(1024)),
        }
    }

    /// Adds a line to the buffer.
    ///
    /// Returns `true` if an old line was dropped to make room.
    pub fn push(&mut self, line: LogLine) -> bool {
        let mut dropped = false;
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
            dropped = true;
        }
        dropped
    }

    /// Returns the number of lines currently in the buffer.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Returns the most recent line, if any.
    pub fn last(&self) -> Option<&LogLine> {
        self.lines.back()
    }
}

/// Decodes one raw line read from a child.
///
/// The trailing line terminator is removed and invalid UTF-8 is replaced, so a
/// noisy child can never stop its pump.
pub fn decode_line(raw: &[u8], strip_ansi: bool) -> String {
    let mut end = raw.len();
    if end > 0 && raw[end - 1] == b'\n' {
        end -= 1;
        if end > 0 && raw[end - 1] == b'\r' {
            end -= 1;
        }
    }
    let raw = &raw[..end];
    if strip_ansi {
        let stripped = strip(raw);
        return String::from_utf8_lossy(&stripped).into_owned();
    }
    String::from_utf8_lossy(raw).into_owned()
}

// Reads up to the next newline or `MAX_LINE_BYTES`, whichever comes first.
async fn read_line_limited<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    reader
        .take(MAX_LINE_BYTES as u64)
        .read_until(b'\n', buf)
        .await
}

/// Reads lines from one output stream of one run and forwards them as events.
#[derive(Debug, Clone, Copy)]
pub struct OutputPump {
    pub id: usize,
    pub run: u64,
    pub stream: StreamKind,
    pub strip_ansi: bool,
}

impl OutputPump {
    pub fn new(id: usize, run: u64, stream: StreamKind, strip_ansi: bool) -> Self {
        Self {
            id,
            run,
            stream,
            strip_ansi,
        }
    }

    /// Pumps `reader` until end-of-file, a read error, or `cancel` firing.
    ///
    /// Each line produces a `ServiceOutput` followed by an `OutputActivity`.
    /// A `StreamClosed` event is always sent last.
    pub async fn run<R>(self, reader: R, tx: mpsc::Sender<Event>, cancel: CancellationToken)
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::with_capacity(256);
        loop {
            buf.clear();
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = read_line_limited(&mut reader, &mut buf) => read,
            };
            match read {
                Ok(0) => break,
                Ok(_) => {
                    let line = decode_line(&buf, self.strip_ansi);
                    let output = Event::ServiceOutput {
                        id: self.id,
                        line,
                        stream: self.stream,
                    };
                    if tx.send(output).await.is_err() {
                        return;
                    }
                    if tx.send(Event::OutputActivity { id: self.id }).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    debug!(id = self.id, stream = self.stream.label(), "read failed: {}", err);
                    break;
                }
            }
        }
        let _ = tx
            .send(Event::StreamClosed {
                id: self.id,
                run: self.run,
                stream: self.stream,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_buffer_drops_oldest() {
        let mut buffer = LogBuffer::new(2);
        for text in ["a", "b"] {
            buffer.push(LogLine {
                text: text.into(),
                stream: StreamKind::Stdout,
            });
        }
        let dropped = buffer.push(LogLine {
            text: "c".into(),
            stream: StreamKind::Stderr,
        });
        assert!(dropped);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.last().map(|l| l.text.as_str()), Some("c"));
    }

    #[test]
    fn decode_line_strips_terminators() {
        assert_eq!(decode_line(b"ready\n", false), "ready");
        assert_eq!(decode_line(b"ready\r\n", false), "ready");
        assert_eq!(decode_line(b"tail", false), "tail");
        assert_eq!(decode_line(b"\n", false), "");
    }

    #[test]
    fn decode_line_replaces_invalid_utf8() {
        assert_eq!(decode_line(b"bad \xff byte\n", false), "bad \u{fffd} byte");
    }

    #[test]
    fn decode_line_optionally_strips_ansi() {
        let raw = b"\x1b[32mready\x1b[0m\n";
        assert_eq!(decode_line(raw, true), "ready");
        assert_eq!(decode_line(raw, false), "\u{1b}[32mready\u{1b}[0m");
    }

    async fn collect(rx: &mut mpsc::Receiver<Event>) -> (Vec<String>, usize) {
        let mut lines = Vec::new();
        let mut activity = 0;
        while let Some(event) = rx.recv().await {
            match event {
                Event::ServiceOutput { line, .. } => lines.push(line),
                Event::OutputActivity { .. } => activity += 1,
                Event::StreamClosed { .. } => break,
                _ => {}
            }
        }
        (lines, activity)
    }

    #[tokio::test]
    async fn pump_forwards_lines_until_eof() {
        let (tx, mut rx) = mpsc::channel(16);
        let input: &'static [u8] = b"one\n\xfe two\nthree";
        let pump = OutputPump::new(3, 1, StreamKind::Stdout, false);
        tokio::spawn(pump.run(input, tx, CancellationToken::new()));
        let (lines, activity) = collect(&mut rx).await;
        assert_eq!(lines, vec!["one", "\u{fffd} two", "three"]);
        assert_eq!(activity, 3);
    }

    #[tokio::test]
    async fn pump_splits_overlong_lines() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut input = vec![b'a'; MAX_LINE_BYTES + 10];
        input.extend_from_slice(b"\nnext\n");
        let pump = OutputPump::new(0, 1, StreamKind::Stdout, false);
        tokio::spawn(pump.run(std::io::Cursor::new(input), tx, CancellationToken::new()));
        let (lines, activity) = collect(&mut rx).await;
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].len(), MAX_LINE_BYTES);
        assert_eq!(lines[1], "a".repeat(10));
        assert_eq!(lines[2], "next");
        assert_eq!(activity, 3);
    }

    #[tokio::test]
    async fn pump_stops_on_cancel() {
        let (tx, mut rx) = mpsc::channel(16);
        let (_writer, reader) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        let pump = OutputPump::new(0, 7, StreamKind::Stderr, false);
        let task = tokio::spawn(pump.run(reader, tx, cancel.clone()));
        cancel.cancel();
        task.await.unwrap();
        match rx.recv().await {
            Some(Event::StreamClosed { run, stream, .. }) => {
                assert_eq!(run, 7);
                assert_eq!(stream, StreamKind::Stderr);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
