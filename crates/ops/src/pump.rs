//! Child output plumbing: byte streams to bounded line channels.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::StreamExt;
use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::session::ActiveSession;

/// Default per-line display budget, in chars.
pub const DEFAULT_LINE_MAX: usize = 120;
/// Default depth of a session's output channel.
pub const DEFAULT_QUEUE_CAP: usize = 1024;

/// Returns true when the line was consumed and must not reach the caller.
pub type LineFilter = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Shared destination for every pump of one session.
///
/// Keeps the full untruncated capture for diagnostic logs while the channel
/// carries display-length lines. A full channel drops the line and counts it;
/// the child is never blocked on a slow consumer.
pub struct LineSink {
    tx: mpsc::Sender<String>,
    capture: Mutex<String>,
    dropped: AtomicU64,
    session: Arc<ActiveSession>,
    line_max: usize,
    filter: Option<LineFilter>,
}

impl LineSink {
    pub fn new(tx: mpsc::Sender<String>, session: Arc<ActiveSession>, line_max: usize) -> Self {
        Self { tx, capture: Mutex::new(String::new()), dropped: AtomicU64::new(0), session, line_max, filter: None }
    }

    pub fn with_filter(mut self, filter: LineFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn push(&self, raw: &str) {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if let Some(filter) = &self.filter {
            if filter(line) {
                return;
            }
        }
        // capture and channel stay in the same order across pumps
        let mut capture = self.capture.lock().unwrap_or_else(PoisonError::into_inner);
        capture.push_str(line);
        capture.push('\n');
        self.session.bump_lines();
        if self.tx.try_send(truncate_line(line, self.line_max)).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            counter!("output_lines_dropped_total", 1u64);
        }
    }

    /// Everything pushed so far, one line per `\n`.
    pub fn capture(&self) -> String { self.capture.lock().unwrap_or_else(PoisonError::into_inner).clone() }

    pub fn dropped(&self) -> u64 { self.dropped.load(Ordering::Relaxed) }
}

/// Cut `line` to at most `max` chars.
pub fn truncate_line(line: &str, max: usize) -> String {
    match line.char_indices().nth(max) {
        Some((idx, _)) => line[..idx].to_string(),
        None => line.to_string(),
    }
}

/// Consume a byte stream, split it into lines and push each into `sink`.
/// Stops on cancel, stream error or end; a trailing partial line is flushed.
pub async fn pump_bytes_to_lines<S, E>(stream: S, sink: Arc<LineSink>, cancel: CancellationToken, ctx: &str)
where
    S: futures::Stream<Item = Result<bytes::Bytes, E>>,
    E: std::fmt::Display,
{
    let stream = stream.fuse();
    futures::pin_mut!(stream);
    let mut buf = bytes::BytesMut::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => { debug!(ctx = %ctx, "ops: pump cancelled"); break; }
            next = stream.next() => {
                match next {
                    Some(Ok(chunk)) => {
                        buf.extend_from_slice(&chunk);
                        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                            let line = buf.split_to(pos);
                            let _ = buf.split_to(1);
                            sink.push(&String::from_utf8_lossy(&line));
                        }
                    }
                    Some(Err(e)) => { warn!(ctx = %ctx, error = %e, "ops: output stream error"); break; }
                    None => break,
                }
            }
        }
    }
    if !buf.is_empty() {
        sink.push(&String::from_utf8_lossy(&buf));
    }
    debug!(ctx = %ctx, "ops: pump ended");
}
