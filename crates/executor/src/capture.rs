use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

/// Every truncated stream contains this marker so callers can detect
/// that output was elided without parsing the whole message.
pub const TRUNCATION_MARKER_PREFIX: &str = "[TRUNCATED:";

pub(crate) fn truncation_marker(stream: &str) -> String {
    format!("\n[TRUNCATED: {stream} too long, showing first and last portions]\n")
}

/// One captured output stream after the cap has been applied.
#[derive(Debug, Clone, Default)]
pub struct StreamOutput {
    pub text: String,
    pub truncated: bool,
    pub original_bytes: u64,
    pub dropped_bytes: u64,
}

/// Bounded capture state for one pipe. The first `cap` bytes land in
/// `head`; everything after flows through a ring that remembers the
/// last `cap` bytes. Memory stays at roughly twice the cap no matter
/// how much the child writes.
pub(crate) struct CaptureBuf {
    head: Vec<u8>,
    tail: VecDeque<u8>,
    total: u64,
    cap: usize,
}

impl CaptureBuf {
    pub(crate) fn new(cap: usize) -> Self {
        Self { head: Vec::new(), tail: VecDeque::new(), total: 0, cap }
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) {
        self.total += chunk.len() as u64;
        let mut rest = chunk;
        if self.head.len() < self.cap {
            let take = (self.cap - self.head.len()).min(rest.len());
            self.head.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
        }
        if !rest.is_empty() {
            self.tail.extend(rest.iter().copied());
            if self.tail.len() > self.cap {
                let excess = self.tail.len() - self.cap;
                self.tail.drain(..excess);
            }
        }
    }

    /// Collapses the capture into its final form: untouched text when it
    /// fit under the cap, otherwise the head and tail of the stream
    /// joined by the truncation marker. The truncated text never exceeds
    /// the cap; roughly the first 60% of the byte budget goes to the
    /// head and the rest to the tail.
    pub(crate) fn finalize(self, stream: &str) -> StreamOutput {
        let CaptureBuf { head, tail, total, cap } = self;
        if total <= cap as u64 {
            return StreamOutput {
                text: String::from_utf8_lossy(&head).into_owned(),
                truncated: false,
                original_bytes: total,
                dropped_bytes: 0,
            };
        }

        let marker = truncation_marker(stream);
        let budget = cap.saturating_sub(marker.len());
        if budget < 2 {
            // cap too small to fit the marker at all: keep what fits
            let keep = cap.min(head.len());
            let text = clamp_utf8_end(String::from_utf8_lossy(&head[..keep]).into_owned(), cap);
            return StreamOutput {
                text,
                truncated: true,
                original_bytes: total,
                dropped_bytes: total.saturating_sub(keep as u64),
            };
        }

        let head_len = (budget * 3 / 5).min(head.len());
        let tail_len = budget - head_len;
        let ring = Vec::from(tail);
        let tail_bytes: Vec<u8> = if ring.len() >= tail_len {
            ring[ring.len() - tail_len..].to_vec()
        } else {
            // the suffix spans the head/ring boundary; the join is exact
            // because the ring only drops bytes once it has seen `cap`
            // of them, and by then it alone covers any tail request
            let need = tail_len - ring.len();
            let start = head.len().saturating_sub(need);
            let mut joined = head[start..].to_vec();
            joined.extend_from_slice(&ring);
            joined
        };

        // lossy conversion can grow the text: every invalid or split
        // byte sequence becomes a three-byte replacement char, so each
        // side is clamped back to its byte budget after conversion
        let head_text =
            clamp_utf8_end(String::from_utf8_lossy(&head[..head_len]).into_owned(), head_len);
        let tail_text =
            clamp_utf8_start(String::from_utf8_lossy(&tail_bytes).into_owned(), tail_len);
        let kept = (head_len + tail_bytes.len()) as u64;
        StreamOutput {
            text: format!("{head_text}{marker}{tail_text}"),
            truncated: true,
            original_bytes: total,
            dropped_bytes: total.saturating_sub(kept),
        }
    }
}

/// Truncates to at most `limit` bytes, backing up to a char boundary.
fn clamp_utf8_end(mut text: String, limit: usize) -> String {
    if text.len() > limit {
        let mut cut = limit;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}

/// Keeps at most the last `limit` bytes, advancing to a char boundary.
fn clamp_utf8_start(text: String, limit: usize) -> String {
    if text.len() <= limit {
        return text;
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

/// Drains one child pipe on a background task while the parent waits on
/// the process, so a chatty child can never deadlock against a full
/// pipe buffer.
pub(crate) struct StreamCapture {
    shared: Arc<Mutex<Option<CaptureBuf>>>,
    task: Option<JoinHandle<()>>,
}

impl StreamCapture {
    pub(crate) fn spawn<R>(stream: Option<R>, cap: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let shared = Arc::new(Mutex::new(Some(CaptureBuf::new(cap))));
        let task = stream.map(|mut reader| {
            let sink = Arc::clone(&shared);
            tokio::spawn(async move {
                let mut chunk = [0u8; 8192];
                loop {
                    match reader.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if let Some(buf) = sink.lock().as_mut() {
                                buf.push(&chunk[..n]);
                            }
                        }
                    }
                }
            })
        });
        Self { shared, task }
    }

    /// Waits up to `grace` for the reader to hit EOF, then takes what
    /// was captured. The wait is bounded so a grandchild that inherited
    /// the pipe and never exits cannot wedge the request.
    pub(crate) async fn finish(mut self, grace: Duration, stream: &str) -> StreamOutput {
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                task.abort();
            }
        }
        match self.shared.lock().take() {
            Some(buf) => buf.finalize(stream),
            None => StreamOutput::default(),
        }
    }
}
