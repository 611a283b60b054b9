//! Output reader channel
//!
//! Holds bytes pushed by the engine for one descriptor until the embedder
//! pulls them. Chunks are kept in arrival order and handed out in that same
//! order. Under the default policy nothing is ever dropped.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::config::BufferPolicy;

/// Result of a non-blocking read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Next chunk, in engine-report order
    Data(Bytes),
    /// Nothing buffered right now; more may arrive
    Empty,
    /// Closed and fully drained
    Closed,
}

/// What happened to a chunk pushed by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Whole chunk buffered. `ready_for_more` is false once the reader is
    /// above its high-water mark.
    Buffered { ready_for_more: bool },
    /// Capacity reached under `DropNewest`; `accepted` bytes kept, `dropped` discarded
    Truncated { accepted: usize, dropped: usize },
    /// Reader already closed; chunk discarded
    Closed,
}

#[derive(Default)]
struct ReaderBuffer {
    chunks: VecDeque<Bytes>,
    len: usize,
    closed: bool,
    dropped: u64,
}

struct ReaderInner {
    fd: i32,
    policy: BufferPolicy,
    high_water_mark: usize,
    buffer: Mutex<ReaderBuffer>,
    /// Signalled when data arrives or the reader closes
    readable: Notify,
    /// Signalled when the embedder consumes data or the reader closes
    drained: Notify,
}

/// Readable end of a child output descriptor (stdout or stderr)
#[derive(Clone)]
pub struct OutputReader {
    inner: Arc<ReaderInner>,
}

impl OutputReader {
    pub fn new(fd: i32, policy: BufferPolicy, high_water_mark: usize) -> Self {
        Self {
            inner: Arc::new(ReaderInner {
                fd,
                policy,
                high_water_mark,
                buffer: Mutex::new(ReaderBuffer::default()),
                readable: Notify::new(),
                drained: Notify::new(),
            }),
        }
    }

    /// Descriptor this reader is bound to
    pub fn fd(&self) -> i32 {
        self.inner.fd
    }

    pub fn policy(&self) -> BufferPolicy {
        self.inner.policy
    }

    /// Bytes buffered and not yet consumed
    pub fn buffered_len(&self) -> usize {
        self.inner.buffer.lock().len
    }

    /// True once the reader has been closed (buffered data may remain)
    pub fn is_closed(&self) -> bool {
        self.inner.buffer.lock().closed
    }

    /// Bytes discarded by a `DropNewest` policy so far
    pub fn dropped_bytes(&self) -> u64 {
        self.inner.buffer.lock().dropped
    }

    /// Whether the embedder side can take more data without crossing the
    /// high-water mark
    pub fn ready_for_more(&self) -> bool {
        let buffer = self.inner.buffer.lock();
        !buffer.closed && buffer.len < self.threshold()
    }

    fn threshold(&self) -> usize {
        match self.inner.policy.capacity() {
            Some(capacity) => capacity.min(self.inner.high_water_mark),
            None => self.inner.high_water_mark,
        }
    }

    /// Append a chunk from the engine
    pub(crate) fn push(&self, bytes: Bytes) -> PushOutcome {
        let outcome = {
            let mut buffer = self.inner.buffer.lock();
            if buffer.closed {
                return PushOutcome::Closed;
            }

            match self.inner.policy {
                BufferPolicy::DropNewest { capacity } if buffer.len + bytes.len() > capacity => {
                    let room = capacity.saturating_sub(buffer.len);
                    let dropped = bytes.len() - room;
                    if room > 0 {
                        buffer.chunks.push_back(bytes.slice(..room));
                        buffer.len += room;
                    }
                    buffer.dropped += dropped as u64;
                    PushOutcome::Truncated {
                        accepted: room,
                        dropped,
                    }
                }
                _ => {
                    if !bytes.is_empty() {
                        buffer.len += bytes.len();
                        buffer.chunks.push_back(bytes);
                    }
                    PushOutcome::Buffered {
                        ready_for_more: buffer.len < self.threshold(),
                    }
                }
            }
        };

        self.inner.readable.notify_waiters();
        outcome
    }

    /// Mark end-of-stream. Returns true only for the call that closed it.
    pub(crate) fn close(&self) -> bool {
        let newly_closed = {
            let mut buffer = self.inner.buffer.lock();
            !std::mem::replace(&mut buffer.closed, true)
        };

        if newly_closed {
            self.inner.readable.notify_waiters();
            self.inner.drained.notify_waiters();
        }
        newly_closed
    }

    /// Take the next buffered chunk without waiting
    pub fn try_read(&self) -> ReadOutcome {
        self.try_read_max(usize::MAX)
    }

    /// Take at most `max` bytes from the front of the buffer without waiting
    pub fn try_read_max(&self, max: usize) -> ReadOutcome {
        let outcome = {
            let mut buffer = self.inner.buffer.lock();
            if max == 0 {
                return if buffer.chunks.is_empty() && buffer.closed {
                    ReadOutcome::Closed
                } else {
                    ReadOutcome::Empty
                };
            }

            let front_len = match buffer.chunks.front() {
                Some(front) => front.len(),
                None if buffer.closed => return ReadOutcome::Closed,
                None => return ReadOutcome::Empty,
            };
            let chunk = if front_len > max {
                buffer.chunks.front_mut().map(|front| front.split_to(max))
            } else {
                buffer.chunks.pop_front()
            }
            .unwrap_or_default();
            buffer.len -= chunk.len();
            ReadOutcome::Data(chunk)
        };

        self.inner.drained.notify_waiters();
        outcome
    }

    /// Wait for the next chunk. Returns `None` once closed and drained.
    pub async fn read(&self) -> Option<Bytes> {
        loop {
            let notified = self.inner.readable.notified();
            match self.try_read() {
                ReadOutcome::Data(chunk) => return Some(chunk),
                ReadOutcome::Closed => return None,
                ReadOutcome::Empty => notified.await,
            }
        }
    }

    /// Drain everything until the reader closes
    pub async fn read_to_end(&self) -> Vec<u8> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.read().await {
            out.extend_from_slice(&chunk);
        }
        out.to_vec()
    }

    /// Resolve once the engine may push more. Only a `Suspend` policy above
    /// capacity holds the caller back; closing the reader releases it.
    pub async fn wait_writable(&self) {
        let BufferPolicy::Suspend { capacity } = self.inner.policy else {
            return;
        };

        loop {
            let notified = self.inner.drained.notified();
            {
                let buffer = self.inner.buffer.lock();
                if buffer.closed || buffer.len < capacity.max(1) {
                    return;
                }
            }
            notified.await;
        }
    }
}

impl fmt::Debug for OutputReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let buffer = self.inner.buffer.lock();
        f.debug_struct("OutputReader")
            .field("fd", &self.inner.fd)
            .field("policy", &self.inner.policy)
            .field("buffered", &buffer.len)
            .field("closed", &buffer.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn reader(policy: BufferPolicy) -> OutputReader {
        OutputReader::new(1, policy, 8)
    }

    #[test]
    fn test_reads_in_push_order() {
        let r = reader(BufferPolicy::Unbounded);
        r.push(Bytes::from_static(b"ab"));
        r.push(Bytes::from_static(b"cd"));

        assert_eq!(r.try_read(), ReadOutcome::Data(Bytes::from_static(b"ab")));
        assert_eq!(r.try_read(), ReadOutcome::Data(Bytes::from_static(b"cd")));
        assert_eq!(r.try_read(), ReadOutcome::Empty);
    }

    #[test]
    fn test_read_max_splits_chunks() {
        let r = reader(BufferPolicy::Unbounded);
        r.push(Bytes::from_static(b"hello"));

        assert_eq!(r.try_read_max(2), ReadOutcome::Data(Bytes::from_static(b"he")));
        assert_eq!(r.buffered_len(), 3);
        assert_eq!(r.try_read_max(10), ReadOutcome::Data(Bytes::from_static(b"llo")));
        assert_eq!(r.try_read_max(0), ReadOutcome::Empty);
    }

    #[test]
    fn test_close_after_drain() {
        let r = reader(BufferPolicy::Unbounded);
        r.push(Bytes::from_static(b"tail"));
        assert!(r.close());
        assert!(!r.close());

        assert_eq!(r.try_read(), ReadOutcome::Data(Bytes::from_static(b"tail")));
        assert_eq!(r.try_read(), ReadOutcome::Closed);
        assert_eq!(r.push(Bytes::from_static(b"late")), PushOutcome::Closed);
    }

    #[test]
    fn test_unbounded_never_drops() {
        let r = reader(BufferPolicy::Unbounded);
        for _ in 0..100 {
            r.push(Bytes::from_static(b"0123456789"));
        }
        assert_eq!(r.buffered_len(), 1000);
        assert_eq!(r.dropped_bytes(), 0);
        assert!(!r.ready_for_more());
    }

    #[test]
    fn test_high_water_mark_reported_on_push() {
        let r = reader(BufferPolicy::Unbounded);
        assert_eq!(
            r.push(Bytes::from_static(b"1234")),
            PushOutcome::Buffered {
                ready_for_more: true
            }
        );
        assert_eq!(
            r.push(Bytes::from_static(b"5678")),
            PushOutcome::Buffered {
                ready_for_more: false
            }
        );
        r.try_read();
        assert!(r.ready_for_more());
    }

    #[test]
    fn test_drop_newest_truncates() {
        let r = reader(BufferPolicy::DropNewest { capacity: 5 });
        r.push(Bytes::from_static(b"abc"));
        assert_eq!(
            r.push(Bytes::from_static(b"defg")),
            PushOutcome::Truncated {
                accepted: 2,
                dropped: 2
            }
        );
        assert_eq!(
            r.push(Bytes::from_static(b"h")),
            PushOutcome::Truncated {
                accepted: 0,
                dropped: 1
            }
        );
        assert_eq!(r.dropped_bytes(), 3);
        assert_eq!(r.buffered_len(), 5);
    }

    #[tokio::test]
    async fn test_read_waits_for_data() {
        let r = reader(BufferPolicy::Unbounded);
        let producer = r.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.push(Bytes::from_static(b"late"));
            producer.close();
        });

        assert_eq!(r.read().await, Some(Bytes::from_static(b"late")));
        assert_eq!(r.read().await, None);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_suspend_holds_writer_until_drained() {
        let r = reader(BufferPolicy::Suspend { capacity: 4 });
        r.push(Bytes::from_static(b"full"));

        let waiter = {
            let r = r.clone();
            tokio::spawn(async move { r.wait_writable().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        assert_eq!(r.try_read(), ReadOutcome::Data(Bytes::from_static(b"full")));
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("writer should be released")
            .unwrap();
    }

    #[tokio::test]
    async fn test_suspend_never_drops() {
        let r = reader(BufferPolicy::Suspend { capacity: 4 });
        r.push(Bytes::from_static(b"0123456789"));
        assert_eq!(r.buffered_len(), 10);
        assert_eq!(r.dropped_bytes(), 0);
        r.close();
        assert_eq!(r.read_to_end().await, b"0123456789");
    }
}
