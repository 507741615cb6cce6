//! Read reordering over a forward-only byte stream.
//!
//! SFTP clients pipeline READ requests: several are in flight at once, they
//! may arrive in any order, and their sizes need not match the chunks the
//! backend produces. The backend stream can only be consumed from start to
//! end. [`ReadReorderBuffer`] sits between the two: it parks requests by
//! offset, accumulates stream bytes, and hands out exactly the bytes each
//! request asked for once the stream cursor reaches it.
//!
//! ## Invariants
//!
//! - The cursor only moves forward; it equals the number of bytes handed out.
//! - A request is answered only when it sits exactly at the cursor, so no
//!   byte is ever delivered twice or skipped.
//! - A request is never answered short while the stream may still produce
//!   more bytes.
//! - Every state change (new request or stream event) ends in the same
//!   resolution pass, which runs to completion before the caller continues.

use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Successful outcome of one read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadReply {
    Data(Bytes),
    Eof,
}

/// Failed outcome of one read.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadError {
    #[error("read stream failed: {0}")]
    StreamFaulted(String),

    #[error("read cancelled")]
    Cancelled,

    #[error("read already pending at offset {0}")]
    DuplicateOffset(u64),
}

pub type ReadResult = Result<ReadReply, ReadError>;

/// Something the backend stream did.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// More bytes, in stream order.
    Data(Bytes),
    /// The stream is exhausted.
    End,
    /// The stream failed and will produce nothing more.
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StreamState {
    Open,
    Ended,
    Faulted(String),
    Cancelled,
}

#[derive(Debug)]
struct PendingRead {
    len: usize,
    reply: oneshot::Sender<ReadResult>,
}

/// Matches pending reads to a sequential byte stream.
///
/// Synchronous and lock-free by itself; callers share it behind a mutex and
/// feed it from whatever task pulls the stream.
#[derive(Debug)]
pub struct ReadReorderBuffer {
    cursor: u64,
    buffered: BytesMut,
    state: StreamState,
    pending: BTreeMap<u64, PendingRead>,
}

impl Default for ReadReorderBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadReorderBuffer {
    pub fn new() -> Self {
        Self {
            cursor: 0,
            buffered: BytesMut::new(),
            state: StreamState::Open,
            pending: BTreeMap::new(),
        }
    }

    /// Register a read of `len` bytes at `offset`.
    ///
    /// The receiver completes when the request resolves. A request behind the
    /// cursor can never be satisfied; it stays pending until [`cancel`].
    ///
    /// [`cancel`]: Self::cancel
    pub fn submit(&mut self, offset: u64, len: u32) -> oneshot::Receiver<ReadResult> {
        let (reply, rx) = oneshot::channel();

        if self.pending.contains_key(&offset) {
            warn!(offset, "read already pending at this offset, rejecting the newer one");
            let _ = reply.send(Err(ReadError::DuplicateOffset(offset)));
            return rx;
        }
        if offset < self.cursor && self.state == StreamState::Open {
            warn!(
                offset,
                cursor = self.cursor,
                "read behind the stream cursor; it will stay pending until the handle closes"
            );
        }

        self.pending.insert(offset, PendingRead { len: len as usize, reply });
        self.resolve();
        rx
    }

    /// Feed one stream event.
    pub fn on_event(&mut self, event: StreamEvent) {
        if self.state != StreamState::Open {
            debug!(?event, "stream event after the stream settled, ignoring");
            return;
        }
        match event {
            StreamEvent::Data(chunk) => self.buffered.extend_from_slice(&chunk),
            StreamEvent::End => self.state = StreamState::Ended,
            StreamEvent::Error(reason) => self.state = StreamState::Faulted(reason),
        }
        self.resolve();
    }

    /// Abandon the stream: reject everything pending and everything submitted
    /// later with [`ReadError::Cancelled`].
    pub fn cancel(&mut self) {
        if !matches!(self.state, StreamState::Faulted(_)) {
            self.state = StreamState::Cancelled;
        }
        self.buffered.clear();
        self.resolve();
    }

    /// Whether the pump should pull another chunk from the stream.
    ///
    /// True while unclaimed bytes stay under `high_water`, or while the
    /// request at the cursor needs more than is buffered.
    pub fn wants_data(&self, high_water: usize) -> bool {
        if self.state != StreamState::Open {
            return false;
        }
        if self.buffered.len() < high_water {
            return true;
        }
        self.pending
            .get(&self.cursor)
            .is_some_and(|read| read.len > self.buffered.len())
    }

    /// Bytes handed out so far.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Number of unanswered requests.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// The stream failed; further reads fail fast.
    pub fn fault(&self) -> Option<&str> {
        match &self.state {
            StreamState::Faulted(reason) => Some(reason),
            _ => None,
        }
    }

    fn fail_all(&mut self, error: ReadError) {
        for (_, read) in std::mem::take(&mut self.pending) {
            let _ = read.reply.send(Err(error.clone()));
        }
    }

    fn resolve(&mut self) {
        match &self.state {
            StreamState::Faulted(reason) => {
                let error = ReadError::StreamFaulted(reason.clone());
                self.fail_all(error);
                return;
            }
            StreamState::Cancelled => {
                self.fail_all(ReadError::Cancelled);
                return;
            }
            StreamState::Open | StreamState::Ended => {}
        }

        let ended = self.state == StreamState::Ended;
        while let Some(len) = self.pending.get(&self.cursor).map(|read| read.len) {
            if self.buffered.len() < len && !ended {
                break;
            }
            let Some(read) = self.pending.remove(&self.cursor) else {
                break;
            };
            let take = len.min(self.buffered.len());
            let chunk = self.buffered.split_to(take).freeze();
            self.cursor += take as u64;

            let reply = if chunk.is_empty() && ended && self.buffered.is_empty() {
                ReadReply::Eof
            } else {
                ReadReply::Data(chunk)
            };
            let _ = read.reply.send(Ok(reply));
            if take == 0 {
                // Nothing advanced; a further request at this offset would be new
                break;
            }
        }

        if ended && self.buffered.is_empty() {
            for (_, read) in std::mem::take(&mut self.pending) {
                let _ = read.reply.send(Ok(ReadReply::Eof));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use tokio::sync::oneshot::error::TryRecvError;

    fn ready(rx: &mut oneshot::Receiver<ReadResult>) -> ReadResult {
        rx.try_recv().expect("read should have resolved")
    }

    fn still_pending(rx: &mut oneshot::Receiver<ReadResult>) -> bool {
        matches!(rx.try_recv(), Err(TryRecvError::Empty))
    }

    fn data(bytes: &'static [u8]) -> ReadResult {
        Ok(ReadReply::Data(Bytes::from_static(bytes)))
    }

    #[test]
    fn test_in_order_reads() {
        let mut buf = ReadReorderBuffer::new();
        buf.on_event(StreamEvent::Data(Bytes::from_static(b"hello world")));

        let mut a = buf.submit(0, 5);
        let mut b = buf.submit(5, 6);
        assert_eq!(ready(&mut a), data(b"hello"));
        assert_eq!(ready(&mut b), data(b" world"));
        assert_eq!(buf.cursor(), 11);
    }

    #[test]
    fn test_out_of_order_waits_for_cursor() {
        let mut buf = ReadReorderBuffer::new();
        let mut later = buf.submit(5, 5);
        buf.on_event(StreamEvent::Data(Bytes::from_static(b"0123456789")));
        assert!(still_pending(&mut later));

        let mut first = buf.submit(0, 5);
        assert_eq!(ready(&mut first), data(b"01234"));
        assert_eq!(ready(&mut later), data(b"56789"));
    }

    #[test]
    fn test_never_short_before_end() {
        let mut buf = ReadReorderBuffer::new();
        let mut rx = buf.submit(0, 8);
        buf.on_event(StreamEvent::Data(Bytes::from_static(b"abc")));
        assert!(still_pending(&mut rx));
        buf.on_event(StreamEvent::Data(Bytes::from_static(b"defgh")));
        assert_eq!(ready(&mut rx), data(b"abcdefgh"));
    }

    #[test]
    fn test_short_read_at_end_then_eof() {
        let mut buf = ReadReorderBuffer::new();
        let mut rx = buf.submit(0, 100);
        buf.on_event(StreamEvent::Data(Bytes::from_static(b"hello")));
        buf.on_event(StreamEvent::End);
        assert_eq!(ready(&mut rx), data(b"hello"));

        let mut tail = buf.submit(5, 100);
        assert_eq!(ready(&mut tail), Ok(ReadReply::Eof));
    }

    #[test]
    fn test_zero_length_read_before_tail_is_empty_data() {
        let mut buf = ReadReorderBuffer::new();
        buf.on_event(StreamEvent::Data(Bytes::from_static(b"hello")));
        buf.on_event(StreamEvent::End);

        let mut empty = buf.submit(0, 0);
        assert_eq!(ready(&mut empty), data(b""));
        let mut rest = buf.submit(0, 0);
        assert_eq!(ready(&mut rest), data(b""));

        let mut tail = buf.submit(0, 10);
        assert_eq!(ready(&mut tail), data(b"hello"));
        let mut eof = buf.submit(5, 0);
        assert_eq!(ready(&mut eof), Ok(ReadReply::Eof));
    }

    #[test]
    fn test_read_past_end_is_eof() {
        // Client reads offset 5 before offset 0 on a five byte object
        let mut buf = ReadReorderBuffer::new();
        let mut beyond = buf.submit(5, 10);
        let mut first = buf.submit(0, 5);
        buf.on_event(StreamEvent::Data(Bytes::from_static(b"hello")));
        assert_eq!(ready(&mut first), data(b"hello"));
        assert!(still_pending(&mut beyond));

        buf.on_event(StreamEvent::End);
        assert_eq!(ready(&mut beyond), Ok(ReadReply::Eof));
    }

    #[test]
    fn test_empty_object() {
        let mut buf = ReadReorderBuffer::new();
        let mut a = buf.submit(0, 10);
        let mut b = buf.submit(10, 10);
        buf.on_event(StreamEvent::End);
        assert_eq!(ready(&mut a), Ok(ReadReply::Eof));
        assert_eq!(ready(&mut b), Ok(ReadReply::Eof));
    }

    #[test]
    fn test_fault_rejects_all() {
        let mut buf = ReadReorderBuffer::new();
        let mut a = buf.submit(0, 10);
        let mut b = buf.submit(10, 10);
        buf.on_event(StreamEvent::Error("boom".into()));
        assert_eq!(ready(&mut a), Err(ReadError::StreamFaulted("boom".into())));
        assert_eq!(ready(&mut b), Err(ReadError::StreamFaulted("boom".into())));

        let mut late = buf.submit(20, 1);
        assert!(matches!(ready(&mut late), Err(ReadError::StreamFaulted(_))));
        assert_eq!(buf.fault(), Some("boom"));
    }

    #[test]
    fn test_behind_cursor_pends_until_cancel() {
        let mut buf = ReadReorderBuffer::new();
        buf.on_event(StreamEvent::Data(Bytes::from_static(b"0123456789")));
        let mut first = buf.submit(0, 4);
        assert_eq!(ready(&mut first), data(b"0123"));

        let mut behind = buf.submit(2, 2);
        assert!(still_pending(&mut behind));
        assert_eq!(buf.pending_len(), 1);

        buf.cancel();
        assert_eq!(ready(&mut behind), Err(ReadError::Cancelled));
        let mut after = buf.submit(4, 1);
        assert_eq!(ready(&mut after), Err(ReadError::Cancelled));
    }

    #[test]
    fn test_duplicate_offset_rejects_newer() {
        let mut buf = ReadReorderBuffer::new();
        let mut original = buf.submit(4, 4);
        let mut duplicate = buf.submit(4, 8);
        assert_eq!(ready(&mut duplicate), Err(ReadError::DuplicateOffset(4)));

        buf.on_event(StreamEvent::Data(Bytes::from_static(b"01234567")));
        assert!(still_pending(&mut original));
        let mut head = buf.submit(0, 4);
        assert_eq!(ready(&mut head), data(b"0123"));
        assert_eq!(ready(&mut original), data(b"4567"));
    }

    #[test]
    fn test_wants_data() {
        let mut buf = ReadReorderBuffer::new();
        assert!(buf.wants_data(4));
        buf.on_event(StreamEvent::Data(Bytes::from_static(b"0123456")));
        assert!(!buf.wants_data(4));

        let _rx = buf.submit(0, 10);
        assert!(buf.wants_data(4));

        buf.on_event(StreamEvent::End);
        assert!(!buf.wants_data(4));
    }

    /// Partition `[0, n)` into random-sized requests, submit them in a random
    /// order interleaved with random-sized stream chunks, and check every
    /// request gets exactly its slice.
    #[test]
    fn test_random_permutations_reassemble() {
        let mut rng = StdRng::seed_from_u64(0x5f7d);
        for _ in 0..200 {
            let n: usize = rng.gen_range(0..2000);
            let content: Vec<u8> = (0..n).map(|i| (i % 251) as u8).collect();

            let mut requests = Vec::new();
            let mut offset = 0usize;
            while offset < n {
                let len = rng.gen_range(1..=300).min(n - offset);
                requests.push((offset, len));
                offset += len;
            }
            requests.shuffle(&mut rng);

            let mut chunks = Vec::new();
            let mut pos = 0usize;
            while pos < n {
                let len = rng.gen_range(1..=400).min(n - pos);
                chunks.push(Bytes::copy_from_slice(&content[pos..pos + len]));
                pos += len;
            }
            chunks.reverse();

            let mut buf = ReadReorderBuffer::new();
            let mut receivers = Vec::new();
            for (offset, len) in &requests {
                receivers.push((*offset, *len, buf.submit(*offset as u64, *len as u32)));
                if rng.gen_bool(0.5) {
                    if let Some(chunk) = chunks.pop() {
                        buf.on_event(StreamEvent::Data(chunk));
                    }
                }
            }
            while let Some(chunk) = chunks.pop() {
                buf.on_event(StreamEvent::Data(chunk));
            }
            buf.on_event(StreamEvent::End);

            for (offset, len, mut rx) in receivers {
                let expected = Bytes::copy_from_slice(&content[offset..offset + len]);
                assert_eq!(ready(&mut rx), Ok(ReadReply::Data(expected)));
            }
            let mut tail = buf.submit(n as u64, 64);
            assert_eq!(ready(&mut tail), Ok(ReadReply::Eof));
            assert_eq!(buf.cursor(), n as u64);
        }
    }
}
