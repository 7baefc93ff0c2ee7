//! Per-connection message reassembly and outbound queue
//!
//! The transport hands over data in chunks. A message is complete once the
//! transport reports the final fragment with nothing left in the frame; the
//! accumulated bytes are then swapped out and the buffer starts over empty.
//!
//! Outbound messages are queued fully encoded and written one per writable
//! notification. A message may carry a close directive, after which the
//! queue accepts nothing more.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use crate::error::{CloseStatus, ProtocolError};

/// Default ceiling on unconsumed inbound bytes (64 KB)
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Inbound accumulation buffer
#[derive(Debug)]
pub struct Reassembly {
    buf: BytesMut,
    ceiling: usize,
}

impl Reassembly {
    pub fn new(ceiling: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            ceiling,
        }
    }

    /// Append a chunk. Returns the complete message once the frame is done.
    ///
    /// Holding exactly `ceiling` bytes is allowed; one more is a violation
    /// and discards whatever was buffered.
    pub fn push(
        &mut self,
        chunk: &[u8],
        is_final: bool,
        remaining: usize,
    ) -> Result<Option<Bytes>, ProtocolError> {
        let size = self.buf.len() + chunk.len();
        if size > self.ceiling {
            self.buf.clear();
            return Err(ProtocolError::Oversized {
                size,
                max: self.ceiling,
            });
        }

        self.buf.extend_from_slice(chunk);

        if !is_final || remaining > 0 {
            return Ok(None);
        }

        Ok(Some(self.buf.split().freeze()))
    }

    /// Bytes buffered but not yet forming a message
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }
}

impl Default for Reassembly {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_BYTES)
    }
}

/// Close the connection once the message carrying this has been written
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseDirective {
    pub status: CloseStatus,
    pub reason: Bytes,
}

impl CloseDirective {
    pub fn new(status: CloseStatus, reason: impl Into<Bytes>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }
}

/// One queued outbound message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outgoing {
    pub payload: Bytes,
    pub close: Option<CloseDirective>,
}

/// FIFO of encoded outbound messages
#[derive(Debug, Default)]
pub struct SendQueue {
    queue: VecDeque<Outgoing>,
    closing: bool,
}

impl SendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message. Refused once a close directive is pending.
    pub fn push(&mut self, payload: Bytes) -> bool {
        if self.closing {
            return false;
        }
        self.queue.push_back(Outgoing {
            payload,
            close: None,
        });
        true
    }

    /// Queue the last message of the connection
    pub fn push_final(&mut self, payload: Bytes, close: CloseDirective) -> bool {
        if self.closing {
            return false;
        }
        self.closing = true;
        self.queue.push_back(Outgoing {
            payload,
            close: Some(close),
        });
        true
    }

    /// Take the head of the queue
    pub fn pop(&mut self) -> Option<Outgoing> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Whether a close directive has been queued
    pub fn is_closing(&self) -> bool {
        self.closing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_chunk_message() {
        let mut r = Reassembly::default();
        let msg = r.push(b"{\"type\":\"logon\"}", true, 0).unwrap();
        assert_eq!(msg.as_deref(), Some(&b"{\"type\":\"logon\"}"[..]));
        assert!(r.is_empty());
    }

    #[test]
    fn test_fragmented_message() {
        let mut r = Reassembly::default();
        assert!(r.push(b"{\"type\":", false, 0).unwrap().is_none());
        assert!(r.push(b"\"call\",", true, 12).unwrap().is_none());
        assert_eq!(r.len(), 15);
        let msg = r.push(b"\"to\":\"x\"}", true, 0).unwrap().unwrap();
        assert_eq!(&msg[..], b"{\"type\":\"call\",\"to\":\"x\"}");
        assert!(r.is_empty());
    }

    #[test]
    fn test_ceiling_boundary() {
        let mut r = Reassembly::new(16);
        assert!(r.push(&[b'a'; 10], false, 0).unwrap().is_none());
        let msg = r.push(&[b'b'; 6], true, 0).unwrap().unwrap();
        assert_eq!(msg.len(), 16);

        let mut r = Reassembly::new(16);
        assert!(r.push(&[b'a'; 10], false, 0).unwrap().is_none());
        let err = r.push(&[b'b'; 7], false, 0).unwrap_err();
        assert_eq!(err, ProtocolError::Oversized { size: 17, max: 16 });
        assert!(r.is_empty());
    }

    #[test]
    fn test_default_ceiling() {
        let mut r = Reassembly::default();
        assert_eq!(r.ceiling(), 65536);
        assert!(r.push(&vec![b'x'; 65536], false, 1).unwrap().is_none());
        assert!(r.push(b"y", true, 0).is_err());
    }

    #[test]
    fn test_send_queue_fifo() {
        let mut q = SendQueue::new();
        assert!(q.push(Bytes::from_static(b"one")));
        assert!(q.push(Bytes::from_static(b"two")));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop().unwrap().payload, Bytes::from_static(b"one"));
        assert_eq!(q.pop().unwrap().payload, Bytes::from_static(b"two"));
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_send_queue_refuses_after_close() {
        let mut q = SendQueue::new();
        let close = CloseDirective::new(CloseStatus::InvalidPayload, "bye");
        assert!(q.push_final(Bytes::from_static(b"{\"error\":\"x\"}"), close.clone()));
        assert!(q.is_closing());
        assert!(!q.push(Bytes::from_static(b"late")));
        assert!(!q.push_final(Bytes::from_static(b"later"), close.clone()));

        let head = q.pop().unwrap();
        assert_eq!(head.close, Some(close));
        assert!(q.is_empty());
    }
}
