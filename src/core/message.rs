//! Messages as seen by a connection before and after framing.
//!
//! A [`Message`] is what callers hand to a connection. Once the connection
//! assigns it an identifier it becomes a [`HeaderMessage`], the unit every
//! [`Layer`](crate::layer::Layer) packs and unpacks.
//!
//! ## Identifier partition
//! Both ends of a connection issue identifiers concurrently, so the ranges
//! are split by [`Mode`]: initiators use odd numbers, responders use even
//! numbers. Zero never names a message; it marks handshake control frames and
//! encodes "not an answer" in the request id field on the wire.

use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of a framed message, unique per connection and direction.
pub type MessageId = u64;

/// Identifier carried by handshake control frames.
pub const CONTROL_ID: MessageId = 0;

/// Direction tag of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// The side that dialled out (client).
    Initiator,
    /// The side that accepted (server).
    Responder,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Initiator => f.write_str("initiator"),
            Mode::Responder => f.write_str("responder"),
        }
    }
}

/// Payload plus the request it answers, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub payload: Bytes,
    pub request_id: Option<MessageId>,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            request_id: None,
        }
    }

    /// A message answering the request identified by `request_id`.
    pub fn answering(request_id: MessageId, payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            request_id: Some(request_id),
        }
    }
}

/// A message stamped with its identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderMessage {
    pub identifier: MessageId,
    pub request_id: Option<MessageId>,
    pub payload: Bytes,
}

impl HeaderMessage {
    pub fn new(identifier: MessageId, request_id: Option<MessageId>, payload: impl Into<Bytes>) -> Self {
        Self {
            identifier,
            request_id,
            payload: payload.into(),
        }
    }

    /// A handshake control frame.
    pub fn control(payload: impl Into<Bytes>) -> Self {
        Self::new(CONTROL_ID, None, payload)
    }

    pub fn is_control(&self) -> bool {
        self.identifier == CONTROL_ID
    }

    /// Request id as written on the wire (0 when not an answer).
    pub fn wire_request_id(&self) -> u64 {
        self.request_id.unwrap_or(CONTROL_ID)
    }
}

/// Allocates identifiers from the range owned by a [`Mode`].
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU64,
    offset: u64,
}

impl IdAllocator {
    pub fn new(mode: Mode) -> Self {
        let offset = match mode {
            Mode::Initiator => 1,
            Mode::Responder => 2,
        };
        Self {
            next: AtomicU64::new(0),
            offset,
        }
    }

    pub fn next_id(&self) -> MessageId {
        self.next.fetch_add(1, Ordering::Relaxed) * 2 + self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_initiator_ids_are_odd() {
        let ids = IdAllocator::new(Mode::Initiator);
        assert_eq!(
            (0..4).map(|_| ids.next_id()).collect::<Vec<_>>(),
            vec![1, 3, 5, 7]
        );
    }

    #[test]
    fn test_responder_ids_are_even_and_nonzero() {
        let ids = IdAllocator::new(Mode::Responder);
        assert_eq!(
            (0..4).map(|_| ids.next_id()).collect::<Vec<_>>(),
            vec![2, 4, 6, 8]
        );
    }

    #[test]
    fn test_partitions_never_collide() {
        let left = IdAllocator::new(Mode::Initiator);
        let right = IdAllocator::new(Mode::Responder);
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(left.next_id()));
            assert!(seen.insert(right.next_id()));
        }
        assert!(!seen.contains(&CONTROL_ID));
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        let ids = std::sync::Arc::new(IdAllocator::new(Mode::Responder));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = ids.clone();
                std::thread::spawn(move || (0..500).map(|_| ids.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 2000);
    }
}
