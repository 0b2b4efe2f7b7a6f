//! Request/response correlation.
//!
//! Every registered callback is resolved exactly once, by whichever of the
//! answer, its timer, or connection loss removes it from the table first.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::core::message::{HeaderMessage, MessageId};
use crate::error::{constants, ProtocolError, Result};
use crate::utils::metrics::global_metrics;

/// How a request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    Response(HeaderMessage),
    Timeout,
    ConnectionLost,
}

impl CallbackOutcome {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CallbackOutcome::Timeout)
    }

    pub fn is_connection_lost(&self) -> bool {
        matches!(self, CallbackOutcome::ConnectionLost)
    }

    pub fn response(&self) -> Option<&HeaderMessage> {
        match self {
            CallbackOutcome::Response(frame) => Some(frame),
            _ => None,
        }
    }
}

/// Result handler of one request.
pub type Callback = Box<dyn FnOnce(CallbackOutcome) + Send + 'static>;

struct Pending {
    handler: Callback,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct Table {
    entries: HashMap<MessageId, Pending>,
    closed: bool,
}

/// Pending callbacks of one connection, keyed by request identifier.
#[derive(Clone, Default)]
pub struct CallbackTable {
    inner: Arc<Mutex<Table>>,
}

impl CallbackTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Await an answer to `request_id` for at most `timeout`.
    ///
    /// Fails once the table has been closed by [`fail_all`](Self::fail_all);
    /// the handler is then dropped without running. Must be called within a
    /// Tokio runtime.
    pub fn register(&self, request_id: MessageId, timeout: Duration, handler: Callback) -> Result<()> {
        let mut table = self
            .inner
            .lock()
            .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.into()))?;
        if table.closed {
            return Err(ProtocolError::Disposed);
        }

        // Spawned under the lock so the timer cannot observe a missing entry
        let inner = Arc::clone(&self.inner);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            Self::expire(&inner, request_id);
        });

        if let Some(previous) = table.entries.insert(request_id, Pending { handler, timer }) {
            previous.timer.abort();
            debug!(request_id, "Replaced pending callback");
        }
        global_metrics().callback_registered();
        trace!(request_id, timeout_ms = timeout.as_millis() as u64, "Callback registered");
        Ok(())
    }

    fn expire(inner: &Mutex<Table>, request_id: MessageId) {
        let pending = match inner.lock() {
            Ok(mut table) => table.entries.remove(&request_id),
            Err(_) => None,
        };
        if let Some(pending) = pending {
            debug!(request_id, "Callback timed out");
            global_metrics().callback_timed_out();
            (pending.handler)(CallbackOutcome::Timeout);
        }
    }

    /// Hand `frame` to the callback awaiting it.
    ///
    /// Gives the frame back when nothing is waiting for its request id.
    pub fn resolve(&self, frame: HeaderMessage) -> Option<HeaderMessage> {
        let Some(request_id) = frame.request_id else {
            return Some(frame);
        };
        let pending = match self.inner.lock() {
            Ok(mut table) => table.entries.remove(&request_id),
            Err(_) => None,
        };
        match pending {
            Some(pending) => {
                pending.timer.abort();
                global_metrics().callback_answered();
                (pending.handler)(CallbackOutcome::Response(frame));
                None
            }
            None => Some(frame),
        }
    }

    /// Close the table and resolve everything pending with
    /// [`CallbackOutcome::ConnectionLost`]. Returns how many were resolved.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<Pending> = match self.inner.lock() {
            Ok(mut table) => {
                table.closed = true;
                table.entries.drain().map(|(_, pending)| pending).collect()
            }
            Err(_) => Vec::new(),
        };

        let count = drained.len();
        for pending in drained {
            pending.timer.abort();
            global_metrics().callback_lost();
            (pending.handler)(CallbackOutcome::ConnectionLost);
        }
        count
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().map(|table| table.entries.len()).unwrap_or(0)
    }
}

impl fmt::Debug for CallbackTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackTable")
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    fn capture() -> (Callback, oneshot::Receiver<CallbackOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
            rx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires() {
        let table = CallbackTable::new();
        let (handler, rx) = capture();
        table.register(1, Duration::from_millis(50), handler).unwrap();

        assert!(rx.await.unwrap().is_timeout());
        assert_eq!(table.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_beats_timer() {
        let table = CallbackTable::new();
        let (handler, rx) = capture();
        table.register(3, Duration::from_millis(50), handler).unwrap();

        let answer = HeaderMessage::new(2, Some(3), &b"pong"[..]);
        assert!(table.resolve(answer.clone()).is_none());
        assert_eq!(rx.await.unwrap(), CallbackOutcome::Response(answer));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(table.pending(), 0);
    }

    #[tokio::test]
    async fn test_unmatched_frame_returned() {
        let table = CallbackTable::new();
        let unsolicited = HeaderMessage::new(2, None, &b"x"[..]);
        assert_eq!(table.resolve(unsolicited.clone()), Some(unsolicited));

        let stray = HeaderMessage::new(4, Some(99), &b"y"[..]);
        assert_eq!(table.resolve(stray.clone()), Some(stray));
    }

    #[tokio::test]
    async fn test_fail_all_closes_table() {
        let table = CallbackTable::new();
        let (first, first_rx) = capture();
        let (second, second_rx) = capture();
        table.register(1, Duration::from_secs(60), first).unwrap();
        table.register(3, Duration::from_secs(60), second).unwrap();

        assert_eq!(table.fail_all(), 2);
        assert!(first_rx.await.unwrap().is_connection_lost());
        assert!(second_rx.await.unwrap().is_connection_lost());

        let (late, _) = capture();
        assert!(matches!(
            table.register(5, Duration::from_secs(1), late),
            Err(ProtocolError::Disposed)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_resolution_fires_once() {
        for round in 0..50u64 {
            let table = CallbackTable::new();
            let fired = Arc::new(AtomicUsize::new(0));
            let counter = fired.clone();
            table
                .register(
                    round * 2 + 1,
                    Duration::from_micros(round * 20),
                    Box::new(move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }),
                )
                .unwrap();

            let answering = table.clone();
            let answer = tokio::spawn(async move {
                answering.resolve(HeaderMessage::new(2, Some(round * 2 + 1), &b"r"[..]));
            });
            let failing = table.clone();
            let fail = tokio::spawn(async move {
                failing.fail_all();
            });
            answer.await.unwrap();
            fail.await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;

            assert_eq!(fired.load(Ordering::SeqCst), 1, "round {round}");
        }
    }
}
