//! Per-session outbound message queue.
//!
//! Unbounded FIFO shared between any number of producers (other sessions
//! broadcasting, this session's reader replying) and exactly one consumer,
//! the session's writer unit. The lock is held only for queue operations.

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Queue {
    messages: VecDeque<Bytes>,
    closed: bool,
}

/// Outbound queue with an async wait for the single consumer.
#[derive(Debug, Default)]
pub struct Outbox {
    queue: Mutex<Queue>,
    wakeup: Notify,
}

impl Outbox {
    /// Empty, open queue.
    pub fn new() -> Self {
        Self::default()
    }

    // Every critical section leaves the queue consistent, so a poisoned lock
    // is still safe to use.
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a message and wake the consumer.
    ///
    /// Never blocks on I/O. Returns `false` if the queue was already closed
    /// and the message was dropped.
    pub fn push(&self, message: Bytes) -> bool {
        {
            let mut queue = self.lock();
            if queue.closed {
                return false;
            }
            queue.messages.push_back(message);
        }
        self.wakeup.notify_one();
        true
    }

    /// Wake the consumer so it re-evaluates its stop condition.
    pub fn wake(&self) {
        self.wakeup.notify_one();
    }

    /// Wait for the next message.
    ///
    /// `stopping` is evaluated on every wake-up. Once it returns true the
    /// queue closes: later pushes are dropped, messages already queued are
    /// still returned in order, and `None` is returned when they run out.
    pub async fn next(&self, stopping: impl Fn() -> bool) -> Option<Bytes> {
        loop {
            // Register before checking so a push between the check and the
            // await is not missed.
            let notified = self.wakeup.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut queue = self.lock();
                if !queue.closed && stopping() {
                    queue.closed = true;
                }
                if let Some(message) = queue.messages.pop_front() {
                    return Some(message);
                }
                if queue.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Close the queue and return whatever was left in it.
    pub fn close(&self) -> VecDeque<Bytes> {
        let mut queue = self.lock();
        queue.closed = true;
        std::mem::take(&mut queue.messages)
    }

    /// True once the queue no longer accepts messages.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    /// True if no message is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
