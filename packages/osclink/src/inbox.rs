//! Thread-safe FIFO handing decoded payloads from a reader to the application.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Unbounded FIFO of decoded payloads.
///
/// One background reader pushes, one consumer pops. Each payload is
/// delivered exactly once, in push order.
#[derive(Debug, Default)]
pub struct Inbox {
    queue: Mutex<VecDeque<Vec<u8>>>,
    ready: Condvar,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a payload and wake one waiter.
    pub fn push(&self, payload: Vec<u8>) {
        let mut queue = self.lock();
        queue.push_back(payload);
        self.ready.notify_one();
    }

    /// Pop the oldest payload without blocking.
    pub fn try_pop(&self) -> Option<Vec<u8>> {
        self.lock().pop_front()
    }

    /// Block until a payload is available and pop it.
    pub fn wait_and_pop(&self) -> Vec<u8> {
        let mut queue = self.lock();
        loop {
            if let Some(payload) = queue.pop_front() {
                return payload;
            }
            queue = self
                .ready
                .wait(queue)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Block for at most `timeout` waiting for a payload.
    pub fn wait_timeout_and_pop(&self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.lock();
        loop {
            if let Some(payload) = queue.pop_front() {
                return Some(payload);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let (guard, _) = self
                .ready
                .wait_timeout(queue, remaining)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            queue = guard;
        }
    }

    /// Number of queued payloads. Advisory only: the reader may push
    /// concurrently.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything queued, returning how many payloads were discarded.
    pub fn clear(&self) -> usize {
        let mut queue = self.lock();
        let dropped = queue.len();
        queue.clear();
        dropped
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Vec<u8>>> {
        // A panicking producer cannot leave the queue half-updated.
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
