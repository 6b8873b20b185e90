// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A queue whose consumers peek at the head and remove it conditionally.
//!
//! This lets several consumers work on the same head item (e.g. a task factory
//! that hands out tasks to all the worker threads) and lets whichever consumer
//! observes that the item is exhausted remove it, without racing a producer or
//! another consumer that has already replaced the head.

use crate::core::util::Status;
use std::collections::VecDeque;
use std::time::Duration;

struct QueueState<T> {
    /// Current head. Whenever it is empty, the overflow is empty too.
    head: Option<T>,
    overflow: VecDeque<T>,
    closed: bool,
}

impl<T> QueueState<T> {
    fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    fn len(&self) -> usize {
        usize::from(self.head.is_some()) + self.overflow.len()
    }
}

/// A multi-producer multi-consumer queue with a peekable head.
pub struct PeekableQueue<T> {
    status: Status<QueueState<T>>,
}

impl<T: Clone + PartialEq> PeekableQueue<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            status: Status::new(QueueState {
                head: None,
                overflow: VecDeque::new(),
                closed: false,
            }),
        }
    }

    /// Appends an item to the queue. The item goes directly to the head slot if
    /// the queue was empty, waking up the consumers blocked on an empty queue.
    ///
    /// Returns false (and drops the item) if the queue has been closed.
    pub fn add(&self, item: T) -> bool {
        let mut state = self.status.lock();
        if state.closed {
            return false;
        }
        if state.head.is_none() {
            state.head = Some(item);
            drop(state);
            self.status.wake_all();
        } else {
            state.overflow.push_back(item);
        }
        true
    }

    /// Returns a clone of the head, blocking while the queue is empty.
    ///
    /// Returns [`None`] only once the queue is closed and empty.
    pub fn peek_block_if_empty(&self) -> Option<T> {
        let state = self
            .status
            .wait_while(|state| state.is_empty() && !state.closed);
        state.head.clone()
    }

    /// Returns a clone of the head, blocking while the queue is empty for at
    /// most the given timeout.
    pub fn peek_timeout(&self, timeout: Duration) -> Option<T> {
        let (state, _timed_out) = self
            .status
            .wait_timeout_while(timeout, |state| state.is_empty() && !state.closed);
        state.head.clone()
    }

    /// Returns a clone of the head, without blocking.
    pub fn peek(&self) -> Option<T> {
        self.status.lock().head.clone()
    }

    /// Removes the head if it is equal to the given item, promoting the next
    /// item of the queue to the head. Otherwise, leaves the queue unchanged.
    ///
    /// Returns whether the head was removed.
    pub fn remove_if_same(&self, item: &T) -> bool {
        let mut state = self.status.lock();
        if state.head.as_ref() != Some(item) {
            return false;
        }
        state.head = state.overflow.pop_front();
        true
    }

    /// Number of items in the queue.
    pub fn len(&self) -> usize {
        self.status.lock().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.status.lock().is_empty()
    }

    /// Closes the queue: later calls to [`add()`](Self::add) are rejected, and
    /// blocked consumers are woken up. Items already queued remain available.
    pub fn close(&self) {
        self.status.update_and_notify_all(|state| state.closed = true);
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.status.lock().closed
    }
}

impl<T: Clone + PartialEq> Default for PeekableQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};

    #[test]
    fn test_fifo_order() {
        let queue = PeekableQueue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.peek(), None);
        for i in 1..=3 {
            assert!(queue.add(i));
        }
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.peek_block_if_empty(), Some(1));
        // Peeking doesn't remove.
        assert_eq!(queue.peek(), Some(1));
        assert!(queue.remove_if_same(&1));
        assert_eq!(queue.peek(), Some(2));
        assert!(queue.remove_if_same(&2));
        assert!(queue.remove_if_same(&3));
        assert!(queue.is_empty());
        assert!(!queue.remove_if_same(&3));
    }

    #[test]
    fn test_remove_if_same_ignores_stale_head() {
        let queue = PeekableQueue::new();
        queue.add("a");
        queue.add("b");
        let seen = queue.peek().unwrap();
        // Another consumer removes the head first.
        assert!(queue.remove_if_same(&seen));
        // The stale removal doesn't touch the new head.
        assert!(!queue.remove_if_same(&seen));
        assert_eq!(queue.peek(), Some("b"));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_peek_timeout() {
        let queue = PeekableQueue::<u32>::new();
        assert_eq!(queue.peek_timeout(Duration::from_millis(5)), None);
        queue.add(7);
        assert_eq!(queue.peek_timeout(Duration::from_secs(10)), Some(7));
    }

    #[test]
    fn test_add_wakes_blocked_consumer() {
        let queue = Arc::new(PeekableQueue::new());
        let consumer = std::thread::spawn({
            let queue = queue.clone();
            move || queue.peek_block_if_empty()
        });
        std::thread::sleep(Duration::from_millis(10));
        queue.add(42);
        assert_eq!(consumer.join().unwrap(), Some(42));
    }

    #[test]
    fn test_close() {
        let queue = Arc::new(PeekableQueue::new());
        let consumer = std::thread::spawn({
            let queue = queue.clone();
            move || queue.peek_block_if_empty()
        });
        std::thread::sleep(Duration::from_millis(10));
        queue.close();
        assert_eq!(consumer.join().unwrap(), None::<u32>);
        assert!(queue.is_closed());
        assert!(!queue.add(1));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_close_keeps_queued_items() {
        let queue = PeekableQueue::new();
        queue.add(1);
        queue.add(2);
        queue.close();
        assert_eq!(queue.peek_block_if_empty(), Some(1));
        assert!(queue.remove_if_same(&1));
        assert_eq!(queue.peek_block_if_empty(), Some(2));
        assert!(queue.remove_if_same(&2));
        assert_eq!(queue.peek_block_if_empty(), None);
    }

    #[test]
    fn test_concurrent_consumers_remove_each_item_once() {
        const NUM_ITEMS: usize = 1000;
        const NUM_CONSUMERS: usize = 4;
        let queue = PeekableQueue::new();
        let removed = AtomicUsize::new(0);
        let barrier = Barrier::new(NUM_CONSUMERS + 1);
        std::thread::scope(|scope| {
            for _ in 0..NUM_CONSUMERS {
                scope.spawn(|| {
                    barrier.wait();
                    while let Some(item) = queue.peek_block_if_empty() {
                        if queue.remove_if_same(&item) {
                            removed.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
            barrier.wait();
            for i in 0..NUM_ITEMS {
                queue.add(i);
            }
            while !queue.is_empty() {
                std::thread::yield_now();
            }
            queue.close();
        });
        assert_eq!(removed.load(Ordering::SeqCst), NUM_ITEMS);
    }
}
