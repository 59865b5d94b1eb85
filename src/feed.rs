//! Ordered fan-out feed with a bounded replay buffer.
//!
//! A [`ReplayFeed`] keeps the last `capacity` published items in a ring
//! buffer. A new subscriber first receives that buffered history and then
//! every item published afterwards, with no gap and no duplicate between the
//! two: buffering and registration happen under the same lock as publishing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// A subscription to a [`ReplayFeed`]. Ends once the feed is closed and
/// every buffered item has been yielded.
pub type FeedStream<T> = UnboundedReceiverStream<T>;

struct FeedState<T> {
    buffer: VecDeque<T>,
    capacity: usize,
    subscribers: Vec<mpsc::UnboundedSender<T>>,
    closed: bool,
}

/// Ordered multi-subscriber feed with bounded replay.
///
/// `Clone` is cheap; clones share the same buffer and subscriber list.
pub struct ReplayFeed<T> {
    state: Arc<Mutex<FeedState<T>>>,
}

impl<T> Clone for ReplayFeed<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> std::fmt::Debug for ReplayFeed<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("ReplayFeed")
            .field("buffered", &state.buffer.len())
            .field("capacity", &state.capacity)
            .field("subscribers", &state.subscribers.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl<T: Clone + Send + 'static> ReplayFeed<T> {
    /// Create an open feed replaying up to `capacity` recent items.
    ///
    /// A capacity of `0` disables replay: subscribers only see items
    /// published after they subscribe.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(FeedState {
                buffer: VecDeque::with_capacity(capacity.min(1024)),
                capacity,
                subscribers: Vec::new(),
                closed: false,
            })),
        }
    }

    /// Publish `item` to every live subscriber and the replay buffer.
    ///
    /// Returns `false` without publishing if the feed is closed.
    pub fn publish(&self, item: T) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        if state.capacity > 0 {
            if state.buffer.len() == state.capacity {
                state.buffer.pop_front();
            }
            state.buffer.push_back(item.clone());
        }
        // Dropped receivers are pruned as we go.
        state.subscribers.retain(|tx| tx.send(item.clone()).is_ok());
        true
    }

    /// Subscribe: buffered history first, then live items.
    ///
    /// Subscribing to a closed feed yields the remaining buffer and ends.
    pub fn subscribe(&self) -> FeedStream<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        for item in &state.buffer {
            // The receiver is still in scope, so this cannot fail.
            let _ = tx.send(item.clone());
        }
        if !state.closed {
            state.subscribers.push(tx);
        }
        UnboundedReceiverStream::new(rx)
    }

    /// Close the feed. Existing subscriptions end after draining.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.subscribers.clear();
    }

    /// Returns `true` once [`close`](ReplayFeed::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Copy of the currently buffered history, oldest first.
    pub fn snapshot(&self) -> Vec<T> {
        self.lock().buffer.iter().cloned().collect()
    }
}

impl<T> ReplayFeed<T> {
    fn lock(&self) -> MutexGuard<'_, FeedState<T>> {
        // No user code runs under this lock, so a poisoned state is still
        // structurally valid.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
