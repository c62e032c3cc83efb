//! Multi-producer channels with a tagged select multiplexer.
//!
//! A [`Channel`] is an unbounded FIFO with a non-blocking `send` and an
//! async single-consumer `recv`. A [`Select`] captures several channels at
//! construction and merges them into one stream of `(tag, value)` pairs,
//! ordered by send completion across all captured channels.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

/// Tag identifying a captured channel within a [`Select`].
pub type ChannelTag = u32;

/// Queue shared between a select and the channels it captured.
struct SelectQueue<T> {
    queue: Mutex<VecDeque<(ChannelTag, T)>>,
    notify: Notify,
}

enum State<T> {
    /// Not captured: sends land in the channel's own queue.
    Direct(VecDeque<T>),
    /// Captured: sends are redirected into the select's queue with the tag
    /// attached. Items enqueued before the capture stay stashed until the
    /// select releases the channel.
    Captured {
        tag: ChannelTag,
        select: Arc<SelectQueue<T>>,
        stashed: VecDeque<T>,
    },
}

struct Shared<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

/// Unbounded multi-producer, single-consumer FIFO of payloads.
///
/// Cloning yields another producer handle over the same queue. At most one
/// task may wait in [`recv`](Channel::recv) at a time.
pub struct Channel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<T: Send> Default for Channel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Channel<T> {
    /// Create a new, empty channel.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Direct(VecDeque::new())),
                notify: Notify::new(),
            }),
        }
    }

    /// Enqueue a value. Never blocks.
    ///
    /// While the channel is captured by a [`Select`], the value is
    /// redirected into the select's queue with the capture tag attached,
    /// bypassing the channel's own queue.
    pub fn send(&self, value: T) {
        let mut state = self.shared.state.lock();
        match &mut *state {
            State::Direct(queue) => {
                queue.push_back(value);
                drop(state);
                self.shared.notify.notify_one();
            },
            State::Captured { tag, select, .. } => {
                select.queue.lock().push_back((*tag, value));
                let select = Arc::clone(select);
                drop(state);
                select.notify.notify_one();
            },
        }
    }

    /// Receive the next value, waiting while the channel is empty.
    ///
    /// While the channel is captured by a [`Select`] this waits until the
    /// select releases it (sends are redirected in the meantime).
    pub async fn recv(&self) -> T {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(value) = self.try_recv() {
                return value;
            }
            notified.await;
        }
    }

    /// Dequeue the next value without waiting.
    ///
    /// Returns `None` when the channel is empty or currently captured.
    pub fn try_recv(&self) -> Option<T> {
        match &mut *self.shared.state.lock() {
            State::Direct(queue) => queue.pop_front(),
            State::Captured { .. } => None,
        }
    }

    /// Number of values waiting in the channel's own queue.
    #[must_use]
    pub fn len(&self) -> usize {
        match &*self.shared.state.lock() {
            State::Direct(queue) => queue.len(),
            State::Captured { stashed, .. } => stashed.len(),
        }
    }

    /// Whether the channel's own queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Merges several captured [`Channel`]s into one ordered stream of
/// `(tag, value)` pairs.
///
/// Capture is installed at construction and released on drop. Ordering is
/// strict FIFO of send completion across all captured channels; there is no
/// fairness guarantee between them. Like [`Channel::recv`], receiving is
/// single-consumer.
pub struct Select<T> {
    shared: Arc<SelectQueue<T>>,
    captured: Vec<Channel<T>>,
}

impl<T: Send> Select<T> {
    /// Capture `channels`, tagging each with the paired [`ChannelTag`].
    ///
    /// Capture is exclusive. Capturing a channel that already belongs to
    /// another select is a programmer error, asserted in debug builds; in
    /// release builds the last capture wins.
    #[must_use]
    pub fn new<'a, I>(channels: I) -> Self
    where
        T: 'a,
        I: IntoIterator<Item = (ChannelTag, &'a Channel<T>)>,
    {
        let shared = Arc::new(SelectQueue {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        });

        let mut captured = Vec::new();
        for (tag, channel) in channels {
            let mut state = channel.shared.state.lock();
            debug_assert!(
                matches!(&*state, State::Direct(_)),
                "channel is already captured by another select"
            );
            let stashed = match std::mem::replace(&mut *state, State::Direct(VecDeque::new())) {
                State::Direct(queue) | State::Captured { stashed: queue, .. } => queue,
            };
            *state = State::Captured { tag, select: Arc::clone(&shared), stashed };
            drop(state);
            captured.push(channel.clone());
        }

        Self { shared, captured }
    }

    /// Receive the next `(tag, value)` pair, waiting while empty.
    pub async fn recv(&self) -> (ChannelTag, T) {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(pair) = self.try_recv() {
                return pair;
            }
            notified.await;
        }
    }

    /// Dequeue the next `(tag, value)` pair without waiting.
    pub fn try_recv(&self) -> Option<(ChannelTag, T)> {
        self.shared.queue.lock().pop_front()
    }

    /// Receive-and-dispatch loop.
    ///
    /// Invokes `dispatch` for every received pair in queue order; a `true`
    /// return terminates the loop. There is no other way to cancel it.
    pub async fn dispatch<F>(&self, mut dispatch: F)
    where
        F: FnMut(ChannelTag, T) -> bool,
    {
        loop {
            let (tag, value) = self.recv().await;
            if dispatch(tag, value) {
                break;
            }
        }
    }
}

impl<T> Drop for Select<T> {
    fn drop(&mut self) {
        for channel in &self.captured {
            let mut state = channel.shared.state.lock();
            // Only release channels this select still owns; a later capture
            // must not be clobbered.
            let owned = matches!(&*state, State::Captured { select, .. } if Arc::ptr_eq(select, &self.shared));
            if !owned {
                continue;
            }
            let stashed = match std::mem::replace(&mut *state, State::Direct(VecDeque::new())) {
                State::Direct(queue) | State::Captured { stashed: queue, .. } => queue,
            };
            let backlog = !stashed.is_empty();
            *state = State::Direct(stashed);
            drop(state);
            if backlog {
                channel.shared.notify.notify_one();
            }
        }
    }
}
