//! A bounded, ordered queue whose full/empty/invalidated state is exposed
//! as a [`Flag`] bitmask, so producers and consumers can block on exactly
//! the transition they care about instead of polling.
//!
//! `invalidate` is one-shot: once called, every blocked or future
//! `enqueue`/`dequeue` call returns [`FifoError::Invalidated`] instead of
//! blocking, which is how shutdown is propagated to a pool of worker
//! threads parked in `dequeue_and_lock`.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::flag::Flag;

/// Set while the queue has room for at least one more item.
const READY: u32 = 0b001;
/// Set while the queue holds at least one item.
const NONEMPTY: u32 = 0b010;
/// Set once [`Fifo::invalidate`] has been called. Permanent.
const INVALID: u32 = 0b100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FifoError {
    #[error("fifo has been invalidated")]
    Invalidated,
}

struct Ring<T> {
    items: VecDeque<T>,
    capacity: usize,
}

/// A bounded FIFO queue with a condition-guarded ready/nonempty/invalid
/// bitmask.
pub struct Fifo<T> {
    state: Mutex<Ring<T>>,
    flag: Flag,
}

impl<T> Fifo<T> {
    /// `capacity` must be at least 1.
    pub fn new(capacity: usize) -> Fifo<T> {
        assert!(capacity > 0, "a fifo of capacity zero can never be ready");
        let flag = Flag::new();
        flag.set(READY);
        Fifo { state: Mutex::new(Ring { items: VecDeque::with_capacity(capacity), capacity }), flag }
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().unwrap().capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blocks until there is room, then appends `item`. Returns
    /// [`FifoError::Invalidated`] if the queue has been shut down, whether
    /// that happened before the call or while it was blocked.
    pub fn enqueue(&self, item: T) -> Result<(), FifoError> {
        loop {
            let guard = self.flag.wait_and_lock(READY | INVALID);
            if self.flag.snapshot() & INVALID != 0 {
                drop(guard);
                return Err(FifoError::Invalidated);
            }

            let mut state = self.state.lock().unwrap();
            if state.items.len() >= state.capacity {
                // Lost a race with another producer; drop both locks and
                // wait again for room to reappear.
                drop(state);
                drop(guard);
                continue;
            }
            state.items.push_back(item);
            let full = state.items.len() >= state.capacity;
            drop(state);

            self.flag.set(NONEMPTY);
            if full {
                self.flag.clear(READY);
            }
            return Ok(());
        }
    }

    /// Blocks until an item is available (or the queue is invalidated),
    /// then removes and returns the oldest item.
    pub fn dequeue(&self) -> Result<T, FifoError> {
        self.dequeue_and_lock().map(|(item, _guard)| item)
    }

    /// Like [`Fifo::dequeue`], but keeps the queue's flag locked on return
    /// so the caller can perform follow-on bookkeeping (for example,
    /// marking a frame "in progress") atomically with having taken the
    /// item.
    pub fn dequeue_and_lock(&self) -> Result<(T, FifoGuard<'_, T>), FifoError> {
        loop {
            let guard = self.flag.wait_and_lock(NONEMPTY | INVALID);

            let mut state = self.state.lock().unwrap();
            if let Some(item) = state.items.pop_front() {
                let empty_now = state.items.is_empty();
                drop(state);

                self.flag.set(READY);
                if empty_now {
                    self.flag.clear(NONEMPTY);
                }
                return Ok((item, FifoGuard { fifo: self, _guard: guard }));
            }
            drop(state);

            if self.flag.snapshot() & INVALID != 0 {
                drop(guard);
                return Err(FifoError::Invalidated);
            }
            // NONEMPTY was set but another consumer won the race; loop.
            drop(guard);
        }
    }

    /// Shuts the queue down: every blocked and future `enqueue`/`dequeue`
    /// call fails with [`FifoError::Invalidated`]. Idempotent.
    pub fn invalidate(&self) {
        self.flag.set(INVALID);
    }

    pub fn is_invalidated(&self) -> bool {
        self.flag.snapshot() & INVALID != 0
    }
}

/// Holds the queue's internal flag locked after a successful
/// [`Fifo::dequeue_and_lock`], so the caller can pair "take the item" with
/// another state transition without another thread observing the queue in
/// between.
pub struct FifoGuard<'a, T> {
    fifo: &'a Fifo<T>,
    _guard: crate::flag::FlagGuard<'a>,
}

impl<T> FifoGuard<'_, T> {
    pub fn is_invalidated(&self) -> bool {
        self.fifo.is_invalidated()
    }
}
