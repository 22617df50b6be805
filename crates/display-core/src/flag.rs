//! A condition-guarded bitmask, built on a standard [`Mutex`]/[`Condvar`]
//! pair rather than the condvar-plus-recursive-mutex primitive it replaces.
//!
//! The same thread may acquire a [`Flag`] multiple times (directly, or by
//! calling a method that acquires while already holding a guard from an
//! earlier call further up the stack); the underlying mutex is only
//! actually released once the outermost guard is dropped. `wait`/`timedwait`
//! express the "block until the bitmask matches, keeping the lock on
//! return" contract as a guard returned from the call, rather than as a
//! side effect the caller must remember to undo.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

struct Inner {
    value: u32,
    owner: Option<ThreadId>,
    depth: u32,
}

/// A condvar-guarded bitmask with a reentrant acquisition discipline.
pub struct Flag {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl Default for Flag {
    fn default() -> Self {
        Self::new()
    }
}

impl Flag {
    pub fn new() -> Flag {
        Flag { inner: Mutex::new(Inner { value: 0, owner: None, depth: 0 }), cond: Condvar::new() }
    }

    /// Acquires the lock (reentrant for the calling thread), performing no
    /// wait on `value`.
    pub fn lock(&self) -> FlagGuard<'_> {
        let tid = thread::current().id();
        let mut guard = self.inner.lock().unwrap();
        loop {
            match guard.owner {
                None => {
                    guard.owner = Some(tid);
                    guard.depth = 1;
                    break;
                }
                Some(owner) if owner == tid => {
                    guard.depth += 1;
                    break;
                }
                Some(_) => {
                    guard = self.cond.wait(guard).unwrap();
                }
            }
        }
        drop(guard);
        FlagGuard { flag: self }
    }

    /// Ors `bits` into the mask and, if the value actually changed,
    /// broadcasts to every waiter.
    pub fn set(&self, bits: u32) {
        let _guard = self.set_and_lock(bits);
    }

    pub fn set_and_lock(&self, bits: u32) -> FlagGuard<'_> {
        let guard = self.lock();
        let mut inner = self.inner.lock().unwrap();
        let before = inner.value;
        inner.value |= bits;
        let changed = inner.value != before;
        drop(inner);
        if changed {
            self.cond.notify_all();
        }
        guard
    }

    /// Ands `!bits` into the mask. Never broadcasts -- clearing bits can
    /// never satisfy a waiter that wasn't already satisfied.
    pub fn clear(&self, bits: u32) {
        let _guard = self.clear_and_lock(bits);
    }

    pub fn clear_and_lock(&self, bits: u32) -> FlagGuard<'_> {
        let guard = self.lock();
        let mut inner = self.inner.lock().unwrap();
        inner.value &= !bits;
        drop(inner);
        guard
    }

    /// Blocks until `value & mask != 0`, returning a guard that holds the
    /// lock.
    pub fn wait_and_lock(&self, mask: u32) -> FlagGuard<'_> {
        let guard = self.lock();
        loop {
            let value = self.inner.lock().unwrap().value;
            if value & mask != 0 {
                return guard;
            }
            self.reacquire_on_wait(mask, None);
        }
    }

    /// Waits for `value & mask != 0` for up to `timeout`, returning `None`
    /// (without ever having released the lock to an outside acquirer, same
    /// as the other `_and_lock` variants) if the deadline passes first. A
    /// zero-duration timeout is a non-blocking poll.
    pub fn timedwait_and_lock(&self, mask: u32, timeout: Duration) -> Option<FlagGuard<'_>> {
        let guard = self.lock();
        let deadline = Instant::now() + timeout;

        loop {
            let value = self.inner.lock().unwrap().value;
            if value & mask != 0 {
                return Some(guard);
            }
            if timeout.is_zero() {
                drop(guard);
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                drop(guard);
                return None;
            }
            self.reacquire_on_wait(mask, Some(deadline - now));
        }
    }

    /// Releases the current thread's hold on the lock (all the way down to
    /// depth zero) and blocks on the shared condvar for up to `budget`
    /// (forever if `None`), then reacquires before returning.
    fn reacquire_on_wait(&self, _mask: u32, budget: Option<Duration>) {
        let tid = thread::current().id();
        let mut inner = self.inner.lock().unwrap();
        debug_assert_eq!(inner.owner, Some(tid));
        let saved_depth = inner.depth;
        inner.owner = None;
        inner.depth = 0;
        self.cond.notify_all();

        inner = match budget {
            Some(d) => self.cond.wait_timeout(inner, d).unwrap().0,
            None => self.cond.wait(inner).unwrap(),
        };

        // Reclaim ownership at the depth we released, contending with any
        // other thread that grabbed it in between.
        loop {
            match inner.owner {
                None => {
                    inner.owner = Some(tid);
                    inner.depth = saved_depth;
                    return;
                }
                Some(owner) if owner == tid => {
                    inner.depth += saved_depth;
                    return;
                }
                Some(_) => {
                    inner = self.cond.wait(inner).unwrap();
                }
            }
        }
    }

    fn unlock_one_level(&self) {
        let tid = thread::current().id();
        let mut inner = self.inner.lock().unwrap();
        debug_assert_eq!(inner.owner, Some(tid));
        inner.depth -= 1;
        if inner.depth == 0 {
            inner.owner = None;
            drop(inner);
            self.cond.notify_all();
        }
    }

    /// A snapshot of the current bitmask. Useful for diagnostics; not part
    /// of the synchronisation contract.
    pub fn snapshot(&self) -> u32 {
        self.inner.lock().unwrap().value
    }
}

/// RAII guard representing one level of a thread's (possibly reentrant)
/// hold on a [`Flag`]'s lock. Dropping it releases exactly that level.
pub struct FlagGuard<'a> {
    flag: &'a Flag,
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.flag.unlock_one_level();
    }
}

/// A small FIFO list of threads parked on a specific wait predicate, kept
/// only for `#[cfg(test)]` diagnostics; production code relies entirely on
/// the condvar's own wake-all semantics.
#[cfg(test)]
#[allow(dead_code)]
struct WaiterLog(VecDeque<ThreadId>);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn set_wakes_a_waiter() {
        let flag = Arc::new(Flag::new());
        let waiter = {
            let flag = Arc::clone(&flag);
            thread::spawn(move || {
                let _guard = flag.wait_and_lock(0b10);
                flag.snapshot()
            })
        };

        thread::sleep(Duration::from_millis(20));
        flag.set(0b10);

        let value = waiter.join().unwrap();
        assert_eq!(value & 0b10, 0b10);
    }

    #[test]
    fn clear_never_wakes_a_waiter() {
        let flag = Arc::new(Flag::new());
        let waiter = {
            let flag = Arc::clone(&flag);
            thread::spawn(move || flag.timedwait_and_lock(0b10, Duration::from_millis(100)).is_some())
        };

        thread::sleep(Duration::from_millis(10));
        flag.clear(0b10);

        assert!(!waiter.join().unwrap());
    }

    #[test]
    fn timedwait_zero_is_nonblocking_poll() {
        let flag = Flag::new();
        assert!(flag.timedwait_and_lock(0b1, Duration::ZERO).is_none());
        flag.set(0b1);
        assert!(flag.timedwait_and_lock(0b1, Duration::ZERO).is_some());
    }

    #[test]
    fn reentrant_lock_from_same_thread_does_not_deadlock() {
        let flag = Flag::new();
        let outer = flag.lock();
        let inner = flag.lock();
        drop(inner);
        drop(outer);
    }

    #[test]
    fn nested_set_and_lock_observes_prior_set() {
        let flag = Flag::new();
        let _outer = flag.set_and_lock(0b1);
        let inner = flag.wait_and_lock(0b1);
        assert_eq!(flag.snapshot() & 0b1, 0b1);
        drop(inner);
    }
}
