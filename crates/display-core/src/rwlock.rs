//! A reentrant reader/writer lock.
//!
//! Unlike [`std::sync::RwLock`], the same thread may acquire this lock more
//! than once: nested reads under a read, nested writes under a write, and a
//! write nested under a read held by the same thread are all permitted
//! without deadlocking. Calling `write()` while the calling thread already
//! holds a read releases that read first and reacquires fresh -- there is
//! no atomic read-to-write upgrade, so another writer may run in between.
//!
//! The lock itself guards no data; callers pair it with state stored
//! alongside it, the same way a mutex can be used purely for its side
//! effect of serialising access to something outside itself.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

#[derive(Clone, Copy, PartialEq, Eq)]
enum HeldMode {
    Read,
    Write,
}

struct ThreadState {
    global_mode: HeldMode,
    depth: u32,
}

enum LockState {
    Free,
    Read(u32),
    Write(ThreadId),
}

struct Inner {
    lock_state: LockState,
    threads: HashMap<ThreadId, ThreadState>,
}

pub struct Rwlock {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl Default for Rwlock {
    fn default() -> Self {
        Self::new()
    }
}

impl Rwlock {
    pub fn new() -> Rwlock {
        Rwlock {
            inner: Mutex::new(Inner { lock_state: LockState::Free, threads: HashMap::new() }),
            cond: Condvar::new(),
        }
    }

    pub fn read(&self) -> RwlockReadGuard<'_> {
        let tid = thread::current().id();
        let mut state = self.inner.lock().unwrap();

        if let Some(ts) = state.threads.get_mut(&tid) {
            ts.depth += 1;
            return RwlockReadGuard { rwlock: self };
        }

        while matches!(state.lock_state, LockState::Write(_)) {
            state = self.cond.wait(state).unwrap();
        }

        state.lock_state = match state.lock_state {
            LockState::Free => LockState::Read(1),
            LockState::Read(n) => LockState::Read(n + 1),
            LockState::Write(_) => unreachable!("just waited past any writer"),
        };
        state.threads.insert(tid, ThreadState { global_mode: HeldMode::Read, depth: 1 });

        RwlockReadGuard { rwlock: self }
    }

    /// Acquires the lock for exclusive access. If the calling thread
    /// already holds a read, that read is released before blocking for the
    /// write -- not an atomic upgrade.
    pub fn write(&self) -> RwlockWriteGuard<'_> {
        let tid = thread::current().id();
        let mut state = self.inner.lock().unwrap();

        if let Some(ts) = state.threads.get_mut(&tid) {
            match ts.global_mode {
                HeldMode::Write => {
                    ts.depth += 1;
                    return RwlockWriteGuard { rwlock: self };
                }
                HeldMode::Read => {
                    release_locked(&mut state, tid);
                    self.cond.notify_all();
                }
            }
        }

        loop {
            match state.lock_state {
                LockState::Free => break,
                _ => state = self.cond.wait(state).unwrap(),
            }
        }

        state.lock_state = LockState::Write(tid);
        state.threads.insert(tid, ThreadState { global_mode: HeldMode::Write, depth: 1 });

        RwlockWriteGuard { rwlock: self }
    }

    fn release(&self, tid: ThreadId) {
        let mut state = self.inner.lock().unwrap();
        release_locked(&mut state, tid);
        drop(state);
        self.cond.notify_all();
    }
}

fn release_locked(state: &mut Inner, tid: ThreadId) {
    let ts = state.threads.get_mut(&tid).expect("release of a lock this thread does not hold");
    ts.depth -= 1;
    if ts.depth > 0 {
        return;
    }
    let mode = ts.global_mode;
    state.threads.remove(&tid);
    state.lock_state = match mode {
        HeldMode::Write => LockState::Free,
        HeldMode::Read => match state.lock_state {
            LockState::Read(n) if n > 1 => LockState::Read(n - 1),
            _ => LockState::Free,
        },
    };
}

pub struct RwlockReadGuard<'a> {
    rwlock: &'a Rwlock,
}

impl Drop for RwlockReadGuard<'_> {
    fn drop(&mut self) {
        self.rwlock.release(thread::current().id());
    }
}

pub struct RwlockWriteGuard<'a> {
    rwlock: &'a Rwlock,
}

impl Drop for RwlockWriteGuard<'_> {
    fn drop(&mut self) {
        self.rwlock.release(thread::current().id());
    }
}

/// Pairs a [`Rwlock`] with the data it guards, the same way the original
/// pairs a raw `pthread_rwlock_t` with a plain struct by convention -- except
/// here the pairing is load-bearing rather than advisory, so a caller cannot
/// reach the data without going through a guard.
pub struct RwCell<T> {
    lock: Rwlock,
    data: std::cell::UnsafeCell<T>,
}

// SAFETY: `Rwlock` only ever hands out a `RwCellReadGuard` to one or more
// threads or a `RwCellWriteGuard` to exactly one thread at a time, the same
// mutual-exclusion guarantee `std::sync::RwLock` relies on for the same
// bound.
unsafe impl<T: Send> Send for RwCell<T> {}
unsafe impl<T: Send + Sync> Sync for RwCell<T> {}

impl<T> RwCell<T> {
    pub fn new(value: T) -> RwCell<T> {
        RwCell { lock: Rwlock::new(), data: std::cell::UnsafeCell::new(value) }
    }

    pub fn read(&self) -> RwCellReadGuard<'_, T> {
        RwCellReadGuard { _guard: self.lock.read(), data: &self.data }
    }

    pub fn write(&self) -> RwCellWriteGuard<'_, T> {
        RwCellWriteGuard { _guard: self.lock.write(), data: &self.data }
    }
}

pub struct RwCellReadGuard<'a, T> {
    _guard: RwlockReadGuard<'a>,
    data: &'a std::cell::UnsafeCell<T>,
}

impl<T> std::ops::Deref for RwCellReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: holding `_guard` proves no writer can be active.
        unsafe { &*self.data.get() }
    }
}

pub struct RwCellWriteGuard<'a, T> {
    _guard: RwlockWriteGuard<'a>,
    data: &'a std::cell::UnsafeCell<T>,
}

impl<T> std::ops::Deref for RwCellWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: holding `_guard` proves no other reader or writer is active.
        unsafe { &*self.data.get() }
    }
}

impl<T> std::ops::DerefMut for RwCellWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: holding `_guard` proves exclusive access.
        unsafe { &mut *self.data.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn nested_read_on_same_thread_does_not_deadlock() {
        let lock = Rwlock::new();
        let outer = lock.read();
        let inner = lock.read();
        drop(inner);
        drop(outer);
    }

    #[test]
    fn nested_write_on_same_thread_does_not_deadlock() {
        let lock = Rwlock::new();
        let outer = lock.write();
        let inner = lock.write();
        drop(inner);
        drop(outer);
    }

    #[test]
    fn writer_may_nest_a_read() {
        let lock = Rwlock::new();
        let w = lock.write();
        let r = lock.read();
        drop(r);
        drop(w);
    }

    #[test]
    fn concurrent_readers_do_not_block_each_other() {
        let lock = Arc::new(Rwlock::new());
        let a = lock.read();
        let lock2 = Arc::clone(&lock);
        let joined = thread::spawn(move || {
            let _b = lock2.read();
        })
        .join();
        drop(a);
        joined.unwrap();
    }

    #[test]
    fn writer_blocks_until_reader_releases() {
        let lock = Arc::new(Rwlock::new());
        let reader = lock.read();
        let wrote = Arc::new(AtomicBool::new(false));

        let writer = {
            let lock = Arc::clone(&lock);
            let wrote = Arc::clone(&wrote);
            thread::spawn(move || {
                let _w = lock.write();
                wrote.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(30));
        assert!(!wrote.load(Ordering::SeqCst));

        drop(reader);
        writer.join().unwrap();
        assert!(wrote.load(Ordering::SeqCst));
    }

    #[test]
    fn write_call_while_holding_read_upgrades_by_dropping_first() {
        let lock = Rwlock::new();
        let r = lock.read();
        drop(r);
        let w = lock.write();
        drop(w);
    }

    #[test]
    fn upgrade_releases_read_before_blocking_for_write() {
        // A second thread takes the read that is about to be dropped by the
        // upgrade path, proving the upgrade genuinely let go of it rather
        // than holding it open underneath the new write.
        let lock = Arc::new(Rwlock::new());
        let r1 = lock.read();

        let lock2 = Arc::clone(&lock);
        let got_read = Arc::new(AtomicBool::new(false));
        let got_read2 = Arc::clone(&got_read);
        let other_reader = thread::spawn(move || {
            let _r2 = lock2.read();
            got_read2.store(true, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
        });

        thread::sleep(Duration::from_millis(10));
        drop(r1);
        other_reader.join().unwrap();
        assert!(got_read.load(Ordering::SeqCst));

        let _w = lock.write();
    }

    #[test]
    fn rwcell_write_is_visible_to_a_later_read() {
        let cell = RwCell::new(vec![1, 2, 3]);
        cell.write().push(4);
        assert_eq!(*cell.read(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn rwcell_allows_concurrent_readers() {
        let cell = Arc::new(RwCell::new(0u32));
        let a = cell.read();
        let cell2 = Arc::clone(&cell);
        let joined = thread::spawn(move || *cell2.read());
        assert_eq!(joined.join().unwrap(), 0);
        drop(a);
    }
}
