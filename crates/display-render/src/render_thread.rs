//! The render thread's frame-boundary heuristic: absent an explicit
//! boundary from the caller, infer one from a mix of elapsed time and
//! drawing activity, while compensating for how far behind the client is.
//!
//! The thread itself only decides *when* to flush; it has no notion of
//! sockets, clients, or RTT measurement. Those live on the far side of the
//! `lag_hint` closure passed to [`run`], which stands in for the transport
//! layer's processing-lag estimate -- itself out of scope here.

use display_core::Flag;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

pub const STOPPING: u32 = 1;
pub const FRAME_MODIFIED: u32 = 2;
pub const FRAME_READY: u32 = 4;

/// Ensures at least a 10fps frame rate even without explicit boundaries.
pub const MAX_FRAME_DURATION: Duration = Duration::from_millis(100);
/// Caps the heuristic frame rate at 100fps.
pub const MIN_FRAME_DURATION: Duration = Duration::from_millis(10);
/// Upper bound on how long a frame will be held back to let a lagging
/// client catch up.
pub const MAX_LAG_COMPENSATION: Duration = Duration::from_millis(500);

/// Mouse state as last reported by a client, tracked independently of the
/// display's own locks so handling "the mouse moved" never has to wait on a
/// frame in progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CursorState {
    pub x: i32,
    pub y: i32,
    pub mask: u32,
    pub user_known: bool,
}

/// Owns the render thread's own synchronisation state: a [`Flag`] carrying
/// the stop/modified/ready bits, the latest reported cursor position, and
/// the count of explicit frame boundaries accumulated since the last flush.
#[derive(Default)]
pub struct RenderThread {
    pub flag: Flag,
    cursor: Mutex<CursorState>,
    frames: Mutex<u64>,
}

impl RenderThread {
    pub fn new() -> RenderThread {
        RenderThread::default()
    }

    /// Called whenever drawing activity occurs, heuristically indicating a
    /// frame boundary may be near.
    pub fn notify_modified(&self) {
        self.flag.set(FRAME_MODIFIED);
    }

    /// Called when the back-end explicitly marks a frame boundary.
    pub fn notify_frame(&self) {
        let guard = self.flag.set_and_lock(FRAME_READY);
        *self.frames.lock().unwrap() += 1;
        drop(guard);
    }

    /// Records the latest mouse position/button state reported by a user,
    /// without touching any lock the drawing path might be contending for.
    pub fn notify_user_moved_mouse(&self, x: i32, y: i32, mask: u32) {
        let guard = self.flag.set_and_lock(FRAME_MODIFIED);
        *self.cursor.lock().unwrap() = CursorState { x, y, mask, user_known: true };
        drop(guard);
    }

    pub fn stop(&self) {
        self.flag.set(STOPPING);
    }
}

/// Drives the render thread's main loop until [`RenderThread::stop`] is
/// called. `lag_hint` returns the client's estimated processing lag minus
/// how long it's already been waiting, in whole milliseconds (may be
/// negative); `end_multiple_frames` is invoked once per flush with the
/// latest cursor snapshot and the number of explicit frame boundaries
/// accumulated since the previous flush.
pub fn run<L, F>(thread: &RenderThread, mut lag_hint: L, mut end_multiple_frames: F)
where
    L: FnMut() -> i64,
    F: FnMut(CursorState, u64),
{
    loop {
        let guard = thread.flag.wait_and_lock(STOPPING | FRAME_MODIFIED | FRAME_READY);
        let stopping = thread.flag.snapshot() & STOPPING != 0;
        drop(guard);
        if stopping {
            return;
        }

        let (cursor, rendered_frames) = run_one_frame(thread, &mut lag_hint);
        end_multiple_frames(cursor, rendered_frames);
    }
}

fn run_one_frame<L>(thread: &RenderThread, lag_hint: &mut L) -> (CursorState, u64)
where
    L: FnMut() -> i64,
{
    let frame_start = Instant::now();
    let mut rendered_frames = 0u64;
    let mut cursor = *thread.cursor.lock().unwrap();

    loop {
        let elapsed = frame_start.elapsed();
        if elapsed >= MAX_FRAME_DURATION {
            break;
        }

        cursor = *thread.cursor.lock().unwrap();
        thread.flag.clear(FRAME_MODIFIED);

        let required_wait_ms = required_wait_ms(lag_hint(), elapsed);
        if required_wait_ms > 0 {
            thread::sleep(Duration::from_millis(required_wait_ms as u64));
        }

        if let Some(guard) = thread.flag.timedwait_and_lock(FRAME_READY, Duration::ZERO) {
            drop(guard);
            rendered_frames += std::mem::take(&mut *thread.frames.lock().unwrap());
            thread.flag.clear(FRAME_READY | FRAME_MODIFIED);
            break;
        }

        match thread.flag.timedwait_and_lock(STOPPING | FRAME_MODIFIED | FRAME_READY, Duration::ZERO) {
            Some(guard) => drop(guard),
            None => break,
        }
    }

    (cursor, rendered_frames)
}

/// `required_wait = clamp(lag_hint, MIN_FRAME_DURATION - elapsed, MAX_LAG_COMPENSATION)`,
/// mirroring the original's two-sided clamp: never so little that we'd
/// exceed 100fps, never so much that a slow client stalls the frame
/// indefinitely.
fn required_wait_ms(lag_hint_ms: i64, elapsed: Duration) -> i64 {
    let minimum = MIN_FRAME_DURATION.as_millis() as i64 - elapsed.as_millis() as i64;
    let mut wait = lag_hint_ms;
    if minimum > wait {
        wait = minimum;
    } else if wait > MAX_LAG_COMPENSATION.as_millis() as i64 {
        wait = MAX_LAG_COMPENSATION.as_millis() as i64;
    }
    wait
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn required_wait_enforces_minimum_frame_duration() {
        // No lag reported, but we've barely spent any time this frame --
        // the 100fps ceiling should still force a short wait.
        assert_eq!(required_wait_ms(0, Duration::from_millis(2)), 8);
    }

    #[test]
    fn required_wait_caps_lag_compensation() {
        assert_eq!(required_wait_ms(10_000, Duration::from_millis(50)), 500);
    }

    #[test]
    fn required_wait_can_be_zero_or_negative() {
        assert!(required_wait_ms(-50, Duration::from_millis(50)) <= 0);
    }

    #[test]
    fn explicit_frame_boundary_stops_the_inner_loop_immediately() {
        let thread = Arc::new(RenderThread::new());
        thread.notify_frame();
        thread.notify_frame();

        let calls = Arc::new(AtomicU64::new(0));
        let calls_clone = Arc::clone(&calls);
        let thread_clone = Arc::clone(&thread);

        let handle = std::thread::spawn(move || {
            run(&thread_clone, || 0, |_cursor, frames| {
                calls_clone.fetch_add(frames, Ordering::SeqCst);
                thread_clone.stop();
            });
        });

        handle.join().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn notify_user_moved_mouse_records_state_and_sets_modified() {
        let thread = RenderThread::new();
        thread.notify_user_moved_mouse(5, 6, 1);
        assert_eq!(thread.flag.snapshot() & FRAME_MODIFIED, FRAME_MODIFIED);
        assert_eq!(*thread.cursor.lock().unwrap(), CursorState { x: 5, y: 6, mask: 1, user_known: true });
    }
}
