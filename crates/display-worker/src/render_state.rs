//! The render-state flag: lets any thread ask "is a frame currently being
//! emitted to the wire right now?" without touching the FIFO or the layer
//! arena at all. Set by the first worker to pick up a frame's operations,
//! cleared by whichever worker closes that frame out.

use display_core::Flag;

pub const FRAME_IN_PROGRESS: u32 = 1;
pub const FRAME_NOT_IN_PROGRESS: u32 = 2;
pub const STOPPED: u32 = 4;

/// Starts in the `FRAME_NOT_IN_PROGRESS` state, matching a freshly
/// constructed display that has not yet been asked to render anything.
#[derive(Debug, Default)]
pub struct RenderState {
    flag: Flag,
}

impl RenderState {
    pub fn new() -> RenderState {
        let state = RenderState { flag: Flag::new() };
        state.flag.set(FRAME_NOT_IN_PROGRESS);
        state
    }

    pub fn mark_frame_in_progress(&self) {
        let guard = self.flag.set_and_lock(FRAME_IN_PROGRESS);
        self.flag.clear(FRAME_NOT_IN_PROGRESS);
        drop(guard);
    }

    pub fn mark_frame_not_in_progress(&self) {
        let guard = self.flag.set_and_lock(FRAME_NOT_IN_PROGRESS);
        self.flag.clear(FRAME_IN_PROGRESS);
        drop(guard);
    }

    pub fn mark_stopped(&self) {
        self.flag.set(STOPPED);
    }

    pub fn is_frame_in_progress(&self) -> bool {
        self.flag.snapshot() & FRAME_IN_PROGRESS != 0
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.snapshot() & STOPPED != 0
    }

    /// Blocks until no frame is in progress (or the display has stopped),
    /// used by callers that need to know rendering has quiesced -- a
    /// `dup`-time resync, for instance.
    pub fn wait_until_idle(&self) {
        let guard = self.flag.wait_and_lock(FRAME_NOT_IN_PROGRESS | STOPPED);
        drop(guard);
    }

    /// Blocks until the display has fully stopped. Used by a concurrent
    /// caller of `stop()` that lost the race to be the one actually tearing
    /// down the worker pool, so it still only returns once teardown is
    /// genuinely complete.
    pub fn wait_until_stopped(&self) {
        let guard = self.flag.wait_and_lock(STOPPED);
        drop(guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_idle() {
        let state = RenderState::new();
        assert!(!state.is_frame_in_progress());
    }

    #[test]
    fn mark_in_progress_clears_not_in_progress() {
        let state = RenderState::new();
        state.mark_frame_in_progress();
        assert!(state.is_frame_in_progress());
        state.mark_frame_not_in_progress();
        assert!(!state.is_frame_in_progress());
    }

    #[test]
    fn stopped_is_observable_independent_of_frame_state() {
        let state = RenderState::new();
        state.mark_stopped();
        assert!(state.is_stopped());
    }
}
