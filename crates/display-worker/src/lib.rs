//! The worker pool: the only consumer of the worker FIFO.
//!
//! A plan's synchronous operations (`Rect`, `Copy`, `Nop`) are applied
//! directly by whoever drives `end_multiple_frames`, before any operation
//! ever reaches a queue -- see the `display` crate's `plan_apply`, grounded
//! on the same split the original draws in `guac_display_plan_apply`. Only
//! `Img` (which needs an actual encode, the expensive part) and `EndFrame`
//! (the frame-boundary sentinel every worker needs to recognise even if it
//! didn't touch a single pixel) are ever enqueued here.
//!
//! Workers race each other to drain the FIFO; whichever one dequeues an
//! `EndFrame` while other workers are still busy puts it back for one of
//! them to pick up later, so exactly one worker -- the one that empties the
//! queue -- ends up closing out the frame.

pub mod codec;
pub mod encoder;
pub mod render_state;

use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use display_core::{Fifo, FifoError, RwCell};
use display_proto::{CompositeMode, EncodedImage, LayerId, WireSink};
use display_render::{cursor_layer_touched, LastArena, LayerHandle, OpKind, PlanOperation};

use encoder::ImageEncoder;
use render_state::RenderState;

pub use display_render::DisplayError;

/// `(8192 / 64)^2 * 8`: enough slots for every 64x64 cell of a generously
/// sized display to be in flight as a separate `Img` op at once, with room
/// to spare for deep combine runs that still leave several survivors.
pub const WORKER_FIFO_CAPACITY: usize = {
    let cells_per_side = 8192 / 64;
    cells_per_side * cells_per_side * 8
};

const MAX_LAG_COMPENSATION_MS: i64 = 500;

/// The display-wide mouse cursor, refreshed by the facade on every commit
/// and consulted by whichever worker closes a frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct CursorSnapshot {
    pub layer: Option<LayerHandle>,
    pub id: LayerId,
    pub hotspot_x: i32,
    pub hotspot_y: i32,
}

#[derive(Debug, Default)]
struct GateState {
    active_workers: usize,
    frame_deferred: bool,
    pending_frame_count: u64,
}

/// Bookkeeping shared between the worker pool and whoever drives
/// `end_multiple_frames`: how many workers currently hold the last-frame
/// read lock, and whether a flush was requested while they were busy.
///
/// The original guards the equivalent fields with the operation queue's own
/// mutex. `Fifo` deliberately doesn't expose that mutex for unrelated state
/// to piggyback on, so this gets its own lock instead; taking it immediately
/// after every `Fifo` call preserves the same effective ordering without the
/// coupling.
#[derive(Debug, Default)]
pub struct FrameGate {
    state: Mutex<GateState>,
}

impl FrameGate {
    pub fn new() -> FrameGate {
        FrameGate::default()
    }

    pub fn active_workers(&self) -> usize {
        self.state.lock().unwrap().active_workers
    }

    /// Peeks the frame-batch count accumulated so far without resetting it,
    /// used by a `dup`-time resync `sync` instruction to report the last
    /// committed frame count alongside the join snapshot.
    pub fn pending_frame_count(&self) -> u64 {
        self.state.lock().unwrap().pending_frame_count
    }

    fn enter(&self) {
        self.state.lock().unwrap().active_workers += 1;
    }

    fn exit(&self) {
        self.state.lock().unwrap().active_workers -= 1;
    }

    /// Called by the thread driving `end_multiple_frames` while it holds the
    /// pending-frame write lock: folds `frames` into the batch the next
    /// close will report via `sync`, and records whether this request must
    /// be deferred because a previous frame is still in flight. Returns
    /// whether it was deferred.
    pub fn record_and_check_busy(&self, frames: u64, fifo_nonempty: bool) -> bool {
        let mut state = self.state.lock().unwrap();
        state.pending_frame_count += frames;
        let busy = fifo_nonempty || state.active_workers > 0;
        if busy {
            state.frame_deferred = true;
        }
        busy
    }

    /// Takes the accumulated frame-batch count, resetting it to zero. Always
    /// at least 1, since closing a frame at all implies at least one commit.
    fn take_frame_count(&self) -> u64 {
        std::mem::take(&mut self.state.lock().unwrap().pending_frame_count).max(1)
    }

    /// Takes and clears the deferred flag, reporting whether it had been set.
    fn take_deferred(&self) -> bool {
        std::mem::take(&mut self.state.lock().unwrap().frame_deferred)
    }
}

/// Everything a worker thread needs, gathered behind `Arc` so the pool can
/// hand an owned copy to each thread it spawns.
pub struct WorkerShared<S, E> {
    pub fifo: Arc<Fifo<PlanOperation>>,
    /// The committed ("last") half of the layer arena only -- a worker never
    /// touches the pending side, so a long encode or the lag-compensation
    /// sleep in `close_frame` never contends with a caller drawing or with
    /// the cheap busy-check `end_multiple_frames` does before it ever reaches
    /// for this lock.
    pub last: Arc<RwCell<LastArena>>,
    pub render_state: Arc<RenderState>,
    pub gate: Arc<FrameGate>,
    pub cursor: Arc<Mutex<CursorSnapshot>>,
    pub sink: Arc<Mutex<S>>,
    pub encoder: Arc<Mutex<E>>,
    pub last_sent_ms: Arc<Mutex<u64>>,
    /// Wall-clock time in milliseconds, on whatever epoch the facade's
    /// `PlanOperation` timestamps share.
    pub now_ms: Arc<dyn Fn() -> u64 + Send + Sync>,
    /// The client's current round-trip processing lag, in milliseconds.
    /// Client/session measurement is an external collaborator this crate has
    /// no opinion on -- see the `Non-goals` this is grounded against.
    pub processing_lag_ms: Arc<dyn Fn() -> i64 + Send + Sync>,
    pub client_supports_webp: Arc<dyn Fn() -> bool + Send + Sync>,
    /// Invoked, outside any lock, by whichever worker closes a frame while
    /// a flush was requested and deferred during it -- lets the facade
    /// immediately retry the `end_multiple_frames` that got deferred.
    pub on_deferred_flush: Arc<dyn Fn() + Send + Sync>,
}

impl<S, E> Clone for WorkerShared<S, E> {
    fn clone(&self) -> Self {
        WorkerShared {
            fifo: Arc::clone(&self.fifo),
            last: Arc::clone(&self.last),
            render_state: Arc::clone(&self.render_state),
            gate: Arc::clone(&self.gate),
            cursor: Arc::clone(&self.cursor),
            sink: Arc::clone(&self.sink),
            encoder: Arc::clone(&self.encoder),
            last_sent_ms: Arc::clone(&self.last_sent_ms),
            now_ms: Arc::clone(&self.now_ms),
            processing_lag_ms: Arc::clone(&self.processing_lag_ms),
            client_supports_webp: Arc::clone(&self.client_supports_webp),
            on_deferred_flush: Arc::clone(&self.on_deferred_flush),
        }
    }
}

/// A running pool of worker threads draining a shared FIFO. Dropping this
/// without calling [`WorkerPool::join`] detaches the threads -- invalidate
/// the FIFO first so they actually have a reason to exit.
pub struct WorkerPool {
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn<S, E>(count: usize, shared: WorkerShared<S, E>) -> WorkerPool
    where
        S: WireSink + Send + 'static,
        S::Error: Debug,
        E: ImageEncoder + Send + 'static,
        E::Error: Debug,
    {
        let threads = (0..count.max(1))
            .map(|index| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("display-worker-{index}"))
                    .spawn(move || worker_loop(shared))
                    .expect("failed to spawn display worker thread")
            })
            .collect();
        WorkerPool { threads }
    }

    /// Blocks until every worker thread has exited. Callers are expected to
    /// have invalidated the FIFO first.
    pub fn join(self) {
        for handle in self.threads {
            let _ = handle.join();
        }
    }
}

fn worker_loop<S, E>(shared: WorkerShared<S, E>)
where
    S: WireSink,
    S::Error: Debug,
    E: ImageEncoder,
    E::Error: Debug,
{
    loop {
        let (op, guard) = match shared.fifo.dequeue_and_lock() {
            Ok(dequeued) => dequeued,
            Err(FifoError::Invalidated) => break,
        };

        // Any thread that locks the FIFO can tell there's no rendering in
        // progress from the queue being empty and no active workers -- so
        // both of those need to change together, atomically with taking the
        // item.
        shared.render_state.mark_frame_in_progress();
        shared.gate.enter();
        drop(guard);

        let last = shared.last.read();
        match op.kind {
            OpKind::Img => {
                dispatch_img(&op, &last, &shared);
                drop(last);
                shared.gate.exit();
            }

            OpKind::EndFrame => {
                let frame_timestamp = op.frame;
                if shared.gate.active_workers() > 1 {
                    // Other workers are still busy; this isn't the one that
                    // gets to close the frame. Put the boundary back so
                    // whichever worker empties the queue picks it up.
                    drop(last);
                    let _ = shared.fifo.enqueue(op);
                    shared.gate.exit();
                } else {
                    let deferred = close_frame(&last, &shared, frame_timestamp);
                    drop(last);
                    shared.gate.exit();
                    if deferred {
                        (shared.on_deferred_flush)();
                    }
                }
            }

            other => {
                // `plan_apply` applies Nop/Rect/Copy synchronously and never
                // enqueues them; reaching this arm means that contract broke.
                tracing::warn!(kind = ?other, "synchronous operation reached the worker pool");
                drop(last);
                shared.gate.exit();
            }
        }
    }
}

fn dispatch_img<S, E>(op: &PlanOperation, last: &LastArena, shared: &WorkerShared<S, E>)
where
    S: WireSink,
    S::Error: Debug,
    E: ImageEncoder,
    E::Error: Debug,
{
    let Some(handle) = op.layer else {
        tracing::warn!("image operation carries no layer handle");
        return;
    };
    let Some(entry) = last.get(handle) else {
        tracing::warn!("image operation references a layer that no longer exists");
        return;
    };

    let framerate =
        if op.frame > op.last_frame { 1000 / (op.frame - op.last_frame) as i64 } else { i64::MAX };

    let pixels = entry.frame.pixels.as_slice();
    let stride = entry.frame.stride;
    let bounds = entry.frame.bounds();
    let optimality = codec::png_optimality(pixels, stride, op.dest);
    let quality = codec::suggest_quality((shared.processing_lag_ms)());

    let mut encoder = shared.encoder.lock().unwrap();
    let mut sink = shared.sink.lock().unwrap();

    if codec::should_use_webp((shared.client_supports_webp)(), framerate, optimality) {
        let rect = codec::align_to_block(op.dest, codec::WEBP_BLOCK_SIZE_EXPONENT, bounds);
        match encoder.encode_webp(pixels, stride, rect, quality, entry.frame.lossless, entry.frame.opaque) {
            Ok(data) => {
                let image = EncodedImage::WebP { data: &data, quality, lossless: entry.frame.lossless };
                if let Err(err) = sink.send_image(entry.id, rect.left, rect.top, image) {
                    tracing::warn!(?err, "failed to send webp image");
                }
            }
            Err(err) => tracing::warn!(?err, "webp encode failed"),
        }
    } else if entry.frame.opaque && codec::should_use_jpeg(entry.frame.lossless, framerate, op.dest, optimality) {
        let rect = codec::align_to_block(op.dest, codec::JPEG_BLOCK_SIZE_EXPONENT, bounds);
        match encoder.encode_jpeg(pixels, stride, rect, quality) {
            Ok(data) => {
                let image = EncodedImage::Jpeg { data: &data, quality };
                if let Err(err) = sink.send_image(entry.id, rect.left, rect.top, image) {
                    tracing::warn!(?err, "failed to send jpeg image");
                }
            }
            Err(err) => tracing::warn!(?err, "jpeg encode failed"),
        }
    } else {
        let rect = op.dest;
        match encoder.encode_png(pixels, stride, rect, entry.frame.opaque) {
            Ok(data) => {
                if let Err(err) = sink.send_image(entry.id, rect.left, rect.top, EncodedImage::Png(&data)) {
                    tracing::warn!(?err, "failed to send png image");
                }
            }
            Err(err) => tracing::warn!(?err, "png encode failed"),
        }
    }
}

/// Closes out a frame: announces it via `sync`, refreshes every dirtied
/// layer's resync buffer, re-sends the cursor if it was among them, and
/// sleeps off whatever lag compensation the client still needs. Returns
/// whether a flush request had been deferred while this one was in flight.
fn close_frame<S, E>(last: &LastArena, shared: &WorkerShared<S, E>, frame_timestamp: u64) -> bool
where
    S: WireSink,
    S::Error: Debug,
{
    let frames = shared.gate.take_frame_count();

    let now = (shared.now_ms)();
    let time_since_last_frame = {
        let mut last_sent = shared.last_sent_ms.lock().unwrap();
        let elapsed = now.saturating_sub(*last_sent) as i64;
        *last_sent = now;
        elapsed
    };
    let mut required_wait = (shared.processing_lag_ms)() - time_since_last_frame;

    {
        let mut sink = shared.sink.lock().unwrap();

        if let Err(err) = sink.send_sync(frame_timestamp, frames) {
            tracing::warn!(?err, "failed to send frame sync");
        }

        for entry in last.iter() {
            if entry.frame.dirty.is_empty() {
                continue;
            }
            if let Err(err) = sink.send_copy(
                entry.id,
                0,
                0,
                entry.frame.width,
                entry.frame.height,
                CompositeMode::Src,
                entry.backing_buffer,
                0,
                0,
            ) {
                tracing::warn!(?err, layer = ?entry.id, "failed to refresh layer resync buffer");
            }
        }

        let cursor_snapshot = *shared.cursor.lock().unwrap();
        if cursor_layer_touched(last, cursor_snapshot.id) {
            if let Some(cursor_layer) = cursor_snapshot.layer.and_then(|handle| last.get(handle)) {
                if let Err(err) = sink.send_cursor(
                    cursor_snapshot.hotspot_x,
                    cursor_snapshot.hotspot_y,
                    cursor_layer.id,
                    0,
                    0,
                    cursor_layer.frame.width,
                    cursor_layer.frame.height,
                ) {
                    tracing::warn!(?err, "failed to send cursor update");
                }
            }
        }

        if let Err(err) = sink.flush() {
            tracing::warn!(?err, "failed to flush after closing frame");
        }
    }

    shared.render_state.mark_frame_not_in_progress();

    // Exclude local, server-side frame-processing latency from the wait.
    let latency = now.saturating_sub(frame_timestamp) as i64;
    tracing::trace!(latency, frames, "rendering latency");
    if latency >= 0 {
        required_wait -= latency;
    }
    required_wait = required_wait.min(MAX_LAG_COMPENSATION_MS);
    if required_wait > 0 {
        tracing::trace!(required_wait, "waiting to compensate for client-side processing delays");
        thread::sleep(Duration::from_millis(required_wait as u64));
    }

    shared.gate.take_deferred()
}

#[cfg(test)]
mod tests {
    use super::*;
    use display_core::Rect;
    use display_proto::{Instruction, RecordingSink};
    use display_render::{Layer, LayerArena};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct FakeEncoder {
        calls: Vec<&'static str>,
    }

    impl ImageEncoder for FakeEncoder {
        type Error = std::convert::Infallible;

        fn encode_png(&mut self, _: &[u8], _: usize, _: Rect, _: bool) -> Result<Vec<u8>, Self::Error> {
            self.calls.push("png");
            Ok(vec![1, 2, 3])
        }

        fn encode_jpeg(&mut self, _: &[u8], _: usize, _: Rect, _: u8) -> Result<Vec<u8>, Self::Error> {
            self.calls.push("jpeg");
            Ok(vec![4, 5, 6])
        }

        fn encode_webp(&mut self, _: &[u8], _: usize, _: Rect, _: u8, _: bool, _: bool) -> Result<Vec<u8>, Self::Error> {
            self.calls.push("webp");
            Ok(vec![7, 8, 9])
        }
    }

    fn shared_for_test() -> (WorkerShared<RecordingSink, FakeEncoder>, LayerHandle, Arc<RwCell<LastArena>>) {
        let mut arena = LayerArena::new();
        let mut last = LastArena::new();
        let mut layer = Layer::new(LayerId(1), true);
        layer.backing_buffer = LayerId(-1);
        let handle = arena.insert(layer, &mut last);
        let last = Arc::new(RwCell::new(last));

        let shared = WorkerShared {
            fifo: Arc::new(Fifo::new(WORKER_FIFO_CAPACITY)),
            last: Arc::clone(&last),
            render_state: Arc::new(RenderState::new()),
            gate: Arc::new(FrameGate::new()),
            cursor: Arc::new(Mutex::new(CursorSnapshot::default())),
            sink: Arc::new(Mutex::new(RecordingSink::new())),
            encoder: Arc::new(Mutex::new(FakeEncoder::default())),
            last_sent_ms: Arc::new(Mutex::new(0)),
            now_ms: Arc::new(|| 1_000),
            processing_lag_ms: Arc::new(|| 0),
            client_supports_webp: Arc::new(|| false),
            on_deferred_flush: Arc::new(|| {}),
        };
        (shared, handle, last)
    }

    #[test]
    fn frame_gate_tracks_active_workers() {
        let gate = FrameGate::new();
        assert_eq!(gate.active_workers(), 0);
        gate.enter();
        gate.enter();
        assert_eq!(gate.active_workers(), 2);
        gate.exit();
        assert_eq!(gate.active_workers(), 1);
    }

    #[test]
    fn record_and_check_busy_defers_while_workers_are_active() {
        let gate = FrameGate::new();
        gate.enter();
        assert!(gate.record_and_check_busy(1, false));
        assert!(gate.take_deferred());
        assert!(!gate.take_deferred());
    }

    #[test]
    fn record_and_check_busy_does_not_defer_when_idle() {
        let gate = FrameGate::new();
        assert!(!gate.record_and_check_busy(1, false));
        assert!(!gate.take_deferred());
    }

    #[test]
    fn frame_count_accumulates_and_resets() {
        let gate = FrameGate::new();
        gate.record_and_check_busy(2, false);
        gate.record_and_check_busy(3, false);
        assert_eq!(gate.take_frame_count(), 5);
        assert_eq!(gate.take_frame_count(), 1);
    }

    #[test]
    fn pending_frame_count_peeks_without_resetting() {
        let gate = FrameGate::new();
        gate.record_and_check_busy(4, false);
        assert_eq!(gate.pending_frame_count(), 4);
        assert_eq!(gate.pending_frame_count(), 4);
        assert_eq!(gate.take_frame_count(), 4);
    }

    #[test]
    fn dispatch_img_defaults_to_png_when_no_lossy_format_is_preferred() {
        let (shared, handle, last) = shared_for_test();
        let op = PlanOperation {
            layer: Some(handle),
            kind: OpKind::Img,
            dest: Rect::init(0, 0, 64, 64),
            dirty_size: 64 * 64,
            last_frame: 0,
            frame: 1,
            color: [0; 4],
            source: None,
        };

        let guard = last.read();
        dispatch_img(&op, &guard, &shared);
        drop(guard);

        let encoder = shared.encoder.lock().unwrap();
        assert_eq!(encoder.calls, vec!["png"]);
        drop(encoder);

        let sink = shared.sink.lock().unwrap();
        assert!(matches!(sink.instructions.as_slice(), [Instruction::Png { .. }]));
    }

    #[test]
    fn dispatch_img_prefers_jpeg_for_frequent_opaque_lossy_updates() {
        let (shared, handle, last) = shared_for_test();
        {
            let mut guard = last.write();
            let frame = guard.get_mut(handle).unwrap();
            frame.opaque = true;
            frame.lossless = false;
            // Force a negative PNG optimality so JPEG is preferred.
            let stride = frame.stride;
            for (i, px) in frame.pixels.as_mut_slice().chunks_exact_mut(4).enumerate() {
                let v = (i * 37 % 251) as u8;
                px.copy_from_slice(&[v, v.wrapping_add(1), v.wrapping_add(2), 255]);
            }
            let _ = stride;
        }

        let op = PlanOperation {
            layer: Some(handle),
            kind: OpKind::Img,
            dest: Rect::init(0, 0, 64, 64),
            dirty_size: 64 * 64,
            last_frame: 0,
            frame: 1000,
            color: [0; 4],
            source: None,
        };

        let guard = last.read();
        dispatch_img(&op, &guard, &shared);
        drop(guard);

        assert_eq!(shared.encoder.lock().unwrap().calls, vec!["jpeg"]);
    }

    #[test]
    fn close_frame_sends_sync_and_resync_copies_for_dirty_layers() {
        let (shared, handle, last) = shared_for_test();
        {
            let mut guard = last.write();
            let frame = guard.get_mut(handle).unwrap();
            frame.dirty = Rect::init(0, 0, 64, 64);
        }

        let guard = last.read();
        let deferred = close_frame(&guard, &shared, 500);
        drop(guard);

        assert!(!deferred);
        let sink = shared.sink.lock().unwrap();
        assert!(matches!(sink.instructions[0], Instruction::Sync { .. }));
        assert!(sink.non_flush().any(|i| matches!(i, Instruction::Copy { dst_layer: LayerId(-1), .. })));
        assert!(matches!(sink.instructions.last(), Some(Instruction::Flush)));
    }

    #[test]
    fn close_frame_reports_and_clears_a_deferred_flush() {
        let (shared, _handle, last) = shared_for_test();
        shared.gate.enter();
        assert!(shared.gate.record_and_check_busy(1, false));
        shared.gate.exit();

        let guard = last.read();
        let deferred = close_frame(&guard, &shared, 0);
        drop(guard);

        assert!(deferred);
        assert!(!shared.gate.take_deferred());
    }

    #[test]
    fn worker_pool_exits_cleanly_once_the_fifo_is_invalidated() {
        let (shared, _handle, _last) = shared_for_test();
        let fifo = Arc::clone(&shared.fifo);
        let pool = WorkerPool::spawn(2, shared);
        fifo.invalidate();
        pool.join();
    }

    #[test]
    fn an_end_frame_op_is_requeued_while_other_workers_are_still_busy() {
        let (shared, _handle, _last) = shared_for_test();
        let end_frame = PlanOperation {
            layer: None,
            kind: OpKind::EndFrame,
            dest: Rect::EMPTY,
            dirty_size: 0,
            last_frame: 0,
            frame: 1,
            color: [0; 4],
            source: None,
        };

        // Pretend a second worker is already active so this one must
        // requeue the boundary rather than close the frame itself.
        shared.gate.enter();
        shared.fifo.enqueue(end_frame).unwrap();

        let closed = Arc::new(AtomicBool::new(false));
        let deferred_calls = Arc::new(AtomicU64::new(0));
        let mut shared_for_worker = shared.clone();
        {
            let closed = Arc::clone(&closed);
            shared_for_worker.on_deferred_flush = Arc::new(move || {
                closed.store(true, Ordering::SeqCst);
            });
            let _ = &deferred_calls;
        }

        let fifo = Arc::clone(&shared_for_worker.fifo);
        let handle = thread::spawn(move || worker_loop(shared_for_worker));

        thread::sleep(Duration::from_millis(20));
        // The boundary should have been put back onto the queue rather than
        // closed, since `active_workers` (held open by our manual `enter`)
        // is still 2 at the point the spawned worker looked.
        assert_eq!(fifo.len(), 1);
        assert!(!closed.load(Ordering::SeqCst));

        fifo.invalidate();
        handle.join().unwrap();
    }

    /// S4 (cursor-only flush): a display with nothing ever queued onto its
    /// FIFO -- the shape a pure mouse-move leaves behind, since
    /// `BroadcastSink::broadcast_mouse_excluding` reaches clients directly
    /// and never touches the worker pool at all -- must not produce a
    /// `sync` merely from the pool starting up and shutting back down.
    #[test]
    fn an_idle_pool_with_nothing_queued_emits_no_sync() {
        let (shared, _handle, _last) = shared_for_test();
        let fifo = Arc::clone(&shared.fifo);
        let sink = Arc::clone(&shared.sink);

        let pool = WorkerPool::spawn(1, shared);
        fifo.invalidate();
        pool.join();

        assert!(sink.lock().unwrap().instructions.is_empty());
    }

    /// S6 (shutdown): a single-thread pool with one real frame already
    /// queued must drain it -- emitting exactly one `sync` -- before
    /// `invalidate` + `join` lets the worker thread exit, and nothing
    /// queued afterward reaches the wire at all.
    #[test]
    fn a_single_worker_pool_drains_its_queued_frame_before_shutting_down() {
        let (shared, handle, last) = shared_for_test();
        {
            let mut guard = last.write();
            guard.get_mut(handle).unwrap().dirty = Rect::init(0, 0, 64, 64);
        }

        let img = PlanOperation {
            layer: Some(handle),
            kind: OpKind::Img,
            dest: Rect::init(0, 0, 64, 64),
            dirty_size: 64 * 64,
            last_frame: 0,
            frame: 1,
            color: [0; 4],
            source: None,
        };
        let end_frame =
            PlanOperation { layer: None, kind: OpKind::EndFrame, dest: Rect::EMPTY, dirty_size: 0, last_frame: 0, frame: 1, color: [0; 4], source: None };

        let fifo = Arc::clone(&shared.fifo);
        let sink = Arc::clone(&shared.sink);
        fifo.enqueue(img).unwrap();
        fifo.enqueue(end_frame).unwrap();

        let pool = WorkerPool::spawn(1, shared);
        // Invalidating doesn't discard what's already queued -- `join`
        // blocks until the lone worker has dequeued and closed this frame.
        fifo.invalidate();
        pool.join();

        let sink = sink.lock().unwrap();
        let syncs = sink.instructions.iter().filter(|i| matches!(i, Instruction::Sync { .. })).count();
        assert_eq!(syncs, 1, "expected exactly one sync from the queued frame, got: {:?}", sink.instructions);
    }
}
