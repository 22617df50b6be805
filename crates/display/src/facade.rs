//! The `Display` facade: the one type a backend actually holds. Wires the
//! layer arena, the frame planner/committer, the worker pool, and the
//! render thread together behind a lock order every entry point respects:
//! pending-frame write lock, then the worker FIFO, then the last-frame lock,
//! then the render state flag. Never the other way around -- a worker
//! closing a frame only ever takes the last-frame read lock and the render
//! state flag, in that same relative order, so reversing it anywhere in here
//! would be a real deadlock, not just a style nit.
//!
//! The pending and last halves of a layer's double buffer are deliberately
//! two independent locks (`Inner::arena` and `Inner::last`) rather than one
//! combined lock -- `end_multiple_frames`'s busy-check only ever needs the
//! former, so a worker holding the latter for the length of an encode or the
//! lag-compensation sleep in `close_frame` never blocks a caller's
//! `draw_raw`/`draw_vector`/`notify_user_moved_mouse`.
//!
//! Two notions of "who moved the mouse" coexist deliberately. A caller that
//! knows which user moved it calls [`Display::notify_user_moved_mouse`]
//! directly -- synchronous, immediate, and able to exclude that user from
//! the resulting `mouse` broadcast. The render thread's own heuristic
//! cursor tracking has no such identity (display-render has no notion of a
//! user), so it is not wired to this path at all here; a backend that only
//! ever calls the identified path never needs it.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};

use display_config::DisplayConfig;
use display_core::{Fifo, RwCell};
use display_proto::{LayerId, WireSink};
use display_render::{
    close_raw, close_vector, commit::CursorState as CommitCursorState, create_plan, cursor_layer_touched,
    frame_complete, open_raw, open_vector, run_render_thread, Layer, LastArena, LayerArena, LayerHandle, OpKind,
    PlanOperation, RawContext, RenderThread, VectorContext,
};
use display_worker::encoder::ImageEncoder;
use display_worker::render_state::RenderState;
use display_worker::{CursorSnapshot, FrameGate, WorkerPool, WorkerShared, WORKER_FIFO_CAPACITY};

use crate::clock::now_ms;
use crate::cursor::set_cursor_pixels;
use crate::plan_apply;
use crate::users::{BroadcastSink, UserId};

/// The mouse state this facade tracks independently of any one layer,
/// separate from `display-render`'s `CommitCursorState`/`RenderCursorState`
/// in that it also remembers *which* user last moved it -- something
/// `display-render` cannot express, since it has no `UserId` of its own.
#[derive(Debug, Clone, Copy, Default)]
struct PendingCursor {
    x: i32,
    y: i32,
    mask: u32,
    hotspot_x: i32,
    hotspot_y: i32,
    moving_user: Option<UserId>,
}

/// A handle to one layer or buffer allocated on a [`Display`]. Cheap to
/// copy; carries its own [`LayerId`] alongside the arena handle so a caller
/// can label wire traffic or log output without a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayLayer {
    handle: LayerHandle,
    id: LayerId,
}

impl DisplayLayer {
    pub fn id(&self) -> LayerId {
        self.id
    }
}

struct Inner<U, E> {
    arena: Arc<RwCell<LayerArena>>,
    last: Arc<RwCell<LastArena>>,
    fifo: Arc<Fifo<PlanOperation>>,
    render_state: Arc<RenderState>,
    gate: Arc<FrameGate>,
    cursor_snapshot: Arc<Mutex<CursorSnapshot>>,
    sink: Arc<Mutex<BroadcastSink<U>>>,
    encoder: Arc<Mutex<E>>,
    worker_pool: Mutex<Option<WorkerPool>>,
    render_thread: Arc<RenderThread>,
    render_thread_join: Mutex<Option<JoinHandle<()>>>,
    pending_cursor: Mutex<PendingCursor>,
    last_cursor: Mutex<CommitCursorState>,
    dirty_excluding_mouse: AtomicBool,
    stopping: AtomicBool,
    default_layer: LayerHandle,
    cursor_layer: LayerHandle,
    cursor_layer_id: LayerId,
    next_layer_id: AtomicI32,
    next_buffer_id: AtomicI32,
    now_ms: Arc<dyn Fn() -> u64 + Send + Sync>,
    default_opaque: bool,
    default_lossless: bool,
    default_search_for_copies: bool,
}

/// A running display: the frame-planning/dirty-region engine that sits
/// between a back-end (RDP, VNC, ...) producing pixels and a line-oriented
/// wire protocol client. Cheap to clone -- every clone shares the same
/// worker pool, render thread, and layer arena.
pub struct Display<U, E> {
    inner: Arc<Inner<U, E>>,
}

impl<U, E> Clone for Display<U, E> {
    fn clone(&self) -> Self {
        Display { inner: Arc::clone(&self.inner) }
    }
}

impl<U, E> Display<U, E>
where
    U: WireSink + Send + 'static,
    U::Error: Debug,
    E: ImageEncoder + Send + 'static,
    E::Error: Debug,
{
    /// Builds a new display, spawning its worker pool and (unless
    /// `config` requests explicit frame boundaries only) its render
    /// thread. `processing_lag_ms`/`client_supports_webp` stand in for
    /// whatever the caller's transport layer knows about the client's
    /// round-trip lag and codec support -- this crate has no opinion on
    /// either, per the worker pool's own documented Non-goals.
    pub fn new(
        config: &DisplayConfig,
        encoder: E,
        processing_lag_ms: impl Fn() -> i64 + Send + Sync + 'static,
        client_supports_webp: impl Fn() -> bool + Send + Sync + 'static,
    ) -> Display<U, E> {
        let mut raw_arena = LayerArena::new();
        let mut raw_last = LastArena::new();
        let next_buffer_id = AtomicI32::new(-1);

        let mut default_layer = Layer::new(LayerId::DEFAULT, config.default_opaque());
        apply_layer_defaults(&mut default_layer, config);
        default_layer.backing_buffer = LayerId(next_buffer_id.fetch_sub(1, Ordering::SeqCst));
        let default_handle = raw_arena.insert(default_layer, &mut raw_last);

        let cursor_id = LayerId(next_buffer_id.fetch_sub(1, Ordering::SeqCst));
        let mut cursor_layer = Layer::new(cursor_id, false);
        cursor_layer.backing_buffer = LayerId(next_buffer_id.fetch_sub(1, Ordering::SeqCst));
        let cursor_handle = raw_arena.insert(cursor_layer, &mut raw_last);

        let arena = Arc::new(RwCell::new(raw_arena));
        let last = Arc::new(RwCell::new(raw_last));
        let fifo = Arc::new(Fifo::new(WORKER_FIFO_CAPACITY));
        let render_state = Arc::new(RenderState::new());
        let gate = Arc::new(FrameGate::new());
        let cursor_snapshot =
            Arc::new(Mutex::new(CursorSnapshot { layer: Some(cursor_handle), id: cursor_id, hotspot_x: 0, hotspot_y: 0 }));
        let sink = Arc::new(Mutex::new(BroadcastSink::new()));
        let encoder = Arc::new(Mutex::new(encoder));
        let last_sent_ms = Arc::new(Mutex::new(now_ms()));
        let now_ms_fn: Arc<dyn Fn() -> u64 + Send + Sync> = Arc::new(now_ms);
        let processing_lag_ms: Arc<dyn Fn() -> i64 + Send + Sync> = Arc::new(processing_lag_ms);
        let client_supports_webp: Arc<dyn Fn() -> bool + Send + Sync> = Arc::new(client_supports_webp);

        let inner = Arc::new(Inner {
            arena: Arc::clone(&arena),
            last: Arc::clone(&last),
            fifo: Arc::clone(&fifo),
            render_state: Arc::clone(&render_state),
            gate: Arc::clone(&gate),
            cursor_snapshot: Arc::clone(&cursor_snapshot),
            sink: Arc::clone(&sink),
            encoder: Arc::clone(&encoder),
            worker_pool: Mutex::new(None),
            render_thread: Arc::new(RenderThread::new()),
            render_thread_join: Mutex::new(None),
            pending_cursor: Mutex::new(PendingCursor::default()),
            last_cursor: Mutex::new(CommitCursorState::default()),
            dirty_excluding_mouse: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            default_layer: default_handle,
            cursor_layer: cursor_handle,
            cursor_layer_id: cursor_id,
            next_layer_id: AtomicI32::new(1),
            next_buffer_id,
            now_ms: Arc::clone(&now_ms_fn),
            default_opaque: config.default_opaque(),
            default_lossless: config.default_lossless(),
            default_search_for_copies: config.default_search_for_copies(),
        });

        let detected_cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(0);
        let worker_count = config.resolve_worker_count(detected_cpus);

        let render_lag_ms = Arc::clone(&processing_lag_ms);

        let deferred_inner = Arc::downgrade(&inner);
        let shared = WorkerShared {
            fifo,
            last,
            render_state,
            gate,
            cursor: cursor_snapshot,
            sink,
            encoder,
            last_sent_ms,
            now_ms: now_ms_fn,
            processing_lag_ms,
            client_supports_webp,
            on_deferred_flush: Arc::new(move || {
                if let Some(inner) = deferred_inner.upgrade() {
                    Inner::end_multiple_frames(&inner, 0);
                }
            }),
        };
        tracing::info!(worker_count, "starting display worker pool");
        let pool = WorkerPool::spawn(worker_count, shared);
        *inner.worker_pool.lock().unwrap() = Some(pool);

        if !config.explicit_frame_boundaries() {
            let render_thread = Arc::clone(&inner.render_thread);
            let flush_weak: Weak<Inner<U, E>> = Arc::downgrade(&inner);
            let join = thread::Builder::new()
                .name("display-render".into())
                .spawn(move || {
                    run_render_thread(
                        &render_thread,
                        move || (render_lag_ms)(),
                        move |_cursor, frames| {
                            // The render thread's own cursor snapshot carries no
                            // user identity, so it is never copied into
                            // `pending_cursor` here -- only the facade's own
                            // `notify_user_moved_mouse` does that. This callback
                            // exists purely to flush whatever non-mouse drawing
                            // activity (`notify_modified`/`notify_frame`)
                            // accumulated since the last pass.
                            if let Some(inner) = flush_weak.upgrade() {
                                Inner::end_multiple_frames(&inner, frames);
                            }
                        },
                    );
                })
                .expect("failed to spawn display render thread");
            *inner.render_thread_join.lock().unwrap() = Some(join);
        }

        Display { inner }
    }

    /// The always-present, index-0 visible layer every display starts with.
    pub fn default_layer(&self) -> DisplayLayer {
        DisplayLayer { handle: self.inner.default_layer, id: LayerId::DEFAULT }
    }

    /// The dedicated off-screen buffer backing the mouse pointer.
    pub fn cursor_layer(&self) -> DisplayLayer {
        DisplayLayer { handle: self.inner.cursor_layer, id: self.inner.cursor_layer_id }
    }

    /// Allocates a new visible layer (a positive, ever-increasing id).
    pub fn alloc_layer(&self) -> DisplayLayer {
        let id = LayerId(self.inner.next_layer_id.fetch_add(1, Ordering::SeqCst));
        self.inner.insert_layer(id)
    }

    /// Allocates a new off-screen buffer (a negative, ever-decreasing id).
    pub fn alloc_buffer(&self) -> DisplayLayer {
        let id = LayerId(self.inner.next_buffer_id.fetch_sub(1, Ordering::SeqCst));
        self.inner.insert_layer(id)
    }

    /// Removes `layer` from the arena and disposes both its public id and
    /// its private resync buffer on the wire. A no-op if `layer` was
    /// already freed.
    pub fn free_layer(&self, layer: DisplayLayer) {
        self.inner.free_layer(layer);
    }

    pub fn resize(&self, layer: &DisplayLayer, width: i32, height: i32) {
        self.inner.with_layer_mut(layer.handle, |l| l.pending.resize(width, height));
    }

    pub fn set_opacity(&self, layer: &DisplayLayer, opacity: u8) {
        self.inner.with_layer_mut(layer.handle, |l| l.pending.opacity = opacity);
    }

    pub fn move_layer(&self, layer: &DisplayLayer, parent: &DisplayLayer, x: i32, y: i32, z: i32) {
        let parent_id = parent.id;
        self.inner.with_layer_mut(layer.handle, |l| {
            l.pending.parent = parent_id;
            l.pending.x = x;
            l.pending.y = y;
            l.pending.z = z;
        });
    }

    pub fn set_multitouch(&self, layer: &DisplayLayer, touches: bool) {
        self.inner.with_layer_mut(layer.handle, |l| l.pending.multitouch = touches);
    }

    pub fn set_lossless(&self, layer: &DisplayLayer, lossless: bool) {
        self.inner.with_layer_mut(layer.handle, |l| l.pending.lossless = lossless);
    }

    pub fn set_search_for_copies(&self, layer: &DisplayLayer, enabled: bool) {
        self.inner.with_layer_mut(layer.handle, |l| l.pending.search_for_copies = enabled);
    }

    /// Checks out `layer`'s pending buffer for direct pixel access for the
    /// duration of `f`, committing whatever dirty rect `f` leaves behind.
    /// Holds the arena write lock for the whole call, matching the
    /// original's expectation that a raw context's caller already holds
    /// the lock that guards it.
    pub fn draw_raw<R>(&self, layer: &DisplayLayer, f: impl FnOnce(&mut RawContext) -> R) -> R {
        self.inner.mark_dirty_unless_cursor(layer.handle);
        let mut arena = self.inner.arena.write();
        let mut ctx = open_raw(&mut arena, layer.handle);
        let result = f(&mut ctx);
        close_raw(&mut arena, ctx);
        result
    }

    /// Same as [`Display::draw_raw`], through the vector-context seam.
    pub fn draw_vector<R>(&self, layer: &DisplayLayer, f: impl FnOnce(&mut VectorContext) -> R) -> R {
        self.inner.mark_dirty_unless_cursor(layer.handle);
        let mut arena = self.inner.arena.write();
        let mut ctx = open_vector(&mut arena, layer.handle);
        let result = f(&mut ctx);
        close_vector(&mut arena, ctx);
        result
    }

    /// Sets where within the cursor bitmap the actual pointer tip is.
    pub fn set_cursor_hotspot(&self, x: i32, y: i32) {
        let mut pending = self.inner.pending_cursor.lock().unwrap();
        pending.hotspot_x = x;
        pending.hotspot_y = y;
    }

    /// Replaces the cursor bitmap with caller-supplied ARGB pixels and
    /// immediately requests a mouse-only flush. Built-in cursor bitmaps are
    /// out of scope here -- see [`crate::cursor`].
    pub fn set_cursor_pixels(&self, width: i32, height: i32, src_stride: usize, pixels: &[u8]) {
        {
            let mut arena = self.inner.arena.write();
            set_cursor_pixels(&mut arena, self.inner.cursor_layer, width, height, src_stride, pixels);
        }
        self.inner.end_mouse_frame();
    }

    /// Reports that `user` moved the mouse to `(x, y)` with button mask
    /// `mask`, and requests an immediate flush if nothing else is pending.
    /// `user` is excluded from the resulting `mouse` broadcast -- their own
    /// input loop already knows where their cursor is.
    pub fn notify_user_moved_mouse(&self, user: UserId, x: i32, y: i32, mask: u32) {
        let _arena = self.inner.arena.write();
        {
            let mut pending = self.inner.pending_cursor.lock().unwrap();
            pending.x = x;
            pending.y = y;
            pending.mask = mask;
            pending.moving_user = Some(user);
        }
        self.inner.end_mouse_frame();
    }

    /// Hints that drawing activity occurred, for the render thread's
    /// heuristic frame-boundary detection. A no-op if this display was
    /// built with `explicit_frame_boundaries` set, since no render thread
    /// is running to consume the hint.
    pub fn notify_modified(&self) {
        self.inner.render_thread.notify_modified();
    }

    /// Explicitly marks a frame boundary for the render thread to batch,
    /// for back-ends that know exactly when a frame ends but still want
    /// the render thread's lag-aware pacing rather than flushing directly.
    pub fn notify_frame(&self) {
        self.inner.render_thread.notify_frame();
    }

    /// Flushes the current pending frame immediately, bypassing the render
    /// thread entirely -- for back-ends built with `explicit_frame_boundaries`.
    pub fn end_frame(&self) {
        Inner::end_multiple_frames(&self.inner, 0);
    }

    /// Joins `user`, registers their sink, and streams them a full resync
    /// of the last committed frame: every layer's size/position/bitmap,
    /// then the current cursor and mouse position.
    pub fn join(&self, user: UserId, sink: U) {
        self.inner.sink.lock().unwrap().join(user, sink);
        self.inner.dup(user);
    }

    /// Unregisters `user`, returning their sink if one was registered.
    pub fn leave(&self, user: UserId) -> Option<U> {
        self.inner.sink.lock().unwrap().leave(user)
    }

    /// Invalidates the worker FIFO, joins every worker thread and the
    /// render thread (if running), and marks the display stopped.
    /// Idempotent: concurrent or repeated calls simply wait for the first
    /// caller's teardown to finish.
    pub fn stop(&self) {
        self.inner.stop();
    }
}

/// Sets up a freshly constructed layer's pending-side defaults before it is
/// ever inserted into an arena -- `LayerArena::insert` seeds the matching
/// `LastArena` slot as a copy of this pending state, so there's nothing to
/// set on the last side here.
fn apply_layer_defaults(layer: &mut Layer, config: &DisplayConfig) {
    layer.pending.lossless = config.default_lossless();
    layer.pending.search_for_copies = config.default_search_for_copies();
}

impl<U, E> Inner<U, E>
where
    U: WireSink + Send + 'static,
    U::Error: Debug,
    E: ImageEncoder + Send + 'static,
    E::Error: Debug,
{
    fn mark_dirty_unless_cursor(&self, handle: LayerHandle) {
        if handle != self.cursor_layer {
            self.dirty_excluding_mouse.store(true, Ordering::SeqCst);
        }
    }

    fn with_layer_mut(&self, handle: LayerHandle, f: impl FnOnce(&mut Layer)) {
        self.mark_dirty_unless_cursor(handle);
        let mut arena = self.arena.write();
        if let Some(layer) = arena.get_mut(handle) {
            f(layer);
        }
    }

    fn insert_layer(&self, id: LayerId) -> DisplayLayer {
        let mut layer = Layer::new(id, self.default_opaque);
        layer.pending.lossless = self.default_lossless;
        layer.pending.search_for_copies = self.default_search_for_copies;
        layer.backing_buffer = LayerId(self.next_buffer_id.fetch_sub(1, Ordering::SeqCst));

        let mut arena = self.arena.write();
        let mut last = self.last.write();
        let handle = arena.insert(layer, &mut last);
        DisplayLayer { handle, id }
    }

    fn free_layer(&self, layer: DisplayLayer) {
        let removed = {
            let mut arena = self.arena.write();
            let mut last = self.last.write();
            arena.remove(layer.handle, &mut last)
        };
        let Some(removed) = removed else { return };

        let mut sink = self.sink.lock().unwrap();
        if layer.id != LayerId::DEFAULT {
            let _ = sink.send_dispose(layer.id);
        }
        if removed.backing_buffer != LayerId::DEFAULT {
            let _ = sink.send_dispose(removed.backing_buffer);
        }
    }

    /// Requests a flush if the only thing pending is a mouse move --
    /// anything else waits for an explicit `end_frame`/`notify_frame`.
    /// Holds the arena write lock across the check-and-flush so a
    /// concurrent drawing call can't slip a non-mouse change in between
    /// (the same atomicity the original gets from holding the pending-frame
    /// lock across both steps; `RwCell::write` is reentrant for the
    /// nested `end_multiple_frames` call this makes).
    fn end_mouse_frame(&self) {
        let _arena = self.arena.write();
        if !self.dirty_excluding_mouse.load(Ordering::SeqCst) {
            Inner::end_multiple_frames(self, 0);
        }
    }

    /// The heart of the facade: attempts to close out the pending frame.
    /// Defers (leaving the pending frame to keep accumulating) if any
    /// worker is still busy or the FIFO isn't empty; otherwise plans,
    /// commits, and dispatches whatever changed.
    ///
    /// The busy-check only ever takes the pending-frame write lock -- it
    /// must stay cheap, since every `draw_raw`/`draw_vector`/mouse-move call
    /// goes through here. The last-frame write lock is acquired (pending-
    /// then-last, per this module's documented order) only once the check
    /// has already decided this call isn't deferring, so a worker's
    /// in-flight encode or lag-compensation sleep against the last frame
    /// never blocks that check.
    fn end_multiple_frames(this: &Arc<Self>, frames: u64) {
        let now = (this.now_ms)();
        let mut arena = this.arena.write();

        let fifo_nonempty = !this.fifo.is_empty();
        if this.gate.record_and_check_busy(frames, fifo_nonempty) {
            return;
        }

        let mut last = this.last.write();

        let plan = create_plan(&mut arena, &last, now);

        let (pending_cursor, moving_user) = {
            let pending = this.pending_cursor.lock().unwrap();
            (
                CommitCursorState {
                    x: pending.x,
                    y: pending.y,
                    mask: pending.mask,
                    hotspot_x: pending.hotspot_x,
                    hotspot_y: pending.hotspot_y,
                    user_known: pending.moving_user.is_some(),
                },
                pending.moving_user,
            )
        };

        let mut last_cursor = this.last_cursor.lock().unwrap();
        let cursor_before = (last_cursor.x, last_cursor.y, last_cursor.mask);

        let frame_nonempty = {
            let mut sink = this.sink.lock().unwrap();
            frame_complete(&mut arena, &mut last, pending_cursor, &mut last_cursor, &mut *sink)
                .expect("BroadcastSink::Error is Infallible")
        };
        drop(last);

        let cursor_changed = (last_cursor.x, last_cursor.y, last_cursor.mask) != cursor_before;
        if cursor_changed {
            if let Some(user) = moving_user {
                this.sink.lock().unwrap().broadcast_mouse_excluding(Some(user), last_cursor.x, last_cursor.y, last_cursor.mask, now);
            }
        }

        *this.cursor_snapshot.lock().unwrap() = CursorSnapshot {
            layer: Some(this.cursor_layer),
            id: this.cursor_layer_id,
            hotspot_x: last_cursor.hotspot_x,
            hotspot_y: last_cursor.hotspot_y,
        };
        drop(last_cursor);

        this.dirty_excluding_mouse.store(false, Ordering::SeqCst);

        match plan {
            Some(plan) => {
                let resolved = plan_apply::resolve(&arena, &plan.ops);
                let async_ops: Vec<PlanOperation> =
                    plan.ops.into_iter().filter(|op| matches!(op.kind, OpKind::Img | OpKind::EndFrame)).collect();
                drop(arena);

                {
                    let mut sink = this.sink.lock().unwrap();
                    plan_apply::apply(&mut *sink, &resolved).expect("BroadcastSink::Error is Infallible");
                }

                for op in async_ops {
                    if this.fifo.enqueue(op).is_err() {
                        tracing::warn!("dropped a plan operation on a stopped display");
                        break;
                    }
                }
            }
            None => {
                drop(arena);
                // A frame whose only changes were non-graphical layer
                // properties (or a cursor move) still needs a sync
                // boundary the worker pool can recognise, even with no
                // image traffic to piggyback it on.
                if frame_nonempty {
                    if this.fifo.enqueue(PlanOperation::end_frame(now)).is_err() {
                        tracing::warn!("dropped a standalone end-frame boundary on a stopped display");
                    }
                }
            }
        }
    }

    /// Join-time resync: waits for no frame to be in flight, then streams
    /// every layer's current size/position/bitmap plus the cursor and
    /// mouse state to `user` alone, without it reaching anyone else
    /// already joined. Reads only the last-frame lock -- a join never needs
    /// the pending side, so it never contends with a caller drawing.
    fn dup(self: &Arc<Self>, user: UserId) {
        self.render_state.wait_until_idle();
        let last = self.last.read();
        let now = (self.now_ms)();

        let last_cursor = *self.last_cursor.lock().unwrap();
        let frame_count = self.gate.pending_frame_count();

        let mut sink = self.sink.lock().unwrap();
        sink.with_user(user, |u| {
            for entry in last.iter() {
                if entry.frame.pixels.is_released() {
                    continue;
                }

                let _ = u.send_size(entry.id, entry.frame.width, entry.frame.height);

                if entry.frame.width > 0 && entry.frame.height > 0 {
                    let pixels = entry.frame.pixels.as_slice();
                    let bounds = entry.frame.bounds();
                    let mut encoder = self.encoder.lock().unwrap();
                    match encoder.encode_png(pixels, entry.frame.stride, bounds, entry.frame.opaque) {
                        Ok(data) => {
                            let _ = u.send_image(entry.id, 0, 0, display_proto::EncodedImage::Png(&data));
                            let _ = u.send_copy(
                                entry.id,
                                0,
                                0,
                                entry.frame.width,
                                entry.frame.height,
                                display_proto::CompositeMode::Src,
                                entry.backing_buffer,
                                0,
                                0,
                            );
                        }
                        Err(err) => tracing::warn!(?err, layer = ?entry.id, "failed to encode join-time resync image"),
                    }
                }

                if !entry.id.is_buffer() {
                    let _ = u.send_shade(entry.id, entry.frame.opacity);
                    let _ = u.send_move(entry.id, entry.frame.parent, entry.frame.x, entry.frame.y, entry.frame.z);
                    let _ = u.send_set(entry.id, display_proto::LayerParam::MultitouchCapable(entry.frame.multitouch));
                }
            }

            if let Some(cursor_layer) = last.get(self.cursor_layer) {
                let _ = u.send_cursor(
                    last_cursor.hotspot_x,
                    last_cursor.hotspot_y,
                    cursor_layer.id,
                    0,
                    0,
                    cursor_layer.frame.width,
                    cursor_layer.frame.height,
                );
            }
            let _ = u.send_mouse(last_cursor.x, last_cursor.y, last_cursor.mask, now);
            let _ = u.send_sync(now, frame_count);
            let _ = u.flush();
        });
    }

    /// Tears the display down exactly once: whichever caller's
    /// compare-exchange wins invalidates the FIFO, joins the worker pool
    /// and render thread, and marks the render state stopped; every other
    /// concurrent or later caller just waits for that to finish.
    fn stop(self: &Arc<Self>) {
        if self.stopping.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            self.render_state.wait_until_stopped();
            return;
        }

        self.render_thread.stop();
        self.fifo.invalidate();

        if let Some(pool) = self.worker_pool.lock().unwrap().take() {
            pool.join();
        }
        if let Some(handle) = self.render_thread_join.lock().unwrap().take() {
            let _ = handle.join();
        }

        self.render_state.mark_stopped();
    }
}
