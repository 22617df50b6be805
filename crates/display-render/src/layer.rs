//! Per-layer state: the pending/last double buffer, the backing pixels,
//! and the cell grid used to detect which 64x64 blocks actually changed.
//!
//! Layers live in a [`LayerArena`] rather than the intrusive doubly-linked
//! list the original threads them through -- a generation-checked handle
//! plays the same role as the list pointer without the use-after-free
//! hazard of a raw link surviving a `remove`.

use crate::cell::CellGrid;
use display_core::{ckd_mul_or_die, Rect};
use display_proto::LayerId;

pub const RESIZE_FACTOR: i32 = 64;
pub const BYTES_PER_PIXEL: usize = 4;

/// A layer's backing pixel storage.
///
/// `External` marks a buffer the layer does not own -- handed in via
/// `open_raw`/`close_raw` with a caller-supplied slice rather than
/// allocated by a resize. Resizing an `External` buffer is the caller's
/// responsibility; the layer machinery only ever reads it until the next
/// `close_raw` hands back a fresh buffer (at which point the old one, if
/// `Owned`, is simply dropped).
///
/// `Released` is what an `External` buffer becomes once its owner has
/// nulled it out to free it: the layer still believes it holds an external
/// buffer (so a later resize won't try to reallocate one), but there are no
/// pixels left to read. Every reader must treat a released buffer the same
/// way the planner treats a buffer-less layer -- skip and advance.
#[derive(Debug, Clone)]
pub enum LayerPixels {
    Owned(Vec<u8>),
    External(Vec<u8>),
    Released,
}

impl LayerPixels {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            LayerPixels::Owned(v) | LayerPixels::External(v) => v,
            LayerPixels::Released => &[],
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            LayerPixels::Owned(v) | LayerPixels::External(v) => v,
            LayerPixels::Released => &mut [],
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self, LayerPixels::External(_) | LayerPixels::Released)
    }

    /// Nulls out an external buffer, releasing it without freeing anything
    /// the layer itself owns. A no-op on an already-owned or already-released
    /// buffer.
    pub fn release(&mut self) {
        if matches!(self, LayerPixels::External(_)) {
            *self = LayerPixels::Released;
        }
    }

    pub fn is_released(&self) -> bool {
        matches!(self, LayerPixels::Released)
    }

    /// Same as [`LayerPixels::release`], but reports an owned buffer as an
    /// error instead of silently leaving it alone -- for callers that need
    /// to know "did this actually free external memory" rather than just
    /// attempt it.
    pub fn release_checked(&mut self) -> Result<(), crate::error::DisplayError> {
        match self {
            LayerPixels::External(_) => {
                *self = LayerPixels::Released;
                Ok(())
            }
            LayerPixels::Released => Ok(()),
            LayerPixels::Owned(_) => Err(crate::error::DisplayError::BufferNotExternal),
        }
    }
}

impl Default for LayerPixels {
    fn default() -> Self {
        LayerPixels::Owned(Vec::new())
    }
}

/// One frame's worth of a layer's state -- either the pending (being
/// drawn into) or last (most recently committed) half of the double
/// buffer.
#[derive(Debug, Clone, Default)]
pub struct LayerFrameState {
    pub width: i32,
    pub height: i32,
    pub stride: usize,
    pub opacity: u8,
    pub parent: LayerId,
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub multitouch: bool,
    pub opaque: bool,
    pub lossless: bool,
    /// Set whenever a raw/vector context on this layer closes; cleared
    /// once the search-for-copies pass has consumed it for this commit.
    pub search_for_copies: bool,
    pub dirty: Rect,
    pub pixels: LayerPixels,
    pub cells: CellGrid,
}

impl LayerFrameState {
    pub fn bounds(&self) -> Rect {
        Rect::init(0, 0, self.width, self.height)
    }

    /// Resizes the buffer and cell grid to `(width, height)`, rounded up
    /// to [`RESIZE_FACTOR`]. A no-op if the rounded size is unchanged.
    /// Buffers tagged `External` are left alone -- the caller owns them.
    pub fn resize(&mut self, width: i32, height: i32) {
        let rounded_width = round_up(width, RESIZE_FACTOR);
        let rounded_height = round_up(height, RESIZE_FACTOR);
        if rounded_width == self.width && rounded_height == self.height {
            return;
        }

        if !self.pixels.is_external() {
            let stride = ckd_mul_or_die(&[rounded_width as usize, BYTES_PER_PIXEL]);
            let size = ckd_mul_or_die(&[stride, rounded_height as usize]);
            let mut buffer = vec![0u8; size];
            copy_overlap(
                self.pixels.as_slice(),
                self.stride,
                &mut buffer,
                stride,
                self.width.min(rounded_width) as usize,
                self.height.min(rounded_height) as usize,
            );
            self.pixels = LayerPixels::Owned(buffer);
            self.stride = stride;
        }

        self.width = rounded_width;
        self.height = rounded_height;
        self.cells.resize(rounded_width, rounded_height);
    }
}

fn round_up(value: i32, factor: i32) -> i32 {
    if value <= 0 {
        return 0;
    }
    ((value + factor - 1) / factor) * factor
}

/// Stride-aware row copy of whatever overlaps between an old and new
/// buffer, used by both pixel-buffer and cell-grid resizes.
fn copy_overlap(src: &[u8], src_stride: usize, dst: &mut [u8], dst_stride: usize, copy_width_px: usize, copy_rows: usize) {
    let row_bytes = copy_width_px * BYTES_PER_PIXEL;
    for row in 0..copy_rows {
        let src_start = row * src_stride;
        let dst_start = row * dst_stride;
        if src_start + row_bytes > src.len() || dst_start + row_bytes > dst.len() {
            break;
        }
        dst[dst_start..dst_start + row_bytes].copy_from_slice(&src[src_start..src_start + row_bytes]);
    }
}

/// A layer's pending-side state: identity plus the half of the double
/// buffer a caller draws into. The committed ("last") half lives in a
/// separate [`LastArena`], guarded by its own lock -- see that type's
/// documentation for why the two halves were split apart.
#[derive(Debug, Clone, Default)]
pub struct Layer {
    pub id: LayerId,
    pub pending: LayerFrameState,
    /// The off-screen buffer a worker copies this layer's committed content
    /// into at the close of every frame, and the only valid source for a
    /// `Copy` plan operation targeting this layer. Asynchronous image
    /// encoding means a worker may dispatch a `Copy` op several frames after
    /// it was planned, by which point the last frame has moved on --
    /// `backing_buffer` is what stays pinned to whatever the client has
    /// actually been sent. Left as [`LayerId::DEFAULT`] until the owning
    /// facade assigns the real buffer id at allocation time. Set once, at
    /// allocation, and never touched again -- safe to read under either
    /// lock, or neither.
    pub backing_buffer: LayerId,
}

impl Layer {
    pub fn new(id: LayerId, opaque: bool) -> Layer {
        let mut pending = LayerFrameState { opacity: 0xFF, parent: LayerId::DEFAULT, opaque, ..Default::default() };
        pending.resize(RESIZE_FACTOR, RESIZE_FACTOR);
        Layer { id, pending, backing_buffer: LayerId::DEFAULT }
    }
}

/// A generation-checked handle into a [`LayerArena`]. Stable across
/// removals of *other* layers; a handle to a removed layer fails every
/// lookup rather than silently aliasing whatever layer is later allocated
/// into the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayerHandle {
    index: usize,
    generation: u32,
}

struct Slot {
    generation: u32,
    layer: Option<Layer>,
}

/// The set of all layers and buffers belonging to one display, replacing
/// the intrusive doubly-linked list the original threads layers through.
#[derive(Debug, Default)]
pub struct LayerArena {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl LayerArena {
    pub fn new() -> LayerArena {
        LayerArena::default()
    }

    /// Inserts `layer`, seeding its last-frame counterpart in `last` as an
    /// exact copy of the pending state it starts out with -- mirroring the
    /// original allocator, which starts a layer's `last_frame` out identical
    /// to its first `pending_frame`. Insertion and removal are the only
    /// operations that touch both arenas at once, acquired pending-then-last
    /// to match the display's documented lock order.
    pub fn insert(&mut self, layer: Layer, last: &mut LastArena) -> LayerHandle {
        let id = layer.id;
        let backing_buffer = layer.backing_buffer;
        let frame = layer.pending.clone();
        let handle = if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index];
            slot.layer = Some(layer);
            LayerHandle { index, generation: slot.generation }
        } else {
            let index = self.slots.len();
            self.slots.push(Slot { generation: 0, layer: Some(layer) });
            LayerHandle { index, generation: 0 }
        };
        last.activate(handle, id, backing_buffer, frame);
        handle
    }

    pub fn remove(&mut self, handle: LayerHandle, last: &mut LastArena) -> Option<Layer> {
        let slot = self.slots.get_mut(handle.index)?;
        if slot.generation != handle.generation || slot.layer.is_none() {
            return None;
        }
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        last.deactivate(handle);
        slot.layer.take()
    }

    pub fn get(&self, handle: LayerHandle) -> Option<&Layer> {
        let slot = self.slots.get(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.layer.as_ref()
    }

    pub fn get_mut(&mut self, handle: LayerHandle) -> Option<&mut Layer> {
        let slot = self.slots.get_mut(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.layer.as_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = (LayerHandle, &Layer)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.layer.as_ref().map(|layer| (LayerHandle { index, generation: slot.generation }, layer))
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (LayerHandle, &mut Layer)> {
        self.slots.iter_mut().enumerate().filter_map(|(index, slot)| {
            let generation = slot.generation;
            slot.layer.as_mut().map(move |layer| (LayerHandle { index, generation }, layer))
        })
    }
}

/// A last-frame lookup: the write-once identity recorded at allocation time
/// alongside the committed frame state itself. A worker holding only the
/// last-frame lock never has the pending arena in hand to look either up,
/// so [`LastArena`] carries its own copy of both.
#[derive(Debug)]
pub struct LastEntry<'a> {
    pub id: LayerId,
    pub backing_buffer: LayerId,
    pub frame: &'a LayerFrameState,
}

#[derive(Debug, Default)]
struct LastSlot {
    id: LayerId,
    backing_buffer: LayerId,
    alive: bool,
    frame: LayerFrameState,
}

/// The committed ("last") half of every layer's double buffer, indexed
/// directly by [`LayerHandle`] and guarded by its own lock independent of
/// [`LayerArena`]'s.
///
/// The original keeps exactly two whole-display locks -- one for
/// `pending_frame`, one for `last_frame` -- rather than one per layer; this
/// mirrors that by splitting the arena in two instead of sharding further.
/// A worker closing out a frame only ever needs this arena, never
/// [`LayerArena`]'s, so a long encode or the lag-compensation sleep in
/// `close_frame` never contends with a caller drawing into the pending
/// side or checking whether the worker pool is busy.
///
/// `activate`/`deactivate` are called in lockstep with [`LayerArena::insert`]
/// and [`LayerArena::remove`] so a handle is always either live in both
/// arenas or in neither; no generation check is needed here because the
/// pending side's check is authoritative for whether a handle is still
/// valid at all.
#[derive(Debug, Default)]
pub struct LastArena {
    slots: Vec<LastSlot>,
}

impl LastArena {
    pub fn new() -> LastArena {
        LastArena::default()
    }

    fn ensure_len(&mut self, index: usize) {
        if self.slots.len() <= index {
            self.slots.resize_with(index + 1, LastSlot::default);
        }
    }

    pub fn activate(&mut self, handle: LayerHandle, id: LayerId, backing_buffer: LayerId, frame: LayerFrameState) {
        self.ensure_len(handle.index);
        self.slots[handle.index] = LastSlot { id, backing_buffer, alive: true, frame };
    }

    pub fn deactivate(&mut self, handle: LayerHandle) {
        if let Some(slot) = self.slots.get_mut(handle.index) {
            *slot = LastSlot::default();
        }
    }

    pub fn get(&self, handle: LayerHandle) -> Option<LastEntry<'_>> {
        self.slots
            .get(handle.index)
            .filter(|slot| slot.alive)
            .map(|slot| LastEntry { id: slot.id, backing_buffer: slot.backing_buffer, frame: &slot.frame })
    }

    pub fn get_mut(&mut self, handle: LayerHandle) -> Option<&mut LayerFrameState> {
        self.slots.get_mut(handle.index).filter(|slot| slot.alive).map(|slot| &mut slot.frame)
    }

    pub fn iter(&self) -> impl Iterator<Item = LastEntry<'_>> {
        self.slots
            .iter()
            .filter(|slot| slot.alive)
            .map(|slot| LastEntry { id: slot.id, backing_buffer: slot.backing_buffer, frame: &slot.frame })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_rounds_up_to_resize_factor() {
        let mut state = LayerFrameState::default();
        state.resize(10, 100);
        assert_eq!(state.width, 64);
        assert_eq!(state.height, 128);
    }

    #[test]
    fn resize_is_a_noop_when_rounded_size_is_unchanged() {
        let mut state = LayerFrameState::default();
        state.resize(64, 64);
        let stride_before = state.stride;
        state.resize(1, 1);
        assert_eq!(state.stride, stride_before);
    }

    #[test]
    fn external_buffer_is_never_reallocated_by_resize() {
        let mut state = LayerFrameState::default();
        state.pixels = LayerPixels::External(vec![7; 16]);
        state.stride = 16;
        state.resize(1000, 1000);
        assert_eq!(state.pixels.as_slice(), &[7; 16]);
        assert_eq!(state.width, 1024);
    }

    #[test]
    fn releasing_an_external_buffer_leaves_it_external_but_empty() {
        let mut pixels = LayerPixels::External(vec![1, 2, 3]);
        pixels.release();
        assert!(pixels.is_external());
        assert!(pixels.is_released());
        assert!(pixels.as_slice().is_empty());
    }

    #[test]
    fn releasing_an_owned_buffer_is_a_noop() {
        let mut pixels = LayerPixels::Owned(vec![1, 2, 3]);
        pixels.release();
        assert!(!pixels.is_external());
        assert_eq!(pixels.as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn release_checked_rejects_an_owned_buffer() {
        let mut pixels = LayerPixels::Owned(vec![1, 2, 3]);
        assert_eq!(pixels.release_checked(), Err(crate::error::DisplayError::BufferNotExternal));
    }

    #[test]
    fn release_checked_succeeds_on_an_external_buffer() {
        let mut pixels = LayerPixels::External(vec![1, 2, 3]);
        assert!(pixels.release_checked().is_ok());
        assert!(pixels.is_released());
    }

    #[test]
    fn removed_handle_cannot_alias_a_later_insert() {
        let mut arena = LayerArena::new();
        let mut last = LastArena::new();
        let a = arena.insert(Layer::new(LayerId(0), true), &mut last);
        arena.remove(a, &mut last);
        let b = arena.insert(Layer::new(LayerId(1), true), &mut last);
        assert!(arena.get(a).is_none());
        assert!(arena.get(b).is_some());
    }

    #[test]
    fn iter_skips_removed_slots() {
        let mut arena = LayerArena::new();
        let mut last = LastArena::new();
        let a = arena.insert(Layer::new(LayerId(0), true), &mut last);
        let _b = arena.insert(Layer::new(LayerId(1), true), &mut last);
        arena.remove(a, &mut last);
        assert_eq!(arena.iter().count(), 1);
    }

    #[test]
    fn removing_a_layer_deactivates_its_last_arena_slot() {
        let mut arena = LayerArena::new();
        let mut last = LastArena::new();
        let a = arena.insert(Layer::new(LayerId(0), true), &mut last);
        assert!(last.get(a).is_some());
        arena.remove(a, &mut last);
        assert!(last.get(a).is_none());
    }

    #[test]
    fn inserting_seeds_last_arena_with_a_copy_of_the_initial_pending_state() {
        let mut arena = LayerArena::new();
        let mut last = LastArena::new();
        let a = arena.insert(Layer::new(LayerId(3), true), &mut last);
        let pending_width = arena.get(a).unwrap().pending.width;
        let entry = last.get(a).expect("freshly inserted layer has a last-arena entry");
        assert_eq!(entry.id, LayerId(3));
        assert_eq!(entry.frame.width, pending_width);
    }
}
