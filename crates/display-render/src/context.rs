//! Raw and vector pixel-access contexts: the seam through which a caller
//! actually draws into a layer's pending frame.
//!
//! Both contexts hand out the layer's pending buffer for direct
//! modification and commit a dirty rect back on close. They do not take any
//! lock themselves -- callers are expected to be holding whatever write
//! lock guards the arena already (the `display` facade's pending-frame
//! lock), the same division of responsibility `plan::create` and
//! `commit::frame_complete` already use.
//!
//! A vector (Cairo-style) context is, in the original, backed by a real
//! cached rendering surface so repeated vector draws don't pay an
//! attach/detach cost every call. Pulling in an actual 2D rendering crate is
//! out of scope here -- no codec or rasterizer is a dependency of this
//! engine -- so [`VectorContext`] is the same raw pixel access as
//! [`RawContext`], under a distinct name so a caller wiring in their own
//! rasterizer has an obvious seam to extend.

use crate::layer::{LayerArena, LayerHandle, LayerPixels};
use display_core::Rect;

const MAX_DIMENSION: i32 = 8192;

/// A layer's pending pixel buffer, checked out for direct modification.
///
/// Replacing `buffer` with [`LayerPixels::External`] on close is how a
/// caller hands the layer zero-copy memory it doesn't own; leaving it as
/// whatever variant it already was is how ordinary in-place drawing commits.
pub struct RawContext {
    handle: LayerHandle,
    pub buffer: LayerPixels,
    pub stride: usize,
    pub bounds: Rect,
    pub dirty: Rect,
}

/// Checks out `handle`'s pending buffer for direct pixel access. Panics if
/// `handle` does not resolve -- opening a context on a layer that no longer
/// exists is a caller bug, not a recoverable condition.
pub fn open_raw(arena: &mut LayerArena, handle: LayerHandle) -> RawContext {
    let layer = arena.get_mut(handle).expect("open_raw: layer handle does not resolve");
    let buffer = std::mem::take(&mut layer.pending.pixels);
    RawContext { handle, buffer, stride: layer.pending.stride, bounds: layer.pending.bounds(), dirty: Rect::EMPTY }
}

/// Commits a raw context: installs whatever buffer the caller left behind,
/// adopts its stride/bounds (clamped to the engine's maximum layer
/// dimension), and unions the reported dirty rect into the layer's pending
/// dirty state. Re-arms `search_for_copies` so the next plan considers this
/// layer's new content for copy detection, matching the original's
/// hint-setting behaviour on every raw/vector context close.
pub fn close_raw(arena: &mut LayerArena, ctx: RawContext) {
    let layer = arena.get_mut(ctx.handle).expect("close_raw: layer handle does not resolve");

    layer.pending.pixels = ctx.buffer;
    layer.pending.stride = ctx.stride;
    layer.pending.width = ctx.bounds.width().min(MAX_DIMENSION);
    layer.pending.height = ctx.bounds.height().min(MAX_DIMENSION);
    layer.pending.dirty.extend(&ctx.dirty);
    layer.pending.search_for_copies = true;
}

/// See the module documentation: identical semantics to [`RawContext`],
/// named separately as the attachment point for a real vector/Cairo-style
/// rendering surface.
pub type VectorContext = RawContext;

pub fn open_vector(arena: &mut LayerArena, handle: LayerHandle) -> VectorContext {
    open_raw(arena, handle)
}

pub fn close_vector(arena: &mut LayerArena, ctx: VectorContext) {
    close_raw(arena, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{Layer, LastArena};
    use display_proto::LayerId;

    #[test]
    fn close_raw_commits_dirty_rect_and_rearms_search_for_copies() {
        let mut arena = LayerArena::new();
        let mut last = LastArena::new();
        let handle = arena.insert(Layer::new(LayerId(1), true), &mut last);
        arena.get_mut(handle).unwrap().pending.search_for_copies = false;

        let mut ctx = open_raw(&mut arena, handle);
        ctx.dirty = Rect::init(0, 0, 32, 32);
        close_raw(&mut arena, ctx);

        let layer = arena.get(handle).unwrap();
        assert_eq!(layer.pending.dirty, Rect::init(0, 0, 32, 32));
        assert!(layer.pending.search_for_copies);
    }

    #[test]
    fn closing_with_an_external_buffer_marks_the_layer_external() {
        let mut arena = LayerArena::new();
        let mut last = LastArena::new();
        let handle = arena.insert(Layer::new(LayerId(1), true), &mut last);

        let mut ctx = open_raw(&mut arena, handle);
        ctx.buffer = LayerPixels::External(vec![9; 64 * 64 * 4]);
        ctx.stride = 64 * 4;
        ctx.bounds = Rect::init(0, 0, 64, 64);
        close_raw(&mut arena, ctx);

        let layer = arena.get(handle).unwrap();
        assert!(layer.pending.pixels.is_external());
    }

    #[test]
    fn bounds_are_clamped_to_the_maximum_layer_dimension() {
        let mut arena = LayerArena::new();
        let mut last = LastArena::new();
        let handle = arena.insert(Layer::new(LayerId(1), true), &mut last);

        let mut ctx = open_raw(&mut arena, handle);
        ctx.bounds = Rect::init(0, 0, MAX_DIMENSION + 1000, MAX_DIMENSION + 1000);
        close_raw(&mut arena, ctx);

        let layer = arena.get(handle).unwrap();
        assert_eq!(layer.pending.width, MAX_DIMENSION);
        assert_eq!(layer.pending.height, MAX_DIMENSION);
    }
}
