//! The cursor layer: a layer like any other as far as the planner and
//! worker pool are concerned, singled out only by the facade tracking which
//! layer id it is so a resize/redraw can also refresh the wire-level
//! `cursor` instruction.
//!
//! Built-in cursor bitmaps (the original ships a handful of fixed
//! hand-drawn pointers) are out of scope here -- see the expanded spec's
//! Non-goals -- so [`set_cursor_pixels`] takes whatever ARGB pixel data a
//! caller already has rather than translating a `CursorType` enum into a
//! baked-in bitmap.

use display_core::Rect;
use display_render::layer::BYTES_PER_PIXEL;
use display_render::{close_raw, open_raw, LayerArena, LayerHandle};

/// Writes `pixels` (row-major ARGB, `src_stride` bytes per row) into the
/// cursor layer's pending frame, resizing the layer to `width`x`height` and
/// marking the whole bitmap dirty. Mirrors the original's row-by-row copy
/// of a built-in bitmap into the cursor layer, generalised to caller-
/// supplied pixel data.
pub fn set_cursor_pixels(
    arena: &mut LayerArena,
    cursor_handle: LayerHandle,
    width: i32,
    height: i32,
    src_stride: usize,
    pixels: &[u8],
) {
    // Resize first so the cell grid stays in lockstep with the buffer --
    // writing into a manually-sized buffer here instead would leave the
    // layer's dirty-tracking cells at their old dimensions.
    arena
        .get_mut(cursor_handle)
        .expect("set_cursor_pixels: cursor layer handle does not resolve")
        .pending
        .resize(width, height);

    let mut ctx = open_raw(arena, cursor_handle);

    let dst_stride = ctx.stride;
    let row_bytes = dst_stride.min(src_stride).min(width.max(0) as usize * BYTES_PER_PIXEL);
    let buffer = ctx.buffer.as_mut_slice();
    for row in 0..height.max(0) as usize {
        let src_off = row * src_stride;
        let dst_off = row * dst_stride;
        if src_off + row_bytes > pixels.len() || dst_off + row_bytes > buffer.len() {
            break;
        }
        buffer[dst_off..dst_off + row_bytes].copy_from_slice(&pixels[src_off..src_off + row_bytes]);
    }

    ctx.dirty = Rect::init(0, 0, width, height);
    close_raw(arena, ctx);
}

#[cfg(test)]
mod tests {
    use super::*;
    use display_proto::LayerId;
    use display_render::{Layer, LastArena};

    #[test]
    fn set_cursor_pixels_resizes_and_marks_the_bitmap_dirty() {
        let mut arena = LayerArena::new();
        let mut last = LastArena::new();
        let handle = arena.insert(Layer::new(LayerId(-1), false), &mut last);

        let pixels = vec![0xAB; 4 * 4 * BYTES_PER_PIXEL];
        set_cursor_pixels(&mut arena, handle, 4, 4, 4 * BYTES_PER_PIXEL, &pixels);

        let layer = arena.get(handle).unwrap();
        // Rounded up to the layer resize factor; the dirty rect still only
        // covers the pixels actually written.
        assert_eq!(layer.pending.width, 64);
        assert_eq!(layer.pending.dirty, Rect::init(0, 0, 4, 4));
        assert_eq!(layer.pending.pixels.as_slice()[0..4], [0xAB; 4]);
    }
}
