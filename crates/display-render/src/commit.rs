//! Commits a pending frame into the last-committed frame and emits the
//! synchronous, non-image wire instructions that follow from it (resize,
//! shade, move, multitouch, cursor broadcast). Image data itself is never
//! sent from here -- that's the worker pool's job, driven by the plan this
//! module's caller builds alongside the commit.

use crate::layer::{LastArena, LayerArena, LayerPixels};
use display_core::{ckd_mul_or_die, Rect};
use display_proto::{LayerId, LayerParam, WireSink};

/// The display-wide cursor state tracked across frames, independent of any
/// one layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CursorState {
    pub x: i32,
    pub y: i32,
    pub mask: u32,
    pub hotspot_x: i32,
    pub hotspot_y: i32,
    pub user_known: bool,
}

/// Commits every layer's pending frame state into its last frame, emitting
/// whatever synchronous wire instructions that commit implies. Returns
/// whether any wire-visible change occurred -- a commit consisting only of
/// `search_for_copies`/`lossless` bookkeeping (neither of which is ever
/// sent to the client) still returns `false`.
pub fn frame_complete<S: WireSink>(
    pending: &mut LayerArena,
    last: &mut LastArena,
    pending_cursor: CursorState,
    last_cursor: &mut CursorState,
    sink: &mut S,
) -> Result<bool, S::Error> {
    let mut changed = false;

    for (handle, layer) in pending.iter_mut() {
        if layer.pending.pixels.is_released() {
            continue;
        }
        let Some(last_frame) = last.get_mut(handle) else { continue };

        let logical_size_changed = layer.pending.width != last_frame.width || layer.pending.height != last_frame.height;
        let physical_size_changed = layer.pending.stride != last_frame.stride || logical_size_changed;

        if physical_size_changed {
            let size = ckd_mul_or_die(&[layer.pending.stride, layer.pending.height.max(0) as usize]);
            let mut buffer = vec![0u8; size];
            buffer[..layer.pending.pixels.as_slice().len().min(size)]
                .copy_from_slice(&layer.pending.pixels.as_slice()[..layer.pending.pixels.as_slice().len().min(size)]);
            last_frame.pixels = LayerPixels::Owned(buffer);
            last_frame.stride = layer.pending.stride;
            last_frame.dirty = layer.pending.dirty;
            layer.pending.dirty = Rect::EMPTY;
            changed = true;
        } else if !layer.pending.dirty.is_empty() {
            copy_dirty_rows(&layer.pending, last_frame);
            last_frame.dirty = layer.pending.dirty;
            layer.pending.dirty = Rect::EMPTY;
            changed = true;
        }

        if logical_size_changed {
            sink.send_size(layer.id, layer.pending.width, layer.pending.height)?;
            last_frame.width = layer.pending.width;
            last_frame.height = layer.pending.height;
            changed = true;
        }

        if layer.pending.opacity != last_frame.opacity {
            sink.send_shade(layer.id, layer.pending.opacity)?;
            last_frame.opacity = layer.pending.opacity;
            changed = true;
        }

        if layer.pending.parent != last_frame.parent
            || layer.pending.x != last_frame.x
            || layer.pending.y != last_frame.y
            || layer.pending.z != last_frame.z
        {
            sink.send_move(layer.id, layer.pending.parent, layer.pending.x, layer.pending.y, layer.pending.z)?;
            last_frame.parent = layer.pending.parent;
            last_frame.x = layer.pending.x;
            last_frame.y = layer.pending.y;
            last_frame.z = layer.pending.z;
            changed = true;
        }

        if layer.pending.multitouch != last_frame.multitouch {
            sink.send_set(layer.id, LayerParam::MultitouchCapable(layer.pending.multitouch))?;
            last_frame.multitouch = layer.pending.multitouch;
        }

        // Already took effect for planning purposes; only commits here so
        // the next frame starts clean.
        last_frame.search_for_copies = layer.pending.search_for_copies;
        layer.pending.search_for_copies = false;

        // Affects only how the last frame is interpreted by the planner,
        // never sent to the client.
        last_frame.lossless = layer.pending.lossless;
    }

    last_cursor.hotspot_x = pending_cursor.hotspot_x;
    last_cursor.hotspot_y = pending_cursor.hotspot_y;

    if pending_cursor.x != last_cursor.x || pending_cursor.y != last_cursor.y || pending_cursor.mask != last_cursor.mask
    {
        last_cursor.x = pending_cursor.x;
        last_cursor.y = pending_cursor.y;
        last_cursor.mask = pending_cursor.mask;
        last_cursor.user_known = pending_cursor.user_known;
        changed = true;
    }

    Ok(changed)
}

fn copy_dirty_rows(pending: &crate::layer::LayerFrameState, last: &mut crate::layer::LayerFrameState) {
    let rect = pending.dirty;
    if rect.is_empty() {
        return;
    }
    let bpp = crate::layer::BYTES_PER_PIXEL;
    let row_bytes = rect.width() as usize * bpp;

    let pending_pixels = pending.pixels.as_slice();
    let last_pixels = last.pixels.as_mut_slice();

    for y in rect.top..rect.bottom {
        let pending_offset = y as usize * pending.stride + rect.left as usize * bpp;
        let last_offset = y as usize * last.stride + rect.left as usize * bpp;
        if pending_offset + row_bytes > pending_pixels.len() || last_offset + row_bytes > last_pixels.len() {
            continue;
        }
        last_pixels[last_offset..last_offset + row_bytes]
            .copy_from_slice(&pending_pixels[pending_offset..pending_offset + row_bytes]);
    }
}

/// Whether the cursor layer (identified by `cursor_layer`) was among the
/// layers whose last-frame dirty rect is non-empty -- used by the worker
/// that closes a frame to decide whether to re-emit the cursor. Needs only
/// the last-frame lock, since every field it reads lives there.
pub fn cursor_layer_touched(last: &LastArena, cursor_layer: LayerId) -> bool {
    last.iter().any(|entry| entry.id == cursor_layer && !entry.frame.dirty.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::Layer;
    use display_proto::{Instruction, RecordingSink};

    #[test]
    fn resize_triggers_a_size_instruction_and_bulk_copy() {
        let mut arena = LayerArena::new();
        let mut last = LastArena::new();
        let mut layer = Layer::new(LayerId(0), true);
        layer.pending.resize(128, 64);
        layer.pending.pixels.as_mut_slice()[0..4].copy_from_slice(&[9, 9, 9, 255]);
        layer.pending.dirty = Rect::init(0, 0, 4, 1);
        let handle = arena.insert(layer, &mut last);

        let mut sink = RecordingSink::new();
        let mut last_cursor = CursorState::default();
        let changed =
            frame_complete(&mut arena, &mut last, CursorState::default(), &mut last_cursor, &mut sink).unwrap();

        assert!(changed);
        assert!(sink
            .non_flush()
            .any(|i| matches!(i, Instruction::Size { width: 128, height: 64, .. })));
        assert_eq!(last.get(handle).unwrap().frame.pixels.as_slice()[0..4], [9, 9, 9, 255]);
    }

    #[test]
    fn unchanged_layer_commits_nothing() {
        let mut arena = LayerArena::new();
        let mut last = LastArena::new();
        arena.insert(Layer::new(LayerId(0), true), &mut last);

        let mut sink = RecordingSink::new();
        let mut last_cursor = CursorState::default();
        let changed =
            frame_complete(&mut arena, &mut last, CursorState::default(), &mut last_cursor, &mut sink).unwrap();

        assert!(!changed);
        assert_eq!(sink.instructions.len(), 0);
    }

    #[test]
    fn cursor_move_is_reported_as_a_change_but_sends_no_instruction_here() {
        let mut arena = LayerArena::new();
        let mut last = LastArena::new();
        arena.insert(Layer::new(LayerId(0), true), &mut last);

        let mut sink = RecordingSink::new();
        let mut last_cursor = CursorState::default();
        let pending_cursor = CursorState { x: 10, y: 20, mask: 1, user_known: true, ..Default::default() };
        let changed = frame_complete(&mut arena, &mut last, pending_cursor, &mut last_cursor, &mut sink).unwrap();

        assert!(changed);
        assert_eq!(last_cursor.x, 10);
        assert_eq!(sink.instructions.len(), 0);
    }

    #[test]
    fn search_for_copies_is_cleared_on_commit() {
        let mut arena = LayerArena::new();
        let mut last = LastArena::new();
        let mut layer = Layer::new(LayerId(0), true);
        layer.pending.search_for_copies = true;
        let handle = arena.insert(layer, &mut last);

        let mut sink = RecordingSink::new();
        let mut last_cursor = CursorState::default();
        frame_complete(&mut arena, &mut last, CursorState::default(), &mut last_cursor, &mut sink).unwrap();

        let (_, layer) = arena.iter().next().unwrap();
        assert!(!layer.pending.search_for_copies);
        assert!(last.get(handle).unwrap().frame.search_for_copies);
    }

    #[test]
    fn cursor_layer_touched_only_needs_the_last_arena() {
        let mut arena = LayerArena::new();
        let mut last = LastArena::new();
        let mut layer = Layer::new(LayerId(5), true);
        layer.pending.dirty = Rect::init(0, 0, 4, 4);
        let handle = arena.insert(layer, &mut last);

        let mut sink = RecordingSink::new();
        let mut last_cursor = CursorState::default();
        frame_complete(&mut arena, &mut last, CursorState::default(), &mut last_cursor, &mut sink).unwrap();

        assert!(cursor_layer_touched(&last, LayerId(5)));
        assert!(!cursor_layer_touched(&last, LayerId(6)));
        let _ = handle;
    }
}
