//! Synchronous application of a plan's non-image operations.
//!
//! `Rect` and `Copy` never touch the worker pool -- they are cheap enough
//! to send directly, and sending them up front (before any `Img` op can be
//! dequeued) lets a worker encoding an `Img` op from the *same* frame rely
//! on every `Rect`/`Copy` having already reached the wire. `Nop` is dropped.
//! `Img`/`EndFrame` are the caller's job to enqueue onto the FIFO.
//!
//! Resolving which layer id and backing buffer each op refers to requires
//! the arena; sending the resulting instructions must not hold the arena
//! lock, since a worker closing out a previous frame needs a read lock on
//! the very same arena to refresh its resync buffers. [`resolve`] does the
//! former while a caller still holds the lock; [`apply`] does the latter
//! after it's been dropped.

use display_core::Rect;
use display_proto::{CompositeMode, LayerId, WireSink};
use display_render::{LayerArena, OpKind, PlanOperation};

/// A plan op with every arena-dependent lookup already resolved to a plain
/// [`LayerId`] -- safe to hold and send after the arena's lock has been
/// released.
#[derive(Debug, Clone, Copy)]
pub enum ResolvedOp {
    Rect { layer: LayerId, dest: Rect, color: [u8; 4], opaque: bool },
    Copy { src_layer: LayerId, src: Rect, dst_layer: LayerId, dest: Rect },
}

/// Resolves every `Rect`/`Copy` op in `ops` while `arena` is still held.
/// `Nop` is silently dropped; `Img`/`EndFrame` are left for the caller to
/// enqueue onto the worker FIFO instead.
pub fn resolve(arena: &LayerArena, ops: &[PlanOperation]) -> Vec<ResolvedOp> {
    let mut resolved = Vec::with_capacity(ops.len());

    for op in ops {
        match op.kind {
            OpKind::Rect => {
                let Some(handle) = op.layer else { continue };
                let Some(layer) = arena.get(handle) else { continue };
                resolved.push(ResolvedOp::Rect {
                    layer: layer.id,
                    dest: op.dest,
                    color: op.color,
                    opaque: layer.pending.opaque,
                });
            }
            OpKind::Copy => {
                let Some(handle) = op.layer else { continue };
                let Some(layer) = arena.get(handle) else { continue };
                let Some((src_handle, src_rect)) = op.source else { continue };
                let Some(src_layer) = arena.get(src_handle) else { continue };
                resolved.push(ResolvedOp::Copy {
                    // The copy source is always the source layer's resync
                    // buffer, never its live `last` state -- a worker may
                    // not have encoded that layer's previous frame yet, so
                    // only the backing buffer is guaranteed to already hold
                    // what was actually sent.
                    src_layer: src_layer.backing_buffer,
                    src: src_rect,
                    dst_layer: layer.id,
                    dest: op.dest,
                });
            }
            _ => {}
        }
    }

    resolved
}

/// Sends every resolved op's wire instructions, in order. Must be called
/// without holding the arena lock.
pub fn apply<S: WireSink>(sink: &mut S, ops: &[ResolvedOp]) -> Result<(), S::Error> {
    for op in ops {
        match *op {
            ResolvedOp::Copy { src_layer, src, dst_layer, dest } => {
                sink.send_copy(
                    src_layer,
                    src.left,
                    src.top,
                    src.width(),
                    src.height(),
                    CompositeMode::Over,
                    dst_layer,
                    dest.left,
                    dest.top,
                )?;
            }
            ResolvedOp::Rect { layer, dest, color, opaque } => {
                sink.send_rect(layer, dest.left, dest.top, dest.width(), dest.height())?;
                let (r, g, b, a) = (color[0], color[1], color[2], color[3]);

                if opaque {
                    sink.send_cfill(layer, CompositeMode::Over, r, g, b, 0xFF)?;
                } else {
                    // Clear first: transparency in the new content would
                    // otherwise blend with whatever the layer already held.
                    sink.send_cfill(layer, CompositeMode::Rout, 0x00, 0x00, 0x00, 0xFF)?;
                    sink.send_cfill(layer, CompositeMode::Over, r, g, b, a)?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use display_proto::{Instruction, LayerId as Id, RecordingSink};
    use display_render::{Layer, LastArena, LayerArena};

    #[test]
    fn opaque_rect_sends_a_single_cfill() {
        let mut arena = LayerArena::new();
        let mut last = LastArena::new();
        let mut layer = Layer::new(Id(1), true);
        layer.backing_buffer = Id(-1);
        let handle = arena.insert(layer, &mut last);

        let ops = vec![PlanOperation {
            layer: Some(handle),
            kind: OpKind::Rect,
            dest: Rect::init(0, 0, 10, 10),
            dirty_size: 0,
            last_frame: 0,
            frame: 1,
            color: [1, 2, 3, 255],
            source: None,
        }];

        let resolved = resolve(&arena, &ops);
        let mut sink = RecordingSink::new();
        apply(&mut sink, &resolved).unwrap();

        let instrs: Vec<_> = sink.non_flush().cloned().collect();
        assert_eq!(instrs.len(), 2);
        assert!(matches!(instrs[0], Instruction::Rect { .. }));
        assert!(matches!(instrs[1], Instruction::Cfill { mode: CompositeMode::Over, a: 255, .. }));
    }

    #[test]
    fn non_opaque_rect_clears_before_drawing() {
        let mut arena = LayerArena::new();
        let mut last = LastArena::new();
        let handle = arena.insert(Layer::new(Id(1), false), &mut last);

        let ops = vec![PlanOperation {
            layer: Some(handle),
            kind: OpKind::Rect,
            dest: Rect::init(0, 0, 10, 10),
            dirty_size: 0,
            last_frame: 0,
            frame: 1,
            color: [9, 8, 7, 128],
            source: None,
        }];

        let resolved = resolve(&arena, &ops);
        let mut sink = RecordingSink::new();
        apply(&mut sink, &resolved).unwrap();

        let instrs: Vec<_> = sink.non_flush().cloned().collect();
        assert_eq!(instrs.len(), 3);
        assert!(matches!(instrs[1], Instruction::Cfill { mode: CompositeMode::Rout, a: 255, .. }));
        assert!(matches!(instrs[2], Instruction::Cfill { mode: CompositeMode::Over, a: 128, .. }));
    }

    #[test]
    fn copy_sources_from_the_layers_backing_buffer() {
        let mut arena = LayerArena::new();
        let mut last = LastArena::new();
        let mut layer = Layer::new(Id(1), true);
        layer.backing_buffer = Id(-5);
        let handle = arena.insert(layer, &mut last);

        let ops = vec![PlanOperation {
            layer: Some(handle),
            kind: OpKind::Copy,
            dest: Rect::init(10, 10, 64, 64),
            dirty_size: 0,
            last_frame: 0,
            frame: 1,
            color: [0; 4],
            source: Some((handle, Rect::init(0, 0, 64, 64))),
        }];

        let resolved = resolve(&arena, &ops);
        let mut sink = RecordingSink::new();
        apply(&mut sink, &resolved).unwrap();

        assert!(sink
            .non_flush()
            .any(|i| matches!(i, Instruction::Copy { src_layer: Id(-5), mode: CompositeMode::Over, .. })));
    }

    #[test]
    fn nop_and_img_ops_resolve_to_nothing() {
        let mut arena = LayerArena::new();
        let mut last = LastArena::new();
        let handle = arena.insert(Layer::new(Id(1), true), &mut last);
        let ops = vec![
            PlanOperation { layer: Some(handle), kind: OpKind::Nop, dest: Rect::EMPTY, dirty_size: 0, last_frame: 0, frame: 1, color: [0; 4], source: None },
            PlanOperation { layer: Some(handle), kind: OpKind::Img, dest: Rect::EMPTY, dirty_size: 0, last_frame: 0, frame: 1, color: [0; 4], source: None },
        ];
        assert!(resolve(&arena, &ops).is_empty());
    }
}
