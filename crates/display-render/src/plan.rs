//! The six-pass frame planner: turns a layer's accumulated pending dirty
//! rect into a minimal, client-friendly sequence of draw operations.
//!
//! Passes run in a fixed order, each rewriting the operations the previous
//! pass produced rather than building its own list from scratch:
//!
//! 0. draft        -- one IMG op per changed 64x64 cell
//! 1. rectangles   -- IMG -> RECT where the cell is a single solid colour
//! 2. index        -- hash every still-IMG op's pixels for copy detection
//! 3. copies       -- IMG -> COPY wherever the last frame already has a
//!                     byte-identical 64x64 block somewhere else
//! 4. combine h     -- merge adjacent same-row ops where that's cheaper
//! 5. combine v     -- merge adjacent same-column ops where that's cheaper
//!
//! Passes 4 and 5 are intentionally not unified into one pass: pass 5 walks
//! cells that pass 4 may have repointed to a new survivor op, so it has to
//! recheck adjacency rather than assume it from the grid shape alone --
//! `try_combine_step` re-derives a common edge from the two ops' current
//! destinations on every step, in both directions, rather than trusting
//! that neighbouring cells still border each other post-merge.

use crate::cell::{hash_cell, Cell, CellGrid, CELL_SIZE, CELL_SIZE_EXPONENT};
use crate::layer::{LastArena, LayerArena, LayerHandle, BYTES_PER_PIXEL};
use display_core::Rect;
use std::collections::HashMap;
use tracing::trace;

/// Grid anchor (as a power-of-two exponent) that combined rects may not
/// cross. Snapping combine results to this coarser grid keeps horizontally-
/// and vertically-combined strips alignable with each other, and bounds how
/// large a single encoded image can get.
pub const MAX_COMBINED_SIZE_EXPONENT: u32 = 9;
pub const NEGLIGIBLE_WIDTH: i32 = 64;
pub const NEGLIGIBLE_HEIGHT: i32 = 64;
const BASE_COST: usize = 4096;
const DATA_FACTOR: usize = 128;
const NEGLIGIBLE_INCREASE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Nop,
    Copy,
    Rect,
    Img,
    EndFrame,
}

/// One planned draw operation, destined either for synchronous application
/// (RECT, COPY) or the worker pool (IMG), or acting as a frame-boundary
/// sentinel (END_FRAME, which carries no layer).
#[derive(Debug, Clone)]
pub struct PlanOperation {
    pub layer: Option<LayerHandle>,
    pub kind: OpKind,
    pub dest: Rect,
    pub dirty_size: usize,
    pub last_frame: u64,
    pub frame: u64,
    /// Solid fill colour, valid when `kind == Rect`.
    pub color: [u8; BYTES_PER_PIXEL],
    /// `(source_layer, source_rect)`, valid when `kind == Copy`. The source
    /// layer's *last* committed frame is always the implied source buffer.
    pub source: Option<(LayerHandle, Rect)>,
}

impl PlanOperation {
    /// Builds a standalone `EndFrame` sentinel, for callers that need to
    /// enqueue a frame boundary without a full plan -- a frame whose only
    /// changes were non-graphical layer properties still needs one so the
    /// worker pool can recognise the boundary.
    pub fn end_frame(frame: u64) -> PlanOperation {
        PlanOperation {
            layer: None,
            kind: OpKind::EndFrame,
            dest: Rect::EMPTY,
            dirty_size: 0,
            last_frame: 0,
            frame,
            color: [0; BYTES_PER_PIXEL],
            source: None,
        }
    }
}

/// The full set of operations produced for one frame, always terminated by
/// an `EndFrame` sentinel so the worker pool can recognise the boundary
/// even if every other op was applied synchronously.
#[derive(Debug, Clone)]
pub struct Plan {
    pub timestamp: u64,
    pub ops: Vec<PlanOperation>,
}

/// Builds a plan from every layer's current pending dirty state, diffed
/// against `last`'s committed content. Returns `None` if no layer produced
/// a single dirty cell -- callers should treat that the same as "nothing to
/// do", not a degenerate empty plan.
///
/// Runs with the pending frame write-locked (every pass mutates a layer's
/// cell grid) and the last frame read-locked.
pub fn create(pending: &mut LayerArena, last: &LastArena, now: u64) -> Option<Plan> {
    let mut ops = pass0_draft(pending, last, now);
    trace!(phase = "draft", op_count = ops.len(), "plan phase 1/6 complete");
    if ops.is_empty() {
        return None;
    }

    pass1_rectangles(pending, &mut ops);
    trace!(phase = "rects", "plan phase 2/6 complete");

    let index = pass2_index(pending, &ops);
    pass3_copies(pending, last, &mut ops, index);
    trace!(phase = "search", "plan phase 3/6 complete");

    combine_pass(pending, &mut ops, Direction::Horizontal);
    combine_pass(pending, &mut ops, Direction::Vertical);
    trace!(
        phase = "combine",
        surviving_ops = ops.iter().filter(|op| op.kind != OpKind::Nop).count(),
        "plan phases 4-5/6 complete"
    );

    ops.push(PlanOperation::end_frame(now));
    Some(Plan { timestamp: now, ops })
}

fn pass0_draft(pending: &mut LayerArena, last: &LastArena, now: u64) -> Vec<PlanOperation> {
    let mut ops = Vec::new();

    for (handle, layer) in pending.iter_mut() {
        if layer.pending.pixels.is_released() {
            continue;
        }
        if layer.pending.dirty.is_empty() {
            continue;
        }
        let Some(last_entry) = last.get(handle) else { continue };

        let mut aligned = layer.pending.dirty;
        aligned.align(CELL_SIZE_EXPONENT);
        aligned.constrain(&layer.pending.bounds());
        if aligned.is_empty() {
            continue;
        }

        let pending_stride = layer.pending.stride;
        let last_stride = last_entry.frame.stride;
        let last_bounds = last_entry.frame.bounds();
        let pending_bounds = layer.pending.bounds();

        let coords: Vec<(usize, usize)> = layer.pending.cells.coords_in(&aligned).collect();
        let mut layer_dirty = Rect::EMPTY;

        for (col, row) in coords {
            let mut cell_rect =
                Rect::init(col as i32 * CELL_SIZE, row as i32 * CELL_SIZE, CELL_SIZE, CELL_SIZE);
            cell_rect.constrain(&pending_bounds);
            if cell_rect.is_empty() {
                continue;
            }

            let (dirty_rect, dirty_size) = diff_cell(
                layer.pending.pixels.as_slice(),
                pending_stride,
                last_entry.frame.pixels.as_slice(),
                last_stride,
                last_bounds,
                cell_rect,
                BYTES_PER_PIXEL,
            );
            if dirty_rect.is_empty() {
                continue;
            }

            let prior = layer.pending.cells.get(col, row);
            let op_index = ops.len();
            ops.push(PlanOperation {
                layer: Some(handle),
                kind: OpKind::Img,
                dest: dirty_rect,
                dirty_size,
                last_frame: prior.last_frame,
                frame: now,
                color: [0; BYTES_PER_PIXEL],
                source: None,
            });
            layer.pending.cells.set(
                col,
                row,
                Cell { hash: 0, last_frame: now, dirty: dirty_rect, dirty_size, related_op: Some(op_index) },
            );
            layer_dirty.extend(&dirty_rect);
        }

        layer.pending.dirty = layer_dirty;
    }

    ops
}

/// Finds the minimal dirty sub-rect of one 64x64 cell by comparing it
/// row-by-row against the corresponding region of the last frame. Rows (or
/// parts of rows) that fall outside the last frame's bounds are treated as
/// inherently dirty, since there is nothing to compare against.
fn diff_cell(
    pending: &[u8],
    pending_stride: usize,
    last: &[u8],
    last_stride: usize,
    last_bounds: Rect,
    cell: Rect,
    bpp: usize,
) -> (Rect, usize) {
    let mut dirty = Rect::EMPTY;
    let mut size = 0usize;
    let cell_width = cell.width() as usize;

    for y in cell.top..cell.bottom {
        let pending_row_offset = y as usize * pending_stride + cell.left as usize * bpp;
        let pending_row_end = pending_row_offset + cell_width * bpp;
        if pending_row_end > pending.len() {
            continue;
        }
        let pending_row = &pending[pending_row_offset..pending_row_end];

        let row_in_last = y >= last_bounds.top && y < last_bounds.bottom;
        let usable_width = if row_in_last {
            (last_bounds.right.min(cell.right) - cell.left).clamp(0, cell_width as i32) as usize
        } else {
            0
        };

        let mut row_start = None;
        let mut row_end = None;

        if usable_width > 0 {
            let last_row_offset = y as usize * last_stride + cell.left as usize * bpp;
            let last_row_end = last_row_offset + usable_width * bpp;
            if last_row_end <= last.len() {
                let last_row = &last[last_row_offset..last_row_end];
                for px in 0..usable_width {
                    let a = &pending_row[px * bpp..px * bpp + bpp];
                    let b = &last_row[px * bpp..px * bpp + bpp];
                    if a != b {
                        if row_start.is_none() {
                            row_start = Some(px);
                        }
                        row_end = Some(px + 1);
                    }
                }
            } else {
                row_start = Some(0);
                row_end = Some(cell_width);
            }
        }

        if usable_width < cell_width {
            row_start = Some(row_start.unwrap_or(usable_width).min(usable_width));
            row_end = Some(cell_width);
        }

        if let (Some(start), Some(end)) = (row_start, row_end) {
            if end > start {
                let row_rect = Rect::init(cell.left + start as i32, y, (end - start) as i32, 1);
                dirty.extend(&row_rect);
                size += (end - start) * bpp;
            }
        }
    }

    (dirty, size)
}

fn pass1_rectangles(arena: &LayerArena, ops: &mut [PlanOperation]) {
    for op in ops.iter_mut() {
        if op.kind != OpKind::Img {
            continue;
        }
        let Some(handle) = op.layer else { continue };
        let Some(layer) = arena.get(handle) else { continue };
        let pending = &layer.pending;
        if let Some(mut color) = single_color(pending.pixels.as_slice(), pending.stride, BYTES_PER_PIXEL, op.dest) {
            if pending.opaque {
                color[3] = 0xFF;
            }
            op.kind = OpKind::Rect;
            op.color = color;
        }
    }
}

/// Whether every pixel within `rect` is the same colour. Equivalent to the
/// original's recursive power-of-two halving test, minus that test's early-
/// exit optimisation -- both accept and reject the same rectangles.
fn single_color(pixels: &[u8], stride: usize, bpp: usize, rect: Rect) -> Option<[u8; 4]> {
    let width = rect.width() as usize;
    if width == 0 || rect.height() == 0 {
        return None;
    }

    let first_offset = rect.top as usize * stride + rect.left as usize * bpp;
    if first_offset + bpp > pixels.len() {
        return None;
    }
    let mut color = [0u8; 4];
    color[..bpp].copy_from_slice(&pixels[first_offset..first_offset + bpp]);

    for y in rect.top..rect.bottom {
        let row_offset = y as usize * stride + rect.left as usize * bpp;
        let row_end = row_offset + width * bpp;
        if row_end > pixels.len() {
            return None;
        }
        for px in pixels[row_offset..row_end].chunks_exact(bpp) {
            if px != &color[..bpp] {
                return None;
            }
        }
    }

    Some(color)
}

/// XORs the four 16-bit lanes of a 64-bit hash down to 16 bits -- the
/// bucket width of the copy-detection index.
fn fold16(hash: u64) -> u16 {
    let a = (hash & 0xFFFF) as u16;
    let b = ((hash >> 16) & 0xFFFF) as u16;
    let c = ((hash >> 32) & 0xFFFF) as u16;
    let d = ((hash >> 48) & 0xFFFF) as u16;
    a ^ b ^ c ^ d
}

fn rect_within(outer: &Rect, inner: &Rect) -> bool {
    inner.left >= outer.left && inner.top >= outer.top && inner.right <= outer.right && inner.bottom <= outer.bottom
}

/// Hashes every still-`Img` op's destination pixels and indexes the first
/// op seen per 16-bit hash bucket. Only cell-aligned, fully-in-bounds 64x64
/// destinations participate -- anything smaller or clipped by a layer edge
/// cannot have been produced by a pure scroll/copy.
fn pass2_index(arena: &LayerArena, ops: &[PlanOperation]) -> HashMap<u16, usize> {
    let mut index = HashMap::new();

    for (op_index, op) in ops.iter().enumerate() {
        if op.kind != OpKind::Img {
            continue;
        }
        if op.dest.width() != CELL_SIZE || op.dest.height() != CELL_SIZE {
            continue;
        }
        let Some(handle) = op.layer else { continue };
        let Some(layer) = arena.get(handle) else { continue };
        if !rect_within(&layer.pending.bounds(), &op.dest) {
            continue;
        }

        let hash = hash_cell(layer.pending.pixels.as_slice(), layer.pending.stride, BYTES_PER_PIXEL, op.dest);
        index.entry(fold16(hash)).or_insert(op_index);
    }

    index
}

/// Slides a 64x64 window across each copy-eligible layer's last-frame
/// content, looking for a byte-exact match with a still-`Img` op's pending
/// pixels. A confirmed match rewrites the op as `Copy`; the index entry is
/// then removed so a pattern only satisfies one destination.
fn pass3_copies(pending: &LayerArena, last: &LastArena, ops: &mut [PlanOperation], mut index: HashMap<u16, usize>) {
    let candidates: Vec<(LayerHandle, Rect)> = pending
        .iter()
        .filter(|(_, layer)| layer.pending.search_for_copies)
        .filter_map(|(handle, layer)| {
            let mut search = last.get(handle)?.frame.bounds();
            search.constrain(&layer.pending.dirty);
            Some((handle, search))
        })
        .filter(|(_, search)| search.width() >= CELL_SIZE && search.height() >= CELL_SIZE)
        .collect();

    for (handle, search) in candidates {
        let Some(layer) = pending.get(handle) else { continue };
        let Some(last_entry) = last.get(handle) else { continue };
        let last_pixels = last_entry.frame.pixels.as_slice();
        let last_stride = last_entry.frame.stride;

        let max_y = search.bottom - CELL_SIZE;
        let max_x = search.right - CELL_SIZE;
        let mut y = search.top;
        while y <= max_y {
            let mut x = search.left;
            while x <= max_x {
                let window = Rect::init(x, y, CELL_SIZE, CELL_SIZE);
                let hash = hash_cell(last_pixels, last_stride, BYTES_PER_PIXEL, window);
                let h16 = fold16(hash);

                if let Some(&op_index) = index.get(&h16) {
                    let candidate_matches = {
                        let op = &ops[op_index];
                        op.kind == OpKind::Img && op.layer == Some(handle)
                    };
                    if candidate_matches {
                        let dest = ops[op_index].dest;
                        let matches = images_equal(
                            layer.pending.pixels.as_slice(),
                            layer.pending.stride,
                            dest,
                            last_pixels,
                            last_stride,
                            window,
                            BYTES_PER_PIXEL,
                        );
                        if matches {
                            let op = &mut ops[op_index];
                            op.kind = OpKind::Copy;
                            op.source = Some((handle, window));
                            index.remove(&h16);
                        }
                    }
                }
                x += 1;
            }
            y += 1;
        }
    }
}

fn images_equal(a: &[u8], a_stride: usize, a_rect: Rect, b: &[u8], b_stride: usize, b_rect: Rect, bpp: usize) -> bool {
    let width = a_rect.width().min(b_rect.width()) as usize;
    let height = a_rect.height().min(b_rect.height()) as usize;
    for row in 0..height {
        let a_off = (a_rect.top as usize + row) * a_stride + a_rect.left as usize * bpp;
        let b_off = (b_rect.top as usize + row) * b_stride + b_rect.left as usize * bpp;
        let len = width * bpp;
        if a_off + len > a.len() || b_off + len > b.len() {
            return false;
        }
        if a[a_off..a_off + len] != b[b_off..b_off + len] {
            return false;
        }
    }
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Horizontal,
    Vertical,
}

/// Walks one layer's cell grid in row-major (`Horizontal`) or column-major
/// (`Vertical`) order, attempting to combine each cell's op with the
/// previous cell's op in the walk direction.
fn combine_pass(arena: &mut LayerArena, ops: &mut Vec<PlanOperation>, direction: Direction) {
    for (handle, layer) in arena.iter_mut() {
        let cols = layer.pending.cells.cols;
        let rows = layer.pending.cells.rows;
        if cols == 0 || rows == 0 {
            continue;
        }

        match direction {
            Direction::Horizontal => {
                for row in 0..rows {
                    let mut prev = None;
                    for col in 0..cols {
                        try_combine_step(&mut layer.pending.cells, ops, handle, prev, (col, row));
                        prev = Some((col, row));
                    }
                }
            }
            Direction::Vertical => {
                for col in 0..cols {
                    let mut prev = None;
                    for row in 0..rows {
                        try_combine_step(&mut layer.pending.cells, ops, handle, prev, (col, row));
                        prev = Some((col, row));
                    }
                }
            }
        }
    }
}

fn try_combine_step(
    grid: &mut CellGrid,
    ops: &mut Vec<PlanOperation>,
    handle: LayerHandle,
    prev: Option<(usize, usize)>,
    cur: (usize, usize),
) {
    let Some(prev) = prev else { return };
    let prev_cell = grid.get(prev.0, prev.1);
    let cur_cell = grid.get(cur.0, cur.1);
    let (Some(prev_op), Some(cur_op)) = (prev_cell.related_op, cur_cell.related_op) else { return };
    if prev_op == cur_op {
        return;
    }
    if ops[prev_op].layer != Some(handle) || ops[cur_op].layer != Some(handle) {
        return;
    }
    if ops[prev_op].kind == OpKind::Nop || ops[cur_op].kind == OpKind::Nop {
        return;
    }

    // A cell the row-major pass repointed to a new survivor op may no
    // longer actually border its column-major neighbour (and vice versa),
    // so adjacency is rechecked here rather than assumed from grid
    // position -- this must hold regardless of op kind, since `should_combine`
    // itself only requires a common edge for some kind pairs.
    if !has_common_edge(&ops[prev_op].dest, &ops[cur_op].dest) {
        return;
    }

    if should_combine(&ops[prev_op], &ops[cur_op]) {
        combine_into(ops, prev_op, cur_op);
        let mut absorbed = cur_cell;
        absorbed.related_op = Some(prev_op);
        grid.set(cur.0, cur.1, absorbed);
    }
}

fn has_common_edge(a: &Rect, b: &Rect) -> bool {
    let horizontal = (a.right == b.left || b.right == a.left) && a.top == b.top && a.bottom == b.bottom;
    let vertical = (a.bottom == b.top || b.bottom == a.top) && a.left == b.left && a.right == b.right;
    horizontal || vertical
}

fn rect_crosses_boundary(rect: &Rect) -> bool {
    if rect.is_empty() {
        return false;
    }
    let grid = 1i32 << MAX_COMBINED_SIZE_EXPONENT;
    (rect.left / grid) != ((rect.right - 1) / grid) || (rect.top / grid) != ((rect.bottom - 1) / grid)
}

fn op_cost(kind: OpKind, dirty_size: usize) -> usize {
    let base = BASE_COST + dirty_size;
    if kind == OpKind::Img {
        base
    } else {
        base / DATA_FACTOR
    }
}

fn should_combine(a: &PlanOperation, b: &PlanOperation) -> bool {
    if a.layer != b.layer {
        return false;
    }

    let mut combined_dest = a.dest;
    combined_dest.extend(&b.dest);
    if rect_crosses_boundary(&combined_dest) {
        return false;
    }

    match (a.kind, b.kind) {
        (OpKind::Rect, OpKind::Rect) => {
            if a.color == b.color && has_common_edge(&a.dest, &b.dest) {
                return true;
            }
        }
        (OpKind::Copy, OpKind::Copy) => {
            if let (Some((a_src_layer, a_src)), Some((b_src_layer, b_src))) = (a.source, b.source) {
                if a_src_layer == b_src_layer && has_common_edge(&a.dest, &b.dest) {
                    let a_disp = (a.dest.left - a_src.left, a.dest.top - a_src.top);
                    let b_disp = (b.dest.left - b_src.left, b.dest.top - b_src.top);
                    if a_disp == b_disp {
                        return true;
                    }
                }
            }
        }
        (OpKind::Img, OpKind::Img) => return true,
        _ => {}
    }

    if combined_dest.width() <= NEGLIGIBLE_WIDTH && combined_dest.height() <= NEGLIGIBLE_HEIGHT {
        return true;
    }

    let combined_kind = if a.kind == b.kind { a.kind } else { OpKind::Img };
    let combined_dirty = a.dirty_size + b.dirty_size;
    let cost_a = op_cost(a.kind, a.dirty_size);
    let cost_b = op_cost(b.kind, b.dirty_size);
    let cost_ab = op_cost(combined_kind, combined_dirty);

    cost_ab <= cost_a + cost_b
        || cost_ab.saturating_sub(cost_a) <= cost_a / NEGLIGIBLE_INCREASE
        || cost_ab.saturating_sub(cost_b) <= cost_b / NEGLIGIBLE_INCREASE
}

/// Merges `absorbed` into `survivor` in place and downgrades `absorbed` to
/// a `Nop` the worker pool will simply skip.
fn combine_into(ops: &mut [PlanOperation], survivor: usize, absorbed: usize) {
    let absorbed_op = ops[absorbed].clone();
    let new_kind = if ops[survivor].kind == absorbed_op.kind { ops[survivor].kind } else { OpKind::Img };

    let mut dest = ops[survivor].dest;
    dest.extend(&absorbed_op.dest);

    if new_kind == OpKind::Copy {
        if let (Some((source_layer, mut source_rect)), Some((_, absorbed_source))) =
            (ops[survivor].source, absorbed_op.source)
        {
            source_rect.extend(&absorbed_source);
            ops[survivor].source = Some((source_layer, source_rect));
        }
    } else if new_kind != OpKind::Rect {
        ops[survivor].source = None;
    }

    ops[survivor].dest = dest;
    ops[survivor].dirty_size += absorbed_op.dirty_size;
    ops[survivor].last_frame = ops[survivor].last_frame.max(absorbed_op.last_frame);
    ops[survivor].kind = new_kind;

    ops[absorbed].kind = OpKind::Nop;
}
