//! Heuristics for picking an encoding (PNG, JPEG, or WebP) for an `Img` op,
//! and for the lossy quality level to ask for when one of the lossy formats
//! is chosen. None of this touches an actual codec -- encoding itself is the
//! caller-supplied [`crate::ImageEncoder`]'s job; this module only decides
//! which of its methods to call.

use display_core::Rect;

/// Minimum update frequency, in updates/second, below which lossy formats
/// are not considered worth their quality cost.
pub const JPEG_FRAMERATE: i64 = 3;
/// Rects smaller than this many pixels are cheap enough as PNG that JPEG's
/// quality loss isn't worth it.
pub const JPEG_MIN_BITMAP_SIZE: i32 = 4096;
pub const JPEG_BLOCK_SIZE_EXPONENT: u32 = 4;
pub const WEBP_BLOCK_SIZE_EXPONENT: u32 = 3;

const MIN_QUALITY: u8 = 30;
const MAX_QUALITY: u8 = 90;

/// Rough measure of how well `rect` would compress under PNG's lossless
/// DEFLATE: counts adjacent same-vs-different pixel pairs (alpha forced
/// opaque, matching the original's assumption that it's comparing visually
/// rather than byte-exactly). Positive favours PNG, negative favours a lossy
/// format.
pub fn png_optimality(pixels: &[u8], stride: usize, rect: Rect) -> i32 {
    if rect.width() < 1 || rect.height() < 1 {
        return 0;
    }

    let mut num_same: i64 = 0;
    let mut num_different: i64 = 1;

    for y in rect.top..rect.bottom {
        let row_offset = y as usize * stride + rect.left as usize * 4;
        let row_end = row_offset + rect.width() as usize * 4;
        if row_end > pixels.len() {
            break;
        }
        let row = &pixels[row_offset..row_end];

        let mut last = opaque_pixel(row, 0);
        for x in 1..rect.width() as usize {
            let current = opaque_pixel(row, x * 4);
            if current == last {
                num_same += 1;
            } else {
                num_different += 1;
            }
            last = current;
        }
    }

    (0x100 * num_same / num_different - 0x400) as i32
}

fn opaque_pixel(row: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes([row[offset], row[offset + 1], row[offset + 2], 0xFF])
}

/// Whether `rect` should be sent as JPEG rather than PNG: never for
/// lossless layers, and only when updates are frequent, the area is large
/// enough to be worth the encode, and PNG doesn't already look optimal.
pub fn should_use_jpeg(lossless: bool, framerate: i64, rect: Rect, optimality: i32) -> bool {
    if lossless {
        return false;
    }
    let rect_size = rect.width() as i64 * rect.height() as i64;
    framerate >= JPEG_FRAMERATE && rect_size > JPEG_MIN_BITMAP_SIZE as i64 && optimality < 0
}

/// Whether `rect` should be sent as WebP rather than PNG. Unlike JPEG, WebP
/// is still considered for small rects and can itself be lossless, so no
/// size or lossless gate applies here -- only client support, gated on
/// *either* frequent updates or PNG already looking like a poor fit (an OR,
/// unlike JPEG's stricter AND of every condition).
pub fn should_use_webp(client_supports_webp: bool, framerate: i64, optimality: i32) -> bool {
    client_supports_webp && (framerate >= JPEG_FRAMERATE || optimality < 0)
}

/// Scales quality linearly from 90 (lag <= 20ms) to 30 (lag >= 80ms).
pub fn suggest_quality(processing_lag_ms: i64) -> u8 {
    let quality = 90 - (processing_lag_ms - 20);
    quality.clamp(MIN_QUALITY as i64, MAX_QUALITY as i64) as u8
}

/// Expands `rect` to the nearest enclosing multiple of the format's block
/// size, then clips back to the layer's actual bounds -- lossy encoders
/// compress in fixed-size blocks, so encoding on a block-aligned boundary
/// avoids artifacts bleeding in from outside the dirty region.
pub fn align_to_block(rect: Rect, exponent: u32, bounds: Rect) -> Rect {
    let mut aligned = rect;
    aligned.align(exponent);
    aligned.constrain(&bounds);
    aligned
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_buffer(width: i32, height: i32, color: [u8; 4]) -> (Vec<u8>, usize) {
        let stride = width as usize * 4;
        let mut buffer = vec![0u8; stride * height as usize];
        for px in buffer.chunks_exact_mut(4) {
            px.copy_from_slice(&color);
        }
        (buffer, stride)
    }

    #[test]
    fn solid_colour_is_maximally_png_optimal() {
        let (buffer, stride) = solid_buffer(64, 64, [10, 20, 30, 255]);
        let score = png_optimality(&buffer, stride, Rect::init(0, 0, 64, 64));
        // Every adjacent pair matches and num_different never leaves its
        // initial value of 1, so the score is as high as this rect can get.
        assert_eq!(score, 0x100 * 63 * 64 - 0x400);
    }

    #[test]
    fn noisy_content_is_png_negative() {
        let stride = 64 * 4;
        let mut buffer = vec![0u8; stride * 64];
        for (i, px) in buffer.chunks_exact_mut(4).enumerate() {
            let v = (i * 37 % 251) as u8;
            px.copy_from_slice(&[v, v.wrapping_add(1), v.wrapping_add(2), 255]);
        }
        let score = png_optimality(&buffer, stride, Rect::init(0, 0, 64, 64));
        assert!(score < 0);
    }

    #[test]
    fn jpeg_is_rejected_for_lossless_layers() {
        assert!(!should_use_jpeg(true, 30, Rect::init(0, 0, 128, 128), -100));
    }

    #[test]
    fn jpeg_is_rejected_for_small_or_rare_updates() {
        assert!(!should_use_jpeg(false, 1, Rect::init(0, 0, 128, 128), -100));
        assert!(!should_use_jpeg(false, 30, Rect::init(0, 0, 8, 8), -100));
    }

    #[test]
    fn jpeg_is_accepted_when_all_conditions_hold() {
        assert!(should_use_jpeg(false, 30, Rect::init(0, 0, 128, 128), -100));
    }

    #[test]
    fn webp_is_accepted_on_either_frequent_updates_or_poor_png_fit() {
        assert!(!should_use_webp(false, 30, -100), "no client support, never accepted");
        assert!(should_use_webp(true, 30, 100), "frequent updates alone suffice");
        assert!(should_use_webp(true, 0, -100), "poor PNG fit alone suffices");
        assert!(!should_use_webp(true, 0, 100), "neither condition holds");
    }

    #[test]
    fn quality_clamps_to_the_documented_range() {
        assert_eq!(suggest_quality(0), 90);
        assert_eq!(suggest_quality(20), 90);
        assert_eq!(suggest_quality(50), 60);
        assert_eq!(suggest_quality(200), 30);
    }

    #[test]
    fn block_alignment_clips_to_layer_bounds() {
        let bounds = Rect::init(0, 0, 100, 100);
        let aligned = align_to_block(Rect::init(90, 90, 10, 10), JPEG_BLOCK_SIZE_EXPONENT, bounds);
        assert_eq!(aligned, Rect::init(80, 80, 20, 20));
    }
}
