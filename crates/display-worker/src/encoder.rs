//! The codec boundary: image compression itself is explicitly out of scope
//! for this engine (it has no opinion on libpng/libjpeg-turbo/libwebp), so
//! encoding is expressed as a trait a caller supplies rather than a
//! concrete dependency.

/// Encodes a rect of 32bpp ARGB pixels into one of the three formats the
/// wire protocol understands. Implementations receive the raw buffer,
/// stride, and rect rather than an owned copy -- encoding is expected to
/// read directly out of a layer's committed frame.
pub trait ImageEncoder {
    type Error;

    fn encode_png(
        &mut self,
        pixels: &[u8],
        stride: usize,
        rect: display_core::Rect,
        opaque: bool,
    ) -> Result<Vec<u8>, Self::Error>;

    fn encode_jpeg(
        &mut self,
        pixels: &[u8],
        stride: usize,
        rect: display_core::Rect,
        quality: u8,
    ) -> Result<Vec<u8>, Self::Error>;

    #[allow(clippy::too_many_arguments)]
    fn encode_webp(
        &mut self,
        pixels: &[u8],
        stride: usize,
        rect: display_core::Rect,
        quality: u8,
        lossless: bool,
        opaque: bool,
    ) -> Result<Vec<u8>, Self::Error>;
}
