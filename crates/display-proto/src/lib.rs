//! The wire instruction vocabulary the display engine emits, expressed as a
//! trait rather than a concrete socket writer. Transport (the actual
//! client connection, instruction framing, wire encoding) is explicitly
//! out of scope here -- this crate only describes what gets said, not how
//! it travels.

use std::fmt;

/// A layer or buffer index. Non-negative values name visible, stacked
/// layers (`0` is always the default layer); negative values name
/// off-screen buffers, which exist only as copy/paint sources and are
/// never composited directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct LayerId(pub i32);

impl LayerId {
    pub const DEFAULT: LayerId = LayerId(0);

    pub fn is_buffer(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pixel compositing operator, shared by `cfill` and `copy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeMode {
    /// Source over destination, respecting alpha.
    Over,
    /// Source replaces destination outside the source's own shape.
    Rout,
    /// Source replaces destination outright, ignoring alpha entirely. Used
    /// only for refreshing a layer's backing buffer, never for visible
    /// drawing.
    Src,
}

/// A multitouch/layer parameter name-value pair, as sent by `set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerParam {
    MultitouchCapable(bool),
}

/// An already-encoded image payload ready to paint over a rectangle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EncodedImage<'a> {
    Png(&'a [u8]),
    Jpeg { data: &'a [u8], quality: u8 },
    WebP { data: &'a [u8], quality: u8, lossless: bool },
}

/// Everything the display engine can say to a client.
///
/// Implementors own the actual transport; every method here corresponds to
/// exactly one wire instruction and is expected to be cheap and
/// non-blocking from the caller's point of view (buffering and flushing
/// are the implementor's concern, triggered explicitly by `flush`).
pub trait WireSink {
    type Error;

    fn send_size(&mut self, layer: LayerId, width: i32, height: i32) -> Result<(), Self::Error>;

    fn send_shade(&mut self, layer: LayerId, opacity: u8) -> Result<(), Self::Error>;

    fn send_move(
        &mut self,
        layer: LayerId,
        parent: LayerId,
        x: i32,
        y: i32,
        z: i32,
    ) -> Result<(), Self::Error>;

    fn send_set(&mut self, layer: LayerId, param: LayerParam) -> Result<(), Self::Error>;

    fn send_rect(&mut self, layer: LayerId, x: i32, y: i32, width: i32, height: i32) -> Result<(), Self::Error>;

    fn send_cfill(
        &mut self,
        layer: LayerId,
        mode: CompositeMode,
        r: u8,
        g: u8,
        b: u8,
        a: u8,
    ) -> Result<(), Self::Error>;

    #[allow(clippy::too_many_arguments)]
    fn send_copy(
        &mut self,
        src_layer: LayerId,
        sx: i32,
        sy: i32,
        width: i32,
        height: i32,
        mode: CompositeMode,
        dst_layer: LayerId,
        dx: i32,
        dy: i32,
    ) -> Result<(), Self::Error>;

    fn send_image(&mut self, layer: LayerId, x: i32, y: i32, image: EncodedImage<'_>) -> Result<(), Self::Error>;

    #[allow(clippy::too_many_arguments)]
    fn send_cursor(
        &mut self,
        hotspot_x: i32,
        hotspot_y: i32,
        src_layer: LayerId,
        sx: i32,
        sy: i32,
        width: i32,
        height: i32,
    ) -> Result<(), Self::Error>;

    fn send_mouse(&mut self, x: i32, y: i32, mask: u32, timestamp: u64) -> Result<(), Self::Error>;

    fn send_sync(&mut self, timestamp: u64, frame_count: u64) -> Result<(), Self::Error>;

    fn send_dispose(&mut self, layer: LayerId) -> Result<(), Self::Error>;

    /// Flushes any buffered instructions. A no-op for sinks that write
    /// synchronously.
    fn flush(&mut self) -> Result<(), Self::Error>;
}

/// A single recorded call to a [`WireSink`] method, owned rather than
/// borrowed so it can outlive the call that produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Size { layer: LayerId, width: i32, height: i32 },
    Shade { layer: LayerId, opacity: u8 },
    Move { layer: LayerId, parent: LayerId, x: i32, y: i32, z: i32 },
    Set { layer: LayerId, param: LayerParam },
    Rect { layer: LayerId, x: i32, y: i32, width: i32, height: i32 },
    Cfill { layer: LayerId, mode: CompositeMode, r: u8, g: u8, b: u8, a: u8 },
    Copy {
        src_layer: LayerId,
        sx: i32,
        sy: i32,
        width: i32,
        height: i32,
        mode: CompositeMode,
        dst_layer: LayerId,
        dx: i32,
        dy: i32,
    },
    Png { layer: LayerId, x: i32, y: i32, bytes: usize },
    Jpeg { layer: LayerId, x: i32, y: i32, bytes: usize, quality: u8 },
    WebP { layer: LayerId, x: i32, y: i32, bytes: usize, quality: u8, lossless: bool },
    Cursor { hotspot_x: i32, hotspot_y: i32, src_layer: LayerId, sx: i32, sy: i32, width: i32, height: i32 },
    Mouse { x: i32, y: i32, mask: u32, timestamp: u64 },
    Sync { timestamp: u64, frame_count: u64 },
    Dispose { layer: LayerId },
    Flush,
}

/// A [`WireSink`] that records every call in order instead of transmitting
/// it anywhere. Used by the other crates' tests to assert on emitted
/// instruction sequences without standing up a real client connection.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub instructions: Vec<Instruction>,
}

impl RecordingSink {
    pub fn new() -> RecordingSink {
        RecordingSink::default()
    }

    /// All recorded instructions except `Flush`, which is noise for most
    /// assertions about what got drawn.
    pub fn non_flush(&self) -> impl Iterator<Item = &Instruction> {
        self.instructions.iter().filter(|i| !matches!(i, Instruction::Flush))
    }
}

impl WireSink for RecordingSink {
    type Error = std::convert::Infallible;

    fn send_size(&mut self, layer: LayerId, width: i32, height: i32) -> Result<(), Self::Error> {
        self.instructions.push(Instruction::Size { layer, width, height });
        Ok(())
    }

    fn send_shade(&mut self, layer: LayerId, opacity: u8) -> Result<(), Self::Error> {
        self.instructions.push(Instruction::Shade { layer, opacity });
        Ok(())
    }

    fn send_move(&mut self, layer: LayerId, parent: LayerId, x: i32, y: i32, z: i32) -> Result<(), Self::Error> {
        self.instructions.push(Instruction::Move { layer, parent, x, y, z });
        Ok(())
    }

    fn send_set(&mut self, layer: LayerId, param: LayerParam) -> Result<(), Self::Error> {
        self.instructions.push(Instruction::Set { layer, param });
        Ok(())
    }

    fn send_rect(&mut self, layer: LayerId, x: i32, y: i32, width: i32, height: i32) -> Result<(), Self::Error> {
        self.instructions.push(Instruction::Rect { layer, x, y, width, height });
        Ok(())
    }

    fn send_cfill(
        &mut self,
        layer: LayerId,
        mode: CompositeMode,
        r: u8,
        g: u8,
        b: u8,
        a: u8,
    ) -> Result<(), Self::Error> {
        self.instructions.push(Instruction::Cfill { layer, mode, r, g, b, a });
        Ok(())
    }

    fn send_copy(
        &mut self,
        src_layer: LayerId,
        sx: i32,
        sy: i32,
        width: i32,
        height: i32,
        mode: CompositeMode,
        dst_layer: LayerId,
        dx: i32,
        dy: i32,
    ) -> Result<(), Self::Error> {
        self.instructions.push(Instruction::Copy { src_layer, sx, sy, width, height, mode, dst_layer, dx, dy });
        Ok(())
    }

    fn send_image(&mut self, layer: LayerId, x: i32, y: i32, image: EncodedImage<'_>) -> Result<(), Self::Error> {
        let instruction = match image {
            EncodedImage::Png(data) => Instruction::Png { layer, x, y, bytes: data.len() },
            EncodedImage::Jpeg { data, quality } => Instruction::Jpeg { layer, x, y, bytes: data.len(), quality },
            EncodedImage::WebP { data, quality, lossless } => {
                Instruction::WebP { layer, x, y, bytes: data.len(), quality, lossless }
            }
        };
        self.instructions.push(instruction);
        Ok(())
    }

    fn send_cursor(
        &mut self,
        hotspot_x: i32,
        hotspot_y: i32,
        src_layer: LayerId,
        sx: i32,
        sy: i32,
        width: i32,
        height: i32,
    ) -> Result<(), Self::Error> {
        self.instructions.push(Instruction::Cursor { hotspot_x, hotspot_y, src_layer, sx, sy, width, height });
        Ok(())
    }

    fn send_mouse(&mut self, x: i32, y: i32, mask: u32, timestamp: u64) -> Result<(), Self::Error> {
        self.instructions.push(Instruction::Mouse { x, y, mask, timestamp });
        Ok(())
    }

    fn send_sync(&mut self, timestamp: u64, frame_count: u64) -> Result<(), Self::Error> {
        self.instructions.push(Instruction::Sync { timestamp, frame_count });
        Ok(())
    }

    fn send_dispose(&mut self, layer: LayerId) -> Result<(), Self::Error> {
        self.instructions.push(Instruction::Dispose { layer });
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.instructions.push(Instruction::Flush);
        Ok(())
    }
}
