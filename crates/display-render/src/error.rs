//! The handful of recoverable error paths this crate exposes. Everything
//! else -- a cell-count mismatch, a layer handle that doesn't resolve -- is
//! an invariant violation a caller cannot have triggered without a bug of
//! its own, and stays a `panic!`/`assert!` rather than a `Result`, matching
//! `GUAC_ASSERT`'s "this aborts, and that's deliberate" stance.

use thiserror::Error;

/// The largest width or height a layer may be resized to.
pub const MAX_DIMENSION: i32 = 8192;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DisplayError {
    #[error("requested layer dimensions {width}x{height} exceed the {max}x{max} maximum")]
    LayerBoundsExceeded { width: i32, height: i32, max: i32 },

    #[error("buffer is not external")]
    BufferNotExternal,

    #[error("invariant violation: {message}")]
    InvariantViolation { message: String },
}

/// Rejects dimensions that would exceed [`MAX_DIMENSION`] before any
/// allocation is attempted -- the one allocation-failure-shaped error this
/// engine can still usefully report, since an actual `Vec` allocation
/// failure aborts the process via the global allocator rather than
/// unwinding.
pub fn validate_dimensions(width: i32, height: i32) -> Result<(), DisplayError> {
    if width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(DisplayError::LayerBoundsExceeded { width, height, max: MAX_DIMENSION });
    }
    Ok(())
}
