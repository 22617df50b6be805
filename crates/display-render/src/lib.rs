//! Per-layer frame state, the dirty-tracking cell grid, the frame planner,
//! frame commit, and the render thread's frame-boundary heuristic.
//!
//! This crate has no notion of a client connection, a worker pool, or a
//! socket -- it operates purely on [`LayerArena`] plus a caller-supplied
//! [`display_proto::WireSink`] for the handful of instructions a commit
//! sends synchronously. Image encoding and dispatch to the worker pool are
//! the `display-worker` crate's concern; wiring a running display together
//! is `display`'s.

pub mod cell;
pub mod commit;
pub mod context;
pub mod error;
pub mod layer;
pub mod plan;
pub mod render_thread;

pub use cell::{Cell, CellGrid};
pub use commit::{cursor_layer_touched, frame_complete, CursorState as CommitCursorState};
pub use context::{close_raw, close_vector, open_raw, open_vector, RawContext, VectorContext};
pub use error::{validate_dimensions, DisplayError};
pub use layer::{Layer, LayerArena, LayerFrameState, LayerHandle, LayerPixels, LastArena, LastEntry};
pub use plan::{create as create_plan, OpKind, Plan, PlanOperation};
pub use render_thread::{run as run_render_thread, CursorState as RenderCursorState, RenderThread};
