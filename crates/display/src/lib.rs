//! The display facade: wires the layer arena, frame planner/committer,
//! worker pool, and render thread from `display-render`/`display-worker`
//! into the one type a back-end actually holds.
//!
//! Everything downstream of here has no notion of a user or a multi-viewer
//! session -- that's `users`' job, layered on top as a `WireSink` that fans
//! every instruction out to whoever is currently joined.

pub mod clock;
pub mod cursor;
mod facade;
pub mod plan_apply;
pub mod users;

pub use display_render::DisplayError;
pub use facade::{Display, DisplayLayer};
pub use users::UserId;
