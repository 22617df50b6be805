//! Primitives shared by every other crate in the display engine: rectangle
//! algebra, checked arithmetic, and the two hand-rolled synchronisation
//! types (`Flag`, `Rwlock`) the rest of the engine's locking discipline is
//! built from.

pub mod fifo;
pub mod flag;
pub mod mem;
pub mod rect;
pub mod rwlock;

pub use fifo::{Fifo, FifoError, FifoGuard};
pub use flag::{Flag, FlagGuard};
pub use mem::{ckd_add, ckd_add_or_die, ckd_mul, ckd_mul_or_die, ckd_sub, ckd_sub_or_die, CheckedArithError};
pub use rect::Rect;
pub use rwlock::{RwCell, RwCellReadGuard, RwCellWriteGuard, Rwlock, RwlockReadGuard, RwlockWriteGuard};
