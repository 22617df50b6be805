//! Wall-clock milliseconds, the only notion of time this crate has an
//! opinion on. Everything downstream -- plan timestamps, `sync` frame
//! counts, lag compensation -- just consumes an opaque `u64` and never cares
//! what epoch it came from.

use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}
